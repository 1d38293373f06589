//! Host-side population staging
//!
//! A `PopulationBatch` is the host's row-oriented view of agent data,
//! used to seed a simulation and to read results back. It is schema-checked
//! column storage; it never touches the device.

use bytemuck::Pod;
use indexmap::IndexMap;

use murmur_model::VariableSchema;

use crate::error::{Result, RuntimeError};

/// In-memory batch of `count` entities laid out per the schema.
#[derive(Debug, Clone)]
pub struct PopulationBatch {
    schema: VariableSchema,
    count: usize,
    columns: IndexMap<String, Vec<u8>>,
}

impl PopulationBatch {
    /// A zero-initialized batch of `count` entities.
    pub fn new(schema: &VariableSchema, count: usize) -> Self {
        let columns = schema
            .iter()
            .map(|(name, var)| (name.to_string(), vec![0u8; var.size() * count]))
            .collect();
        Self {
            schema: schema.clone(),
            count,
            columns,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn schema(&self) -> &VariableSchema {
        &self.schema
    }

    /// Read one scalar variable of one entity.
    pub fn get<T: Pod>(&self, index: usize, variable: &str) -> Result<T> {
        let size = self.checked_size::<T>(variable)?;
        let column = self.column(variable)?;
        Ok(bytemuck::pod_read_unaligned(
            &column[index * size..(index + 1) * size],
        ))
    }

    /// Write one scalar variable of one entity.
    pub fn set<T: Pod>(&mut self, index: usize, variable: &str, value: T) -> Result<()> {
        let size = self.checked_size::<T>(variable)?;
        let column = self.column_mut(variable)?;
        column[index * size..(index + 1) * size].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    pub(crate) fn column(&self, variable: &str) -> Result<&[u8]> {
        self.columns
            .get(variable)
            .map(Vec::as_slice)
            .ok_or_else(|| RuntimeError::UnknownVariable(variable.to_string()))
    }

    pub(crate) fn column_mut(&mut self, variable: &str) -> Result<&mut [u8]> {
        self.columns
            .get_mut(variable)
            .map(Vec::as_mut_slice)
            .ok_or_else(|| RuntimeError::UnknownVariable(variable.to_string()))
    }

    fn checked_size<T: Pod>(&self, variable: &str) -> Result<usize> {
        let size = self
            .schema
            .size_of(variable)
            .map_err(|_| RuntimeError::UnknownVariable(variable.to_string()))?;
        if size != std::mem::size_of::<T>() {
            return Err(RuntimeError::VariableType {
                variable: variable.to_string(),
                expected: size,
                actual: std::mem::size_of::<T>(),
            });
        }
        Ok(size)
    }
}
