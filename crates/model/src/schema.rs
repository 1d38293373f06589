//! Variable schemas
//!
//! A schema is the name → (element type, array length) layout of one
//! population's variables. Once a buffer set has been allocated from a
//! schema the layout is frozen for the lifetime of those buffers.

use std::fmt;

use indexmap::IndexMap;

use crate::error::{ModelError, Result};

/// Closed set of element types a variable can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    F32,
    F64,
    I32,
    U32,
    I64,
    U64,
    U8,
}

impl ElemType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            ElemType::F32 | ElemType::I32 | ElemType::U32 => 4,
            ElemType::F64 | ElemType::I64 | ElemType::U64 => 8,
            ElemType::U8 => 1,
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElemType::F32 => "f32",
            ElemType::F64 => "f64",
            ElemType::I32 => "i32",
            ElemType::U32 => "u32",
            ElemType::I64 => "i64",
            ElemType::U64 => "u64",
            ElemType::U8 => "u8",
        };
        write!(f, "{name}")
    }
}

/// One declared variable: element type plus fixed array length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variable {
    pub elem: ElemType,
    pub array_len: usize,
}

impl Variable {
    /// Bytes this variable occupies per entity.
    pub const fn size(&self) -> usize {
        self.elem.size() * self.array_len
    }
}

/// Ordered mapping from variable name to its declared layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableSchema {
    vars: IndexMap<String, Variable>,
    frozen: bool,
}

impl VariableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a scalar variable.
    pub fn add_variable(&mut self, name: &str, elem: ElemType) -> Result<()> {
        self.add_variable_array(name, elem, 1)
    }

    /// Declare a fixed-length array variable.
    pub fn add_variable_array(&mut self, name: &str, elem: ElemType, array_len: usize) -> Result<()> {
        if self.frozen {
            return Err(ModelError::SchemaFrozen(name.to_string()));
        }
        if self.vars.contains_key(name) {
            return Err(ModelError::DuplicateName(name.to_string()));
        }
        self.vars
            .insert(name.to_string(), Variable { elem, array_len });
        Ok(())
    }

    pub fn variable(&self, name: &str) -> Result<&Variable> {
        self.vars
            .get(name)
            .ok_or_else(|| ModelError::UnknownVariable(name.to_string()))
    }

    /// Bytes per entity for one variable.
    pub fn size_of(&self, name: &str) -> Result<usize> {
        self.variable(name).map(Variable::size)
    }

    pub fn elem_of(&self, name: &str) -> Result<ElemType> {
        self.variable(name).map(|v| v.elem)
    }

    pub fn total_variable_count(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Bytes one entity occupies across all variables.
    pub fn entry_size(&self) -> usize {
        self.vars.values().map(Variable::size).sum()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variable)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Freeze the layout. Called when a buffer set is allocated from this
    /// schema; later `add_variable` calls fail with `SchemaFrozen`.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}
