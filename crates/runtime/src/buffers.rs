//! Population state buffers
//!
//! One `StateBuffers` owns the three buffer roles backing a single
//! population (an agent state, or a message type): *active* is the frozen
//! snapshot consumers read, *swap* receives full rewrites, *pending*
//! accumulates appended entries. All three share one schema and one
//! capacity and are allocated and freed as a unit.
//!
//! Rotation never copies data: the three allocations sit in fixed physical
//! slots and a role → slot indirection is what `rotate` and `swap_active`
//! exchange. Pointers and slices handed out for a role are valid only
//! until the next rotation or release.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, error, trace};

use murmur_model::VariableSchema;

use crate::device::{Device, DeviceAlloc};
use crate::error::{Result, RuntimeError};

/// The three buffer roles of one population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Snapshot read by the current layer's consumers.
    Active,
    /// Write target for full population rewrites.
    Swap,
    /// Append target for entries created mid-step.
    Pending,
}

impl BufferRole {
    pub const ALL: [BufferRole; 3] = [BufferRole::Active, BufferRole::Swap, BufferRole::Pending];
}

/// One physical slot: a full set of per-variable arrays.
#[derive(Debug)]
struct RoleSlot {
    vars: IndexMap<String, DeviceAlloc>,
}

/// Triple-role buffer set for one population.
#[derive(Debug)]
pub struct StateBuffers {
    device: Arc<dyn Device>,
    schema: VariableSchema,
    capacity: usize,
    slots: Option<[RoleSlot; 3]>,
    /// role → physical slot; rotation swaps entries here, never data.
    role_slot: [usize; 3],
    /// Entry count per role.
    counts: [usize; 3],
}

impl StateBuffers {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            schema: VariableSchema::new(),
            capacity: 0,
            slots: None,
            role_slot: [0, 1, 2],
            counts: [0; 3],
        }
    }

    /// Allocate all three roles for `schema` at `capacity` entries.
    ///
    /// All-or-nothing: if any variable array fails to allocate, every
    /// array already obtained by this call is released before the error
    /// is returned. A prior allocation on this instance is released first.
    pub fn allocate(&mut self, schema: &VariableSchema, capacity: usize) -> Result<()> {
        self.release();

        let mut done: Vec<RoleSlot> = Vec::with_capacity(3);
        for _ in 0..3 {
            let mut vars = IndexMap::new();
            for (name, var) in schema.iter() {
                let bytes = var.size() * capacity;
                match self.device.alloc(bytes) {
                    Ok(alloc) => {
                        vars.insert(name.to_string(), alloc);
                    }
                    Err(e) => {
                        error!(variable = name, bytes, "device allocation failed, rolling back");
                        for alloc in vars.values() {
                            self.device.release(alloc.len());
                        }
                        for slot in &done {
                            for alloc in slot.vars.values() {
                                self.device.release(alloc.len());
                            }
                        }
                        return Err(e);
                    }
                }
            }
            done.push(RoleSlot { vars });
        }

        let slots: [RoleSlot; 3] = done
            .try_into()
            .unwrap_or_else(|_| unreachable!("exactly three role slots were built"));
        self.schema = schema.clone();
        self.capacity = capacity;
        self.slots = Some(slots);
        self.role_slot = [0, 1, 2];
        self.counts = [0; 3];
        debug!(
            capacity,
            variables = self.schema.total_variable_count(),
            "state buffers allocated"
        );
        Ok(())
    }

    pub fn is_allocated(&self) -> bool {
        self.slots.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn schema(&self) -> &VariableSchema {
        &self.schema
    }

    /// Entry count of a role.
    pub fn count(&self, role: BufferRole) -> usize {
        self.counts[role as usize]
    }

    /// Set the entry count of a role; fails if it exceeds capacity.
    pub fn set_count(&mut self, role: BufferRole, count: usize) -> Result<()> {
        if count > self.capacity {
            return Err(RuntimeError::PopulationOverflow {
                capacity: self.capacity,
                needed: count,
            });
        }
        self.counts[role as usize] = count;
        Ok(())
    }

    /// Raw bytes of one variable's array in one role, full capacity.
    pub fn variable(&self, role: BufferRole, name: &str) -> Result<&[u8]> {
        let slot = self.slot(role)?;
        slot.vars
            .get(name)
            .map(DeviceAlloc::as_slice)
            .ok_or_else(|| RuntimeError::UnknownVariable(name.to_string()))
    }

    pub fn variable_mut(&mut self, role: BufferRole, name: &str) -> Result<&mut [u8]> {
        let idx = self.role_slot[role as usize];
        let slots = self.slots.as_mut().ok_or(RuntimeError::Unallocated)?;
        slots[idx]
            .vars
            .get_mut(name)
            .map(DeviceAlloc::as_mut_slice)
            .ok_or_else(|| RuntimeError::UnknownVariable(name.to_string()))
    }

    /// Typed view over one variable's array (`capacity * array_len`
    /// elements).
    pub fn variable_as<T: bytemuck::Pod>(&self, role: BufferRole, name: &str) -> Result<&[T]> {
        let elem = self
            .schema
            .elem_of(name)
            .map_err(|_| RuntimeError::UnknownVariable(name.to_string()))?;
        if elem.size() != std::mem::size_of::<T>() {
            return Err(RuntimeError::VariableType {
                variable: name.to_string(),
                expected: elem.size(),
                actual: std::mem::size_of::<T>(),
            });
        }
        Ok(bytemuck::cast_slice(self.variable(role, name)?))
    }

    pub fn variable_as_mut<T: bytemuck::Pod>(
        &mut self,
        role: BufferRole,
        name: &str,
    ) -> Result<&mut [T]> {
        let elem = self
            .schema
            .elem_of(name)
            .map_err(|_| RuntimeError::UnknownVariable(name.to_string()))?;
        if elem.size() != std::mem::size_of::<T>() {
            return Err(RuntimeError::VariableType {
                variable: name.to_string(),
                expected: elem.size(),
                actual: std::mem::size_of::<T>(),
            });
        }
        Ok(bytemuck::cast_slice_mut(self.variable_mut(role, name)?))
    }

    /// Zero every variable array of one role.
    pub fn zero(&mut self, role: BufferRole) -> Result<()> {
        let idx = self.role_slot[role as usize];
        let slots = self.slots.as_mut().ok_or(RuntimeError::Unallocated)?;
        for alloc in slots[idx].vars.values_mut() {
            alloc.zero();
        }
        Ok(())
    }

    /// Zero all three roles.
    pub fn zero_all(&mut self) -> Result<()> {
        for role in BufferRole::ALL {
            self.zero(role)?;
        }
        Ok(())
    }

    /// Promote *pending* to *active*: a role-label swap carrying pending's
    /// entry count. The previous active becomes the new, empty pending.
    pub fn rotate(&mut self) {
        self.role_slot
            .swap(BufferRole::Active as usize, BufferRole::Pending as usize);
        self.counts[BufferRole::Active as usize] = self.counts[BufferRole::Pending as usize];
        self.counts[BufferRole::Pending as usize] = 0;
        trace!(active = self.count(BufferRole::Active), "buffers rotated");
    }

    /// Exchange *active* and *swap*: the rewrite-in-place rotation.
    pub fn swap_active(&mut self) {
        self.role_slot
            .swap(BufferRole::Active as usize, BufferRole::Swap as usize);
        self.counts
            .swap(BufferRole::Active as usize, BufferRole::Swap as usize);
        trace!(active = self.count(BufferRole::Active), "active/swap exchanged");
    }

    /// Append-merge *pending* entries after the current *active* residents
    /// and reset pending. Used where active entries must survive the
    /// commit (agent birth, state transitions into a populated state).
    pub fn commit_pending(&mut self) -> Result<()> {
        let pending = self.count(BufferRole::Pending);
        if pending == 0 {
            return Ok(());
        }
        let active = self.count(BufferRole::Active);
        if active + pending > self.capacity {
            return Err(RuntimeError::PopulationOverflow {
                capacity: self.capacity,
                needed: active + pending,
            });
        }
        let names: Vec<String> = self.schema.names().map(str::to_string).collect();
        for name in names {
            let size = self.schema.size_of(&name).map_err(RuntimeError::from)?;
            let src = self.variable(BufferRole::Pending, &name)?[..pending * size].to_vec();
            let dst = self.variable_mut(BufferRole::Active, &name)?;
            dst[active * size..(active + pending) * size].copy_from_slice(&src);
        }
        self.counts[BufferRole::Active as usize] = active + pending;
        self.counts[BufferRole::Pending as usize] = 0;
        trace!(active = active + pending, appended = pending, "pending committed");
        Ok(())
    }

    /// Drop any staged pending entries without touching active or swap.
    pub fn clear_pending(&mut self) {
        self.counts[BufferRole::Pending as usize] = 0;
    }

    /// Free all three roles. Idempotent; safe on a never-allocated
    /// instance.
    pub fn release(&mut self) {
        if let Some(slots) = self.slots.take() {
            for slot in &slots {
                for alloc in slot.vars.values() {
                    self.device.release(alloc.len());
                }
            }
            debug!("state buffers released");
        }
        self.counts = [0; 3];
        self.role_slot = [0, 1, 2];
    }

    fn slot(&self, role: BufferRole) -> Result<&RoleSlot> {
        let slots = self.slots.as_ref().ok_or(RuntimeError::Unallocated)?;
        Ok(&slots[self.role_slot[role as usize]])
    }
}

impl Drop for StateBuffers {
    fn drop(&mut self) {
        self.release();
    }
}
