//! Device memory seam
//!
//! Kernel launch and random-number services live outside this crate; the
//! only device capability the buffer layer needs is allocation. `Device`
//! is that seam, and [`HostDevice`] is the host-memory reference
//! implementation, with an optional byte budget so allocation failure and
//! rollback paths are exercisable.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, RuntimeError};

/// Opaque allocation service for population buffers.
pub trait Device: fmt::Debug + Send + Sync {
    /// Allocate a zeroed array of `bytes` bytes.
    fn alloc(&self, bytes: usize) -> Result<DeviceAlloc>;

    /// Return `bytes` to the device's budget after an array is freed.
    fn release(&self, bytes: usize);
}

/// One device-owned flat byte array.
///
/// Backed by 8-byte words so every element type in the schema can be
/// viewed through an aligned typed slice.
#[derive(Debug)]
pub struct DeviceAlloc {
    words: Box<[u64]>,
    len: usize,
}

impl DeviceAlloc {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(8)].into_boxed_slice(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    pub fn zero(&mut self) {
        self.words.fill(0);
    }
}

/// Host-memory device with an optional byte budget.
#[derive(Debug, Default)]
pub struct HostDevice {
    budget: Option<usize>,
    allocated: AtomicUsize,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that refuses allocations once `bytes` are outstanding.
    pub fn with_budget(bytes: usize) -> Self {
        Self {
            budget: Some(bytes),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Bytes currently outstanding.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }
}

impl Device for HostDevice {
    fn alloc(&self, bytes: usize) -> Result<DeviceAlloc> {
        let prev = self.allocated.fetch_add(bytes, Ordering::SeqCst);
        if let Some(budget) = self.budget
            && prev + bytes > budget
        {
            self.allocated.fetch_sub(bytes, Ordering::SeqCst);
            return Err(RuntimeError::OutOfDeviceMemory { requested: bytes });
        }
        Ok(DeviceAlloc::new(bytes))
    }

    fn release(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::SeqCst);
    }
}
