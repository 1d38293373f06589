//! Runtime errors

use thiserror::Error;

use murmur_model::ModelError;

/// Runtime result type
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised while allocating buffers or executing a run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("out of device memory: allocation of {requested} bytes refused")]
    OutOfDeviceMemory { requested: usize },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("variable '{variable}' holds {expected} bytes per entity, accessed as {actual}")]
    VariableType {
        variable: String,
        expected: usize,
        actual: usize,
    },

    #[error("buffers have not been allocated")]
    Unallocated,

    #[error("population data does not match the schema of '{population}'")]
    SchemaMismatch { population: String },

    #[error("population overflow: {needed} entries exceed capacity {capacity}")]
    PopulationOverflow { capacity: usize, needed: usize },

    #[error("unknown population '{agent}.{state}'")]
    UnknownPopulation { agent: String, state: String },

    #[error("unknown agent function '{agent}.{function}'")]
    UnknownFunction { agent: String, function: String },

    #[error("unknown message '{0}'")]
    UnknownMessage(String),

    #[error("run plan requests unbounded steps but no exit condition is registered")]
    UnboundedRun,

    #[error("device execution failed at step {step}, layer {layer}: {message}")]
    DeviceExecutionError {
        step: u64,
        layer: usize,
        message: String,
    },

    #[error(transparent)]
    Model(#[from] ModelError),
}
