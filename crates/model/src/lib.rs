//! Murmur model description
//!
//! A model is a graph of agent types, message types and execution layers.
//! Every mutating call validates eagerly, so a graph that exists is always
//! safe to schedule.

pub mod error;
pub mod model;
pub mod schema;
mod validate;

pub use error::{ModelError, Result};
pub use model::{
    AgentFunction, AgentRef, AgentType, FunctionRef, Layer, LayerIndex, MessageKind, MessageRef,
    MessageType, ModelGraph, ModelId,
};
pub use schema::{ElemType, Variable, VariableSchema};

/// State every agent type starts with.
pub const DEFAULT_STATE: &str = "default";
