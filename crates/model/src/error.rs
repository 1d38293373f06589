//! Model construction errors

use thiserror::Error;

use crate::model::MessageKind;

/// Model result type
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while describing a model.
///
/// Every variant names the offending agent/message/state so a failing
/// construction call can be diagnosed without replaying it. A failing call
/// never partially applies.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("agent '{agent}' does not declare state '{state}'")]
    InvalidStateName { agent: String, state: String },

    #[error(
        "agent functions '{function}' and '{other}' of agent '{agent}' share state '{state}' \
         within one layer; functions of the same agent in a layer may not overlap \
         initial or end states"
    )]
    InvalidAgentFunction {
        agent: String,
        function: String,
        other: String,
        state: String,
    },

    #[error(
        "message '{message}' is already bound as {bound_as} of function '{function}'; \
         a function cannot input and output the same message"
    )]
    InvalidMessageName {
        function: String,
        message: String,
        bound_as: &'static str,
    },

    #[error("message '{message}' has kind {actual} but function '{function}' expects {expected}")]
    InvalidMessageType {
        function: String,
        message: String,
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("'{name}' belongs to a different model graph")]
    DifferentModel { name: String },

    #[error("no agent, message or function named '{0}' is declared")]
    UnknownName(String),

    #[error("duplicate name '{0}'")]
    DuplicateName(String),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("schema of '{0}' is frozen; variables cannot be added once buffers are allocated")]
    SchemaFrozen(String),
}
