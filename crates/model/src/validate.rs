//! Graph validation
//!
//! Structural invariants enforced at mutation time. Each helper checks one
//! rule and returns the taxonomy error naming the offending parts; the
//! setters in [`crate::model`] call these before touching any state, so a
//! failing call never partially applies.

use indexmap::IndexMap;

use crate::error::{ModelError, Result};
use crate::model::{AgentType, Layer, MessageKind, ModelId};

/// Rule 5: a handle must come from this model graph instance.
pub(crate) fn ensure_model(model: ModelId, other: ModelId, name: &str) -> Result<()> {
    if model != other {
        return Err(ModelError::DifferentModel {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Rule 1: a transition state must be declared on the owning agent.
pub(crate) fn ensure_state(agent: &AgentType, state: &str) -> Result<()> {
    if !agent.has_state(state) {
        return Err(ModelError::InvalidStateName {
            agent: agent.name().to_string(),
            state: state.to_string(),
        });
    }
    Ok(())
}

/// Rule 4: a bound message's kind must match the function's declared
/// expectation.
pub(crate) fn ensure_kind(
    expected: MessageKind,
    actual: MessageKind,
    function: &str,
    message: &str,
) -> Result<()> {
    if expected != actual {
        return Err(ModelError::InvalidMessageType {
            function: function.to_string(),
            message: message.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Rule 2, at state-assignment time: within every layer already containing
/// `function`, no other function of the same agent type may claim `state`
/// as its initial or end state.
pub(crate) fn ensure_layer_state_free(
    layers: &[Layer],
    agents: &IndexMap<String, AgentType>,
    agent: &str,
    function: &str,
    state: &str,
) -> Result<()> {
    for layer in layers {
        if !layer.contains(agent, function) {
            continue;
        }
        for (other_agent, other_fn) in layer.functions() {
            if other_agent != agent || other_fn == function {
                continue;
            }
            if let Some(other) = agents.get(agent).and_then(|a| a.function(other_fn))
                && (other.initial_state() == state || other.end_state() == state)
            {
                return Err(ModelError::InvalidAgentFunction {
                    agent: agent.to_string(),
                    function: function.to_string(),
                    other: other_fn.to_string(),
                    state: state.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Rule 2, at scheduling time: a function entering a layer may not overlap
/// initial/end states with a same-agent function already there.
pub(crate) fn ensure_disjoint_in_layer(
    layer: &Layer,
    agents: &IndexMap<String, AgentType>,
    agent: &str,
    function: &str,
    initial: &str,
    end: &str,
) -> Result<()> {
    for (other_agent, other_fn) in layer.functions() {
        if other_agent != agent || other_fn == function {
            continue;
        }
        let Some(other) = agents.get(agent).and_then(|a| a.function(other_fn)) else {
            continue;
        };
        for state in [initial, end] {
            if other.initial_state() == state || other.end_state() == state {
                return Err(ModelError::InvalidAgentFunction {
                    agent: agent.to_string(),
                    function: function.to_string(),
                    other: other_fn.to_string(),
                    state: state.to_string(),
                });
            }
        }
    }
    Ok(())
}
