//! Model graph
//!
//! Owns every agent type, message type and layer of one model. All
//! cross-references (function → message, function → output agent) are
//! plain names resolved through the graph, never independent lifetimes.
//! Mutating calls validate before they apply; see [`crate::validate`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use tracing::debug;

use crate::DEFAULT_STATE;
use crate::error::{ModelError, Result};
use crate::schema::{ElemType, VariableSchema};
use crate::validate;

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of one model graph instance.
///
/// Refs carry this id so that handles from one graph cannot be applied to
/// another (`DifferentModel`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelId(u64);

impl ModelId {
    fn next() -> Self {
        Self(NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Closed set of message delivery kinds.
///
/// Only the generic buffered contract is defined here; `Spatial2d` exists
/// as a discriminant so a binding can be checked against the kind a
/// function statically expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    BruteForce,
    Spatial2d,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::BruteForce => write!(f, "brute-force"),
            MessageKind::Spatial2d => write!(f, "spatial-2d"),
        }
    }
}

/// Non-owning handle to an agent type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRef {
    pub(crate) model: ModelId,
    pub(crate) name: String,
}

impl AgentRef {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Non-owning handle to a message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub(crate) model: ModelId,
    pub(crate) name: String,
}

impl MessageRef {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Non-owning handle to an agent function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    pub(crate) model: ModelId,
    pub(crate) agent: String,
    pub(crate) function: String,
}

impl FunctionRef {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn name(&self) -> &str {
        &self.function
    }
}

/// Index of a layer within its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerIndex {
    pub(crate) model: ModelId,
    pub(crate) index: usize,
}

impl LayerIndex {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// One declared agent type: states, variables and per-step functions.
#[derive(Debug, Clone)]
pub struct AgentType {
    name: String,
    states: Vec<String>,
    schema: VariableSchema,
    functions: IndexMap<String, AgentFunction>,
    /// Number of functions currently outputting new agents into this type.
    consumers: usize,
}

impl AgentType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(String::as_str)
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    pub fn schema(&self) -> &VariableSchema {
        &self.schema
    }

    pub fn function(&self, name: &str) -> Option<&AgentFunction> {
        self.functions.get(name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &AgentFunction> {
        self.functions.values()
    }

    pub fn consumers(&self) -> usize {
        self.consumers
    }
}

/// One unit of per-step behavior, bound to a single state transition.
#[derive(Debug, Clone)]
pub struct AgentFunction {
    name: String,
    initial_state: String,
    end_state: String,
    message_input: Option<String>,
    message_output: Option<String>,
    message_output_optional: bool,
    /// Target (agent type, state) for agents this function creates.
    agent_output: Option<(String, String)>,
    allows_agent_death: bool,
    input_kind: MessageKind,
    output_kind: MessageKind,
}

impl AgentFunction {
    fn new(name: &str, input_kind: MessageKind, output_kind: MessageKind) -> Self {
        Self {
            name: name.to_string(),
            initial_state: DEFAULT_STATE.to_string(),
            end_state: DEFAULT_STATE.to_string(),
            message_input: None,
            message_output: None,
            message_output_optional: false,
            agent_output: None,
            allows_agent_death: false,
            input_kind,
            output_kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn end_state(&self) -> &str {
        &self.end_state
    }

    pub fn message_input(&self) -> Option<&str> {
        self.message_input.as_deref()
    }

    pub fn message_output(&self) -> Option<&str> {
        self.message_output.as_deref()
    }

    pub fn message_output_optional(&self) -> bool {
        self.message_output_optional
    }

    pub fn agent_output(&self) -> Option<(&str, &str)> {
        self.agent_output
            .as_ref()
            .map(|(a, s)| (a.as_str(), s.as_str()))
    }

    pub fn allows_agent_death(&self) -> bool {
        self.allows_agent_death
    }

    pub fn input_kind(&self) -> MessageKind {
        self.input_kind
    }

    pub fn output_kind(&self) -> MessageKind {
        self.output_kind
    }
}

/// One declared message type.
#[derive(Debug, Clone)]
pub struct MessageType {
    name: String,
    kind: MessageKind,
    schema: VariableSchema,
    /// Number of bound producers whose output is optional. When zero the
    /// pending buffer never has gaps and compaction can be skipped.
    optional_outputs: usize,
}

impl MessageType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn schema(&self) -> &VariableSchema {
        &self.schema
    }

    pub fn optional_outputs(&self) -> usize {
        self.optional_outputs
    }
}

/// An ordered position in the step sequence holding functions that run
/// concurrently.
#[derive(Debug, Clone, Default)]
pub struct Layer {
    /// (agent name, function name) pairs.
    functions: Vec<(String, String)>,
}

impl Layer {
    pub fn functions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.functions.iter().map(|(a, f)| (a.as_str(), f.as_str()))
    }

    pub fn contains(&self, agent: &str, function: &str) -> bool {
        self.functions
            .iter()
            .any(|(a, f)| a == agent && f == function)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// The declared model: agent types, message types, layers.
#[derive(Debug, Clone)]
pub struct ModelGraph {
    id: ModelId,
    name: String,
    agents: IndexMap<String, AgentType>,
    messages: IndexMap<String, MessageType>,
    layers: Vec<Layer>,
}

impl ModelGraph {
    pub fn new(name: &str) -> Self {
        let id = ModelId::next();
        debug!(model = name, ?id, "model graph created");
        Self {
            id,
            name: name.to_string(),
            agents: IndexMap::new(),
            messages: IndexMap::new(),
            layers: Vec::new(),
        }
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare an agent type. Every agent starts with the default state.
    pub fn add_agent(&mut self, name: &str) -> Result<AgentRef> {
        if self.agents.contains_key(name) {
            return Err(ModelError::DuplicateName(name.to_string()));
        }
        self.agents.insert(
            name.to_string(),
            AgentType {
                name: name.to_string(),
                states: vec![DEFAULT_STATE.to_string()],
                schema: VariableSchema::new(),
                functions: IndexMap::new(),
                consumers: 0,
            },
        );
        debug!(model = %self.name, agent = name, "agent added");
        Ok(AgentRef {
            model: self.id,
            name: name.to_string(),
        })
    }

    /// Declare an additional behavioral state on an agent type.
    pub fn add_state(&mut self, agent: &AgentRef, state: &str) -> Result<()> {
        validate::ensure_model(self.id, agent.model, &agent.name)?;
        let a = self.agent_mut(&agent.name)?;
        if a.has_state(state) {
            return Err(ModelError::DuplicateName(state.to_string()));
        }
        a.states.push(state.to_string());
        Ok(())
    }

    /// Declare a scalar variable on an agent type.
    pub fn add_agent_variable(&mut self, agent: &AgentRef, name: &str, elem: ElemType) -> Result<()> {
        validate::ensure_model(self.id, agent.model, &agent.name)?;
        self.agent_mut(&agent.name)?.schema.add_variable(name, elem)
    }

    /// Declare a fixed-length array variable on an agent type.
    pub fn add_agent_variable_array(
        &mut self,
        agent: &AgentRef,
        name: &str,
        elem: ElemType,
        array_len: usize,
    ) -> Result<()> {
        validate::ensure_model(self.id, agent.model, &agent.name)?;
        self.agent_mut(&agent.name)?
            .schema
            .add_variable_array(name, elem, array_len)
    }

    /// Declare a message type of the given delivery kind.
    pub fn add_message(&mut self, name: &str, kind: MessageKind) -> Result<MessageRef> {
        if self.messages.contains_key(name) {
            return Err(ModelError::DuplicateName(name.to_string()));
        }
        self.messages.insert(
            name.to_string(),
            MessageType {
                name: name.to_string(),
                kind,
                schema: VariableSchema::new(),
                optional_outputs: 0,
            },
        );
        debug!(model = %self.name, message = name, %kind, "message added");
        Ok(MessageRef {
            model: self.id,
            name: name.to_string(),
        })
    }

    /// Declare a scalar variable on a message type.
    pub fn add_message_variable(
        &mut self,
        message: &MessageRef,
        name: &str,
        elem: ElemType,
    ) -> Result<()> {
        validate::ensure_model(self.id, message.model, &message.name)?;
        self.message_mut(&message.name)?
            .schema
            .add_variable(name, elem)
    }

    /// Declare an agent function expecting brute-force messages on both
    /// sides. The function starts in, and ends in, the default state.
    pub fn add_function(&mut self, agent: &AgentRef, name: &str) -> Result<FunctionRef> {
        self.add_function_expecting(agent, name, MessageKind::BruteForce, MessageKind::BruteForce)
    }

    /// Declare an agent function with explicit expected message kinds.
    pub fn add_function_expecting(
        &mut self,
        agent: &AgentRef,
        name: &str,
        input_kind: MessageKind,
        output_kind: MessageKind,
    ) -> Result<FunctionRef> {
        validate::ensure_model(self.id, agent.model, &agent.name)?;
        let a = self.agent_mut(&agent.name)?;
        if a.functions.contains_key(name) {
            return Err(ModelError::DuplicateName(name.to_string()));
        }
        a.functions
            .insert(name.to_string(), AgentFunction::new(name, input_kind, output_kind));
        debug!(model = %self.name, agent = %agent.name, function = name, "function added");
        Ok(FunctionRef {
            model: self.id,
            agent: agent.name.clone(),
            function: name.to_string(),
        })
    }

    /// Append an empty layer to the step sequence.
    pub fn add_layer(&mut self) -> LayerIndex {
        self.layers.push(Layer::default());
        LayerIndex {
            model: self.id,
            index: self.layers.len() - 1,
        }
    }

    /// Schedule a function into a layer.
    ///
    /// Fails with `InvalidAgentFunction` if another function of the same
    /// agent type in that layer shares an initial or end state with this
    /// one — the disjointness that makes per-layer buffer rotation
    /// race-free.
    pub fn add_function_to_layer(&mut self, layer: LayerIndex, func: &FunctionRef) -> Result<()> {
        validate::ensure_model(self.id, layer.model, "layer")?;
        validate::ensure_model(self.id, func.model, &func.function)?;
        let f = self.function_ref(func)?;
        let (initial, end) = (f.initial_state.clone(), f.end_state.clone());
        let target = &self.layers[layer.index];
        if target.contains(&func.agent, &func.function) {
            return Err(ModelError::DuplicateName(func.function.clone()));
        }
        validate::ensure_disjoint_in_layer(
            target,
            &self.agents,
            &func.agent,
            &func.function,
            &initial,
            &end,
        )?;
        self.layers[layer.index]
            .functions
            .push((func.agent.clone(), func.function.clone()));
        debug!(model = %self.name, layer = layer.index, function = %func.function, "function scheduled");
        Ok(())
    }

    /// Set the state a function consumes agents from.
    pub fn set_initial_state(&mut self, func: &FunctionRef, state: &str) -> Result<()> {
        self.set_transition_state(func, state, true)
    }

    /// Set the state a function commits agents into.
    pub fn set_end_state(&mut self, func: &FunctionRef, state: &str) -> Result<()> {
        self.set_transition_state(func, state, false)
    }

    fn set_transition_state(&mut self, func: &FunctionRef, state: &str, initial: bool) -> Result<()> {
        validate::ensure_model(self.id, func.model, &func.function)?;
        let agent = self.agent(&func.agent)?;
        validate::ensure_state(agent, state)?;
        validate::ensure_layer_state_free(
            &self.layers,
            &self.agents,
            &func.agent,
            &func.function,
            state,
        )?;
        let f = self.function_mut(func)?;
        if initial {
            f.initial_state = state.to_string();
        } else {
            f.end_state = state.to_string();
        }
        Ok(())
    }

    /// Bind a message type as a function's input.
    pub fn set_message_input(&mut self, func: &FunctionRef, message: &MessageRef) -> Result<()> {
        validate::ensure_model(self.id, func.model, &func.function)?;
        validate::ensure_model(self.id, message.model, &message.name)?;
        let f = self.function_ref(func)?;
        if f.message_output.as_deref() == Some(message.name.as_str()) {
            return Err(ModelError::InvalidMessageName {
                function: func.function.clone(),
                message: message.name.clone(),
                bound_as: "output",
            });
        }
        let expected = f.input_kind;
        let m = self.message(&message.name)?;
        validate::ensure_kind(expected, m.kind, &func.function, &message.name)?;
        self.function_mut(func)?.message_input = Some(message.name.clone());
        Ok(())
    }

    /// Bind a message type as a function's output.
    ///
    /// Rebinding to the currently bound message is a no-op; otherwise the
    /// optional-producer counter moves from the old target to the new one
    /// only after every check has passed.
    pub fn set_message_output(&mut self, func: &FunctionRef, message: &MessageRef) -> Result<()> {
        validate::ensure_model(self.id, func.model, &func.function)?;
        validate::ensure_model(self.id, message.model, &message.name)?;
        let f = self.function_ref(func)?;
        if f.message_input.as_deref() == Some(message.name.as_str()) {
            return Err(ModelError::InvalidMessageName {
                function: func.function.clone(),
                message: message.name.clone(),
                bound_as: "input",
            });
        }
        let prior = f.message_output.clone();
        if prior.as_deref() == Some(message.name.as_str()) {
            return Ok(());
        }
        let expected = f.output_kind;
        let optional = f.message_output_optional;
        let m = self.message(&message.name)?;
        validate::ensure_kind(expected, m.kind, &func.function, &message.name)?;

        if optional {
            if let Some(old) = &prior {
                self.message_mut(old)?.optional_outputs -= 1;
            }
            self.message_mut(&message.name)?.optional_outputs += 1;
        }
        self.function_mut(func)?.message_output = Some(message.name.clone());
        self.assert_optional_counters();
        Ok(())
    }

    /// Remove a function's output-message binding.
    pub fn clear_message_output(&mut self, func: &FunctionRef) -> Result<()> {
        validate::ensure_model(self.id, func.model, &func.function)?;
        let f = self.function_ref(func)?;
        let prior = f.message_output.clone();
        let optional = f.message_output_optional;
        if let Some(old) = prior {
            if optional {
                self.message_mut(&old)?.optional_outputs -= 1;
            }
            self.function_mut(func)?.message_output = None;
        }
        self.assert_optional_counters();
        Ok(())
    }

    /// Mark a function's message output as optional (it may emit zero
    /// messages). Toggles the bound message's optional-producer counter.
    pub fn set_message_output_optional(&mut self, func: &FunctionRef, optional: bool) -> Result<()> {
        validate::ensure_model(self.id, func.model, &func.function)?;
        let f = self.function_ref(func)?;
        if f.message_output_optional == optional {
            return Ok(());
        }
        let bound = f.message_output.clone();
        self.function_mut(func)?.message_output_optional = optional;
        if let Some(name) = bound {
            let m = self.message_mut(&name)?;
            if optional {
                m.optional_outputs += 1;
            } else {
                m.optional_outputs -= 1;
            }
        }
        self.assert_optional_counters();
        Ok(())
    }

    /// Bind the (agent type, state) a function's created agents land in.
    pub fn set_agent_output(
        &mut self,
        func: &FunctionRef,
        agent: &AgentRef,
        state: &str,
    ) -> Result<()> {
        validate::ensure_model(self.id, func.model, &func.function)?;
        validate::ensure_model(self.id, agent.model, &agent.name)?;
        let target = self.agent(&agent.name)?;
        validate::ensure_state(target, state)?;
        let prior = self.function_ref(func)?.agent_output.clone();
        match prior {
            Some((old_agent, old_state)) if old_agent == agent.name => {
                if old_state != state {
                    self.function_mut(func)?.agent_output =
                        Some((agent.name.clone(), state.to_string()));
                }
            }
            other => {
                if let Some((old_agent, _)) = other {
                    self.agent_mut(&old_agent)?.consumers -= 1;
                }
                self.agent_mut(&agent.name)?.consumers += 1;
                self.function_mut(func)?.agent_output =
                    Some((agent.name.clone(), state.to_string()));
            }
        }
        Ok(())
    }

    /// Allow a function to kill the agent it runs for.
    pub fn set_allow_agent_death(&mut self, func: &FunctionRef, allow: bool) -> Result<()> {
        validate::ensure_model(self.id, func.model, &func.function)?;
        self.function_mut(func)?.allows_agent_death = allow;
        Ok(())
    }

    pub fn agent(&self, name: &str) -> Result<&AgentType> {
        self.agents
            .get(name)
            .ok_or_else(|| ModelError::UnknownName(name.to_string()))
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentType> {
        self.agents.values()
    }

    pub fn message(&self, name: &str) -> Result<&MessageType> {
        self.messages
            .get(name)
            .ok_or_else(|| ModelError::UnknownName(name.to_string()))
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessageType> {
        self.messages.values()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn function(&self, agent: &str, name: &str) -> Result<&AgentFunction> {
        self.agent(agent)?
            .function(name)
            .ok_or_else(|| ModelError::UnknownName(name.to_string()))
    }

    /// Recompute a message's optional-producer count from the current
    /// bindings. The incremental counter must always agree with this.
    pub fn recount_optional_outputs(&self, message: &str) -> usize {
        self.agents
            .values()
            .flat_map(|a| a.functions.values())
            .filter(|f| f.message_output_optional && f.message_output.as_deref() == Some(message))
            .count()
    }

    /// Freeze every agent and message schema. Called by the runtime when
    /// buffers are allocated; afterwards variable declarations fail with
    /// `SchemaFrozen`.
    pub fn freeze(&mut self) {
        for a in self.agents.values_mut() {
            a.schema.freeze();
        }
        for m in self.messages.values_mut() {
            m.schema.freeze();
        }
    }

    fn agent_mut(&mut self, name: &str) -> Result<&mut AgentType> {
        self.agents
            .get_mut(name)
            .ok_or_else(|| ModelError::UnknownName(name.to_string()))
    }

    fn message_mut(&mut self, name: &str) -> Result<&mut MessageType> {
        self.messages
            .get_mut(name)
            .ok_or_else(|| ModelError::UnknownName(name.to_string()))
    }

    fn function_ref(&self, func: &FunctionRef) -> Result<&AgentFunction> {
        self.function(&func.agent, &func.function)
    }

    fn function_mut(&mut self, func: &FunctionRef) -> Result<&mut AgentFunction> {
        let name = func.function.clone();
        self.agent_mut(&func.agent)?
            .functions
            .get_mut(&name)
            .ok_or(ModelError::UnknownName(name))
    }

    fn assert_optional_counters(&self) {
        #[cfg(debug_assertions)]
        for m in self.messages.values() {
            debug_assert_eq!(
                m.optional_outputs,
                self.recount_optional_outputs(&m.name),
                "optional-output counter drifted for message '{}'",
                m.name
            );
        }
    }
}
