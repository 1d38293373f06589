//! Layered step execution
//!
//! A [`Simulation`] binds a frozen model graph to allocated state buffers
//! and drives the step loop. Each step walks the model's layers in order;
//! within a layer every scheduled function reads the same frozen snapshot
//! and all of its effects (rewrites, transitions, births, deaths, message
//! emission) become visible together at the layer boundary.
//!
//! Execution of one function is two-phase: a parallel map over the source
//! population producing owned per-entity results, then a sequential commit
//! into swap and pending buffers. The commit order is the population
//! order, so runs with equal seeds are bit-identical.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytemuck::Pod;
use indexmap::IndexMap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use tracing::{debug, info, instrument, trace};

use murmur_model::{AgentFunction, ModelGraph, VariableSchema};

use crate::buffers::{BufferRole, StateBuffers};
use crate::device::Device;
use crate::error::{Result, RuntimeError};
use crate::plan::{PropertyValue, RunPlan};
use crate::population::PopulationBatch;

/// Per-step behavior of one agent function.
pub type AgentKernel = Box<dyn for<'a> Fn(&AgentContext<'a>, &mut AgentOutput<'a>) + Send + Sync>;

/// Host callback deciding whether a run should end after a step.
pub type ExitCondition = Box<dyn Fn(&StepView<'_>) -> bool + Send + Sync>;

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Running,
    /// A stop request was honored at a layer boundary.
    Stopped,
}

/// Lifecycle of a simulation instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    /// Between steps; populations are readable and consistent.
    Idle,
    /// Inside a step; buffers may be mid-rotation.
    Stepping,
    /// A run ended because an exit condition fired.
    Complete,
}

/// Byte layout of one entity row derived from a schema.
#[derive(Debug, Clone)]
struct Layout {
    /// variable → (byte offset in row, byte size).
    offsets: IndexMap<String, (usize, usize)>,
    entry_size: usize,
}

impl Layout {
    fn of(schema: &VariableSchema) -> Self {
        let mut offsets = IndexMap::new();
        let mut cursor = 0;
        for (name, var) in schema.iter() {
            offsets.insert(name.to_string(), (cursor, var.size()));
            cursor += var.size();
        }
        Self {
            offsets,
            entry_size: cursor,
        }
    }

    fn slot<T: Pod>(&self, variable: &str) -> (usize, usize) {
        let Some(&(offset, size)) = self.offsets.get(variable) else {
            panic!("unknown variable '{variable}'");
        };
        if size != mem::size_of::<T>() {
            panic!("variable '{variable}' holds {size} bytes, accessed as {}", mem::size_of::<T>());
        }
        (offset, size)
    }
}

/// Read-only snapshot of one message list during a layer.
#[derive(Debug)]
pub struct MessagesView<'a> {
    layout: &'a Layout,
    count: usize,
    columns: IndexMap<String, &'a [u8]>,
}

impl MessagesView<'_> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn get<T: Pod>(&self, index: usize, variable: &str) -> T {
        let (_, size) = self.layout.slot::<T>(variable);
        let Some(column) = self.columns.get(variable) else {
            panic!("unknown variable '{variable}'");
        };
        bytemuck::pod_read_unaligned(&column[index * size..(index + 1) * size])
    }
}

/// One message within a [`MessagesView`].
#[derive(Debug, Clone, Copy)]
pub struct MessageView<'a> {
    view: &'a MessagesView<'a>,
    index: usize,
}

impl MessageView<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn get<T: Pod>(&self, variable: &str) -> T {
        self.view.get(self.index, variable)
    }
}

/// Iterator over an input message list.
#[derive(Debug)]
pub struct MessageIter<'a> {
    view: Option<&'a MessagesView<'a>>,
    next: usize,
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = MessageView<'a>;

    fn next(&mut self) -> Option<MessageView<'a>> {
        let view = self.view?;
        if self.next >= view.count {
            return None;
        }
        let item = MessageView {
            view,
            index: self.next,
        };
        self.next += 1;
        Some(item)
    }
}

/// What a kernel sees: its own entity's snapshot, the bound input
/// message list, run properties and a per-entity random stream.
pub struct AgentContext<'a> {
    index: usize,
    row: &'a [u8],
    layout: &'a Layout,
    messages: Option<&'a MessagesView<'a>>,
    properties: &'a IndexMap<String, PropertyValue>,
    seed: u64,
    step: u64,
}

impl<'a> AgentContext<'a> {
    /// Position of this entity within its population.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Read one of this entity's variables as of the layer snapshot.
    pub fn get<T: Pod>(&self, variable: &str) -> T {
        let (offset, size) = self.layout.slot::<T>(variable);
        bytemuck::pod_read_unaligned(&self.row[offset..offset + size])
    }

    /// Iterate the bound input message list. Empty when the function has
    /// no input binding.
    pub fn messages(&self) -> MessageIter<'a> {
        MessageIter {
            view: self.messages,
            next: 0,
        }
    }

    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        self.properties.get(name).copied()
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        match self.property(name)? {
            PropertyValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Random stream unique to (run seed, step, entity index).
    pub fn rng(&self) -> StdRng {
        let mut h = self.seed ^ 0x9E37_79B9_7F4A_7C15u64.wrapping_mul(self.step.wrapping_add(1));
        h ^= (self.index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        StdRng::seed_from_u64(h)
    }
}

/// Owned result of one kernel invocation, produced in the parallel
/// phase and applied in the sequential commit.
struct EntityResult {
    row: Vec<u8>,
    dead: bool,
    message: Option<Vec<u8>>,
    child: Option<Vec<u8>>,
}

/// What a kernel writes: its entity's next-step row, death, an optional
/// outgoing message and an optional new agent.
pub struct AgentOutput<'a> {
    layout: &'a Layout,
    row: Vec<u8>,
    dead: bool,
    can_die: bool,
    message_layout: Option<&'a Layout>,
    message: Option<Vec<u8>>,
    child_layout: Option<&'a Layout>,
    child: Option<Vec<u8>>,
}

impl AgentOutput<'_> {
    /// Write one of this entity's variables for the next step. Unset
    /// variables carry their snapshot value forward.
    pub fn set<T: Pod>(&mut self, variable: &str, value: T) {
        let (offset, _) = self.layout.slot::<T>(variable);
        self.row[offset..offset + mem::size_of::<T>()]
            .copy_from_slice(bytemuck::bytes_of(&value));
    }

    /// Mark this entity dead. Ignored unless the function allows death.
    pub fn kill(&mut self) {
        if self.can_die {
            self.dead = true;
        }
    }

    /// Write a variable of the outgoing message. The first write emits
    /// the message; untouched variables are zero.
    pub fn message_set<T: Pod>(&mut self, variable: &str, value: T) {
        let Some(layout) = self.message_layout else {
            panic!("function has no message output binding");
        };
        let (offset, _) = layout.slot::<T>(variable);
        let row = self
            .message
            .get_or_insert_with(|| vec![0u8; layout.entry_size]);
        row[offset..offset + mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
    }

    /// Write a variable of the agent this function creates. The first
    /// write creates the agent; untouched variables are zero.
    pub fn child_set<T: Pod>(&mut self, variable: &str, value: T) {
        let Some(layout) = self.child_layout else {
            panic!("function has no agent output binding");
        };
        let (offset, _) = layout.slot::<T>(variable);
        let row = self
            .child
            .get_or_insert_with(|| vec![0u8; layout.entry_size]);
        row[offset..offset + mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
    }

    fn finish(self) -> EntityResult {
        EntityResult {
            row: self.row,
            dead: self.dead,
            message: self.message,
            child: self.child,
        }
    }
}

/// Read-only view handed to exit conditions after a step.
pub struct StepView<'a> {
    sim: &'a Simulation,
}

impl StepView<'_> {
    /// Steps completed so far in this run.
    pub fn step(&self) -> u64 {
        self.sim.step
    }

    /// Entity count of one population; zero for unknown populations.
    pub fn population_count(&self, agent: &str, state: &str) -> usize {
        self.sim
            .agent_buffers
            .get(&(agent.to_string(), state.to_string()))
            .map_or(0, |b| b.count(BufferRole::Active))
    }

    /// Message count of one list; zero for unknown messages.
    pub fn message_count(&self, message: &str) -> usize {
        self.sim
            .message_buffers
            .get(message)
            .map_or(0, |b| b.count(BufferRole::Active))
    }

    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        self.sim.properties.get(name).copied()
    }
}

/// An executable instance of one model.
pub struct Simulation {
    model: ModelGraph,
    /// (agent, state) → triple-role buffer set.
    agent_buffers: IndexMap<(String, String), StateBuffers>,
    message_buffers: IndexMap<String, StateBuffers>,
    agent_layouts: IndexMap<String, Layout>,
    message_layouts: IndexMap<String, Layout>,
    kernels: IndexMap<(String, String), AgentKernel>,
    exit_conditions: Vec<ExitCondition>,
    properties: IndexMap<String, PropertyValue>,
    state: SimState,
    step: u64,
    random_seed: u64,
    stop_requested: Arc<AtomicBool>,
}

impl Simulation {
    /// Freeze the model and allocate every population and message list
    /// at `capacity` entries. Fails without leaking device memory if the
    /// device refuses any allocation.
    #[instrument(skip(model, device), fields(model = model.name()))]
    pub fn new(mut model: ModelGraph, device: Arc<dyn Device>, capacity: usize) -> Result<Self> {
        model.freeze();

        let mut agent_buffers = IndexMap::new();
        let mut agent_layouts = IndexMap::new();
        for agent in model.agents() {
            agent_layouts.insert(agent.name().to_string(), Layout::of(agent.schema()));
            for state in agent.states() {
                let mut buffers = StateBuffers::new(device.clone());
                buffers.allocate(agent.schema(), capacity)?;
                agent_buffers.insert((agent.name().to_string(), state.to_string()), buffers);
            }
        }

        let mut message_buffers = IndexMap::new();
        let mut message_layouts = IndexMap::new();
        for message in model.messages() {
            message_layouts.insert(message.name().to_string(), Layout::of(message.schema()));
            let mut buffers = StateBuffers::new(device.clone());
            buffers.allocate(message.schema(), capacity)?;
            message_buffers.insert(message.name().to_string(), buffers);
        }

        info!(
            populations = agent_buffers.len(),
            messages = message_buffers.len(),
            capacity,
            "simulation allocated"
        );
        Ok(Self {
            model,
            agent_buffers,
            message_buffers,
            agent_layouts,
            message_layouts,
            kernels: IndexMap::new(),
            exit_conditions: Vec::new(),
            properties: IndexMap::new(),
            state: SimState::Idle,
            step: 0,
            random_seed: 0,
            stop_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn model(&self) -> &ModelGraph {
        &self.model
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn state(&self) -> SimState {
        self.state
    }

    /// Attach per-step behavior to a declared agent function.
    pub fn bind_kernel(
        &mut self,
        agent: &str,
        function: &str,
        kernel: impl for<'a> Fn(&AgentContext<'a>, &mut AgentOutput<'a>) + Send + Sync + 'static,
    ) -> Result<()> {
        if self.model.function(agent, function).is_err() {
            return Err(RuntimeError::UnknownFunction {
                agent: agent.to_string(),
                function: function.to_string(),
            });
        }
        self.kernels
            .insert((agent.to_string(), function.to_string()), Box::new(kernel));
        Ok(())
    }

    /// Register a condition checked after every step; a run ends when any
    /// condition returns true.
    pub fn add_exit_condition(
        &mut self,
        condition: impl Fn(&StepView<'_>) -> bool + Send + Sync + 'static,
    ) {
        self.exit_conditions.push(Box::new(condition));
    }

    pub fn set_property(&mut self, name: &str, value: PropertyValue) {
        self.properties.insert(name.to_string(), value);
    }

    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        self.properties.get(name).copied()
    }

    /// Handle that requests a stop from another thread. The stop takes
    /// effect at the next layer boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Load host data into one population's active buffer.
    pub fn set_population(
        &mut self,
        agent: &str,
        state: &str,
        batch: &PopulationBatch,
    ) -> Result<()> {
        let key = (agent.to_string(), state.to_string());
        let buffers = self
            .agent_buffers
            .get_mut(&key)
            .ok_or_else(|| RuntimeError::UnknownPopulation {
                agent: agent.to_string(),
                state: state.to_string(),
            })?;
        if !schemas_match(batch.schema(), buffers.schema()) {
            return Err(RuntimeError::SchemaMismatch {
                population: format!("{agent}.{state}"),
            });
        }
        buffers.set_count(BufferRole::Active, batch.len())?;
        for (name, var) in batch.schema().iter() {
            let bytes = batch.len() * var.size();
            let column = batch.column(name)?;
            buffers.variable_mut(BufferRole::Active, name)?[..bytes].copy_from_slice(column);
        }
        Ok(())
    }

    /// Copy one population's active buffer back to the host.
    pub fn population(&self, agent: &str, state: &str) -> Result<PopulationBatch> {
        let buffers = self.agent_population(agent, state)?;
        Ok(read_batch(buffers))
    }

    pub fn population_count(&self, agent: &str, state: &str) -> Result<usize> {
        Ok(self.agent_population(agent, state)?.count(BufferRole::Active))
    }

    /// Copy one message list's active buffer back to the host.
    pub fn message_batch(&self, message: &str) -> Result<PopulationBatch> {
        let buffers = self
            .message_buffers
            .get(message)
            .ok_or_else(|| RuntimeError::UnknownMessage(message.to_string()))?;
        Ok(read_batch(buffers))
    }

    pub fn message_count(&self, message: &str) -> Result<usize> {
        self.message_buffers
            .get(message)
            .map(|b| b.count(BufferRole::Active))
            .ok_or_else(|| RuntimeError::UnknownMessage(message.to_string()))
    }

    /// Execute one step: every layer in order, with a rotation barrier
    /// after each.
    #[instrument(skip(self), fields(step = self.step))]
    pub fn step(&mut self) -> Result<StepOutcome> {
        let kernels = mem::take(&mut self.kernels);
        let outcome = self.step_with(&kernels);
        self.kernels = kernels;
        if outcome.is_err() {
            self.state = SimState::Idle;
        }
        outcome
    }

    fn step_with(
        &mut self,
        kernels: &IndexMap<(String, String), AgentKernel>,
    ) -> Result<StepOutcome> {
        self.state = SimState::Stepping;
        for layer in 0..self.model.layers().len() {
            self.run_layer(layer, kernels)?;
            if self.stop_requested.swap(false, Ordering::SeqCst) {
                debug!(step = self.step, layer, "stop honored at layer boundary");
                self.state = SimState::Idle;
                return Ok(StepOutcome::Stopped);
            }
        }
        self.step += 1;
        self.state = SimState::Idle;
        Ok(StepOutcome::Running)
    }

    /// Run a plan to completion: seed and property overrides applied, then
    /// steps until the plan's count is reached, an exit condition fires,
    /// or a stop is requested. Returns the number of completed steps.
    #[instrument(skip(self, plan), fields(seed = plan.random_seed(), steps = plan.steps()))]
    pub fn simulate(&mut self, plan: &RunPlan) -> Result<u64> {
        if plan.steps() == 0 && self.exit_conditions.is_empty() {
            return Err(RuntimeError::UnboundedRun);
        }
        self.random_seed = plan.random_seed();
        for (name, value) in plan.overrides() {
            self.properties.insert(name.to_string(), value);
        }
        self.state = SimState::Idle;
        self.step = 0;

        let mut executed = 0;
        while plan.steps() == 0 || executed < plan.steps() {
            match self.step()? {
                StepOutcome::Stopped => break,
                StepOutcome::Running => {}
            }
            executed += 1;
            if self.check_exit() {
                debug!(step = executed, "exit condition fired");
                self.state = SimState::Complete;
                break;
            }
        }
        info!(executed, state = ?self.state, "run finished");
        Ok(executed)
    }

    fn check_exit(&mut self) -> bool {
        if self.exit_conditions.is_empty() {
            return false;
        }
        let conditions = mem::take(&mut self.exit_conditions);
        let stop = {
            let view = StepView { sim: self };
            conditions.iter().any(|c| c(&view))
        };
        self.exit_conditions = conditions;
        stop
    }

    fn run_layer(
        &mut self,
        layer: usize,
        kernels: &IndexMap<(String, String), AgentKernel>,
    ) -> Result<()> {
        let result = self.layer_pass(layer, kernels);
        if result.is_err() {
            // A failed layer must not leak half-staged rows into the next
            // attempt: pending counts are zero at every layer boundary, so
            // restoring that invariant discards exactly this layer's
            // uncommitted appends. Swap data is unreachable until a
            // swap_active that never ran.
            self.discard_pending();
        }
        result
    }

    fn discard_pending(&mut self) {
        for buffers in self.agent_buffers.values_mut() {
            buffers.clear_pending();
        }
        for buffers in self.message_buffers.values_mut() {
            buffers.clear_pending();
        }
    }

    fn layer_pass(
        &mut self,
        layer: usize,
        kernels: &IndexMap<(String, String), AgentKernel>,
    ) -> Result<()> {
        let functions: Vec<(String, String)> = self.model.layers()[layer]
            .functions()
            .map(|(a, f)| (a.to_string(), f.to_string()))
            .collect();

        let mut swap_rotations: Vec<(String, String)> = Vec::new();
        let mut pending_commits: Vec<(String, String)> = Vec::new();
        let mut message_rotations: Vec<String> = Vec::new();

        for (agent, fname) in functions {
            let func = self.model.function(&agent, &fname)?.clone();
            let results = self.run_function(&agent, &func, kernels, layer)?;
            let step = self.step;
            self.commit_function(
                &agent,
                &func,
                results,
                &mut swap_rotations,
                &mut pending_commits,
                &mut message_rotations,
            )
            .map_err(|e| wrap_layer(e, step, layer))?;
        }

        // Layer boundary: rewrites become visible first, then appended
        // entries merge on top, then message lists flip to this layer's
        // output.
        for key in swap_rotations {
            self.agent_buffers_mut(&key)?.swap_active();
        }
        let step = self.step;
        for key in pending_commits {
            self.agent_buffers_mut(&key)?
                .commit_pending()
                .map_err(|e| wrap_layer(e, step, layer))?;
        }
        for name in message_rotations {
            self.message_buffers
                .get_mut(&name)
                .ok_or_else(|| RuntimeError::UnknownMessage(name.clone()))?
                .rotate();
        }
        trace!(step = self.step, layer, "layer committed");
        Ok(())
    }

    fn run_function(
        &self,
        agent: &str,
        func: &AgentFunction,
        kernels: &IndexMap<(String, String), AgentKernel>,
        layer: usize,
    ) -> Result<Vec<EntityResult>> {
        let kernel = kernels
            .get(&(agent.to_string(), func.name().to_string()))
            .ok_or_else(|| RuntimeError::DeviceExecutionError {
                step: self.step,
                layer,
                message: format!("no kernel bound for '{agent}.{}'", func.name()),
            })?;

        let buffers = self.agent_population(agent, func.initial_state())?;
        let layout = self.agent_layout(agent)?;
        let count = buffers.count(BufferRole::Active);

        // Stage the snapshot as per-entity rows.
        let mut rows = vec![vec![0u8; layout.entry_size]; count];
        for (name, &(offset, size)) in &layout.offsets {
            let column = buffers.variable(BufferRole::Active, name)?;
            for (i, row) in rows.iter_mut().enumerate() {
                row[offset..offset + size].copy_from_slice(&column[i * size..(i + 1) * size]);
            }
        }

        let messages = match func.message_input() {
            Some(name) => Some(self.messages_view(name)?),
            None => None,
        };
        let message_layout = match func.message_output() {
            Some(name) => Some(self.message_layout(name)?),
            None => None,
        };
        let child_layout = match func.agent_output() {
            Some((child_agent, _)) => Some(self.agent_layout(child_agent)?),
            None => None,
        };
        let can_die = func.allows_agent_death();
        let (seed, step) = (self.random_seed, self.step);
        let properties = &self.properties;

        let results = rows
            .into_par_iter()
            .enumerate()
            .map(|(index, row)| {
                let ctx = AgentContext {
                    index,
                    row: &row,
                    layout,
                    messages: messages.as_ref(),
                    properties,
                    seed,
                    step,
                };
                let mut out = AgentOutput {
                    layout,
                    row: row.clone(),
                    dead: false,
                    can_die,
                    message_layout,
                    message: None,
                    child_layout,
                    child: None,
                };
                kernel(&ctx, &mut out);
                out.finish()
            })
            .collect();
        Ok(results)
    }

    fn commit_function(
        &mut self,
        agent: &str,
        func: &AgentFunction,
        results: Vec<EntityResult>,
        swap_rotations: &mut Vec<(String, String)>,
        pending_commits: &mut Vec<(String, String)>,
        message_rotations: &mut Vec<String>,
    ) -> Result<()> {
        let mut survivors: Vec<Vec<u8>> = Vec::with_capacity(results.len());
        let mut children: Vec<Vec<u8>> = Vec::new();
        let mut messages: Vec<Option<Vec<u8>>> = Vec::with_capacity(results.len());
        for result in results {
            if let Some(child) = result.child {
                children.push(child);
            }
            messages.push(result.message);
            if !result.dead {
                survivors.push(result.row);
            }
        }

        let layout = self
            .agent_layouts
            .get(agent)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownPopulation {
                agent: agent.to_string(),
                state: func.initial_state().to_string(),
            })?;

        if func.end_state() == func.initial_state() {
            let key = (agent.to_string(), func.initial_state().to_string());
            let buffers = self.agent_buffers_mut(&key)?;
            write_rows(buffers, &layout, BufferRole::Swap, &survivors)?;
            if !swap_rotations.contains(&key) {
                swap_rotations.push(key);
            }
        } else {
            let dst = (agent.to_string(), func.end_state().to_string());
            append_rows(self.agent_buffers_mut(&dst)?, &layout, &survivors)?;
            let src = (agent.to_string(), func.initial_state().to_string());
            self.agent_buffers_mut(&src)?
                .set_count(BufferRole::Active, 0)?;
            if !pending_commits.contains(&dst) {
                pending_commits.push(dst);
            }
        }

        if let Some((child_agent, child_state)) = func.agent_output()
            && !children.is_empty()
        {
            let child_layout = self
                .agent_layouts
                .get(child_agent)
                .cloned()
                .ok_or_else(|| RuntimeError::UnknownPopulation {
                    agent: child_agent.to_string(),
                    state: child_state.to_string(),
                })?;
            let key = (child_agent.to_string(), child_state.to_string());
            append_rows(self.agent_buffers_mut(&key)?, &child_layout, &children)?;
            if !pending_commits.contains(&key) {
                pending_commits.push(key);
            }
        }

        if let Some(message) = func.message_output() {
            let message_layout = self.message_layout(message)?.clone();
            // An optional producer contributes only what it emitted; a
            // required producer reserves a zeroed entry for every entity
            // that stayed silent.
            let emitted: Vec<Vec<u8>> = if func.message_output_optional() {
                messages.into_iter().flatten().collect()
            } else {
                messages
                    .into_iter()
                    .map(|m| m.unwrap_or_else(|| vec![0u8; message_layout.entry_size]))
                    .collect()
            };
            let buffers = self
                .message_buffers
                .get_mut(message)
                .ok_or_else(|| RuntimeError::UnknownMessage(message.to_string()))?;
            append_rows(buffers, &message_layout, &emitted)?;
            if !message_rotations.iter().any(|m| m == message) {
                message_rotations.push(message.to_string());
            }
        }
        Ok(())
    }

    fn messages_view(&self, name: &str) -> Result<MessagesView<'_>> {
        let buffers = self
            .message_buffers
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownMessage(name.to_string()))?;
        let layout = self.message_layout(name)?;
        let mut columns = IndexMap::new();
        for variable in layout.offsets.keys() {
            columns.insert(
                variable.clone(),
                buffers.variable(BufferRole::Active, variable)?,
            );
        }
        Ok(MessagesView {
            layout,
            count: buffers.count(BufferRole::Active),
            columns,
        })
    }

    fn agent_population(&self, agent: &str, state: &str) -> Result<&StateBuffers> {
        self.agent_buffers
            .get(&(agent.to_string(), state.to_string()))
            .ok_or_else(|| RuntimeError::UnknownPopulation {
                agent: agent.to_string(),
                state: state.to_string(),
            })
    }

    fn agent_buffers_mut(&mut self, key: &(String, String)) -> Result<&mut StateBuffers> {
        self.agent_buffers
            .get_mut(key)
            .ok_or_else(|| RuntimeError::UnknownPopulation {
                agent: key.0.clone(),
                state: key.1.clone(),
            })
    }

    fn agent_layout(&self, agent: &str) -> Result<&Layout> {
        self.agent_layouts
            .get(agent)
            .ok_or_else(|| RuntimeError::UnknownPopulation {
                agent: agent.to_string(),
                state: String::new(),
            })
    }

    fn message_layout(&self, message: &str) -> Result<&Layout> {
        self.message_layouts
            .get(message)
            .ok_or_else(|| RuntimeError::UnknownMessage(message.to_string()))
    }
}

/// Mid-step failures are fatal to the run and carry where they happened.
fn wrap_layer(err: RuntimeError, step: u64, layer: usize) -> RuntimeError {
    match err {
        e @ RuntimeError::DeviceExecutionError { .. } => e,
        e => RuntimeError::DeviceExecutionError {
            step,
            layer,
            message: e.to_string(),
        },
    }
}

fn schemas_match(a: &VariableSchema, b: &VariableSchema) -> bool {
    a.total_variable_count() == b.total_variable_count()
        && a.iter()
            .zip(b.iter())
            .all(|((an, av), (bn, bv))| an == bn && av == bv)
}

fn read_batch(buffers: &StateBuffers) -> PopulationBatch {
    let count = buffers.count(BufferRole::Active);
    let mut batch = PopulationBatch::new(buffers.schema(), count);
    for (name, var) in buffers.schema().iter() {
        let bytes = count * var.size();
        if let (Ok(column), Ok(dst)) = (
            buffers.variable(BufferRole::Active, name),
            batch.column_mut(name),
        ) {
            dst.copy_from_slice(&column[..bytes]);
        }
    }
    batch
}

/// Dense rewrite of a role from row-staged data; sets the role's count.
fn write_rows(
    buffers: &mut StateBuffers,
    layout: &Layout,
    role: BufferRole,
    rows: &[Vec<u8>],
) -> Result<()> {
    buffers.set_count(role, rows.len())?;
    for (name, &(offset, size)) in &layout.offsets {
        let column = buffers.variable_mut(role, name)?;
        for (i, row) in rows.iter().enumerate() {
            column[i * size..(i + 1) * size].copy_from_slice(&row[offset..offset + size]);
        }
    }
    Ok(())
}

/// Append row-staged data after a pending buffer's current entries.
fn append_rows(buffers: &mut StateBuffers, layout: &Layout, rows: &[Vec<u8>]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let start = buffers.count(BufferRole::Pending);
    buffers.set_count(BufferRole::Pending, start + rows.len())?;
    for (name, &(offset, size)) in &layout.offsets {
        let column = buffers.variable_mut(BufferRole::Pending, name)?;
        for (i, row) in rows.iter().enumerate() {
            column[(start + i) * size..(start + i + 1) * size]
                .copy_from_slice(&row[offset..offset + size]);
        }
    }
    Ok(())
}
