//! Integration test harness for Murmur.
//!
//! This crate provides utilities for end-to-end testing of the full
//! pipeline: declare model → allocate → bind kernels → step → verify.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use murmur_model::{ElemType, MessageKind, ModelGraph};
use murmur_runtime::{HostDevice, PopulationBatch, RunPlan, Simulation, StepOutcome};

/// Build the circles model: agents broadcast their position in one layer
/// and move toward the average of their neighbors in the next.
///
/// # Panics
///
/// Panics if the model cannot be declared; the declarations here are
/// known-valid.
pub fn circles_model() -> ModelGraph {
    let mut model = ModelGraph::new("circles");
    let circle = model.add_agent("circle").unwrap();
    model.add_agent_variable(&circle, "x", ElemType::F32).unwrap();
    model.add_agent_variable(&circle, "y", ElemType::F32).unwrap();

    let location = model
        .add_message("location", MessageKind::BruteForce)
        .unwrap();
    model.add_message_variable(&location, "x", ElemType::F32).unwrap();
    model.add_message_variable(&location, "y", ElemType::F32).unwrap();

    let output = model.add_function(&circle, "output_data").unwrap();
    model.set_message_output(&output, &location).unwrap();
    let movement = model.add_function(&circle, "move").unwrap();
    model.set_message_input(&movement, &location).unwrap();

    let first = model.add_layer();
    model.add_function_to_layer(first, &output).unwrap();
    let second = model.add_layer();
    model.add_function_to_layer(second, &movement).unwrap();
    model
}

/// Test harness wrapping a ready-to-run circles simulation.
pub struct TestHarness {
    sim: Simulation,
}

impl TestHarness {
    /// Create a harness with `count` agents placed by `seed`.
    ///
    /// # Panics
    ///
    /// Panics if allocation or population loading fails.
    pub fn circles(count: usize, seed: u64) -> Self {
        let mut sim =
            Simulation::new(circles_model(), Arc::new(HostDevice::new()), count.max(1) * 2)
                .unwrap();

        sim.bind_kernel("circle", "output_data", |ctx, out| {
            out.message_set("x", ctx.get::<f32>("x"));
            out.message_set("y", ctx.get::<f32>("y"));
        })
        .unwrap();

        // Each agent drifts a fixed fraction toward the centroid of every
        // other agent.
        sim.bind_kernel("circle", "move", |ctx, out| {
            let (x, y) = (ctx.get::<f32>("x"), ctx.get::<f32>("y"));
            let (mut sx, mut sy, mut n) = (0.0f32, 0.0f32, 0u32);
            for msg in ctx.messages() {
                if msg.index() != ctx.index() {
                    sx += msg.get::<f32>("x");
                    sy += msg.get::<f32>("y");
                    n += 1;
                }
            }
            if n > 0 {
                out.set("x", x + (sx / n as f32 - x) * 0.1);
                out.set("y", y + (sy / n as f32 - y) * 0.1);
            }
        })
        .unwrap();

        let schema = sim.model().agent("circle").unwrap().schema().clone();
        let mut batch = PopulationBatch::new(&schema, count);
        let mut rng = StdRng::seed_from_u64(seed);
        for i in 0..count {
            batch.set(i, "x", rng.gen_range(-10.0f32..10.0)).unwrap();
            batch.set(i, "y", rng.gen_range(-10.0f32..10.0)).unwrap();
        }
        sim.set_population("circle", "default", &batch).unwrap();

        Self { sim }
    }

    /// Execute a single step.
    ///
    /// # Panics
    ///
    /// Panics if step execution fails.
    pub fn step(&mut self) -> StepOutcome {
        self.sim.step().unwrap()
    }

    /// Execute multiple steps.
    pub fn run_steps(&mut self, count: u64) {
        for _ in 0..count {
            self.step();
        }
    }

    /// Run a plan to completion; returns completed steps.
    pub fn simulate(&mut self, plan: &RunPlan) -> u64 {
        self.sim.simulate(plan).unwrap()
    }

    /// Current positions of every agent.
    pub fn positions(&self) -> Vec<(f32, f32)> {
        let batch = self.sim.population("circle", "default").unwrap();
        (0..batch.len())
            .map(|i| {
                (
                    batch.get::<f32>(i, "x").unwrap(),
                    batch.get::<f32>(i, "y").unwrap(),
                )
            })
            .collect()
    }

    /// Spread of the population: the largest distance from the centroid.
    pub fn spread(&self) -> f32 {
        let positions = self.positions();
        let n = positions.len() as f32;
        let (cx, cy) = positions
            .iter()
            .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x / n, ay + y / n));
        positions
            .iter()
            .map(|(x, y)| ((x - cx).powi(2) + (y - cy).powi(2)).sqrt())
            .fold(0.0, f32::max)
    }

    pub fn agent_count(&self) -> usize {
        self.sim.population_count("circle", "default").unwrap()
    }

    pub fn message_count(&self) -> usize {
        self.sim.message_count("location").unwrap()
    }

    /// Get access to the simulation for direct assertions.
    pub fn sim(&self) -> &Simulation {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut Simulation {
        &mut self.sim
    }
}
