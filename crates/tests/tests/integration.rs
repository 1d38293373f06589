//! Integration tests for end-to-end Murmur execution.
//!
//! These tests verify the full pipeline:
//! Declare model → Allocate → Bind kernels → Step → Verify

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use murmur_model::{ElemType, MessageKind, ModelError, ModelGraph};
use murmur_runtime::{
    HostDevice, PopulationBatch, RunPlan, RunPlanVector, RuntimeError, Simulation,
};
use murmur_tests::{TestHarness, circles_model};

/// The circles flock contracts over time: every step each agent moves a
/// fraction toward the centroid, so the maximum distance from the
/// centroid must shrink monotonically.
#[test]
fn test_circles_converge() {
    let mut harness = TestHarness::circles(64, 7);
    let mut spread = harness.spread();
    assert!(spread > 1.0, "random placement should be spread out");

    for _ in 0..20 {
        harness.step();
        let next = harness.spread();
        assert!(next <= spread + 1e-4, "spread grew: {next} > {spread}");
        spread = next;
    }
    assert!(spread < 5.0, "flock should have contracted");

    // No agent was created or destroyed along the way
    assert_eq!(harness.agent_count(), 64);
    // The message list holds exactly the last step's broadcasts
    assert_eq!(harness.message_count(), 64);
}

/// Same seed → bit-identical trajectories; different seed → different.
#[test]
fn test_runs_are_deterministic() {
    let mut a = TestHarness::circles(32, 99);
    let mut b = TestHarness::circles(32, 99);
    let mut c = TestHarness::circles(32, 100);
    a.run_steps(25);
    b.run_steps(25);
    c.run_steps(25);

    assert_eq!(a.positions(), b.positions());
    assert_ne!(a.positions(), c.positions());
}

/// A plan batch drives independent runs whose results depend only on the
/// per-plan seed.
#[test]
fn test_plan_batch_reproducibility() {
    let mut plans = RunPlanVector::new(3);
    plans.set_steps(10).set_random_seed(5, 3);

    let mut results = Vec::new();
    for plan in &plans {
        let mut harness = TestHarness::circles(16, plan.random_seed());
        assert_eq!(harness.simulate(plan), 10);
        results.push(harness.positions());
    }

    // Re-running the middle plan reproduces its result exactly
    let mut again = TestHarness::circles(16, plans[1].random_seed());
    again.simulate(&plans[1]);
    assert_eq!(again.positions(), results[1]);
}

/// A model's life cycle over many steps: births accumulate, deaths cull,
/// and the total never exceeds what the kernels produced.
#[test]
fn test_birth_and_death_counts() {
    let mut model = ModelGraph::new("lifecycle");
    let cell = model.add_agent("cell").unwrap();
    model.add_agent_variable(&cell, "age", ElemType::U32).unwrap();

    let live = model.add_function(&cell, "live").unwrap();
    model.set_allow_agent_death(&live, true).unwrap();
    model.set_agent_output(&live, &cell, "default").unwrap();
    let layer = model.add_layer();
    model.add_function_to_layer(layer, &live).unwrap();

    let mut sim = Simulation::new(model, Arc::new(HostDevice::new()), 4096).unwrap();
    // Every agent ages; at age 3 it dies, at age 1 it spawns one child.
    sim.bind_kernel("cell", "live", |ctx, out| {
        let age = ctx.get::<u32>("age") + 1;
        out.set("age", age);
        if age == 1 {
            out.child_set("age", 0u32);
        }
        if age >= 3 {
            out.kill();
        }
    })
    .unwrap();

    let schema = sim.model().agent("cell").unwrap().schema().clone();
    sim.set_population("cell", "default", &PopulationBatch::new(&schema, 8))
        .unwrap();

    // Generation bookkeeping mirrored on the host: each step every agent
    // ages, age-1 agents spawn, age-3 agents die.
    let mut host: Vec<u32> = vec![0; 8];
    for _ in 0..6 {
        sim.step().unwrap();
        let mut next = Vec::new();
        let mut born = 0;
        for age in &host {
            let age = age + 1;
            if age == 1 {
                born += 1;
            }
            if age < 3 {
                next.push(age);
            }
        }
        next.extend(std::iter::repeat_n(0u32, born));
        host = next;
        assert_eq!(
            sim.population_count("cell", "default").unwrap(),
            host.len()
        );
    }
}

/// Buffer allocation is all-or-nothing at simulation scale: when the
/// device cannot hold the whole model, construction fails and every byte
/// handed out on the way is returned.
#[test]
fn test_allocation_failure_releases_everything() {
    let device = Arc::new(HostDevice::with_budget(4096));
    let result = Simulation::new(circles_model(), device.clone(), 1024);
    assert!(matches!(
        result,
        Err(RuntimeError::OutOfDeviceMemory { .. })
    ));
    assert_eq!(device.allocated(), 0);
}

/// Randomized sequence of output bindings, optional toggles and clears:
/// after every mutation the incremental optional-producer counters must
/// agree with a full recount.
#[test]
fn test_optional_counter_never_drifts() {
    let mut model = ModelGraph::new("fuzz");
    let agent = model.add_agent("a").unwrap();
    let functions: Vec<_> = (0..4)
        .map(|i| model.add_function(&agent, &format!("f{i}")).unwrap())
        .collect();
    let messages: Vec<_> = (0..3)
        .map(|i| {
            model
                .add_message(&format!("m{i}"), MessageKind::BruteForce)
                .unwrap()
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(2024);
    for _ in 0..500 {
        let f = &functions[rng.gen_range(0..functions.len())];
        match rng.gen_range(0..3) {
            0 => {
                let m = &messages[rng.gen_range(0..messages.len())];
                model.set_message_output(f, m).unwrap();
            }
            1 => {
                let optional = rng.gen_range(0..2) == 0;
                model.set_message_output_optional(f, optional).unwrap();
            }
            _ => model.clear_message_output(f).unwrap(),
        }
        for i in 0..3 {
            let name = format!("m{i}");
            assert_eq!(
                model.message(&name).unwrap().optional_outputs(),
                model.recount_optional_outputs(&name),
                "counter drifted for {name}"
            );
        }
    }
}

/// Allocation freezes every schema in the model: afterwards no agent or
/// message variable can be declared.
#[test]
fn test_model_frozen_after_allocation() {
    let sim = Simulation::new(circles_model(), Arc::new(HostDevice::new()), 8).unwrap();
    assert!(sim.model().agent("circle").unwrap().schema().is_frozen());
    assert!(sim.model().message("location").unwrap().schema().is_frozen());
}

/// Scheduling two functions of one agent that touch the same state into
/// one layer is rejected, in both construction orders.
#[test]
fn test_layer_state_overlap_rejected_end_to_end() {
    let mut model = ModelGraph::new("clash");
    let agent = model.add_agent("a").unwrap();
    let f1 = model.add_function(&agent, "f1").unwrap();
    let f2 = model.add_function(&agent, "f2").unwrap();
    let layer = model.add_layer();
    model.add_function_to_layer(layer, &f1).unwrap();
    assert!(matches!(
        model.add_function_to_layer(layer, &f2),
        Err(ModelError::InvalidAgentFunction { .. })
    ));

    // A second layer takes it without complaint
    let later = model.add_layer();
    model.add_function_to_layer(later, &f2).unwrap();
}

/// An unbounded plan without exit conditions is refused up front; adding
/// a condition makes the same plan legal and the run stops when it fires.
#[test]
fn test_unbounded_plan_needs_exit_condition() {
    let mut harness = TestHarness::circles(4, 1);
    let mut plan = RunPlan::new();
    plan.set_steps(0);
    assert!(matches!(
        harness.sim_mut().simulate(&plan),
        Err(RuntimeError::UnboundedRun)
    ));

    harness
        .sim_mut()
        .add_exit_condition(|view| view.step() >= 4);
    assert_eq!(harness.simulate(&plan), 4);
}

/// A stop requested from another thread is honored at a layer boundary
/// and leaves the simulation in a consistent, resumable state.
#[test]
fn test_external_stop_is_clean() {
    let mut harness = TestHarness::circles(8, 3);
    let stop = harness.sim().stop_handle();
    stop.store(true, std::sync::atomic::Ordering::SeqCst);

    harness.step();
    // The run can continue afterwards with no corruption
    harness.run_steps(3);
    assert_eq!(harness.agent_count(), 8);
    assert_eq!(harness.message_count(), 8);
}
