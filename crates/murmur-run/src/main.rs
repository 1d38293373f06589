//! Murmur Run - Executes the circles benchmark model
//!
//! Builds the classic circles model (every agent broadcasts its position,
//! then moves under attraction and repulsion from its neighbors), runs a
//! plan batch against it, and prints per-run summaries.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use murmur_model::{ElemType, MessageKind, ModelGraph};
use murmur_runtime::{
    HostDevice, PopulationBatch, PropertyValue, Result, RunPlanVector, Simulation,
};

#[derive(Parser, Debug)]
#[command(name = "murmur-run")]
#[command(about = "Run the circles benchmark model")]
struct Cli {
    /// Number of agents
    #[arg(long, default_value = "1024")]
    agents: usize,

    /// Simulation steps per run
    #[arg(long, default_value = "100")]
    steps: u64,

    /// Seed of the first run
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Number of runs; seeds are strided from --seed
    #[arg(long, default_value = "1")]
    runs: usize,

    /// Interaction radius
    #[arg(long, default_value = "2.0")]
    radius: f64,
}

fn circles_model() -> Result<ModelGraph> {
    let mut model = ModelGraph::new("circles");
    let circle = model.add_agent("circle")?;
    model.add_agent_variable(&circle, "x", ElemType::F32)?;
    model.add_agent_variable(&circle, "y", ElemType::F32)?;

    let location = model.add_message("location", MessageKind::BruteForce)?;
    model.add_message_variable(&location, "x", ElemType::F32)?;
    model.add_message_variable(&location, "y", ElemType::F32)?;

    let output = model.add_function(&circle, "output_data")?;
    model.set_message_output(&output, &location)?;
    let movement = model.add_function(&circle, "move")?;
    model.set_message_input(&movement, &location)?;

    let first = model.add_layer();
    model.add_function_to_layer(first, &output)?;
    let second = model.add_layer();
    model.add_function_to_layer(second, &movement)?;
    Ok(model)
}

fn build_simulation(agents: usize) -> Result<Simulation> {
    let mut sim = Simulation::new(circles_model()?, Arc::new(HostDevice::new()), agents)?;

    sim.bind_kernel("circle", "output_data", |ctx, out| {
        out.message_set("x", ctx.get::<f32>("x"));
        out.message_set("y", ctx.get::<f32>("y"));
    })?;

    sim.bind_kernel("circle", "move", |ctx, out| {
        let radius = ctx.scalar("radius").unwrap_or(2.0) as f32;
        let (x, y) = (ctx.get::<f32>("x"), ctx.get::<f32>("y"));
        let (mut fx, mut fy) = (0.0f32, 0.0f32);
        for msg in ctx.messages() {
            let dx = msg.get::<f32>("x") - x;
            let dy = msg.get::<f32>("y") - y;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist > 1e-6 && dist < radius {
                let force = (dist - radius * 0.5) / radius;
                fx += force * dx / dist;
                fy += force * dy / dist;
            }
        }
        out.set("x", x + fx * 0.05);
        out.set("y", y + fy * 0.05);
    })?;
    Ok(sim)
}

fn seed_population(sim: &mut Simulation, agents: usize, seed: u64) -> Result<()> {
    let schema = sim.model().agent("circle")?.schema().clone();
    let mut batch = PopulationBatch::new(&schema, agents);
    let side = (agents as f64).sqrt().ceil();
    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..agents {
        batch.set(i, "x", rng.gen_range(0.0..side) as f32)?;
        batch.set(i, "y", rng.gen_range(0.0..side) as f32)?;
    }
    sim.set_population("circle", "default", &batch)
}

fn run(cli: &Cli) -> Result<()> {
    let mut plans = RunPlanVector::new(cli.runs);
    plans
        .set_steps(cli.steps)
        .set_random_seed(cli.seed, 1)
        .set_property("radius", PropertyValue::Scalar(cli.radius));

    for (index, plan) in plans.iter().enumerate() {
        let mut sim = build_simulation(cli.agents)?;
        seed_population(&mut sim, cli.agents, plan.random_seed())?;

        let start = std::time::Instant::now();
        let executed = sim.simulate(plan)?;
        info!(
            run = index,
            seed = plan.random_seed(),
            steps = executed,
            agents = sim.population_count("circle", "default")?,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "run complete"
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur_run=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(agents = cli.agents, steps = cli.steps, runs = cli.runs, "starting");

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("run failed: {e}");
            ExitCode::FAILURE
        }
    }
}
