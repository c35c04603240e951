use anyhow::{Context, Result};
use clap::Parser;
use gridworld_core::{
    CellPos, CoProcessorRegistry, Direction, EntityData, EntityKind, WorldConfig,
};
use gridworld_coproc::register_wander;
use gridworld_host::{Simulation, SimulationStatus};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "gridworld",
    version,
    about = "Run a grid-addressed multi-entity simulation"
)]
struct Cli {
    /// JSON world configuration file; overrides --width/--height/--seed.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Grid width in cells.
    #[arg(long, default_value_t = 48)]
    width: u32,

    /// Grid height in cells.
    #[arg(long, default_value_t = 32)]
    height: u32,

    /// RNG seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Ticks to execute before exiting.
    #[arg(long, default_value_t = 600)]
    ticks: u64,

    /// Mobile agents to scatter at startup.
    #[arg(long, default_value_t = 24)]
    agents: u32,

    /// Rocks to scatter at startup.
    #[arg(long, default_value_t = 40)]
    rocks: u32,

    /// Resources to scatter at startup.
    #[arg(long, default_value_t = 16)]
    resources: u32,

    /// Decide agent actions with the wandering co-processor backend.
    #[arg(long)]
    wander: bool,

    /// Restore this snapshot file before running (skips scatter).
    #[arg(long)]
    load: Option<PathBuf>,

    /// Write a snapshot file after the run.
    #[arg(long)]
    save: Option<PathBuf>,

    /// Emit a progress line every N ticks (0 disables).
    #[arg(long, default_value_t = 100)]
    report_every: u64,

    /// Print the final status as JSON on stdout.
    #[arg(long)]
    status_json: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut sim = bootstrap(&cli)?;
    info!(
        width = cli.width,
        height = cli.height,
        ticks = cli.ticks,
        "Starting gridworld simulation shell"
    );

    sim.start();
    for _ in 0..cli.ticks {
        let report = sim.step();
        if cli.report_every > 0 && report.tick.0.is_multiple_of(cli.report_every) {
            info!(
                tick = report.tick.0,
                moved = report.moved,
                turned = report.turned,
                held = report.held,
                fallbacks = report.coproc_fallbacks,
                "progress"
            );
        }
        if report.coproc_fallbacks > 0 {
            warn!(
                tick = report.tick.0,
                fallbacks = report.coproc_fallbacks,
                "co-processor cycles fell back to the default rule"
            );
        }
    }
    sim.stop();

    if let Some(path) = &cli.save {
        sim.save_snapshot(path)?;
    }

    let status = SimulationStatus::from(&sim);
    info!(
        tick = status.tick,
        agents = status.agents,
        resources = status.resources,
        policy = %status.policy,
        "Run complete"
    );
    if cli.status_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn bootstrap(cli: &Cli) -> Result<Simulation> {
    let config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("config file {} is not valid JSON", path.display()))?
        }
        None => WorldConfig {
            width: cli.width,
            height: cli.height,
            rng_seed: cli.seed,
            ..WorldConfig::default()
        },
    };

    let mut sim = if cli.wander {
        let mut registry = CoProcessorRegistry::new();
        let key = register_wander(&mut registry);
        Simulation::with_coprocessor(config, &registry, key)?
    } else {
        Simulation::new(config)?
    };

    if let Some(path) = &cli.load {
        sim.load_snapshot(path)?;
        return Ok(sim);
    }

    scatter(&mut sim, cli);
    Ok(sim)
}

fn scatter(sim: &mut Simulation, cli: &Cli) {
    let width = sim.world().grid().width();
    let height = sim.world().grid().height();
    let seed = sim.world().config().rng_seed.unwrap_or(0xFACA_DE00);
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut place = |target: &mut Simulation, kind: EntityKind, count: u32, energy: u32| {
        let mut placed = 0;
        // Rejection sampling; dense grids simply end up with fewer entities.
        for _ in 0..count * 8 {
            if placed == count {
                break;
            }
            let pos = CellPos::new(rng.random_range(0..width), rng.random_range(0..height));
            let heading = Direction::ALL[rng.random_range(0..8)];
            let data = EntityData::facing(pos, heading).with_energy(energy, energy);
            if target.world_mut().spawn(kind, data).is_ok() {
                placed += 1;
            }
        }
        placed
    };

    let agents = place(sim, EntityKind::MobileAgent, cli.agents, 0);
    let rocks = place(sim, EntityKind::Rock, cli.rocks, 0);
    let resources = place(sim, EntityKind::Resource, cli.resources, 10);
    info!(agents, rocks, resources, "scattered starting entities");
}
