use std::fs;
use std::path::PathBuf;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use env_logger::{Builder, Env};
use log::{error, info};

use hardchain::core::domain::{
    InteractionSpec, Params, Species, SystemDefinition, ThermostatKind,
};
use hardchain::driver::runner::Runner;
use hardchain::driver::{RunEvent, RunStats};
use hardchain::engine::potential::PairLaw;

// --- CLI Definitions ---

#[derive(Parser, Debug)]
#[command(author, version, about = "Event-driven hard-particle and chain dynamics", long_about = None)]
struct Args {
    /// JSON system definition; overrides every model flag below
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Built-in model (hard-sphere, square-well, chain)
    #[arg(short, long, default_value = "hard-sphere")]
    model: String,

    /// Number of particles
    #[arg(short, long, default_value_t = 256)]
    atoms: usize,

    /// Cubic box edge (reduced units)
    #[arg(short, long, default_value_t = 10.0)]
    box_size: f64,

    /// Collisions to execute (ignored when --duration is given)
    #[arg(short, long, default_value_t = 10_000)]
    events: u64,

    /// Simulation time to advance instead of an event count
    #[arg(short, long)]
    duration: Option<f64>,

    /// Initial and thermostat temperature (kB = 1)
    #[arg(short, long, default_value_t = 1.0)]
    temperature: f64,

    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Thermostat (none, scaling, andersen, andersen-single)
    #[arg(long, default_value = "none")]
    thermostat: String,

    /// Worker threads for bulk prediction
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Progress report interval in collisions (0 disables)
    #[arg(long, default_value_t = 1_000)]
    report_every: u64,
}

// --- Initialization Helpers ---

fn create_default_system(args: &Args) -> Result<SystemDefinition> {
    let thermostat = match args.thermostat.to_lowercase().as_str() {
        "none" => ThermostatKind::None,
        "scaling" | "velocity-scaling" => ThermostatKind::VelocityScaling,
        "andersen" => ThermostatKind::Andersen,
        "andersen-single" => ThermostatKind::AndersenSingle,
        other => return Err(anyhow!("unknown thermostat '{}'", other)),
    };

    // Index 0 = the only species; chains give it two bond slots
    let (valence, interactions) = match args.model.to_lowercase().as_str() {
        "hard-sphere" | "hs" => (0, vec![]),
        "square-well" | "sw" => (
            0,
            vec![InteractionSpec {
                species: (0, 0),
                law: PairLaw::SquareWell {
                    core: 1.0,
                    well: 1.5,
                    depth: 1.0,
                },
            }],
        ),
        "chain" => (
            2,
            vec![InteractionSpec {
                species: (0, 0),
                law: PairLaw::BondingWell {
                    core: 1.0,
                    well: 1.5,
                    depth: 1.0,
                },
            }],
        ),
        other => return Err(anyhow!("unknown model '{}'", other)),
    };

    let monomer = Species {
        symbol: "M".to_string(),
        mass: 1.0,
        diameter: 1.0,
        valence,
        fixed: false,
    };

    let params = Params {
        seed: args.seed,
        threads: args.threads,
        atom_counts: vec![args.atoms],
        box_size: [args.box_size; 3],
        temperature: args.temperature,
        thermostat,
        events: args.events,
        duration: args.duration,
        report_interval: args.report_every,
        ..Default::default()
    };

    Ok(SystemDefinition {
        species: vec![monomer],
        interactions,
        params,
    })
}

fn load_system(args: &Args) -> Result<SystemDefinition> {
    match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            SystemDefinition::from_json(&text)
                .with_context(|| format!("Invalid system definition in {}", path.display()))
        }
        None => create_default_system(args),
    }
}

fn print_progress(stats: &RunStats) {
    info!(
        "events {:>10}  t {:>12.4}  E {:>14.6}  T {:>8.4}  bonds {:>6}  conv {:>6.3}  ({:.0} ev/s)",
        stats.events,
        stats.time,
        stats.total_energy,
        stats.temperature,
        stats.bonds,
        stats.conversion,
        stats.event_rate()
    );
}

// --- Main ---

fn main() -> Result<()> {
    // 1. Logging & Parsing
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // 2. Initialize System
    let system = load_system(&args)?;
    info!(
        "{} species, {} interaction override(s), box {:?}",
        system.species.len(),
        system.interactions.len(),
        system.params.box_size
    );

    // 3. Spawn Runner Thread
    let (tx, rx) = unbounded();
    let threads = system.params.threads;

    let worker = thread::Builder::new()
        .name("Runner-Worker".to_string())
        .spawn(move || -> hardchain::Result<RunStats> {
            // Rayon pool for the bulk prediction pass
            let _ = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global();

            let mut runner = Runner::from_definition(&system)?;
            runner.run(&tx)
        })
        .context("Failed to spawn runner thread")?;

    // 4. Event Loop (ends when the worker drops its sender)
    for event in rx.iter() {
        match event {
            RunEvent::Log(msg) => info!("{}", msg),
            RunEvent::Progress(stats) => print_progress(&stats),
            RunEvent::Finished(stats) => {
                print_progress(&stats);
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
    }

    match worker.join() {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            error!("{}", e);
            Err(anyhow!(e)).context("Simulation failed")
        }
        Err(_) => Err(anyhow!("runner thread panicked")),
    }
}
