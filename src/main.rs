//! Twoport - parallel equation assembly benchmark
//!
//! Builds a synthetic battery pack and assembles its equation systems for a
//! number of steps on the chosen transport.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=debug twoport --threads 4 --branches 8 --cells 24 --steps 10
//! twoport --threads --steps 100
//! ```

use clap::Parser;
use log::info;
use nalgebra::DVector;
use twoport_core::{
    error::{Result, TwoportError},
    network::{battery_pack, CellParameters},
    Simulation, SimulationConfig, Transport, DEFAULT_TIME_STEP,
};

/// Parallel equation assembly for battery-pack networks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Shared-memory transport with N worker threads (one per CPU without N)
    #[arg(long, value_name = "N")]
    threads: Option<Option<usize>>,

    /// Distributed transport with N worker ranks
    #[arg(long, value_name = "N")]
    processes: Option<usize>,

    /// Serial cells per branch
    #[arg(long, default_value_t = 12)]
    cells: usize,

    /// Parallel branches
    #[arg(long, default_value_t = 4)]
    branches: usize,

    /// Number of steps
    #[arg(long, default_value_t = 10)]
    steps: usize,

    /// Load current in amperes
    #[arg(long, default_value_t = 10.0)]
    current: f64,

    /// Time step in seconds
    #[arg(long, default_value_t = DEFAULT_TIME_STEP)]
    dt: f64,
}

impl Args {
    fn transport(&self) -> Result<Transport> {
        match (self.threads, self.processes) {
            (Some(_), Some(_)) => Err(TwoportError::invalid_config(
                "--threads and --processes are mutually exclusive",
            )),
            (Some(Some(n)), None) => Ok(Transport::Threads(n)),
            (Some(None), None) => Ok(Transport::threads_per_cpu()),
            (None, Some(n)) => Ok(Transport::Processes(n)),
            (None, None) => Ok(Transport::Serial),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.cells == 0 || args.branches == 0 {
        return Err(TwoportError::invalid_config("the pack needs at least one cell and one branch"));
    }

    let config = SimulationConfig::new()
        .with_transport(args.transport()?)
        .with_dt(args.dt)
        .with_initial_current(args.current)
        .with_steps(args.steps);

    let network = battery_pack(args.branches, args.cells, &CellParameters::default());
    let mut simulation = Simulation::new(config, network)?;
    info!("Workload per worker: {:?}", simulation.workload());

    let state = DVector::zeros(simulation.state_count() + 1);
    for _ in 0..simulation.config().steps {
        let report = simulation.step(state.clone())?;
        println!(
            "step {:>4}  U = {:>12.6} V  nnz Dgl = {:>6}  nnz Alg = {:>6}  ({:?})",
            report.step, report.root_voltage, report.dgl_nnz, report.alg_nnz, report.elapsed
        );
    }

    Ok(())
}
