#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::process::exit;

use clap::{Args, Parser, Subcommand};
use log::{error, info};

use crate::config::Scenario;
use crate::market::AllocPool;
use crate::sim::Simulation;
use crate::telemetry::{
    ev_snapshot_items, ev_snapshot_values, fast_snapshot_items, fast_snapshot_values,
    slow_snapshot_items, slow_snapshot_values, SnapshotWriter, TripLog,
};
use crate::timer::Timer;
use crate::vehicle::BattCorrPool;

mod col;
mod config;
mod curve;
mod error;
mod market;
mod primitives;
mod sim;
mod spatial;
mod station;
mod telemetry;
mod test;
mod timer;
mod traffic;
mod vehicle;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Simulator for charging and vehicle-to-grid scheduling of electric vehicle fleets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
enum Commands {
    #[command(about = "Run a scenario file")]
    Run(RunArgs),

    #[command(about = "Run a seeded random one-day scenario")]
    RunRandom(RunRandomArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    #[arg(short = 'i', long, default_value = "scenario.json", help = "The scenario file.")]
    scenario: String,

    #[arg(
        short = 'o',
        long,
        default_value = "result",
        help = "The directory to write the event log and snapshots to."
    )]
    out_dir: String,

    #[arg(short = 'b', long, default_value_t = 0, help = "Begin time, seconds.")]
    begin: i64,

    #[arg(short = 'e', long, default_value_t = 172_800, help = "End time, seconds.")]
    end: i64,

    #[arg(short = 's', long, default_value_t = 10, help = "Step length, seconds.")]
    step: i64,

    #[arg(long, help = "Also write per-vehicle snapshots (large).")]
    log_ev: bool,
}

fn main_run(args: &RunArgs) {
    let scenario = Scenario::load(Path::new(&args.scenario)).unwrap_or_else(|it| {
        error!("Could not load scenario {}:\n{it}", args.scenario);
        exit(1);
    });

    let out_dir = Path::new(&args.out_dir);
    fs::create_dir_all(out_dir).unwrap_or_else(|it| {
        error!("Could not create output directory {}: {it}", args.out_dir);
        exit(1);
    });

    let corr_pool = BattCorrPool::with_defaults();
    let alloc_pool = AllocPool::with_defaults();
    let parts = scenario.build(&corr_pool, &alloc_pool).unwrap_or_else(|it| {
        error!("Could not build scenario:\n{it}");
        exit(1);
    });
    info!("Number vehicles: {}", parts.fleet.len());
    info!("Number fast stations: {}", parts.fast.len());
    info!("Number slow stations: {}", parts.slow.stations().len());

    let trip_log = TripLog::create(&out_dir.join("trips.log")).unwrap_or_else(|it| {
        error!("Could not open the trip log: {it}");
        exit(1);
    });
    let mut fast_stats = SnapshotWriter::create(
        &out_dir.join("fcs.csv"),
        fast_snapshot_items(&parts.fast),
    )
    .unwrap_or_else(|it| {
        error!("Could not open fcs.csv: {it}");
        exit(1);
    });
    let mut slow_stats = SnapshotWriter::create(
        &out_dir.join("scs.csv"),
        slow_snapshot_items(&parts.slow),
    )
    .unwrap_or_else(|it| {
        error!("Could not open scs.csv: {it}");
        exit(1);
    });
    let mut ev_stats = if args.log_ev {
        let w = SnapshotWriter::create(&out_dir.join("ev.csv"), ev_snapshot_items(&parts.fleet))
            .unwrap_or_else(|it| {
                error!("Could not open ev.csv: {it}");
                exit(1);
            });
        Some(w)
    } else {
        None
    };

    let mut sim = Simulation::new(
        args.begin,
        args.end,
        args.step,
        parts.fleet,
        parts.fast,
        parts.slow,
        parts.traffic,
        Some(trip_log),
    );
    sim.start().unwrap_or_else(|it| {
        error!("Could not start the simulation:\n{it}");
        exit(1);
    });

    let timer = Timer::started();
    let mut last_report = 0;
    while sim.time() < sim.end_time() {
        sim.step(None).unwrap_or_else(|it| {
            error!("Simulation failed at t = {}:\n{it}", sim.time());
            exit(1);
        });
        fast_stats.record(sim.time(), &fast_snapshot_values(sim.fast(), sim.time()));
        slow_stats.record(sim.time(), &slow_snapshot_values(sim.slow(), sim.time()));
        if let Some(w) = ev_stats.as_mut() {
            w.record(sim.time(), &ev_snapshot_values(sim.fleet()));
        }
        if timer.elapsed_secs() > last_report {
            last_report = timer.elapsed_secs();
            info!("t = {}/{} ({last_report}s)", sim.time(), sim.end_time());
        }
    }
    sim.stop().unwrap_or_else(|it| {
        error!("Could not stop the simulation:\n{it}");
        exit(1);
    });
    fast_stats.flush();
    slow_stats.flush();
    if let Some(w) = ev_stats.as_mut() {
        w.flush();
    }
    info!("Finished after {}s", timer.elapsed_secs());
}

#[derive(Args, Clone, Debug)]
struct RunRandomArgs {
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(short = 'n', long, default_value_t = 50, help = "Number of vehicles.")]
    vehicles: usize,

    #[arg(long, default_value_t = 5, help = "Number of fast stations.")]
    fast: usize,

    #[arg(long, default_value_t = 10, help = "Number of slow stations.")]
    slow: usize,
}

fn main_run_random(args: &RunRandomArgs) {
    test::random_samples::run_samples(args.seed, args.vehicles, args.fast, args.slow)
        .unwrap_or_else(|it| {
            error!("Random sample failed:\n{it}");
            exit(1);
        });
}

fn main() {
    env_logger::builder().parse_env("LOG").init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => main_run(&args),
        Commands::RunRandom(args) => main_run_random(&args),
    }
}
