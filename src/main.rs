use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{num::NonZeroUsize, path::PathBuf, thread};
use tracesim::{config::Policy, manager::Manager};

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    /// Directory holding config.toml and the results files.
    #[arg(long)]
    sim_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run policies until their outcomes converge.
    Run {
        /// Policy to run (repeatable, defaults to all).
        #[arg(long, value_enum)]
        policy: Vec<Policy>,

        /// Maximum number of concurrent runs (defaults to the available parallelism).
        #[arg(long)]
        workers: Option<usize>,

        /// Seed of each policy's first run (defaults to a random seed).
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print a histogram of a configured distribution.
    Sample {
        #[arg(long)]
        dist: String,
    },

    Clean,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(&args.sim_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Run {
            policy,
            workers,
            seed,
        } => {
            let mut policies = if policy.is_empty() {
                Policy::ALL.to_vec()
            } else {
                policy
            };
            policies.sort();
            policies.dedup();
            let workers = match workers {
                Some(workers) => workers,
                None => thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1),
            };
            mgr.run_policies(&policies, workers, seed)?
        }
        Command::Sample { dist } => mgr.sample_distribution(&dist)?,
        Command::Clean => mgr.clean_sim()?,
    }

    Ok(())
}
