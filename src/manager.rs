use crate::analysis::{InfectedCurve, Obs, PolicyReport, RunRecorder};
use crate::config::{Config, Policy};
use crate::orchestrator::{Orchestrator, Settings};
use crate::worker::ThreadExecutor;
use anyhow::{Context, Result};
use glob::glob;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Number of draws behind a distribution histogram.
const SAMPLE_DRAWS: usize = 100_000;

pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg = Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::debug!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    /// Run every requested policy to convergence and save one report each.
    pub fn run_policies(&self, policies: &[Policy], workers: usize, seed: Option<u64>) -> Result<()> {
        let base_seed = match seed {
            Some(seed) => seed,
            None => {
                let mut rng = ChaCha12Rng::try_from_os_rng().context("failed to seed from OS")?;
                rng.next_u64()
            }
        };
        log::info!("running {policies:?} on {workers} workers from seed {base_seed}");

        let settings = Settings {
            max_workers: workers,
            base_seed,
        };
        let mut orch = Orchestrator::new(self.cfg.clone(), policies, ThreadExecutor, settings)
            .context("failed to construct orchestrator")?;

        let mut recorder = RunRecorder::new();
        let mut curve = InfectedCurve::new();
        let outcomes = orch
            .run(&mut [&mut recorder as &mut dyn Obs, &mut curve])
            .context("failed to run policies")?;

        for outcome in outcomes {
            let file = self.results_file(outcome.policy);
            let report = PolicyReport::new(outcome, &recorder, &curve);
            report.log();
            report
                .save(&file)
                .with_context(|| format!("failed to save {file:?}"))?;
            log::info!("saved {file:?}");
        }

        Ok(())
    }

    /// Print a histogram of one configured distribution as CSV.
    pub fn sample_distribution(&self, name: &str) -> Result<()> {
        let dist = self
            .cfg
            .distribution(name)
            .with_context(|| format!("no distribution named {name:?}"))?;
        log::info!("sampling {name} ({dist:?}), estimated mean {:.3}", dist.estimate_mean());

        let mut out = io::stdout().lock();
        writeln!(out, "Value,Count").context("failed to write histogram")?;
        for (val, count) in dist.histogram(SAMPLE_DRAWS) {
            writeln!(out, "{val},{count}").context("failed to write histogram")?;
        }
        Ok(())
    }

    pub fn clean_sim(&self) -> Result<()> {
        let pattern = self.sim_dir.join("results-*.msgpack");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        for file in glob(pattern).context("failed to glob results files")? {
            let file = file.context("failed to read glob entry")?;
            fs::remove_file(&file).with_context(|| format!("failed to remove {file:?}"))?;
            log::info!("removed {file:?}");
        }
        Ok(())
    }

    pub fn results_file(&self, policy: Policy) -> PathBuf {
        self.sim_dir.join(format!("results-{policy}.msgpack"))
    }
}
