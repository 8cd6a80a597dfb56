use crate::config::Policy;
use crate::model::Stats;
use crate::orchestrator::{PolicyOutcome, StopReason};
use crate::stats::{Accumulator, OutcomeBoxPlots, Summary};
use anyhow::{Context, Result};
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Observer of the day and run streams produced by the orchestrator.
///
/// Days of runs that are later cancelled are also seen by `update`; only runs
/// that reach `complete` count.
pub trait Obs {
    fn update(&mut self, policy: Policy, run: usize, stats: &Stats) -> Result<()>;

    fn complete(&mut self, _policy: Policy, _summary: &Summary) -> Result<()> {
        Ok(())
    }
}

/// Keeps the daily stats of every completed run.
#[derive(Default)]
pub struct RunRecorder {
    partial: BTreeMap<(Policy, usize), Vec<Stats>>,
    completed: BTreeMap<(Policy, usize), Vec<Stats>>,
}

impl RunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed runs of `policy`, by run index.
    pub fn runs(&self, policy: Policy) -> Vec<Vec<Stats>> {
        self.completed
            .range((policy, 0)..=(policy, usize::MAX))
            .map(|(_, stats)| stats.clone())
            .collect()
    }
}

impl Obs for RunRecorder {
    fn update(&mut self, policy: Policy, run: usize, stats: &Stats) -> Result<()> {
        self.partial
            .entry((policy, run))
            .or_default()
            .push(stats.clone());
        Ok(())
    }

    fn complete(&mut self, policy: Policy, summary: &Summary) -> Result<()> {
        let key = (policy, summary.run);
        let stats = self
            .partial
            .remove(&key)
            .with_context(|| format!("no days recorded for {policy} run {}", summary.run))?;
        self.completed.insert(key, stats);
        Ok(())
    }
}

/// Per-day mean of the infected count over completed runs.
#[derive(Default)]
pub struct InfectedCurve {
    partial: BTreeMap<(Policy, usize), Vec<u32>>,
    acc_vecs: BTreeMap<Policy, Vec<Accumulator>>,
}

impl InfectedCurve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn means(&self, policy: Policy) -> Vec<f64> {
        self.acc_vecs
            .get(&policy)
            .map(|acc_vec| acc_vec.iter().map(Accumulator::mean).collect())
            .unwrap_or_default()
    }
}

impl Obs for InfectedCurve {
    fn update(&mut self, policy: Policy, run: usize, stats: &Stats) -> Result<()> {
        self.partial
            .entry((policy, run))
            .or_default()
            .push(stats.infected);
        Ok(())
    }

    fn complete(&mut self, policy: Policy, summary: &Summary) -> Result<()> {
        let infected = self
            .partial
            .remove(&(policy, summary.run))
            .with_context(|| format!("no days recorded for {policy} run {}", summary.run))?;
        let acc_vec = self.acc_vecs.entry(policy).or_default();
        if acc_vec.len() < infected.len() {
            acc_vec.resize_with(infected.len(), Accumulator::new);
        }
        for (acc, &val) in acc_vec.iter_mut().zip(&infected) {
            acc.add(f64::from(val));
        }
        Ok(())
    }
}

/// Everything kept about one policy's runs.
#[derive(Debug, Serialize, Deserialize)]
pub struct PolicyReport {
    pub policy: Policy,
    pub stop: Option<StopReason>,
    pub summaries: Vec<Summary>,
    pub box_plots: Option<OutcomeBoxPlots>,
    /// Mean infected count per day.
    pub infected_curve: Vec<f64>,
    /// Daily stats of each run, by run index.
    pub runs: Vec<Vec<Stats>>,
}

impl PolicyReport {
    pub fn new(outcome: PolicyOutcome, recorder: &RunRecorder, curve: &InfectedCurve) -> Self {
        Self {
            policy: outcome.policy,
            stop: outcome.stop,
            infected_curve: curve.means(outcome.policy),
            runs: recorder.runs(outcome.policy),
            summaries: outcome.summaries,
            box_plots: outcome.box_plots,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write_named(&mut writer, self).context("failed to serialize report")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let reader = BufReader::new(file);
        let report = decode::from_read(reader).context("failed to deserialize report")?;
        Ok(report)
    }

    /// Log the box plots, one line per outcome.
    pub fn log(&self) {
        let Some(box_plots) = &self.box_plots else {
            log::info!("{}: no completed runs", self.policy);
            return;
        };
        let rows = [
            ("healthy", &box_plots.healthy),
            ("infected", &box_plots.infected),
            ("dead", &box_plots.dead),
            ("isolated", &box_plots.isolated),
        ];
        for (name, plot) in rows {
            log::info!(
                "{} {name:>8}: min {:6.2} q1 {:6.2} median {:6.2} q3 {:6.2} max {:6.2} (n = {}, {} outliers)",
                self.policy,
                plot.min,
                plot.q1,
                plot.median,
                plot.q3,
                plot.max,
                plot.n,
                plot.outliers.len()
            );
        }
    }
}
