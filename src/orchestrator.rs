use crate::analysis::Obs;
use crate::config::{Config, Policy};
use crate::model::Stats;
use crate::stats::{Accumulator, OutcomeBoxPlots, Summary};
use crate::worker::{Executor, RunEvent, RunRequest, RunResponse, Task};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::mpsc::{self, Receiver, Sender},
};

/// Why a policy stopped issuing runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// The variance of the healthy share settled.
    Converged,
    /// The maximum number of runs completed.
    MaxRuns,
}

/// Completed runs of one policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub policy: Policy,
    /// Sorted by run index.
    pub summaries: Vec<Summary>,
    pub box_plots: Option<OutcomeBoxPlots>,
    pub stop: Option<StopReason>,
}

/// Run bookkeeping for one policy.
#[derive(Debug)]
pub struct PolicyRuns {
    policy: Policy,
    next_seed: u64,
    issued: usize,
    summaries: Vec<Summary>,
    prev_var: Option<f64>,
    stop: Option<StopReason>,
}

impl PolicyRuns {
    pub fn new(policy: Policy, base_seed: u64) -> Self {
        Self {
            policy,
            next_seed: base_seed,
            issued: 0,
            summaries: Vec::new(),
            prev_var: None,
            stop: None,
        }
    }

    /// Reserve the next (run index, seed) pair.
    fn issue(&mut self) -> (usize, u64) {
        let run = self.issued;
        let seed = self.next_seed;
        self.issued += 1;
        self.next_seed = self.next_seed.wrapping_add(1);
        (run, seed)
    }

    /// Record a completed run and decide whether the policy is done.
    ///
    /// Stops at `runs_max` completed runs. From `runs_min` on, stops once the
    /// population variance of the healthy share changes by no more than
    /// `variance_tolerance` of its previous value.
    pub fn record(&mut self, summary: Summary, cfg: &Config) -> Option<StopReason> {
        self.summaries.push(summary);
        let n_runs = self.summaries.len();

        if n_runs >= cfg.runs_max as usize {
            self.stop = Some(StopReason::MaxRuns);
        } else if n_runs >= cfg.runs_min as usize {
            let mut acc = Accumulator::new();
            for summary in &self.summaries {
                acc.add(summary.healthy);
            }
            let var = acc.pop_var();
            if let Some(prev_var) = self.prev_var {
                if (var - prev_var).abs() <= cfg.variance_tolerance * prev_var {
                    self.stop = Some(StopReason::Converged);
                }
            }
            log::debug!("{} variance after {n_runs} runs: {var:.4}", self.policy);
            self.prev_var = Some(var);
        }

        self.stop
    }

    pub fn summaries(&self) -> &[Summary] {
        &self.summaries
    }

    fn outcome(&self) -> PolicyOutcome {
        let mut summaries = self.summaries.clone();
        summaries.sort_by_key(|summary| summary.run);
        PolicyOutcome {
            policy: self.policy,
            box_plots: OutcomeBoxPlots::new(&summaries),
            summaries,
            stop: self.stop,
        }
    }
}

/// Orchestrator settings that do not change trajectories.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    /// Maximum number of runs in flight across all policies.
    pub max_workers: usize,
    /// Seed of each policy's first run.
    pub base_seed: u64,
}

struct PendingRun {
    policy: Policy,
    run: usize,
    seed: u64,
}

struct ActiveRun {
    policy: Policy,
    run: usize,
    seed: u64,
    stats: Vec<Stats>,
    task: Task,
}

/// Runs every policy's trajectories on a bounded pool of executors until each
/// policy converges or reaches its maximum number of runs.
pub struct Orchestrator<E: Executor> {
    cfg: Config,
    payload: Vec<u8>,
    executor: E,
    settings: Settings,
    policies: Vec<PolicyRuns>,
    pending: VecDeque<PendingRun>,
    active: Vec<ActiveRun>,
    tx: Sender<RunResponse>,
    rx: Receiver<RunResponse>,
}

impl<E: Executor> Orchestrator<E> {
    pub fn new(cfg: Config, policies: &[Policy], executor: E, settings: Settings) -> Result<Self> {
        if settings.max_workers == 0 {
            bail!("at least one worker is required");
        }
        if policies.is_empty() {
            bail!("at least one policy is required");
        }
        cfg.validate().context("failed to validate config")?;
        let payload = cfg.to_msgpack()?;
        let (tx, rx) = mpsc::channel();

        let mut orch = Self {
            cfg,
            payload,
            executor,
            settings,
            policies: policies
                .iter()
                .map(|&policy| PolicyRuns::new(policy, settings.base_seed))
                .collect(),
            pending: VecDeque::new(),
            active: Vec::new(),
            tx,
            rx,
        };
        orch.queue_initial_runs();
        Ok(orch)
    }

    /// Abandon every queued and running run and start over with `cfg`.
    pub fn reconfigure(&mut self, cfg: Config) -> Result<()> {
        cfg.validate().context("failed to validate config")?;
        let payload = cfg.to_msgpack()?;

        self.pending.clear();
        for active in self.active.drain(..) {
            active.task.terminate();
        }
        // Terminated runs may have posted before stopping.
        let n_stale = self.rx.try_iter().count();
        log::debug!("discarded {n_stale} responses from abandoned runs");

        self.cfg = cfg;
        self.payload = payload;
        for runs in &mut self.policies {
            *runs = PolicyRuns::new(runs.policy, self.settings.base_seed);
        }
        self.queue_initial_runs();
        log::info!("reconfigured, restarting {} policies", self.policies.len());
        Ok(())
    }

    /// Drive all policies to completion, feeding every day and every finished
    /// run to `observers`.
    pub fn run(&mut self, observers: &mut [&mut dyn Obs]) -> Result<Vec<PolicyOutcome>> {
        self.dispatch()?;
        while !self.active.is_empty() {
            let resp = self.rx.recv().context("response channel closed")?;
            self.handle_response(resp, observers)
                .context("failed to handle run response")?;
            self.dispatch()?;
        }
        Ok(self.policies.iter().map(PolicyRuns::outcome).collect())
    }

    fn queue_initial_runs(&mut self) {
        let runs_min = self.cfg.runs_min;
        for _ in 0..runs_min {
            for idx in 0..self.policies.len() {
                self.queue_run(idx);
            }
        }
    }

    fn queue_run(&mut self, idx: usize) {
        let runs = &mut self.policies[idx];
        if runs.stop.is_some() || runs.issued >= self.cfg.runs_max as usize {
            return;
        }
        let (run, seed) = runs.issue();
        log::debug!("queued {} run {run} with seed {seed}", runs.policy);
        self.pending.push_back(PendingRun {
            policy: runs.policy,
            run,
            seed,
        });
    }

    fn dispatch(&mut self) -> Result<()> {
        while self.active.len() < self.settings.max_workers {
            let Some(next) = self.pending.pop_front() else {
                break;
            };
            let req = RunRequest {
                config: self.payload.clone(),
                policy: next.policy,
                seed: next.seed,
            };
            let task = self
                .executor
                .submit(req, self.tx.clone())
                .with_context(|| format!("failed to start {} run {}", next.policy, next.run))?;
            self.active.push(ActiveRun {
                policy: next.policy,
                run: next.run,
                seed: next.seed,
                stats: Vec::with_capacity(self.cfg.days as usize),
                task,
            });
        }
        Ok(())
    }

    fn handle_response(&mut self, resp: RunResponse, observers: &mut [&mut dyn Obs]) -> Result<()> {
        let Some(pos) = self
            .active
            .iter()
            .position(|active| active.policy == resp.policy && active.seed == resp.seed)
        else {
            log::debug!("discarding stale {} response for seed {}", resp.policy, resp.seed);
            return Ok(());
        };

        let stats = match resp.event {
            RunEvent::Day(stats) => stats,
            RunEvent::Failed(error) => {
                bail!("{} run with seed {} failed: {error}", resp.policy, resp.seed)
            }
        };

        let active = &mut self.active[pos];
        for obs in observers.iter_mut() {
            obs.update(active.policy, active.run, &stats)
                .context("failed to update observer")?;
        }
        active.stats.push(stats);
        if active.stats.len() < self.cfg.days as usize {
            return Ok(());
        }

        let finished = self.active.swap_remove(pos);
        finished.task.terminate();
        self.complete_run(finished.policy, finished.run, finished.seed, &finished.stats, observers)
    }

    fn complete_run(
        &mut self,
        policy: Policy,
        run: usize,
        seed: u64,
        stats: &[Stats],
        observers: &mut [&mut dyn Obs],
    ) -> Result<()> {
        let Some(summary) = Summary::from_stats(run, seed, stats) else {
            return Ok(());
        };
        log::info!(
            "{policy} run {run} (seed {seed}): healthy {:.2}%, dead {:.2}%, isolated {:.2}%",
            summary.healthy,
            summary.dead,
            summary.isolated
        );
        for obs in observers.iter_mut() {
            obs.complete(policy, &summary)
                .context("failed to complete observer run")?;
        }

        let Some(idx) = self.policies.iter().position(|runs| runs.policy == policy) else {
            bail!("no run set for {policy}");
        };
        match self.policies[idx].record(summary, &self.cfg) {
            Some(reason) => {
                log::info!(
                    "{policy} stopped after {} runs ({reason:?})",
                    self.policies[idx].summaries.len()
                );
                self.cancel_policy(policy);
            }
            None => self.queue_run(idx),
        }
        Ok(())
    }

    fn cancel_policy(&mut self, policy: Policy) {
        self.pending.retain(|pending| pending.policy != policy);
        let (cancelled, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|active| active.policy == policy);
        self.active = kept;
        for active in cancelled {
            log::debug!("cancelled {policy} run {} with seed {}", active.run, active.seed);
            active.task.terminate();
        }
    }
}
