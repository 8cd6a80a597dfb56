use anyhow::Result;
use std::sync::mpsc::Sender;
use tracesim::{
    analysis::{InfectedCurve, Obs, RunRecorder},
    config::{Config, Policy},
    engine::Engine,
    orchestrator::{Orchestrator, Settings, StopReason},
    stats::Summary,
    worker::{Executor, InlineExecutor, RunEvent, RunRequest, RunResponse, Task, ThreadExecutor},
};

fn small_config() -> Config {
    let file = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/config.toml");
    let mut cfg = Config::from_file(file).expect("failed to load demo config");
    cfg.population = 200;
    cfg.days = 20;
    cfg.foreign_imports = 0.5;
    cfg.infection_risk = 0.2;
    cfg
}

fn settings(max_workers: usize) -> Settings {
    Settings {
        max_workers,
        base_seed: 100,
    }
}

#[test]
fn fixed_run_count_without_variance_check() {
    let mut cfg = small_config();
    cfg.runs_min = 5;
    cfg.runs_max = 5;

    let policies = [Policy::FreeMovement, Policy::Lockdown];
    let mut orch = Orchestrator::new(cfg.clone(), &policies, InlineExecutor, settings(2))
        .expect("failed to construct orchestrator");
    let mut recorder = RunRecorder::new();
    let outcomes = orch
        .run(&mut [&mut recorder as &mut dyn Obs])
        .expect("failed to run");

    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert_eq!(outcome.summaries.len(), 5);
        assert_eq!(outcome.stop, Some(StopReason::MaxRuns));
        let box_plots = outcome.box_plots.as_ref().expect("runs completed");
        assert_eq!(box_plots.healthy.n, 5);

        let seeds: Vec<u64> = outcome.summaries.iter().map(|s| s.seed).collect();
        assert_eq!(seeds, vec![100, 101, 102, 103, 104]);

        let runs = recorder.runs(outcome.policy);
        assert_eq!(runs.len(), 5);
        assert!(runs.iter().all(|run| run.len() == cfg.days as usize));
    }
}

#[test]
fn summaries_match_direct_runs() {
    let mut cfg = small_config();
    cfg.runs_min = 3;
    cfg.runs_max = 3;

    let mut orch = Orchestrator::new(cfg.clone(), &[Policy::ReputationScore], InlineExecutor, settings(1))
        .expect("failed to construct orchestrator");
    let outcomes = orch.run(&mut []).expect("failed to run");

    for summary in &outcomes[0].summaries {
        let stats = Engine::new(cfg.clone(), Policy::ReputationScore, summary.seed).run_to_end();
        let direct = Summary::from_stats(summary.run, summary.seed, &stats).expect("non-empty run");
        assert_eq!(summary, &direct);
    }
}

#[test]
fn thread_pool_matches_inline_execution() {
    let mut cfg = small_config();
    cfg.runs_min = 4;
    cfg.runs_max = 4;

    let policies = Policy::ALL;
    let mut inline = Orchestrator::new(cfg.clone(), &policies, InlineExecutor, settings(3))
        .expect("failed to construct orchestrator");
    let mut threaded = Orchestrator::new(cfg, &policies, ThreadExecutor, settings(3))
        .expect("failed to construct orchestrator");

    let mut curve = InfectedCurve::new();
    let inline = inline.run(&mut []).expect("failed to run inline");
    let threaded = threaded
        .run(&mut [&mut curve as &mut dyn Obs])
        .expect("failed to run threaded");

    for (a, b) in inline.iter().zip(&threaded) {
        assert_eq!(a.policy, b.policy);
        assert_eq!(a.summaries, b.summaries);
        assert_eq!(curve.means(b.policy).len(), 20);
    }
}

/// Posts a day for a seed nobody asked for before every real run.
struct StaleExecutor {
    inner: InlineExecutor,
}

impl Executor for StaleExecutor {
    fn submit(&mut self, req: RunRequest, tx: Sender<RunResponse>) -> Result<Task> {
        let mut bogus = Engine::new(
            Config::from_msgpack(&req.config)?,
            req.policy,
            req.seed + 1000,
        );
        let _ = tx.send(RunResponse {
            policy: req.policy,
            seed: req.seed + 1000,
            event: RunEvent::Day(bogus.next_day()),
        });
        self.inner.submit(req, tx)
    }
}

#[test]
fn stale_responses_are_ignored() {
    let mut cfg = small_config();
    cfg.runs_min = 2;
    cfg.runs_max = 2;

    let executor = StaleExecutor {
        inner: InlineExecutor,
    };
    let mut orch = Orchestrator::new(cfg.clone(), &[Policy::ExposureNotification], executor, settings(1))
        .expect("failed to construct orchestrator");
    let mut recorder = RunRecorder::new();
    let outcomes = orch
        .run(&mut [&mut recorder as &mut dyn Obs])
        .expect("failed to run");

    assert_eq!(outcomes[0].summaries.len(), 2);
    for run in recorder.runs(Policy::ExposureNotification) {
        assert_eq!(run.len(), cfg.days as usize);
    }
}

struct FailingExecutor;

impl Executor for FailingExecutor {
    fn submit(&mut self, req: RunRequest, tx: Sender<RunResponse>) -> Result<Task> {
        let _ = tx.send(RunResponse {
            policy: req.policy,
            seed: req.seed,
            event: RunEvent::Failed("out of memory".to_string()),
        });
        InlineExecutor.submit(
            RunRequest {
                config: Vec::new(),
                ..req
            },
            tx,
        )
    }
}

#[test]
fn failed_run_aborts() {
    let mut cfg = small_config();
    cfg.runs_min = 1;
    cfg.runs_max = 1;

    let mut orch = Orchestrator::new(cfg, &[Policy::FreeMovement], FailingExecutor, settings(1))
        .expect("failed to construct orchestrator");
    let error = orch.run(&mut []).expect_err("run should fail");
    assert!(format!("{error:#}").contains("out of memory"));
}

#[test]
fn reconfigure_restarts_from_scratch() {
    let mut cfg = small_config();
    cfg.runs_min = 2;
    cfg.runs_max = 2;

    let mut orch = Orchestrator::new(cfg.clone(), &[Policy::Lockdown], ThreadExecutor, settings(2))
        .expect("failed to construct orchestrator");
    cfg.days = 10;
    orch.reconfigure(cfg.clone()).expect("failed to reconfigure");

    let mut recorder = RunRecorder::new();
    let outcomes = orch
        .run(&mut [&mut recorder as &mut dyn Obs])
        .expect("failed to run");
    assert_eq!(outcomes[0].summaries.len(), 2);
    assert!(outcomes[0].summaries.iter().all(|s| s.days == 10));
    assert!(
        recorder
            .runs(Policy::Lockdown)
            .iter()
            .all(|run| run.len() == 10)
    );

    cfg.runs_max = 0;
    assert!(orch.reconfigure(cfg).is_err());
}

#[test]
fn rejects_empty_pool() {
    let cfg = small_config();
    assert!(Orchestrator::new(cfg.clone(), &[Policy::Lockdown], InlineExecutor, settings(0)).is_err());
    assert!(Orchestrator::new(cfg, &[], InlineExecutor, settings(1)).is_err());
}
