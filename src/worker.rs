use crate::config::{Config, Policy};
use crate::engine::Engine;
use crate::model::Stats;
use anyhow::{Context, Result};
use std::{
    ops::ControlFlow,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    thread::{self, JoinHandle},
};

/// Request to execute one run.
#[derive(Clone, Debug)]
pub struct RunRequest {
    /// MessagePack-encoded [`Config`].
    pub config: Vec<u8>,
    pub policy: Policy,
    pub seed: u64,
}

#[derive(Clone, Debug)]
pub enum RunEvent {
    Day(Stats),
    Failed(String),
}

/// One message from a run, tagged with the run's policy and seed.
#[derive(Clone, Debug)]
pub struct RunResponse {
    pub policy: Policy,
    pub seed: u64,
    pub event: RunEvent,
}

/// Somewhere runs can be executed.
///
/// A submitted run posts one [`RunEvent::Day`] per simulated day to the
/// response channel until it finishes or its [`Task`] is terminated.
pub trait Executor {
    fn submit(&mut self, req: RunRequest, tx: Sender<RunResponse>) -> Result<Task>;
}

/// Handle to a submitted run.
pub struct Task {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Task {
    /// Stop the run and wait for its thread, if any, to exit.
    pub fn terminate(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("run thread panicked");
            }
        }
    }
}

/// Runs each request on its own OS thread.
#[derive(Default)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn submit(&mut self, req: RunRequest, tx: Sender<RunResponse>) -> Result<Task> {
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", req.policy, req.seed))
            .spawn(move || execute(req, &thread_cancel, &tx))
            .context("failed to spawn run thread")?;
        Ok(Task {
            cancel,
            handle: Some(handle),
        })
    }
}

/// Runs each request to completion on the calling thread.
#[derive(Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn submit(&mut self, req: RunRequest, tx: Sender<RunResponse>) -> Result<Task> {
        let cancel = Arc::new(AtomicBool::new(false));
        execute(req, &cancel, &tx);
        Ok(Task {
            cancel,
            handle: None,
        })
    }
}

/// Decode the request, run it and post every day's stats.
///
/// Errors and panics are posted as [`RunEvent::Failed`] instead.
pub fn execute(req: RunRequest, cancel: &AtomicBool, tx: &Sender<RunResponse>) {
    let RunRequest {
        config,
        policy,
        seed,
    } = req;

    report_failure(policy, seed, tx, || {
        let cfg = Config::from_msgpack(&config)?;
        let mut engine = Engine::new(cfg, policy, seed);
        engine.run(|stats| {
            if cancel.load(Ordering::Relaxed) {
                return ControlFlow::Break(());
            }
            let resp = RunResponse {
                policy,
                seed,
                event: RunEvent::Day(stats),
            };
            match tx.send(resp) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        });
        Ok(())
    });
}

fn report_failure<F>(policy: Policy, seed: u64, tx: &Sender<RunResponse>, body: F)
where
    F: FnOnce() -> Result<()>,
{
    let error = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => return,
        Ok(Err(error)) => format!("{error:#}"),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|msg| msg.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            format!("run panicked: {msg}")
        }
    };
    log::debug!("{policy} run with seed {seed} failed: {error}");
    // The receiver may be gone already.
    let _ = tx.send(RunResponse {
        policy,
        seed,
        event: RunEvent::Failed(error),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn failure(rx: &mpsc::Receiver<RunResponse>) -> String {
        match rx.try_recv() {
            Ok(RunResponse {
                event: RunEvent::Failed(error),
                ..
            }) => error,
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn panicking_run_reports_failure() {
        let (tx, rx) = mpsc::channel();
        report_failure(Policy::Lockdown, 3, &tx, || panic!("group of zero"));
        let error = failure(&rx);
        assert!(error.contains("group of zero"), "{error}");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn undecodable_config_reports_failure() {
        let (tx, rx) = mpsc::channel();
        let req = RunRequest {
            config: vec![0xc1],
            policy: Policy::FreeMovement,
            seed: 8,
        };
        execute(req, &AtomicBool::new(false), &tx);
        assert!(failure(&rx).contains("failed to deserialize config"));
    }

    #[test]
    fn thread_executor_reports_panics_without_hanging() {
        let (tx, rx) = mpsc::channel();
        let task = Task {
            cancel: Arc::new(AtomicBool::new(false)),
            handle: Some(thread::spawn(move || {
                report_failure(Policy::ReputationScore, 5, &tx, || {
                    let journal: Vec<usize> = Vec::new();
                    let _ = journal[journal.len()];
                    Ok(())
                })
            })),
        };
        task.terminate();
        assert!(failure(&rx).contains("run panicked"));
    }
}
