//! The run poller: drives every non-terminal run forward by one status
//! transition per pass.


use std::time::Duration;

use ahash::{HashSet, HashSetExt};
use error_stack::{Report, ResultExt};
use gridmill_store::StoreError;
use thiserror::Error;
use tracing::{event, instrument, Level};

use crate::batch::{BatchError, RemoteStatus};
use crate::entity::{Run, RunStatus, VIEW_RUNS_BY_STATUS};
use crate::Context;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to enumerate runs")]
    View,
    #[error("storage operation failed")]
    Store,
    #[error("batch system operation failed")]
    Batch,
    #[error("run has no remote handle")]
    MissingHandle,
    #[error("remote job reported failure")]
    RemoteFailed,
}

/// Poller tuning.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between polling passes.
    pub tick: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
        }
    }
}

/// What one polling pass touched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    /// Non-terminal entities examined.
    pub polled: usize,
    /// Entities that changed status this pass.
    pub advanced: usize,
    /// Entities that dropped into a terminal error this pass.
    pub errored: usize,
}

/// Scans all in-flight runs and advances each one through the status table,
/// submitting, polling and retrieving against the batch client. Runs are
/// strictly independent: one run's failure is recorded on that run and the
/// pass carries on.
pub struct Scheduler {
    cx: Context,
    config: PollerConfig,
}

impl Scheduler {
    pub fn new(cx: Context, config: PollerConfig) -> Self {
        Self { cx, config }
    }

    /// One full polling pass over every non-terminal run. Each run makes at
    /// most one status transition; each transition costs one round trip to
    /// the batch system, mirroring the one-call-per-job query model of the
    /// backends this fronts.
    #[instrument(level = "debug", skip(self))]
    pub async fn run_once(&self) -> Result<PassStats, Report<SchedulerError>> {
        let mut stats = PassStats::default();
        // A run that advances early in the pass (say READY -> RUNNING) shows
        // up again under its new status view; it gets its next transition
        // next pass, not this one.
        let mut seen = HashSet::new();
        for status in RunStatus::pollable() {
            let docs = self
                .cx
                .store()
                .view(VIEW_RUNS_BY_STATUS, status.as_str())
                .await
                .change_context(SchedulerError::View)?;
            for doc in docs {
                let id = doc.id;
                if !seen.insert(id) {
                    continue;
                }
                let mut run = match Run::from_document(doc) {
                    Ok(run) => run,
                    Err(report) => {
                        event!(Level::ERROR, run = %id, error = ?report, "unreadable run record");
                        stats.errored += 1;
                        continue;
                    }
                };
                if run.status() != status {
                    // Already moved by an earlier pass entry (shared-run dedup)
                    // or a concurrent kill; the view key was stale.
                    continue;
                }
                stats.polled += 1;
                let dirty = match self.poll_run(&mut run).await {
                    Ok(advanced) => {
                        if advanced {
                            stats.advanced += 1;
                        }
                        advanced
                    }
                    Err(report) => {
                        stats.errored += 1;
                        event!(Level::ERROR, run = %id, error = ?report, "run errored");
                        run.set_error(format!("{report:?}"));
                        true
                    }
                };
                if dirty {
                    self.persist(run).await;
                }
            }
        }
        Ok(stats)
    }

    /// Poll forever, sleeping [`PollerConfig::tick`] between passes, until
    /// the shutdown channel fires.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), Report<SchedulerError>> {
        loop {
            let stats = self.run_once().await?;
            if stats.polled > 0 {
                event!(
                    Level::DEBUG,
                    polled = stats.polled,
                    advanced = stats.advanced,
                    errored = stats.errored,
                    "poll pass complete"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick) => {}
                _ = shutdown.changed() => {
                    event!(Level::INFO, "scheduler shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Handle one run according to its status. Auth failures are routed to
    /// the `Unreachable`/`Notified` loop in here; every other error
    /// propagates and becomes that run's terminal `Error`.
    async fn poll_run(&self, run: &mut Run) -> Result<bool, Report<SchedulerError>> {
        match run.status() {
            RunStatus::Ready => {
                let files = run
                    .load_input_files(&self.cx)
                    .await
                    .change_context(SchedulerError::Store)?;
                match self.cx.batch().submit(&files, run.params()).await {
                    Ok(handle) => {
                        event!(Level::INFO, run = %run.id(), %handle, "submitted run");
                        run.set_remote_handle(handle);
                        run.advance(RunStatus::Running);
                        Ok(true)
                    }
                    Err(report) if is_auth(&report) => {
                        run.advance(RunStatus::Unreachable);
                        Ok(true)
                    }
                    Err(report) => Err(report.change_context(SchedulerError::Batch)),
                }
            }
            RunStatus::Running => {
                let handle = self.handle_of(run)?;
                match self.cx.batch().status(&handle).await {
                    Ok(RemoteStatus::Queued | RemoteStatus::Running) => Ok(false),
                    Ok(RemoteStatus::Finished) => {
                        run.advance(RunStatus::Finished);
                        Ok(true)
                    }
                    Ok(RemoteStatus::Failed) => Err(Report::new(SchedulerError::RemoteFailed)
                        .attach_printable(format!("remote job {handle} reported failure"))),
                    Err(report) if is_auth(&report) => {
                        run.advance(RunStatus::Unreachable);
                        Ok(true)
                    }
                    Err(report) => Err(report.change_context(SchedulerError::Batch)),
                }
            }
            RunStatus::Finished => {
                // Persist `Retrieving` before fetching so a crash mid-fetch
                // leaves a visibly in-flight run, not a phantom `Done`.
                run.advance(RunStatus::Retrieving);
                run.store(&self.cx)
                    .await
                    .change_context(SchedulerError::Store)?;
                self.retrieve(run).await
            }
            // A run parked here by a crashed pass resumes its fetch.
            RunStatus::Retrieving => self.retrieve(run).await,
            RunStatus::Unreachable => {
                event!(
                    Level::WARN,
                    run = %run.id(),
                    "batch system unreachable; operator re-authentication required"
                );
                run.advance(RunStatus::Notified);
                Ok(true)
            }
            RunStatus::Notified => {
                let handle = self.handle_of(run)?;
                match self.cx.batch().status(&handle).await {
                    Ok(_) => {
                        event!(Level::INFO, run = %run.id(), "batch system reachable again");
                        run.advance(RunStatus::Running);
                        Ok(true)
                    }
                    Err(report) if is_auth(&report) => Ok(false),
                    Err(report) => Err(report.change_context(SchedulerError::Batch)),
                }
            }
            RunStatus::Hold | RunStatus::Done | RunStatus::Error | RunStatus::Killed => Ok(false),
        }
    }

    async fn retrieve(&self, run: &mut Run) -> Result<bool, Report<SchedulerError>> {
        let handle = self.handle_of(run)?;
        let outputs = self
            .cx
            .batch()
            .fetch_results(&handle)
            .await
            .change_context(SchedulerError::Batch)?;
        for (name, bytes) in outputs {
            self.cx
                .store()
                .put_attachment(run.id(), &name, "application/octet-stream", bytes)
                .await
                .change_context(SchedulerError::Store)?;
            run.add_output(name);
        }
        event!(Level::INFO, run = %run.id(), "retrieved run outputs");
        run.advance(RunStatus::Done);
        Ok(true)
    }

    fn handle_of(&self, run: &Run) -> Result<crate::batch::RemoteHandle, Report<SchedulerError>> {
        run.remote_handle()
            .cloned()
            .ok_or_else(|| Report::new(SchedulerError::MissingHandle))
    }

    /// A revision conflict here means a kill or a competing poller won the
    /// write; the store's copy stands and the next pass re-derives anything
    /// still worth doing.
    async fn persist(&self, mut run: Run) {
        match run.store(&self.cx).await {
            Ok(()) => {}
            Err(report) if is_conflict(&report) => {
                event!(Level::WARN, run = %run.id(), "dropped poll update after revision conflict");
            }
            Err(report) => {
                event!(Level::ERROR, run = %run.id(), error = ?report, "failed to persist run update");
            }
        }
    }
}

fn is_auth(report: &Report<BatchError>) -> bool {
    report.current_context().is_auth()
}

fn is_conflict<C>(report: &Report<C>) -> bool {
    report
        .downcast_ref::<StoreError>()
        .map(|e| matches!(e, StoreError::Conflict { .. }))
        .unwrap_or(false)
}
