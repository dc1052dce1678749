//! Workflow dispatch: a closed table from a task's persisted `workflow` tag
//! to the state machine that drives it, plus the driver that steps every
//! pollable task each pass.

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use gridmill_store::DocId;
use thiserror::Error;
use tracing::{event, instrument, Level};

use crate::entity::{Task, Transition, VIEW_TASKS_BY_TRANSITION};
use crate::scheduler::{PassStats, PollerConfig};
use crate::statemachine::StateMachine;
use crate::Context;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to enumerate tasks")]
    View,
    #[error("no workflow registered for kind {0}")]
    UnknownWorkflow(String),
    #[error("storage operation failed")]
    Store,
    #[error("task lifecycle operation failed")]
    Step,
}

/// Tag → machine table, populated once at startup. Looking a task's
/// workflow up by its stored string tag is the only dynamic dispatch in the
/// system; an unknown tag is an error, never an execution.
#[derive(Default)]
pub struct WorkflowRegistry {
    machines: ahash::HashMap<&'static str, Arc<StateMachine>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, machine: StateMachine) -> &mut Self {
        self.machines.insert(machine.kind(), Arc::new(machine));
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<StateMachine>> {
        self.machines.get(kind).cloned()
    }
}

/// Steps every pollable task through its registered machine. The run-level
/// counterpart is [`Scheduler`](crate::scheduler::Scheduler); a deployment
/// drives both from the same cron-like loop.
pub struct TaskDriver {
    cx: Context,
    registry: WorkflowRegistry,
    config: PollerConfig,
}

impl TaskDriver {
    pub fn new(cx: Context, registry: WorkflowRegistry, config: PollerConfig) -> Self {
        Self {
            cx,
            registry,
            config,
        }
    }

    /// Step every `Paused` or `Running` task once through `StateMachine::run`
    /// (i.e. as far as it can get right now). Per-task isolation mirrors the
    /// run poller: a failing task is logged and skipped, never fatal to the
    /// pass.
    #[instrument(level = "debug", skip(self))]
    pub async fn run_once(&self) -> Result<PassStats, Report<DriverError>> {
        let mut stats = PassStats::default();
        for transition in [Transition::Paused, Transition::Running] {
            let docs = self
                .cx
                .store()
                .view(VIEW_TASKS_BY_TRANSITION, transition.as_str())
                .await
                .change_context(DriverError::View)?;
            for doc in docs {
                let id = doc.id;
                let task = match Task::from_document(doc) {
                    Ok(task) => task,
                    Err(report) => {
                        event!(Level::ERROR, task = %id, error = ?report, "unreadable task record");
                        stats.errored += 1;
                        continue;
                    }
                };
                if task.transition() != transition {
                    continue;
                }
                stats.polled += 1;
                let Some(machine) = self.registry.get(task.workflow()) else {
                    event!(Level::WARN, task = %id, workflow = task.workflow(), "no workflow registered");
                    stats.errored += 1;
                    continue;
                };
                match machine.run(&self.cx, id).await {
                    Ok(Transition::Error) => stats.errored += 1,
                    Ok(_) => stats.advanced += 1,
                    Err(report) => {
                        event!(Level::ERROR, task = %id, error = ?report, "task step failed");
                        stats.errored += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Poll forever until the shutdown channel fires.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), Report<DriverError>> {
        loop {
            let stats = self.run_once().await?;
            if stats.polled > 0 {
                event!(
                    Level::DEBUG,
                    polled = stats.polled,
                    advanced = stats.advanced,
                    errored = stats.errored,
                    "task pass complete"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick) => {}
                _ = shutdown.changed() => {
                    event!(Level::INFO, "task driver shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Resume an errored task (operator action).
    pub async fn retry(&self, id: DocId) -> Result<(), Report<DriverError>> {
        let machine = self.machine_for(id).await?;
        machine
            .retry(&self.cx, id)
            .await
            .change_context(DriverError::Step)
    }

    /// Kill a task and, on its next step, its children (operator action).
    pub async fn kill(&self, id: DocId) -> Result<(), Report<DriverError>> {
        let machine = self.machine_for(id).await?;
        machine
            .kill(&self.cx, id)
            .await
            .change_context(DriverError::Step)
    }

    async fn machine_for(&self, id: DocId) -> Result<Arc<StateMachine>, Report<DriverError>> {
        let task = Task::load(&self.cx, id)
            .await
            .change_context(DriverError::Store)?;
        self.registry
            .get(task.workflow())
            .ok_or_else(|| Report::new(DriverError::UnknownWorkflow(task.workflow().to_string())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gridmill_store::MemoryStore;

    use super::*;
    use crate::batch::inprocess::InProcessBatchClient;
    use crate::batch::FileMap;
    use crate::entity::standard_views;
    use crate::statemachine::{StateHandler, StateName, StepError};
    use crate::test_util::setup_test_tracing;

    const START: StateName = StateName::from_static("START");

    struct Immediate;

    #[async_trait::async_trait]
    impl StateHandler for Immediate {
        async fn on_main(
            &self,
            _cx: &Context,
            _task: &mut Task,
        ) -> Result<StateName, error_stack::Report<StepError>> {
            Ok(StateName::COMPLETE)
        }
    }

    fn context() -> Context {
        setup_test_tracing();
        let store = Arc::new(MemoryStore::with_views(standard_views()));
        let batch = Arc::new(InProcessBatchClient::new(|_job| async move {
            Ok(FileMap::new())
        }));
        Context::new(store, batch)
    }

    #[tokio::test]
    async fn driver_steps_registered_tasks_and_flags_unknown_kinds() {
        let cx = context();
        let mut registry = WorkflowRegistry::new();
        registry.register(StateMachine::new("noop").handler(START, Immediate));
        let driver = TaskDriver::new(cx.clone(), registry, PollerConfig::default());

        let mut known = Task::create(&cx, "mark", "known", "noop", START).await.unwrap();
        known.start(&cx).await.unwrap();
        let mut unknown = Task::create(&cx, "mark", "unknown", "mystery", START)
            .await
            .unwrap();
        unknown.start(&cx).await.unwrap();

        let stats = driver.run_once().await.unwrap();
        assert_eq!((stats.polled, stats.advanced, stats.errored), (2, 1, 1));

        let known = Task::load(&cx, known.id()).await.unwrap();
        assert!(known.successful());
        // The unregistered task is left untouched for a fixed deployment to
        // pick up later.
        let unknown = Task::load(&cx, unknown.id()).await.unwrap();
        assert_eq!(unknown.transition(), Transition::Paused);
    }
}
