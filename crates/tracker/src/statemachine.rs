//! Generic task state machine.
//!
//! A workflow is an explicit table from state names to handlers, built in a
//! constructor and registered under the workflow's tag. Handlers get the
//! shared [`Context`] and the locked [`Task`]; `on_main` returns the next
//! state, with "same state" meaning "not ready yet, re-poll later". All
//! bookkeeping (enter-once semantics, meta-transition, error capture, lock
//! release) lives here, so a workflow is nothing but its handlers.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use error_stack::{Report, ResultExt};
use gridmill_store::DocId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use crate::entity::{Job, RunStatus, Task, Transition};
use crate::Context;

/// A named workflow state, persisted with the task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateName(Cow<'static, str>);

impl StateName {
    /// Reached when a workflow finishes its terminal state's work.
    pub const COMPLETE: StateName = StateName::from_static("COMPLETE");
    /// Forced by a kill; the workflow's handler for it cancels the children.
    pub const KILLED: StateName = StateName::from_static("KILLED");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Terminal states end the machine: entering one marks the task
    /// [`Transition::Complete`] and nothing polls it again.
    pub fn is_terminal(&self) -> bool {
        *self == StateName::COMPLETE || *self == StateName::KILLED
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("could not acquire the task lock")]
    Lock,
    #[error("no handler registered for state {0}")]
    UnhandledState(StateName),
    /// A child job reached a terminal status without succeeding.
    #[error("child job {0} failed")]
    ChildFailed(DocId),
    #[error("workflow handler failed")]
    Handler,
    #[error("storage operation failed")]
    Store,
}

/// Advisory-lock tuning for task stepping.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long an acquire waits for a busy lock before giving up.
    pub timeout: Duration,
    /// Lease length; expired leases count as free.
    pub lease: Duration,
    /// Delay between acquire attempts.
    pub poll: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            lease: Duration::from_secs(60),
            poll: Duration::from_millis(250),
        }
    }
}

/// Hooks for one workflow state. `on_enter` runs once per entry into the
/// state, `on_main` on every step while in it, `on_leave` once when leaving.
#[async_trait::async_trait]
pub trait StateHandler: Send + Sync {
    async fn on_enter(&self, cx: &Context, task: &mut Task) -> Result<(), Report<StepError>> {
        let _ = (cx, task);
        Ok(())
    }

    async fn on_main(&self, cx: &Context, task: &mut Task)
        -> Result<StateName, Report<StepError>>;

    async fn on_leave(&self, cx: &Context, task: &mut Task) -> Result<(), Report<StepError>> {
        let _ = (cx, task);
        Ok(())
    }
}

/// The dispatch table for one workflow kind.
pub struct StateMachine {
    kind: &'static str,
    handlers: HashMap<StateName, Box<dyn StateHandler>>,
    lock: LockConfig,
    owner: String,
}

impl StateMachine {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            handlers: HashMap::new(),
            lock: LockConfig::default(),
            owner: format!("{kind}-{}", Uuid::now_v7()),
        }
    }

    /// Register the handler for a state. Builder-style so a workflow's
    /// constructor reads as the transition table.
    pub fn handler(mut self, state: StateName, handler: impl StateHandler + 'static) -> Self {
        self.handlers.insert(state, Box::new(handler));
        self
    }

    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// The registry tag of the workflow this machine drives.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Advance the task by one state-machine step. Any error inside a hook
    /// is captured into the task's `error_message` and parks it in the
    /// `Error` meta-transition; it never propagates to the caller, so one
    /// broken task cannot halt a driver pass. The returned transition tells
    /// the caller whether more work is ready right now.
    #[instrument(level = "debug", skip(self, cx), fields(kind = self.kind))]
    pub async fn step(&self, cx: &Context, id: DocId) -> Result<Transition, Report<StepError>> {
        let mut task = Task::acquire(cx, id, &self.owner, &self.lock)
            .await
            .change_context(StepError::Lock)?;

        if let Err(report) = self.step_locked(cx, &mut task).await {
            event!(Level::ERROR, task = %id, state = %task.state(), error = ?report, "task step failed");
            task.set_error(format!("{report:?}"));
        }
        task.touch_last_exec();
        task.release(cx).await.change_context(StepError::Store)?;
        Ok(task.transition())
    }

    async fn step_locked(&self, cx: &Context, task: &mut Task) -> Result<(), Report<StepError>> {
        if task.transition().is_terminal() || task.transition() == Transition::Hold {
            return Ok(());
        }
        let current = task.state().clone();
        let handler = self
            .handlers
            .get(&current)
            .ok_or_else(|| Report::new(StepError::UnhandledState(current.clone())))?;

        if !task.entered() {
            handler.on_enter(cx, task).await?;
            task.set_entered(true);
        }
        let next = handler.on_main(cx, task).await?;

        let changed = next != current;
        if changed {
            handler.on_leave(cx, task).await?;
            event!(Level::DEBUG, task = %task.id(), from = %current, to = %next, "state transition");
            task.set_state(next.clone());
            task.set_entered(false);
        }
        task.set_transition(if next.is_terminal() {
            Transition::Complete
        } else if changed {
            Transition::Running
        } else {
            Transition::Paused
        });
        Ok(())
    }

    /// Do as much work as is ready right now: loop [`StateMachine::step`]
    /// until the task yields (`Paused`) or ends (`Error`/`Complete`).
    pub async fn run(&self, cx: &Context, id: DocId) -> Result<Transition, Report<StepError>> {
        loop {
            let transition = self.step(cx, id).await?;
            if transition != Transition::Running {
                return Ok(transition);
            }
        }
    }

    /// Reset an errored task to `Paused` so it re-enters the same domain
    /// state on the next step. The domain error message is deliberately kept.
    /// Errored child runs are cloned-and-retried as well.
    pub async fn retry(&self, cx: &Context, id: DocId) -> Result<(), Report<StepError>> {
        let mut task = Task::acquire(cx, id, &self.owner, &self.lock)
            .await
            .change_context(StepError::Lock)?;
        if task.transition() == Transition::Error {
            task.set_transition(Transition::Paused);
        }
        for child in task.children().to_vec() {
            let job = Job::load(cx, child).await.change_context(StepError::Store)?;
            let run = job.run(cx).await.change_context(StepError::Store)?;
            if run.status() == RunStatus::Error {
                run.retry(cx).await.change_context(StepError::Store)?;
            }
        }
        task.release(cx).await.change_context(StepError::Store)?;
        Ok(())
    }

    /// Force the task onto the kill path. Cooperative: the children are
    /// cancelled by the workflow's `KILLED` handler on the next polling
    /// pass, and a killed task cannot be resumed.
    pub async fn kill(&self, cx: &Context, id: DocId) -> Result<(), Report<StepError>> {
        let mut task = Task::acquire(cx, id, &self.owner, &self.lock)
            .await
            .change_context(StepError::Lock)?;
        event!(Level::INFO, task = %id, "task will be killed");
        task.force_kill();
        task.release(cx).await.change_context(StepError::Store)?;
        Ok(())
    }
}

/// Stock handler for [`StateName::KILLED`]: cancels every child job's run
/// and ends the machine. Workflows with no extra teardown register this
/// directly.
pub struct KillChildren;

#[async_trait::async_trait]
impl StateHandler for KillChildren {
    async fn on_main(
        &self,
        cx: &Context,
        task: &mut Task,
    ) -> Result<StateName, Report<StepError>> {
        for child in task.children().to_vec() {
            let job = Job::load(cx, child).await.change_context(StepError::Store)?;
            let mut run = job.run(cx).await.change_context(StepError::Store)?;
            run.kill(cx).await.change_context(StepError::Store)?;
        }
        Ok(StateName::KILLED)
    }
}

/// Check that every child job's run has ended well. The usual body of a
/// wait-state: returns `true` when all children are terminal and
/// successful, `false` while any is still in flight, and fails with
/// [`StepError::ChildFailed`] as soon as one child ends badly.
pub async fn children_done(cx: &Context, task: &Task) -> Result<bool, Report<StepError>> {
    let mut done = 0;
    for child in task.children() {
        let job = Job::load(cx, *child)
            .await
            .change_context(StepError::Store)?;
        let status = job.status(cx).await.change_context(StepError::Store)?;
        if status.is_terminal() {
            if status == RunStatus::Done {
                done += 1;
            } else {
                return Err(Report::new(StepError::ChildFailed(*child)));
            }
        }
    }
    Ok(done == task.children().len())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gridmill_store::MemoryStore;
    use serde_json::json;

    use super::*;
    use crate::batch::inprocess::InProcessBatchClient;
    use crate::batch::{FileMap, ResourceRequest};
    use crate::entity::{standard_views, EntityError, RunStatus};
    use crate::scheduler::{PollerConfig, Scheduler};
    use crate::test_util::setup_test_tracing;

    const COUNT: StateName = StateName::from_static("COUNT");
    const FLAKY: StateName = StateName::from_static("FLAKY");

    fn context() -> Context {
        setup_test_tracing();
        let store = Arc::new(MemoryStore::with_views(standard_views()));
        let batch = Arc::new(
            InProcessBatchClient::new(|_job| async move {
                let mut out = FileMap::new();
                out.insert("output.log".to_string(), b"ok".to_vec());
                Ok(out)
            })
            .with_running_polls(0),
        );
        Context::new(store, batch)
    }

    /// Stays in COUNT until `on_main` has run twice, recording how often
    /// each hook fired.
    struct Counting;

    #[async_trait::async_trait]
    impl StateHandler for Counting {
        async fn on_enter(&self, _cx: &Context, task: &mut Task) -> Result<(), Report<StepError>> {
            bump(task, "enters");
            Ok(())
        }

        async fn on_main(
            &self,
            _cx: &Context,
            task: &mut Task,
        ) -> Result<StateName, Report<StepError>> {
            let mains = bump(task, "mains");
            if mains < 2 {
                Ok(COUNT)
            } else {
                Ok(StateName::COMPLETE)
            }
        }

        async fn on_leave(&self, _cx: &Context, task: &mut Task) -> Result<(), Report<StepError>> {
            bump(task, "leaves");
            Ok(())
        }
    }

    fn bump(task: &mut Task, key: &str) -> u64 {
        let count = task
            .user_data()
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;
        task.user_data_mut().insert(key.to_string(), json!(count));
        count
    }

    fn counter(task: &Task, key: &str) -> u64 {
        task.user_data()
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    /// Fails the first time through, succeeds after a retry.
    struct FailsOnce;

    #[async_trait::async_trait]
    impl StateHandler for FailsOnce {
        async fn on_main(
            &self,
            _cx: &Context,
            task: &mut Task,
        ) -> Result<StateName, Report<StepError>> {
            if task.user_data().contains_key("tried") {
                return Ok(StateName::COMPLETE);
            }
            task.user_data_mut().insert("tried".to_string(), json!(true));
            Err(Report::new(StepError::Handler).attach_printable("synthetic handler failure"))
        }
    }

    async fn new_task(cx: &Context, state: StateName) -> Task {
        let mut task = Task::create(cx, "mark", "test task", "toy", state)
            .await
            .unwrap();
        task.start(cx).await.unwrap();
        task
    }

    #[tokio::test]
    async fn enter_runs_once_and_same_state_pauses() {
        let cx = context();
        let machine = StateMachine::new("toy").handler(COUNT, Counting);
        let task = new_task(&cx, COUNT).await;

        let t = machine.step(&cx, task.id()).await.unwrap();
        assert_eq!(t, Transition::Paused);

        let t = machine.step(&cx, task.id()).await.unwrap();
        assert_eq!(t, Transition::Complete);

        let task = Task::load(&cx, task.id()).await.unwrap();
        assert_eq!(counter(&task, "enters"), 1, "on_enter ran once per entry");
        assert_eq!(counter(&task, "mains"), 2);
        assert_eq!(counter(&task, "leaves"), 1);
        assert_eq!(*task.state(), StateName::COMPLETE);
        assert!(task.successful());
    }

    #[tokio::test]
    async fn handler_error_parks_task_until_retry() {
        let cx = context();
        let machine = StateMachine::new("toy").handler(FLAKY, FailsOnce);
        let task = new_task(&cx, FLAKY).await;

        let t = machine.step(&cx, task.id()).await.unwrap();
        assert_eq!(t, Transition::Error);
        let loaded = Task::load(&cx, task.id()).await.unwrap();
        assert!(loaded.error_message().is_some());
        assert_eq!(*loaded.state(), FLAKY, "domain state untouched by the error");

        // Terminal until retried: stepping again is a no-op.
        let t = machine.step(&cx, task.id()).await.unwrap();
        assert_eq!(t, Transition::Error);

        machine.retry(&cx, task.id()).await.unwrap();
        let loaded = Task::load(&cx, task.id()).await.unwrap();
        assert_eq!(loaded.transition(), Transition::Paused);
        assert!(
            loaded.error_message().is_some(),
            "retry keeps the domain error"
        );

        let t = machine.step(&cx, task.id()).await.unwrap();
        assert_eq!(t, Transition::Complete);
    }

    #[tokio::test]
    async fn unhandled_state_is_an_error_not_a_panic() {
        let cx = context();
        let machine = StateMachine::new("toy").handler(COUNT, Counting);
        let task = new_task(&cx, StateName::from_static("NOWHERE")).await;

        let t = machine.step(&cx, task.id()).await.unwrap();
        assert_eq!(t, Transition::Error);
        let loaded = Task::load(&cx, task.id()).await.unwrap();
        assert!(loaded.error_message().unwrap().contains("NOWHERE"));
    }

    #[tokio::test]
    async fn kill_cancels_children_on_next_step() {
        setup_test_tracing();
        let store = Arc::new(MemoryStore::with_views(standard_views()));
        let batch = Arc::new(
            InProcessBatchClient::new(|_job| async move { Ok(FileMap::new()) })
                .with_running_polls(5),
        );
        let cx = Context::new(store, batch.clone());
        // A wait state that never advances on its own, so the children stay
        // in flight until the kill lands.
        struct WaitForever;
        #[async_trait::async_trait]
        impl StateHandler for WaitForever {
            async fn on_main(
                &self,
                _cx: &Context,
                _task: &mut Task,
            ) -> Result<StateName, Report<StepError>> {
                Ok(StateName::from_static("WAIT"))
            }
        }
        let machine = StateMachine::new("toy")
            .handler(StateName::from_static("WAIT"), WaitForever)
            .handler(StateName::KILLED, KillChildren);

        let mut task = new_task(&cx, StateName::from_static("WAIT")).await;
        let mut files = FileMap::new();
        files.insert("a.inp".to_string(), b"geometry a".to_vec());
        let job_a = Job::create(&cx, "mark", "a", &files, &ResourceRequest::new("gamess"))
            .await
            .unwrap();
        files.insert("a.inp".to_string(), b"geometry b".to_vec());
        let job_b = Job::create(&cx, "mark", "b", &files, &ResourceRequest::new("gamess"))
            .await
            .unwrap();
        task.add_child(&cx, &job_a).await.unwrap();
        task.add_child(&cx, &job_b).await.unwrap();

        // Get both runs submitted so there is something remote to cancel.
        let scheduler = Scheduler::new(cx.clone(), PollerConfig::default());
        scheduler.run_once().await.unwrap();
        assert_eq!(job_a.status(&cx).await.unwrap(), RunStatus::Running);

        machine.kill(&cx, task.id()).await.unwrap();
        let t = machine.step(&cx, task.id()).await.unwrap();
        assert_eq!(t, Transition::Complete);

        let loaded = Task::load(&cx, task.id()).await.unwrap();
        assert_eq!(*loaded.state(), StateName::KILLED);
        assert!(loaded.done());
        assert!(!loaded.successful());
        assert_eq!(job_a.status(&cx).await.unwrap(), RunStatus::Killed);
        assert_eq!(job_b.status(&cx).await.unwrap(), RunStatus::Killed);
        assert_eq!(
            batch.cancelled_handles().len(),
            2,
            "both remote jobs got a cancel request"
        );

        // Nothing is pollable afterwards.
        let stats = scheduler.run_once().await.unwrap();
        assert_eq!(stats.polled, 0);
    }

    #[tokio::test]
    async fn lock_blocks_second_owner_until_timeout() {
        let cx = context();
        let task = new_task(&cx, COUNT).await;
        let lock = LockConfig {
            timeout: std::time::Duration::from_millis(50),
            lease: std::time::Duration::from_secs(60),
            poll: std::time::Duration::from_millis(10),
        };
        let held = Task::acquire(&cx, task.id(), "owner-a", &lock).await.unwrap();

        let err = Task::acquire(&cx, task.id(), "owner-b", &lock)
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            EntityError::LockTimeout(_)
        ));

        // Released locks are immediately acquirable again.
        let mut held = held;
        held.release(&cx).await.unwrap();
        let _ = Task::acquire(&cx, task.id(), "owner-b", &lock).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_counts_as_free() {
        let cx = context();
        let task = new_task(&cx, COUNT).await;
        let short = LockConfig {
            timeout: std::time::Duration::from_millis(50),
            lease: std::time::Duration::from_millis(1),
            poll: std::time::Duration::from_millis(10),
        };
        let _stale = Task::acquire(&cx, task.id(), "crashed-owner", &short).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let _ = Task::acquire(&cx, task.id(), "owner-b", &short).await.unwrap();
    }

    #[tokio::test]
    async fn children_done_reports_failures() {
        let cx = context();
        let mut task = new_task(&cx, COUNT).await;
        let mut files = FileMap::new();
        files.insert("a.inp".to_string(), b"geometry".to_vec());
        let job = Job::create(&cx, "mark", "a", &files, &ResourceRequest::new("gamess"))
            .await
            .unwrap();
        task.add_child(&cx, &job).await.unwrap();

        assert!(!children_done(&cx, &task).await.unwrap());

        let mut run = job.run(&cx).await.unwrap();
        run.kill(&cx).await.unwrap();
        let err = children_done(&cx, &task).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            StepError::ChildFailed(id) if *id == job.id()
        ));
    }
}

