use std::collections::BTreeMap;
use std::fmt;

use error_stack::{IntoReport, Report, ResultExt};
use gridmill_store::{DocId, Document, StoreError};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{event, Level};

use super::{EntityError, Job, KIND_TASK};
use crate::statemachine::{LockConfig, StateName};
use crate::Context;

/// Meta-status that tells the driver whether a task needs stepping, as
/// opposed to the workflow-specific [`StateName`] that tells the machine
/// *what* to do when it is stepped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transition {
    /// Mid-creation; not yet pollable.
    Hold,
    /// The machine made progress and has more work ready right now.
    Running,
    /// Waiting on children; re-poll later.
    Paused,
    /// A hook failed. Terminal until an explicit retry.
    Error,
    /// The workflow reached a terminal state.
    Complete,
}

impl Transition {
    pub fn is_terminal(self) -> bool {
        matches!(self, Transition::Error | Transition::Complete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transition::Hold => "HOLD",
            Transition::Running => "RUNNING",
            Transition::Paused => "PAUSED",
            Transition::Error => "ERROR",
            Transition::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory lock lease. Expired leases count as free, so a crashed stepper
/// cannot wedge a task forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TaskRecord {
    pub author: String,
    pub title: String,
    /// Registry tag of the workflow that owns this task.
    pub workflow: String,
    /// Child job ids, append-only, in creation order.
    pub children: Vec<DocId>,
    /// Workflow scratch space (iteration counters and the like).
    pub user_data: BTreeMap<String, serde_json::Value>,
    pub result_data: Option<serde_json::Value>,
    pub state: StateName,
    pub transition: Transition,
    pub error_message: Option<String>,
    /// Whether the current state's `on_enter` hook has run.
    pub entered: bool,
    pub lock: Option<Lease>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_exec_at: OffsetDateTime,
}

/// A higher-level workflow composed of child jobs, driven by an explicit
/// state machine. Tasks are never deleted; completed and errored tasks stay
/// behind as the audit trail.
#[derive(Debug)]
pub struct Task {
    doc: Document,
    record: TaskRecord,
}

impl Task {
    /// Persist a new task in `Hold`. The workflow's own `create` builds the
    /// initial children, then calls [`Task::start`] to make it pollable.
    pub async fn create(
        cx: &Context,
        author: &str,
        title: &str,
        workflow: &str,
        initial_state: StateName,
    ) -> Result<Task, Report<EntityError>> {
        let now = OffsetDateTime::now_utc();
        let record = TaskRecord {
            author: author.to_string(),
            title: title.to_string(),
            workflow: workflow.to_string(),
            children: Vec::new(),
            user_data: BTreeMap::new(),
            result_data: None,
            state: initial_state,
            transition: Transition::Hold,
            error_message: None,
            entered: false,
            lock: None,
            created_at: now,
            last_exec_at: now,
        };
        let body = serde_json::to_value(&record)
            .into_report()
            .change_context(EntityError::Store)?;
        let doc = cx
            .store()
            .create(KIND_TASK, body)
            .await
            .change_context(EntityError::Store)?;
        event!(Level::DEBUG, task = %doc.id, workflow, "created task");
        Ok(Task { doc, record })
    }

    pub async fn load(cx: &Context, id: DocId) -> Result<Task, Report<EntityError>> {
        let doc = cx
            .store()
            .load(id)
            .await
            .change_context(EntityError::Store)?;
        Task::from_document(doc)
    }

    pub(crate) fn from_document(doc: Document) -> Result<Task, Report<EntityError>> {
        let record = doc.parse().change_context(EntityError::Store)?;
        Ok(Task { doc, record })
    }

    pub async fn store(&mut self, cx: &Context) -> Result<(), Report<EntityError>> {
        self.doc.body = serde_json::to_value(&self.record)
            .into_report()
            .change_context(EntityError::Store)?;
        cx.store()
            .store(&mut self.doc)
            .await
            .change_context(EntityError::Store)
    }

    pub fn id(&self) -> DocId {
        self.doc.id
    }

    pub fn author(&self) -> &str {
        &self.record.author
    }

    pub fn title(&self) -> &str {
        &self.record.title
    }

    pub fn workflow(&self) -> &str {
        &self.record.workflow
    }

    pub fn state(&self) -> &StateName {
        &self.record.state
    }

    pub fn transition(&self) -> Transition {
        self.record.transition
    }

    pub fn children(&self) -> &[DocId] {
        &self.record.children
    }

    pub fn user_data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.record.user_data
    }

    pub fn user_data_mut(&mut self) -> &mut BTreeMap<String, serde_json::Value> {
        &mut self.record.user_data
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.record.result_data.as_ref()
    }

    pub fn set_result(&mut self, result: serde_json::Value) {
        self.record.result_data = Some(result);
    }

    pub fn error_message(&self) -> Option<&str> {
        self.record.error_message.as_deref()
    }

    /// No further automatic transition will happen.
    pub fn done(&self) -> bool {
        self.record.transition.is_terminal()
    }

    /// Terminal and ended in the workflow's `COMPLETE` state (a killed task
    /// is done but not successful).
    pub fn successful(&self) -> bool {
        self.record.transition == Transition::Complete && self.record.state == StateName::COMPLETE
    }

    /// Release a freshly created task to the driver.
    pub async fn start(&mut self, cx: &Context) -> Result<(), Report<EntityError>> {
        if self.record.transition == Transition::Hold {
            self.record.transition = Transition::Paused;
            self.store(cx).await?;
        }
        Ok(())
    }

    /// Append a child job, idempotently, and persist.
    pub async fn add_child(&mut self, cx: &Context, job: &Job) -> Result<(), Report<EntityError>> {
        if !self.record.children.contains(&job.id()) {
            self.record.children.push(job.id());
            self.store(cx).await?;
        }
        Ok(())
    }

    /// Store a workflow input file on the task document.
    pub async fn attach_file(
        &self,
        cx: &Context,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), Report<EntityError>> {
        cx.store()
            .put_attachment(self.id(), name, "application/octet-stream", bytes)
            .await
            .change_context(EntityError::Store)
    }

    pub async fn read_file(&self, cx: &Context, name: &str) -> Result<Vec<u8>, Report<EntityError>> {
        cx.store()
            .get_attachment(self.id(), name)
            .await
            .change_context(EntityError::Store)
    }

    pub(crate) fn set_state(&mut self, state: StateName) {
        self.record.state = state;
    }

    pub(crate) fn set_transition(&mut self, transition: Transition) {
        self.record.transition = transition;
    }

    pub(crate) fn entered(&self) -> bool {
        self.record.entered
    }

    pub(crate) fn set_entered(&mut self, entered: bool) {
        self.record.entered = entered;
    }

    pub(crate) fn set_error(&mut self, message: String) {
        self.record.error_message = Some(message);
        self.record.transition = Transition::Error;
    }

    pub(crate) fn touch_last_exec(&mut self) {
        self.record.last_exec_at = OffsetDateTime::now_utc();
    }

    /// Force the task onto the terminal kill path. The next step runs the
    /// workflow's `KILLED` handler, which cancels the children.
    pub(crate) fn force_kill(&mut self) {
        self.record.state = StateName::KILLED;
        self.record.entered = false;
        self.record.transition = Transition::Paused;
    }

    /// Timeout-bounded exclusive acquire. Competing steppers race on the
    /// store's revision check; the loser reloads and waits for the lease to
    /// clear or expire.
    pub(crate) async fn acquire(
        cx: &Context,
        id: DocId,
        owner: &str,
        lock: &LockConfig,
    ) -> Result<Task, Report<EntityError>> {
        let deadline = tokio::time::Instant::now() + lock.timeout;
        loop {
            let mut task = Task::load(cx, id).await?;
            let now = OffsetDateTime::now_utc();
            let free = match &task.record.lock {
                None => true,
                Some(lease) => lease.owner == owner || lease.expires_at <= now,
            };
            if free {
                task.record.lock = Some(Lease {
                    owner: owner.to_string(),
                    expires_at: now + lock.lease,
                });
                match task.store(cx).await {
                    Ok(()) => return Ok(task),
                    Err(e) if is_conflict(&e) => continue,
                    Err(e) => return Err(e),
                }
            }
            if tokio::time::Instant::now() + lock.poll > deadline {
                return Err(Report::new(EntityError::LockTimeout(id)));
            }
            tokio::time::sleep(lock.poll).await;
        }
    }

    /// Persist and drop the lock. Called on every step exit path.
    pub(crate) async fn release(&mut self, cx: &Context) -> Result<(), Report<EntityError>> {
        self.record.lock = None;
        self.store(cx).await
    }
}

fn is_conflict(report: &Report<EntityError>) -> bool {
    report
        .downcast_ref::<StoreError>()
        .map(|e| matches!(e, StoreError::Conflict { .. }))
        .unwrap_or(false)
}
