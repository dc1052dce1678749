use std::collections::BTreeMap;
use std::fmt;

use error_stack::{IntoReport, Report, ResultExt};
use gridmill_store::{DocId, Document};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{event, Level};

use super::{content_hash, fileset_key, EntityError, Job, KIND_RUN, VIEW_RUNS_BY_HASH};
use crate::batch::{FileMap, RemoteHandle, ResourceRequest};
use crate::Context;

/// Lifecycle of one submission to the batch system.
///
/// The happy path is `Hold → Ready → Running → Finished → Retrieving → Done`.
/// `Running` detours through `Unreachable → Notified` while credentials or
/// connectivity are down, and any non-terminal status can drop to `Error`
/// (unhandled failure) or `Killed` (cancellation). `Done`, `Error` and
/// `Killed` never transition again; an errored run is resurrected only by
/// [`Run::retry`], which clones a fresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Hold,
    Ready,
    Running,
    Finished,
    Retrieving,
    Done,
    Unreachable,
    Notified,
    Error,
    Killed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Error | RunStatus::Killed)
    }

    /// The statuses the poller scans, in pipeline order.
    pub(crate) fn pollable() -> [RunStatus; 6] {
        [
            RunStatus::Ready,
            RunStatus::Running,
            RunStatus::Finished,
            RunStatus::Retrieving,
            RunStatus::Unreachable,
            RunStatus::Notified,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Hold => "HOLD",
            RunStatus::Ready => "READY",
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Retrieving => "RETRIEVING",
            RunStatus::Done => "DONE",
            RunStatus::Unreachable => "UNREACHABLE",
            RunStatus::Notified => "NOTIFIED",
            RunStatus::Error => "ERROR",
            RunStatus::Killed => "KILLED",
        }
    }

    fn allows(self, next: RunStatus) -> bool {
        use RunStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Hold, Ready) => true,
            (Ready, Running) | (Ready, Unreachable) => true,
            (Running, Finished) | (Running, Unreachable) => true,
            (Finished, Retrieving) => true,
            (Retrieving, Done) => true,
            (Unreachable, Notified) => true,
            (Notified, Running) => true,
            (_, Error) | (_, Killed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunRecord {
    pub author: String,
    /// Jobs sharing this run. More than one entry means the run was reused
    /// through content-addressed dedup.
    pub owned_by: Vec<DocId>,
    /// Input file name → content hash.
    pub files_to_run: BTreeMap<String, String>,
    /// Dedup key derived from `files_to_run`, indexed by the hash view.
    pub files_key: String,
    pub status: RunStatus,
    pub run_params: ResourceRequest,
    pub remote_handle: Option<RemoteHandle>,
    /// Attachment names holding retrieved outputs, in retrieval order.
    pub output_files: Vec<String>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub struct Run {
    doc: Document,
    record: RunRecord,
}

impl Run {
    /// Create a run for the given input files: persist it in `Hold`, upload
    /// the inputs as attachments, then release it to `Ready` so a poller can
    /// pick it up. `Hold` exists exactly so that a half-created run is never
    /// submitted.
    pub(crate) async fn create(
        cx: &Context,
        author: &str,
        files: &FileMap,
        request: &ResourceRequest,
    ) -> Result<Run, Report<EntityError>> {
        let mut files_to_run = BTreeMap::new();
        for (name, bytes) in files {
            files_to_run.insert(name.clone(), content_hash(bytes));
        }
        let record = RunRecord {
            author: author.to_string(),
            owned_by: Vec::new(),
            files_key: fileset_key(&files_to_run),
            files_to_run,
            status: RunStatus::Hold,
            run_params: request.clone(),
            remote_handle: None,
            output_files: Vec::new(),
            error_message: None,
            created_at: OffsetDateTime::now_utc(),
        };
        let body = serde_json::to_value(&record)
            .into_report()
            .change_context(EntityError::Store)?;
        let doc = cx
            .store()
            .create(KIND_RUN, body)
            .await
            .change_context(EntityError::Store)?;
        let mut run = Run { doc, record };
        for (name, bytes) in files {
            cx.store()
                .put_attachment(run.id(), name, "application/octet-stream", bytes.clone())
                .await
                .change_context(EntityError::Store)?;
        }
        run.record.status = RunStatus::Ready;
        run.store(cx).await?;
        event!(Level::DEBUG, run = %run.id(), "created run");
        Ok(run)
    }

    /// Look up a completed run whose input-file set hashes to `files_key`.
    /// Only `Done` runs are reusable; anything else is either still in
    /// flight or failed, and a failed computation should not be inherited.
    pub(crate) async fn find_reusable(
        cx: &Context,
        files_key: &str,
    ) -> Result<Option<Run>, Report<EntityError>> {
        let docs = cx
            .store()
            .view(VIEW_RUNS_BY_HASH, files_key)
            .await
            .change_context(EntityError::Store)?;
        for doc in docs {
            let run = Run::from_document(doc)?;
            if run.status() == RunStatus::Done {
                return Ok(Some(run));
            }
        }
        Ok(None)
    }

    pub async fn load(cx: &Context, id: DocId) -> Result<Run, Report<EntityError>> {
        let doc = cx
            .store()
            .load(id)
            .await
            .change_context(EntityError::Store)?;
        Run::from_document(doc)
    }

    pub(crate) fn from_document(doc: Document) -> Result<Run, Report<EntityError>> {
        let record = doc.parse().change_context(EntityError::Store)?;
        Ok(Run { doc, record })
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

    pub fn status(&self) -> RunStatus {
        self.record.status
    }

    pub fn author(&self) -> &str {
        &self.record.author
    }

    pub fn params(&self) -> &ResourceRequest {
        &self.record.run_params
    }

    pub fn remote_handle(&self) -> Option<&RemoteHandle> {
        self.record.remote_handle.as_ref()
    }

    pub fn owned_by(&self) -> &[DocId] {
        &self.record.owned_by
    }

    pub fn files_to_run(&self) -> &BTreeMap<String, String> {
        &self.record.files_to_run
    }

    pub fn output_files(&self) -> &[String] {
        &self.record.output_files
    }

    pub fn error_message(&self) -> Option<&str> {
        self.record.error_message.as_deref()
    }

    /// Request a lifecycle transition. Terminal statuses cannot be entered
    /// this way; only the scheduler assigns them.
    pub async fn set_status(
        &mut self,
        cx: &Context,
        next: RunStatus,
    ) -> Result<(), Report<EntityError>> {
        if next.is_terminal() || !self.record.status.allows(next) {
            return Err(Report::new(EntityError::InvalidStatusTransition {
                from: self.record.status,
                to: next,
            }));
        }
        self.record.status = next;
        self.store(cx).await
    }

    /// Scheduler-internal transition, already validated by the poll table.
    pub(crate) fn advance(&mut self, next: RunStatus) {
        debug_assert!(
            self.record.status.allows(next),
            "poller drove {} -> {}",
            self.record.status,
            next
        );
        self.record.status = next;
    }

    pub(crate) fn set_remote_handle(&mut self, handle: RemoteHandle) {
        self.record.remote_handle = Some(handle);
    }

    pub(crate) fn set_error(&mut self, message: String) {
        self.record.error_message = Some(message);
        self.record.status = RunStatus::Error;
    }

    pub(crate) fn add_output(&mut self, name: String) {
        if !self.record.output_files.contains(&name) {
            self.record.output_files.push(name);
        }
    }

    pub(crate) async fn add_owner(
        &mut self,
        cx: &Context,
        job: DocId,
    ) -> Result<(), Report<EntityError>> {
        if self.record.owned_by.contains(&job) {
            return Ok(());
        }
        self.record.owned_by.push(job);
        self.store(cx).await
    }

    /// Fetch the input attachments back out of the store.
    pub async fn load_input_files(&self, cx: &Context) -> Result<FileMap, Report<EntityError>> {
        let mut files = FileMap::new();
        for name in self.record.files_to_run.keys() {
            let bytes = cx
                .store()
                .get_attachment(self.id(), name)
                .await
                .change_context(EntityError::Store)?;
            files.insert(name.clone(), bytes);
        }
        Ok(files)
    }

    /// Fetch the retrieved output attachments. Empty until the run is `Done`.
    pub async fn load_output_files(&self, cx: &Context) -> Result<FileMap, Report<EntityError>> {
        let mut files = FileMap::new();
        for name in &self.record.output_files {
            let bytes = cx
                .store()
                .get_attachment(self.id(), name)
                .await
                .change_context(EntityError::Store)?;
            files.insert(name.clone(), bytes);
        }
        Ok(files)
    }

    /// Cancel the remote job if one is in flight and mark the run `Killed`.
    /// Cancellation is best-effort: a failed cancel request is logged and the
    /// run is killed regardless, since nothing will poll it afterwards.
    pub async fn kill(&mut self, cx: &Context) -> Result<(), Report<EntityError>> {
        if self.status().is_terminal() {
            return Ok(());
        }
        if let Some(handle) = &self.record.remote_handle {
            if let Err(e) = cx.batch().cancel(handle).await {
                event!(Level::WARN, run = %self.id(), error = ?e, "cancel request failed");
            }
        }
        self.record.status = RunStatus::Killed;
        self.store(cx).await
    }

    /// Operator retry of a terminally errored run: clone a fresh run (new
    /// identity, `Ready`, inputs copied) and repoint every owning job at it.
    /// The errored run stays behind as the audit trail.
    pub async fn retry(&self, cx: &Context) -> Result<Run, Report<EntityError>> {
        if self.status() != RunStatus::Error {
            return Err(Report::new(EntityError::Validation(format!(
                "run {} is {}, only ERROR runs can be retried",
                self.id(),
                self.status()
            ))));
        }
        let mut record = self.record.clone();
        record.status = RunStatus::Ready;
        record.remote_handle = None;
        record.output_files.clear();
        record.error_message = None;
        record.created_at = OffsetDateTime::now_utc();

        let body = serde_json::to_value(&record)
            .into_report()
            .change_context(EntityError::Store)?;
        let doc = cx
            .store()
            .create(KIND_RUN, body)
            .await
            .change_context(EntityError::Store)?;
        let run = Run { doc, record };
        for name in self.record.files_to_run.keys() {
            let bytes = cx
                .store()
                .get_attachment(self.id(), name)
                .await
                .change_context(EntityError::Store)?;
            cx.store()
                .put_attachment(run.id(), name, "application/octet-stream", bytes)
                .await
                .change_context(EntityError::Store)?;
        }
        for owner in run.record.owned_by.clone() {
            let mut job = Job::load(cx, owner).await?;
            job.repoint_run(cx, run.id()).await?;
        }
        event!(Level::INFO, old = %self.id(), new = %run.id(), "retried errored run");
        Ok(run)
    }
}
