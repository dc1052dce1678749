use std::collections::BTreeMap;

use error_stack::{IntoReport, Report, ResultExt};
use gridmill_store::{DocId, Document};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{event, Level};

use super::{content_hash, fileset_key, EntityError, Run, RunStatus, KIND_JOB};
use crate::batch::{FileMap, ResourceRequest};
use crate::Context;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JobRecord {
    pub author: String,
    pub title: String,
    /// Input file name → content hash, as submitted.
    pub input_files: BTreeMap<String, String>,
    /// The backing run. Assigned at creation and repointed only by an
    /// explicit run retry.
    pub run_id: DocId,
    pub parents: Vec<DocId>,
    pub children: Vec<DocId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A logical unit of remote computation. A job's status is its run's status;
/// several jobs may share one run when their input files hash identically.
#[derive(Debug)]
pub struct Job {
    doc: Document,
    record: JobRecord,
}

impl Job {
    /// Create a job for the given inputs. If a `Done` run with the identical
    /// input-file hashes already exists, the job attaches to it and no new
    /// submission ever happens; otherwise a fresh run is created and released
    /// to the poller.
    pub async fn create(
        cx: &Context,
        author: &str,
        title: &str,
        files: &FileMap,
        request: &ResourceRequest,
    ) -> Result<Job, Report<EntityError>> {
        if files.is_empty() {
            return Err(Report::new(EntityError::Validation(
                "a job needs at least one input file".to_string(),
            )));
        }
        let mut input_files = BTreeMap::new();
        for (name, bytes) in files {
            input_files.insert(name.clone(), content_hash(bytes));
        }
        let files_key = fileset_key(&input_files);

        let mut run = match Run::find_reusable(cx, &files_key).await? {
            Some(run) => {
                event!(Level::INFO, run = %run.id(), "reusing completed run for identical inputs");
                run
            }
            None => Run::create(cx, author, files, request).await?,
        };

        let record = JobRecord {
            author: author.to_string(),
            title: title.to_string(),
            input_files,
            run_id: run.id(),
            parents: Vec::new(),
            children: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        };
        let body = serde_json::to_value(&record)
            .into_report()
            .change_context(EntityError::Store)?;
        let doc = cx
            .store()
            .create(KIND_JOB, body)
            .await
            .change_context(EntityError::Store)?;
        let job = Job { doc, record };
        run.add_owner(cx, job.id()).await?;
        event!(Level::DEBUG, job = %job.id(), run = %run.id(), title, "created job");
        Ok(job)
    }

    pub async fn load(cx: &Context, id: DocId) -> Result<Job, Report<EntityError>> {
        let doc = cx
            .store()
            .load(id)
            .await
            .change_context(EntityError::Store)?;
        let record = doc.parse().change_context(EntityError::Store)?;
        Ok(Job { doc, record })
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

    pub fn run_id(&self) -> DocId {
        self.record.run_id
    }

    pub fn parents(&self) -> &[DocId] {
        &self.record.parents
    }

    pub fn children(&self) -> &[DocId] {
        &self.record.children
    }

    pub async fn run(&self, cx: &Context) -> Result<Run, Report<EntityError>> {
        Run::load(cx, self.record.run_id).await
    }

    /// A job's status is delegated to its run.
    pub async fn status(&self, cx: &Context) -> Result<RunStatus, Report<EntityError>> {
        Ok(self.run(cx).await?.status())
    }

    /// Append `child` to this job's dependency list. Idempotent; both sides
    /// of the edge are persisted.
    pub async fn add_child(
        &mut self,
        cx: &Context,
        child: &mut Job,
    ) -> Result<(), Report<EntityError>> {
        if !self.record.children.contains(&child.id()) {
            self.record.children.push(child.id());
            self.store(cx).await?;
        }
        if !child.record.parents.contains(&self.id()) {
            child.record.parents.push(self.id());
            child.store(cx).await?;
        }
        Ok(())
    }

    pub async fn add_parent(
        &mut self,
        cx: &Context,
        parent: &mut Job,
    ) -> Result<(), Report<EntityError>> {
        parent.add_child(cx, self).await
    }

    /// Supersede this job with a fresh copy: same author, title, inputs and
    /// resource request, new identity. Goes back through [`Job::create`], so
    /// a completed run for the same inputs is reused rather than recomputed.
    pub async fn resubmit(&self, cx: &Context) -> Result<Job, Report<EntityError>> {
        let run = self.run(cx).await?;
        let files = run.load_input_files(cx).await?;
        Job::create(cx, &self.record.author, &self.record.title, &files, run.params()).await
    }

    pub(crate) async fn repoint_run(
        &mut self,
        cx: &Context,
        run_id: DocId,
    ) -> Result<(), Report<EntityError>> {
        self.record.run_id = run_id;
        self.store(cx).await
    }
}
