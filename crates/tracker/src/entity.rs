//! Store-backed entity model: jobs, runs, and tasks.
//!
//! Entities are thin typed views over documents. Loading parses the JSON
//! body into a record struct; every mutating operation writes straight back
//! through to the store, so two processes only ever coordinate through the
//! store's revision checks.

pub mod job;
pub mod run;
pub mod task;


use std::collections::BTreeMap;
use std::fmt::Write as _;

use gridmill_store::{DocId, Document, ViewFn};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use job::Job;
pub use run::{Run, RunStatus};
pub use task::{Lease, Task, Transition};

pub const KIND_JOB: &str = "job";
pub const KIND_RUN: &str = "run";
pub const KIND_TASK: &str = "task";

pub const VIEW_RUNS_BY_STATUS: &str = "runs_by_status";
pub const VIEW_RUNS_BY_HASH: &str = "runs_by_hash";
pub const VIEW_TASKS_BY_TRANSITION: &str = "tasks_by_transition";
pub const VIEW_JOBS_BY_AUTHOR: &str = "jobs_by_author";

#[derive(Debug, Error)]
pub enum EntityError {
    /// Malformed entity construction; surfaced to the caller immediately and
    /// never persisted as a run or task state.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The caller tried a status edge the lifecycle does not allow, or tried
    /// to enter a terminal status without going through the scheduler.
    #[error("invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: RunStatus, to: RunStatus },
    #[error("lock on task {0} timed out")]
    LockTimeout(DocId),
    #[error("storage operation failed")]
    Store,
}

/// The views the tracker expects the store to index. Register these on the
/// backend at process startup, before any poller runs.
pub fn standard_views() -> Vec<(&'static str, ViewFn)> {
    vec![
        (VIEW_RUNS_BY_STATUS, runs_by_status as ViewFn),
        (VIEW_RUNS_BY_HASH, runs_by_hash as ViewFn),
        (VIEW_TASKS_BY_TRANSITION, tasks_by_transition as ViewFn),
        (VIEW_JOBS_BY_AUTHOR, jobs_by_author as ViewFn),
    ]
}

fn body_str(doc: &Document, field: &str) -> Vec<String> {
    doc.body
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| vec![s.to_string()])
        .unwrap_or_default()
}

fn runs_by_status(doc: &Document) -> Vec<String> {
    if doc.kind != KIND_RUN {
        return Vec::new();
    }
    body_str(doc, "status")
}

fn runs_by_hash(doc: &Document) -> Vec<String> {
    if doc.kind != KIND_RUN {
        return Vec::new();
    }
    body_str(doc, "files_key")
}

fn tasks_by_transition(doc: &Document) -> Vec<String> {
    if doc.kind != KIND_TASK {
        return Vec::new();
    }
    body_str(doc, "transition")
}

fn jobs_by_author(doc: &Document) -> Vec<String> {
    if doc.kind != KIND_JOB {
        return Vec::new();
    }
    body_str(doc, "author")
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// Content hash of a single input file.
pub(crate) fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_digest(hasher)
}

/// Dedup key over a whole input-file set: the hash of the sorted
/// `name:content-hash` lines. Two jobs with the same key computed the same
/// inputs and may share a completed run.
pub(crate) fn fileset_key(hashes: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, hash) in hashes {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hex_digest(hasher)
}
