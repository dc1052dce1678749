//! Port for the external batch-submission system (ARC/SGE/SSH and friends).

#[cfg(feature = "inprocess")]
pub mod fail_wrapper;
#[cfg(feature = "inprocess")]
pub mod inprocess;

use std::collections::BTreeMap;
use std::fmt;

use error_stack::Report;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The opaque token a batch system hands back for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteHandle(String);

impl RemoteHandle {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Remote-side view of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Queued,
    Running,
    Finished,
    Failed,
}

/// Resource request attached to a run: which application to execute, where,
/// and with how much of the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Application tag the batch system resolves to an executable, e.g. `gamess`.
    pub application: String,
    /// Target resource/cluster name. `None` lets the backend pick.
    pub resource: Option<String>,
    pub cores: u32,
    pub memory_gb: u32,
    pub walltime_hours: Option<u32>,
}

impl ResourceRequest {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            resource: None,
            cores: 2,
            memory_gb: 2,
            walltime_hours: Some(2),
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    /// Credentials or connectivity to the batch system have lapsed. The only
    /// transient kind: affected runs park in `UNREACHABLE`/`NOTIFIED` and are
    /// retried on every pass until access is restored out-of-band.
    #[error("batch system authentication or connectivity failure")]
    Auth,
    #[error("job submission was rejected")]
    SubmitFailed,
    #[error("status query failed")]
    StatusFailed,
    #[error("result retrieval failed")]
    FetchFailed,
    #[error("cancel request failed")]
    CancelFailed,
}

impl BatchError {
    /// Whether this failure is the transient credential/connectivity class.
    pub fn is_auth(&self) -> bool {
        matches!(self, BatchError::Auth)
    }
}

/// Named map of files, content by file name.
pub type FileMap = BTreeMap<String, Vec<u8>>;

/// Client for the external batch system. Calls are synchronous requests
/// expected to return quickly; long waits live in the poller's tick, never
/// inside an implementation.
#[async_trait::async_trait]
pub trait BatchClient: Send + Sync {
    /// Submit the given input files for execution, returning the remote
    /// handle used for all later queries.
    async fn submit(
        &self,
        files: &FileMap,
        request: &ResourceRequest,
    ) -> Result<RemoteHandle, Report<BatchError>>;

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, Report<BatchError>>;

    /// Retrieve the output files of a finished job.
    async fn fetch_results(&self, handle: &RemoteHandle) -> Result<FileMap, Report<BatchError>>;

    /// Best-effort cancellation of a queued or running job.
    async fn cancel(&self, handle: &RemoteHandle) -> Result<(), Report<BatchError>>;
}
