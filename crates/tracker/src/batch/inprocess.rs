//! Run "remote" jobs inside the tracker's own process. This is only really
//! useful for tests and the demo binary: the supplied closure plays the part
//! of the compute cluster, mapping a submission's input files to its output
//! files.

use std::future::Future;

use ahash::{HashMap, HashMapExt};
use error_stack::Report;
use parking_lot::Mutex;

use super::{BatchClient, BatchError, FileMap, RemoteHandle, RemoteStatus, ResourceRequest};

/// Everything an in-process job gets to see about its submission.
pub struct SubmittedJob {
    pub handle: RemoteHandle,
    pub files: FileMap,
    pub request: ResourceRequest,
}

struct Slot {
    running_polls: u32,
    cancelled: bool,
    outcome: Result<FileMap, String>,
}

struct State {
    next_id: u64,
    submissions: u64,
    cancelled: Vec<RemoteHandle>,
    jobs: HashMap<RemoteHandle, Slot>,
}

/// Closure-driven [`BatchClient`] fake. The job function runs to completion
/// during `submit`, but `status` still reports `Running` for a configurable
/// number of polls first, so poller tests observe the full status
/// progression.
pub struct InProcessBatchClient<F, FUNC>
where
    F: Future<Output = Result<FileMap, BatchError>> + Send,
    FUNC: Fn(SubmittedJob) -> F + Send + Sync,
{
    job_fn: FUNC,
    running_polls: u32,
    state: Mutex<State>,
}

impl<F, FUNC> InProcessBatchClient<F, FUNC>
where
    F: Future<Output = Result<FileMap, BatchError>> + Send,
    FUNC: Fn(SubmittedJob) -> F + Send + Sync,
{
    pub fn new(job_fn: FUNC) -> Self {
        Self {
            job_fn,
            running_polls: 1,
            state: Mutex::new(State {
                next_id: 0,
                submissions: 0,
                cancelled: Vec::new(),
                jobs: HashMap::new(),
            }),
        }
    }

    /// Number of `status` calls that report `Running` before `Finished`.
    pub fn with_running_polls(mut self, polls: u32) -> Self {
        self.running_polls = polls;
        self
    }

    /// How many submissions this client has accepted. The dedup tests assert
    /// on this to prove a reused run never reached the batch system twice.
    pub fn submission_count(&self) -> u64 {
        self.state.lock().submissions
    }

    /// Handles that have received a cancel request, in call order.
    pub fn cancelled_handles(&self) -> Vec<RemoteHandle> {
        self.state.lock().cancelled.clone()
    }

    fn unknown_handle(handle: &RemoteHandle) -> Report<BatchError> {
        Report::new(BatchError::StatusFailed)
            .attach_printable(format!("unknown remote handle {handle}"))
    }
}

#[async_trait::async_trait]
impl<F, FUNC> BatchClient for InProcessBatchClient<F, FUNC>
where
    F: Future<Output = Result<FileMap, BatchError>> + Send,
    FUNC: Fn(SubmittedJob) -> F + Send + Sync,
{
    async fn submit(
        &self,
        files: &FileMap,
        request: &ResourceRequest,
    ) -> Result<RemoteHandle, Report<BatchError>> {
        let handle = {
            let mut state = self.state.lock();
            state.next_id += 1;
            state.submissions += 1;
            RemoteHandle::new(format!("inprocess-{}", state.next_id))
        };

        let job = SubmittedJob {
            handle: handle.clone(),
            files: files.clone(),
            request: request.clone(),
        };
        let outcome = (self.job_fn)(job).await.map_err(|e| e.to_string());

        self.state.lock().jobs.insert(
            handle.clone(),
            Slot {
                running_polls: self.running_polls,
                cancelled: false,
                outcome,
            },
        );
        Ok(handle)
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, Report<BatchError>> {
        let mut state = self.state.lock();
        let slot = state
            .jobs
            .get_mut(handle)
            .ok_or_else(|| Self::unknown_handle(handle))?;
        if slot.cancelled {
            return Ok(RemoteStatus::Failed);
        }
        if slot.running_polls > 0 {
            slot.running_polls -= 1;
            return Ok(RemoteStatus::Running);
        }
        Ok(match slot.outcome {
            Ok(_) => RemoteStatus::Finished,
            Err(_) => RemoteStatus::Failed,
        })
    }

    async fn fetch_results(&self, handle: &RemoteHandle) -> Result<FileMap, Report<BatchError>> {
        let state = self.state.lock();
        let slot = state
            .jobs
            .get(handle)
            .ok_or_else(|| Self::unknown_handle(handle))?;
        match &slot.outcome {
            Ok(files) => Ok(files.clone()),
            Err(msg) => {
                Err(Report::new(BatchError::FetchFailed).attach_printable(msg.clone()))
            }
        }
    }

    async fn cancel(&self, handle: &RemoteHandle) -> Result<(), Report<BatchError>> {
        let mut state = self.state.lock();
        state.cancelled.push(handle.clone());
        if let Some(slot) = state.jobs.get_mut(handle) {
            slot.cancelled = true;
        }
        Ok(())
    }
}
