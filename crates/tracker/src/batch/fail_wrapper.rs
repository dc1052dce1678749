use error_stack::Report;

use super::{BatchClient, BatchError, FileMap, RemoteHandle, RemoteStatus, ResourceRequest};

/// The operation a [`FailingBatchClient`] is about to forward.
pub enum BatchOp<'a> {
    Submit {
        files: &'a FileMap,
        request: &'a ResourceRequest,
    },
    Status(&'a RemoteHandle),
    Fetch(&'a RemoteHandle),
    Cancel(&'a RemoteHandle),
}

/// Wraps another client and consults `fail_fn` before every call, so tests
/// can inject submission rejections or auth outages at exact points in a
/// run's lifecycle.
pub struct FailingBatchClient<CLIENT, FAILFUNC>
where
    CLIENT: BatchClient,
    FAILFUNC: Fn(&BatchOp) -> Result<(), BatchError> + Send + Sync + 'static,
{
    inner: CLIENT,
    fail_fn: FAILFUNC,
}

impl<CLIENT, FAILFUNC> FailingBatchClient<CLIENT, FAILFUNC>
where
    CLIENT: BatchClient,
    FAILFUNC: Fn(&BatchOp) -> Result<(), BatchError> + Send + Sync + 'static,
{
    pub fn new(inner: CLIENT, fail_fn: FAILFUNC) -> Self {
        Self { inner, fail_fn }
    }

    fn check(&self, op: BatchOp) -> Result<(), Report<BatchError>> {
        (self.fail_fn)(&op).map_err(Report::new)
    }
}

#[async_trait::async_trait]
impl<CLIENT, FAILFUNC> BatchClient for FailingBatchClient<CLIENT, FAILFUNC>
where
    CLIENT: BatchClient,
    FAILFUNC: Fn(&BatchOp) -> Result<(), BatchError> + Send + Sync + 'static,
{
    async fn submit(
        &self,
        files: &FileMap,
        request: &ResourceRequest,
    ) -> Result<RemoteHandle, Report<BatchError>> {
        self.check(BatchOp::Submit { files, request })?;
        self.inner.submit(files, request).await
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, Report<BatchError>> {
        self.check(BatchOp::Status(handle))?;
        self.inner.status(handle).await
    }

    async fn fetch_results(&self, handle: &RemoteHandle) -> Result<FileMap, Report<BatchError>> {
        self.check(BatchOp::Fetch(handle))?;
        self.inner.fetch_results(handle).await
    }

    async fn cancel(&self, handle: &RemoteHandle) -> Result<(), Report<BatchError>> {
        self.check(BatchOp::Cancel(handle))?;
        self.inner.cancel(handle).await
    }
}
