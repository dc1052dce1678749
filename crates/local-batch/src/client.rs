use std::borrow::Cow;
use std::path::PathBuf;
use std::process::Stdio;

use error_stack::{IntoReport, Report, ResultExt};
use futures::stream::TryStreamExt;
use gridmill_tracker::batch::{BatchClient, BatchError, FileMap, RemoteHandle, RemoteStatus, ResourceRequest};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{event, Level};

struct LocalJob {
    workdir: PathBuf,
    input_names: Vec<String>,
    child: tokio::process::Child,
}

/// [`BatchClient`] that runs each submission as a child process.
///
/// Input files are materialized into a scratch directory, the configured
/// command runs with that directory as its working directory, and every
/// regular file the command leaves behind (other than the inputs) is
/// harvested as an output. Resource limits in the request are not enforced;
/// the request's application tag is exported so one command can dispatch on
/// it.
pub struct LocalBatchClient {
    program: String,
    args: Vec<String>,
    /// A scratch directory to use instead of the system default.
    pub tmpdir: Option<PathBuf>,
    jobs: Mutex<HashMap<RemoteHandle, LocalJob>>,
}

impl LocalBatchClient {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            tmpdir: None,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_tmpdir(mut self, dir: PathBuf) -> Self {
        self.tmpdir = Some(dir);
        self
    }
}

#[async_trait::async_trait]
impl BatchClient for LocalBatchClient {
    async fn submit(
        &self,
        files: &FileMap,
        request: &ResourceRequest,
    ) -> Result<RemoteHandle, Report<BatchError>> {
        let base = self
            .tmpdir
            .as_deref()
            .map(Cow::from)
            .unwrap_or_else(|| Cow::from(std::env::temp_dir()));
        let prefix: u64 = rand::thread_rng().gen();
        let workdir = base.join(format!("gridmill-{prefix:016x}"));

        tokio::fs::create_dir_all(&workdir)
            .await
            .into_report()
            .change_context(BatchError::SubmitFailed)
            .attach_printable("failed to create job working directory")?;
        for (name, bytes) in files {
            tokio::fs::write(workdir.join(name), bytes)
                .await
                .into_report()
                .change_context(BatchError::SubmitFailed)
                .attach_printable_lazy(|| format!("failed to write input file {name}"))?;
        }

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&workdir)
            .env("GRIDMILL_APPLICATION", &request.application)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .into_report()
            .change_context(BatchError::SubmitFailed)
            .attach_printable_lazy(|| format!("failed to spawn {}", self.program))?;

        let handle = RemoteHandle::new(format!("local-{prefix:016x}"));
        if let Some(stdout) = child.stdout.take() {
            let reader = tokio::io::BufReader::new(stdout);
            let job = handle.clone();
            tokio::task::spawn(async move {
                let mut lines = LinesStream::new(reader.lines());
                while let Ok(Some(line)) = lines.try_next().await {
                    event!(Level::DEBUG, %job, "stdout: {line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let reader = tokio::io::BufReader::new(stderr);
            let job = handle.clone();
            tokio::task::spawn(async move {
                let mut lines = LinesStream::new(reader.lines());
                while let Ok(Some(line)) = lines.try_next().await {
                    event!(Level::WARN, %job, "stderr: {line}");
                }
            });
        }

        self.jobs.lock().insert(
            handle.clone(),
            LocalJob {
                workdir,
                input_names: files.keys().cloned().collect(),
                child,
            },
        );
        event!(Level::INFO, %handle, "spawned local job");
        Ok(handle)
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, Report<BatchError>> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(handle)
            .ok_or_else(|| Report::new(BatchError::StatusFailed))?;
        match job.child.try_wait() {
            Ok(None) => Ok(RemoteStatus::Running),
            Ok(Some(status)) if status.success() => Ok(RemoteStatus::Finished),
            Ok(Some(_)) => Ok(RemoteStatus::Failed),
            Err(e) => Err(Report::new(e).change_context(BatchError::StatusFailed)),
        }
    }

    async fn fetch_results(&self, handle: &RemoteHandle) -> Result<FileMap, Report<BatchError>> {
        let (workdir, input_names) = {
            let jobs = self.jobs.lock();
            let job = jobs
                .get(handle)
                .ok_or_else(|| Report::new(BatchError::FetchFailed))?;
            (job.workdir.clone(), job.input_names.clone())
        };

        let mut outputs = FileMap::new();
        let mut entries = tokio::fs::read_dir(&workdir)
            .await
            .into_report()
            .change_context(BatchError::FetchFailed)?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .into_report()
            .change_context(BatchError::FetchFailed)?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if input_names.contains(&name) {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .into_report()
                .change_context(BatchError::FetchFailed)?;
            if !meta.is_file() {
                continue;
            }
            let bytes = tokio::fs::read(entry.path())
                .await
                .into_report()
                .change_context(BatchError::FetchFailed)
                .attach_printable_lazy(|| format!("failed to read output file {name}"))?;
            outputs.insert(name, bytes);
        }
        Ok(outputs)
    }

    async fn cancel(&self, handle: &RemoteHandle) -> Result<(), Report<BatchError>> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(handle)
            .ok_or_else(|| Report::new(BatchError::CancelFailed))?;
        job.child
            .start_kill()
            .into_report()
            .change_context(BatchError::CancelFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> LocalBatchClient {
        LocalBatchClient::new("sh", ["-c".to_string(), script.to_string()])
    }

    fn inputs() -> FileMap {
        let mut files = FileMap::new();
        files.insert("geom.inp".to_string(), b"O 0 0 0\n".to_vec());
        files
    }

    async fn wait_for_exit(client: &LocalBatchClient, handle: &RemoteHandle) -> RemoteStatus {
        for _ in 0..100 {
            let status = client.status(handle).await.unwrap();
            if status != RemoteStatus::Running {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("local job did not exit");
    }

    #[tokio::test]
    async fn harvests_everything_but_the_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let client =
            sh("cat geom.inp > geom.out && echo done > status.log").with_tmpdir(dir.path().into());

        let handle = client
            .submit(&inputs(), &ResourceRequest::new("gamess"))
            .await
            .unwrap();
        assert_eq!(wait_for_exit(&client, &handle).await, RemoteStatus::Finished);

        let outputs = client.fetch_results(&handle).await.unwrap();
        assert_eq!(
            outputs.keys().collect::<Vec<_>>(),
            ["geom.out", "status.log"]
        );
        assert_eq!(outputs["geom.out"], b"O 0 0 0\n");
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failed() {
        let dir = tempfile::tempdir().unwrap();
        let client = sh("exit 3").with_tmpdir(dir.path().into());

        let handle = client
            .submit(&inputs(), &ResourceRequest::new("gamess"))
            .await
            .unwrap();
        assert_eq!(wait_for_exit(&client, &handle).await, RemoteStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let client = sh("sleep 60").with_tmpdir(dir.path().into());

        let handle = client
            .submit(&inputs(), &ResourceRequest::new("gamess"))
            .await
            .unwrap();
        assert_eq!(client.status(&handle).await.unwrap(), RemoteStatus::Running);
        client.cancel(&handle).await.unwrap();
        assert_eq!(wait_for_exit(&client, &handle).await, RemoteStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_handles_are_rejected() {
        let client = sh("true");
        let err = client
            .status(&RemoteHandle::new("local-bogus"))
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), BatchError::StatusFailed));
    }
}
