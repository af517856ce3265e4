use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::JobConfig;
use crate::protocol::{JobRequest, JobResponse};

pub const JOB_NOT_FOUND: &str = "Job not found";
pub const CLIENT_NOT_ALLOWED: &str = "Client not allowed";

/// How long output readers may keep draining after the process is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs configured jobs as local processes.
///
/// Synchronous jobs are awaited by the caller. Asynchronous jobs are handed
/// to a [`TaskTracker`] and supervised in the background until they exit,
/// time out or the executor shuts down.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    jobs: Arc<BTreeMap<String, JobConfig>>,
    background: TaskTracker,
    shutdown: CancellationToken,
}

impl JobExecutor {
    pub fn new(jobs: BTreeMap<String, JobConfig>) -> Self {
        Self {
            jobs: Arc::new(jobs),
            background: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Advertised job names, sorted.
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    /// Number of async jobs still running.
    pub fn background_jobs(&self) -> usize {
        self.background.len()
    }

    /// Run the job named by `request` and build the response to send back.
    ///
    /// Never fails: lookup, authorization and spawn problems all come back as
    /// `success = false` with a readable `result`.
    pub async fn execute(&self, request: &JobRequest) -> JobResponse {
        let Some(config) = self.jobs.get(&request.job_name) else {
            tracing::warn!(job_id = %request.job_id, job_name = %request.job_name, "Job not found in configuration");
            return JobResponse::failure(&request.job_id, JOB_NOT_FOUND);
        };

        if !config.permits(&request.client_name) {
            tracing::warn!(
                job_id = %request.job_id,
                job_name = %request.job_name,
                client = %request.client_name,
                "Client not allowed to run job"
            );
            return JobResponse::failure(&request.job_id, CLIENT_NOT_ALLOWED);
        }

        tracing::info!(
            job_id = %request.job_id,
            job_name = %request.job_name,
            client = %request.client_name,
            executable = %config.executable,
            is_async = config.is_async,
            "Executing job"
        );

        let running = match RunningJob::spawn(request, config) {
            Ok(running) => running,
            Err(e) => {
                tracing::error!(job_id = %request.job_id, error = %e, "Failed to start process");
                return JobResponse::failure(&request.job_id, format!("Failed to start process: {e}"));
            }
        };

        if config.is_async {
            self.supervise(request.job_id.clone(), running, config.timeout());
            return JobResponse {
                job_id: request.job_id.clone(),
                success: true,
                is_async: true,
                result: None,
            };
        }

        let (status, output) = running.wait(config.timeout()).await;
        let success = matches!(status, Exit::Exited(s) if s.success());
        tracing::info!(job_id = %request.job_id, status = %status, success, "Job finished");

        JobResponse {
            job_id: request.job_id.clone(),
            success,
            is_async: false,
            result: Some(output),
        }
    }

    /// Stop every background job and wait for their supervisors to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.background.close();
        self.background.wait().await;
    }

    fn supervise(&self, job_id: String, mut running: RunningJob, limit: Duration) {
        let shutdown = self.shutdown.clone();
        self.background.spawn(async move {
            let waited = tokio::select! {
                _ = shutdown.cancelled() => None,
                waited = tokio::time::timeout(limit, running.child.wait()) => Some(waited),
            };

            let status = match waited {
                Some(Ok(Ok(status))) => Exit::Exited(status),
                Some(Ok(Err(e))) => Exit::WaitFailed(e.to_string()),
                Some(Err(_)) => {
                    running.kill().await;
                    Exit::TimedOut
                }
                None => {
                    running.kill().await;
                    Exit::Cancelled
                }
            };
            running.drain_output().await;
            tracing::info!(job_id = %job_id, status = %status, "Background job finished");
        });
    }
}

/// How a process wait ended.
#[derive(Debug)]
enum Exit {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(String),
}

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exit::Exited(status) => write!(f, "{status}"),
            Exit::TimedOut => write!(f, "timed out"),
            Exit::Cancelled => write!(f, "cancelled"),
            Exit::WaitFailed(e) => write!(f, "wait failed: {e}"),
        }
    }
}

/// A spawned job process and the tasks capturing its output.
struct RunningJob {
    job_id: String,
    child: Child,
    output: Arc<Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
}

impl RunningJob {
    fn spawn(request: &JobRequest, config: &JobConfig) -> std::io::Result<Self> {
        let mut child = Command::new(&config.executable)
            .args(config.argv())
            .env("JOB_ID", &request.job_id)
            .env("JOB_NAME", &request.job_name)
            .env("JOB_CLIENT", &request.client_name)
            .env("JOB_DATA", &request.job_data)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture_lines(
                stdout,
                output.clone(),
                request.job_id.clone(),
                config.log_output,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture_lines(
                stderr,
                output.clone(),
                request.job_id.clone(),
                config.log_output,
            )));
        }

        Ok(Self {
            job_id: request.job_id.clone(),
            child,
            output,
            readers,
        })
    }

    /// Wait up to `limit` for the process, killing it on overrun. Returns the
    /// exit and everything captured so far.
    async fn wait(mut self, limit: Duration) -> (Exit, String) {
        let waited = tokio::time::timeout(limit, self.child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => Exit::Exited(status),
            Ok(Err(e)) => Exit::WaitFailed(e.to_string()),
            Err(_) => {
                tracing::warn!(job_id = %self.job_id, timeout_ms = limit.as_millis() as u64, "Job timed out, killing process");
                self.kill().await;
                Exit::TimedOut
            }
        };
        self.drain_output().await;
        let output = self.output.lock().await.clone();
        (status, output)
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to kill process");
        }
    }

    /// Give the readers a bounded window to reach end of stream.
    async fn drain_output(&mut self) {
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                abort.abort();
            }
        }
    }
}

/// Append each line from `stream` to the shared buffer in arrival order.
async fn capture_lines<R>(stream: R, output: Arc<Mutex<String>>, job_id: String, echo: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                if echo {
                    tracing::info!(job_id = %job_id, line = %text.trim_end(), "Job output");
                }
                output.lock().await.push_str(&text);
            }
            Err(e) => {
                tracing::debug!(job_id = %job_id, error = %e, "Output stream failed");
                break;
            }
        }
    }
}
