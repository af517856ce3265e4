use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};

use crate::broker::registry::{BrokerState, PendingJob, Session, SessionId, Unmatched, WORKER_DISCONNECTED};
use crate::protocol::{Heartbeat, JobRequest, JobResponse, Outbound};

pub const NO_WORKER_AVAILABLE: &str = "No worker available";
pub const JOB_TIMED_OUT: &str = "Job timed out";

/// Issues correlation ids: decimal strings of a counter starting at 1.
#[derive(Debug, Default)]
pub struct JobIdAllocator {
    last: AtomicU64,
}

impl JobIdAllocator {
    pub fn next(&self) -> String {
        (self.last.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

/// What an API caller gets back from [`JobRouter::submit_job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub success: bool,
    #[serde(rename = "async")]
    pub is_async: bool,
    pub result: Option<String>,
}

impl JobOutcome {
    pub fn failure(result: impl Into<String>) -> Self {
        Self {
            success: false,
            is_async: false,
            result: Some(result.into()),
        }
    }
}

impl From<JobResponse> for JobOutcome {
    fn from(response: JobResponse) -> Self {
        Self {
            success: response.success,
            is_async: response.is_async,
            result: response.result,
        }
    }
}

/// Routes jobs to workers and correlates their responses.
///
/// Owns the broker's shared state; the connection tasks and the heartbeat
/// monitor go through this handle for every registry or correlation change.
#[derive(Debug, Clone)]
pub struct JobRouter {
    state: Arc<Mutex<BrokerState>>,
    ids: Arc<JobIdAllocator>,
    identity: Arc<str>,
    job_timeout: Option<Duration>,
}

impl JobRouter {
    pub fn new(identity: impl Into<String>, job_timeout: Option<Duration>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            ids: Arc::new(JobIdAllocator::default()),
            identity: Arc::from(identity.into()),
            job_timeout,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn next_job_id(&self) -> String {
        self.ids.next()
    }

    pub(crate) fn state(&self) -> &Arc<Mutex<BrokerState>> {
        &self.state
    }

    pub async fn register(&self, session: Session) {
        self.state.lock().await.sessions.register(session);
    }

    pub async fn remove_session(&self, id: SessionId) -> Option<Session> {
        self.state.lock().await.remove_session(id)
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Registered sessions as `(id, friendly name)`, in registration order.
    pub async fn sessions(&self) -> Vec<(SessionId, String)> {
        self.state
            .lock()
            .await
            .sessions
            .iter()
            .map(|s| (s.id(), s.name().to_string()))
            .collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Run `job_name` on the first connected worker that advertises it and
    /// wait for its response.
    pub async fn submit_job(&self, job_name: &str, job_data: &str, caller: &str) -> JobOutcome {
        let (job_id, slot) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let Some(session) = state.sessions.find_capable(job_name) else {
                tracing::info!(job_name, caller, "No worker available for job");
                return JobOutcome::failure(NO_WORKER_AVAILABLE);
            };

            let job_id = self.ids.next();
            let request = JobRequest {
                job_id: job_id.clone(),
                job_name: job_name.to_string(),
                job_data: job_data.to_string(),
                client_name: caller.to_string(),
            };
            let frame = match Outbound::json(&request) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to encode job request");
                    return JobOutcome::failure(format!("Failed to encode job request: {e}"));
                }
            };

            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                job_id.clone(),
                PendingJob::Dispatched {
                    session: session.id(),
                    slot: tx,
                },
            );
            if !session.send(frame) {
                state.pending.remove(&job_id);
                tracing::warn!(job_id = %job_id, session_id = %session.id(), "Worker connection already closed");
                return JobOutcome::failure(WORKER_DISCONNECTED);
            }

            tracing::info!(
                job_id = %job_id,
                job_name,
                caller,
                worker = %session.name(),
                "Job dispatched"
            );
            (job_id, rx)
        };

        let received = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, slot).await {
                Ok(received) => received,
                Err(_) => {
                    self.state.lock().await.pending.remove(&job_id);
                    tracing::warn!(job_id = %job_id, timeout_secs = limit.as_secs(), "Job timed out");
                    return JobOutcome::failure(JOB_TIMED_OUT);
                }
            },
            None => slot.await,
        };

        match received {
            Ok(response) => {
                tracing::info!(job_id = %job_id, success = response.success, is_async = response.is_async, "Job completed");
                JobOutcome::from(response)
            }
            Err(_) => JobOutcome::failure(WORKER_DISCONNECTED),
        }
    }

    /// Handle a response frame read from `session`'s connection.
    pub async fn handle_response(&self, session: SessionId, response: JobResponse) {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if let Some(s) = state.sessions.get_mut(session) {
            s.touch(now);
        }

        match state.pending.take_from(&response.job_id, session) {
            Ok(PendingJob::Probe { .. }) => {
                let parsed = response
                    .result
                    .as_deref()
                    .map(serde_json::from_str::<Heartbeat>);
                match parsed {
                    Some(Ok(heartbeat)) => {
                        let round_trip_ms = (now - heartbeat.timestamp).num_milliseconds();
                        tracing::debug!(
                            session_id = %session,
                            job_id = %response.job_id,
                            round_trip_ms,
                            "Heartbeat acknowledged"
                        );
                    }
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %session, error = %e, "Malformed heartbeat acknowledgement");
                    }
                    None => {
                        tracing::warn!(session_id = %session, "Heartbeat acknowledgement without payload");
                    }
                }
            }
            Ok(PendingJob::Dispatched { slot, .. }) => {
                let job_id = response.job_id.clone();
                if slot.send(response).is_err() {
                    tracing::debug!(job_id = %job_id, "Caller no longer waiting for job result");
                }
            }
            Err(Unmatched::Unknown) => {
                tracing::warn!(session_id = %session, job_id = %response.job_id, "Response for unknown job dropped");
            }
            Err(Unmatched::WrongSession(owner)) => {
                tracing::warn!(
                    session_id = %session,
                    owner = %owner,
                    job_id = %response.job_id,
                    "Response from a session that does not own the job dropped"
                );
            }
        }
    }
}
