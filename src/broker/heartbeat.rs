use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::broker::registry::{PendingJob, SessionId};
use crate::broker::router::JobRouter;
use crate::config::HeartbeatConfig;
use crate::protocol::kind::HEARTBEAT;
use crate::protocol::{close_code, Heartbeat, JobRequest, Outbound};

/// Sessions touched by one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<SessionId>,
    pub probed: Vec<SessionId>,
}

/// Periodic liveness check over every registered worker session.
pub struct HeartbeatMonitor {
    router: JobRouter,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(router: JobRouter, config: HeartbeatConfig) -> Self {
        Self { router, config }
    }

    /// Sweep on every interval tick until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        // The first tick completes immediately; nothing is stale yet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Heartbeat monitor stopping");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.sweep(Utc::now()).await;
                    if !report.evicted.is_empty() || !report.probed.is_empty() {
                        tracing::debug!(
                            evicted = report.evicted.len(),
                            probed = report.probed.len(),
                            "Heartbeat sweep"
                        );
                    }
                }
            }
        }
    }

    /// One pass over the registry as of `now`.
    ///
    /// Closed and dead sessions are collected during the pass and removed
    /// after it; idle sessions get a heartbeat probe.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut guard = self.router.state().lock().await;
        let state = &mut *guard;

        for session in state.sessions.iter() {
            if session.is_closed() {
                tracing::info!(session_id = %session.id(), name = %session.name(), "Session closed, evicting");
                report.evicted.push(session.id());
                continue;
            }

            let idle = session.idle_for(now);
            if idle > self.config.dead_after {
                tracing::warn!(
                    session_id = %session.id(),
                    name = %session.name(),
                    idle_secs = idle.as_secs(),
                    "Worker unresponsive, evicting"
                );
                session.send(Outbound::close(close_code::GOING_AWAY, "Heartbeat timeout"));
                report.evicted.push(session.id());
            } else if idle > self.config.stale_after {
                let job_id = self.router.next_job_id();
                let probe = JobRequest {
                    job_id: job_id.clone(),
                    job_name: HEARTBEAT.to_string(),
                    job_data: match serde_json::to_string(&Heartbeat::new(now)) {
                        Ok(data) => data,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode heartbeat");
                            continue;
                        }
                    },
                    client_name: self.router.identity().to_string(),
                };
                let sent = Outbound::json(&probe)
                    .map(|frame| session.send(frame))
                    .unwrap_or(false);
                if sent {
                    state
                        .pending
                        .insert(job_id, PendingJob::Probe { session: session.id() });
                    report.probed.push(session.id());
                } else {
                    report.evicted.push(session.id());
                }
            }
        }

        for id in &report.evicted {
            state.remove_session(*id);
        }

        report
    }
}
