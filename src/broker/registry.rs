use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{JobResponse, Outbound};

pub type SessionId = Uuid;

/// Result reported to callers whose worker went away mid-job.
pub const WORKER_DISCONNECTED: &str = "Worker disconnected";

/// A registered worker connection.
///
/// Built only after the handshake succeeds, so the capability set is fixed
/// for the lifetime of the session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    name: String,
    capabilities: HashSet<String>,
    last_heartbeat: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
}

impl Session {
    pub fn new<I>(
        id: SessionId,
        name: impl Into<String>,
        capabilities: I,
        outbound: mpsc::UnboundedSender<Outbound>,
        closed: CancellationToken,
    ) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            id,
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
            last_heartbeat: Utc::now(),
            outbound,
            closed,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &HashSet<String> {
        &self.capabilities
    }

    pub fn can_run(&self, job_name: &str) -> bool {
        self.capabilities.contains(job_name)
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.last_heartbeat
    }

    /// Record proof of life. Never moves the timestamp backwards.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_heartbeat {
            self.last_heartbeat = at;
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    /// Queue a frame for the connection writer. Returns false if the writer
    /// is gone.
    pub fn send(&self, frame: Outbound) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }

    /// Fire the completion signal; the connection's receive loop exits.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// Active sessions in registration order.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, session: Session) {
        tracing::info!(
            session_id = %session.id,
            name = %session.name,
            jobs = ?session.capabilities,
            "Worker registered"
        );
        self.sessions.push(session);
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let index = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.remove(index))
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// First session, in registration order, advertising `job_name`.
    pub fn find_capable(&self, job_name: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.can_run(job_name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Correlation entry for an in-flight `job_id`.
#[derive(Debug)]
pub enum PendingJob {
    /// A job dispatched on behalf of an API caller.
    Dispatched {
        session: SessionId,
        slot: oneshot::Sender<JobResponse>,
    },
    /// An outstanding heartbeat probe.
    Probe { session: SessionId },
}

impl PendingJob {
    pub fn session(&self) -> SessionId {
        match self {
            PendingJob::Dispatched { session, .. } | PendingJob::Probe { session } => *session,
        }
    }
}

/// Why a response could not be matched to a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmatched {
    Unknown,
    WrongSession(SessionId),
}

#[derive(Debug, Default)]
pub struct PendingJobs {
    entries: HashMap<String, PendingJob>,
}

impl PendingJobs {
    /// Record a pending entry. Returns false if `job_id` is already tracked.
    pub fn insert(&mut self, job_id: String, entry: PendingJob) -> bool {
        if self.entries.contains_key(&job_id) {
            return false;
        }
        self.entries.insert(job_id, entry);
        true
    }

    pub fn remove(&mut self, job_id: &str) -> Option<PendingJob> {
        self.entries.remove(job_id)
    }

    /// Remove the entry for `job_id` only if it belongs to `session`.
    pub fn take_from(&mut self, job_id: &str, session: SessionId) -> Result<PendingJob, Unmatched> {
        match self.entries.get(job_id).map(PendingJob::session) {
            None => Err(Unmatched::Unknown),
            Some(owner) if owner != session => Err(Unmatched::WrongSession(owner)),
            Some(_) => self.entries.remove(job_id).ok_or(Unmatched::Unknown),
        }
    }

    /// Resolve every entry owned by `session` as a failure. Returns the
    /// number of callers released.
    pub fn abandon_session(&mut self, session: SessionId) -> usize {
        let owned: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.session() == session)
            .map(|(job_id, _)| job_id.clone())
            .collect();

        let mut released = 0;
        for job_id in owned {
            if let Some(PendingJob::Dispatched { slot, .. }) = self.entries.remove(&job_id) {
                let _ = slot.send(JobResponse::failure(job_id, WORKER_DISCONNECTED));
                released += 1;
            }
        }
        released
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.entries.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything the broker shares between connections, the router and the
/// heartbeat sweep. Always accessed under one lock.
#[derive(Debug, Default)]
pub struct BrokerState {
    pub sessions: SessionRegistry,
    pub pending: PendingJobs,
}

impl BrokerState {
    /// Unregister a session, fire its completion signal and fail the jobs
    /// still waiting on it.
    pub fn remove_session(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        session.close();
        let released = self.pending.abandon_session(id);
        tracing::info!(
            session_id = %id,
            name = %session.name(),
            released,
            "Worker removed"
        );
        Some(session)
    }
}
