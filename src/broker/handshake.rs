use std::collections::{BTreeSet, HashSet};

use crate::protocol::close_code;
use crate::protocol::kind::{is_reserved, is_valid_job_name};
use crate::protocol::{ConnectionReason, ConnectionRequest};

/// What the broker checks a worker's first frame against.
#[derive(Debug, Clone)]
pub struct HandshakePolicy {
    /// Accepted secrets. `None` accepts any secret.
    pub allowed_secrets: Option<HashSet<String>>,
    /// The broker's own identity; workers may not claim it.
    pub broker_name: String,
}

impl HandshakePolicy {
    pub fn new(allowed_secrets: Option<Vec<String>>, broker_name: impl Into<String>) -> Self {
        Self {
            allowed_secrets: allowed_secrets.map(|s| s.into_iter().collect()),
            broker_name: broker_name.into(),
        }
    }
}

/// A worker that passed the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedWorker {
    pub friendly_name: String,
    pub jobs: BTreeSet<String>,
}

/// Validate a handshake frame. The first failing check decides the reason.
pub fn validate(frame: &str, policy: &HandshakePolicy) -> Result<AcceptedWorker, ConnectionReason> {
    let request: ConnectionRequest =
        serde_json::from_str(frame).map_err(|_| ConnectionReason::InvalidPayload)?;

    if let Some(allowed) = &policy.allowed_secrets {
        let known = request
            .client_secret
            .as_deref()
            .is_some_and(|secret| allowed.contains(secret));
        if !known {
            return Err(ConnectionReason::InvalidKey);
        }
    }

    let jobs = match request.jobs_available {
        Some(jobs) if !jobs.is_empty() => jobs,
        _ => return Err(ConnectionReason::InvalidJobs),
    };
    if jobs
        .iter()
        .any(|job| is_reserved(job) || !is_valid_job_name(job))
    {
        return Err(ConnectionReason::InvalidJobs);
    }

    let friendly_name = request.friendly_name.unwrap_or_default();
    let trimmed = friendly_name.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(&policy.broker_name) {
        return Err(ConnectionReason::InvalidName);
    }

    Ok(AcceptedWorker {
        friendly_name: trimmed.to_string(),
        jobs: jobs.into_iter().collect(),
    })
}

/// Close code sent after a rejected handshake.
pub fn rejection_close_code(reason: ConnectionReason) -> u16 {
    match reason {
        ConnectionReason::InvalidPayload => close_code::INVALID_PAYLOAD,
        _ => close_code::POLICY_VIOLATION,
    }
}
