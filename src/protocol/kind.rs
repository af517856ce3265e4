/// Reserved `job_name` for the broker's answer to a handshake.
pub const CONNECTION_RESPONSE: &str = "connection_response";
/// Reserved `job_name` for a liveness probe.
pub const HEARTBEAT: &str = "heartbeat";
/// Reserved `job_name` for a generic job hand-off.
pub const JOB_REQUEST: &str = "job_request";
/// Reserved `job_name` for a broker-initiated shutdown.
pub const CLOSE: &str = "close";

/// Names a worker may not advertise as capabilities.
pub const RESERVED_NAMES: [&str; 4] = [CONNECTION_RESPONSE, HEARTBEAT, JOB_REQUEST, CLOSE];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// A capability name must be non-empty and free of whitespace and control
/// characters.
pub fn is_valid_job_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Kind of an inbound frame, derived from its `job_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ConnectionResponse,
    Heartbeat,
    Job,
    Close,
}

/// A `job_name` that maps to no known message kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported message type: {0:?}")]
pub struct UnsupportedMessage(pub String);

impl MessageKind {
    pub fn parse(job_name: &str) -> Result<Self, UnsupportedMessage> {
        match job_name {
            CONNECTION_RESPONSE => Ok(MessageKind::ConnectionResponse),
            HEARTBEAT => Ok(MessageKind::Heartbeat),
            CLOSE => Ok(MessageKind::Close),
            JOB_REQUEST => Ok(MessageKind::Job),
            name if is_valid_job_name(name) => Ok(MessageKind::Job),
            other => Err(UnsupportedMessage(other.to_string())),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::ConnectionResponse => write!(f, "connection_response"),
            MessageKind::Heartbeat => write!(f, "heartbeat"),
            MessageKind::Job => write!(f, "job"),
            MessageKind::Close => write!(f, "close"),
        }
    }
}
