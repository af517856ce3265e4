//! Wire protocol shared by the broker and its workers.
//!
//! Every frame is a JSON text message over a WebSocket. The worker sends a
//! [`ConnectionRequest`] once, then both sides exchange [`JobRequest`] and
//! [`JobResponse`] envelopes. Control traffic (handshake answer, heartbeat
//! probes, shutdown) rides inside [`JobRequest`] under a reserved `job_name`;
//! see [`kind`].

pub mod kind;
pub mod messages;

pub use kind::MessageKind;
pub use messages::{
    ConnectionReason, ConnectionRequest, ConnectionResponse, Heartbeat, JobRequest, JobResponse,
};

/// WebSocket close codes used by both sides.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
}

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

impl Outbound {
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Outbound::Text(serde_json::to_string(value)?))
    }

    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Outbound::Close {
            code,
            reason: reason.into(),
        }
    }
}
