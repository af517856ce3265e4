use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome code carried by a [`ConnectionResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionReason {
    Success,
    InvalidKey,
    InvalidName,
    InvalidJobs,
    InvalidPayload,
}

impl std::fmt::Display for ConnectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionReason::Success => write!(f, "Success"),
            ConnectionReason::InvalidKey => write!(f, "InvalidKey"),
            ConnectionReason::InvalidName => write!(f, "InvalidName"),
            ConnectionReason::InvalidJobs => write!(f, "InvalidJobs"),
            ConnectionReason::InvalidPayload => write!(f, "InvalidPayload"),
        }
    }
}

/// First frame a worker sends after the socket opens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub client_secret: Option<String>,
    pub friendly_name: Option<String>,
    pub jobs_available: Option<Vec<String>>,
}

/// Broker's answer to a [`ConnectionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub success: bool,
    pub reason: ConnectionReason,
}

impl ConnectionResponse {
    pub fn accepted() -> Self {
        Self {
            success: true,
            reason: ConnectionReason::Success,
        }
    }

    pub fn rejected(reason: ConnectionReason) -> Self {
        Self {
            success: false,
            reason,
        }
    }
}

/// Request envelope. Control frames (handshake answer, heartbeat probe,
/// close) reuse this shape with a reserved `job_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    pub job_name: String,
    pub job_data: String,
    pub client_name: String,
}

/// Response envelope, correlated to a [`JobRequest`] by `job_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: String,
    pub success: bool,
    #[serde(rename = "async")]
    pub is_async: bool,
    #[serde(default)]
    pub result: Option<String>,
}

impl JobResponse {
    pub fn failure(job_id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            success: false,
            is_async: false,
            result: Some(result.into()),
        }
    }
}

/// Liveness probe payload, embedded as `job_data` on the way out and as
/// `result` on the way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Written by the broker.
    pub timestamp: DateTime<Utc>,
    /// Written back by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged: Option<DateTime<Utc>>,
}

impl Heartbeat {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            acknowledged: None,
        }
    }

    pub fn acknowledge(mut self, at: DateTime<Utc>) -> Self {
        self.acknowledged = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn connection_request_round_trip() {
        let req = ConnectionRequest {
            client_secret: Some("s3cret".to_string()),
            friendly_name: Some("build-box".to_string()),
            jobs_available: Some(vec!["build".to_string(), "deploy".to_string()]),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ConnectionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn connection_request_missing_fields_are_none() {
        let req: ConnectionRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req, ConnectionRequest::default());
    }

    #[test]
    fn connection_reason_serializes_as_variant_name() {
        let resp = ConnectionResponse::rejected(ConnectionReason::InvalidKey);
        let json = serde_json::to_value(resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["reason"], "InvalidKey");

        let back: ConnectionResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn job_response_uses_async_key() {
        let resp = JobResponse {
            job_id: "7".to_string(),
            success: true,
            is_async: true,
            result: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["async"], true);
        assert!(json.get("is_async").is_none());

        let back: JobResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn job_request_round_trip() {
        let req = JobRequest {
            job_id: "42".to_string(),
            job_name: "build".to_string(),
            job_data: r#"{"branch":"main"}"#.to_string(),
            client_name: "ci".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: JobRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn unacknowledged_heartbeat_omits_acknowledged() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let hb = Heartbeat::new(ts);
        let json = serde_json::to_string(&hb).unwrap();
        assert!(!json.contains("acknowledged"));

        let back: Heartbeat = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hb);
        assert!(back.acknowledged.is_none());
    }

    #[test]
    fn acknowledged_heartbeat_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ack = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap();
        let hb = Heartbeat::new(ts).acknowledge(ack);
        let json = serde_json::to_string(&hb).unwrap();
        let back: Heartbeat = serde_json::from_str(&json).unwrap();
        assert_eq!(back.acknowledged, Some(ack));
        assert_eq!(back.timestamp, ts);
    }
}
