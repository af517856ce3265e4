use chrono::Utc;

use crate::error::{FabricError, Result};
use crate::protocol::{
    close_code, ConnectionResponse, Heartbeat, JobRequest, JobResponse, MessageKind, Outbound,
};
use crate::worker::executor::JobExecutor;

/// What the connection loop should do after a frame has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Send this frame back to the broker.
    Send(Outbound),
    /// Nothing to send; keep reading.
    Nothing,
    /// The broker asked the worker to stop.
    Stop,
}

/// Handles inbound broker frames one at a time.
///
/// Any `Err` is fatal for the worker: the caller closes the connection with
/// [`close_frame_for`] and stops.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    executor: JobExecutor,
}

impl Dispatcher {
    pub fn new(executor: JobExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    pub async fn dispatch(&self, frame: &str) -> Result<Reply> {
        let request: JobRequest = serde_json::from_str(frame)?;
        let kind = MessageKind::parse(&request.job_name)?;
        tracing::debug!(job_id = %request.job_id, kind = %kind, "Received frame");

        match kind {
            MessageKind::ConnectionResponse => {
                let response: ConnectionResponse = serde_json::from_str(&request.job_data)?;
                tracing::info!(
                    success = response.success,
                    reason = %response.reason,
                    "Connection status"
                );
                if response.success {
                    Ok(Reply::Nothing)
                } else {
                    Err(FabricError::HandshakeRejected(response.reason))
                }
            }
            MessageKind::Heartbeat => {
                let heartbeat: Heartbeat = serde_json::from_str(&request.job_data)?;
                tracing::debug!(sent_at = %heartbeat.timestamp, "Received heartbeat");
                let ack = heartbeat.acknowledge(Utc::now());
                let response = JobResponse {
                    job_id: request.job_id,
                    success: true,
                    is_async: false,
                    result: Some(serde_json::to_string(&ack)?),
                };
                Ok(Reply::Send(Outbound::json(&response)?))
            }
            MessageKind::Job => {
                let response = self.executor.execute(&request).await;
                Ok(Reply::Send(Outbound::json(&response)?))
            }
            MessageKind::Close => {
                tracing::info!(client = %request.client_name, "Broker requested shutdown");
                Ok(Reply::Stop)
            }
        }
    }
}

/// Close frame sent before the worker terminates on `error`.
pub fn close_frame_for(error: &FabricError) -> Outbound {
    match error {
        FabricError::Unsupported(_) | FabricError::Protocol(_) => {
            Outbound::close(close_code::UNSUPPORTED_DATA, "Unsupported message type.")
        }
        FabricError::Payload(_) => Outbound::close(close_code::INVALID_PAYLOAD, "Invalid payload."),
        FabricError::HandshakeRejected(_) => {
            Outbound::close(close_code::NORMAL, "Connection failed.")
        }
        _ => Outbound::close(close_code::NORMAL, "Worker stopped."),
    }
}
