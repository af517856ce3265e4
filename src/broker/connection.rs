use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::handshake::{self, HandshakePolicy};
use crate::broker::registry::{Session, SessionId};
use crate::broker::router::JobRouter;
use crate::protocol::kind::CONNECTION_RESPONSE;
use crate::protocol::{close_code, ConnectionResponse, JobRequest, JobResponse, Outbound};

/// How long the writer gets to flush after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection settings shared by every accepted socket.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub policy: HandshakePolicy,
    pub handshake_timeout: Duration,
}

/// Drive one worker connection from handshake to close.
pub async fn handle_socket(
    socket: WebSocket,
    router: JobRouter,
    settings: Arc<ConnectionSettings>,
    shutdown: CancellationToken,
) {
    let session_id = Uuid::new_v4();
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(sink, rx));

    tracing::debug!(session_id = %session_id, "Awaiting handshake");

    let first = match tokio::time::timeout(settings.handshake_timeout, next_text(&mut stream)).await {
        Ok(Some(text)) => text,
        Ok(None) => {
            tracing::debug!(session_id = %session_id, "Connection closed before handshake");
            drop(tx);
            drain(writer).await;
            return;
        }
        Err(_) => {
            tracing::info!(session_id = %session_id, "Handshake timed out");
            let _ = tx.send(Outbound::close(close_code::POLICY_VIOLATION, "Handshake timeout"));
            drop(tx);
            drain(writer).await;
            return;
        }
    };

    let accepted = match handshake::validate(&first, &settings.policy) {
        Ok(accepted) => accepted,
        Err(reason) => {
            tracing::warn!(session_id = %session_id, reason = %reason, "Handshake rejected");
            send_connection_response(&tx, &router, ConnectionResponse::rejected(reason));
            let _ = tx.send(Outbound::close(
                handshake::rejection_close_code(reason),
                reason.to_string(),
            ));
            drop(tx);
            drain(writer).await;
            return;
        }
    };

    // Register before answering so the worker is routable once it sees success.
    let answer = tx.clone();
    let closed = shutdown.child_token();
    let session = Session::new(
        session_id,
        accepted.friendly_name,
        accepted.jobs,
        tx,
        closed.clone(),
    );
    router.register(session).await;
    send_connection_response(&answer, &router, ConnectionResponse::accepted());
    drop(answer);

    receive_loop(session_id, &mut stream, &router, &closed).await;

    if let Some(session) = router.remove_session(session_id).await {
        if shutdown.is_cancelled() {
            session.send(Outbound::close(close_code::GOING_AWAY, "Broker shutting down"));
        }
    }
    closed.cancel();
    drain(writer).await;
}

async fn receive_loop(
    session_id: SessionId,
    stream: &mut SplitStream<WebSocket>,
    router: &JobRouter,
    closed: &CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<JobResponse>(text.as_str()) {
                Ok(response) => router.handle_response(session_id, response).await,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Malformed frame from worker");
                }
            },
            Some(Ok(Message::Binary(data))) => {
                tracing::warn!(session_id = %session_id, len = data.len(), "Ignoring binary frame");
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(session_id = %session_id, frame = ?frame, "Worker closed connection");
                break;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Err(e)) => {
                tracing::warn!(session_id = %session_id, error = %e, "Connection error");
                break;
            }
            None => break,
        }
    }
}

/// Next text frame, or `None` if the peer closed or sent something else first.
async fn next_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(_) | Err(_) => return None,
        }
    }
}

fn send_connection_response(
    tx: &mpsc::UnboundedSender<Outbound>,
    router: &JobRouter,
    response: ConnectionResponse,
) {
    let envelope = serde_json::to_string(&response).map(|job_data| JobRequest {
        job_id: router.next_job_id(),
        job_name: CONNECTION_RESPONSE.to_string(),
        job_data,
        client_name: router.identity().to_string(),
    });
    match envelope.and_then(|request| Outbound::json(&request)) {
        Ok(frame) => {
            let _ = tx.send(frame);
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode connection response"),
    }
}

/// Forward queued frames to the socket until the queue closes or a close
/// frame goes out.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::debug!(error = %e, "Failed to write frame");
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn drain(writer: tokio::task::JoinHandle<()>) {
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        tracing::debug!("Connection writer did not finish in time");
    }
}
