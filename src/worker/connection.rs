use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{FabricError, Result};
use crate::protocol::{close_code, ConnectionRequest, Outbound};
use crate::worker::backoff::ReconnectBackoff;
use crate::worker::dispatcher::{close_frame_for, Dispatcher, Reply};
use crate::worker::executor::JobExecutor;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const STOPPED_REASON: &str = "Worker stopped.";

/// Where the worker's link to the broker currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Link lifecycle notifications, for logging and observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// Connected again after a drop; `attempt` counts reconnections.
    Reconnected { attempt: u32 },
    Disconnected { reason: String },
}

/// How one connected session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Lost the link; reconnect.
    Dropped(String),
    /// Shutdown token fired.
    Shutdown,
    /// The broker told the worker to stop.
    Stopped,
    Fatal(FabricError),
}

/// Keeps the worker connected to its broker and feeds inbound frames to the
/// [`Dispatcher`].
pub struct ConnectionManager {
    config: WorkerConfig,
    dispatcher: Dispatcher,
    backoff: ReconnectBackoff,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(config: WorkerConfig) -> Self {
        let dispatcher = Dispatcher::new(JobExecutor::new(config.jobs.clone()));
        let backoff = ReconnectBackoff::new(config.reconnect_timeout());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(32);
        Self {
            config,
            dispatcher,
            backoff,
            state,
            events,
        }
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Connect, serve and reconnect until `shutdown` fires, the broker sends
    /// `close`, or a fatal error occurs. Background jobs are stopped before
    /// returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let friendly_name = self.config.friendly_name();
        tracing::info!(
            broker_url = %self.config.broker_url,
            friendly_name = %friendly_name,
            "Worker started"
        );

        let mut failures: u32 = 0;
        let mut connections: u32 = 0;

        let result = loop {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                connected = tokio::time::timeout(
                    self.config.reconnect_timeout(),
                    connect_async(self.config.broker_url.as_str()),
                ) => connected,
            };

            let reason = match connected {
                Ok(Ok((socket, _))) => {
                    failures = 0;
                    self.set_state(ConnectionState::Connected);
                    self.emit(if connections == 0 {
                        ConnectionEvent::Connected
                    } else {
                        ConnectionEvent::Reconnected {
                            attempt: connections,
                        }
                    });
                    connections = connections.saturating_add(1);

                    match self.run_session(socket, &friendly_name, &shutdown).await {
                        SessionEnd::Shutdown | SessionEnd::Stopped => break Ok(()),
                        SessionEnd::Fatal(e) => break Err(e),
                        SessionEnd::Dropped(reason) => reason,
                    }
                }
                Ok(Err(e @ tungstenite::Error::Url(_))) => {
                    tracing::error!(error = %e, "Broker URL cannot be connected to, stopping worker");
                    break Err(e.into());
                }
                Ok(Err(e)) => format!("connect failed: {e}"),
                Err(_) => "connect timed out".to_string(),
            };

            self.set_state(ConnectionState::Disconnected);
            self.emit(ConnectionEvent::Disconnected { reason });

            let delay = self.backoff.delay(failures);
            failures = failures.saturating_add(1);
            tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.set_state(ConnectionState::Disconnected);
        self.dispatcher.executor().shutdown().await;
        tracing::info!("Worker stopping");
        result
    }

    async fn run_session(
        &self,
        socket: WsStream,
        friendly_name: &str,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        let request = ConnectionRequest {
            client_secret: Some(self.config.client_secret.clone()),
            friendly_name: Some(friendly_name.to_string()),
            jobs_available: Some(self.dispatcher.executor().job_names()),
        };
        let frame = match Outbound::json(&request) {
            Ok(frame) => frame,
            Err(e) => return SessionEnd::Fatal(e.into()),
        };
        if let Err(e) = send_frame(&mut sink, frame).await {
            return SessionEnd::Dropped(format!("failed to send handshake: {e}"));
        }

        let inactivity = self.config.reconnect_timeout();
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    close(&mut sink, Outbound::close(close_code::NORMAL, STOPPED_REASON)).await;
                    return SessionEnd::Shutdown;
                }
                next = tokio::time::timeout(inactivity, stream.next()) => next,
            };

            let message = match next {
                Err(_) => return SessionEnd::Dropped(inactivity_reason(inactivity)),
                Ok(None) => return SessionEnd::Dropped("connection closed".to_string()),
                Ok(Some(Err(e))) => return SessionEnd::Dropped(format!("connection error: {e}")),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => match self.dispatcher.dispatch(text.as_str()).await {
                    Ok(Reply::Send(frame)) => {
                        if let Err(e) = send_frame(&mut sink, frame).await {
                            return SessionEnd::Dropped(format!("failed to send reply: {e}"));
                        }
                    }
                    Ok(Reply::Nothing) => {}
                    Ok(Reply::Stop) => {
                        close(&mut sink, Outbound::close(close_code::NORMAL, STOPPED_REASON)).await;
                        return SessionEnd::Stopped;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to process message, stopping worker");
                        close(&mut sink, close_frame_for(&e)).await;
                        return SessionEnd::Fatal(e);
                    }
                },
                Message::Binary(data) => {
                    let e = FabricError::Protocol(format!("unexpected binary frame ({} bytes)", data.len()));
                    tracing::error!(error = %e, "Failed to process message, stopping worker");
                    close(&mut sink, close_frame_for(&e)).await;
                    return SessionEnd::Fatal(e);
                }
                Message::Close(frame) => {
                    let reason = match frame {
                        Some(frame) => format!("closed by broker ({}): {}", frame.code, frame.reason),
                        None => "closed by broker".to_string(),
                    };
                    return SessionEnd::Dropped(reason);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        match &event {
            ConnectionEvent::Connected => tracing::info!("Connected to broker"),
            ConnectionEvent::Reconnected { attempt } => {
                tracing::info!(attempt, "Reconnected to broker")
            }
            ConnectionEvent::Disconnected { reason } => {
                tracing::warn!(reason = %reason, "Disconnected from broker")
            }
        }
        let _ = self.events.send(event);
    }
}

fn inactivity_reason(limit: Duration) -> String {
    format!("no frames received for {}s", limit.as_secs())
}

async fn send_frame(sink: &mut WsSink, frame: Outbound) -> Result<()> {
    let message = match frame {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    };
    sink.send(message).await?;
    Ok(())
}

/// Best-effort close; the link is going away either way.
async fn close(sink: &mut WsSink, frame: Outbound) {
    if let Err(e) = send_frame(sink, frame).await {
        tracing::debug!(error = %e, "Failed to send close frame");
    }
    let _ = sink.close().await;
}
