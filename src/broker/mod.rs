//! The broker: accepts worker connections, tracks their liveness and routes
//! API job requests to them.

pub mod connection;
pub mod handshake;
pub mod heartbeat;
pub mod http;
pub mod registry;
pub mod router;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::broker::connection::ConnectionSettings;
use crate::broker::handshake::HandshakePolicy;
use crate::broker::heartbeat::HeartbeatMonitor;
use crate::broker::http::HttpState;
use crate::config::BrokerConfig;
use crate::error::Result;

pub use heartbeat::SweepReport;
pub use router::{JobOutcome, JobRouter};

/// Owns the broker's configuration and router and wires up its subsystems.
pub struct Broker {
    config: BrokerConfig,
    router: JobRouter,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let router = JobRouter::new(config.broker_name.clone(), config.job_timeout());
        Self { config, router }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Handle for submitting jobs in-process.
    pub fn router(&self) -> JobRouter {
        self.router.clone()
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` fires.
    ///
    /// Spawns the heartbeat monitor, then runs the HTTP server in the
    /// current task. Returns once the server has drained.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let monitor = HeartbeatMonitor::new(self.router.clone(), self.config.heartbeat());
        let monitor_shutdown = shutdown.clone();
        let monitor_task = tokio::spawn(async move {
            monitor.run(monitor_shutdown).await;
        });

        let state = HttpState {
            router: self.router.clone(),
            access_tokens: Arc::new(self.config.access_tokens.clone()),
            connections: Arc::new(ConnectionSettings {
                policy: HandshakePolicy::new(
                    self.config.allowed_clients.clone(),
                    self.config.broker_name.clone(),
                ),
                handshake_timeout: self.config.handshake_timeout(),
            }),
            shutdown: shutdown.clone(),
        };

        let served = http::serve(listener, state).await;

        // The server may also stop on its own; make sure the monitor follows.
        shutdown.cancel();
        if let Err(e) = monitor_task.await {
            tracing::warn!(error = %e, "Heartbeat monitor task failed");
        }

        served?;
        tracing::info!("Broker stopped");
        Ok(())
    }
}
