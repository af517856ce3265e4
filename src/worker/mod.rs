//! The worker side of the fabric.
//!
//! A worker holds one outbound WebSocket to the broker, advertises the jobs
//! it has configured and runs them as local processes on request.
//!
//! # Components
//!
//! - [`ConnectionManager`]: connect, handshake, reconnect with backoff
//! - [`Dispatcher`]: routes each inbound frame by its message kind
//! - [`JobExecutor`]: spawns and supervises job processes
//!
//! # Execution Flow
//!
//! 1. [`ConnectionManager::run`] connects and sends the handshake
//! 2. Each inbound frame goes through [`Dispatcher::dispatch`]
//! 3. Job frames reach [`JobExecutor::execute`], which spawns the configured
//!    executable with `JOB_ID`, `JOB_NAME`, `JOB_CLIENT` and `JOB_DATA` set
//! 4. The resulting [`JobResponse`](crate::protocol::JobResponse) goes back
//!    on the same connection
//!
//! Synchronous jobs block the message loop until they finish or time out.

pub mod backoff;
pub mod connection;
pub mod dispatcher;
pub mod executor;

pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use dispatcher::Dispatcher;
pub use executor::JobExecutor;
