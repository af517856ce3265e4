pub mod broker;
pub mod config;
pub mod error;
pub mod protocol;
pub mod shutdown;
pub mod worker;

pub use error::{ConfigError, FabricError, Result};
