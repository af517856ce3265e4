use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::kind::{is_reserved, is_valid_job_name};

/// Broker's default eviction threshold for a silent worker.
pub const DEFAULT_DEAD_AFTER_SECS: u64 = 120;

/// A named API caller, keyed by its bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub name: String,
}

/// Broker configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub listen_addr: SocketAddr,
    /// Identity the broker uses as `client_name` on control frames. Workers
    /// may not register under this name.
    pub broker_name: String,
    /// Secrets workers must present. `None` accepts any secret.
    pub allowed_clients: Option<Vec<String>>,
    pub access_tokens: HashMap<String, AccessToken>,
    pub heartbeat_interval_secs: u64,
    pub stale_after_secs: u64,
    pub dead_after_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Upper bound on how long an API caller waits for a dispatched job.
    pub job_timeout_secs: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            broker_name: "broker".to_string(),
            allowed_clients: None,
            access_tokens: HashMap::new(),
            heartbeat_interval_secs: 5,
            stale_after_secs: 30,
            dead_after_secs: DEFAULT_DEAD_AFTER_SECS,
            handshake_timeout_secs: 10,
            job_timeout_secs: None,
        }
    }
}

impl BrokerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_name.trim().is_empty() {
            return Err(ConfigError::Invalid("broker_name must not be empty".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be greater than 0".into(),
            ));
        }
        if self.stale_after_secs == 0 || self.stale_after_secs >= self.dead_after_secs {
            return Err(ConfigError::Invalid(format!(
                "stale_after_secs ({}) must be greater than 0 and less than dead_after_secs ({})",
                self.stale_after_secs, self.dead_after_secs
            )));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.job_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "job_timeout_secs must be greater than 0 when set".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            dead_after: Duration::from_secs(self.dead_after_secs),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

/// Heartbeat sweep timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub stale_after: Duration,
    pub dead_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        BrokerConfig::default().heartbeat()
    }
}

/// A job this worker can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub executable: String,
    /// Argument string, split on whitespace; quotes group words.
    #[serde(default)]
    pub arguments: Option<String>,
    /// Milliseconds to wait for the process before killing it.
    pub timeout: u64,
    #[serde(rename = "async", default)]
    pub is_async: bool,
    /// Client names permitted to run this job. `None` allows everyone.
    #[serde(default)]
    pub allowed_clients: Option<Vec<String>>,
    /// Echo each line of output to the worker log.
    #[serde(default)]
    pub log_output: bool,
}

impl JobConfig {
    pub fn new(executable: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            executable: executable.into(),
            arguments: None,
            timeout: timeout_ms,
            is_async: false,
            allowed_clients: None,
            log_output: false,
        }
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn allow_clients<I, S>(mut self, clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_clients = Some(clients.into_iter().map(Into::into).collect());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn permits(&self, client_name: &str) -> bool {
        match &self.allowed_clients {
            Some(allowed) => allowed.iter().any(|c| c == client_name),
            None => true,
        }
    }

    /// Split the argument string into argv entries.
    pub fn argv(&self) -> Vec<String> {
        self.arguments
            .as_deref()
            .map(split_arguments)
            .unwrap_or_default()
    }
}

/// Worker configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub broker_url: String,
    /// Seconds without an inbound frame before the connection is considered
    /// dropped; also caps the reconnect backoff.
    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout: u64,
    pub client_secret: String,
    /// Display name sent at handshake. Defaults to the host name.
    #[serde(default)]
    pub friendly_name: Option<String>,
    pub jobs: BTreeMap<String, JobConfig>,
}

fn default_reconnect_timeout() -> u64 {
    60
}

impl WorkerConfig {
    pub fn new(broker_url: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            reconnect_timeout: default_reconnect_timeout(),
            client_secret: client_secret.into(),
            friendly_name: None,
            jobs: BTreeMap::new(),
        }
    }

    pub fn with_job(mut self, name: impl Into<String>, job: JobConfig) -> Self {
        self.jobs.insert(name.into(), job);
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        // A running sync job blocks heartbeat replies.
        for name in config.long_sync_jobs(Duration::from_secs(DEFAULT_DEAD_AFTER_SECS)) {
            tracing::warn!(
                job_name = %name,
                dead_after_secs = DEFAULT_DEAD_AFTER_SECS,
                "Sync job timeout reaches the broker's eviction threshold; it may be dropped mid-job"
            );
        }
        Ok(config)
    }

    /// Synchronous jobs whose timeout is at least `limit`.
    pub fn long_sync_jobs(&self, limit: Duration) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|(_, job)| !job.is_async && job.timeout() >= limit)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Plain ws:// only; terminate TLS in front of the broker.
        if !self.broker_url.starts_with("ws://") {
            return Err(ConfigError::Invalid(format!(
                "broker_url must be a ws:// URL, got {:?}",
                self.broker_url
            )));
        }
        if self.reconnect_timeout == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_timeout must be greater than 0".into(),
            ));
        }
        if self.jobs.is_empty() {
            return Err(ConfigError::Invalid("at least one job must be configured".into()));
        }
        for (name, job) in &self.jobs {
            if !is_valid_job_name(name) {
                return Err(ConfigError::Invalid(format!("invalid job name {:?}", name)));
            }
            if is_reserved(name) {
                return Err(ConfigError::Invalid(format!(
                    "job name {:?} is reserved",
                    name
                )));
            }
            if job.executable.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "job {:?} has an empty executable",
                    name
                )));
            }
            if job.timeout == 0 {
                return Err(ConfigError::Invalid(format!(
                    "job {:?} must have a timeout greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout)
    }

    /// Configured friendly name, falling back to the machine's host name.
    pub fn friendly_name(&self) -> String {
        self.friendly_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(host_name)
    }

    /// Advertised capability names, sorted.
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "worker".to_string())
}

/// Whitespace split where single or double quotes group words.
pub fn split_arguments(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn broker_config_default() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(cfg.broker_name, "broker");
        assert!(cfg.allowed_clients.is_none());
        assert_eq!(cfg.heartbeat_interval_secs, 5);
        assert_eq!(cfg.stale_after_secs, 30);
        assert_eq!(cfg.dead_after_secs, 120);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn broker_config_load_partial_file() {
        let file = write_temp(
            r#"{
                "allowed_clients": ["xyz"],
                "access_tokens": { "tok-1": { "name": "ci" } },
                "job_timeout_secs": 90
            }"#,
        );
        let cfg = BrokerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.allowed_clients, Some(vec!["xyz".to_string()]));
        assert_eq!(cfg.access_tokens["tok-1"].name, "ci");
        assert_eq!(cfg.job_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(cfg.dead_after_secs, 120);
    }

    #[test]
    fn broker_config_rejects_inverted_thresholds() {
        let cfg = BrokerConfig {
            stale_after_secs: 120,
            dead_after_secs: 30,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn broker_config_missing_file() {
        let err = BrokerConfig::load("/nonexistent/broker.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn broker_config_bad_json() {
        let file = write_temp("{ not json");
        let err = BrokerConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn worker_config_load() {
        let file = write_temp(
            r#"{
                "broker_url": "ws://127.0.0.1:8080/ran",
                "client_secret": "xyz",
                "jobs": {
                    "build": { "executable": "make", "arguments": "-j4 all", "timeout": 60000 },
                    "notify": { "executable": "notify.sh", "timeout": 1000, "async": true,
                                "allowed_clients": ["ci"] }
                }
            }"#,
        );
        let cfg = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.reconnect_timeout, 60);
        assert_eq!(cfg.job_names(), vec!["build", "notify"]);
        assert_eq!(cfg.jobs["build"].argv(), vec!["-j4", "all"]);
        assert!(cfg.jobs["notify"].is_async);
        assert!(cfg.jobs["notify"].permits("ci"));
        assert!(!cfg.jobs["notify"].permits("someone-else"));
        assert!(cfg.jobs["build"].permits("anyone"));
    }

    #[test]
    fn worker_config_rejects_reserved_job_name() {
        let cfg = WorkerConfig::new("ws://localhost/ran", "s")
            .with_job("heartbeat", JobConfig::new("true", 1000));
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn worker_config_rejects_zero_timeout() {
        let cfg =
            WorkerConfig::new("ws://localhost/ran", "s").with_job("build", JobConfig::new("make", 0));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn worker_config_rejects_http_url() {
        let cfg = WorkerConfig::new("http://localhost/ran", "s")
            .with_job("build", JobConfig::new("make", 1000));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn long_sync_jobs_ignores_async_and_short_jobs() {
        let cfg = WorkerConfig::new("ws://localhost/ran", "s")
            .with_job("quick", JobConfig::new("true", 1000))
            .with_job("slow", JobConfig::new("make", 120_000))
            .with_job("slow-async", JobConfig::new("make", 600_000).asynchronous());
        assert_eq!(
            cfg.long_sync_jobs(Duration::from_secs(DEFAULT_DEAD_AFTER_SECS)),
            vec!["slow"]
        );
    }

    #[test]
    fn worker_config_rejects_wss_url() {
        let cfg = WorkerConfig::new("wss://localhost/ran", "s")
            .with_job("build", JobConfig::new("make", 1000));
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn worker_config_requires_jobs() {
        let cfg = WorkerConfig::new("ws://localhost/ran", "s");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn friendly_name_prefers_configured_value() {
        let mut cfg = WorkerConfig::new("ws://localhost/ran", "s");
        cfg.friendly_name = Some("box-1".to_string());
        assert_eq!(cfg.friendly_name(), "box-1");

        cfg.friendly_name = Some("   ".to_string());
        assert!(!cfg.friendly_name().trim().is_empty());
    }

    #[test]
    fn split_arguments_handles_quotes() {
        assert_eq!(split_arguments("a b  c"), vec!["a", "b", "c"]);
        assert_eq!(
            split_arguments(r#"-c "echo hello world" 'x y'"#),
            vec!["-c", "echo hello world", "x y"]
        );
        assert_eq!(split_arguments(r#""""#), vec![""]);
        assert!(split_arguments("   ").is_empty());
    }
}
