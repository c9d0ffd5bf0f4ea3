//! Bridge configuration and the providers that supply it
//!
//! The bridge reads its configuration once, at (re)initialisation, through a
//! [`ConfigProvider`]. Settings UIs write to whatever store the provider
//! reads; the bridge never sees them directly.

use crate::error::{Result, SimLinkError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable carrying a bridge address, read by [`EnvOverrides`]
/// and set for launched optimizer processes
pub const ADDRESS_VAR: &str = "SIMLINK_ADDRESS";

/// Whether the bridge listens for optimizers or dials one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketRole {
    /// Listen on the address; any number of optimizers may connect
    Bind,
    /// Dial a single optimizer and reconnect when the link drops
    Connect,
}

/// Socket address and role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// `tcp://host:port` or `ipc:///path/to.sock`
    pub address: String,
    pub role: SocketRole,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: "tcp://127.0.0.1:5559".into(),
            role: SocketRole::Bind,
        }
    }
}

/// Connection establishment and recovery policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Per-attempt timeout for the initial connection (ms)
    pub connect_timeout_ms: u64,
    /// Attempts at startup before initialisation fails
    pub connect_attempts: u32,
    /// First backoff delay (ms)
    pub initial_backoff_ms: u64,
    /// Backoff cap (ms)
    pub max_backoff_ms: u64,
    /// Consecutive failures before a persistent-disconnect warning
    pub max_attempts: u32,
    /// Queued outbound items older than this are dropped instead of sent (ms)
    pub retry_window_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            connect_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            max_attempts: 10,
            retry_window_ms: 2000,
        }
    }
}

impl ReconnectConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_window_ms)
    }
}

/// External optimizer started with the bridge and stopped with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerProcessConfig {
    /// Label used in log lines
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment; [`ADDRESS_VAR`] is always set to the bridge endpoint
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for OptimizerProcessConfig {
    fn default() -> Self {
        Self {
            name: "optimizer".into(),
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }
}

/// Everything the bridge needs, read once at initialisation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Master switch; a disabled bridge never opens a socket
    pub enabled: bool,
    /// Raise log verbosity to debug
    pub debug_logging: bool,
    pub endpoint: EndpointConfig,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    /// Capture a snapshot every N ticks
    pub sampling_interval: u64,
    /// Ticks without traffic before a session goes stale
    pub heartbeat_timeout_ticks: u64,
    /// Correlation ids remembered per session for duplicate detection
    pub dedup_window: usize,
    /// Log throughput counters every N ticks (0 disables)
    pub stats_log_interval: u64,
    pub reconnect: ReconnectConfig,
    /// Processes launched once the socket is up and killed on shutdown
    pub optimizers: Vec<OptimizerProcessConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug_logging: false,
            endpoint: EndpointConfig::default(),
            inbound_capacity: 256,
            outbound_capacity: 256,
            sampling_interval: 1,
            // 5 seconds at 20 ticks per second
            heartbeat_timeout_ticks: 100,
            dedup_window: 1024,
            stats_log_interval: 500,
            reconnect: ReconnectConfig::default(),
            optimizers: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SimLinkError::Config(msg.to_string()));

        if self.inbound_capacity == 0 {
            return invalid("inbound_capacity must be at least 1");
        }
        if self.outbound_capacity == 0 {
            return invalid("outbound_capacity must be at least 1");
        }
        if self.sampling_interval == 0 {
            return invalid("sampling_interval must be at least 1");
        }
        if self.heartbeat_timeout_ticks == 0 {
            return invalid("heartbeat_timeout_ticks must be at least 1");
        }
        if self.dedup_window == 0 {
            return invalid("dedup_window must be at least 1");
        }
        if self.reconnect.connect_attempts == 0 {
            return invalid("reconnect.connect_attempts must be at least 1");
        }
        if self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms {
            return invalid("reconnect.max_backoff_ms must not be below initial_backoff_ms");
        }
        if self.endpoint.address.is_empty() {
            return invalid("endpoint.address must not be empty");
        }
        if let Some(process) = self.optimizers.iter().find(|p| p.command.is_empty()) {
            return Err(SimLinkError::Config(format!(
                "optimizer {} has no command",
                process.name
            )));
        }
        Ok(())
    }
}

/// Source of configuration snapshots
pub trait ConfigProvider {
    /// Produce the current settings
    fn load(&self) -> Result<BridgeConfig>;
}

/// Fixed, in-memory configuration
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub BridgeConfig);

impl ConfigProvider for StaticConfig {
    fn load(&self) -> Result<BridgeConfig> {
        Ok(self.0.clone())
    }
}

/// JSON file on disk; a missing file yields the defaults
#[derive(Debug, Clone)]
pub struct JsonFileConfig {
    pub path: PathBuf,
}

impl JsonFileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Write the given settings to the file, creating parent directories
    pub fn save(&self, config: &BridgeConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SimLinkError::Config(format!("{}: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, json)
            .map_err(|e| SimLinkError::Config(format!("{}: {}", self.path.display(), e)))
    }
}

impl ConfigProvider for JsonFileConfig {
    fn load(&self) -> Result<BridgeConfig> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BridgeConfig::default()),
            Err(e) => Err(SimLinkError::Config(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// Environment variable overrides on top of another provider
///
/// Recognised: [`ADDRESS_VAR`], `SIMLINK_ROLE` (`bind`/`connect`),
/// `SIMLINK_SAMPLING_INTERVAL`.
pub struct EnvOverrides<P> {
    base: P,
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl<P: ConfigProvider> EnvOverrides<P> {
    pub fn new(base: P) -> Self {
        Self {
            base,
            lookup: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Use a custom variable source instead of the process environment
    pub fn with_lookup(
        base: P,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            base,
            lookup: Box::new(lookup),
        }
    }
}

impl<P: ConfigProvider> ConfigProvider for EnvOverrides<P> {
    fn load(&self) -> Result<BridgeConfig> {
        let mut config = self.base.load()?;

        if let Some(address) = (self.lookup)(ADDRESS_VAR) {
            config.endpoint.address = address;
        }
        if let Some(role) = (self.lookup)("SIMLINK_ROLE") {
            config.endpoint.role = match role.to_ascii_lowercase().as_str() {
                "bind" => SocketRole::Bind,
                "connect" => SocketRole::Connect,
                other => {
                    return Err(SimLinkError::Config(format!(
                        "SIMLINK_ROLE must be bind or connect, got {}",
                        other
                    )));
                }
            };
        }
        if let Some(interval) = (self.lookup)("SIMLINK_SAMPLING_INTERVAL") {
            config.sampling_interval = interval.parse().map_err(|_| {
                SimLinkError::Config(format!("SIMLINK_SAMPLING_INTERVAL: {} is not a number", interval))
            })?;
        }

        Ok(config)
    }
}
