//! Configuration loading for signbridge-host.
//!
//! Configuration is loaded from a TOML file (default: `bridge.toml`).
//! Every section and field is optional.

use serde::Deserialize;
use signbridge_relay::{DeviceSyncConfig, HubTransportConfig, RelayClientConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for signbridge-host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local signing agent.
    pub agent: AgentConfig,
    /// Agent channel pool.
    pub pool: PoolConfig,
    /// Relay sessions to paired devices.
    pub relay: RelayConfig,
    /// Device pairing.
    pub pairing: PairingConfig,
    /// Signature authorization.
    pub authorization: AuthorizationConfig,
    /// Domain block-list.
    pub blocklist: BlockListConfig,
    /// Paired device maintenance.
    pub devices: DevicesConfig,
    /// Persisted state.
    pub storage: StorageConfig,
}

/// Local signing agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent executable (default: `signbridge-agent`).
    #[serde(default = "default_agent_program")]
    pub program: PathBuf,
    /// Extra arguments passed to the agent.
    #[serde(default)]
    pub args: Vec<String>,
    /// UI language forwarded with every message (default: `en`).
    #[serde(default = "default_language")]
    pub language: String,
    /// Ask the agent to trace every call (default: false).
    #[serde(default)]
    pub trace: bool,
}

/// Agent channel pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Grace delay before a pooled UI channel shuts down (default: 100ms).
    #[serde(default = "default_popup_shutdown_delay_ms")]
    pub popup_shutdown_delay_ms: u64,
    /// Grace delay before a pooled site channel shuts down (default: 30s).
    #[serde(default = "default_site_shutdown_delay_ms")]
    pub site_shutdown_delay_ms: u64,
}

/// Relay session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Relay hub URL. Devices are disabled when unset.
    #[serde(default)]
    pub server_url: Option<String>,
    /// Send attempts without a receipt (default: 3).
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    /// Delay between send attempts in milliseconds (default: 5000).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Response wait after a receipt in seconds (default: 60).
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    /// Overall connect bound in seconds (default: 40).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Wait for the relay connection id in seconds (default: 10).
    #[serde(default = "default_connection_id_timeout_secs")]
    pub connection_id_timeout_secs: u64,
    /// Pause before reconnecting a dropped session in seconds (default: 10).
    #[serde(default = "default_reconnect_wait_secs")]
    pub reconnect_wait_secs: u64,
    /// Retry evaluation period in milliseconds (default: 1000).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

/// Device pairing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PairingConfig {
    /// Bound on waiting for a pending device in seconds (default: 35).
    #[serde(default = "default_pairing_timeout_secs")]
    pub timeout_secs: u64,
    /// Poll period while waiting in milliseconds (default: 200).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Signature authorization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationConfig {
    /// Hashes signed per agent round trip (default: 1000).
    #[serde(default = "default_batch_chunk_size")]
    pub batch_chunk_size: usize,
}

/// Block-list configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockListConfig {
    /// Endpoint serving the block-list. Nothing is blocked when unset.
    #[serde(default)]
    pub url: Option<String>,
    /// Periodic refresh in seconds (default: 3600).
    #[serde(default = "default_blocklist_refresh_secs")]
    pub refresh_interval_secs: u64,
    /// Delay before refreshing after a block in milliseconds (default: 100).
    #[serde(default = "default_refresh_after_block_ms")]
    pub refresh_after_block_ms: u64,
}

/// Paired device maintenance configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DevicesConfig {
    /// Age after which an info call refreshes a device's certificates in
    /// seconds (default: 3600).
    #[serde(default = "default_info_refresh_interval_secs")]
    pub info_refresh_interval_secs: u64,
}

/// Persisted state configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// JSON state file (default: `bridge-state.json`).
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

// Default value functions
fn default_agent_program() -> PathBuf {
    PathBuf::from("signbridge-agent")
}

fn default_language() -> String {
    "en".to_string()
}

fn default_popup_shutdown_delay_ms() -> u64 {
    100
}

fn default_site_shutdown_delay_ms() -> u64 {
    30_000
}

fn default_max_send_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_response_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    40
}

fn default_connection_id_timeout_secs() -> u64 {
    10
}

fn default_reconnect_wait_secs() -> u64 {
    10
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_pairing_timeout_secs() -> u64 {
    35
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_batch_chunk_size() -> usize {
    signbridge_core::DEFAULT_BATCH_CHUNK
}

fn default_blocklist_refresh_secs() -> u64 {
    3600
}

fn default_refresh_after_block_ms() -> u64 {
    100
}

fn default_info_refresh_interval_secs() -> u64 {
    3600
}

fn default_state_path() -> PathBuf {
    PathBuf::from("bridge-state.json")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            args: Vec::new(),
            language: default_language(),
            trace: false,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            popup_shutdown_delay_ms: default_popup_shutdown_delay_ms(),
            site_shutdown_delay_ms: default_site_shutdown_delay_ms(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            max_send_attempts: default_max_send_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            response_timeout_secs: default_response_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            connection_id_timeout_secs: default_connection_id_timeout_secs(),
            reconnect_wait_secs: default_reconnect_wait_secs(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_pairing_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            batch_chunk_size: default_batch_chunk_size(),
        }
    }
}

impl Default for BlockListConfig {
    fn default() -> Self {
        Self {
            url: None,
            refresh_interval_secs: default_blocklist_refresh_secs(),
            refresh_after_block_ms: default_refresh_after_block_ms(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            info_refresh_interval_secs: default_info_refresh_interval_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

impl PoolConfig {
    /// Grace delay for the UI pseudo-domain.
    pub fn popup_shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.popup_shutdown_delay_ms)
    }

    /// Grace delay for ordinary domains.
    pub fn site_shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.site_shutdown_delay_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Settings for every relay session.
    pub fn relay_client_config(&self) -> RelayClientConfig {
        let relay = &self.relay;
        RelayClientConfig::default()
            .with_max_send_attempts(relay.max_send_attempts)
            .with_retry_delay(Duration::from_millis(relay.retry_delay_ms))
            .with_response_timeout(Duration::from_secs(relay.response_timeout_secs))
            .with_connect_timeout(Duration::from_secs(relay.connect_timeout_secs))
            .with_connection_id_timeout(Duration::from_secs(relay.connection_id_timeout_secs))
            .with_reconnect_wait(Duration::from_secs(relay.reconnect_wait_secs))
            .with_tick(Duration::from_millis(relay.tick_ms))
    }

    /// Settings for the device sync manager.
    pub fn device_sync_config(&self) -> DeviceSyncConfig {
        DeviceSyncConfig {
            relay: self.relay_client_config(),
            pairing_timeout: Duration::from_secs(self.pairing.timeout_secs),
            poll_interval: Duration::from_millis(self.pairing.poll_interval_ms),
            info_refresh_interval: Duration::from_secs(self.devices.info_refresh_interval_secs),
            language: self.agent.language.clone(),
        }
    }

    /// Relay hub settings; `None` disables paired devices.
    pub fn hub_transport_config(&self) -> Option<HubTransportConfig> {
        let url = self.relay.server_url.as_deref()?;
        Some(
            HubTransportConfig::new(url)
                .with_request_timeout(Duration::from_secs(self.relay.connect_timeout_secs)),
        )
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
