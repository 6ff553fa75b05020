use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::Limits;

// =============================================================================
// Unified config (figment-deserialized from defaults / broker.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   broker.toml:     [limits]
//                    max_concurrent_streams = 4
//
//   env var:         BROKER_LIMITS__MAX_CONCURRENT_STREAMS=4   (double underscore = nesting)
//
//   (single underscore stays within field names: BROKER_UPSTREAM__CONNECT_TIMEOUT_SECS)

pub const CONFIG_FILE_NAME: &str = "broker.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub upstream: UpstreamFileConfig,
    #[serde(default)]
    pub limits: LimitsFileConfig,
    #[serde(default)]
    pub subscribers: SubscribersFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// 0 picks a free port.
    #[serde(default)]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
        }
    }
}

/// The agent endpoint every turn is streamed from (lives under `[upstream]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpstreamFileConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamFileConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Resource caps and sweep cadence (lives under `[limits]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LimitsFileConfig {
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,
    #[serde(default = "default_max_tracked_sessions")]
    pub max_tracked_sessions: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_idle_sweep_interval_secs")]
    pub idle_sweep_interval_secs: u64,
    #[serde(default = "default_session_cap_sweep_interval_secs")]
    pub session_cap_sweep_interval_secs: u64,
}

impl Default for LimitsFileConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: default_max_concurrent_streams(),
            max_tracked_sessions: default_max_tracked_sessions(),
            idle_timeout_secs: default_idle_timeout_secs(),
            idle_sweep_interval_secs: default_idle_sweep_interval_secs(),
            session_cap_sweep_interval_secs: default_session_cap_sweep_interval_secs(),
        }
    }
}

/// Per-tab connection settings (lives under `[subscribers]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscribersFileConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Unanswered pings before a tab is pruned. 0 disables pruning.
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for SubscribersFileConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            missed_heartbeats: default_missed_heartbeats(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_upstream_url() -> String {
    "http://127.0.0.1:3000/api/chat/stream".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_max_concurrent_streams() -> usize {
    10
}
fn default_max_tracked_sessions() -> usize {
    20
}
fn default_idle_timeout_secs() -> u64 {
    30 * 60
}
fn default_idle_sweep_interval_secs() -> u64 {
    60
}
fn default_session_cap_sweep_interval_secs() -> u64 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_missed_heartbeats() -> u32 {
    3
}
fn default_channel_capacity() -> usize {
    256
}

/// Build a figment that layers: defaults → broker.toml → BROKER_* env vars.
///
/// `config_path` replaces `<data_dir>/broker.toml` when given. A missing file
/// is not an error.
///
/// Env vars use double-underscore for nesting into sections:
///   `BROKER_SERVER__PORT=7000`  →  `server.port = 7000`
pub fn load_config(data_dir: &Path, config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let file = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE_NAME));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed("BROKER_").split("__"))
}

/// `~/.stream_broker`, or the working directory when there is no home.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".stream_broker"))
        .unwrap_or_else(|| PathBuf::from("."))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Where to listen and what to stream from.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub upstream_url: String,
    pub connect_timeout: Duration,
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            upstream_url: fc.upstream.url.clone(),
            connect_timeout: Duration::from_secs(fc.upstream.connect_timeout_secs.max(1)),
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

/// Everything the broker task needs.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub limits: Limits,
    pub idle_sweep_interval: Duration,
    pub session_cap_sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Pings a tab may leave unanswered (0 = never prune for silence).
    pub missed_heartbeats: u32,
    pub subscriber_channel_capacity: usize,
}

impl BrokerConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        // Timers cannot tick at zero; a 0 in the file means "as often as possible".
        let secs = |value: u64| Duration::from_secs(value.max(1));
        Self {
            limits: Limits {
                max_concurrent_streams: fc.limits.max_concurrent_streams,
                max_tracked_sessions: fc.limits.max_tracked_sessions,
                idle_timeout: Duration::from_secs(fc.limits.idle_timeout_secs),
            },
            idle_sweep_interval: secs(fc.limits.idle_sweep_interval_secs),
            session_cap_sweep_interval: secs(fc.limits.session_cap_sweep_interval_secs),
            heartbeat_interval: secs(fc.subscribers.heartbeat_interval_secs),
            missed_heartbeats: fc.subscribers.missed_heartbeats,
            subscriber_channel_capacity: fc.subscribers.channel_capacity.max(1),
        }
    }

    /// How long a tab may go without acknowledging before it is pruned.
    pub fn heartbeat_ack_timeout(&self) -> Option<Duration> {
        if self.missed_heartbeats == 0 {
            None
        } else {
            Some(self.heartbeat_interval * self.missed_heartbeats)
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}
