//! Configuration system for the `MeshChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/meshchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use meshchat_proto::ids::Fingerprint;

use crate::delivery::DeliveryTimings;
use crate::reconcile::DEFAULT_HISTORY_LIMIT;
use crate::session::{MIN_POLL_INTERVAL, SessionConfig};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    profile: ProfileFileConfig,
    peer: PeerFileConfig,
    delivery: DeliveryFileConfig,
    sync: SyncFileConfig,
    ui: UiFileConfig,
}

/// `[profile]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ProfileFileConfig {
    username: Option<String>,
    display_name: Option<String>,
    fingerprint: Option<String>,
}

/// `[peer]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PeerFileConfig {
    username: Option<String>,
    display_name: Option<String>,
    fingerprint: Option<String>,
}

/// `[delivery]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DeliveryFileConfig {
    sent_after_ms: Option<u64>,
    delivered_after_ms: Option<u64>,
    reply_after_ms: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    poll_interval_ms: Option<u64>,
    history_limit: Option<usize>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// The simulated counterpart the demo session chats with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Contact username.
    pub username: String,
    /// Contact display name.
    pub display_name: String,
    /// Contact fingerprint.
    pub fingerprint: Fingerprint,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            username: "whiskers".to_string(),
            display_name: "Mr. Whiskers".to_string(),
            fingerprint: Fingerprint::new("PEER-1"),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Profile --
    /// Local username.
    pub username: String,
    /// Local display name (defaults to the username).
    pub display_name: Option<String>,
    /// Local fingerprint (generated when absent).
    pub fingerprint: Option<Fingerprint>,

    // -- Peer --
    /// The simulated counterpart.
    pub peer: PeerConfig,

    // -- Delivery --
    /// Lifecycle step delays.
    pub timings: DeliveryTimings,
    /// Capacity of the delivery event channel.
    pub event_buffer: usize,

    // -- Sync --
    /// Interval between reconciliation polls.
    pub poll_interval: Duration,
    /// Most recent messages loaded into a chat view.
    pub history_limit: usize,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: "me".to_string(),
            display_name: None,
            fingerprint: None,
            peer: PeerConfig::default(),
            timings: DeliveryTimings::default(),
            event_buffer: 64,
            poll_interval: Duration::from_secs(3),
            history_limit: DEFAULT_HISTORY_LIMIT,
            timestamp_format: "%H:%M:%S".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/meshchat/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let peer_defaults = PeerConfig::default();

        Self {
            username: cli
                .username
                .clone()
                .or_else(|| file.profile.username.clone())
                .unwrap_or(defaults.username),
            display_name: file.profile.display_name.clone(),
            fingerprint: file.profile.fingerprint.clone().map(Fingerprint::new),
            peer: PeerConfig {
                username: file
                    .peer
                    .username
                    .clone()
                    .unwrap_or(peer_defaults.username),
                display_name: file
                    .peer
                    .display_name
                    .clone()
                    .unwrap_or(peer_defaults.display_name),
                fingerprint: cli
                    .peer
                    .clone()
                    .or_else(|| file.peer.fingerprint.clone())
                    .map_or(peer_defaults.fingerprint, Fingerprint::new),
            },
            timings: DeliveryTimings {
                sent_after: file
                    .delivery
                    .sent_after_ms
                    .map_or(defaults.timings.sent_after, Duration::from_millis),
                delivered_after: file
                    .delivery
                    .delivered_after_ms
                    .map_or(defaults.timings.delivered_after, Duration::from_millis),
                reply_after: file
                    .delivery
                    .reply_after_ms
                    .map_or(defaults.timings.reply_after, Duration::from_millis),
            },
            event_buffer: file
                .delivery
                .event_buffer
                .unwrap_or(defaults.event_buffer),
            poll_interval: file
                .sync
                .poll_interval_ms
                .map_or(defaults.poll_interval, Duration::from_millis)
                .max(MIN_POLL_INTERVAL),
            history_limit: file.sync.history_limit.unwrap_or(defaults.history_limit),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Session tunables derived from this configuration.
    #[must_use]
    pub const fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timings: self.timings,
            history_limit: self.history_limit,
            event_buffer: self.event_buffer,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Peer-to-peer mesh chat client (simulated delivery)")]
pub struct CliArgs {
    /// Path to config file (default: `~/.config/meshchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Local username.
    #[arg(long, env = "MESHCHAT_USER")]
    pub username: Option<String>,

    /// Fingerprint of the peer to chat with.
    #[arg(long, env = "MESHCHAT_PEER")]
    pub peer: Option<String>,

    /// Message to send (repeatable). Defaults to a single "hello".
    #[arg(short, long = "message")]
    pub messages: Vec<String>,

    /// Print the transcript and conversation list as JSON.
    #[arg(long)]
    pub json: bool,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MESHCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: stderr).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("meshchat").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
