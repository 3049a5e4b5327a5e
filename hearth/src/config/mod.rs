//! Configuration system for the `hearth` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/hearth/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use hearth_proto::message::MAX_MESSAGE_SIZE;

use crate::chat::{Author, SessionOptions};
use crate::optimistic::DEFAULT_MAX_OPTIMISTIC_MESSAGES;
use crate::realtime::RealtimeOptions;

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

    /// The configured relay URL is not a WebSocket URL.
    #[error("invalid relay URL {url:?}: {reason}")]
    InvalidRelayUrl {
        /// The URL as configured.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The timestamp format is not a valid strftime string.
    #[error("invalid timestamp format {0:?}")]
    InvalidTimestampFormat(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    chat: ChatFileConfig,
    identity: IdentityFileConfig,
    ui: UiFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    relay_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    conversation: Option<String>,
    max_optimistic_messages: Option<usize>,
    page_size: Option<u32>,
    max_message_size: Option<usize>,
    drafts_dir: Option<PathBuf>,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    sender_id: Option<String>,
    display_name: Option<String>,
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

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Relay server WebSocket URL.
    pub relay_url: Option<String>,
    /// Timeout for connecting to the relay server.
    pub connect_timeout: Duration,
    /// Timeout for a single relay request.
    pub request_timeout: Duration,

    // -- Chat --
    /// Conversation to open.
    pub conversation: String,
    /// Pending messages kept before the oldest is evicted.
    pub max_optimistic_messages: usize,
    /// Messages fetched per history page.
    pub page_size: u32,
    /// Maximum message content size in bytes.
    pub max_message_size: usize,
    /// Where unsent drafts are persisted; `None` keeps them in memory only.
    pub drafts_dir: Option<PathBuf>,

    // -- Identity --
    /// Sender identifier stamped on outgoing messages.
    pub sender_id: Option<String>,
    /// Display name shown to other participants.
    pub display_name: Option<String>,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            conversation: "general".to_string(),
            max_optimistic_messages: DEFAULT_MAX_OPTIMISTIC_MESSAGES,
            page_size: 50,
            max_message_size: MAX_MESSAGE_SIZE,
            drafts_dir: dirs::data_dir().map(|d| d.join("hearth").join("drafts")),
            sender_id: None,
            display_name: None,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if the resolved relay URL is not a `ws://`/`wss://` URL.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            relay_url: cli
                .relay_url
                .clone()
                .or_else(|| file.network.relay_url.clone()),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            request_timeout: file
                .network
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            conversation: cli
                .conversation
                .clone()
                .or_else(|| file.chat.conversation.clone())
                .unwrap_or(defaults.conversation),
            max_optimistic_messages: file
                .chat
                .max_optimistic_messages
                .unwrap_or(defaults.max_optimistic_messages),
            page_size: file.chat.page_size.unwrap_or(defaults.page_size),
            max_message_size: file
                .chat
                .max_message_size
                .unwrap_or(defaults.max_message_size),
            drafts_dir: cli
                .drafts_dir
                .clone()
                .or_else(|| file.chat.drafts_dir.clone())
                .or(defaults.drafts_dir),
            sender_id: cli
                .sender_id
                .clone()
                .or_else(|| file.identity.sender_id.clone()),
            display_name: cli
                .display_name
                .clone()
                .or_else(|| file.identity.display_name.clone()),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Checks that the relay URL, if set, is a WebSocket URL and that the
    /// timestamp format parses.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTimestampFormat`] or
    /// [`ConfigError::InvalidRelayUrl`] otherwise.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if StrftimeItems::new(&self.timestamp_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidTimestampFormat(
                self.timestamp_format.clone(),
            ));
        }

        let Some(raw) = self.relay_url.as_deref() else {
            return Ok(());
        };
        let invalid = |reason: String| ConfigError::InvalidRelayUrl {
            url: raw.to_string(),
            reason,
        };
        let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(()),
            other => Err(invalid(format!("scheme must be ws or wss, got {other}"))),
        }
    }

    /// Connection settings for [`crate::realtime::RealtimeClient`].
    #[must_use]
    pub const fn realtime_options(&self) -> RealtimeOptions {
        RealtimeOptions {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
        }
    }

    /// Settings for [`crate::chat::ChatSession`].
    #[must_use]
    pub const fn session_options(&self) -> SessionOptions {
        SessionOptions {
            page_size: self.page_size,
            max_optimistic_messages: self.max_optimistic_messages,
            max_message_size: self.max_message_size,
        }
    }

    /// The sending identity, if a sender id is configured.
    #[must_use]
    pub fn author(&self) -> Option<Author> {
        let sender_id = self.sender_id.clone().filter(|s| !s.is_empty())?;
        let author = Author::new(sender_id);
        Some(match self.display_name.clone() {
            Some(name) => author.with_display_name(name),
            None => author,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Chat client with an optimistic, self-reconciling timeline")]
pub struct CliArgs {
    /// WebSocket URL of the relay server.
    #[arg(long, env = "HEARTH_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Your sender identity.
    #[arg(long, env = "HEARTH_SENDER_ID")]
    pub sender_id: Option<String>,

    /// Display name shown to others.
    #[arg(long, env = "HEARTH_DISPLAY_NAME")]
    pub display_name: Option<String>,

    /// Conversation to open.
    #[arg(long)]
    pub conversation: Option<String>,

    /// Directory for persisted unsent drafts.
    #[arg(long)]
    pub drafts_dir: Option<PathBuf>,

    /// Path to config file (default: `~/.config/hearth/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "HEARTH_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/hearth.log`).
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
    let path = config_dir.join("hearth").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
