//! Engine configuration loading (§6 "Engine configuration").
//!
//! TOML is the sole config source, loaded the way `forwarder::config`
//! loads `ForwarderConfig`: a lenient `RawConfig` deserialization target
//! (every field optional) validated into a populated `EngineConfig`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `None` means an in-memory (non-durable) journal.
    pub journal_path: Option<PathBuf>,
    pub role: Role,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub sender_sub_id: Option<String>,
    pub target_sub_id: Option<String>,
    pub heartbeat_interval_secs: u64,
}

impl EngineConfig {
    pub fn session_key(&self) -> String {
        fix_session::Session::key_for(&self.sender_comp_id, &self.target_comp_id)
    }
}

#[derive(Debug, Clone)]
pub enum Role {
    Initiator {
        host: String,
        port: u16,
        reconnect_interval_secs: u64,
    },
    Acceptor {
        bind_host: String,
        bind_port: u16,
    },
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    journal: Option<RawJournalConfig>,
    session: Option<RawSessionConfig>,
    role: Option<RawRoleConfig>,
}

#[derive(Debug, Deserialize)]
struct RawJournalConfig {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSessionConfig {
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    sender_sub_id: Option<String>,
    target_sub_id: Option<String>,
    heartbeat_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawRoleConfig {
    kind: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    reconnect_interval_secs: Option<u64>,
    bind_host: Option<String>,
    bind_port: Option<u16>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<EngineConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_session = raw.session.ok_or_else(|| ConfigError::MissingField("session".to_owned()))?;
    let sender_comp_id = raw_session
        .sender_comp_id
        .ok_or_else(|| ConfigError::MissingField("session.sender_comp_id".to_owned()))?;
    let target_comp_id = raw_session
        .target_comp_id
        .ok_or_else(|| ConfigError::MissingField("session.target_comp_id".to_owned()))?;
    let heartbeat_interval_secs = raw_session.heartbeat_interval_secs.unwrap_or(30);
    if heartbeat_interval_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "session.heartbeat_interval_secs must be at least 1".to_owned(),
        ));
    }

    let journal_path = match raw.journal.and_then(|j| j.path) {
        Some(p) if p == ":memory:" => None,
        Some(p) => Some(PathBuf::from(p)),
        None => None,
    };

    let raw_role = raw.role.ok_or_else(|| ConfigError::MissingField("role".to_owned()))?;
    let kind = raw_role
        .kind
        .ok_or_else(|| ConfigError::MissingField("role.kind".to_owned()))?;
    let role = match kind.as_str() {
        "initiator" => {
            let reconnect_interval_secs = raw_role.reconnect_interval_secs.unwrap_or(5);
            if reconnect_interval_secs == 0 {
                return Err(ConfigError::InvalidValue(
                    "role.reconnect_interval_secs must be at least 1".to_owned(),
                ));
            }
            Role::Initiator {
                host: raw_role
                    .host
                    .ok_or_else(|| ConfigError::MissingField("role.host".to_owned()))?,
                port: raw_role
                    .port
                    .ok_or_else(|| ConfigError::MissingField("role.port".to_owned()))?,
                reconnect_interval_secs,
            }
        }
        "acceptor" => Role::Acceptor {
            bind_host: raw_role
                .bind_host
                .ok_or_else(|| ConfigError::MissingField("role.bind_host".to_owned()))?,
            bind_port: raw_role
                .bind_port
                .ok_or_else(|| ConfigError::MissingField("role.bind_port".to_owned()))?,
        },
        other => {
            return Err(ConfigError::InvalidValue(format!(
                "role.kind must be 'initiator' or 'acceptor', got {other:?}"
            )))
        }
    };

    Ok(EngineConfig {
        journal_path,
        role,
        sender_comp_id,
        target_comp_id,
        sender_sub_id: raw_session.sender_sub_id,
        target_sub_id: raw_session.target_sub_id,
        heartbeat_interval_secs,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}
