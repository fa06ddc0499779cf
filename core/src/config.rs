//! Configuration schema and loader.
//!
//! A thin collaborator: parse the file named on the CLI, validate it, hand
//! back a `Config` the Coordinator can run from. Supports YAML or JSON,
//! sniffed by extension with a fallback to the other format -- this mirrors
//! how lenient the rest of this codebase's lineage is about config sources
//! (env vars with defaults everywhere) without inventing a new format.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mapping::MappingSet;

fn default_stun_server() -> String {
    "stun.l.google.com:19302".to_string()
}

fn default_secondary_stun_server() -> String {
    "stun1.l.google.com:19302".to_string()
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_watch_interval_secs() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

/// Raw, deserialized configuration file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfig {
    pub mode: Mode,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "signalingUrl")]
    pub signaling_url: String,
    #[serde(rename = "stunServer", default = "default_stun_server")]
    pub stun_server: String,
    #[serde(rename = "secondaryStunServer", default = "default_secondary_stun_server")]
    pub secondary_stun_server: String,
    #[serde(rename = "sessionTimeoutSecs", default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(rename = "watchIntervalSecs", default = "default_watch_interval_secs")]
    pub watch_interval_secs: u64,
    #[serde(default)]
    pub mappings: Vec<String>,
    #[serde(rename = "logLevel", default = "default_log_level")]
    pub log_level: String,
}

/// Validated configuration, ready for the Coordinator.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub room_id: String,
    pub signaling_url: String,
    pub stun_server: String,
    pub secondary_stun_server: String,
    pub session_timeout_secs: u64,
    pub watch_interval_secs: u64,
    pub mappings: MappingSet,
    pub log_level: String,
}

impl Config {
    /// Loads and validates a config file, sniffing YAML vs JSON by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let (primary, fallback): (fn(&str) -> Option<RawConfig>, fn(&str) -> Option<RawConfig>) =
            if is_json {
                (
                    |s| serde_json::from_str(s).ok(),
                    |s| serde_yaml::from_str(s).ok(),
                )
            } else {
                (
                    |s| serde_yaml::from_str(s).ok(),
                    |s| serde_json::from_str(s).ok(),
                )
            };

        let raw = primary(&contents)
            .or_else(|| fallback(&contents))
            .ok_or_else(|| Error::config(format!("cannot parse {}", path.display())))?;

        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self> {
        if raw.room_id.trim().is_empty() {
            return Err(Error::config("roomId must not be empty"));
        }
        if raw.signaling_url.trim().is_empty() {
            return Err(Error::config("signalingUrl must not be empty"));
        }

        let mappings = MappingSet::parse_strict(&raw.mappings)?;

        match raw.mode {
            Mode::Client if mappings.is_empty() => {
                return Err(Error::config("client mode requires at least one mapping"));
            }
            Mode::Server if !raw.mappings.is_empty() => {
                tracing::warn!("server mode ignores the mappings field in config");
            }
            _ => {}
        }

        let mappings = if raw.mode == Mode::Server {
            MappingSet::new()
        } else {
            mappings
        };

        Ok(Config {
            mode: raw.mode,
            room_id: raw.room_id,
            signaling_url: raw.signaling_url,
            stun_server: raw.stun_server,
            secondary_stun_server: raw.secondary_stun_server,
            session_timeout_secs: raw.session_timeout_secs,
            watch_interval_secs: raw.watch_interval_secs,
            mappings,
            log_level: raw.log_level,
        })
    }
}
