//! Configuration type definitions.

use serde::Deserialize;
use std::path::Path;

use super::defaults::{
    default_localpart, default_pills_length, default_puppet_prefix, default_sync_timeout_ms,
    default_true,
};

/// Top-level configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub homeserver: HomeserverConfig,
    pub bridge: BridgeSection,

    /// Networks to bring up at startup; persisted network rooms override.
    #[serde(default, rename = "network")]
    pub networks: Vec<NetworkBlock>,
}

impl BridgeConfig {
    /// Load and parse a configuration file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(Path::new(path))?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Homeserver connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HomeserverConfig {
    /// Base URL, e.g. `https://matrix.example.com`.
    pub url: String,
    /// Appservice access token.
    pub token: String,
    /// Whether the Synapse admin API is available to us (media quarantine).
    #[serde(default)]
    pub admin: bool,
    /// Sync long-poll window.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

/// Bridge identity and policy.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    /// The operating user; the only account whose messages are relayed out.
    pub owner: String,
    /// Our homeserver's server_name (the part after `:` in user ids).
    pub server_name: String,
    /// Localpart of the bridge bot itself.
    #[serde(default = "default_localpart")]
    pub localpart: String,
    /// Prefix for puppet localparts, e.g. `irc_`.
    #[serde(default = "default_puppet_prefix")]
    pub puppet_prefix: String,
    /// How aggressively channel membership is mirrored into Matrix.
    #[serde(default)]
    pub member_sync: MemberSync,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Membership mirroring policy for channel rooms.
///
/// Plumbed rooms snapshot this at creation time and keep it for life.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberSync {
    /// Mirror every channel member as a puppet.
    Full,
    /// Add puppets lazily when they first speak.
    #[default]
    Half,
    /// No membership mirroring.
    Off,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// One IRC network block.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkBlock {
    /// Short network name, used in puppet user ids.
    pub name: String,
    /// `host:port` of the server to dial.
    pub address: String,
    pub nick: String,
    /// Defaults to the nick when unset.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    #[serde(default = "default_true")]
    pub autoconnect: bool,
    /// Minimum nickname length for mention pillification; 0 disables pills.
    #[serde(default = "default_pills_length")]
    pub pills_length: usize,
    /// Nicks never pillified.
    #[serde(default)]
    pub pills_ignore: Vec<String>,
}
