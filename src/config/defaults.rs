//! Default value functions for configuration.

/// Returns `true` (for serde defaults).
pub fn default_true() -> bool {
    true
}

pub fn default_localpart() -> String {
    "slircb".to_string()
}

pub fn default_puppet_prefix() -> String {
    "irc_".to_string()
}

/// Minimum nickname length considered for pillification.
pub fn default_pills_length() -> usize {
    2
}

/// Sync long-poll window in milliseconds.
pub fn default_sync_timeout_ms() -> u64 {
    30_000
}
