//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::BridgeConfig;
use std::collections::HashSet;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("homeserver.url must start with http:// or https://, got '{0}'")]
    InvalidHomeserverUrl(String),
    #[error("homeserver.token is required")]
    MissingToken,
    #[error("bridge.owner must be a full user id like @user:server, got '{0}'")]
    InvalidOwner(String),
    #[error("bridge.server_name is required")]
    MissingServerName,
    #[error("bridge.localpart must not contain '@' or ':', got '{0}'")]
    InvalidLocalpart(String),
    #[error("bridge.puppet_prefix is required")]
    MissingPuppetPrefix,
    #[error("network.name is required")]
    MissingNetworkName,
    #[error("duplicate network name '{0}'")]
    DuplicateNetwork(String),
    #[error("network '{0}': address must be host:port, got '{1}'")]
    InvalidAddress(String, String),
    #[error("network '{0}': nick is required")]
    MissingNick(String),
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &BridgeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let url = &config.homeserver.url;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        errors.push(ValidationError::InvalidHomeserverUrl(url.clone()));
    }
    if config.homeserver.token.is_empty() {
        errors.push(ValidationError::MissingToken);
    }

    let owner = &config.bridge.owner;
    if !owner.starts_with('@') || !owner.contains(':') {
        errors.push(ValidationError::InvalidOwner(owner.clone()));
    }
    if config.bridge.server_name.is_empty() {
        errors.push(ValidationError::MissingServerName);
    }
    let localpart = &config.bridge.localpart;
    if localpart.is_empty() || localpart.contains('@') || localpart.contains(':') {
        errors.push(ValidationError::InvalidLocalpart(localpart.clone()));
    }
    if config.bridge.puppet_prefix.is_empty() {
        errors.push(ValidationError::MissingPuppetPrefix);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for network in &config.networks {
        if network.name.is_empty() {
            errors.push(ValidationError::MissingNetworkName);
            continue;
        }
        if !seen.insert(network.name.as_str()) {
            errors.push(ValidationError::DuplicateNetwork(network.name.clone()));
        }
        let valid_address = network
            .address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid_address {
            errors.push(ValidationError::InvalidAddress(
                network.name.clone(),
                network.address.clone(),
            ));
        }
        if network.nick.is_empty() {
            errors.push(ValidationError::MissingNick(network.name.clone()));
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
