//! Configuration loading and management.
//!
//! Split into logical submodules:
//! - [`types`]: core config structs (BridgeConfig, HomeserverConfig, ...)
//! - [`defaults`]: serde default value functions
//! - [`validation`]: startup validation that collects all errors

mod defaults;
mod types;
mod validation;

pub use defaults::default_pills_length;
pub use types::{
    BridgeConfig, BridgeSection, HomeserverConfig, LogFormat, MemberSync, NetworkBlock,
};
pub use validation::{validate, ValidationError};
