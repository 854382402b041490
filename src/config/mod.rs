//! Configuration management for Quartermaster.
//!
//! Settings live in `config.kdl` files at two levels:
//! - System: `~/.config/quartermaster/config.kdl`
//! - Session: `<data root>/config.kdl` (one per project)
//!
//! Environment variables named after each setting (`LOCK_TIMEOUT`,
//! `MAX_RETRIES`, `UNRESPONSIVE_THRESHOLD`, ...) override both files.
//!
//! Use the [`resolver`] module for unified precedence resolution.

pub mod resolver;
pub mod schema;

pub use resolver::{
    ResolvedSettings, Settings, ValueSource, resolve_settings, resolve_settings_for,
    session_config_path, system_config_path,
};
pub use schema::QuartermasterConfig;
