//! Configuration loading, schema, and validation.
//!
//! Loading priority (later wins): built-in defaults, config file
//! (`flowtap.toml` in cwd or `--config` path), explicit CLI flags.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{find_default, load_config, ConfigError, DEFAULT_FILENAMES};
pub use schema::{ProxyConfig, UpstreamConfig};
pub use validation::{validate_config, ValidationError};
