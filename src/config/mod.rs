//! Configuration Management
//!
//! Unified configuration system with hierarchical resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/cassandra/config.toml)
//! 3. Project config (.cassandra/config.toml)
//! 4. Explicit file (--config)
//! 5. Environment variables (CASSANDRA_*)
//! 6. CLI arguments (highest priority)

mod loader;
mod types;

pub use loader::{ConfigFormat, ConfigLoader};
pub use types::*;
