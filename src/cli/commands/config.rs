//! Config Command
//!
//! Usage:
//!   cassandra config show [-f toml|json|yaml]
//!   cassandra config path
//!   cassandra config init [-g] [--force]

use std::path::Path;
use std::str::FromStr;

use crate::cli::ui::Output;
use crate::config::{ConfigFormat, ConfigLoader};
use crate::types::{CassandraError, Result};

impl FromStr for ConfigFormat {
    type Err = CassandraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(CassandraError::Config(format!(
                "Invalid format '{}'. Valid values: toml, json, yaml",
                other
            ))),
        }
    }
}

/// Print the effective configuration (all sources merged)
pub fn show(explicit: Option<&Path>, format: ConfigFormat) -> Result<()> {
    let config = ConfigLoader::load(explicit)?;
    print!("{}", ConfigLoader::render(&config, format)?);
    Ok(())
}

/// Show configuration paths
pub fn path() -> Result<()> {
    ConfigLoader::show_path();
    Ok(())
}

/// Write a default config file, globally or for the current project
pub fn init(global: bool, force: bool) -> Result<()> {
    let path = ConfigLoader::init(global, force)?;
    let scope = if global { "global" } else { "project" };
    let output = Output::new();
    output.success(&format!("Initialized {} configuration", scope));
    output.field("Config", path.display());
    Ok(())
}
