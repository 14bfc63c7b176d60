//! Configuration Loader (Figment-based)
//!
//! Loads and merges configuration from multiple sources using Figment:
//! 1. Built-in defaults (Serialized)
//! 2. Global config (~/.config/cassandra/config.toml)
//! 3. Project config (.cassandra/config.toml)
//! 4. Explicit config file (--config)
//! 5. Environment variables (CASSANDRA_* prefix, `__` separates sections)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::Config;
use crate::types::{CassandraError, Result};

/// Output format for `config show`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
    Yaml,
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with full resolution chain:
    /// defaults → global → project → explicit file → env vars
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        let config: Config = Self::figment(explicit)?
            .extract()
            .map_err(|e| CassandraError::Config(format!("Configuration error: {}", e)))?;

        // Validate configuration after loading
        config.validate()?;

        Ok(config)
    }

    /// Build the merged figment without extracting it
    pub fn figment(explicit: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            debug!("Loading global config from: {}", global_path.display());
            figment = figment.merge(Toml::file(&global_path));
        }

        let project_path = Self::project_config_path();
        if project_path.exists() {
            debug!("Loading project config from: {}", project_path.display());
            figment = figment.merge(Toml::file(&project_path));
        }

        if let Some(path) = explicit {
            if !path.exists() {
                return Err(CassandraError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            debug!("Loading explicit config from: {}", path.display());
            figment = figment.merge(Toml::file(path));
        }

        // e.g. CASSANDRA_LLM__MODEL -> llm.model, CASSANDRA_CLIENT__MAX_ATTEMPTS -> client.max_attempts
        Ok(figment.merge(Env::prefixed("CASSANDRA_").split("__").lowercase(true)))
    }

    /// Load configuration from a specific file only
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| CassandraError::Config(format!("Configuration error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    // =========================================================================
    // Path Management
    // =========================================================================

    /// Get path to global config directory
    pub fn global_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "cassandra")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get path to global config file
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join("config.toml"))
    }

    /// Get path to project config file
    pub fn project_config_path() -> PathBuf {
        Self::project_dir().join("config.toml")
    }

    /// Get project data directory
    pub fn project_dir() -> PathBuf {
        PathBuf::from(".cassandra")
    }

    // =========================================================================
    // Config Commands
    // =========================================================================

    /// Show config file paths
    pub fn show_path() {
        println!("Configuration paths:");
        println!();

        if let Some(global) = Self::global_config_path() {
            let exists = if global.exists() { "✓" } else { "✗" };
            println!("  Global:  {} {}", exists, global.display());
        } else {
            println!("  Global:  (not available)");
        }

        let project = Self::project_config_path();
        let exists = if project.exists() { "✓" } else { "✗" };
        println!("  Project: {} {}", exists, project.display());
    }

    /// Render the effective configuration
    pub fn render(config: &Config, format: ConfigFormat) -> Result<String> {
        match format {
            ConfigFormat::Json => Ok(serde_json::to_string_pretty(config)?),
            ConfigFormat::Yaml => {
                serde_yaml::to_string(config).map_err(|e| CassandraError::Config(e.to_string()))
            }
            ConfigFormat::Toml => {
                toml::to_string_pretty(config).map_err(|e| CassandraError::Config(e.to_string()))
            }
        }
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Write a default config file globally or into the project directory
    pub fn init(global: bool, force: bool) -> Result<PathBuf> {
        let dir = if global {
            Self::global_dir().ok_or_else(|| {
                CassandraError::Config("Cannot determine global config directory".to_string())
            })?
        } else {
            Self::project_dir()
        };
        fs::create_dir_all(&dir)?;

        let config_path = dir.join("config.toml");
        if !config_path.exists() || force {
            fs::write(&config_path, Self::default_config_file())?;
            info!("Created config: {}", config_path.display());
        } else {
            info!("Config exists: {}", config_path.display());
        }

        Ok(config_path)
    }

    /// Generate default config content (TOML)
    fn default_config_file() -> String {
        r#"# Cassandra Configuration
# Project settings in .cassandra/config.toml override the global file.
# Environment variables override both, e.g. CASSANDRA_LLM__MODEL=gemini-2.0-pro

version = "1.0"

[llm]
provider = "gemini"
model = "gemini-2.0-flash"
timeout_secs = 120

[client]
max_attempts = 5
backoff_factor = 2.0
jitter = true
transient = { base_ms = 1000, cap_ms = 60000 }
rate_limited = { base_ms = 5000, cap_ms = 120000 }
overloaded = { base_ms = 2000, cap_ms = 30000 }

[rate_limit]
max_concurrent = 4
requests_per_second = 2.0
burst = 4

[pipeline]
default_concurrency = 3
max_documents = 3

[pipeline.concurrency]
mine = 3
audit = 3

[scoring.weights]
clinical = 0.30
dark_data = 0.35
forensic = 0.20
literature = 0.15
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_file_parses() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, ConfigLoader::default_config_file()).unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.pipeline.concurrency_for("mine"), 3);
        assert_eq!(config.client.max_attempts, 5);
    }

    #[test]
    fn test_invalid_weights_rejected_at_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[scoring.weights]\nclinical = 0.9\n").unwrap();

        let err = ConfigLoader::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CASSANDRA_LLM__MODEL", "test-model");
            jail.set_env("CASSANDRA_CLIENT__MAX_ATTEMPTS", "2");
            let config: Config = ConfigLoader::figment(None)
                .map_err(|e| e.to_string())?
                .extract()
                .map_err(|e| e.to_string())?;
            assert_eq!(config.llm.model, "test-model");
            assert_eq!(config.client.max_attempts, 2);
            Ok(())
        });
    }

    #[test]
    fn test_render_formats() {
        let config = Config::default();
        for format in [ConfigFormat::Toml, ConfigFormat::Json, ConfigFormat::Yaml] {
            let rendered = ConfigLoader::render(&config, format).unwrap();
            assert!(rendered.contains("gemini"));
        }
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = ConfigLoader::load(Some(Path::new("/nonexistent/cassandra.toml"))).unwrap_err();
        assert!(matches!(err, CassandraError::Config(_)));
    }
}
