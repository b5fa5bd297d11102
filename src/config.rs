//! Configuration loading
//!
//! Sources are layered, later ones win:
//! 1. Built-in defaults
//! 2. TOML config file (`--config`, `EXECSTORE_CONFIG_PATH`, or `./execstore.toml`)
//! 3. Environment variables (`EXECSTORE_DATABASE_URL`, `EXECSTORE_CLAIM__STALE_AFTER_SECS`, ...)
//! 4. Explicit overrides passed to [`ConfigBuilder`]

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "EXECSTORE";
const DEFAULT_CONFIG_FILE: &str = "execstore.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub claim: ClaimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// A QUEUED execution not touched for this long may be reclaimed
    pub stale_after_secs: u64,
    /// Owner recorded when the claimant does not identify itself
    pub default_cluster: String,
    /// Sleep between polls when nothing is eligible
    pub poll_interval_ms: u64,
    /// Upper bound for backoff after store faults
    pub max_backoff_ms: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 60,
            default_cluster: "Unknown".to_string(),
            poll_interval_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl ClaimConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load configuration from files and environment with no overrides
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database
            .url
            .as_deref()
            .context("database URL not configured (set EXECSTORE_DATABASE_URL or database.url)")
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }

    fn validate(&self) -> Result<()> {
        match self.database.url.as_deref() {
            None | Some("") => bail!(
                "database URL not configured (set EXECSTORE_DATABASE_URL or database.url)"
            ),
            _ => {}
        }
        if self.database.max_connections == 0 {
            bail!("database.max_connections must be greater than 0");
        }
        if self.database.min_connections > self.database.max_connections {
            bail!(
                "database.min_connections ({}) exceeds database.max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }
        if self.claim.stale_after_secs == 0 {
            bail!("claim.stale_after_secs must be greater than 0");
        }
        if self.claim.default_cluster.trim().is_empty() {
            bail!("claim.default_cluster must not be empty");
        }
        Ok(())
    }
}

/// Builder applying explicit overrides on top of file and environment sources
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    database_url: Option<String>,
    config_path: Option<PathBuf>,
    skip_environment: bool,
}

impl ConfigBuilder {
    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Ignore process environment and `.env` (used by tests)
    pub fn skip_environment(mut self, skip: bool) -> Self {
        self.skip_environment = skip;
        self
    }

    pub fn build(self) -> Result<Config> {
        if !self.skip_environment {
            dotenvy::dotenv().ok();
        }

        let defaults = config::Config::try_from(&Config::default())
            .context("Failed to serialize default configuration")?;
        let mut builder = config::Config::builder().add_source(defaults);

        let explicit_path = self.config_path.clone().or_else(|| {
            if self.skip_environment {
                None
            } else {
                std::env::var(format!("{}_CONFIG_PATH", ENV_PREFIX))
                    .ok()
                    .map(PathBuf::from)
            }
        });
        match explicit_path {
            Some(path) => {
                if !path.exists() {
                    bail!("config file not found: {}", path.display());
                }
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                builder = builder
                    .add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false));
            }
        }

        if !self.skip_environment {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            );
            let flat_url = std::env::var(format!("{}_DATABASE_URL", ENV_PREFIX)).ok();
            builder = builder
                .set_override_option("database.url", flat_url)
                .context("Failed to apply database URL from environment")?;
        }

        builder = builder
            .set_override_option("database.url", self.database_url)
            .context("Failed to apply database URL override")?;

        let config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.claim.stale_after_secs, 60);
        assert_eq!(config.claim.default_cluster, "Unknown");
        assert_eq!(config.database.max_connections, 20);
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_build_with_override() {
        let config = Config::builder()
            .skip_environment(true)
            .database_url(Some("postgresql://localhost/execstore".to_string()))
            .build()
            .unwrap();

        assert_eq!(
            config.database_url().unwrap(),
            "postgresql://localhost/execstore"
        );
        assert_eq!(config.claim.stale_after(), Duration::from_secs(60));
    }

    #[test]
    fn test_build_without_url_fails() {
        let result = Config::builder().skip_environment(true).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_file_values_and_override_precedence() {
        let dir = std::env::temp_dir().join(format!("execstore-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("execstore.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[database]\nurl = \"postgresql://file/db\"\nmax_connections = 4\nmin_connections = 1\n\n[claim]\nstale_after_secs = 15\ndefault_cluster = \"east\""
        )
        .unwrap();

        let config = Config::builder()
            .skip_environment(true)
            .config_path(Some(path.clone()))
            .build()
            .unwrap();
        assert_eq!(config.database_url().unwrap(), "postgresql://file/db");
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.claim.stale_after_secs, 15);
        assert_eq!(config.claim.default_cluster, "east");
        // Untouched keys keep their defaults
        assert_eq!(config.claim.poll_interval_ms, 100);

        let config = Config::builder()
            .skip_environment(true)
            .config_path(Some(path))
            .database_url(Some("postgresql://override/db".to_string()))
            .build()
            .unwrap();
        assert_eq!(config.database_url().unwrap(), "postgresql://override/db");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let result = Config::builder()
            .skip_environment(true)
            .config_path(Some(PathBuf::from("/nonexistent/execstore.toml")))
            .database_url(Some("postgresql://localhost/x".to_string()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_pool_bounds_rejected() {
        let mut config = Config::default();
        config.database.url = Some("postgresql://localhost/x".to_string());
        config.database.min_connections = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_toml_renders_sections() {
        let rendered = Config::default().to_toml().unwrap();
        assert!(rendered.contains("[database]"));
        assert!(rendered.contains("[claim]"));
        assert!(rendered.contains("stale_after_secs = 60"));
    }
}
