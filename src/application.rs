//! Application bootstrap
//!
//! Loads configuration, opens the pool, applies migrations and wires the
//! store and services together.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

use crate::config::Config;
use crate::db;
use crate::executions::ExecutionRepo;
use crate::metrics::{NoopMetrics, SharedMetrics, TracingMetrics};
use crate::services::ExecutionService;
use crate::worker::ClaimPoller;

/// A wired execution store with its services
pub struct Application {
    pub config: Config,
    pub pool: PgPool,
    pub repo: ExecutionRepo,
    pub execution_service: ExecutionService,
}

impl Application {
    /// Wire services over an existing pool (no I/O)
    pub fn new(config: Config, pool: PgPool, metrics: SharedMetrics) -> Self {
        let repo = ExecutionRepo::new(pool.clone())
            .with_metrics(metrics)
            .with_claim_config(&config.claim);
        Self {
            config,
            pool,
            execution_service: ExecutionService::new(repo.clone()),
            repo,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Poller claiming on behalf of `cluster`
    pub fn claim_poller(&self, cluster: Option<String>) -> ClaimPoller {
        ClaimPoller::new(self.repo.clone(), &self.config.claim).cluster(cluster)
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Database URL (overrides config file and env vars)
    pub database_url: Option<String>,

    /// Config file path (overrides default search)
    pub config_path: Option<PathBuf>,

    /// Apply embedded migrations before returning
    pub auto_migrate: bool,

    /// Log per-operation latencies through tracing
    pub trace_metrics: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            database_url: None,
            config_path: None,
            auto_migrate: true,
            trace_metrics: false,
        }
    }
}

pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self {
            options: InitOptions::default(),
        }
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.options.database_url = Some(url.into());
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn auto_migrate(mut self, auto: bool) -> Self {
        self.options.auto_migrate = auto;
        self
    }

    pub fn trace_metrics(mut self, enabled: bool) -> Self {
        self.options.trace_metrics = enabled;
        self
    }

    pub async fn init(self) -> Result<Application> {
        initialize(self.options).await
    }
}

impl Default for InitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Load config, connect, optionally migrate, and build the application
pub async fn initialize(options: InitOptions) -> Result<Application> {
    let config = Config::builder()
        .database_url(options.database_url)
        .config_path(options.config_path)
        .build()?;

    let pool = db::create_pool(&config.database).await?;

    if options.auto_migrate {
        db::migrate(&pool).await?;
        tracing::debug!("Migrations applied");
    }

    let metrics: SharedMetrics = if options.trace_metrics {
        Arc::new(TracingMetrics)
    } else {
        Arc::new(NoopMetrics)
    };

    Ok(Application::new(config, pool, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = InitBuilder::new().database_url("postgresql://localhost/x");
        assert!(builder.options.auto_migrate);
        assert!(!builder.options.trace_metrics);
        assert_eq!(
            builder.options.database_url.as_deref(),
            Some("postgresql://localhost/x")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_init_from_environment() {
        let url = std::env::var("EXECSTORE_DATABASE_URL").unwrap();
        let app = InitBuilder::new()
            .database_url(url)
            .trace_metrics(true)
            .init()
            .await
            .unwrap();

        assert_eq!(app.config().claim.default_cluster, "Unknown");
        let result: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(app.pool())
            .await
            .unwrap();
        assert_eq!(result.0, 1);
    }
}
