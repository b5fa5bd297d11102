// Execution record store
//
// This module owns every read and write against the executions table:
// - Creating executions (unique per live project/domain/name)
// - Point lookups and filtered, paginated listing
// - Field-level updates, atomically paired with an event append
// - Claiming the next eligible execution for a worker

mod claim;
mod create;
mod lifecycle;
mod query;


use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::config::ClaimConfig;
use crate::error::StoreResult;
use crate::metrics::{NoopMetrics, OperationOutcome, OperationTimer, SharedMetrics};

pub(crate) use lifecycle::insert_event;

const ENTITY: &str = "execution";

/// Postgres-backed execution store
///
/// Cheap to clone; clones share the pool and the metrics sink.
#[derive(Clone)]
pub struct ExecutionRepo {
    pool: PgPool,
    metrics: SharedMetrics,
    stale_after: Duration,
    default_cluster: String,
}

impl ExecutionRepo {
    pub fn new(pool: PgPool) -> Self {
        let claim = ClaimConfig::default();
        Self {
            pool,
            metrics: Arc::new(NoopMetrics),
            stale_after: claim.stale_after(),
            default_cluster: claim.default_cluster,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_claim_config(mut self, claim: &ClaimConfig) -> Self {
        self.stale_after = claim.stale_after();
        self.default_cluster = claim.default_cluster.clone();
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    fn observe<T>(&self, timer: OperationTimer, result: &StoreResult<T>) {
        timer.finish(self.metrics.as_ref(), OperationOutcome::from_result(result));
    }
}
