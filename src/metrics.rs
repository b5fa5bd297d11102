//! Store instrumentation
//!
//! A metrics sink is handed to the store at construction and lives as long as
//! the store. Deployments can plug their own exporter behind [`StoreMetrics`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::StoreResult;

/// Store operation being observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Create,
    Get,
    GetById,
    List,
    Update,
    UpdateExecution,
    ListEvents,
    RetrieveAndLock,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::Create => "create",
            StoreOperation::Get => "get",
            StoreOperation::GetById => "get_by_id",
            StoreOperation::List => "list",
            StoreOperation::Update => "update",
            StoreOperation::UpdateExecution => "update_execution",
            StoreOperation::ListEvents => "list_events",
            StoreOperation::RetrieveAndLock => "retrieve_and_lock",
        }
    }
}

/// How an operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationOutcome {
    Ok,
    /// Nothing to return, e.g. no claimable execution
    Empty,
    Error(&'static str),
}

impl OperationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationOutcome::Ok => "ok",
            OperationOutcome::Empty => "empty",
            OperationOutcome::Error(kind) => kind,
        }
    }

    pub fn from_result<T>(result: &StoreResult<T>) -> Self {
        match result {
            Ok(_) => OperationOutcome::Ok,
            Err(err) => OperationOutcome::Error(err.kind()),
        }
    }
}

/// Metrics sink for store operations
pub trait StoreMetrics: Send + Sync {
    fn record(&self, operation: StoreOperation, outcome: OperationOutcome, latency: Duration);
}

pub type SharedMetrics = Arc<dyn StoreMetrics>;

/// Discards every observation
pub struct NoopMetrics;

impl StoreMetrics for NoopMetrics {
    fn record(&self, _operation: StoreOperation, _outcome: OperationOutcome, _latency: Duration) {}
}

/// Emits each observation as a tracing event
pub struct TracingMetrics;

impl StoreMetrics for TracingMetrics {
    fn record(&self, operation: StoreOperation, outcome: OperationOutcome, latency: Duration) {
        tracing::debug!(
            target: "execution_store::metrics",
            operation = operation.as_str(),
            outcome = outcome.as_str(),
            latency_ms = latency.as_secs_f64() * 1000.0,
            "store operation"
        );
    }
}

/// Started timer for one operation
pub(crate) struct OperationTimer {
    operation: StoreOperation,
    started: Instant,
}

impl OperationTimer {
    pub(crate) fn start(operation: StoreOperation) -> Self {
        Self {
            operation,
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(self, metrics: &dyn StoreMetrics, outcome: OperationOutcome) {
        metrics.record(self.operation, outcome, self.started.elapsed());
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingMetrics;
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn test_outcome_from_result() {
        let ok: StoreResult<()> = Ok(());
        assert_eq!(OperationOutcome::from_result(&ok), OperationOutcome::Ok);

        let err: StoreResult<()> = Err(StoreError::not_found("execution", "p/d/n"));
        assert_eq!(
            OperationOutcome::from_result(&err),
            OperationOutcome::Error("not_found")
        );
    }

    #[test]
    fn test_timer_records_once() {
        let metrics = RecordingMetrics::default();
        let timer = OperationTimer::start(StoreOperation::RetrieveAndLock);
        timer.finish(&metrics, OperationOutcome::Empty);

        assert_eq!(
            metrics.observations(),
            vec![(StoreOperation::RetrieveAndLock, OperationOutcome::Empty)]
        );
        assert_eq!(metrics.count(StoreOperation::RetrieveAndLock, OperationOutcome::Empty), 1);
        assert_eq!(metrics.count(StoreOperation::Create, OperationOutcome::Ok), 0);
    }

    #[test]
    fn test_labels_are_stable() {
        assert_eq!(StoreOperation::RetrieveAndLock.as_str(), "retrieve_and_lock");
        assert_eq!(OperationOutcome::Empty.as_str(), "empty");
        assert_eq!(OperationOutcome::Error("transient").as_str(), "transient");
    }
}
