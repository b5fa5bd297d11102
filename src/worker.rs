//! Claim polling loop for worker processes
//!
//! Polls the store for the next eligible execution. An empty store is not an
//! error: the poller sleeps for the poll interval and tries again. Retryable
//! store faults back off exponentially up to the configured ceiling; other
//! faults are returned to the caller.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ClaimConfig;
use crate::error::StoreResult;
use crate::executions::ExecutionRepo;
use crate::types::{ClaimOutcome, Execution};

pub struct ClaimPoller {
    repo: ExecutionRepo,
    cluster: Option<String>,
    poll_interval: Duration,
    max_backoff: Duration,
}

impl ClaimPoller {
    pub fn new(repo: ExecutionRepo, claim: &ClaimConfig) -> Self {
        Self {
            repo,
            cluster: None,
            poll_interval: claim.poll_interval(),
            max_backoff: claim.max_backoff(),
        }
    }

    /// Identity recorded on claimed executions
    pub fn cluster(mut self, cluster: Option<String>) -> Self {
        self.cluster = cluster;
        self
    }

    /// Wait for the next claimable execution
    ///
    /// Returns `Ok(None)` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> StoreResult<Option<Execution>> {
        let mut backoff = self.poll_interval;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                result = self.repo.retrieve_and_lock(self.cluster.as_deref()) => result,
            };

            let delay = match attempt {
                Ok(ClaimOutcome::Claimed(execution)) => return Ok(Some(execution)),
                Ok(ClaimOutcome::NoneEligible) => {
                    backoff = self.poll_interval;
                    self.poll_interval
                }
                Err(err) if err.is_retryable() => {
                    let delay = backoff;
                    backoff = next_backoff(backoff, self.max_backoff);
                    tracing::warn!(
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "Claim failed, retrying"
                    );
                    delay
                }
                Err(err) => return Err(err),
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Claim and hand executions to `handler` until cancelled
    ///
    /// Returns the number of executions handled.
    pub async fn run<F, Fut>(&self, cancel: &CancellationToken, mut handler: F) -> StoreResult<usize>
    where
        F: FnMut(Execution) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut handled = 0;
        while let Some(execution) = self.next(cancel).await? {
            handler(execution).await;
            handled += 1;
        }
        tracing::info!(handled, "Claim poller stopped");
        Ok(handled)
    }
}

/// Double the delay, capped at `max`
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    fn unreachable_repo() -> ExecutionRepo {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(50))
            .connect_lazy("postgresql://execstore@127.0.0.1:1/unreachable")
            .unwrap();
        ExecutionRepo::new(pool)
    }

    fn fast_config() -> ClaimConfig {
        ClaimConfig {
            poll_interval_ms: 10,
            max_backoff_ms: 40,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let max = Duration::from_millis(500);
        assert_eq!(next_backoff(Duration::from_millis(100), max), Duration::from_millis(200));
        assert_eq!(next_backoff(Duration::from_millis(300), max), max);
        assert_eq!(next_backoff(max, max), max);
    }

    #[tokio::test]
    async fn test_cancelled_poller_returns_none() {
        let poller = ClaimPoller::new(unreachable_repo(), &fast_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let next = tokio_test::assert_ok!(poller.next(&cancel).await);
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_store_faults_are_retried_until_cancelled() {
        let poller = ClaimPoller::new(unreachable_repo(), &fast_config());
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stopper.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), poller.next(&cancel))
            .await
            .expect("poller should stop after cancellation");
        assert!(result.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_run_hands_out_each_execution_once() {
        use crate::db::test_helpers::with_test_db;
        use crate::types::NewExecution;
        use std::sync::{Arc, Mutex};

        let pool = with_test_db().await;
        let repo = ExecutionRepo::new(pool.as_ref().clone());
        for name in ["a", "b", "c"] {
            repo.create(&NewExecution {
                project: "p".to_string(),
                domain: "d".to_string(),
                name: name.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let poller = ClaimPoller::new(repo, &fast_config()).cluster(Some("w1".to_string()));
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handled = {
            let seen = seen.clone();
            let cancel_after = cancel.clone();
            poller
                .run(&cancel, move |execution| {
                    let seen = seen.clone();
                    let cancel_after = cancel_after.clone();
                    async move {
                        let mut seen = seen.lock().unwrap();
                        seen.push(execution.name.clone());
                        if seen.len() == 3 {
                            cancel_after.cancel();
                        }
                    }
                })
                .await
                .unwrap()
        };

        assert_eq!(handled, 3);
        let mut names = seen.lock().unwrap().clone();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
