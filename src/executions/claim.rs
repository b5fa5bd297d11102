use serde_json::json;

use crate::error::{translate, translate_unkeyed, StoreResult};
use crate::metrics::{OperationOutcome, OperationTimer, StoreOperation};
use crate::types::{ClaimOutcome, Execution, ExecutionPhase, NewExecutionEvent};

use super::{insert_event, ExecutionRepo, ENTITY};

impl ExecutionRepo {
    /// Claim the next eligible execution for a worker
    ///
    /// Eligible executions are UNDEFINED ones and QUEUED ones whose owner has
    /// not touched them within the staleness threshold. Rows locked by a
    /// concurrent claimant are skipped rather than waited on, so each
    /// execution is handed to exactly one caller. The claimed row is flipped
    /// to QUEUED, stamped with the caller's cluster and paired with a QUEUED
    /// event in the same transaction.
    ///
    /// Returns `ClaimOutcome::NoneEligible` when nothing can be claimed. If
    /// the returned future is dropped before it completes, the transaction is
    /// rolled back and nothing is claimed.
    pub async fn retrieve_and_lock(&self, worker: Option<&str>) -> StoreResult<ClaimOutcome> {
        let timer = OperationTimer::start(StoreOperation::RetrieveAndLock);
        let result = self.claim_next(worker).await;
        let outcome = match &result {
            Ok(ClaimOutcome::NoneEligible) => OperationOutcome::Empty,
            other => OperationOutcome::from_result(other),
        };
        timer.finish(self.metrics.as_ref(), outcome);
        result
    }

    fn resolve_cluster(&self, worker: Option<&str>) -> String {
        worker
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .unwrap_or(self.default_cluster.as_str())
            .to_string()
    }

    async fn claim_next(&self, worker: Option<&str>) -> StoreResult<ClaimOutcome> {
        let cluster = self.resolve_cluster(worker);
        let stale_secs = i64::try_from(self.stale_after.as_secs()).unwrap_or(i64::MAX);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| translate_unkeyed(e, ENTITY))?;

        let candidate: Option<(i64, ExecutionPhase)> = sqlx::query_as(
            r#"
            SELECT id, phase FROM executions
            WHERE deleted_at IS NULL
              AND (
                phase = 'UNDEFINED'
                OR (phase = 'QUEUED'
                    AND updated_at < NOW() - ($1::bigint * INTERVAL '1 second'))
              )
            ORDER BY updated_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(stale_secs)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| translate_unkeyed(e, ENTITY))?;

        let Some((id, previous_phase)) = candidate else {
            tx.rollback()
                .await
                .map_err(|e| translate_unkeyed(e, ENTITY))?;
            tracing::debug!(cluster = %cluster, "No eligible execution to claim");
            return Ok(ClaimOutcome::NoneEligible);
        };

        let execution = sqlx::query_as::<_, Execution>(
            r#"
            UPDATE executions
            SET phase = $2,
                cluster = $3,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(ExecutionPhase::Queued)
        .bind(&cluster)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| translate(e, ENTITY, id))?;

        let reclaimed = previous_phase == ExecutionPhase::Queued;
        let event = NewExecutionEvent::new(id, ExecutionPhase::Queued)
            .with_metadata(json!({ "cluster": cluster, "reclaimed": reclaimed }));
        insert_event(&mut *tx, &event)
            .await
            .map_err(|e| translate(e, "execution event", id))?;

        tx.commit().await.map_err(|e| translate(e, ENTITY, id))?;

        tracing::info!(
            id,
            key = %execution.key(),
            cluster = %cluster,
            reclaimed,
            "Claimed execution"
        );

        Ok(ClaimOutcome::Claimed(execution))
    }
}
