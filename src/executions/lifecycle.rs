use sqlx::{Postgres, QueryBuilder};

use crate::error::{translate, StoreError, StoreResult};
use crate::metrics::{OperationTimer, StoreOperation};
use crate::types::{Execution, ExecutionEvent, ExecutionUpdate, NewExecutionEvent};

use super::{ExecutionRepo, ENTITY};

/// Append one event row
///
/// Generic over the executor so it can run on the pool or inside a caller's
/// transaction.
pub(crate) async fn insert_event<'e, E>(
    executor: E,
    event: &NewExecutionEvent,
) -> Result<ExecutionEvent, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, ExecutionEvent>(
        r#"
        INSERT INTO execution_events (execution_id, phase, occurred_at, metadata)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(event.execution_id)
    .bind(event.phase)
    .bind(event.occurred_at)
    .bind(&event.metadata)
    .fetch_optional(executor)
    .await?
    .ok_or(sqlx::Error::RowNotFound)
}

/// Render `UPDATE executions SET ... RETURNING *` for the fields that are set
fn build_update(update: &ExecutionUpdate) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("UPDATE executions SET updated_at = NOW()");

    if let Some(phase) = update.phase {
        qb.push(", phase = ").push_bind(phase);
    }
    if let Some(cluster) = &update.cluster {
        qb.push(", cluster = ").push_bind(cluster.clone());
    }
    if let Some(closure) = &update.closure {
        qb.push(", closure = ").push_bind(closure.clone());
    }
    if let Some(uri) = &update.outputs_uri {
        qb.push(", outputs_uri = ").push_bind(uri.clone());
    }
    if let Some(cause) = &update.abort_cause {
        qb.push(", abort_cause = ").push_bind(cause.clone());
    }
    if let Some(started_at) = update.started_at {
        qb.push(", started_at = COALESCE(started_at, ")
            .push_bind(started_at)
            .push(")");
    }

    qb.push(" WHERE id = ")
        .push_bind(update.id)
        .push(" AND deleted_at IS NULL RETURNING *");
    qb
}

impl ExecutionRepo {
    /// Append an event and apply a field-level update in one transaction
    ///
    /// Either both become visible or neither does. The event must belong to
    /// the execution being updated.
    pub async fn update(
        &self,
        event: &NewExecutionEvent,
        update: &ExecutionUpdate,
    ) -> StoreResult<Execution> {
        self.update_checked(event, update, |_| Ok(())).await
    }

    /// Like [`update`](Self::update), but `check` first inspects the row as
    /// locked inside the transaction
    ///
    /// An error from `check` rolls the transaction back and is returned
    /// unchanged, so no event is appended and no field is written.
    pub async fn update_checked<F>(
        &self,
        event: &NewExecutionEvent,
        update: &ExecutionUpdate,
        check: F,
    ) -> StoreResult<Execution>
    where
        F: FnOnce(&Execution) -> StoreResult<()>,
    {
        let timer = OperationTimer::start(StoreOperation::Update);
        let result = self.update_with_event(event, update, check).await;
        self.observe(timer, &result);
        result
    }

    async fn update_with_event<F>(
        &self,
        event: &NewExecutionEvent,
        update: &ExecutionUpdate,
        check: F,
    ) -> StoreResult<Execution>
    where
        F: FnOnce(&Execution) -> StoreResult<()>,
    {
        if event.execution_id != update.id {
            return Err(StoreError::invalid(format!(
                "event for execution {} cannot accompany update of execution {}",
                event.execution_id, update.id
            )));
        }

        let id = update.id;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| translate(e, ENTITY, id))?;

        let locked = sqlx::query_as::<_, Execution>(
            "SELECT * FROM executions WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| translate(e, ENTITY, id))?;

        let Some(current) = locked else {
            tx.rollback().await.map_err(|e| translate(e, ENTITY, id))?;
            return Err(StoreError::not_found(ENTITY, id));
        };

        if let Err(err) = check(&current) {
            tx.rollback().await.map_err(|e| translate(e, ENTITY, id))?;
            tracing::debug!(id, phase = %current.phase, error = %err, "Update rejected on locked row");
            return Err(err);
        }

        insert_event(&mut *tx, event)
            .await
            .map_err(|e| translate(e, "execution event", id))?;

        let updated = build_update(update)
            .build_query_as::<Execution>()
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| translate(e, ENTITY, id))?;

        let Some(execution) = updated else {
            tx.rollback().await.map_err(|e| translate(e, ENTITY, id))?;
            return Err(StoreError::internal(format!(
                "update of execution {} touched no rows after event append",
                id
            )));
        };

        tx.commit().await.map_err(|e| translate(e, ENTITY, id))?;

        tracing::debug!(id, phase = %execution.phase, "Updated execution with event");
        Ok(execution)
    }

    /// Apply a field-level update without recording an event
    pub async fn update_execution(&self, update: &ExecutionUpdate) -> StoreResult<Execution> {
        let timer = OperationTimer::start(StoreOperation::UpdateExecution);
        let id = update.id;
        let result = build_update(update)
            .build_query_as::<Execution>()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| translate(e, ENTITY, id))
            .and_then(|row| row.ok_or_else(|| StoreError::not_found(ENTITY, id)));
        self.observe(timer, &result);
        result
    }
}
