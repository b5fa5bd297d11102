use crate::error::{translate, translate_unkeyed, StoreError, StoreResult};
use crate::filters::ListInput;
use crate::metrics::{OperationTimer, StoreOperation};
use crate::types::{Execution, ExecutionEvent, ExecutionKey};

use super::{ExecutionRepo, ENTITY};

impl ExecutionRepo {
    /// Get a live execution by its logical key
    pub async fn get(&self, key: &ExecutionKey) -> StoreResult<Execution> {
        let timer = OperationTimer::start(StoreOperation::Get);
        let result = self.fetch_by_key(key).await;
        self.observe(timer, &result);
        result
    }

    async fn fetch_by_key(&self, key: &ExecutionKey) -> StoreResult<Execution> {
        sqlx::query_as::<_, Execution>(
            r#"
            SELECT * FROM executions
            WHERE project = $1 AND domain = $2 AND name = $3
              AND deleted_at IS NULL
            "#,
        )
        .bind(&key.project)
        .bind(&key.domain)
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| translate(e, ENTITY, key))?
        .ok_or_else(|| StoreError::not_found(ENTITY, key))
    }

    /// Get a live execution by surrogate id
    pub async fn get_by_id(&self, id: i64) -> StoreResult<Execution> {
        let timer = OperationTimer::start(StoreOperation::GetById);
        let result = self.fetch_by_id(id).await;
        self.observe(timer, &result);
        result
    }

    async fn fetch_by_id(&self, id: i64) -> StoreResult<Execution> {
        sqlx::query_as::<_, Execution>(
            "SELECT * FROM executions WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| translate(e, ENTITY, id))?
        .ok_or_else(|| StoreError::not_found(ENTITY, id))
    }

    /// List one page of live executions
    pub async fn list(&self, input: &ListInput) -> StoreResult<Vec<Execution>> {
        let timer = OperationTimer::start(StoreOperation::List);
        let result = self.fetch_page(input).await;
        self.observe(timer, &result);
        result
    }

    async fn fetch_page(&self, input: &ListInput) -> StoreResult<Vec<Execution>> {
        let mut query = input.build_query()?;
        let executions = query
            .build_query_as::<Execution>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| translate_unkeyed(e, ENTITY))?;
        Ok(executions)
    }

    /// Events of one execution in append order
    pub async fn list_events(&self, execution_id: i64) -> StoreResult<Vec<ExecutionEvent>> {
        let timer = OperationTimer::start(StoreOperation::ListEvents);
        let result = sqlx::query_as::<_, ExecutionEvent>(
            r#"
            SELECT * FROM execution_events
            WHERE execution_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| translate(e, "execution event", execution_id));
        self.observe(timer, &result);
        result
    }
}
