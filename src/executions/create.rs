use crate::error::{translate, StoreError, StoreResult};
use crate::metrics::{OperationTimer, StoreOperation};
use crate::types::{Execution, ExecutionKey, ExecutionPhase, NewExecution};

use super::{ExecutionRepo, ENTITY};

impl ExecutionRepo {
    /// Insert a new execution in phase UNDEFINED
    ///
    /// Fails with `AlreadyExists` when a live execution already holds the key.
    pub async fn create(&self, new: &NewExecution) -> StoreResult<Execution> {
        let timer = OperationTimer::start(StoreOperation::Create);
        let result = self.insert_execution(new).await;
        self.observe(timer, &result);
        result
    }

    async fn insert_execution(&self, new: &NewExecution) -> StoreResult<Execution> {
        let key = new.key();
        validate_key(&key)?;

        let execution = sqlx::query_as::<_, Execution>(
            r#"
            INSERT INTO executions (
                project, domain, name,
                launch_plan_id, workflow_id, task_id,
                phase, spec, closure, inputs_uri, source_execution_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(&new.project)
        .bind(&new.domain)
        .bind(&new.name)
        .bind(new.launch_plan_id)
        .bind(new.workflow_id)
        .bind(new.task_id)
        .bind(ExecutionPhase::Undefined)
        .bind(&new.spec)
        .bind(&new.closure)
        .bind(&new.inputs_uri)
        .bind(new.source_execution_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| translate(e, ENTITY, &key))?;

        tracing::debug!(id = execution.id, key = %key, "Created execution");
        Ok(execution)
    }
}

pub(crate) fn validate_key(key: &ExecutionKey) -> StoreResult<()> {
    for (field, value) in [
        ("project", &key.project),
        ("domain", &key.domain),
        ("name", &key.name),
    ] {
        if value.trim().is_empty() {
            return Err(StoreError::invalid(format!("{} must not be empty", field)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key(&ExecutionKey::new("p", "d", "n")).is_ok());

        let err = validate_key(&ExecutionKey::new("p", " ", "n")).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument: domain must not be empty");
        assert!(validate_key(&ExecutionKey::new("", "d", "n")).is_err());
        assert!(validate_key(&ExecutionKey::new("p", "d", "")).is_err());
    }
}
