use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::executions::ExecutionRepo;
use crate::filters::{
    parse_filters, FieldRef, InlineFilter, ListInput, SortDirection, SortParameter,
};
use crate::types::{
    ClaimOutcome, Execution, ExecutionKey, ExecutionPhase, ExecutionUpdate, NewExecution,
    NewExecutionEvent,
};

const GENERATED_NAME_LEN: usize = 20;

/// Request to launch a new execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionCreateRequest {
    pub project: String,
    pub domain: String,
    /// Generated when absent
    pub name: Option<String>,
    pub launch_plan_id: Option<i64>,
    pub workflow_id: Option<i64>,
    pub task_id: Option<i64>,
    pub spec: Vec<u8>,
    pub inputs_uri: Option<String>,
}

/// Pointers to the large payloads of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionData {
    pub inputs_uri: Option<String>,
    pub outputs_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionListRequest {
    pub project: String,
    pub domain: String,
    /// Filter expression, e.g. `eq(phase, RUNNING)+contains(name, nightly)`
    pub filters: String,
    pub limit: i64,
    /// Opaque continuation token returned by the previous page
    pub token: String,
    pub sort_by: Option<String>,
    pub descending: bool,
}

impl Default for ExecutionListRequest {
    fn default() -> Self {
        Self {
            project: String::new(),
            domain: String::new(),
            filters: String::new(),
            limit: 100,
            token: String::new(),
            sort_by: None,
            descending: false,
        }
    }
}

/// One page of executions; `token` is empty once the listing is exhausted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionList {
    pub executions: Vec<Execution>,
    pub token: String,
}

/// Phase transition reported by the component driving an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEventRequest {
    pub key: ExecutionKey,
    pub phase: ExecutionPhase,
    pub occurred_at: Option<DateTime<Utc>>,
    pub metadata: Option<JsonValue>,
    pub outputs_uri: Option<String>,
}

/// Execution operations exposed to callers
#[derive(Clone)]
pub struct ExecutionService {
    repo: ExecutionRepo,
}

impl ExecutionService {
    pub fn new(repo: ExecutionRepo) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &ExecutionRepo {
        &self.repo
    }

    pub async fn create_execution(&self, request: ExecutionCreateRequest) -> StoreResult<ExecutionKey> {
        require("project", &request.project)?;
        require("domain", &request.domain)?;
        let name = match request.name {
            Some(name) => {
                require("name", &name)?;
                name
            }
            None => generate_name(),
        };

        let execution = self
            .repo
            .create(&NewExecution {
                project: request.project,
                domain: request.domain,
                name,
                launch_plan_id: request.launch_plan_id,
                workflow_id: request.workflow_id,
                task_id: request.task_id,
                spec: request.spec,
                closure: Vec::new(),
                inputs_uri: request.inputs_uri,
                source_execution_id: None,
            })
            .await?;

        tracing::info!(key = %execution.key(), id = execution.id, "Execution created");
        Ok(execution.key())
    }

    /// Launch a copy of an existing execution under a new name
    pub async fn relaunch_execution(
        &self,
        source: &ExecutionKey,
        name: Option<String>,
    ) -> StoreResult<ExecutionKey> {
        let original = self.repo.get(source).await?;
        let name = match name {
            Some(name) => {
                require("name", &name)?;
                name
            }
            None => generate_name(),
        };

        let execution = self
            .repo
            .create(&NewExecution {
                project: original.project,
                domain: original.domain,
                name,
                launch_plan_id: original.launch_plan_id,
                workflow_id: original.workflow_id,
                task_id: original.task_id,
                spec: original.spec,
                closure: Vec::new(),
                inputs_uri: original.inputs_uri,
                source_execution_id: Some(original.id),
            })
            .await?;

        tracing::info!(
            key = %execution.key(),
            source = %source,
            "Execution relaunched"
        );
        Ok(execution.key())
    }

    pub async fn get_execution(&self, key: &ExecutionKey) -> StoreResult<Execution> {
        self.repo.get(key).await
    }

    pub async fn get_execution_data(&self, key: &ExecutionKey) -> StoreResult<ExecutionData> {
        let execution = self.repo.get(key).await?;
        Ok(ExecutionData {
            inputs_uri: execution.inputs_uri,
            outputs_uri: execution.outputs_uri,
        })
    }

    pub async fn list_executions(&self, request: ExecutionListRequest) -> StoreResult<ExecutionList> {
        require("project", &request.project)?;
        require("domain", &request.domain)?;
        let offset = parse_token(&request.token)?;

        let mut input = ListInput::new(request.limit, offset)
            .filter(InlineFilter::eq(FieldRef::execution("project")?, request.project)?)
            .filter(InlineFilter::eq(FieldRef::execution("domain")?, request.domain)?)
            .filters(parse_filters(&request.filters)?);

        if let Some(sort_by) = request.sort_by.as_deref() {
            let direction = if request.descending {
                SortDirection::Descending
            } else {
                SortDirection::Ascending
            };
            input = input.sort(SortParameter::parse(sort_by, direction)?);
        }

        let executions = self.repo.list(&input).await?;
        let token = next_token(offset, request.limit, executions.len());
        Ok(ExecutionList { executions, token })
    }

    /// Abort a non-terminal execution
    ///
    /// The phase is checked again on the locked row, so a terminal phase
    /// committed concurrently is never overwritten.
    pub async fn terminate_execution(&self, key: &ExecutionKey, cause: &str) -> StoreResult<Execution> {
        require("cause", cause)?;
        let execution = self.repo.get(key).await?;
        require_live(key, execution.phase)?;

        let event = NewExecutionEvent::new(execution.id, ExecutionPhase::Aborted)
            .with_metadata(json!({ "cause": cause }));
        let update = ExecutionUpdate::new(execution.id)
            .phase(ExecutionPhase::Aborted)
            .abort_cause(cause);
        let terminated = self
            .repo
            .update_checked(&event, &update, |locked| require_live(key, locked.phase))
            .await?;

        tracing::info!(key = %key, cause, "Execution terminated");
        Ok(terminated)
    }

    /// Record a phase transition reported for an execution
    pub async fn record_execution_event(&self, request: ExecutionEventRequest) -> StoreResult<Execution> {
        let execution = self.repo.get(&request.key).await?;
        validate_transition(&request.key, execution.phase, request.phase)?;

        let occurred_at = request.occurred_at.unwrap_or_else(Utc::now);
        let mut event = NewExecutionEvent::new(execution.id, request.phase);
        event.occurred_at = occurred_at;
        if let Some(metadata) = request.metadata {
            event = event.with_metadata(metadata);
        }

        let mut update = ExecutionUpdate::new(execution.id).phase(request.phase);
        if request.phase == ExecutionPhase::Running {
            update = update.started_at(occurred_at);
        }
        if let Some(uri) = request.outputs_uri {
            update = update.outputs_uri(uri);
        }

        let key = &request.key;
        let next = request.phase;
        let updated = self
            .repo
            .update_checked(&event, &update, |locked| {
                validate_transition(key, locked.phase, next)
            })
            .await?;
        tracing::debug!(
            key = %request.key,
            from = %execution.phase,
            to = %updated.phase,
            "Recorded execution event"
        );
        Ok(updated)
    }

    pub async fn retrieve_and_lock_execution(&self, cluster: Option<String>) -> StoreResult<ClaimOutcome> {
        self.repo.retrieve_and_lock(cluster.as_deref()).await
    }
}

fn require(field: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::invalid(format!("{} is required", field)));
    }
    Ok(())
}

fn require_live(key: &ExecutionKey, phase: ExecutionPhase) -> StoreResult<()> {
    if phase.is_terminal() {
        return Err(StoreError::invalid(format!(
            "execution {} already in terminal phase {}",
            key, phase
        )));
    }
    Ok(())
}

/// Random execution name: a lowercase letter followed by hex digits
pub(crate) fn generate_name() -> String {
    let id = Uuid::new_v4();
    let letter = (b'a' + id.as_bytes()[0] % 26) as char;
    let hex = id.simple().to_string();
    let mut name = String::with_capacity(GENERATED_NAME_LEN);
    name.push(letter);
    name.push_str(&hex[..GENERATED_NAME_LEN - 1]);
    name
}

pub(crate) fn parse_token(token: &str) -> StoreResult<i64> {
    let token = token.trim();
    if token.is_empty() {
        return Ok(0);
    }
    match token.parse::<i64>() {
        Ok(offset) if offset >= 0 => Ok(offset),
        _ => Err(StoreError::invalid(format!("invalid pagination token '{}'", token))),
    }
}

/// Token for the page after this one; empty when the page came back short
pub(crate) fn next_token(offset: i64, limit: i64, returned: usize) -> String {
    let returned = returned as i64;
    if returned < limit {
        String::new()
    } else {
        (offset + returned).to_string()
    }
}

/// Reject events on terminal executions, repeats of the current phase and
/// regressions in progress rank
pub(crate) fn validate_transition(
    key: &ExecutionKey,
    current: ExecutionPhase,
    next: ExecutionPhase,
) -> StoreResult<()> {
    require_live(key, current)?;
    if current == next {
        return Err(StoreError::already_exists(
            "execution event",
            format!("{} in phase {}", key, next),
        ));
    }
    if next.rank() < current.rank() {
        return Err(StoreError::invalid(format!(
            "execution {} cannot move from {} back to {}",
            key, current, next
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_helpers::with_test_db;

    fn key() -> ExecutionKey {
        ExecutionKey::new("p", "d", "n1")
    }

    #[test]
    fn test_generated_name_shape() {
        for _ in 0..50 {
            let name = generate_name();
            assert_eq!(name.len(), GENERATED_NAME_LEN);
            assert!(name.chars().next().unwrap().is_ascii_lowercase());
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
        assert_ne!(generate_name(), generate_name());
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(parse_token("").unwrap(), 0);
        assert_eq!(parse_token(" 40 ").unwrap(), 40);
        assert!(matches!(parse_token("-1"), Err(StoreError::InvalidArgument(_))));
        assert!(matches!(parse_token("next"), Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_next_token() {
        assert_eq!(next_token(0, 10, 10), "10");
        assert_eq!(next_token(10, 10, 3), "");
        assert_eq!(next_token(20, 10, 0), "");
    }

    #[test]
    fn test_transition_rules() {
        use ExecutionPhase::*;

        assert!(validate_transition(&key(), Undefined, Running).is_ok());
        assert!(validate_transition(&key(), Queued, Running).is_ok());
        assert!(validate_transition(&key(), Running, Succeeding).is_ok());
        assert!(validate_transition(&key(), Succeeding, Failing).is_ok());
        assert!(validate_transition(&key(), Running, Aborted).is_ok());

        assert!(matches!(
            validate_transition(&key(), Running, Running),
            Err(StoreError::AlreadyExists { .. })
        ));
        assert!(matches!(
            validate_transition(&key(), Running, Queued),
            Err(StoreError::InvalidArgument(_))
        ));
        for terminal in [Succeeded, Failed, Aborted, TimedOut] {
            assert!(matches!(
                validate_transition(&key(), terminal, Running),
                Err(StoreError::InvalidArgument(_))
            ));
        }
    }

    async fn service() -> (crate::db::test_helpers::TestPool, ExecutionService) {
        let pool = with_test_db().await;
        let service = ExecutionService::new(ExecutionRepo::new(pool.as_ref().clone()));
        (pool, service)
    }

    fn create_request(name: Option<&str>) -> ExecutionCreateRequest {
        ExecutionCreateRequest {
            project: "p".to_string(),
            domain: "d".to_string(),
            name: name.map(str::to_string),
            spec: b"spec".to_vec(),
            inputs_uri: Some("s3://bucket/inputs.pb".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_create_requires_project_and_generates_name() {
        let (_pool, service) = service().await;

        let mut missing = create_request(None);
        missing.project = String::new();
        assert!(matches!(
            service.create_execution(missing).await,
            Err(StoreError::InvalidArgument(_))
        ));

        let key = service.create_execution(create_request(None)).await.unwrap();
        assert_eq!(key.name.len(), GENERATED_NAME_LEN);
        assert_eq!(service.get_execution(&key).await.unwrap().key(), key);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_event_lifecycle() {
        let (_pool, service) = service().await;
        let key = service.create_execution(create_request(Some("n1"))).await.unwrap();

        let running = service
            .record_execution_event(ExecutionEventRequest {
                key: key.clone(),
                phase: ExecutionPhase::Running,
                occurred_at: None,
                metadata: None,
                outputs_uri: None,
            })
            .await
            .unwrap();
        assert_eq!(running.phase, ExecutionPhase::Running);
        assert!(running.started_at.is_some());

        let duplicate = service
            .record_execution_event(ExecutionEventRequest {
                key: key.clone(),
                phase: ExecutionPhase::Running,
                occurred_at: None,
                metadata: None,
                outputs_uri: None,
            })
            .await;
        assert!(matches!(duplicate, Err(StoreError::AlreadyExists { .. })));

        let done = service
            .record_execution_event(ExecutionEventRequest {
                key: key.clone(),
                phase: ExecutionPhase::Succeeded,
                occurred_at: None,
                metadata: Some(json!({ "note": "done" })),
                outputs_uri: Some("s3://bucket/outputs.pb".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(done.started_at, running.started_at);

        let data = service.get_execution_data(&key).await.unwrap();
        assert_eq!(data.outputs_uri.as_deref(), Some("s3://bucket/outputs.pb"));

        assert!(matches!(
            service.terminate_execution(&key, "too late").await,
            Err(StoreError::InvalidArgument(_))
        ));
        assert_eq!(service.repo().list_events(done.id).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_terminate_and_relaunch() {
        let (_pool, service) = service().await;
        let key = service.create_execution(create_request(Some("n1"))).await.unwrap();

        let aborted = service.terminate_execution(&key, "user requested").await.unwrap();
        assert_eq!(aborted.phase, ExecutionPhase::Aborted);
        assert_eq!(aborted.abort_cause.as_deref(), Some("user requested"));

        let relaunched = service
            .relaunch_execution(&key, Some("n1-retry".to_string()))
            .await
            .unwrap();
        let copy = service.get_execution(&relaunched).await.unwrap();
        assert_eq!(copy.source_execution_id, Some(aborted.id));
        assert_eq!(copy.spec, b"spec".to_vec());
        assert_eq!(copy.inputs_uri.as_deref(), Some("s3://bucket/inputs.pb"));
        assert_eq!(copy.phase, ExecutionPhase::Undefined);
    }

    /// Lock the row from a second transaction so a service call blocks on it
    async fn hold_row_lock(pool: &sqlx::PgPool, id: i64) -> sqlx::Transaction<'static, sqlx::Postgres> {
        let mut holder = pool.begin().await.unwrap();
        sqlx::query("SELECT id FROM executions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .execute(&mut *holder)
            .await
            .unwrap();
        holder
    }

    async fn commit_phase(mut holder: sqlx::Transaction<'static, sqlx::Postgres>, id: i64, phase: ExecutionPhase) {
        sqlx::query("UPDATE executions SET phase = $1 WHERE id = $2")
            .bind(phase)
            .bind(id)
            .execute(&mut *holder)
            .await
            .unwrap();
        holder.commit().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_terminate_does_not_overwrite_concurrent_terminal_phase() {
        let (pool, service) = service().await;
        let key = service.create_execution(create_request(Some("n1"))).await.unwrap();
        let id = service.get_execution(&key).await.unwrap().id;

        let holder = hold_row_lock(&pool, id).await;
        let terminate = tokio::spawn({
            let service = service.clone();
            let key = key.clone();
            async move { service.terminate_execution(&key, "user requested").await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(!terminate.is_finished(), "terminate should wait for the row lock");

        commit_phase(holder, id, ExecutionPhase::Succeeded).await;

        let result = terminate.await.unwrap();
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));

        let after = service.get_execution(&key).await.unwrap();
        assert_eq!(after.phase, ExecutionPhase::Succeeded);
        assert!(after.abort_cause.is_none());
        assert!(service.repo().list_events(id).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_event_rechecks_phase_under_row_lock() {
        let (pool, service) = service().await;
        let key = service.create_execution(create_request(Some("n1"))).await.unwrap();
        let id = service.get_execution(&key).await.unwrap().id;

        let holder = hold_row_lock(&pool, id).await;
        let report = tokio::spawn({
            let service = service.clone();
            let key = key.clone();
            async move {
                service
                    .record_execution_event(ExecutionEventRequest {
                        key,
                        phase: ExecutionPhase::Running,
                        occurred_at: None,
                        metadata: None,
                        outputs_uri: None,
                    })
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(!report.is_finished(), "event should wait for the row lock");

        commit_phase(holder, id, ExecutionPhase::Failed).await;

        let result = report.await.unwrap();
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));

        let after = service.get_execution(&key).await.unwrap();
        assert_eq!(after.phase, ExecutionPhase::Failed);
        assert!(after.started_at.is_none());
        assert!(service.repo().list_events(id).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_list_pages_with_token() {
        let (_pool, service) = service().await;
        for i in 0..3 {
            service
                .create_execution(create_request(Some(&format!("n{}", i))))
                .await
                .unwrap();
        }

        let request = ExecutionListRequest {
            project: "p".to_string(),
            domain: "d".to_string(),
            limit: 2,
            ..Default::default()
        };
        let first = service.list_executions(request.clone()).await.unwrap();
        assert_eq!(first.executions.len(), 2);
        assert_eq!(first.token, "2");

        let second = service
            .list_executions(ExecutionListRequest {
                token: first.token,
                ..request
            })
            .await
            .unwrap();
        assert_eq!(second.executions.len(), 1);
        assert!(second.token.is_empty());
    }
}
