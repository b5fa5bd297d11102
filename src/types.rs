use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// Lifecycle phase of an execution, stored as upper-case text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPhase {
    Undefined,
    Queued,
    Running,
    Succeeding,
    Succeeded,
    Failing,
    Failed,
    Aborted,
    TimedOut,
}

impl ExecutionPhase {
    pub const ALL: [ExecutionPhase; 9] = [
        ExecutionPhase::Undefined,
        ExecutionPhase::Queued,
        ExecutionPhase::Running,
        ExecutionPhase::Succeeding,
        ExecutionPhase::Succeeded,
        ExecutionPhase::Failing,
        ExecutionPhase::Failed,
        ExecutionPhase::Aborted,
        ExecutionPhase::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Undefined => "UNDEFINED",
            ExecutionPhase::Queued => "QUEUED",
            ExecutionPhase::Running => "RUNNING",
            ExecutionPhase::Succeeding => "SUCCEEDING",
            ExecutionPhase::Succeeded => "SUCCEEDED",
            ExecutionPhase::Failing => "FAILING",
            ExecutionPhase::Failed => "FAILED",
            ExecutionPhase::Aborted => "ABORTED",
            ExecutionPhase::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::Succeeded
                | ExecutionPhase::Failed
                | ExecutionPhase::Aborted
                | ExecutionPhase::TimedOut
        )
    }

    /// Progress rank. A transition to a lower rank is a regression.
    pub fn rank(&self) -> u8 {
        match self {
            ExecutionPhase::Undefined => 0,
            ExecutionPhase::Queued => 1,
            ExecutionPhase::Running => 2,
            ExecutionPhase::Succeeding | ExecutionPhase::Failing => 3,
            ExecutionPhase::Succeeded
            | ExecutionPhase::Failed
            | ExecutionPhase::Aborted
            | ExecutionPhase::TimedOut => 4,
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        ExecutionPhase::ALL
            .iter()
            .copied()
            .find(|phase| phase.as_str() == normalized)
            .ok_or_else(|| format!("unknown execution phase: {}", s))
    }
}

/// Logical key of an execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub project: String,
    pub domain: String,
    pub name: String,
}

impl ExecutionKey {
    pub fn new(
        project: impl Into<String>,
        domain: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            domain: domain.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.domain, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Execution {
    pub id: i64,
    pub project: String,
    pub domain: String,
    pub name: String,

    pub launch_plan_id: Option<i64>,
    pub workflow_id: Option<i64>,
    pub task_id: Option<i64>,

    pub phase: ExecutionPhase,
    pub cluster: Option<String>,

    /// Opaque payloads, never interpreted by the store
    pub spec: Vec<u8>,
    pub closure: Vec<u8>,

    pub inputs_uri: Option<String>,
    pub outputs_uri: Option<String>,
    pub abort_cause: Option<String>,
    pub source_execution_id: Option<i64>,

    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn key(&self) -> ExecutionKey {
        ExecutionKey::new(&self.project, &self.domain, &self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewExecution {
    pub project: String,
    pub domain: String,
    pub name: String,
    pub launch_plan_id: Option<i64>,
    pub workflow_id: Option<i64>,
    pub task_id: Option<i64>,
    pub spec: Vec<u8>,
    pub closure: Vec<u8>,
    pub inputs_uri: Option<String>,
    pub source_execution_id: Option<i64>,
}

impl NewExecution {
    pub fn key(&self) -> ExecutionKey {
        ExecutionKey::new(&self.project, &self.domain, &self.name)
    }
}

/// Field-level update keyed by execution id.
///
/// Only fields set to `Some` are written, so zero values can never clobber
/// stored data by accident. `updated_at` is always bumped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub id: i64,
    pub phase: Option<ExecutionPhase>,
    pub cluster: Option<String>,
    pub closure: Option<Vec<u8>>,
    pub outputs_uri: Option<String>,
    pub abort_cause: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ExecutionUpdate {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn phase(mut self, phase: ExecutionPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn closure(mut self, closure: Vec<u8>) -> Self {
        self.closure = Some(closure);
        self
    }

    pub fn outputs_uri(mut self, uri: impl Into<String>) -> Self {
        self.outputs_uri = Some(uri.into());
        self
    }

    pub fn abort_cause(mut self, cause: impl Into<String>) -> Self {
        self.abort_cause = Some(cause.into());
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.phase.is_none()
            && self.cluster.is_none()
            && self.closure.is_none()
            && self.outputs_uri.is_none()
            && self.abort_cause.is_none()
            && self.started_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutionEvent {
    pub id: i64,
    pub execution_id: i64,
    pub phase: ExecutionPhase,
    pub occurred_at: DateTime<Utc>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecutionEvent {
    pub execution_id: i64,
    pub phase: ExecutionPhase,
    pub occurred_at: DateTime<Utc>,
    pub metadata: JsonValue,
}

impl NewExecutionEvent {
    pub fn new(execution_id: i64, phase: ExecutionPhase) -> Self {
        Self {
            execution_id,
            phase,
            occurred_at: Utc::now(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of a claim attempt. An empty queue is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Execution),
    NoneEligible,
}

impl ClaimOutcome {
    pub fn into_execution(self) -> Option<Execution> {
        match self {
            ClaimOutcome::Claimed(execution) => Some(execution),
            ClaimOutcome::NoneEligible => None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trips_through_str() {
        for phase in ExecutionPhase::ALL {
            assert_eq!(phase.as_str().parse::<ExecutionPhase>().unwrap(), phase);
        }
        assert_eq!("queued".parse::<ExecutionPhase>().unwrap(), ExecutionPhase::Queued);
        assert_eq!(
            " timed_out ".parse::<ExecutionPhase>().unwrap(),
            ExecutionPhase::TimedOut
        );
        assert!("PAUSED".parse::<ExecutionPhase>().is_err());
    }

    #[test]
    fn test_phase_serde_matches_storage_text() {
        let json = serde_json::to_string(&ExecutionPhase::TimedOut).unwrap();
        assert_eq!(json, "\"TIMED_OUT\"");
    }

    #[test]
    fn test_terminal_phases_have_top_rank() {
        for phase in ExecutionPhase::ALL {
            assert_eq!(phase.is_terminal(), phase.rank() == 4, "{}", phase);
        }
        assert!(ExecutionPhase::Undefined.rank() < ExecutionPhase::Queued.rank());
        assert!(ExecutionPhase::Queued.rank() < ExecutionPhase::Running.rank());
        assert_eq!(
            ExecutionPhase::Succeeding.rank(),
            ExecutionPhase::Failing.rank()
        );
    }

    #[test]
    fn test_execution_update_only_tracks_set_fields() {
        let update = ExecutionUpdate::new(7);
        assert!(update.is_empty());

        let update = update.phase(ExecutionPhase::Running).cluster("c1");
        assert!(!update.is_empty());
        assert_eq!(update.id, 7);
        assert_eq!(update.phase, Some(ExecutionPhase::Running));
        assert_eq!(update.cluster.as_deref(), Some("c1"));
        assert!(update.outputs_uri.is_none());
    }

    #[test]
    fn test_key_display() {
        let key = ExecutionKey::new("p", "d", "n1");
        assert_eq!(key.to_string(), "p/d/n1");
    }
}
