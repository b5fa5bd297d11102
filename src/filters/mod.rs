//! List filters, joins, sorting and pagination
//!
//! Filters arrive either as typed values built in code or as expressions in
//! the filter language:
//!
//! ```text
//! eq(project, flytesnacks)+value_in(phase, QUEUED;RUNNING)+gte(created_at, 2024-01-01T00:00:00Z)
//! ```
//!
//! Fields may be qualified with `execution.`, `launch_plan.`, `workflow.` or
//! `task.`. Every field is checked against a per-entity whitelist and its
//! value converted to the column type before any SQL is rendered, so column
//! names in the generated query only ever come from the whitelist.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use pest::Parser;
use pest_derive::Parser;
use sqlx::{Postgres, QueryBuilder};

use crate::error::{StoreError, StoreResult};
use crate::types::ExecutionPhase;


/// Upper bound on a single page
pub const MAX_LIST_LIMIT: i64 = 1_000;

/* ===================== Entities & Fields ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entity {
    Execution,
    LaunchPlan,
    Workflow,
    Task,
}

impl Entity {
    pub fn table(&self) -> &'static str {
        match self {
            Entity::Execution => "executions",
            Entity::LaunchPlan => "launch_plans",
            Entity::Workflow => "workflows",
            Entity::Task => "tasks",
        }
    }

    /// Column on `executions` referencing this entity
    pub fn join_column(&self) -> Option<&'static str> {
        match self {
            Entity::Execution => None,
            Entity::LaunchPlan => Some("launch_plan_id"),
            Entity::Workflow => Some("workflow_id"),
            Entity::Task => Some("task_id"),
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "execution" => Some(Entity::Execution),
            "launch_plan" => Some(Entity::LaunchPlan),
            "workflow" => Some(Entity::Workflow),
            "task" => Some(Entity::Task),
            _ => None,
        }
    }

    fn fields(&self) -> &'static [(&'static str, FieldKind)] {
        match self {
            Entity::Execution => EXECUTION_FIELDS,
            Entity::LaunchPlan | Entity::Workflow | Entity::Task => RELATED_FIELDS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Timestamp,
    Phase,
}

const EXECUTION_FIELDS: &[(&str, FieldKind)] = &[
    ("id", FieldKind::Integer),
    ("project", FieldKind::Text),
    ("domain", FieldKind::Text),
    ("name", FieldKind::Text),
    ("phase", FieldKind::Phase),
    ("cluster", FieldKind::Text),
    ("launch_plan_id", FieldKind::Integer),
    ("workflow_id", FieldKind::Integer),
    ("task_id", FieldKind::Integer),
    ("source_execution_id", FieldKind::Integer),
    ("inputs_uri", FieldKind::Text),
    ("started_at", FieldKind::Timestamp),
    ("created_at", FieldKind::Timestamp),
    ("updated_at", FieldKind::Timestamp),
];

const RELATED_FIELDS: &[(&str, FieldKind)] = &[
    ("id", FieldKind::Integer),
    ("project", FieldKind::Text),
    ("domain", FieldKind::Text),
    ("name", FieldKind::Text),
    ("version", FieldKind::Text),
    ("created_at", FieldKind::Timestamp),
];

/// A whitelisted column on one of the listable entities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    pub entity: Entity,
    pub column: &'static str,
    pub kind: FieldKind,
}

impl FieldRef {
    pub fn resolve(entity: Entity, name: &str) -> StoreResult<Self> {
        entity
            .fields()
            .iter()
            .find(|(column, _)| *column == name)
            .map(|&(column, kind)| FieldRef {
                entity,
                column,
                kind,
            })
            .ok_or_else(|| {
                StoreError::invalid(format!(
                    "unknown field '{}' for {}",
                    name,
                    entity.table()
                ))
            })
    }

    /// Parse `field` or `entity.field`; unqualified names belong to `default`
    pub fn parse(qualified: &str, default: Entity) -> StoreResult<Self> {
        let qualified = qualified.trim();
        match qualified.split_once('.') {
            Some((prefix, name)) => {
                let entity = Entity::from_prefix(prefix).ok_or_else(|| {
                    StoreError::invalid(format!("unknown entity '{}' in field '{}'", prefix, qualified))
                })?;
                Self::resolve(entity, name)
            }
            None => Self::resolve(default, qualified),
        }
    }

    pub fn execution(name: &str) -> StoreResult<Self> {
        Self::resolve(Entity::Execution, name)
    }

    fn sql(&self) -> String {
        format!("{}.{}", self.entity.table(), self.column)
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity.table(), self.column)
    }
}

/* ===================== Predicates ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    ValueIn,
}

impl FilterOp {
    pub fn from_name(name: &str) -> StoreResult<Self> {
        match name {
            "eq" => Ok(FilterOp::Eq),
            "not_eq" => Ok(FilterOp::NotEq),
            "gt" => Ok(FilterOp::Gt),
            "gte" => Ok(FilterOp::Gte),
            "lt" => Ok(FilterOp::Lt),
            "lte" => Ok(FilterOp::Lte),
            "contains" => Ok(FilterOp::Contains),
            "value_in" => Ok(FilterOp::ValueIn),
            other => Err(StoreError::invalid(format!("unknown filter function '{}'", other))),
        }
    }

    fn comparison(&self) -> Option<&'static str> {
        match self {
            FilterOp::Eq => Some("="),
            FilterOp::NotEq => Some("<>"),
            FilterOp::Gt => Some(">"),
            FilterOp::Gte => Some(">="),
            FilterOp::Lt => Some("<"),
            FilterOp::Lte => Some("<="),
            FilterOp::Contains | FilterOp::ValueIn => None,
        }
    }

    fn is_range(&self) -> bool {
        matches!(self, FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte)
    }
}

/// A filter value already converted to its column type
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
    TextList(Vec<String>),
    IntegerList(Vec<i64>),
    TimestampList(Vec<DateTime<Utc>>),
}

fn parse_text(field: &FieldRef, raw: &str) -> StoreResult<String> {
    let raw = raw.trim();
    if field.kind == FieldKind::Phase {
        return raw
            .parse::<ExecutionPhase>()
            .map(|phase| phase.as_str().to_string())
            .map_err(StoreError::InvalidArgument);
    }
    Ok(raw.to_string())
}

fn parse_integer(field: &FieldRef, raw: &str) -> StoreResult<i64> {
    raw.trim().parse::<i64>().map_err(|_| {
        StoreError::invalid(format!("field {} expects an integer, got '{}'", field, raw))
    })
}

fn parse_timestamp(field: &FieldRef, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            StoreError::invalid(format!(
                "field {} expects an RFC 3339 timestamp, got '{}'",
                field, raw
            ))
        })
}

fn convert_scalar(field: &FieldRef, raw: &str) -> StoreResult<FilterValue> {
    match field.kind {
        FieldKind::Text | FieldKind::Phase => parse_text(field, raw).map(FilterValue::Text),
        FieldKind::Integer => parse_integer(field, raw).map(FilterValue::Integer),
        FieldKind::Timestamp => parse_timestamp(field, raw).map(FilterValue::Timestamp),
    }
}

fn convert_list(field: &FieldRef, raw: &[String]) -> StoreResult<FilterValue> {
    match field.kind {
        FieldKind::Text | FieldKind::Phase => raw
            .iter()
            .map(|v| parse_text(field, v))
            .collect::<StoreResult<Vec<_>>>()
            .map(FilterValue::TextList),
        FieldKind::Integer => raw
            .iter()
            .map(|v| parse_integer(field, v))
            .collect::<StoreResult<Vec<_>>>()
            .map(FilterValue::IntegerList),
        FieldKind::Timestamp => raw
            .iter()
            .map(|v| parse_timestamp(field, v))
            .collect::<StoreResult<Vec<_>>>()
            .map(FilterValue::TimestampList),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InlineFilter {
    pub field: FieldRef,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl InlineFilter {
    /// Build a filter from raw string values, validating arity and types
    pub fn new(field: FieldRef, op: FilterOp, raw_values: &[String]) -> StoreResult<Self> {
        if raw_values.is_empty() {
            return Err(StoreError::invalid(format!("filter on {} has no value", field)));
        }
        if op != FilterOp::ValueIn && raw_values.len() != 1 {
            return Err(StoreError::invalid(format!(
                "filter on {} takes a single value, got {}",
                field,
                raw_values.len()
            )));
        }
        if op == FilterOp::Contains && field.kind != FieldKind::Text {
            return Err(StoreError::invalid(format!(
                "contains is only supported on text fields, not {}",
                field
            )));
        }
        if op.is_range() && field.kind == FieldKind::Phase {
            return Err(StoreError::invalid(format!(
                "range comparison is not supported on {}",
                field
            )));
        }

        let value = if op == FilterOp::ValueIn {
            convert_list(&field, raw_values)?
        } else {
            convert_scalar(&field, &raw_values[0])?
        };

        Ok(Self { field, op, value })
    }

    pub fn eq(field: FieldRef, value: impl Into<String>) -> StoreResult<Self> {
        Self::new(field, FilterOp::Eq, &[value.into()])
    }

    fn push_sql(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        let column = self.field.sql();
        match self.op {
            FilterOp::Contains => {
                qb.push(format!("{} LIKE ", column));
                if let FilterValue::Text(text) = &self.value {
                    qb.push_bind(format!("%{}%", escape_like(text)));
                }
            }
            FilterOp::ValueIn => {
                qb.push(format!("{} = ANY(", column));
                match &self.value {
                    FilterValue::TextList(values) => qb.push_bind(values.clone()),
                    FilterValue::IntegerList(values) => qb.push_bind(values.clone()),
                    FilterValue::TimestampList(values) => qb.push_bind(values.clone()),
                    FilterValue::Text(value) => qb.push_bind(vec![value.clone()]),
                    FilterValue::Integer(value) => qb.push_bind(vec![*value]),
                    FilterValue::Timestamp(value) => qb.push_bind(vec![*value]),
                };
                qb.push(")");
            }
            _ => {
                let operator = self.op.comparison().unwrap_or("=");
                qb.push(format!("{} {} ", column, operator));
                push_scalar(qb, &self.value);
            }
        }
    }
}

fn push_scalar(qb: &mut QueryBuilder<'static, Postgres>, value: &FilterValue) {
    match value {
        FilterValue::Text(v) => qb.push_bind(v.clone()),
        FilterValue::Integer(v) => qb.push_bind(*v),
        FilterValue::Timestamp(v) => qb.push_bind(*v),
        FilterValue::TextList(v) => qb.push_bind(v.clone()),
        FilterValue::IntegerList(v) => qb.push_bind(v.clone()),
        FilterValue::TimestampList(v) => qb.push_bind(v.clone()),
    };
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/* ===================== Filter Expression Parser ===================== */

#[derive(Parser)]
#[grammar = "filters/filters.pest"]
struct FilterParser;

/// Parse a filter expression; unqualified fields refer to executions.
///
/// An empty or blank expression yields no filters.
pub fn parse_filters(expression: &str) -> StoreResult<Vec<InlineFilter>> {
    if expression.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut pairs = FilterParser::parse(Rule::expression, expression)
        .map_err(|e| StoreError::invalid(format!("malformed filter expression: {}", e)))?;
    let Some(root) = pairs.next() else {
        return Ok(Vec::new());
    };

    let mut filters = Vec::new();
    for pair in root.into_inner() {
        if pair.as_rule() != Rule::filter {
            continue;
        }
        let mut inner = pair.into_inner();
        let (Some(function), Some(field), Some(values)) = (inner.next(), inner.next(), inner.next())
        else {
            return Err(StoreError::invalid("incomplete filter"));
        };

        let op = FilterOp::from_name(function.as_str())?;
        let field = FieldRef::parse(field.as_str(), Entity::Execution)?;
        let raw: Vec<String> = values
            .into_inner()
            .map(|v| v.as_str().trim().to_string())
            .collect();

        filters.push(InlineFilter::new(field, op, &raw)?);
    }

    Ok(filters)
}

/* ===================== Sorting ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn parse(value: &str) -> StoreResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortDirection::Ascending),
            "desc" | "descending" => Ok(SortDirection::Descending),
            other => Err(StoreError::invalid(format!("unknown sort direction '{}'", other))),
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortParameter {
    pub field: FieldRef,
    pub direction: SortDirection,
}

impl SortParameter {
    pub fn new(field: FieldRef, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    /// Parse a sort key such as `created_at` or `launch_plan.name`
    pub fn parse(key: &str, direction: SortDirection) -> StoreResult<Self> {
        Ok(Self::new(FieldRef::parse(key, Entity::Execution)?, direction))
    }
}

/* ===================== List Input ===================== */

/// Everything needed to render one page of a list query
#[derive(Debug, Clone)]
pub struct ListInput {
    pub filters: Vec<InlineFilter>,
    pub joins: BTreeSet<Entity>,
    pub limit: i64,
    pub offset: i64,
    pub sort: Option<SortParameter>,
}

impl ListInput {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            filters: Vec::new(),
            joins: BTreeSet::new(),
            limit,
            offset,
            sort: None,
        }
    }

    pub fn filter(mut self, filter: InlineFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters(mut self, filters: impl IntoIterator<Item = InlineFilter>) -> Self {
        self.filters.extend(filters);
        self
    }

    /// Request an inner join even when no filter references the entity
    pub fn join(mut self, entity: Entity) -> Self {
        if entity != Entity::Execution {
            self.joins.insert(entity);
        }
        self
    }

    pub fn sort(mut self, sort: SortParameter) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Explicit joins plus every entity referenced by a filter or the sort key
    pub fn join_entities(&self) -> BTreeSet<Entity> {
        let mut joins = self.joins.clone();
        joins.extend(
            self.filters
                .iter()
                .map(|f| f.field.entity)
                .chain(self.sort.iter().map(|s| s.field.entity))
                .filter(|entity| *entity != Entity::Execution),
        );
        joins
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.limit <= 0 {
            return Err(StoreError::invalid(format!(
                "limit must be positive, got {}",
                self.limit
            )));
        }
        if self.limit > MAX_LIST_LIMIT {
            return Err(StoreError::invalid(format!(
                "limit {} exceeds maximum {}",
                self.limit, MAX_LIST_LIMIT
            )));
        }
        if self.offset < 0 {
            return Err(StoreError::invalid(format!(
                "offset must not be negative, got {}",
                self.offset
            )));
        }
        Ok(())
    }

    /// Render the list query. Live executions only, stable order.
    pub fn build_query(&self) -> StoreResult<QueryBuilder<'static, Postgres>> {
        self.validate()?;

        let mut qb = QueryBuilder::new("SELECT executions.* FROM executions");

        for entity in self.join_entities() {
            if let Some(column) = entity.join_column() {
                qb.push(format!(
                    " INNER JOIN {table} ON executions.{column} = {table}.id",
                    table = entity.table(),
                    column = column
                ));
            }
        }

        qb.push(" WHERE executions.deleted_at IS NULL");
        for filter in &self.filters {
            qb.push(" AND ");
            filter.push_sql(&mut qb);
        }

        qb.push(" ORDER BY ");
        match &self.sort {
            Some(sort) => {
                qb.push(format!("{} {}", sort.field.sql(), sort.direction.sql()));
                if !(sort.field.entity == Entity::Execution && sort.field.column == "id") {
                    qb.push(", executions.id ASC");
                }
            }
            None => {
                qb.push("executions.id ASC");
            }
        }

        qb.push(" LIMIT ");
        qb.push_bind(self.limit);
        qb.push(" OFFSET ");
        qb.push_bind(self.offset);

        Ok(qb)
    }
}
