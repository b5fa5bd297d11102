//! Store error taxonomy and the translation from storage faults into it.
//!
//! Every store operation returns [`StoreError`]; raw `sqlx::Error` values never
//! cross the store boundary.

use std::fmt::Display;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal store error: {0}")]
    Internal(String),

    #[error("transient store error: {0}")]
    Transient(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl Display) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn already_exists(entity: &'static str, key: impl Display) -> Self {
        StoreError::AlreadyExists {
            entity,
            key: key.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        StoreError::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        StoreError::Internal(message.into())
    }

    /// Stable label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::AlreadyExists { .. } => "already_exists",
            StoreError::InvalidArgument(_) => "invalid_argument",
            StoreError::Internal(_) => "internal",
            StoreError::Transient(_) => "transient",
        }
    }

    /// Whether a caller may retry the same call with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Internal(_) | StoreError::Transient(_))
    }
}

/* ===================== SQLSTATE Classification ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    UniqueViolation,
    InvalidInput,
    Transient,
    Internal,
}

/// Classify a Postgres SQLSTATE code
pub fn classify_sqlstate(code: &str) -> ErrorClass {
    match code {
        "23505" => ErrorClass::UniqueViolation,
        // foreign key, not null, check
        "23503" | "23502" | "23514" => ErrorClass::InvalidInput,
        // serialization failure, deadlock, lock not available, statement timeout,
        // too many connections
        "40001" | "40P01" | "55P03" | "57014" | "53300" => ErrorClass::Transient,
        _ if code.starts_with("22") => ErrorClass::InvalidInput,
        _ if code.starts_with("08") => ErrorClass::Transient,
        _ => ErrorClass::Internal,
    }
}

/* ===================== Translation ===================== */

/// Translate a storage fault for `entity` identified by `key`
pub fn translate(err: sqlx::Error, entity: &'static str, key: impl Display) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::not_found(entity, key),
        sqlx::Error::PoolTimedOut => StoreError::Transient("connection pool timed out".to_string()),
        sqlx::Error::Io(io) => StoreError::Transient(format!("database I/O error: {}", io)),
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            match classify_sqlstate(&code) {
                ErrorClass::UniqueViolation => StoreError::already_exists(entity, key),
                ErrorClass::InvalidInput => StoreError::InvalidArgument(format!(
                    "{} {}: {}",
                    entity,
                    key,
                    db_err.message()
                )),
                ErrorClass::Transient => {
                    StoreError::Transient(format!("{} [{}]", db_err.message(), code))
                }
                ErrorClass::Internal => {
                    StoreError::Internal(format!("{} [{}]", db_err.message(), code))
                }
            }
        }
        other => StoreError::Internal(other.to_string()),
    }
}

/// Translate a fault that is not tied to a single keyed entity
pub fn translate_unkeyed(err: sqlx::Error, entity: &'static str) -> StoreError {
    translate(err, entity, "<unkeyed>")
}
