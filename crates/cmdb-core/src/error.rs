use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single per-field problem reported by the schema validator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Top-level error taxonomy for the CMDB.
#[derive(Error, Debug)]
pub enum CmdbError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {}", join_errors(.0))]
    ValidationFailed(Vec<ValidationError>),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CmdbError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the caller can act on this error (bad input, missing entity,
    /// conflicting state) as opposed to a failure inside the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::ValidationFailed(_)
                | Self::Conflict(_)
                | Self::InvalidReference(_)
                | Self::Unauthorized(_)
                | Self::Forbidden(_)
        )
    }

    /// Validation errors carried by this error, if any.
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            Self::ValidationFailed(errors) => errors,
            _ => &[],
        }
    }
}

impl From<config::ConfigError> for CmdbError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for CmdbError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() || db.is_check_violation() => {
                Self::InvalidReference(db.message().to_string())
            }
            other => Self::Internal(format!("database error: {other}")),
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::migrate::MigrateError> for CmdbError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Internal(format!("migration failed: {e}"))
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, CmdbError>;
