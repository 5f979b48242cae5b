//! Ledger errors and their HTTP classification.

use keystone_sdk::{ApiError, ErrorKind};
use serde_json::json;
use thiserror::Error;

/// SQLite primary result codes that mean another connection holds the lock.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// One entry per offending field, formatted `field: problem`.
    #[error("invalid input: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("currency {0} already exists")]
    CurrencyExists(String),

    #[error("transaction {0} has already been rolled back")]
    AlreadyRolledBack(String),

    #[error("transaction {id} cannot be rolled back: {reason}")]
    NotReversible { id: String, reason: String },

    #[error("balance of user {user_id} in {currency_id} was modified concurrently")]
    ConcurrentModification { user_id: i64, currency_id: String },

    #[error("database is busy: {0}")]
    Busy(String),

    #[error("insufficient {currency_id} balance for user {user_id}: available {available}, required {required}")]
    Insufficient {
        user_id: i64,
        currency_id: String,
        available: i64,
        required: i64,
    },

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("{0}")]
    Internal(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    pub fn validation(field: &str, problem: impl std::fmt::Display) -> Self {
        Self::Validation(vec![format!("{field}: {problem}")])
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::CurrencyExists(_) | Self::AlreadyRolledBack(_) | Self::NotReversible { .. } => {
                ErrorKind::Conflict
            }
            Self::ConcurrentModification { .. } | Self::Busy(_) => ErrorKind::Concurrent,
            Self::Insufficient { .. } => ErrorKind::Insufficient,
            Self::Database(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Validation(fields) => Some(json!({ "fields": fields })),
            Self::Insufficient {
                available,
                required,
                ..
            } => Some(json!({ "available": available, "required": required })),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            if matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED)) {
                return Self::Busy(db.message().to_string());
            }
        }
        Self::Database(e)
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        let error = ApiError::new(e.kind(), e.to_string());
        match e.details() {
            Some(details) => error.with_details(details),
            None => error,
        }
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            LedgerError::validation("amount", "must not be zero").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            LedgerError::AlreadyRolledBack("t1".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(LedgerError::Busy("locked".into()).kind(), ErrorKind::Concurrent);
        assert!(
            LedgerError::ConcurrentModification {
                user_id: 7,
                currency_id: "coins".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn insufficient_exposes_amounts() {
        let api: ApiError = LedgerError::Insufficient {
            user_id: 7,
            currency_id: "coins".into(),
            available: 10,
            required: 11,
        }
        .into();
        assert_eq!(api.kind, ErrorKind::Insufficient);
        let details = api.details.unwrap();
        assert_eq!(details["available"], 10);
        assert_eq!(details["required"], 11);
    }
}
