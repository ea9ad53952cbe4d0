//! Error handling for the stock ledger
//!
//! Every failed operation returns one of these. The facade may wrap an error
//! in [`AppError::Context`] but never changes its kind.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use shared::{InvalidTransition, Rule, ValidationReport, Violation};
use thiserror::Error;
use uuid::Uuid;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed or rule-violating input; carries every violated rule
    #[error("Validation failed: {}", join(violations))]
    Validation { violations: Vec<Violation> },

    /// Referenced entity missing or owned by another tenant
    #[error("Conflict: {}", join(violations))]
    Conflict { violations: Vec<Violation> },

    #[error("Insufficient stock: requested {requested}, available {available}, short by {shortfall}")]
    InsufficientStock {
        requested: Decimal,
        available: Decimal,
        shortfall: Decimal,
    },

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Lock or version contention; the whole operation can be retried
    #[error("Concurrency conflict: {0}")]
    Concurrency(String),

    /// Durability or transport failure; nothing was partially applied
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{operation} of sku {sku_id} at location {location_id}: {source}")]
    Context {
        operation: &'static str,
        sku_id: Uuid,
        location_id: Uuid,
        #[source]
        source: Box<AppError>,
    },
}

/// Error kinds, independent of any added context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    InsufficientStock,
    InvalidStateTransition,
    Concurrency,
    Storage,
    Configuration,
    Internal,
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AppError {
    /// Turn a non-empty report into the matching error kind
    pub fn from_report(report: ValidationReport) -> Self {
        if report.has_reference_violation() {
            AppError::Conflict {
                violations: report.into_violations(),
            }
        } else {
            AppError::Validation {
                violations: report.into_violations(),
            }
        }
    }

    /// Attach the failing operation and stock scope
    pub fn context(self, operation: &'static str, sku_id: Uuid, location_id: Uuid) -> Self {
        match self {
            AppError::Context { .. } => self,
            other => AppError::Context {
                operation,
                sku_id,
                location_id,
                source: Box::new(other),
            },
        }
    }

    /// The error underneath any context wrappers
    pub fn root(&self) -> &AppError {
        match self {
            AppError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            AppError::Validation { .. } => ErrorKind::Validation,
            AppError::Conflict { .. } => ErrorKind::Conflict,
            AppError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            AppError::InvalidStateTransition(_) => ErrorKind::InvalidStateTransition,
            AppError::Concurrency(_) => ErrorKind::Concurrency,
            AppError::Storage(_) => ErrorKind::Storage,
            AppError::Configuration(_) => ErrorKind::Configuration,
            AppError::Internal(_) | AppError::Context { .. } => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Concurrency | ErrorKind::Storage)
    }

    pub fn violations(&self) -> &[Violation] {
        match self.root() {
            AppError::Validation { violations } | AppError::Conflict { violations } => violations,
            _ => &[],
        }
    }

    pub fn shortfall(&self) -> Option<Decimal> {
        match self.root() {
            AppError::InsufficientStock { shortfall, .. } => Some(*shortfall),
            _ => None,
        }
    }
}

impl From<InvalidTransition> for AppError {
    fn from(err: InvalidTransition) -> Self {
        AppError::InvalidStateTransition(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code();
                database_error(code.as_deref(), db_err.constraint(), db_err.message())
                    .unwrap_or_else(|| AppError::Storage(err.to_string()))
            }
            sqlx::Error::PoolTimedOut => {
                AppError::Storage("timed out acquiring a database connection".to_string())
            }
            _ => AppError::Storage(err.to_string()),
        }
    }
}

/// Map a Postgres SQLSTATE and constraint name; `None` is a plain storage failure
fn database_error(code: Option<&str>, constraint: Option<&str>, message: &str) -> Option<AppError> {
    let violation = |rule: Rule, field: &str| Violation {
        rule,
        field: field.to_string(),
        message: message.to_string(),
    };
    let constraint = constraint.unwrap_or_default();

    let err = match code? {
        // serialization_failure, deadlock_detected, lock_not_available
        "40001" | "40P01" | "55P03" => AppError::Concurrency(message.to_string()),
        // unique_violation: a concurrent writer created the same lot or serial
        "23505" => AppError::Concurrency(message.to_string()),
        // foreign_key_violation: the row points at an unregistered sku, location or batch
        "23503" => {
            let (rule, field) = match constraint {
                c if c.ends_with("location_fk") => (Rule::UnknownLocation, "location_id"),
                c if c.ends_with("batch_fk") => (Rule::UnknownBatch, "batch_id"),
                _ => (Rule::UnknownSku, "sku_id"),
            };
            AppError::Conflict {
                violations: vec![violation(rule, field)],
            }
        }
        // check_violation
        "23514" => {
            let (rule, field) = match constraint {
                c if c.contains("reserved") => (Rule::InsufficientAvailable, "quantity_reserved"),
                c if c.ends_with("quantity_non_zero") => (Rule::NonZeroQuantity, "quantity"),
                c if c.ends_with("requested_quantity_check") => {
                    (Rule::PositiveQuantity, "quantity")
                }
                c if c.ends_with("recorded_after_occurred") => {
                    (Rule::OccurredInFuture, "occurred_at")
                }
                // Rows the ledger itself shaped; breaking one is a bug, not bad input
                _ => return Some(AppError::Internal(format!("{constraint}: {message}"))),
            };
            AppError::Validation {
                violations: vec![violation(rule, field)],
            }
        }
        // numeric_value_out_of_range: a quantity or balance past NUMERIC(20, 6)
        "22003" => AppError::Validation {
            violations: vec![violation(Rule::QuantityRange, "quantity")],
        },
        _ => return None,
    };
    Some(err)
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violations: Option<Vec<Violation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<Decimal>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match self.kind() {
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ErrorKind::Conflict => (StatusCode::CONFLICT, "CONFLICT"),
            ErrorKind::InsufficientStock => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_STOCK")
            }
            ErrorKind::InvalidStateTransition => (StatusCode::CONFLICT, "INVALID_STATE_TRANSITION"),
            ErrorKind::Concurrency => (StatusCode::SERVICE_UNAVAILABLE, "CONCURRENCY_ERROR"),
            ErrorKind::Storage => (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_ERROR"),
            ErrorKind::Configuration => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR"),
            ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        match self.kind() {
            ErrorKind::Storage | ErrorKind::Internal | ErrorKind::Configuration => {
                tracing::error!("Error: {}", self)
            }
            ErrorKind::Concurrency => tracing::warn!("Error: {}", self),
            _ => tracing::debug!("Rejected: {}", self),
        }

        // Retry mechanics stay internal; callers only learn to try again
        let message = if self.is_retryable() {
            "The ledger is temporarily unavailable, please try again".to_string()
        } else {
            self.to_string()
        };

        let violations = match self.violations() {
            [] => None,
            v => Some(v.to_vec()),
        };

        let detail = ErrorDetail {
            code: code.to_string(),
            message,
            violations,
            shortfall: self.shortfall(),
        };

        (status, Json(ErrorResponse { error: detail })).into_response()
    }
}

/// Result type alias for services and handlers
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_violations_become_conflicts() {
        let mut report = ValidationReport::new();
        report.push(Rule::NonZeroQuantity, "quantity", "Quantity must be nonzero");
        report.push(Rule::UnknownLocation, "location_id", "Location does not exist");
        let err = AppError::from_report(report);
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = AppError::InsufficientStock {
            requested: Decimal::from(15),
            available: Decimal::from(10),
            shortfall: Decimal::from(5),
        }
        .context("issue", Uuid::nil(), Uuid::nil());

        assert_eq!(err.kind(), ErrorKind::InsufficientStock);
        assert_eq!(err.shortfall(), Some(Decimal::from(5)));
        assert!(err.to_string().starts_with("issue of sku"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_context_is_not_nested_twice() {
        let err = AppError::Concurrency("lock timeout".into())
            .context("transfer", Uuid::nil(), Uuid::nil())
            .context("issue", Uuid::nil(), Uuid::nil());
        match &err {
            AppError::Context { operation, source, .. } => {
                assert_eq!(*operation, "transfer");
                assert!(matches!(**source, AppError::Concurrency(_)));
            }
            other => panic!("expected context, got {other:?}"),
        }
        assert!(err.is_retryable());
    }

    fn rule_of(err: &AppError) -> Rule {
        err.violations()[0].rule
    }

    #[test]
    fn test_check_violations_follow_the_constraint() {
        let reserved = database_error(
            Some("23514"),
            Some("stock_balances_reserved_within_on_hand"),
            "violates check constraint",
        )
        .unwrap();
        assert_eq!(reserved.kind(), ErrorKind::Validation);
        assert_eq!(rule_of(&reserved), Rule::InsufficientAvailable);
        assert_eq!(reserved.violations()[0].field, "quantity_reserved");

        let negative = database_error(
            Some("23514"),
            Some("stock_balances_reserved_non_negative"),
            "violates check constraint",
        )
        .unwrap();
        assert_eq!(rule_of(&negative), Rule::InsufficientAvailable);

        let zero = database_error(
            Some("23514"),
            Some("stock_movements_quantity_non_zero"),
            "violates check constraint",
        )
        .unwrap();
        assert_eq!(rule_of(&zero), Rule::NonZeroQuantity);

        let status = database_error(
            Some("23514"),
            Some("stock_reservations_resolution"),
            "violates check constraint",
        )
        .unwrap();
        assert_eq!(status.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_out_of_range_numeric_is_a_validation_error() {
        let err = database_error(Some("22003"), None, "numeric field overflow").unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(rule_of(&err), Rule::QuantityRange);
    }

    #[test]
    fn test_contention_codes_are_retryable() {
        for code in ["40001", "40P01", "55P03", "23505"] {
            let err = database_error(Some(code), None, "busy").unwrap();
            assert!(err.is_retryable(), "{code}");
        }
        assert!(database_error(Some("XX000"), None, "boom").is_none());
        assert!(database_error(None, None, "boom").is_none());
    }
}
