//! Error types for the Lakebase client.
//!
//! This module defines all error types using `thiserror`. Errors fall into three
//! classes that drive recovery behaviour:
//!
//! - **connectivity** (`Connection`, `Timeout`): the session could not be
//!   established or kept alive. The connection manager recovers from these once
//!   by rebuilding its pool; afterwards they surface as a 503-equivalent.
//! - **query** (`Query`): the database rejected a statement. Never retried.
//! - **unclassified** (`InvalidInput`, `Internal`): bugs or bad input. Never
//!   retried, and internal details are not echoed to clients.

use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection failed: {detail}")]
    Connection { detail: String },

    #[error("Database query failed: {detail}")]
    Query {
        detail: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error.
    pub fn connection(detail: impl Into<String>) -> Self {
        Self::Connection {
            detail: detail.into(),
        }
    }

    /// Create a query error with optional SQL state.
    pub fn query(detail: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Query {
            detail: detail.into(),
            sql_state,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is connectivity-class and therefore recoverable by
    /// rebuilding the pool.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Collapse a connectivity-class error into the terminal connection error
    /// surfaced to callers once recovery has been exhausted.
    pub fn into_connection_error(self) -> Self {
        match self {
            Self::Connection { .. } => self,
            Self::Timeout { .. } => Self::connection(self.to_string()),
            other => other,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "DB_CONNECTION_ERROR",
            Self::Query { .. } => "DB_QUERY_ERROR",
            Self::Timeout { .. } => "DB_TIMEOUT",
            Self::InvalidInput { .. } => "VALIDATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// HTTP-equivalent status code for the collaborator layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => 503,
            Self::Query { .. } | Self::Internal { .. } => 500,
            Self::InvalidInput { .. } => 422,
        }
    }

    /// Short human-readable summary, safe to show to any client.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Database connection failed",
            Self::Query { .. } => "Database query failed",
            Self::Timeout { .. } => "Database operation timed out",
            Self::InvalidInput { .. } => "Validation error",
            Self::Internal { .. } => "Internal server error",
        }
    }

    /// Underlying detail string, if this error carries one.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Connection { detail } => Some(detail.clone()),
            Self::Query { detail, sql_state } => Some(match sql_state {
                Some(code) => format!("{} (SQLSTATE: {})", detail, code),
                None => detail.clone(),
            }),
            Self::Timeout { .. } => Some(self.to_string()),
            Self::InvalidInput { message } => Some(message.clone()),
            Self::Internal { message } => Some(message.clone()),
        }
    }
}

/// SQLSTATE classes that mean the session itself is unusable rather than the
/// statement being wrong.
///
/// - `08`: connection exception
/// - `28`: invalid authorization (expired or revoked token)
/// - `53`: insufficient resources (too many connections)
/// - `57P0x`: operator intervention (admin shutdown, crash shutdown, cannot connect now)
fn is_connectivity_sql_state(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("28")
        || code.starts_with("53")
        || matches!(code, "57P01" | "57P02" | "57P03")
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => {
                DbError::connection(format!("Invalid connection configuration: {}", msg))
            }
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                match code.as_deref() {
                    Some(c) if is_connectivity_sql_state(c) => {
                        DbError::connection(format!("{} (SQLSTATE: {})", db_err.message(), c))
                    }
                    _ => DbError::query(db_err.message(), code),
                }
            }
            // The pool backend reports acquire timeouts with the configured wait.
            sqlx::Error::PoolTimedOut => {
                DbError::connection("Timed out waiting for a pooled connection")
            }
            sqlx::Error::PoolClosed => DbError::connection("Connection pool is closed"),
            sqlx::Error::Io(io_err) => DbError::connection(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DbError::connection(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => DbError::connection(format!("Protocol error: {}", msg)),
            sqlx::Error::WorkerCrashed => DbError::connection("Database worker crashed"),
            sqlx::Error::RowNotFound => DbError::query("No rows returned", None),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::query(format!("Type not found: {}", type_name), None)
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::query(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Convert credential provider transport errors to DbError.
///
/// Every provider failure is a connectivity problem from the pool's point of view.
impl From<reqwest::Error> for DbError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return DbError::timeout(
                "credential provider request",
                crate::credentials::workspace::HTTP_TIMEOUT.as_secs(),
            );
        }
        if err.is_decode() {
            return DbError::connection(format!("Unexpected credential provider response: {}", err));
        }
        match err.status() {
            Some(status) => {
                DbError::connection(format!("Credential provider returned {}: {}", status, err))
            }
            None => DbError::connection(format!("Credential provider unreachable: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Structured error body: `{"error": {"error": ..., "code": ..., "detail": ...}}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
    #[serde(skip)]
    pub status: u16,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub error: String,
    pub code: String,
    pub detail: Option<String>,
}

/// Internal errors are logged with their detail but never echo it back.
impl From<&DbError> for ErrorResponse {
    fn from(err: &DbError) -> Self {
        let detail = match err {
            DbError::Internal { message } => {
                error!(error = %message, "Unclassified database error");
                None
            }
            _ => err.detail(),
        };
        Self {
            error: ErrorDetail {
                error: err.summary().to_string(),
                code: err.code().to_string(),
                detail,
            },
            status: err.status_code(),
        }
    }
}

impl From<DbError> for ErrorResponse {
    fn from(err: DbError) -> Self {
        Self::from(&err)
    }
}
