//! Query execution engine.
//!
//! This module provides query execution on top of the connection manager:
//! - `{schema}` template rendering
//! - Positional bind parameters (values never enter the SQL text)
//! - Query timeouts
//! - Ordered JSON rows

use crate::db::backend::{Connector, PgConnector, Session};
use crate::db::pool::ConnectionManager;
use crate::db::template;
use crate::error::{DbError, DbResult};
use crate::models::{DEFAULT_QUERY_TIMEOUT_SECS, QueryParam, Row};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long the client waits past the server's `statement_timeout` before
/// giving up itself. A statement the server cancels is then reported as a
/// query error (SQLSTATE 57014) rather than a client timeout.
pub const SERVER_TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Runs templated SQL against the manager's pool.
pub struct QueryExecutor<C: Connector = PgConnector> {
    manager: Arc<ConnectionManager<C>>,
    schema: String,
    query_timeout: Duration,
}

impl<C: Connector> std::fmt::Debug for QueryExecutor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("schema", &self.schema)
            .field("query_timeout", &self.query_timeout)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Clone for QueryExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            schema: self.schema.clone(),
            query_timeout: self.query_timeout,
        }
    }
}

impl<C: Connector> QueryExecutor<C> {
    pub fn new(manager: Arc<ConnectionManager<C>>, schema: impl Into<String>) -> Self {
        Self {
            manager,
            schema: schema.into(),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }

    /// Override the execution timeout.
    ///
    /// This should match the pool's `statement_timeout`; the client deadline
    /// is this value plus [`SERVER_TIMEOUT_GRACE`].
    pub fn with_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    /// Render `sql_template`, run it once and return every row.
    ///
    /// Connectivity errors from the manager propagate unchanged. SQL failures
    /// come back as [`DbError::Query`].
    pub async fn execute(&self, sql_template: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let sql = template::prepare(sql_template, &self.schema, params.len())?;
        let start = Instant::now();

        // SQL text only: parameter values may be user supplied.
        debug!(
            sql = %sql,
            param_count = params.len(),
            timeout_secs = self.query_timeout.as_secs(),
            "Executing query"
        );

        let deadline = self.query_timeout + SERVER_TIMEOUT_GRACE;
        let mut conn = self.manager.lease().await?;
        let result = match timeout(deadline, conn.fetch_all(&sql, params)).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error("query execution", deadline)),
        };
        conn.release();

        match result {
            Ok(rows) => {
                debug!(
                    row_count = rows.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Query complete"
                );
                Ok(rows)
            }
            Err(e) => {
                warn!(error = %e, code = e.code(), "Query failed");
                Err(e)
            }
        }
    }
}

fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout.as_secs())
}
