//! Pool backend: the seam between the connection manager and the driver.
//!
//! The manager owns *when* pools are built, probed and torn down; a
//! [`Connector`] owns *how*. Production uses [`PgConnector`] on sqlx.

use crate::config::PoolSettings;
use crate::db::params::bind_all;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{PoolConfig, QueryParam, Row};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Postgres};
use std::time::Duration;
use tracing::{debug, info};

/// Application name reported to the server in `pg_stat_activity`.
const APPLICATION_NAME: &str = "lakebase-client";

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open connections, idle or leased.
    pub size: u32,
    pub idle: usize,
}

/// A leased database session.
///
/// Dropping the session hands it back to its pool.
#[async_trait]
pub trait Session: Send {
    /// Run the liveness probe (`SELECT 1`).
    async fn ping(&mut self) -> DbResult<()>;

    /// Execute one statement and fetch every row, binding `params` positionally.
    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>>;
}

/// Builds, leases from and closes pools.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Pool: Clone + Send + Sync + 'static;
    type Conn: Session + 'static;

    /// Build a pool authenticated with `password`.
    async fn connect(
        &self,
        config: &PoolConfig,
        password: &str,
        settings: &PoolSettings,
    ) -> DbResult<Self::Pool>;

    /// Lease one connection.
    async fn lease(&self, pool: &Self::Pool) -> DbResult<Self::Conn>;

    /// Close every connection. Never fails; the pool may already be unusable.
    async fn close(&self, pool: &Self::Pool);

    fn stats(&self, pool: &Self::Pool) -> PoolStats;
}

/// sqlx Postgres backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl PgConnector {
    fn connect_options(config: &PoolConfig, password: &str, settings: &PoolSettings) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.dbname)
            .username(&config.username)
            .password(password)
            .ssl_mode(config.sslmode.into())
            .application_name(APPLICATION_NAME)
            .options([(
                "statement_timeout",
                settings.statement_timeout.as_millis().to_string(),
            )])
    }
}

/// `PoolTimedOut` carries no duration, so report the configured wait.
fn pool_error(err: sqlx::Error, acquire_timeout: Duration) -> DbError {
    match err {
        sqlx::Error::PoolTimedOut => {
            DbError::timeout("connection pool acquire", acquire_timeout.as_secs())
        }
        other => other.into(),
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Pool = PgPool;
    type Conn = PoolConnection<Postgres>;

    async fn connect(
        &self,
        config: &PoolConfig,
        password: &str,
        settings: &PoolSettings,
    ) -> DbResult<PgPool> {
        let options = Self::connect_options(config, password, settings);

        // The manager probes every lease itself, so sqlx's own check is off.
        let pool = PgPoolOptions::new()
            .min_connections(settings.min_connections)
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .idle_timeout(Some(settings.idle_timeout))
            .test_before_acquire(false)
            .connect_with(options)
            .await
            .map_err(|e| match pool_error(e, settings.acquire_timeout) {
                err if err.is_retryable() => err,
                other => DbError::connection(format!("Failed to connect: {}", other)),
            })?;

        info!(
            host = %config.host,
            port = config.port,
            dbname = %config.dbname,
            min = settings.min_connections,
            max = settings.max_connections,
            "Postgres pool connected"
        );
        Ok(pool)
    }

    async fn lease(&self, pool: &PgPool) -> DbResult<PoolConnection<Postgres>> {
        pool.acquire()
            .await
            .map_err(|e| pool_error(e, pool.options().get_acquire_timeout()))
    }

    async fn close(&self, pool: &PgPool) {
        pool.close().await;
        debug!("Postgres pool closed");
    }

    fn stats(&self, pool: &PgPool) -> PoolStats {
        PoolStats {
            size: pool.size(),
            idle: pool.num_idle(),
        }
    }
}

#[async_trait]
impl Session for PoolConnection<Postgres> {
    async fn ping(&mut self) -> DbResult<()> {
        Executor::execute(&mut **self, "SELECT 1").await?;
        Ok(())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        // Without params the statement goes through the simple-query protocol.
        let rows: Vec<PgRow> = if params.is_empty() {
            Executor::fetch_all(&mut **self, sql).await?
        } else {
            bind_all(sql, params).fetch_all(&mut **self).await?
        };
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }
}
