//! Connection pool management.
//!
//! `ConnectionManager` owns the token cache and the single live pool. Every
//! read-check-create-write sequence on that state runs under one async mutex,
//! so concurrent first callers build exactly one pool and a recovery reset
//! never tears down a pool another caller has just built.

use crate::config::PoolSettings;
use crate::credentials::CredentialProvider;
use crate::db::backend::{Connector, PgConnector, PoolStats, Session};
use crate::error::{DbError, DbResult};
use crate::models::PoolConfig;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// A provider-reported expiry is trusted only up to this many seconds before it.
pub const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// How long a freshly issued token may be reused.
///
/// The configured refresh interval, shortened to the provider's own expiry
/// (minus a safety margin) when it reports one.
fn token_lifetime(
    refresh_interval: Duration,
    provider_expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    let Some(expires_at) = provider_expiry else {
        return refresh_interval;
    };
    let remaining = (expires_at - now - chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS))
        .to_std()
        .unwrap_or(Duration::ZERO);
    refresh_interval.min(remaining)
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

struct ActivePool<P> {
    pool: P,
    config: PoolConfig,
    generation: u64,
}

struct ManagerState<P> {
    token: Option<CachedToken>,
    pool: Option<ActivePool<P>>,
    /// Generation assigned to the most recently built pool.
    generation: u64,
}

/// Where a lease attempt stands in the retry-once protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Retry,
}

/// A failed lease attempt and the pool generation it failed against.
///
/// `generation` is `None` when no pool could be built at all.
struct LeaseFailure {
    error: DbError,
    generation: Option<u64>,
}

/// Diagnostics snapshot of the manager. Contains no secrets.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub instance_name: String,
    pub pool_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<PoolStats>,
    pub token_cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_in_secs: Option<u64>,
}

/// Hands out probed connections from a token-authenticated pool.
///
/// One instance per process, shared behind an `Arc`.
pub struct ConnectionManager<C: Connector = PgConnector> {
    provider: Arc<dyn CredentialProvider>,
    connector: Arc<C>,
    settings: PoolSettings,
    state: Mutex<ManagerState<C::Pool>>,
}

impl<C: Connector> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager<PgConnector> {
    /// Create a manager backed by sqlx Postgres pools.
    pub fn postgres(provider: Arc<dyn CredentialProvider>, settings: PoolSettings) -> Self {
        Self::new(provider, PgConnector, settings)
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(provider: Arc<dyn CredentialProvider>, connector: C, settings: PoolSettings) -> Self {
        Self {
            provider,
            connector: Arc::new(connector),
            settings,
            state: Mutex::new(ManagerState {
                token: None,
                pool: None,
                generation: 0,
            }),
        }
    }

    /// Return the cached token, issuing a new one once it has expired.
    ///
    /// Provider failures surface as connectivity errors and are not retried here.
    pub async fn get_token(&self) -> DbResult<String> {
        let mut state = self.state.lock().await;
        self.token_locked(&mut state).await
    }

    async fn token_locked(&self, state: &mut ManagerState<C::Pool>) -> DbResult<String> {
        let now = Instant::now();
        if let Some(cached) = &state.token {
            if now < cached.expires_at {
                return Ok(cached.value.clone());
            }
            debug!("Cached token expired");
        }

        let issued = self
            .provider
            .issue_token(&self.settings.instance_name)
            .await
            .map_err(provider_failure)?;

        let lifetime = token_lifetime(
            self.settings.token_refresh_interval,
            issued.expires_at,
            Utc::now(),
        );
        info!(
            instance = %self.settings.instance_name,
            reuse_secs = lifetime.as_secs(),
            "Issued database token"
        );

        state.token = Some(CachedToken {
            value: issued.token.clone(),
            expires_at: now + lifetime,
        });
        Ok(issued.token)
    }

    /// Return the live pool, building one if none exists.
    ///
    /// An existing pool is returned as-is; its credentials are not re-checked.
    pub async fn acquire_pool(&self) -> DbResult<C::Pool> {
        self.pool_with_generation()
            .await
            .map(|(pool, _)| pool)
            .map_err(|failure| failure.error)
    }

    async fn pool_with_generation(&self) -> Result<(C::Pool, u64), LeaseFailure> {
        let mut state = self.state.lock().await;
        if let Some(active) = &state.pool {
            return Ok((active.pool.clone(), active.generation));
        }

        let built = self.build_pool(&mut state).await.map_err(|error| LeaseFailure {
            error,
            generation: None,
        })?;
        Ok(built)
    }

    async fn build_pool(&self, state: &mut ManagerState<C::Pool>) -> DbResult<(C::Pool, u64)> {
        let instance = &self.settings.instance_name;
        let endpoint = self
            .provider
            .resolve_endpoint(instance)
            .await
            .map_err(provider_failure)?;
        let token = self.token_locked(state).await?;
        let config = PoolConfig::from_endpoint(endpoint, self.settings.sslmode);

        let pool = self
            .connector
            .connect(&config, &token, &self.settings)
            .await
            .map_err(|e| {
                error!(instance = %instance, host = %config.host, error = %e, "Failed to build pool");
                e.into_connection_error()
            })?;

        state.generation += 1;
        let generation = state.generation;
        info!(
            instance = %instance,
            host = %config.host,
            generation,
            "Connection pool created"
        );
        state.pool = Some(ActivePool {
            pool: pool.clone(),
            config,
            generation,
        });
        Ok((pool, generation))
    }

    /// Close the pool and forget the token. Safe to call with no pool.
    pub async fn reset(&self) {
        let taken = {
            let mut state = self.state.lock().await;
            state.token = None;
            state.pool.take()
        };
        match taken {
            Some(active) => {
                info!(generation = active.generation, "Resetting connection pool");
                self.connector.close(&active.pool).await;
            }
            None => debug!("Reset with no active pool"),
        }
    }

    /// Recovery reset scoped to the pool generation that failed.
    ///
    /// If another caller already replaced that pool the fresh one is left alone.
    /// The old pool is closed in the background so that connections still
    /// leased from it cannot stall the retry.
    async fn reset_generation(&self, failed: Option<u64>) {
        let taken = {
            let mut state = self.state.lock().await;
            if let Some(current) = state.pool.as_ref().map(|active| active.generation) {
                if failed != Some(current) {
                    debug!(?failed, current, "Pool already rebuilt, skipping reset");
                    return;
                }
            }
            state.token = None;
            state.pool.take()
        };

        if let Some(active) = taken {
            info!(generation = active.generation, "Resetting connection pool");
            let connector = Arc::clone(&self.connector);
            tokio::spawn(async move {
                connector.close(&active.pool).await;
            });
        }
    }

    /// Lease a probed connection, rebuilding the pool once on connectivity failure.
    ///
    /// The connection returns to the pool when the guard is dropped.
    pub async fn lease(&self) -> DbResult<LeasedConnection<C::Conn>> {
        let mut attempt = Attempt::First;
        loop {
            let failure = match self.try_lease().await {
                Ok(conn) => return Ok(conn),
                Err(failure) => failure,
            };

            if !failure.error.is_retryable() {
                return Err(failure.error);
            }

            match attempt {
                Attempt::First => {
                    warn!(
                        error = %failure.error,
                        generation = ?failure.generation,
                        "Connection attempt failed, resetting pool and retrying once"
                    );
                    self.reset_generation(failure.generation).await;
                    attempt = Attempt::Retry;
                }
                Attempt::Retry => {
                    error!(error = %failure.error, "Connection retry failed");
                    return Err(failure.error.into_connection_error());
                }
            }
        }
    }

    async fn try_lease(&self) -> Result<LeasedConnection<C::Conn>, LeaseFailure> {
        let (pool, generation) = self.pool_with_generation().await?;
        let fail = |error: DbError| LeaseFailure {
            error,
            generation: Some(generation),
        };

        let mut conn = self.connector.lease(&pool).await.map_err(fail)?;
        if let Err(e) = conn.ping().await {
            debug!(generation, error = %e, "Liveness probe failed");
            // Release before any reset so closing the pool never waits on us.
            drop(conn);
            return Err(fail(e));
        }

        trace!(generation, "Connection leased");
        Ok(LeasedConnection { conn, generation })
    }

    /// Run `f` on a probed connection.
    ///
    /// The connection is returned to the pool whether or not `f` succeeds.
    /// Errors from `f` are never retried.
    pub async fn with_connection<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut C::Conn) -> BoxFuture<'c, DbResult<T>>,
    {
        let mut conn = self.lease().await?;
        let result = f(&mut *conn).await;
        conn.release();
        result
    }

    /// Configuration snapshot of the live pool, if any.
    pub async fn pool_config(&self) -> Option<PoolConfig> {
        let state = self.state.lock().await;
        state.pool.as_ref().map(|active| active.config.clone())
    }

    pub async fn status(&self) -> ManagerStatus {
        let state = self.state.lock().await;
        let now = Instant::now();
        let token_expires_in_secs = state
            .token
            .as_ref()
            .map(|t| t.expires_at.saturating_duration_since(now).as_secs());

        ManagerStatus {
            instance_name: self.settings.instance_name.clone(),
            pool_active: state.pool.is_some(),
            generation: state.pool.as_ref().map(|a| a.generation),
            pool: state.pool.as_ref().map(|a| a.config.clone()),
            stats: state.pool.as_ref().map(|a| self.connector.stats(&a.pool)),
            token_cached: state.token.is_some(),
            token_expires_in_secs,
        }
    }

    /// Orderly shutdown.
    pub async fn close(&self) {
        self.reset().await;
        info!("Connection manager closed");
    }
}

/// Provider failures are connectivity failures from the pool's point of view.
fn provider_failure(err: DbError) -> DbError {
    if err.is_retryable() {
        err
    } else {
        DbError::connection(format!("Credential provider failed: {}", err))
    }
}

/// A probed connection leased from the manager's pool.
///
/// Dropping the guard returns the connection to its pool.
pub struct LeasedConnection<S> {
    conn: S,
    generation: u64,
}

impl<S> std::fmt::Debug for LeasedConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedConnection")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<S> LeasedConnection<S> {
    /// Generation of the pool this connection came from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Explicitly hand the connection back.
    pub fn release(self) {
        trace!(generation = self.generation, "Connection released");
    }
}

impl<S> Deref for LeasedConnection<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.conn
    }
}

impl<S> DerefMut for LeasedConnection<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.conn
    }
}
