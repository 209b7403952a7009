//! In-memory credential provider and pool backend for driving the
//! connection manager without a database.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lakebase_client::config::PoolSettings;
use lakebase_client::credentials::CredentialProvider;
use lakebase_client::db::{ConnectionManager, Connector, PoolStats, QueryExecutor, Session};
use lakebase_client::error::{DbError, DbResult};
use lakebase_client::models::{Endpoint, IssuedToken, PoolConfig, QueryParam, Row};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Consume one scheduled failure, if any are left.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// Credential provider
// =============================================================================

#[derive(Default)]
pub struct FakeProvider {
    resolves: AtomicUsize,
    issues: AtomicUsize,
    /// Fail this many upcoming `resolve_endpoint` calls.
    pub fail_resolves: AtomicUsize,
    /// Fail this many upcoming `issue_token` calls.
    pub fail_issues: AtomicUsize,
    /// Expiry reported alongside issued tokens.
    pub expires_at: Mutex<Option<DateTime<Utc>>>,
    /// Artificial latency per call, to widen race windows.
    pub delay: Mutex<Duration>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn issue_count(&self) -> usize {
        self.issues.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl CredentialProvider for FakeProvider {
    async fn resolve_endpoint(&self, instance_name: &str) -> DbResult<Endpoint> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if take_failure(&self.fail_resolves) {
            return Err(DbError::connection("Credential provider unreachable"));
        }
        Ok(Endpoint {
            host: format!("{}.database.example.com", instance_name),
            port: 5432,
            dbname: "databricks_postgres".to_string(),
            username: "analyst@example.com".to_string(),
        })
    }

    async fn issue_token(&self, _instance_name: &str) -> DbResult<IssuedToken> {
        let n = self.issues.fetch_add(1, Ordering::SeqCst) + 1;
        self.pause().await;
        if take_failure(&self.fail_issues) {
            return Err(DbError::connection("Credential provider returned 401"));
        }
        let expires_at = *self.expires_at.lock().unwrap();
        Ok(IssuedToken::new(format!("token-{}", n), expires_at))
    }
}

// =============================================================================
// Pool backend
// =============================================================================

/// Shared counters and scripted behaviour for [`FakeConnector`].
#[derive(Default)]
pub struct FakeBackend {
    connects: AtomicUsize,
    closes: AtomicUsize,
    leases: AtomicUsize,
    releases: AtomicUsize,
    probes: AtomicUsize,
    pub fail_connects: AtomicUsize,
    pub fail_leases: AtomicUsize,
    pub fail_probes: AtomicUsize,
    /// Every probe on this pool fails, the n-th one after `n * doomed_probe_stagger`.
    pub doomed_pool: Mutex<Option<usize>>,
    pub doomed_probe_stagger: Mutex<Duration>,
    doomed_probes: AtomicUsize,
    /// Passwords each pool was built with, in build order.
    pub passwords: Mutex<Vec<String>>,
    /// Every statement sent through `fetch_all`, with its bind parameters.
    pub executed: Mutex<Vec<(String, Vec<QueryParam>)>>,
    /// Rows returned by `fetch_all`.
    pub rows: Mutex<Vec<Row>>,
    /// When set, `fetch_all` fails with a query error carrying this SQLSTATE.
    pub query_error: Mutex<Option<(String, String)>>,
    pub query_delay: Mutex<Duration>,
}

impl FakeBackend {
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn set_rows(&self, rows: Vec<serde_json::Value>) {
        *self.rows.lock().unwrap() = rows
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
    }

    pub fn executed(&self) -> Vec<(String, Vec<QueryParam>)> {
        self.executed.lock().unwrap().clone()
    }
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub backend: Arc<FakeBackend>,
}

/// Pool handle: the build number it came from.
#[derive(Debug, Clone)]
pub struct FakePool {
    pub id: usize,
}

pub struct FakeConn {
    backend: Arc<FakeBackend>,
    pub pool_id: usize,
}

impl Drop for FakeConn {
    fn drop(&mut self) {
        self.backend.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Pool = FakePool;
    type Conn = FakeConn;

    async fn connect(
        &self,
        _config: &PoolConfig,
        password: &str,
        _settings: &PoolSettings,
    ) -> DbResult<FakePool> {
        let id = self.backend.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if take_failure(&self.backend.fail_connects) {
            return Err(DbError::connection(
                "password authentication failed (SQLSTATE: 28P01)",
            ));
        }
        self.backend
            .passwords
            .lock()
            .unwrap()
            .push(password.to_string());
        Ok(FakePool { id })
    }

    async fn lease(&self, pool: &FakePool) -> DbResult<FakeConn> {
        self.backend.leases.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.backend.fail_leases) {
            return Err(DbError::timeout("connection pool acquire", 30));
        }
        Ok(FakeConn {
            backend: Arc::clone(&self.backend),
            pool_id: pool.id,
        })
    }

    async fn close(&self, _pool: &FakePool) {
        self.backend.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self, _pool: &FakePool) -> PoolStats {
        PoolStats { size: 2, idle: 2 }
    }
}

#[async_trait]
impl Session for FakeConn {
    async fn ping(&mut self) -> DbResult<()> {
        self.backend.probes.fetch_add(1, Ordering::SeqCst);
        let doomed = *self.backend.doomed_pool.lock().unwrap();
        if doomed == Some(self.pool_id) {
            let n = self.backend.doomed_probes.fetch_add(1, Ordering::SeqCst) + 1;
            let stagger = *self.backend.doomed_probe_stagger.lock().unwrap();
            tokio::time::sleep(stagger * n as u32).await;
            return Err(DbError::connection("terminating connection due to administrator command"));
        }
        if take_failure(&self.backend.fail_probes) {
            return Err(DbError::connection(
                "server closed the connection unexpectedly",
            ));
        }
        Ok(())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.backend
            .executed
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));

        let delay = *self.backend.query_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some((message, state)) = self.backend.query_error.lock().unwrap().clone() {
            return Err(DbError::query(message, Some(state)));
        }
        Ok(self.backend.rows.lock().unwrap().clone())
    }
}

// =============================================================================
// Builders
// =============================================================================

pub fn test_settings() -> PoolSettings {
    PoolSettings {
        instance_name: "marketplace-intel-db".to_string(),
        token_refresh_interval: Duration::from_secs(900),
        ..PoolSettings::default()
    }
}

pub struct Harness {
    pub provider: Arc<FakeProvider>,
    pub backend: Arc<FakeBackend>,
    pub manager: Arc<ConnectionManager<FakeConnector>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: PoolSettings) -> Self {
        let provider = FakeProvider::new();
        let connector = FakeConnector::default();
        let backend = Arc::clone(&connector.backend);
        let manager = Arc::new(ConnectionManager::new(
            provider.clone(),
            connector,
            settings,
        ));
        Self {
            provider,
            backend,
            manager,
        }
    }

    pub fn executor(&self) -> QueryExecutor<FakeConnector> {
        QueryExecutor::new(Arc::clone(&self.manager), "gold")
    }
}

/// Wait until background pool closes have landed.
pub async fn wait_for_closes(backend: &FakeBackend, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.close_count() < expected {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("pool close did not happen");
}
