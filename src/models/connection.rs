//! Connection-related data models.
//!
//! This module defines what the credential provider hands back (endpoint and
//! token) and the immutable snapshot a pool is built from.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Default Postgres port for Lakebase instances.
pub const DEFAULT_PORT: u16 = 5432;

/// Default database name on a Lakebase instance.
pub const DEFAULT_DATABASE: &str = "databricks_postgres";

/// TLS negotiation mode, mirroring libpq's `sslmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    Prefer,
    #[default]
    Require,
    VerifyCa,
    VerifyFull,
}

impl std::fmt::Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        };
        write!(f, "{}", s)
    }
}

impl From<SslMode> for sqlx::postgres::PgSslMode {
    fn from(mode: SslMode) -> Self {
        match mode {
            SslMode::Disable => Self::Disable,
            SslMode::Allow => Self::Allow,
            SslMode::Prefer => Self::Prefer,
            SslMode::Require => Self::Require,
            SslMode::VerifyCa => Self::VerifyCa,
            SslMode::VerifyFull => Self::VerifyFull,
        }
    }
}

/// Where and as whom to connect, as resolved by the credential provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub username: String,
}

/// A short-lived database password issued by the credential provider.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Opaque secret - never log
    pub token: String,
    /// Provider-reported expiry, when the provider returns one.
    pub expires_at: Option<DateTime<Utc>>,
}

impl IssuedToken {
    pub fn new(token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Immutable settings a single pool instance is built from.
///
/// The password is deliberately absent: it is the token active at build time
/// and lives only inside the pool's connect options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub username: String,
    pub sslmode: SslMode,
}

impl PoolConfig {
    /// Build a pool snapshot from a resolved endpoint.
    pub fn from_endpoint(endpoint: Endpoint, sslmode: SslMode) -> Self {
        Self {
            host: endpoint.host,
            port: endpoint.port,
            dbname: endpoint.dbname,
            username: endpoint.username,
            sslmode,
        }
    }
}
