//! Configuration handling for the Lakebase client.
//!
//! This module provides configuration management via CLI arguments and environment variables.

use crate::models::{DEFAULT_DATABASE, DEFAULT_PORT, DEFAULT_QUERY_TIMEOUT_SECS, SslMode};
use clap::Args;
use std::time::Duration;

pub const DEFAULT_INSTANCE_NAME: &str = "marketplace-intel-db";
pub const DEFAULT_SCHEMA: &str = "gold";

// Pool configuration defaults
pub const DEFAULT_MIN_CONNECTIONS: u32 = 2;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Tokens live about an hour; refresh well before that.
pub const DEFAULT_TOKEN_REFRESH_INTERVAL_SECS: u64 = 900;

/// Settings the connection manager needs to build and recycle pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Instance the credential provider issues tokens for.
    pub instance_name: String,
    pub sslmode: SslMode,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// Server-side statement timeout applied to every pooled session.
    pub statement_timeout: Duration,
    /// How long a cached token is reused before asking the provider again.
    pub token_refresh_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            instance_name: DEFAULT_INSTANCE_NAME.to_string(),
            sslmode: SslMode::Require,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            statement_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            token_refresh_interval: Duration::from_secs(DEFAULT_TOKEN_REFRESH_INTERVAL_SECS),
        }
    }
}

/// Where database credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Workspace API with a personal access token.
    WorkspaceToken { host: String, token: String },
    /// Workspace API with OAuth machine-to-machine client credentials.
    WorkspaceClient {
        host: String,
        client_id: String,
        client_secret: String,
    },
    /// Fixed host, user and password (local development).
    Static {
        host: String,
        username: String,
        password: String,
    },
}

/// Configuration for the Lakebase client.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Lakebase database instance name
    #[arg(
        long,
        default_value = DEFAULT_INSTANCE_NAME,
        env = "LAKEBASE_INSTANCE_NAME"
    )]
    pub instance_name: String,

    /// Schema substituted into the {schema} slot of query templates
    #[arg(long, default_value = DEFAULT_SCHEMA, env = "LAKEBASE_SCHEMA")]
    pub schema: String,

    /// Database name on the instance
    #[arg(long, default_value = DEFAULT_DATABASE, env = "LAKEBASE_DATABASE")]
    pub database: String,

    /// Postgres port on the instance
    #[arg(long, default_value_t = DEFAULT_PORT, env = "LAKEBASE_PORT")]
    pub port: u16,

    /// TLS mode for database sessions
    #[arg(long, value_enum, default_value = "require", env = "LAKEBASE_SSLMODE")]
    pub sslmode: SslMode,

    /// Minimum pooled connections
    #[arg(
        long,
        default_value_t = DEFAULT_MIN_CONNECTIONS,
        env = "POOL_MIN_CONNECTIONS"
    )]
    pub pool_min_connections: u32,

    /// Maximum pooled connections
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_CONNECTIONS,
        env = "POOL_MAX_CONNECTIONS"
    )]
    pub pool_max_connections: u32,

    /// Seconds a database token is reused before a fresh one is requested
    #[arg(
        long,
        default_value_t = DEFAULT_TOKEN_REFRESH_INTERVAL_SECS,
        env = "TOKEN_REFRESH_INTERVAL"
    )]
    pub token_refresh_interval: u64,

    /// Connection acquire timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS,
        env = "LAKEBASE_ACQUIRE_TIMEOUT"
    )]
    pub acquire_timeout: u64,

    /// Idle connection timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_IDLE_TIMEOUT_SECS,
        env = "LAKEBASE_IDLE_TIMEOUT"
    )]
    pub idle_timeout: u64,

    /// Statement timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_QUERY_TIMEOUT_SECS,
        env = "LAKEBASE_QUERY_TIMEOUT"
    )]
    pub query_timeout: u64,

    /// Workspace URL used to resolve the instance and issue tokens
    #[arg(long, env = "DATABRICKS_HOST")]
    pub workspace_host: Option<String>,

    /// Workspace personal access token
    #[arg(long, env = "DATABRICKS_TOKEN", hide_env_values = true)]
    pub workspace_token: Option<String>,

    /// OAuth client id for machine-to-machine workspace auth
    #[arg(long, env = "DATABRICKS_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret for machine-to-machine workspace auth
    #[arg(long, env = "DATABRICKS_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Fixed database host (bypasses the workspace API)
    #[arg(long, env = "LAKEBASE_HOST")]
    pub static_host: Option<String>,

    /// Fixed database user (with --static-host)
    #[arg(long, env = "LAKEBASE_USER")]
    pub static_user: Option<String>,

    /// Fixed database password (with --static-host)
    #[arg(long, env = "LAKEBASE_PASSWORD", hide_env_values = true)]
    pub static_password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LAKEBASE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "LAKEBASE_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            instance_name: DEFAULT_INSTANCE_NAME.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            port: DEFAULT_PORT,
            sslmode: SslMode::Require,
            pool_min_connections: DEFAULT_MIN_CONNECTIONS,
            pool_max_connections: DEFAULT_MAX_CONNECTIONS,
            token_refresh_interval: DEFAULT_TOKEN_REFRESH_INTERVAL_SECS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            query_timeout: DEFAULT_QUERY_TIMEOUT_SECS,
            workspace_host: None,
            workspace_token: None,
            client_id: None,
            client_secret: None,
            static_host: None,
            static_user: None,
            static_password: None,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Validate types and ranges. Returns an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_max_connections == 0 {
            return Err("pool_max_connections must be greater than 0".to_string());
        }
        if self.pool_min_connections > self.pool_max_connections {
            return Err(format!(
                "pool_min_connections ({}) cannot exceed pool_max_connections ({})",
                self.pool_min_connections, self.pool_max_connections
            ));
        }
        if self.token_refresh_interval == 0 {
            return Err("token_refresh_interval must be greater than 0".to_string());
        }
        if self.acquire_timeout == 0 || self.query_timeout == 0 {
            return Err("acquire_timeout and query_timeout must be greater than 0".to_string());
        }
        if self.instance_name.trim().is_empty() {
            return Err("instance_name cannot be empty".to_string());
        }
        if !is_identifier(&self.schema) {
            return Err(format!(
                "schema '{}' must be a plain identifier (letters, digits, underscore)",
                self.schema
            ));
        }
        Ok(())
    }

    /// Snapshot of the settings the connection manager consumes.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            instance_name: self.instance_name.clone(),
            sslmode: self.sslmode,
            min_connections: self.pool_min_connections,
            max_connections: self.pool_max_connections,
            acquire_timeout: Duration::from_secs(self.acquire_timeout),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            statement_timeout: self.query_timeout_duration(),
            token_refresh_interval: self.token_refresh_interval_duration(),
        }
    }

    /// Pick the credential source from whichever settings are present.
    ///
    /// A static host wins; otherwise a workspace host is required, with a
    /// personal access token preferred over client credentials.
    pub fn credential_source(&self) -> Result<CredentialSource, String> {
        if let Some(host) = &self.static_host {
            let username = self
                .static_user
                .clone()
                .ok_or("--static-user is required with --static-host")?;
            let password = self
                .static_password
                .clone()
                .ok_or("--static-password is required with --static-host")?;
            return Ok(CredentialSource::Static {
                host: host.clone(),
                username,
                password,
            });
        }

        let host = self
            .workspace_host
            .clone()
            .ok_or("Either DATABRICKS_HOST or LAKEBASE_HOST must be set")?;

        if let Some(token) = &self.workspace_token {
            return Ok(CredentialSource::WorkspaceToken {
                host,
                token: token.clone(),
            });
        }

        match (&self.client_id, &self.client_secret) {
            (Some(client_id), Some(client_secret)) => Ok(CredentialSource::WorkspaceClient {
                host,
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            }),
            _ => Err(
                "Workspace auth requires DATABRICKS_TOKEN or DATABRICKS_CLIENT_ID/DATABRICKS_CLIENT_SECRET"
                    .to_string(),
            ),
        }
    }

    /// Get the query timeout as a Duration.
    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    /// Get the token refresh interval as a Duration.
    pub fn token_refresh_interval_duration(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
