//! Credential providers.
//!
//! A provider knows where a Lakebase instance lives and how to mint a
//! short-lived password for it. The connection manager only consumes this
//! contract; it never talks to the identity service directly.

pub mod fixed;
pub mod workspace;

use crate::config::{Config, CredentialSource};
use crate::error::DbResult;
use crate::models::{Endpoint, IssuedToken};
use async_trait::async_trait;
use std::sync::Arc;

pub use fixed::StaticCredentialProvider;
pub use workspace::{WorkspaceAuth, WorkspaceCredentialProvider};

/// Contract every credential provider implements.
///
/// Both operations may fail with network or authentication errors; those are
/// reported as connectivity-class [`DbError`](crate::error::DbError)s.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolve host, port, database and user for an instance.
    async fn resolve_endpoint(&self, instance_name: &str) -> DbResult<Endpoint>;

    /// Issue a fresh database token for an instance.
    async fn issue_token(&self, instance_name: &str) -> DbResult<IssuedToken>;
}

#[async_trait]
impl<T: CredentialProvider + ?Sized> CredentialProvider for Arc<T> {
    async fn resolve_endpoint(&self, instance_name: &str) -> DbResult<Endpoint> {
        (**self).resolve_endpoint(instance_name).await
    }

    async fn issue_token(&self, instance_name: &str) -> DbResult<IssuedToken> {
        (**self).issue_token(instance_name).await
    }
}

/// Build the provider selected by configuration.
pub fn from_config(config: &Config) -> Result<Arc<dyn CredentialProvider>, String> {
    let provider: Arc<dyn CredentialProvider> = match config.credential_source()? {
        CredentialSource::Static {
            host,
            username,
            password,
        } => Arc::new(StaticCredentialProvider::new(
            Endpoint {
                host,
                port: config.port,
                dbname: config.database.clone(),
                username,
            },
            password,
        )),
        CredentialSource::WorkspaceToken { host, token } => Arc::new(
            WorkspaceCredentialProvider::new(&host, WorkspaceAuth::Token(token))?
                .with_database(config.port, &config.database),
        ),
        CredentialSource::WorkspaceClient {
            host,
            client_id,
            client_secret,
        } => Arc::new(
            WorkspaceCredentialProvider::new(
                &host,
                WorkspaceAuth::ClientCredentials {
                    client_id,
                    client_secret,
                },
            )?
            .with_database(config.port, &config.database),
        ),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_static() {
        let config = Config {
            static_host: Some("localhost".to_string()),
            static_user: Some("postgres".to_string()),
            static_password: Some("secret".to_string()),
            database: "analytics".to_string(),
            ..Config::default()
        };
        let provider = from_config(&config).unwrap();
        let endpoint = provider.resolve_endpoint("ignored").await.unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.dbname, "analytics");
        assert_eq!(endpoint.username, "postgres");
        let token = provider.issue_token("ignored").await.unwrap();
        assert_eq!(token.token, "secret");
    }

    #[test]
    fn test_from_config_rejects_bad_workspace_url() {
        let config = Config {
            workspace_host: Some("not a url".to_string()),
            workspace_token: Some("dapi".to_string()),
            ..Config::default()
        };
        assert!(from_config(&config).is_err());
    }
}
