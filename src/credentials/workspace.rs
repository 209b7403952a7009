//! Workspace REST credential provider.
//!
//! Resolves Lakebase instances and mints database tokens through the workspace
//! API:
//!
//! - `GET  /api/2.0/database/instances/{name}` for the read-write DNS name
//! - `GET  /api/2.0/preview/scim/v2/Me` for the calling identity's user name
//! - `POST /api/2.0/database/credentials` for a short-lived database token
//!
//! Requests authenticate with either a personal access token or an OAuth
//! machine-to-machine token obtained from `/oidc/v1/token`.

use super::CredentialProvider;
use crate::error::{DbError, DbResult};
use crate::models::{DEFAULT_DATABASE, DEFAULT_PORT, Endpoint, IssuedToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

/// Per-request timeout for workspace API calls.
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Renew workspace OAuth tokens this long before they expire.
const OAUTH_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// How requests to the workspace API are authenticated.
#[derive(Clone)]
pub enum WorkspaceAuth {
    /// Personal access token, sent as a bearer token.
    Token(String),
    /// OAuth client credentials exchanged for a bearer token.
    ClientCredentials {
        client_id: String,
        client_secret: String,
    },
}

impl std::fmt::Debug for WorkspaceAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(<redacted>)"),
            Self::ClientCredentials { client_id, .. } => f
                .debug_struct("ClientCredentials")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DatabaseInstance {
    read_write_dns: Option<String>,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    #[serde(rename = "userName")]
    user_name: String,
}

#[derive(Debug, Serialize)]
struct CredentialRequest<'a> {
    request_id: String,
    instance_names: [&'a str; 1],
}

#[derive(Deserialize)]
struct CredentialResponse {
    token: String,
    expiration_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

struct CachedBearer {
    token: String,
    expires_at: Instant,
}

pub struct WorkspaceCredentialProvider {
    base: Url,
    auth: WorkspaceAuth,
    port: u16,
    dbname: String,
    http: reqwest::Client,
    bearer: Mutex<Option<CachedBearer>>,
}

impl std::fmt::Debug for WorkspaceCredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceCredentialProvider")
            .field("base", &self.base.as_str())
            .field("auth", &self.auth)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .finish_non_exhaustive()
    }
}

impl WorkspaceCredentialProvider {
    /// Create a provider for a workspace. A bare host name is treated as https.
    pub fn new(host: &str, auth: WorkspaceAuth) -> Result<Self, String> {
        let host = host.trim().trim_end_matches('/');
        let with_scheme = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };
        let base = Url::parse(&with_scheme).map_err(|e| format!("Invalid workspace URL: {e}"))?;
        if base.cannot_be_a_base() || base.host_str().is_none() {
            return Err(format!("Invalid workspace URL: {}", with_scheme));
        }

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {e}"))?;

        Ok(Self {
            base,
            auth,
            port: DEFAULT_PORT,
            dbname: DEFAULT_DATABASE.to_string(),
            http,
            bearer: Mutex::new(None),
        })
    }

    /// Override the Postgres port and database name reported in endpoints.
    pub fn with_database(mut self, port: u16, dbname: &str) -> Self {
        self.port = port;
        self.dbname = dbname.to_string();
        self
    }

    fn api_url(&self, segments: &[&str]) -> DbResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| DbError::internal("Workspace URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Bearer token for workspace API calls, exchanging client credentials when needed.
    async fn bearer_token(&self) -> DbResult<String> {
        let (client_id, client_secret) = match &self.auth {
            WorkspaceAuth::Token(token) => return Ok(token.clone()),
            WorkspaceAuth::ClientCredentials {
                client_id,
                client_secret,
            } => (client_id, client_secret),
        };

        let mut cached = self.bearer.lock().await;
        if let Some(bearer) = cached.as_ref() {
            if Instant::now() < bearer.expires_at {
                return Ok(bearer.token.clone());
            }
        }

        debug!(client_id = %client_id, "Requesting workspace OAuth token");
        let response: OAuthTokenResponse = self
            .http
            .post(self.api_url(&["oidc", "v1", "token"])?)
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials"), ("scope", "all-apis")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(3600));
        let expires_at = Instant::now() + lifetime.saturating_sub(OAUTH_EXPIRY_MARGIN);
        *cached = Some(CachedBearer {
            token: response.access_token.clone(),
            expires_at,
        });
        Ok(response.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> DbResult<T> {
        let bearer = self.bearer_token().await?;
        let value = self
            .http
            .get(url)
            .bearer_auth(bearer)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }
}

#[async_trait]
impl CredentialProvider for WorkspaceCredentialProvider {
    async fn resolve_endpoint(&self, instance_name: &str) -> DbResult<Endpoint> {
        let instance: DatabaseInstance = self
            .get_json(self.api_url(&["api", "2.0", "database", "instances", instance_name])?)
            .await?;
        let host = instance.read_write_dns.filter(|h| !h.is_empty()).ok_or_else(|| {
            DbError::connection(format!(
                "Instance '{}' has no read-write endpoint (state: {})",
                instance_name,
                instance.state.as_deref().unwrap_or("unknown")
            ))
        })?;

        let user: CurrentUser = self
            .get_json(self.api_url(&["api", "2.0", "preview", "scim", "v2", "Me"])?)
            .await?;

        info!(instance = %instance_name, host = %host, "Resolved database endpoint");

        Ok(Endpoint {
            host,
            port: self.port,
            dbname: self.dbname.clone(),
            username: user.user_name,
        })
    }

    async fn issue_token(&self, instance_name: &str) -> DbResult<IssuedToken> {
        let bearer = self.bearer_token().await?;
        let request = CredentialRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            instance_names: [instance_name],
        };

        let response: CredentialResponse = self
            .http
            .post(self.api_url(&["api", "2.0", "database", "credentials"])?)
            .bearer_auth(bearer)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(
            instance = %instance_name,
            expires_at = ?response.expiration_time,
            "Issued database credential"
        );

        Ok(IssuedToken::new(response.token, response.expiration_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(server: &mockito::Server) -> WorkspaceCredentialProvider {
        WorkspaceCredentialProvider::new(&server.url(), WorkspaceAuth::Token("dapi-test".into()))
            .unwrap()
    }

    #[test]
    fn test_bare_host_gets_https() {
        let provider = WorkspaceCredentialProvider::new(
            "example.cloud.databricks.com/",
            WorkspaceAuth::Token("t".into()),
        )
        .unwrap();
        assert_eq!(provider.base.scheme(), "https");
        let url = provider.api_url(&["api", "2.0", "database", "credentials"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.cloud.databricks.com/api/2.0/database/credentials"
        );
    }

    #[test]
    fn test_instance_name_is_path_encoded() {
        let provider =
            WorkspaceCredentialProvider::new("https://ws.example", WorkspaceAuth::Token("t".into()))
                .unwrap();
        let url = provider
            .api_url(&["api", "2.0", "database", "instances", "a b/c"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://ws.example/api/2.0/database/instances/a%20b%2Fc"
        );
    }

    #[test]
    fn test_debug_redacts_token() {
        let auth = WorkspaceAuth::Token("dapi-secret".into());
        assert!(!format!("{:?}", auth).contains("dapi-secret"));
    }

    #[tokio::test]
    async fn test_resolve_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let instance = server
            .mock("GET", "/api/2.0/database/instances/marketplace-intel-db")
            .match_header("authorization", "Bearer dapi-test")
            .with_header("content-type", "application/json")
            .with_body(r#"{"name":"marketplace-intel-db","read_write_dns":"instance-1.database.example","state":"AVAILABLE"}"#)
            .create_async()
            .await;
        let me = server
            .mock("GET", "/api/2.0/preview/scim/v2/Me")
            .with_header("content-type", "application/json")
            .with_body(r#"{"userName":"analyst@example.com"}"#)
            .create_async()
            .await;

        let endpoint = provider(&server)
            .with_database(5433, "warehouse")
            .resolve_endpoint("marketplace-intel-db")
            .await
            .unwrap();

        assert_eq!(endpoint.host, "instance-1.database.example");
        assert_eq!(endpoint.port, 5433);
        assert_eq!(endpoint.dbname, "warehouse");
        assert_eq!(endpoint.username, "analyst@example.com");
        instance.assert_async().await;
        me.assert_async().await;
    }

    #[tokio::test]
    async fn test_resolve_endpoint_without_dns_is_connection_error() {
        let mut server = mockito::Server::new_async().await;
        let _instance = server
            .mock("GET", "/api/2.0/database/instances/starting-db")
            .with_header("content-type", "application/json")
            .with_body(r#"{"state":"STARTING"}"#)
            .create_async()
            .await;

        let err = provider(&server)
            .resolve_endpoint("starting-db")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.to_string().contains("STARTING"));
    }

    #[tokio::test]
    async fn test_issue_token() {
        let mut server = mockito::Server::new_async().await;
        let credentials = server
            .mock("POST", "/api/2.0/database/credentials")
            .match_header("authorization", "Bearer dapi-test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "instance_names": ["marketplace-intel-db"]
            })))
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"pg-token","expiration_time":"2030-01-01T00:00:00Z"}"#)
            .create_async()
            .await;

        let token = provider(&server)
            .issue_token("marketplace-intel-db")
            .await
            .unwrap();
        assert_eq!(token.token, "pg-token");
        assert_eq!(
            token.expires_at.unwrap().to_rfc3339(),
            "2030-01-01T00:00:00+00:00"
        );
        credentials.assert_async().await;
    }

    #[tokio::test]
    async fn test_issue_token_auth_failure_is_connectivity_error() {
        let mut server = mockito::Server::new_async().await;
        let _credentials = server
            .mock("POST", "/api/2.0/database/credentials")
            .with_status(403)
            .create_async()
            .await;

        let err = provider(&server)
            .issue_token("marketplace-intel-db")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_client_credentials_token_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let oauth = server
            .mock("POST", "/oidc/v1/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".into(),
                "client_credentials".into(),
            ))
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"m2m-token","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let credentials = server
            .mock("POST", "/api/2.0/database/credentials")
            .match_header("authorization", "Bearer m2m-token")
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"pg-token"}"#)
            .expect(2)
            .create_async()
            .await;

        let provider = WorkspaceCredentialProvider::new(
            &server.url(),
            WorkspaceAuth::ClientCredentials {
                client_id: "app-id".into(),
                client_secret: "app-secret".into(),
            },
        )
        .unwrap();

        let first = provider.issue_token("db").await.unwrap();
        let second = provider.issue_token("db").await.unwrap();
        assert_eq!(first.token, "pg-token");
        assert!(second.expires_at.is_none());
        oauth.assert_async().await;
        credentials.assert_async().await;
    }
}
