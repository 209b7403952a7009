//! Lakebase client library.
//!
//! Token-authenticated Postgres access for the dashboard backend: a
//! connection manager that mints short-lived credentials, pools connections
//! and recovers once from connectivity failures, plus a query executor that
//! renders `{schema}` templates and binds parameters positionally.

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use credentials::CredentialProvider;
pub use db::{ConnectionManager, QueryExecutor};
pub use error::{DbError, DbResult};
