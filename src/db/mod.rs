//! Database layer.
//!
//! This module provides database access functionality:
//! - Token-authenticated connection pool management with one-shot recovery
//! - The driver seam (`Connector` / `Session`) and its sqlx Postgres backend
//! - Query templating and execution
//! - Type mappings

pub mod backend;
pub mod executor;
pub mod params;
pub mod pool;
pub mod template;
pub mod types;

pub use backend::{Connector, PgConnector, PoolStats, Session};
pub use executor::QueryExecutor;
pub use pool::{ConnectionManager, LeasedConnection, ManagerStatus};
