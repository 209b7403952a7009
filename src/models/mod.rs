//! Data models for the Lakebase client.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{
    DEFAULT_DATABASE, DEFAULT_PORT, Endpoint, IssuedToken, PoolConfig, SslMode,
};
pub use query::{DEFAULT_QUERY_TIMEOUT_SECS, QueryParam, Row};
