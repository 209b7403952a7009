//! Lakebase client - command-line entry point.
//!
//! Exercises the connection manager and query executor against a Lakebase
//! instance (or any Postgres with static credentials).

use clap::{Parser, Subcommand};
use lakebase_client::config::Config;
use lakebase_client::credentials;
use lakebase_client::db::{ConnectionManager, QueryExecutor};
use lakebase_client::error::{DbError, DbResult, ErrorResponse};
use lakebase_client::models::QueryParam;
use serde_json::Value as JsonValue;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(
    name = "lakebase-client",
    version,
    about = "Token-authenticated query client for Lakebase Postgres"
)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Lease a probed connection and print the manager status.
    Ping,
    /// Run a query template and print the rows as JSON.
    Query {
        /// SQL template. `{schema}` is replaced with the configured schema.
        sql: String,
        /// Positional bind parameter for `%s` or `$n` markers (repeatable).
        /// JSON scalars keep their type: 90, 1.5, true, null.
        #[arg(long = "param", short = 'p', value_name = "VALUE")]
        params: Vec<QueryParam>,
    },
}

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Logs go to stderr so stdout stays pure JSON.
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn run(
    command: Command,
    manager: &ConnectionManager,
    executor: &QueryExecutor,
) -> DbResult<JsonValue> {
    match command {
        Command::Ping => {
            manager.lease().await?.release();
            serde_json::to_value(manager.status().await)
                .map_err(|e| DbError::internal(format!("Failed to serialize status: {}", e)))
        }
        Command::Query { sql, params } => {
            let rows = executor.execute(&sql, &params).await?;
            Ok(JsonValue::Array(
                rows.into_iter().map(JsonValue::Object).collect(),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from command line and environment
    let cli = Cli::parse();

    init_tracing(&cli.config);

    if let Err(e) = cli.config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::from(2);
    }

    let provider = match credentials::from_config(&cli.config) {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    info!(
        instance = %cli.config.instance_name,
        schema = %cli.config.schema,
        "Starting lakebase-client v{}",
        env!("CARGO_PKG_VERSION")
    );

    let manager = Arc::new(ConnectionManager::postgres(
        provider,
        cli.config.pool_settings(),
    ));
    let executor = QueryExecutor::new(Arc::clone(&manager), cli.config.schema.clone())
        .with_timeout(cli.config.query_timeout_duration());

    let result = tokio::select! {
        result = run(cli.command, &manager, &executor) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted");
            Err(DbError::internal("interrupted"))
        }
    };

    manager.close().await;

    match result {
        Ok(value) => {
            match serde_json::to_string_pretty(&value) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    error!(error = %e, "Failed to serialize output");
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, code = e.code(), "Command failed");
            let body = ErrorResponse::from(&e);
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&body).unwrap_or_else(|_| e.to_string())
            );
            ExitCode::FAILURE
        }
    }
}
