//! Parameter binding for parameterized queries.
//!
//! Values travel to the server as bind parameters. The SQL text never sees them.

use crate::models::QueryParam;
use sqlx::Postgres;
use sqlx::postgres::PgArguments;

/// Bind a parameter to a PostgreSQL query.
///
/// Strings are sent as `TEXT`. Comparing against a non-text column needs an
/// explicit cast in the SQL (`$1::date`).
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
    }
}

/// Bind every parameter in order.
pub(crate) fn bind_all<'q>(
    sql: &'q str,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_postgres_param(query, param))
}
