//! Query-related data models.
//!
//! This module defines bind parameters and the row shape returned by the executor.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

/// Default statement timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// One result row: column name to value, in result-column order.
///
/// NUMERIC values (including `AVG()` and `SUM()` over integers) are exact
/// strings such as `"1.5000"`, not JSON numbers, so no precision is lost.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
///
/// Parameters are always sent to the driver as bind values, never spliced into
/// the SQL text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
}

/// Parse a command-line value: JSON scalars keep their type, anything else is text.
///
/// `90` is an integer, `"90"` (quoted) and `Austin` are strings.
impl FromStr for QueryParam {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str::<QueryParam>(s).unwrap_or_else(|_| Self::String(s.to_string())))
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_conversions() {
        assert_eq!(QueryParam::from(42i64), QueryParam::Int(42));
        assert_eq!(QueryParam::from("hello"), QueryParam::String("hello".to_string()));
    }

    #[test]
    fn test_parse_cli_values() {
        assert_eq!("90".parse::<QueryParam>().unwrap(), QueryParam::Int(90));
        assert_eq!("0.5".parse::<QueryParam>().unwrap(), QueryParam::Float(0.5));
        assert_eq!("true".parse::<QueryParam>().unwrap(), QueryParam::Bool(true));
        assert_eq!("null".parse::<QueryParam>().unwrap(), QueryParam::Null);
        assert_eq!(
            "Austin".parse::<QueryParam>().unwrap(),
            QueryParam::String("Austin".to_string())
        );
        assert_eq!(
            "\"90\"".parse::<QueryParam>().unwrap(),
            QueryParam::String("90".to_string())
        );
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(QueryParam::from(None::<&str>), QueryParam::Null);
        assert_eq!(QueryParam::from(Some(7i64)), QueryParam::Int(7));
    }

    #[test]
    fn test_untagged_serialization() {
        let params = vec![QueryParam::from("Austin"), QueryParam::Int(90)];
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"["Austin",90]"#);
    }
}
