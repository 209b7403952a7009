//! Postgres to JSON type mappings.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Category-specific decoders handle the actual value extraction
//!
//! Text-format values (the simple protocol) of any type fall back to the
//! server's own rendering. A binary value no decoder understands becomes
//! JSON `null` with a warning.

use crate::models::Row;
use serde_json::Value as JsonValue;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgHasArrayType, PgRow, PgTypeInfo, PgTypeKind, PgValueFormat, PgValueRef};
use sqlx::{Column, Decode, Row as _, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Array,
    Unknown,
}

/// Classify a Postgres type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    match lower.as_str() {
        "numeric" | "decimal" => TypeCategory::Decimal,
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "smallserial"
        | "serial" | "bigserial" => TypeCategory::Integer,
        "float4" | "float8" | "real" | "double precision" => TypeCategory::Float,
        "bool" | "boolean" => TypeCategory::Boolean,
        "text" | "varchar" | "bpchar" | "char" | "name" | "citext" | "character varying" => {
            TypeCategory::Text
        }
        "bytea" => TypeCategory::Binary,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        "timestamp" => TypeCategory::Timestamp,
        "timestamptz" => TypeCategory::TimestampTz,
        "interval" => TypeCategory::Interval,
        // Built-in arrays display as `TEXT[]`, resolved custom ones as `_name`.
        name if name.ends_with("[]") || name.starts_with('_') => TypeCategory::Array,
        _ => TypeCategory::Unknown,
    }
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawDecimal(numeric_to_string(value.as_bytes()?)?)),
        }
    }
}

impl PgHasArrayType for RawDecimal {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("_numeric")
    }

    fn array_compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("NUMERIC[]") || ty.name() == "_numeric"
    }
}

/// Render Postgres' binary NUMERIC encoding as a decimal string.
///
/// Layout: `ndigits:i16, weight:i16, sign:u16, dscale:u16`, then `ndigits`
/// base-10000 digit groups. `weight` is the power of 10000 of the first group.
fn numeric_to_string(buf: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    const POSITIVE: u16 = 0x0000;
    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;
    const POS_INF: u16 = 0xD000;
    const NEG_INF: u16 = 0xF000;

    if buf.len() < 8 {
        return Err("numeric: buffer too short".into());
    }
    let read_u16 = |at: usize| u16::from_be_bytes([buf[at], buf[at + 1]]);
    let ndigits = read_u16(0) as usize;
    let weight = i16::from_be_bytes([buf[2], buf[3]]) as i32;
    let sign = read_u16(4);
    let dscale = read_u16(6) as usize;

    match sign {
        NAN => return Ok("NaN".to_string()),
        POS_INF => return Ok("Infinity".to_string()),
        NEG_INF => return Ok("-Infinity".to_string()),
        POSITIVE | NEGATIVE => {}
        other => return Err(format!("numeric: invalid sign 0x{:04x}", other).into()),
    }
    if buf.len() < 8 + ndigits * 2 {
        return Err("numeric: digit groups truncated".into());
    }

    let digits: Vec<u16> = (0..ndigits).map(|i| read_u16(8 + i * 2)).collect();
    let group = |idx: i32| -> u16 {
        if idx < 0 {
            0
        } else {
            digits.get(idx as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == NEGATIVE {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for idx in 1..=weight {
            out.push_str(&format!("{:04}", group(idx)));
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(idx)));
            idx += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(out)
}

// =============================================================================
// Interval Formatting
// =============================================================================

/// Render an interval the way the server does under the default
/// `IntervalStyle = postgres`, e.g. `1 year 2 mons 3 days 04:05:06.5`.
///
/// Binary and text results of the same query then agree.
pub fn format_interval(interval: &PgInterval) -> String {
    let mut out = String::new();
    // Set once a negative field is printed; a later positive one gets a `+`.
    let mut after_negative = false;

    let years = i64::from(interval.months / 12);
    let months = i64::from(interval.months % 12);
    for (value, unit) in [
        (years, "year"),
        (months, "mon"),
        (i64::from(interval.days), "day"),
    ] {
        if value == 0 {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        if after_negative && value > 0 {
            out.push('+');
        }
        out.push_str(&format!("{} {}", value, unit));
        if value != 1 {
            out.push('s');
        }
        after_negative = value < 0;
    }

    let micros = interval.microseconds;
    if micros != 0 || out.is_empty() {
        if !out.is_empty() {
            out.push(' ');
        }
        if micros < 0 {
            out.push('-');
        } else if after_negative {
            out.push('+');
        }
        let abs = micros.unsigned_abs();
        let secs = abs / 1_000_000;
        let frac = abs % 1_000_000;
        out.push_str(&format!(
            "{:02}:{:02}:{:02}",
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        ));
        if frac > 0 {
            let digits = format!("{:06}", frac);
            out.push('.');
            out.push_str(digits.trim_end_matches('0'));
        }
    }
    out
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Encode binary data as a base64 JSON string.
pub fn decode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Trait for converting database rows to ordered JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> Row;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let category = categorize_type(col.type_info().name());
                let value = postgres::decode_column(self, idx, category);
                (col.name().to_string(), value)
            })
            .collect()
    }

}

// =============================================================================
// Postgres Decoders
// =============================================================================

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        if row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true) {
            return JsonValue::Null;
        }
        match category {
            TypeCategory::Decimal => decode_decimal(row, idx),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => decode_boolean(row, idx),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => decode_binary_col(row, idx),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Uuid => decode_uuid(row, idx),
            TypeCategory::Date => decode_display::<NaiveDate>(row, idx),
            TypeCategory::Time => decode_display::<NaiveTime>(row, idx),
            TypeCategory::Timestamp => decode_timestamp(row, idx),
            TypeCategory::TimestampTz => decode_timestamptz(row, idx),
            TypeCategory::Interval => decode_interval(row, idx),
            TypeCategory::Array => decode_array(row, idx),
            TypeCategory::Text => decode_text(row, idx),
            TypeCategory::Unknown => decode_other(row, idx),
        }
    }

    /// Last resort for a value no typed decoder accepted.
    fn undecodable(row: &PgRow, idx: usize) -> JsonValue {
        let Ok(raw) = row.try_get_raw(idx) else {
            return JsonValue::Null;
        };
        if raw.format() == PgValueFormat::Text {
            if let Ok(text) = raw.as_str() {
                return JsonValue::String(text.to_string());
            }
        }
        let info = raw.type_info();
        tracing::warn!(
            column = idx,
            type_name = %info.name(),
            "Column value could not be decoded, returning null"
        );
        JsonValue::Null
    }

    /// Whether `info` is a resolved enum type.
    fn is_enum(info: &PgTypeInfo) -> bool {
        // Types the connection never looked up display as "?" and carry no kind.
        info.name() != "?" && matches!(info.kind(), PgTypeKind::Enum(_))
    }

    fn decode_other(row: &PgRow, idx: usize) -> JsonValue {
        let is_binary_enum = row
            .try_get_raw(idx)
            .is_ok_and(|raw| raw.format() == PgValueFormat::Binary && is_enum(&raw.type_info()));
        if is_binary_enum {
            // An enum's binary form is its label.
            if let Ok(label) = row.try_get_unchecked::<String, _>(idx) {
                return JsonValue::String(label);
            }
        }
        undecodable(row, idx)
    }

    fn decode_interval(row: &PgRow, idx: usize) -> JsonValue {
        match row.try_get::<PgInterval, _>(idx) {
            Ok(v) => JsonValue::String(format_interval(&v)),
            Err(_) => undecodable(row, idx),
        }
    }

    fn array_of<T>(row: &PgRow, idx: usize, to_json: fn(T) -> JsonValue) -> Option<JsonValue>
    where
        Vec<Option<T>>: for<'r> Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres>,
    {
        let items = row.try_get::<Vec<Option<T>>, _>(idx).ok()?;
        Some(JsonValue::Array(
            items
                .into_iter()
                .map(|item| item.map(to_json).unwrap_or(JsonValue::Null))
                .collect(),
        ))
    }

    fn enum_array(row: &PgRow, idx: usize) -> Option<JsonValue> {
        let raw = row.try_get_raw(idx).ok()?;
        let info = raw.type_info();
        if info.name() == "?" {
            return None;
        }
        match info.kind() {
            PgTypeKind::Array(elem) if is_enum(elem) => {}
            _ => return None,
        }
        let labels = row.try_get_unchecked::<Vec<Option<String>>, _>(idx).ok()?;
        Some(JsonValue::Array(
            labels
                .into_iter()
                .map(|label| label.map(JsonValue::String).unwrap_or(JsonValue::Null))
                .collect(),
        ))
    }

    /// One-dimensional arrays of scalar element types.
    fn decode_array(row: &PgRow, idx: usize) -> JsonValue {
        array_of::<i16>(row, idx, JsonValue::from)
            .or_else(|| array_of::<i32>(row, idx, JsonValue::from))
            .or_else(|| array_of::<i64>(row, idx, JsonValue::from))
            .or_else(|| array_of::<f32>(row, idx, |v| float_json(f64::from(v))))
            .or_else(|| array_of::<f64>(row, idx, float_json))
            .or_else(|| array_of::<bool>(row, idx, JsonValue::Bool))
            .or_else(|| array_of::<RawDecimal>(row, idx, |v| JsonValue::String(v.0)))
            .or_else(|| array_of::<String>(row, idx, JsonValue::String))
            .or_else(|| enum_array(row, idx))
            .unwrap_or_else(|| decode_other(row, idx))
    }

    fn float_json(v: f64) -> JsonValue {
        serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string()))
    }

    fn decode_decimal(row: &PgRow, idx: usize) -> JsonValue {
        match row.try_get::<RawDecimal, _>(idx) {
            Ok(v) => JsonValue::String(v.0),
            Err(e) => {
                tracing::error!("Failed to decode NUMERIC: {:?}", e);
                JsonValue::Null
            }
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return JsonValue::Number(v.into());
        }
        undecodable(row, idx)
    }

    fn decode_boolean(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<bool, _>(idx)
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null)
    }

    fn decode_float(row: &PgRow, idx: usize) -> JsonValue {
        let value = row
            .try_get::<f64, _>(idx)
            .or_else(|_| row.try_get::<f32, _>(idx).map(f64::from));
        match value {
            Ok(v) => float_json(v),
            Err(_) => undecodable(row, idx),
        }
    }

    fn decode_binary_col(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<Vec<u8>, _>(idx)
            .map(|v| decode_binary_value(&v))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_json(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<JsonValue, _>(idx).unwrap_or(JsonValue::Null)
    }

    fn decode_uuid(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<sqlx::types::Uuid, _>(idx)
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_display<T>(row: &PgRow, idx: usize) -> JsonValue
    where
        T: std::fmt::Display + for<'r> Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres>,
    {
        row.try_get::<T, _>(idx)
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_timestamp(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<NaiveDateTime, _>(idx)
            .map(|v| JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_timestamptz(row: &PgRow, idx: usize) -> JsonValue {
        row.try_get::<DateTime<Utc>, _>(idx)
            .map(|v| JsonValue::String(v.to_rfc3339()))
            .unwrap_or(JsonValue::Null)
    }

    fn decode_text(row: &PgRow, idx: usize) -> JsonValue {
        match row.try_get::<String, _>(idx) {
            Ok(v) => JsonValue::String(v),
            Err(_) => undecodable(row, idx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_bytes(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        buf.extend_from_slice(&weight.to_be_bytes());
        buf.extend_from_slice(&sign.to_be_bytes());
        buf.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            buf.extend_from_slice(&d.to_be_bytes());
        }
        buf
    }

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(categorize_type("INT4"), TypeCategory::Integer);
        assert_eq!(categorize_type("INT8"), TypeCategory::Integer);
        assert_eq!(categorize_type("INT2"), TypeCategory::Integer);
    }

    #[test]
    fn test_categorize_interval_is_not_integer() {
        assert_eq!(categorize_type("INTERVAL"), TypeCategory::Interval);
    }

    #[test]
    fn test_categorize_arrays() {
        assert_eq!(categorize_type("TEXT[]"), TypeCategory::Array);
        assert_eq!(categorize_type("INT8[]"), TypeCategory::Array);
        assert_eq!(categorize_type("_quadrant"), TypeCategory::Array);
        assert_eq!(categorize_type("quadrant"), TypeCategory::Unknown);
        assert_eq!(categorize_type("?"), TypeCategory::Unknown);
    }

    fn interval(months: i32, days: i32, microseconds: i64) -> PgInterval {
        PgInterval {
            months,
            days,
            microseconds,
        }
    }

    #[test]
    fn test_format_interval_matches_server_style() {
        assert_eq!(format_interval(&interval(0, 90, 0)), "90 days");
        assert_eq!(format_interval(&interval(0, 1, 0)), "1 day");
        assert_eq!(format_interval(&interval(1, 0, 0)), "1 mon");
        assert_eq!(
            format_interval(&interval(14, 3, 14_706_000_000)),
            "1 year 2 mons 3 days 04:05:06"
        );
        assert_eq!(format_interval(&interval(0, 0, 0)), "00:00:00");
        assert_eq!(format_interval(&interval(0, 0, 1_500_000)), "00:00:01.5");
        assert_eq!(format_interval(&interval(0, 0, 90_000_000_000)), "25:00:00");
    }

    #[test]
    fn test_format_interval_signs() {
        assert_eq!(format_interval(&interval(-12, 0, 0)), "-1 years");
        assert_eq!(
            format_interval(&interval(0, -1, 7_200_000_000)),
            "-1 days +02:00:00"
        );
        assert_eq!(format_interval(&interval(0, 0, -1_000_000)), "-00:00:01");
    }

    #[test]
    fn test_categorize_type_decimal_and_json() {
        assert_eq!(categorize_type("NUMERIC"), TypeCategory::Decimal);
        assert_eq!(categorize_type("JSONB"), TypeCategory::Json);
        assert_eq!(categorize_type("TIMESTAMPTZ"), TypeCategory::TimestampTz);
        assert_eq!(categorize_type("VARCHAR"), TypeCategory::Text);
    }

    #[test]
    fn test_numeric_fraction() {
        let buf = numeric_bytes(0, 0x0000, 2, &[123, 4500]);
        assert_eq!(numeric_to_string(&buf).unwrap(), "123.45");
    }

    #[test]
    fn test_numeric_small_fraction() {
        let buf = numeric_bytes(-1, 0x0000, 3, &[10]);
        assert_eq!(numeric_to_string(&buf).unwrap(), "0.001");
    }

    #[test]
    fn test_numeric_trailing_zero_groups() {
        let buf = numeric_bytes(1, 0x0000, 0, &[1]);
        assert_eq!(numeric_to_string(&buf).unwrap(), "10000");
    }

    #[test]
    fn test_numeric_negative_and_zero() {
        let buf = numeric_bytes(0, 0x4000, 1, &[7, 5000]);
        assert_eq!(numeric_to_string(&buf).unwrap(), "-7.5");
        let zero = numeric_bytes(0, 0x0000, 0, &[]);
        assert_eq!(numeric_to_string(&zero).unwrap(), "0");
    }

    #[test]
    fn test_numeric_special_values() {
        let nan = numeric_bytes(0, 0xC000, 0, &[]);
        assert_eq!(numeric_to_string(&nan).unwrap(), "NaN");
        assert!(numeric_to_string(&[0, 1]).is_err());
    }

    #[test]
    fn test_decode_binary_value() {
        assert_eq!(
            decode_binary_value(b"hello world"),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
        assert_eq!(
            decode_binary_value(&[0xFF, 0xFE, 0x00, 0x01]),
            JsonValue::String("//4AAQ==".to_string())
        );
    }
}
