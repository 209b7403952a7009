//! SQL template rendering.
//!
//! Templates carry one trusted slot, `{schema}`, filled from configuration.
//! `{{` and `}}` produce literal braces. Untrusted values never touch the
//! text: `%s` placeholders become `$1..$n` bind markers.

use crate::error::{DbError, DbResult};
use std::fmt::Write as _;

/// The only named slot a template may contain.
pub const SCHEMA_SLOT: &str = "schema";

/// Substitute `{schema}` and unescape doubled braces.
pub fn render_schema(template: &str, schema: &str) -> DbResult<String> {
    let mut out = String::with_capacity(template.len() + schema.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("{{") {
            out.push('{');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("}}") {
            out.push('}');
            rest = after;
        } else if tail.starts_with('{') {
            let end = tail
                .find('}')
                .ok_or_else(|| DbError::invalid_input("Unmatched '{' in query template"))?;
            let slot = &tail[1..end];
            if slot != SCHEMA_SLOT {
                return Err(DbError::invalid_input(format!(
                    "Unknown query template slot '{{{}}}'",
                    slot
                )));
            }
            out.push_str(schema);
            rest = &tail[end + 1..];
        } else {
            return Err(DbError::invalid_input("Unmatched '}' in query template"));
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Rewrite `%s` placeholders to `$1..$n` and `%%` to `%`.
///
/// Quoted literals, quoted identifiers, dollar-quoted bodies and comments are
/// left untouched. SQL without any `%s` is returned as-is so native `$n`
/// markers keep working. Otherwise the placeholder count must equal
/// `param_count`.
pub fn rewrite_placeholders(sql: &str, param_count: usize) -> DbResult<String> {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut out = String::with_capacity(len + 8);
    let mut found = 0usize;
    let mut copied = 0usize;
    let mut i = 0usize;

    while i < len {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i = skip_quoted(bytes, i + 1, quote);
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = find_from(sql, i + 2, "\n").map_or(len, |p| p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find_from(sql, i + 2, "*/").map_or(len, |p| p + 2);
            }
            b'$' => match dollar_tag(&sql[i..]) {
                Some(tag) => {
                    let body = i + tag.len();
                    i = find_from(sql, body, tag).map_or(len, |p| p + tag.len());
                }
                None => i += 1,
            },
            b'%' => match bytes.get(i + 1) {
                Some(b's') => {
                    found += 1;
                    out.push_str(&sql[copied..i]);
                    let _ = write!(out, "${}", found);
                    i += 2;
                    copied = i;
                }
                Some(b'%') => {
                    out.push_str(&sql[copied..i]);
                    out.push('%');
                    i += 2;
                    copied = i;
                }
                _ => i += 1,
            },
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);

    if found > 0 && found != param_count {
        return Err(DbError::invalid_input(format!(
            "Query has {} placeholder(s) but {} parameter(s) were supplied",
            found, param_count
        )));
    }
    Ok(out)
}

/// Render a template into the exact SQL text sent to the server.
pub fn prepare(template: &str, schema: &str, param_count: usize) -> DbResult<String> {
    let sql = render_schema(template, schema)?;
    if param_count == 0 {
        return Ok(sql);
    }
    rewrite_placeholders(&sql, param_count)
}

/// Index just past the closing `quote`, honouring doubled-quote escapes.
fn skip_quoted(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn find_from(haystack: &str, from: usize, needle: &str) -> Option<usize> {
    haystack.get(from..)?.find(needle).map(|p| p + from)
}

/// `$tag$` or `$$` at the start of `s`. `$1` is a bind marker, not a tag.
fn dollar_tag(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    match bytes.get(1) {
        Some(b'$') => return Some(&s[..2]),
        Some(c) if c.is_ascii_alphabetic() || *c == b'_' => {}
        _ => return None,
    }
    let end = bytes[1..]
        .iter()
        .position(|c| !(c.is_ascii_alphanumeric() || *c == b'_'))?
        + 1;
    (bytes[end] == b'$').then(|| &s[..=end])
}
