//! Typed values produced by handler queries.

use bytes::Bytes;

use crate::response::Headers;

/// A single column value returned by the executor, tagged with its SQL type.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// `text`, `varchar` and `char` values.
    Text(String),
    /// `bytea` values.
    Bytes(Bytes),
    Json(serde_json::Value),
    Jsonb(serde_json::Value),
    /// `http_header[]` values.
    Headers(Headers),
}

impl Datum {
    /// SQL type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Null => "unknown",
            Datum::Bool(_) => "boolean",
            Datum::Int(_) => "bigint",
            Datum::Float(_) => "double precision",
            Datum::Text(_) => "text",
            Datum::Bytes(_) => "bytea",
            Datum::Json(_) => "json",
            Datum::Jsonb(_) => "jsonb",
            Datum::Headers(_) => "http_header[]",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Text rendering as Postgres would print the value, `None` for null.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Datum::Null => None,
            Datum::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
            Datum::Int(i) => Some(i.to_string()),
            Datum::Float(f) => Some(f.to_string()),
            Datum::Text(s) => Some(s.clone()),
            Datum::Bytes(b) => {
                let mut out = String::with_capacity(2 + b.len() * 2);
                out.push_str("\\x");
                for byte in b.iter() {
                    out.push_str(&format!("{byte:02x}"));
                }
                Some(out)
            }
            Datum::Json(v) | Datum::Jsonb(v) => Some(v.to_string()),
            Datum::Headers(h) => Some(
                h.iter()
                    .map(|t| format!("({},{},{})", t.name, t.value, t.append))
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        }
    }
}
