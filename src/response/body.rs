//! Response body variants, content-type inference and encoding.

use bytes::Bytes;

use crate::host::Datum;

/// `content-type` inferred for textual bodies.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
/// `content-type` inferred for opaque byte bodies.
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";
/// `content-type` inferred for JSON bodies.
pub const JSON_CONTENT_TYPE: &str = "text/json";

/// Raised when a handler returns a body of a type that has no encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported-body-type: can't (yet) encode {type_name} as a response body")]
pub struct UnsupportedBodyType {
    pub type_name: &'static str,
}

/// A response body awaiting encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl Body {
    /// Content type assumed when the handler did not set one.
    pub fn infer_content_type(&self) -> &'static str {
        match self {
            Body::Text(_) => TEXT_CONTENT_TYPE,
            Body::Bytes(_) => BINARY_CONTENT_TYPE,
            Body::Json(_) => JSON_CONTENT_TYPE,
        }
    }

    /// Replace a structured JSON value with its canonical text form.
    pub fn canonicalize(self) -> Body {
        match self {
            Body::Json(value) => Body::Text(value.to_string()),
            other => other,
        }
    }

    /// Bytes as written on the wire.
    pub fn encode(self) -> Bytes {
        match self {
            Body::Text(text) => Bytes::from(text),
            Body::Bytes(bytes) => bytes,
            Body::Json(value) => Bytes::from(value.to_string()),
        }
    }
}

impl TryFrom<Datum> for Body {
    type Error = UnsupportedBodyType;

    fn try_from(datum: Datum) -> Result<Self, Self::Error> {
        match datum {
            Datum::Text(text) => Ok(Body::Text(text)),
            Datum::Bytes(bytes) => Ok(Body::Bytes(bytes)),
            // json and jsonb are treated alike
            Datum::Json(value) | Datum::Jsonb(value) => Ok(Body::Json(value)),
            other => Err(UnsupportedBodyType {
                type_name: other.type_name(),
            }),
        }
    }
}
