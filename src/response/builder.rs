//! Response materialization.
//!
//! # Responsibilities
//! - Default the status to 200 and the headers to an empty sequence
//! - Convert the typed body into a `Body`, rejecting unsupported types
//! - Infer `content-type` when the handler did not provide one
//!
//! # Design Decisions
//! - Caller headers are never reordered, deduplicated or removed
//! - The inferred header is a tail push with "set" semantics
//! - JSON bodies are always re-encoded to canonical text, with or
//!   without a caller-provided content type

use crate::host::Datum;
use crate::response::body::{Body, UnsupportedBodyType};
use crate::response::headers::{HeaderTriple, Headers, CONTENT_TYPE};

/// Status used when the handler returns none.
pub const DEFAULT_STATUS: i32 = 200;

/// The raw `(status, headers, body)` triple returned by a handler query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseParts {
    pub status: Option<i32>,
    pub headers: Option<Headers>,
    pub body: Option<Datum>,
}

impl ResponseParts {
    pub fn new(status: Option<i32>, headers: Option<Headers>, body: Option<Datum>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

/// A fully populated response ready for the wire serializer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRecord {
    pub status: i32,
    pub headers: Headers,
    /// `None` when the handler returned a null body.
    pub body: Option<Body>,
}

/// Build a response record from handler output.
pub fn build_response(parts: ResponseParts) -> Result<ResponseRecord, UnsupportedBodyType> {
    let status = parts.status.unwrap_or(DEFAULT_STATUS);
    let mut headers = parts.headers.unwrap_or_default();

    let body = match parts.body {
        None | Some(Datum::Null) => {
            return Ok(ResponseRecord {
                status,
                headers,
                body: None,
            })
        }
        Some(datum) => Body::try_from(datum)?,
    };

    if !headers.contains(CONTENT_TYPE) {
        headers.push(HeaderTriple::set(CONTENT_TYPE, body.infer_content_type()));
    }

    Ok(ResponseRecord {
        status,
        headers,
        body: Some(body.canonicalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::body::{BINARY_CONTENT_TYPE, JSON_CONTENT_TYPE, TEXT_CONTENT_TYPE};
    use bytes::Bytes;
    use serde_json::json;

    fn content_types(record: &ResponseRecord) -> Vec<&str> {
        record.headers.values(CONTENT_TYPE).collect()
    }

    #[test]
    fn defaults_for_all_null_input() {
        let record = build_response(ResponseParts::default()).unwrap();
        assert_eq!(record.status, 200);
        assert!(record.headers.is_empty());
        assert!(record.body.is_none());
    }

    #[test]
    fn null_body_adds_no_content_type() {
        let parts = ResponseParts::new(Some(204), None, Some(Datum::Null));
        let record = build_response(parts).unwrap();
        assert_eq!(record.status, 204);
        assert!(record.headers.is_empty());
        assert!(record.body.is_none());
    }

    #[test]
    fn text_body_infers_plain_text() {
        let parts = ResponseParts::new(Some(200), None, Some(Datum::Text("hello".into())));
        let record = build_response(parts).unwrap();
        assert_eq!(content_types(&record), vec![TEXT_CONTENT_TYPE]);
        assert_eq!(record.body, Some(Body::Text("hello".into())));
        assert!(!record.headers.iter().next().unwrap().append);
    }

    #[test]
    fn bytes_body_infers_octet_stream() {
        let parts = ResponseParts::new(None, None, Some(Datum::Bytes(Bytes::from_static(b"\x01\x02"))));
        let record = build_response(parts).unwrap();
        assert_eq!(content_types(&record), vec![BINARY_CONTENT_TYPE]);
    }

    #[test]
    fn json_body_is_reencoded() {
        let parts = ResponseParts::new(None, None, Some(Datum::Jsonb(json!({"a": 1}))));
        let record = build_response(parts).unwrap();
        assert_eq!(content_types(&record), vec![JSON_CONTENT_TYPE]);
        assert_eq!(record.body, Some(Body::Text(r#"{"a":1}"#.into())));
    }

    #[test]
    fn caller_content_type_is_kept_untouched() {
        let headers: Headers = vec![
            HeaderTriple::add("x-first", "1"),
            HeaderTriple::set("Content-Type", "application/xml"),
        ]
        .into();
        let parts = ResponseParts::new(None, Some(headers.clone()), Some(Datum::Text("<x/>".into())));
        let record = build_response(parts).unwrap();
        assert_eq!(record.headers, headers);
    }

    #[test]
    fn caller_content_type_still_gets_canonical_json() {
        let headers: Headers = vec![HeaderTriple::set("content-type", "application/json")].into();
        let parts = ResponseParts::new(None, Some(headers), Some(Datum::Json(json!([1, 2]))));
        let record = build_response(parts).unwrap();
        assert_eq!(content_types(&record), vec!["application/json"]);
        assert_eq!(record.body, Some(Body::Text("[1,2]".into())));
    }

    #[test]
    fn inferred_header_goes_to_the_tail() {
        let headers: Headers = vec![
            HeaderTriple::add("x-a", "1"),
            HeaderTriple::add("x-a", "2"),
        ]
        .into();
        let parts = ResponseParts::new(None, Some(headers), Some(Datum::Text("t".into())));
        let record = build_response(parts).unwrap();
        let names: Vec<_> = record.headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["x-a", "x-a", CONTENT_TYPE]);
    }

    #[test]
    fn unsupported_body_is_an_error() {
        let parts = ResponseParts::new(None, None, Some(Datum::Bool(true)));
        let err = build_response(parts).unwrap_err();
        assert_eq!(err.type_name, "boolean");
    }
}
