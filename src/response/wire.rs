//! Serialization of a response record into an HTTP response.
//!
//! Headers are applied in insertion order: `append=true` adds a value next
//! to earlier ones, `append=false` replaces every earlier value of the same
//! (case-insensitive) name.

use axum::body::Body as HttpBody;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, Response, StatusCode};

use crate::response::builder::ResponseRecord;
use crate::response::headers::Headers;

/// Errors turning a record into wire format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("invalid status code {0}")]
    InvalidStatus(i32),
    #[error("invalid header name {0:?}")]
    InvalidHeaderName(String),
    #[error("invalid value for header {0:?}")]
    InvalidHeaderValue(String),
}

/// Apply a header sequence to a header map.
pub fn apply_headers(headers: &Headers, map: &mut HeaderMap) -> Result<(), WireError> {
    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| WireError::InvalidHeaderName(header.name.clone()))?;
        let value = HeaderValue::from_str(&header.value)
            .map_err(|_| WireError::InvalidHeaderValue(header.name.clone()))?;
        if header.append {
            map.append(name, value);
        } else {
            map.insert(name, value);
        }
    }
    Ok(())
}

/// Convert a record into a response with the library's default reason phrase.
pub fn into_http_response(record: ResponseRecord) -> Result<Response<HttpBody>, WireError> {
    let status = u16::try_from(record.status)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(WireError::InvalidStatus(record.status))?;

    let body = match record.body {
        Some(body) => HttpBody::from(body.encode()),
        None => HttpBody::empty(),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    apply_headers(&record.headers, response.headers_mut())?;
    Ok(response)
}
