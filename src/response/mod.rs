//! Response materialization subsystem.
//!
//! # Data Flow
//! ```text
//! handler row (status?, headers?, body?)
//!     → builder.rs (defaults, body typing, content-type inference)
//!     → ResponseRecord
//!     → wire.rs (status line, header set/add semantics, body bytes)
//!     → hyper response
//! ```

pub mod body;
pub mod builder;
pub mod headers;
pub mod wire;

pub use body::{Body, UnsupportedBodyType};
pub use builder::{build_response, ResponseParts, ResponseRecord};
pub use headers::{HeaderTriple, Headers, CONTENT_TYPE};
pub use wire::{into_http_response, WireError};
