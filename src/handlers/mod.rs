//! Handler table model, snapshots and validation.
//!
//! # Data Flow
//! ```text
//! control plane write
//!     → validator.rs (pre-commit: parse, inject `request`, resolve names)
//!     → handler table
//!
//! reload cycle
//!     → model.rs (compile rows)
//!     → snapshot.rs (group, order, version)
//!     → SnapshotPublisher (pointer swap read by every worker)
//! ```

pub mod model;
pub mod snapshot;
pub mod validator;

pub use model::{Handler, HandlerId, HandlerRow, ListenAddress, MethodSet, PathPattern};
pub use snapshot::{HandlerSnapshot, SnapshotPublisher};
pub use validator::{validate, validate_nullable, BuiltinCatalog, Catalog, ValidationError};
