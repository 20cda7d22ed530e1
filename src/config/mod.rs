//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, seed handler compilation)
//!     → HttpdConfig (validated, immutable)
//!     → handed to the supervisor
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → supervisor receives the new config (worker count, timings)
//!     → seed handlers are replayed into the handler table
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{FleetConfig, HttpdConfig, ListenerConfig, ObservabilityConfig, ReloadConfig};
pub use validation::{validate_config, ConfigurationError};
pub use watcher::ConfigWatcher;
