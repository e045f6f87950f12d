//! core
//!
//! Domain types shared by every other layer.
//!
//! # Modules
//!
//! - [`path`] - Hierarchical node addresses with a total order
//! - [`types`] - Validated item and type names
//! - [`config`] - Engine configuration schema and loading

pub mod config;
pub mod path;
pub mod types;

pub use config::{ConfigError, EngineConfig};
pub use path::{NodePath, PathError, PathSegment};
pub use types::{ItemName, TypeName, TypeNameError};
