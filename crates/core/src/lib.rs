//! Core types and traits for the ASDF engine
//!
//! This crate defines the foundational types used throughout the workspace:
//! - AsdfError / ErrorKind: the unified error taxonomy
//! - TaggedNode: the tagged YAML tree (every node keeps its tag)
//! - AsdfValue / NativeObject: the native tree after tag resolution
//! - BlockStorage / ByteOrder: shared enums for the block layer
//! - AsdfConfig: global configuration with thread-local scoped overrides
//! - Diagnostics: non-fatal problem accumulation
//! - File format constants and tag URI helpers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod constants;
pub mod diagnostics;
pub mod error;
pub mod node;
pub mod tag;
pub mod types;
pub mod value;

pub use config::{config_context, get_config, set_global_config, update_config, AsdfConfig, ConfigScope};
pub use diagnostics::{Diagnostic, Diagnostics};
pub use error::{AsdfError, ErrorKind, Pointer, Result};
pub use node::{FlowStyle, NodeValue, PathSegment, StringStyle, TaggedNode, TreePath};
pub use tag::{parse_version_triple, split_tag_version, tag_pattern, uri_match, validate_version};
pub use types::{BlockStorage, ByteOrder};
pub use value::{AsdfValue, NativeObject};
