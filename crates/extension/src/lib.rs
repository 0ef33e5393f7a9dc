//! Extension and type system for the ASDF engine
//!
//! Defines the pluggable surfaces (`Converter`, `Extension`, custom schema
//! keyword validators, compressors via `asdf-blocks`), manifest-driven
//! extensions, the registry that indexes converters by tag URI and native
//! type with deferred type resolution, and the per-operation serialization
//! context that threads block access through converters.

pub mod context;
pub mod converter;
pub mod extension;
pub mod manifest;
pub mod registry;
pub mod tag_def;

pub use context::SerializationContext;
pub use converter::{ConversionResult, Converter, FinalizeFn, TypeRef};
pub use extension::{order_extensions, Extension, ExtensionEntry};
pub use manifest::ManifestExtension;
pub use registry::{ConverterEntry, ExtensionRegistry};
pub use tag_def::TagDefinition;

// The validator trait lives in asdf-schema so the schema engine does not
// depend on this crate; re-export it under the name extensions use.
pub use asdf_schema::CustomKeyword as Validator;
