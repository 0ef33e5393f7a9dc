//! Schema layer for the ASDF engine
//!
//! Provides the resource store (URI → bytes providers for schemas and
//! manifests), the schema loader and cache, a JSON Schema draft-04
//! validation walker over tagged trees with custom-keyword hooks, and
//! default filling/stripping.

pub mod engine;
pub mod loader;
pub mod resource;
pub mod validator;

pub use engine::{SchemaEngine, TagSchemaResolver, TreeValidationOutcome};
pub use loader::{resolve_pointer, SchemaLoader};
pub use resource::{
    metaschema_provider, DirectoryResourceProvider, InMemoryResourceProvider, ResourceProvider,
    ResourceStore, DRAFT04_URI,
};
pub use validator::{
    json_to_node, node_matches_json, CustomKeyword, SchemaValidator, ValidationError, ValidatorSet,
};
