//! The built-in core extension: schemas, manifest, converters and
//! validators for the objects every ASDF file can contain.

use std::sync::Arc;

use asdf_core::constants::STSCI_TAG_PREFIX;
use asdf_core::Result;
use asdf_extension::{ExtensionEntry, ExtensionRegistry, ManifestExtension};
use asdf_schema::{InMemoryResourceProvider, ResourceStore};

use crate::entities::{
    ComplexConverter, ConstantConverter, ExtensionMetadataConverter, HistoryEntryConverter,
    SoftwareConverter,
};
use crate::ndarray::validators::{DatatypeValidator, MaxNdimValidator, NdimValidator};
use crate::ndarray::NdArrayConverter;

/// URI of the built-in core extension.
pub const CORE_EXTENSION_URI: &str = "asdf://asdf-format.org/core/extensions/core-1.5.0";

/// URI of the built-in core manifest.
pub const CORE_MANIFEST_URI: &str = "asdf://asdf-format.org/core/manifests/core-1.5.0";

/// Tag URI of the top-level ASDF object.
pub const ASDF_OBJECT_TAG: &str = "tag:stsci.edu:asdf/core/asdf-1.1.0";

const SCHEMA_URI_BASE: &str = "http://stsci.edu/schemas/asdf/core/";

const CORE_SCHEMAS: &[(&str, &str)] = &[
    ("asdf-1.1.0", include_str!("resources/schemas/core/asdf-1.1.0.yaml")),
    ("ndarray-1.0.0", include_str!("resources/schemas/core/ndarray-1.0.0.yaml")),
    ("complex-1.0.0", include_str!("resources/schemas/core/complex-1.0.0.yaml")),
    ("constant-1.0.0", include_str!("resources/schemas/core/constant-1.0.0.yaml")),
    ("software-1.0.0", include_str!("resources/schemas/core/software-1.0.0.yaml")),
    ("history_entry-1.0.0", include_str!("resources/schemas/core/history_entry-1.0.0.yaml")),
    (
        "extension_metadata-1.0.0",
        include_str!("resources/schemas/core/extension_metadata-1.0.0.yaml"),
    ),
];

const CORE_MANIFEST: &str = include_str!("resources/manifests/core-1.5.0.yaml");

/// Provider serving the built-in schemas and manifest.
pub fn core_resource_provider() -> InMemoryResourceProvider {
    let mut provider = InMemoryResourceProvider::new();
    for (name, content) in CORE_SCHEMAS {
        provider.insert(format!("{}{}", SCHEMA_URI_BASE, name), content.as_bytes().to_vec());
    }
    provider.insert(CORE_MANIFEST_URI, CORE_MANIFEST.as_bytes().to_vec());
    provider
}

/// Resource store with the built-in provider (and the metaschema).
pub fn default_resource_store() -> ResourceStore {
    let mut store = ResourceStore::new();
    store.push(Arc::new(core_resource_provider()));
    store
}

/// The built-in core extension, assembled from its manifest.
pub fn core_extension(store: &ResourceStore) -> Result<ManifestExtension> {
    Ok(ManifestExtension::from_uri(store, CORE_MANIFEST_URI)?
        .with_converters(vec![
            Arc::new(NdArrayConverter),
            Arc::new(ComplexConverter),
            Arc::new(ConstantConverter),
            Arc::new(SoftwareConverter),
            Arc::new(HistoryEntryConverter),
            Arc::new(ExtensionMetadataConverter),
        ])
        .with_validators(vec![
            Arc::new(NdimValidator),
            Arc::new(MaxNdimValidator),
            Arc::new(DatatypeValidator),
        ])
        .with_tag_handle("!", STSCI_TAG_PREFIX))
}

/// Registry with the built-in extension plus caller-supplied extensions,
/// in the documented precedence order (user extensions first, built-in
/// last).
pub fn build_registry(
    store: &ResourceStore,
    user_extensions: Vec<ExtensionEntry>,
) -> Result<ExtensionRegistry> {
    let builtin = ExtensionEntry::from_package(
        Arc::new(core_extension(store)?),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );
    let ordered = asdf_extension::order_extensions(user_extensions, Vec::new(), vec![builtin]);
    Ok(ExtensionRegistry::from_extensions(ordered))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_schemas_resolve() {
        let store = default_resource_store();
        for (name, _) in CORE_SCHEMAS {
            assert!(store.contains(&format!("{}{}", SCHEMA_URI_BASE, name)), "{}", name);
        }
        assert!(store.contains(CORE_MANIFEST_URI));
    }

    #[test]
    fn test_registry_indexes_core_tags() {
        let store = default_resource_store();
        let registry = build_registry(&store, Vec::new()).unwrap();
        assert!(registry.handles_tag("tag:stsci.edu:asdf/core/ndarray-1.0.0"));
        assert!(registry.handles_tag_definition("tag:stsci.edu:asdf/core/software-1.0.0"));
        let def = registry.tag_definition("tag:stsci.edu:asdf/core/ndarray-1.0.0").unwrap();
        assert_eq!(
            def.schema_uris(),
            &["http://stsci.edu/schemas/asdf/core/ndarray-1.0.0".to_string()]
        );
        assert!(registry.validators().handles("ndim"));
    }

    #[test]
    fn test_core_schemas_parse_as_yaml() {
        for (name, content) in CORE_SCHEMAS {
            let parsed: std::result::Result<serde_json::Value, _> = serde_yaml::from_str(content);
            assert!(parsed.is_ok(), "schema {} failed to parse", name);
        }
    }
}
