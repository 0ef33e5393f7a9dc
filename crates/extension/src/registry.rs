//! Indexing of enabled extensions by tag and native type.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use asdf_blocks::CompressorRegistry;
use asdf_core::{uri_match, AsdfError, NativeObject, Result};
use asdf_schema::ValidatorSet;

use crate::converter::{Converter, TypeRef};
use crate::extension::ExtensionEntry;
use crate::tag_def::TagDefinition;

/// A converter together with the extension that contributed it, so uses
/// can be recorded in file history.
#[derive(Clone)]
pub struct ConverterEntry {
    /// The converter implementation.
    pub converter: Arc<dyn Converter>,
    /// URI of the extension this converter came from.
    pub extension_uri: String,
}

/// Immutable snapshot of the enabled extensions, indexed for lookup.
///
/// Extensions earlier in the list take precedence: the first claim on a
/// tag or type wins, and a conflicting later claim is reported once as a
/// warning.
pub struct ExtensionRegistry {
    extensions: Vec<ExtensionEntry>,
    tag_defs: HashMap<String, TagDefinition>,
    converters_by_tag: HashMap<String, ConverterEntry>,
    /// Converter tag patterns with a trailing `*`, in precedence order.
    wildcard_converters: Vec<(String, ConverterEntry)>,
    converters_by_type: RwLock<HashMap<TypeId, ConverterEntry>>,
    /// Deferred class-path registrations, lifted on first visible lookup.
    converters_by_type_name: RwLock<HashMap<String, ConverterEntry>>,
    validators: ValidatorSet,
    compressors: CompressorRegistry,
}

impl ExtensionRegistry {
    /// Build the indexes from extensions already in precedence order
    /// (user first, third-party alphabetical, built-in last).
    pub fn from_extensions(extensions: Vec<ExtensionEntry>) -> Self {
        let mut tag_defs: HashMap<String, TagDefinition> = HashMap::new();
        let mut converters_by_tag: HashMap<String, ConverterEntry> = HashMap::new();
        let mut wildcard_converters: Vec<(String, ConverterEntry)> = Vec::new();
        let mut by_type: HashMap<TypeId, ConverterEntry> = HashMap::new();
        let mut by_type_name: HashMap<String, ConverterEntry> = HashMap::new();
        let mut validators = ValidatorSet::new();
        let mut compressors = CompressorRegistry::new();

        for entry in &extensions {
            let extension = &entry.extension;
            let extension_uri = extension.extension_uri().to_string();

            for tag_def in extension.tags() {
                if !tag_defs.contains_key(tag_def.tag_uri()) {
                    tag_defs.insert(tag_def.tag_uri().to_string(), tag_def);
                }
            }

            for converter in extension.converters() {
                let conv_entry = ConverterEntry {
                    converter: Arc::clone(&converter),
                    extension_uri: extension_uri.clone(),
                };
                for tag in converter.tags() {
                    if tag.ends_with('*') {
                        wildcard_converters.push((tag.clone(), conv_entry.clone()));
                        // Expand the pattern against this extension's own
                        // concrete tag definitions.
                        for tag_def in extension.tags() {
                            if uri_match(&tag, tag_def.tag_uri())
                                && !converters_by_tag.contains_key(tag_def.tag_uri())
                            {
                                converters_by_tag
                                    .insert(tag_def.tag_uri().to_string(), conv_entry.clone());
                            }
                        }
                    } else if let Some(previous) = converters_by_tag.get(&tag) {
                        if !Arc::ptr_eq(&previous.converter, &converter) {
                            warn!(
                                tag = %tag,
                                extension = %extension_uri,
                                "tag already claimed by an earlier extension, ignoring"
                            );
                        }
                    } else {
                        converters_by_tag.insert(tag.clone(), conv_entry.clone());
                    }
                }
                for type_ref in converter.types() {
                    match type_ref {
                        TypeRef::Resolved(type_id) => {
                            by_type.entry(type_id).or_insert_with(|| conv_entry.clone());
                        }
                        TypeRef::Deferred(name) => {
                            by_type_name.entry(name).or_insert_with(|| conv_entry.clone());
                        }
                    }
                }
            }

            for validator in extension.validators() {
                validators.add(validator);
            }
            for compressor in extension.compressors() {
                compressors.register(compressor);
            }
        }

        ExtensionRegistry {
            extensions,
            tag_defs,
            converters_by_tag,
            wildcard_converters,
            converters_by_type: RwLock::new(by_type),
            converters_by_type_name: RwLock::new(by_type_name),
            validators,
            compressors,
        }
    }

    /// The enabled extensions, in precedence order.
    pub fn extensions(&self) -> &[ExtensionEntry] {
        &self.extensions
    }

    /// `true` when some enabled extension carries `extension_uri`.
    pub fn has_extension(&self, extension_uri: &str) -> bool {
        self.extensions
            .iter()
            .any(|e| e.extension.extension_uri() == extension_uri)
    }

    /// The entry for `extension_uri`, when enabled.
    pub fn extension(&self, extension_uri: &str) -> Option<&ExtensionEntry> {
        self.extensions
            .iter()
            .find(|e| e.extension.extension_uri() == extension_uri)
    }

    /// `true` when the tag has a definition.
    pub fn handles_tag_definition(&self, tag: &str) -> bool {
        self.tag_defs.contains_key(tag)
    }

    /// The definition for a tag URI.
    pub fn tag_definition(&self, tag: &str) -> Result<&TagDefinition> {
        self.tag_defs.get(tag).ok_or_else(|| AsdfError::UnknownTag {
            tag: tag.to_string(),
        })
    }

    /// Schema URIs for a tag, or `None` when the tag has no definition.
    pub fn schema_uris_for_tag(&self, tag: &str) -> Option<Vec<String>> {
        self.tag_defs.get(tag).map(|d| d.schema_uris().to_vec())
    }

    /// `true` when a converter handles the tag.
    pub fn handles_tag(&self, tag: &str) -> bool {
        self.converters_by_tag.contains_key(tag)
            || self.wildcard_converters.iter().any(|(p, _)| uri_match(p, tag))
    }

    /// The converter for a tag URI.
    pub fn converter_for_tag(&self, tag: &str) -> Result<ConverterEntry> {
        if let Some(entry) = self.converters_by_tag.get(tag) {
            return Ok(entry.clone());
        }
        for (pattern, entry) in &self.wildcard_converters {
            if uri_match(pattern, tag) {
                return Ok(entry.clone());
            }
        }
        Err(AsdfError::UnknownTag { tag: tag.to_string() })
    }

    /// `true` when a converter handles values like `obj`.
    pub fn handles_type(&self, obj: &NativeObject) -> bool {
        self.converter_for_object(obj).is_ok()
    }

    /// The converter for a native object, lifting a deferred class-path
    /// registration the first time the type is seen.
    pub fn converter_for_object(&self, obj: &NativeObject) -> Result<ConverterEntry> {
        let type_id = obj.concrete_type_id();
        if let Some(entry) = self.converters_by_type.read().get(&type_id) {
            return Ok(entry.clone());
        }
        let lifted = self.converters_by_type_name.write().remove(obj.type_name());
        if let Some(entry) = lifted {
            self.converters_by_type
                .write()
                .entry(type_id)
                .or_insert_with(|| entry.clone());
            return Ok(entry);
        }
        Err(AsdfError::Value(format!(
            "no support available for native type '{}'; you may need to enable an extension",
            obj.type_name()
        )))
    }

    /// The custom schema keyword validators from every extension.
    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// The compressors from every extension.
    pub fn compressors(&self) -> &CompressorRegistry {
        &self.compressors
    }

    /// The concrete tags a converter claims, used by `select_tag`.
    pub fn concrete_tags_for_converter(&self, converter: &Arc<dyn Converter>) -> Vec<String> {
        let mut tags = Vec::new();
        for tag in converter.tags() {
            if tag.ends_with('*') {
                let mut matching: Vec<String> = self
                    .tag_defs
                    .keys()
                    .filter(|uri| uri_match(&tag, uri))
                    .cloned()
                    .collect();
                matching.sort();
                for uri in matching {
                    if !tags.contains(&uri) {
                        tags.push(uri);
                    }
                }
            } else if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        tags
    }

    /// Union of the YAML tag handles declared by every extension; the
    /// earliest declaration of a handle wins.
    pub fn yaml_tag_handles(&self) -> Vec<(String, String)> {
        let mut seen = std::collections::HashSet::new();
        let mut handles = Vec::new();
        for entry in &self.extensions {
            for (handle, prefix) in entry.extension.yaml_tag_handles() {
                if seen.insert(handle.clone()) {
                    handles.push((handle, prefix));
                }
            }
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::ConversionResult;
    use crate::extension::Extension;
    use asdf_core::AsdfValue;

    struct UnitConverter {
        tags: Vec<String>,
        label: &'static str,
    }

    impl Converter for UnitConverter {
        fn tags(&self) -> Vec<String> {
            self.tags.clone()
        }
        fn types(&self) -> Vec<TypeRef> {
            vec![TypeRef::of::<u32>()]
        }
        fn to_yaml_tree(
            &self,
            _obj: &NativeObject,
            _tag: &str,
            _ctx: &mut crate::context::SerializationContext<'_>,
        ) -> Result<AsdfValue> {
            Ok(AsdfValue::String(self.label.to_string()))
        }
        fn from_yaml_tree(
            &self,
            _node: &AsdfValue,
            _tag: &str,
            _ctx: &mut crate::context::SerializationContext<'_>,
        ) -> Result<ConversionResult> {
            Ok(ConversionResult::Complete(AsdfValue::String(self.label.to_string())))
        }
    }

    struct TestExtension {
        uri: &'static str,
        converters: Vec<Arc<dyn Converter>>,
        tags: Vec<TagDefinition>,
    }

    impl Extension for TestExtension {
        fn extension_uri(&self) -> &str {
            self.uri
        }
        fn tags(&self) -> Vec<TagDefinition> {
            self.tags.clone()
        }
        fn converters(&self) -> Vec<Arc<dyn Converter>> {
            self.converters.clone()
        }
    }

    fn entry(uri: &'static str, tag: &str, label: &'static str) -> ExtensionEntry {
        ExtensionEntry::new(Arc::new(TestExtension {
            uri,
            converters: vec![Arc::new(UnitConverter {
                tags: vec![tag.to_string()],
                label,
            })],
            tags: vec![TagDefinition::new(tag).unwrap()],
        }))
    }

    #[test]
    fn test_first_extension_wins_tag() {
        let registry = ExtensionRegistry::from_extensions(vec![
            entry("asdf://u/ext-1.0.0", "tag:example.com/thing-1.0.0", "user"),
            entry("asdf://b/ext-1.0.0", "tag:example.com/thing-1.0.0", "builtin"),
        ]);
        let entry = registry.converter_for_tag("tag:example.com/thing-1.0.0").unwrap();
        assert_eq!(entry.extension_uri, "asdf://u/ext-1.0.0");

        let obj = NativeObject::new(5u32);
        let by_type = registry.converter_for_object(&obj).unwrap();
        assert_eq!(by_type.extension_uri, "asdf://u/ext-1.0.0");
        let mut blocks = asdf_blocks::BlockManager::new();
        let mut ctx = crate::context::SerializationContext::for_serialization(
            "1.5.0".to_string(),
            None,
            &registry,
            &mut blocks,
        );
        let node = by_type
            .converter
            .to_yaml_tree(&obj, "tag:example.com/thing-1.0.0", &mut ctx)
            .unwrap();
        assert_eq!(node.as_str(), Some("user"));
    }

    #[test]
    fn test_wildcard_converter_tag_match() {
        let wildcard = ExtensionEntry::new(Arc::new(TestExtension {
            uri: "asdf://w/ext-1.0.0",
            converters: vec![Arc::new(UnitConverter {
                tags: vec!["tag:example.com/thing-*".to_string()],
                label: "wild",
            })],
            tags: vec![TagDefinition::new("tag:example.com/thing-1.0.0").unwrap()],
        }));
        let registry = ExtensionRegistry::from_extensions(vec![wildcard]);
        assert!(registry.handles_tag("tag:example.com/thing-1.0.0"));
        assert!(registry.handles_tag("tag:example.com/thing-2.0.0"));
        assert!(!registry.handles_tag("tag:example.com/other-1.0.0"));
    }

    #[test]
    fn test_unknown_tag_error() {
        let registry = ExtensionRegistry::from_extensions(Vec::new());
        let err = match registry.converter_for_tag("tag:example.com/absent-1.0.0") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, AsdfError::UnknownTag { .. }));
    }

    #[test]
    fn test_concrete_tags_for_wildcard_converter() {
        let converter: Arc<dyn Converter> = Arc::new(UnitConverter {
            tags: vec!["tag:example.com/thing-*".to_string()],
            label: "wild",
        });
        let ext = ExtensionEntry::new(Arc::new(TestExtension {
            uri: "asdf://w/ext-1.0.0",
            converters: vec![Arc::clone(&converter)],
            tags: vec![
                TagDefinition::new("tag:example.com/thing-1.0.0").unwrap(),
                TagDefinition::new("tag:example.com/thing-1.1.0").unwrap(),
            ],
        }));
        let registry = ExtensionRegistry::from_extensions(vec![ext]);
        assert_eq!(
            registry.concrete_tags_for_converter(&converter),
            vec![
                "tag:example.com/thing-1.0.0".to_string(),
                "tag:example.com/thing-1.1.0".to_string(),
            ]
        );
    }

    #[test]
    fn test_deferred_type_lifted_on_lookup() {
        struct DeferredExt;
        impl Extension for DeferredExt {
            fn extension_uri(&self) -> &str {
                "asdf://d/ext-1.0.0"
            }
            fn converters(&self) -> Vec<Arc<dyn Converter>> {
                struct C;
                impl Converter for C {
                    fn tags(&self) -> Vec<String> {
                        vec!["tag:example.com/str-1.0.0".to_string()]
                    }
                    fn types(&self) -> Vec<TypeRef> {
                        vec![TypeRef::by_name(std::any::type_name::<String>())]
                    }
                    fn to_yaml_tree(
                        &self,
                        _obj: &NativeObject,
                        _tag: &str,
                        _ctx: &mut crate::context::SerializationContext<'_>,
                    ) -> Result<AsdfValue> {
                        Ok(AsdfValue::Null)
                    }
                    fn from_yaml_tree(
                        &self,
                        _node: &AsdfValue,
                        _tag: &str,
                        _ctx: &mut crate::context::SerializationContext<'_>,
                    ) -> Result<ConversionResult> {
                        Ok(ConversionResult::Complete(AsdfValue::Null))
                    }
                }
                vec![Arc::new(C)]
            }
        }

        let registry =
            ExtensionRegistry::from_extensions(vec![ExtensionEntry::new(Arc::new(DeferredExt))]);
        let obj = NativeObject::new(String::from("hello"));
        assert!(registry.converter_for_object(&obj).is_ok());
        // Second lookup hits the resolved index.
        assert!(registry.converter_for_object(&obj).is_ok());
    }
}
