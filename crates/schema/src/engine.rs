//! Whole-tree validation and default handling.
//!
//! The engine walks a tagged tree depth-first; every node carrying a tag is
//! validated against the schemas its tag definition declares. Tags with no
//! definition are reported back to the caller, which decides between a
//! warning and a hard error.

use asdf_core::{NodeValue, Result, TaggedNode, TreePath};

use crate::loader::SchemaLoader;
use crate::validator::{json_to_node, node_matches_json, SchemaValidator, ValidationError, ValidatorSet};

/// Resolves a tag URI to the schema URIs that validate it, or `None` for
/// an unknown tag.
pub type TagSchemaResolver<'a> = &'a dyn Fn(&str) -> Option<Vec<String>>;

/// Result of validating a whole tree.
#[derive(Debug, Default)]
pub struct TreeValidationOutcome {
    /// Schema violations, in tree order.
    pub errors: Vec<ValidationError>,
    /// Tags with no definition, with the path where each was seen.
    pub unknown_tags: Vec<(String, String)>,
}

/// Schema validation and default filling/stripping over tagged trees.
pub struct SchemaEngine {
    loader: SchemaLoader,
    custom: ValidatorSet,
}

impl SchemaEngine {
    /// Engine over a loader and extension-provided custom keywords.
    pub fn new(loader: SchemaLoader, custom: ValidatorSet) -> Self {
        SchemaEngine { loader, custom }
    }

    /// The schema loader in use.
    pub fn loader(&self) -> &SchemaLoader {
        &self.loader
    }

    /// Replace the custom keyword set (when extensions change).
    pub fn set_validators(&mut self, custom: ValidatorSet) {
        self.custom = custom;
    }

    /// Validate every tagged node in the tree against its tag's schemas.
    pub fn validate_tree(
        &self,
        root: &mut TaggedNode,
        resolve: TagSchemaResolver,
    ) -> Result<TreeValidationOutcome> {
        let mut outcome = TreeValidationOutcome::default();
        let mut path = TreePath::root();
        self.validate_node(root, resolve, &mut path, &mut outcome)?;
        Ok(outcome)
    }

    fn validate_node(
        &self,
        node: &mut TaggedNode,
        resolve: TagSchemaResolver,
        path: &mut TreePath,
        outcome: &mut TreeValidationOutcome,
    ) -> Result<()> {
        if node.is_reference() {
            // Unresolved references are validated after resolution.
            return Ok(());
        }

        if let Some(tag) = node.tag.clone() {
            match resolve(&tag) {
                Some(schema_uris) => {
                    let validator = SchemaValidator::new(&self.loader, &self.custom);
                    for uri in schema_uris {
                        let schema = self.loader.load(&uri)?;
                        validator.apply(node, &schema, &uri, path, &mut outcome.errors)?;
                    }
                }
                None => outcome.unknown_tags.push((path.to_string(), tag)),
            }
        }

        match &mut node.value {
            NodeValue::Mapping(entries) => {
                for (key, child) in entries {
                    path.push(asdf_core::PathSegment::Key(key.clone()));
                    self.validate_node(child, resolve, path, outcome)?;
                    path.pop();
                }
            }
            NodeValue::Sequence(items) => {
                for (i, child) in items.iter_mut().enumerate() {
                    path.push(asdf_core::PathSegment::Index(i));
                    self.validate_node(child, resolve, path, outcome)?;
                    path.pop();
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Insert declared defaults for absent properties, everywhere a tag's
    /// schema declares them. Idempotent.
    pub fn fill_defaults(&self, root: &mut TaggedNode, resolve: TagSchemaResolver) -> Result<()> {
        self.walk_defaults(root, resolve, true)
    }

    /// Remove properties structurally equal to their declared default.
    /// Idempotent, and the inverse of [`SchemaEngine::fill_defaults`].
    pub fn strip_defaults(&self, root: &mut TaggedNode, resolve: TagSchemaResolver) -> Result<()> {
        self.walk_defaults(root, resolve, false)
    }

    fn walk_defaults(
        &self,
        node: &mut TaggedNode,
        resolve: TagSchemaResolver,
        fill: bool,
    ) -> Result<()> {
        if node.is_reference() {
            return Ok(());
        }
        if let Some(tag) = node.tag.clone() {
            if let Some(schema_uris) = resolve(&tag) {
                for uri in schema_uris {
                    let schema = self.loader.load(&uri)?;
                    self.apply_defaults(node, &schema, &uri, fill, 0)?;
                }
            }
        }
        match &mut node.value {
            NodeValue::Mapping(entries) => {
                for child in entries.values_mut() {
                    self.walk_defaults(child, resolve, fill)?;
                }
            }
            NodeValue::Sequence(items) => {
                for child in items {
                    self.walk_defaults(child, resolve, fill)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn apply_defaults(
        &self,
        node: &mut TaggedNode,
        schema: &serde_json::Value,
        base_uri: &str,
        fill: bool,
        depth: usize,
    ) -> Result<()> {
        if depth > 64 {
            return Ok(());
        }
        let schema = match schema.as_object() {
            Some(map) => map,
            None => return Ok(()),
        };
        if let Some(reference) = schema.get("$ref").and_then(|v| v.as_str()) {
            let uri = crate::validator::resolve_schema_ref(base_uri, reference);
            let resolved = self.loader.load(&uri)?;
            return self.apply_defaults(node, &resolved, &uri, fill, depth + 1);
        }
        if let Some(all) = schema.get("allOf").and_then(|v| v.as_array()) {
            for subschema in all {
                self.apply_defaults(node, subschema, base_uri, fill, depth + 1)?;
            }
        }

        let properties = match schema.get("properties").and_then(|v| v.as_object()) {
            Some(p) => p,
            None => return Ok(()),
        };
        let mapping = match node.as_mapping_mut() {
            Some(m) => m,
            None => return Ok(()),
        };

        for (name, subschema) in properties {
            let default = subschema.get("default");
            if fill {
                if let (Some(default), false) = (default, mapping.contains_key(name)) {
                    mapping.insert(name.clone(), json_to_node(default));
                }
                if let Some(child) = mapping.get_mut(name) {
                    self.apply_defaults(child, subschema, base_uri, fill, depth + 1)?;
                }
            } else {
                // Strip depth-first so a parent collapsing to its default
                // is caught after its children are stripped.
                if let Some(child) = mapping.get_mut(name) {
                    self.apply_defaults(child, subschema, base_uri, fill, depth + 1)?;
                }
                if let Some(default) = default {
                    let matches = mapping
                        .get(name)
                        .map(|child| node_matches_json(child, default))
                        .unwrap_or(false);
                    if matches {
                        mapping.shift_remove(name);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{InMemoryResourceProvider, ResourceStore};
    use indexmap::IndexMap;
    use std::sync::Arc;

    const FOO_TAG: &str = "tag:example.com/foo-1.0.0";
    const FOO_SCHEMA_URI: &str = "asdf://example.com/schemas/foo-1.0.0";

    fn engine_with(schema_yaml: &str) -> SchemaEngine {
        let mut provider = InMemoryResourceProvider::new();
        provider.insert(FOO_SCHEMA_URI, schema_yaml.as_bytes().to_vec());
        let mut store = ResourceStore::new();
        store.push(Arc::new(provider));
        SchemaEngine::new(SchemaLoader::new(Arc::new(store)), ValidatorSet::new())
    }

    fn resolver(tag: &str) -> Option<Vec<String>> {
        if tag == FOO_TAG {
            Some(vec![FOO_SCHEMA_URI.to_string()])
        } else {
            None
        }
    }

    fn foo_node(entries: Vec<(&str, TaggedNode)>) -> TaggedNode {
        let mut m = IndexMap::new();
        for (k, v) in entries {
            m.insert(k.to_string(), v);
        }
        TaggedNode::with_tag(FOO_TAG, NodeValue::Mapping(m))
    }

    #[test]
    fn test_validate_tree_locates_errors() {
        let engine = engine_with("type: object\nproperties:\n  value:\n    type: string\n");
        let mut root = TaggedNode::mapping(IndexMap::new());
        root.as_mapping_mut()
            .unwrap()
            .insert("foo".to_string(), foo_node(vec![("value", TaggedNode::int(12))]));

        let outcome = engine.validate_tree(&mut root, &resolver).unwrap();
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].path, "tree.foo.value");
    }

    #[test]
    fn test_unknown_tags_reported() {
        let engine = engine_with("{}");
        let mut root = TaggedNode::with_tag("tag:example.com/mystery-1.0.0", NodeValue::Null);
        let outcome = engine.validate_tree(&mut root, &resolver).unwrap();
        assert_eq!(outcome.unknown_tags.len(), 1);
        assert_eq!(outcome.unknown_tags[0].1, "tag:example.com/mystery-1.0.0");
    }

    #[test]
    fn test_fill_and_strip_are_inverse() {
        let engine = engine_with(
            "type: object\nproperties:\n  mode:\n    type: string\n    default: linear\n",
        );
        let mut node = foo_node(vec![]);
        let original = node.clone();

        engine.fill_defaults(&mut node, &resolver).unwrap();
        assert_eq!(node.get("mode").and_then(|n| n.as_str()), Some("linear"));

        engine.strip_defaults(&mut node, &resolver).unwrap();
        assert_eq!(node, original);
    }

    #[test]
    fn test_fill_is_idempotent() {
        let engine = engine_with(
            "type: object\nproperties:\n  mode:\n    type: string\n    default: linear\n",
        );
        let mut node = foo_node(vec![]);
        engine.fill_defaults(&mut node, &resolver).unwrap();
        let once = node.clone();
        engine.fill_defaults(&mut node, &resolver).unwrap();
        assert_eq!(node, once);
    }

    #[test]
    fn test_strip_keeps_non_default_values() {
        let engine = engine_with(
            "type: object\nproperties:\n  mode:\n    type: string\n    default: linear\n",
        );
        let mut node = foo_node(vec![("mode", TaggedNode::string("cubic"))]);
        engine.strip_defaults(&mut node, &resolver).unwrap();
        assert_eq!(node.get("mode").and_then(|n| n.as_str()), Some("cubic"));
    }
}
