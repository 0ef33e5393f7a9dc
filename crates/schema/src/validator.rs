//! JSON Schema draft-04 validation over tagged trees.
//!
//! The walker applies standard draft-04 keywords plus the serialization
//! hints (`tag`, `propertyOrder`, `flowStyle`, `style`) and any
//! extension-supplied custom keywords. Hints are recorded on the node as a
//! side effect; they never reject. Subtrees that are unresolved references
//! are skipped entirely and validated after resolution.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use asdf_core::node::{FlowStyle, StringStyle};
use asdf_core::{uri_match, AsdfError, NodeValue, Result, TaggedNode, TreePath};

use crate::loader::SchemaLoader;

/// Maximum schema recursion depth (`$ref` chains, nested combinators).
const MAX_SCHEMA_DEPTH: usize = 64;

/// One validation failure: where and what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Path of the offending node in the tree.
    pub path: String,
    /// What went wrong, including a summary of the offending value.
    pub message: String,
}

impl ValidationError {
    fn new(path: &TreePath, message: impl Into<String>) -> Self {
        ValidationError {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// An extension-supplied validator for one custom schema keyword.
pub trait CustomKeyword: Send + Sync {
    /// The schema property that triggers this validator.
    fn keyword(&self) -> &str;

    /// Tag patterns this validator applies to; `**` matches every node.
    fn tags(&self) -> Vec<String>;

    /// Validate `node` against the keyword's value, returning messages.
    fn validate(
        &self,
        keyword_value: &serde_json::Value,
        node: &TaggedNode,
        schema: &serde_json::Value,
    ) -> Vec<String>;
}

/// Custom keyword validators indexed by schema property.
#[derive(Default, Clone)]
pub struct ValidatorSet {
    by_keyword: HashMap<String, Vec<Arc<dyn CustomKeyword>>>,
}

impl ValidatorSet {
    /// New empty set.
    pub fn new() -> Self {
        ValidatorSet::default()
    }

    /// Add a validator; validators for one keyword are unioned.
    pub fn add(&mut self, validator: Arc<dyn CustomKeyword>) {
        self.by_keyword
            .entry(validator.keyword().to_string())
            .or_default()
            .push(validator);
    }

    /// `true` when some validator handles `keyword`.
    pub fn handles(&self, keyword: &str) -> bool {
        self.by_keyword.contains_key(keyword)
    }

    /// Every validator for `keyword` whose tag patterns match `node`.
    fn applicable(&self, keyword: &str, node: &TaggedNode) -> Vec<&Arc<dyn CustomKeyword>> {
        match self.by_keyword.get(keyword) {
            None => Vec::new(),
            Some(validators) => validators
                .iter()
                .filter(|v| {
                    v.tags().iter().any(|pattern| {
                        pattern == "**"
                            || node
                                .tag
                                .as_deref()
                                .map(|t| uri_match(pattern, t))
                                .unwrap_or(false)
                    })
                })
                .collect(),
        }
    }
}

/// Applies schemas to tagged-tree nodes.
pub struct SchemaValidator<'a> {
    loader: &'a SchemaLoader,
    custom: &'a ValidatorSet,
}

impl<'a> SchemaValidator<'a> {
    /// Validator over a loader and a custom keyword set.
    pub fn new(loader: &'a SchemaLoader, custom: &'a ValidatorSet) -> Self {
        SchemaValidator { loader, custom }
    }

    /// Apply `schema` to `node`, appending failures to `errors`.
    ///
    /// Hints (`propertyOrder`, `flowStyle`, `style`) are recorded on the
    /// node as they are encountered.
    pub fn apply(
        &self,
        node: &mut TaggedNode,
        schema: &serde_json::Value,
        base_uri: &str,
        path: &TreePath,
        errors: &mut Vec<ValidationError>,
    ) -> Result<()> {
        self.apply_inner(node, schema, base_uri, path, errors, 0)
    }

    fn apply_inner(
        &self,
        node: &mut TaggedNode,
        schema: &serde_json::Value,
        base_uri: &str,
        path: &TreePath,
        errors: &mut Vec<ValidationError>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_SCHEMA_DEPTH {
            return Err(AsdfError::Value(format!(
                "schema nesting exceeds {} levels at '{}'",
                MAX_SCHEMA_DEPTH, base_uri
            )));
        }
        if node.is_reference() {
            // Deferred until resolve_references.
            return Ok(());
        }
        let schema = match schema.as_object() {
            Some(map) => map,
            None => return Ok(()),
        };

        // $ref replaces the whole schema in draft-04.
        if let Some(reference) = schema.get("$ref").and_then(|v| v.as_str()) {
            let uri = resolve_schema_ref(base_uri, reference);
            let resolved = self.loader.load(&uri)?;
            let (next_base, _) = split_ref_base(&uri);
            return self.apply_inner(node, &resolved, next_base, path, errors, depth + 1);
        }

        self.check_tag(node, schema, path, errors);
        record_hints(node, schema);
        self.check_type(node, schema, path, errors);
        self.check_enum(node, schema, path, errors);
        self.check_combinators(node, schema, base_uri, path, errors, depth)?;
        self.check_object(node, schema, base_uri, path, errors, depth)?;
        self.check_array(node, schema, base_uri, path, errors, depth)?;
        check_string(node, schema, path, errors);
        check_number(node, schema, path, errors);
        self.run_custom_keywords(node, schema, path, errors);
        Ok(())
    }

    fn check_tag(
        &self,
        node: &TaggedNode,
        schema: &serde_json::Map<String, serde_json::Value>,
        path: &TreePath,
        errors: &mut Vec<ValidationError>,
    ) {
        if let Some(expected) = schema.get("tag").and_then(|v| v.as_str()) {
            // An untagged node is passed through; schemas never reject a
            // subtree merely for lacking a tag.
            if let Some(actual) = node.tag.as_deref() {
                if !uri_match(expected, actual) {
                    errors.push(ValidationError::new(
                        path,
                        format!("mismatched tags, wanted '{}', got '{}'", expected, actual),
                    ));
                }
            }
        }
    }

    fn check_type(
        &self,
        node: &TaggedNode,
        schema: &serde_json::Map<String, serde_json::Value>,
        path: &TreePath,
        errors: &mut Vec<ValidationError>,
    ) {
        let declared = match schema.get("type") {
            Some(t) => t,
            None => return,
        };
        let matches = match declared {
            serde_json::Value::String(name) => node_is_type(node, name),
            serde_json::Value::Array(names) => names
                .iter()
                .filter_map(|n| n.as_str())
                .any(|name| node_is_type(node, name)),
            _ => true,
        };
        if !matches {
            errors.push(ValidationError::new(
                path,
                format!("{} is not of type {}", summarize(node), summarize_json(declared)),
            ));
        }
    }

    fn check_enum(
        &self,
        node: &TaggedNode,
        schema: &serde_json::Map<String, serde_json::Value>,
        path: &TreePath,
        errors: &mut Vec<ValidationError>,
    ) {
        if let Some(options) = schema.get("enum").and_then(|v| v.as_array()) {
            if !options.iter().any(|option| node_matches_json(node, option)) {
                errors.push(ValidationError::new(
                    path,
                    format!("{} is not one of {}", summarize(node), serde_json::Value::Array(options.clone())),
                ));
            }
        }
    }

    fn check_combinators(
        &self,
        node: &mut TaggedNode,
        schema: &serde_json::Map<String, serde_json::Value>,
        base_uri: &str,
        path: &TreePath,
        errors: &mut Vec<ValidationError>,
        depth: usize,
    ) -> Result<()> {
        if let Some(all) = schema.get("allOf").and_then(|v| v.as_array()) {
            for subschema in all {
                self.apply_inner(node, subschema, base_uri, path, errors, depth + 1)?;
            }
        }
        if let Some(any) = schema.get("anyOf").and_then(|v| v.as_array()) {
            let mut passed = false;
            for subschema in any {
                let mut scratch = Vec::new();
                self.apply_inner(node, subschema, base_uri, path, &mut scratch, depth + 1)?;
                if scratch.is_empty() {
                    passed = true;
                    break;
                }
            }
            if !passed {
                errors.push(ValidationError::new(
                    path,
                    format!("{} is not valid under any of the given schemas", summarize(node)),
                ));
            }
        }
        if let Some(one) = schema.get("oneOf").and_then(|v| v.as_array()) {
            let mut passes = 0;
            for subschema in one {
                let mut scratch = Vec::new();
                self.apply_inner(node, subschema, base_uri, path, &mut scratch, depth + 1)?;
                if scratch.is_empty() {
                    passes += 1;
                }
            }
            if passes != 1 {
                errors.push(ValidationError::new(
                    path,
                    format!(
                        "{} is valid under {} of the given schemas, exactly one required",
                        summarize(node),
                        passes
                    ),
                ));
            }
        }
        if let Some(not) = schema.get("not") {
            let mut scratch = Vec::new();
            self.apply_inner(node, not, base_uri, path, &mut scratch, depth + 1)?;
            if scratch.is_empty() {
                errors.push(ValidationError::new(
                    path,
                    format!("{} should not be valid under the given schema", summarize(node)),
                ));
            }
        }
        Ok(())
    }

    fn check_object(
        &self,
        node: &mut TaggedNode,
        schema: &serde_json::Map<String, serde_json::Value>,
        base_uri: &str,
        path: &TreePath,
        errors: &mut Vec<ValidationError>,
        depth: usize,
    ) -> Result<()> {
        if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
            if let Some(mapping) = node.as_mapping() {
                for name in required.iter().filter_map(|v| v.as_str()) {
                    if !mapping.contains_key(name) {
                        errors.push(ValidationError::new(
                            path,
                            format!("'{}' is a required property", name),
                        ));
                    }
                }
            }
        }

        let properties = schema.get("properties").and_then(|v| v.as_object());
        let pattern_properties = schema.get("patternProperties").and_then(|v| v.as_object());
        let additional = schema.get("additionalProperties");

        let mapping = match node.as_mapping_mut() {
            Some(m) => m,
            None => return Ok(()),
        };

        let keys: Vec<String> = mapping.keys().cloned().collect();
        for key in keys {
            let child_path = path.child(asdf_core::PathSegment::Key(key.clone()));
            let mut covered = false;

            if let Some(subschema) = properties.and_then(|p| p.get(&key)) {
                covered = true;
                let child = mapping.get_mut(&key).expect("key was just listed");
                self.apply_inner(child, subschema, base_uri, &child_path, errors, depth + 1)?;
            }
            if let Some(patterns) = pattern_properties {
                for (pattern, subschema) in patterns {
                    if Regex::new(pattern).map(|re| re.is_match(&key)).unwrap_or(false) {
                        covered = true;
                        let child = mapping.get_mut(&key).expect("key was just listed");
                        self.apply_inner(child, subschema, base_uri, &child_path, errors, depth + 1)?;
                    }
                }
            }
            if !covered {
                match additional {
                    Some(serde_json::Value::Bool(false)) => {
                        errors.push(ValidationError::new(
                            path,
                            format!("additional property '{}' is not allowed", key),
                        ));
                    }
                    Some(subschema @ serde_json::Value::Object(_)) => {
                        let child = mapping.get_mut(&key).expect("key was just listed");
                        self.apply_inner(child, subschema, base_uri, &child_path, errors, depth + 1)?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn check_array(
        &self,
        node: &mut TaggedNode,
        schema: &serde_json::Map<String, serde_json::Value>,
        base_uri: &str,
        path: &TreePath,
        errors: &mut Vec<ValidationError>,
        depth: usize,
    ) -> Result<()> {
        let len = match &node.value {
            NodeValue::Sequence(items) => items.len(),
            _ => return Ok(()),
        };

        if let Some(min) = schema.get("minItems").and_then(|v| v.as_u64()) {
            if (len as u64) < min {
                errors.push(ValidationError::new(path, format!("{} is too short (minItems {})", len, min)));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(|v| v.as_u64()) {
            if len as u64 > max {
                errors.push(ValidationError::new(path, format!("{} is too long (maxItems {})", len, max)));
            }
        }
        if schema.get("uniqueItems").and_then(|v| v.as_bool()).unwrap_or(false) {
            let items = node.as_sequence().expect("checked above");
            for i in 0..items.len() {
                for j in i + 1..items.len() {
                    if items[i] == items[j] {
                        errors.push(ValidationError::new(
                            path,
                            format!("{} has non-unique elements", summarize(node)),
                        ));
                        break;
                    }
                }
            }
        }

        let items_schema = schema.get("items");
        let additional_items = schema.get("additionalItems");
        let items = match &mut node.value {
            NodeValue::Sequence(items) => items,
            _ => unreachable!("checked above"),
        };
        match items_schema {
            Some(single @ serde_json::Value::Object(_)) => {
                for (i, child) in items.iter_mut().enumerate() {
                    let child_path = path.child(asdf_core::PathSegment::Index(i));
                    self.apply_inner(child, single, base_uri, &child_path, errors, depth + 1)?;
                }
            }
            Some(serde_json::Value::Array(positional)) => {
                for (i, child) in items.iter_mut().enumerate() {
                    let child_path = path.child(asdf_core::PathSegment::Index(i));
                    match positional.get(i) {
                        Some(subschema) => {
                            self.apply_inner(child, subschema, base_uri, &child_path, errors, depth + 1)?
                        }
                        None => match additional_items {
                            Some(serde_json::Value::Bool(false)) => {
                                errors.push(ValidationError::new(
                                    &child_path,
                                    "additional items are not allowed".to_string(),
                                ));
                            }
                            Some(subschema @ serde_json::Value::Object(_)) => {
                                self.apply_inner(child, subschema, base_uri, &child_path, errors, depth + 1)?
                            }
                            _ => {}
                        },
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn run_custom_keywords(
        &self,
        node: &TaggedNode,
        schema: &serde_json::Map<String, serde_json::Value>,
        path: &TreePath,
        errors: &mut Vec<ValidationError>,
    ) {
        let schema_value = serde_json::Value::Object(schema.clone());
        for (keyword, value) in schema {
            for validator in self.custom.applicable(keyword, node) {
                for message in validator.validate(value, node, &schema_value) {
                    errors.push(ValidationError::new(path, message));
                }
            }
        }
    }
}

fn record_hints(node: &mut TaggedNode, schema: &serde_json::Map<String, serde_json::Value>) {
    if let Some(order) = schema.get("propertyOrder").and_then(|v| v.as_array()) {
        if !order.is_empty() && matches!(node.value, NodeValue::Mapping(_)) {
            node.property_order = Some(
                order
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            );
        }
    }
    if let Some(style) = schema.get("flowStyle").and_then(|v| v.as_str()) {
        if matches!(node.value, NodeValue::Mapping(_) | NodeValue::Sequence(_)) {
            node.flow_style = match style {
                "flow" => Some(FlowStyle::Flow),
                "block" => Some(FlowStyle::Block),
                _ => node.flow_style,
            };
        }
    }
    if let Some(style) = schema.get("style").and_then(|v| v.as_str()) {
        if matches!(node.value, NodeValue::String(_)) {
            node.string_style = match style {
                "inline" => Some(StringStyle::Inline),
                "folded" => Some(StringStyle::Folded),
                "literal" => Some(StringStyle::Literal),
                _ => node.string_style,
            };
        }
    }
}

fn check_string(
    node: &TaggedNode,
    schema: &serde_json::Map<String, serde_json::Value>,
    path: &TreePath,
    errors: &mut Vec<ValidationError>,
) {
    let s = match node.as_str() {
        Some(s) => s,
        None => return,
    };
    if let Some(min) = schema.get("minLength").and_then(|v| v.as_u64()) {
        if (s.chars().count() as u64) < min {
            errors.push(ValidationError::new(path, format!("'{}' is shorter than {} characters", s, min)));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(|v| v.as_u64()) {
        if s.chars().count() as u64 > max {
            errors.push(ValidationError::new(path, format!("'{}' is longer than {} characters", s, max)));
        }
    }
    if let Some(pattern) = schema.get("pattern").and_then(|v| v.as_str()) {
        if let Ok(re) = Regex::new(pattern) {
            if !re.is_match(s) {
                errors.push(ValidationError::new(
                    path,
                    format!("'{}' does not match pattern '{}'", s, pattern),
                ));
            }
        }
    }
}

fn check_number(
    node: &TaggedNode,
    schema: &serde_json::Map<String, serde_json::Value>,
    path: &TreePath,
    errors: &mut Vec<ValidationError>,
) {
    let value = match node.as_f64() {
        Some(v) if !matches!(node.value, NodeValue::Bool(_)) => v,
        _ => return,
    };
    if let Some(min) = schema.get("minimum").and_then(|v| v.as_f64()) {
        let exclusive = schema.get("exclusiveMinimum").and_then(|v| v.as_bool()).unwrap_or(false);
        if value < min || (exclusive && value <= min) {
            errors.push(ValidationError::new(
                path,
                format!("{} is less than the minimum of {}", value, min),
            ));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(|v| v.as_f64()) {
        let exclusive = schema.get("exclusiveMaximum").and_then(|v| v.as_bool()).unwrap_or(false);
        if value > max || (exclusive && value >= max) {
            errors.push(ValidationError::new(
                path,
                format!("{} is greater than the maximum of {}", value, max),
            ));
        }
    }
    if let Some(factor) = schema.get("multipleOf").and_then(|v| v.as_f64()) {
        if factor != 0.0 {
            let ratio = value / factor;
            if (ratio - ratio.round()).abs() > 1e-9 {
                errors.push(ValidationError::new(
                    path,
                    format!("{} is not a multiple of {}", value, factor),
                ));
            }
        }
    }
}

fn node_is_type(node: &TaggedNode, name: &str) -> bool {
    match name {
        "null" => matches!(node.value, NodeValue::Null),
        "boolean" => matches!(node.value, NodeValue::Bool(_)),
        "integer" => matches!(node.value, NodeValue::Int(_) | NodeValue::UInt(_)),
        "number" => matches!(
            node.value,
            NodeValue::Int(_) | NodeValue::UInt(_) | NodeValue::Float(_)
        ),
        "string" => matches!(node.value, NodeValue::String(_)),
        "array" => matches!(node.value, NodeValue::Sequence(_)),
        "object" => matches!(node.value, NodeValue::Mapping(_)),
        _ => true,
    }
}

/// Structural comparison between a tagged node and a plain JSON value.
pub fn node_matches_json(node: &TaggedNode, json: &serde_json::Value) -> bool {
    match (&node.value, json) {
        (NodeValue::Null, serde_json::Value::Null) => true,
        (NodeValue::Bool(a), serde_json::Value::Bool(b)) => a == b,
        (NodeValue::String(a), serde_json::Value::String(b)) => a == b,
        (NodeValue::Int(a), serde_json::Value::Number(b)) => b.as_i64().map(|b| *a == b).unwrap_or(false),
        (NodeValue::UInt(a), serde_json::Value::Number(b)) => b.as_u64().map(|b| *a == b).unwrap_or(false),
        (NodeValue::Float(a), serde_json::Value::Number(b)) => {
            b.as_f64().map(|b| *a == b).unwrap_or(false)
        }
        (NodeValue::Sequence(a), serde_json::Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| node_matches_json(x, y))
        }
        (NodeValue::Mapping(a), serde_json::Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(k, v)| b.get(k).map(|w| node_matches_json(v, w)).unwrap_or(false))
        }
        _ => false,
    }
}

/// Convert a plain JSON value into an untagged tree node.
pub fn json_to_node(json: &serde_json::Value) -> TaggedNode {
    match json {
        serde_json::Value::Null => TaggedNode::null(),
        serde_json::Value::Bool(b) => TaggedNode::bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                TaggedNode::int(i)
            } else if let Some(u) = n.as_u64() {
                TaggedNode::new(NodeValue::UInt(u))
            } else {
                TaggedNode::float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => TaggedNode::string(s.clone()),
        serde_json::Value::Array(items) => {
            TaggedNode::sequence(items.iter().map(json_to_node).collect())
        }
        serde_json::Value::Object(map) => {
            let mut entries = indexmap::IndexMap::new();
            for (k, v) in map {
                entries.insert(k.clone(), json_to_node(v));
            }
            TaggedNode::mapping(entries)
        }
    }
}

fn summarize(node: &TaggedNode) -> String {
    match &node.value {
        NodeValue::Null => "None".to_string(),
        NodeValue::Bool(b) => b.to_string(),
        NodeValue::Int(i) => i.to_string(),
        NodeValue::UInt(u) => u.to_string(),
        NodeValue::Float(f) => f.to_string(),
        NodeValue::String(s) => format!("'{}'", s),
        NodeValue::Sequence(items) => format!("<array of {} items>", items.len()),
        NodeValue::Mapping(entries) => format!("<object with {} properties>", entries.len()),
    }
}

fn summarize_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => format!("'{}'", s),
        other => other.to_string(),
    }
}

/// Resolve a `$ref` target against the URI of the schema containing it.
pub(crate) fn resolve_schema_ref(base_uri: &str, reference: &str) -> String {
    if let Some(fragment) = reference.strip_prefix('#') {
        let (base, _) = split_ref_base(base_uri);
        return format!("{}#{}", base, fragment);
    }
    if reference.contains("://") || reference.starts_with('/') {
        return reference.to_string();
    }
    let (base, _) = split_ref_base(base_uri);
    match base.rfind('/') {
        Some(idx) => format!("{}/{}", &base[..idx], reference),
        None => reference.to_string(),
    }
}

fn split_ref_base(uri: &str) -> (&str, Option<&str>) {
    match uri.find('#') {
        Some(idx) => (&uri[..idx], Some(&uri[idx + 1..])),
        None => (uri, None),
    }
}
