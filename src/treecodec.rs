//! The tree codec: YAML text ↔ tagged tree ↔ native tree.
//!
//! Loading parses the document into a [`TaggedNode`] tree with every
//! custom tag preserved, then resolves tags into native objects through
//! the registry's converters (bottom-up, so a converter sees its
//! descendants already converted). Dumping runs the opposite direction
//! (top-down) and renders through the emitter with the standard tag
//! handle declared in the prologue.

use std::collections::HashMap;

use asdf_core::constants::{STSCI_TAG_PREFIX, YAML_TAG_PREFIX};
use asdf_core::{
    AsdfError, AsdfValue, NativeObject, NodeValue, PathSegment, Result, TaggedNode, TreePath,
};
use asdf_extension::{ConversionResult, FinalizeFn, SerializationContext};

use crate::emitter;
use crate::reference::Reference;

/// Conversion depth guard; trees deeper than this indicate a cycle.
const MAX_TREE_DEPTH: usize = 256;

/// Tags with no converter, reported with the path where each was seen.
pub type UnknownTags = Vec<(String, String)>;

/// A subtree whose tag no enabled extension understands.
///
/// The value is kept raw so the file round-trips: on write the original
/// tag is reattached.
#[derive(Debug, Clone)]
pub struct RawTagged {
    /// The unrecognized tag URI.
    pub tag: String,
    /// The subtree, with plain YAML semantics.
    pub value: AsdfValue,
}

/// Parse YAML document bytes into a tagged tree.
///
/// `%TAG` handles are honored both by the parser and by a fallback
/// expansion pass, so shorthand tags resolve to full URIs either way.
pub fn parse_document(yaml: &[u8]) -> Result<TaggedNode> {
    let value: serde_yaml::Value = serde_yaml::from_slice(yaml)
        .map_err(|e| AsdfError::header(format!("failed to parse YAML tree: {}", e)))?;
    let handles = scan_tag_directives(yaml);
    Ok(yaml_to_tagged(&value, &handles))
}

/// Render a tagged tree as a complete YAML document, directives through
/// the `...` terminator.
pub fn dump_document(root: &TaggedNode, extra_handles: &[(String, String)]) -> Vec<u8> {
    let mut out = String::from("%YAML 1.1\n");
    let mut declared = false;
    for (handle, prefix) in extra_handles {
        if handle == "!" {
            declared = true;
        }
        out.push_str(&format!("%TAG {} {}\n", handle, prefix));
    }
    if !declared {
        out.push_str(&format!("%TAG ! {}\n", STSCI_TAG_PREFIX));
    }
    out.push_str(&emitter::emit_document(root));
    out.push_str("...\n");
    out.into_bytes()
}

/// Collect `%TAG <handle> <prefix>` directives from the document prologue.
fn scan_tag_directives(yaml: &[u8]) -> HashMap<String, String> {
    let mut handles = HashMap::new();
    let text = String::from_utf8_lossy(yaml);
    for line in text.lines() {
        if line.starts_with("---") {
            break;
        }
        if let Some(rest) = line.strip_prefix("%TAG ") {
            let mut parts = rest.split_whitespace();
            if let (Some(handle), Some(prefix)) = (parts.next(), parts.next()) {
                handles.insert(handle.to_string(), prefix.to_string());
            }
        }
    }
    handles
}

fn normalize_tag(raw: &str, handles: &HashMap<String, String>) -> Option<String> {
    let mut tag = raw.trim();
    while let Some(stripped) = tag.strip_prefix('!') {
        tag = stripped;
    }
    if let Some(inner) = tag.strip_prefix('<') {
        tag = inner.strip_suffix('>').unwrap_or(inner);
    }
    if tag.is_empty() {
        return None;
    }
    // Plain YAML types carry no information the value does not.
    if tag.starts_with(YAML_TAG_PREFIX) {
        return None;
    }
    // A shorthand that the parser did not expand resolves through the
    // declared handles, defaulting to the standard prefix.
    if !tag.contains(':') && !tag.starts_with("asdf://") {
        let prefix = handles
            .get("!")
            .map(String::as_str)
            .unwrap_or(STSCI_TAG_PREFIX);
        return Some(format!("{}{}", prefix, tag));
    }
    Some(tag.to_string())
}

fn yaml_to_tagged(value: &serde_yaml::Value, handles: &HashMap<String, String>) -> TaggedNode {
    match value {
        serde_yaml::Value::Tagged(tagged) => {
            let mut node = yaml_to_tagged(&tagged.value, handles);
            node.tag = normalize_tag(&tagged.tag.to_string(), handles);
            node
        }
        serde_yaml::Value::Null => TaggedNode::null(),
        serde_yaml::Value::Bool(b) => TaggedNode::bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                TaggedNode::int(i)
            } else if let Some(u) = n.as_u64() {
                TaggedNode::new(NodeValue::UInt(u))
            } else {
                TaggedNode::float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_yaml::Value::String(s) => TaggedNode::string(s.clone()),
        serde_yaml::Value::Sequence(items) => {
            TaggedNode::sequence(items.iter().map(|v| yaml_to_tagged(v, handles)).collect())
        }
        serde_yaml::Value::Mapping(entries) => {
            let mut out = indexmap::IndexMap::new();
            for (key, child) in entries {
                out.insert(yaml_key_to_string(key), yaml_to_tagged(child, handles));
            }
            TaggedNode::mapping(out)
        }
    }
}

fn yaml_key_to_string(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => "null".to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

/// Convert a tagged tree into the native tree, dispatching custom tags to
/// converters bottom-up. Unknown tags pass through as plain values and
/// are reported in `unknown`.
pub fn tagged_to_native(
    node: &TaggedNode,
    ctx: &mut SerializationContext<'_>,
    unknown: &mut UnknownTags,
) -> Result<(AsdfValue, Vec<FinalizeFn>)> {
    let mut finalizers = Vec::new();
    let mut path = TreePath::root();
    let value = convert_tagged(node, ctx, unknown, &mut finalizers, &mut path, 0)?;
    Ok((value, finalizers))
}

fn convert_tagged(
    node: &TaggedNode,
    ctx: &mut SerializationContext<'_>,
    unknown: &mut UnknownTags,
    finalizers: &mut Vec<FinalizeFn>,
    path: &mut TreePath,
    depth: usize,
) -> Result<AsdfValue> {
    if depth > MAX_TREE_DEPTH {
        return Err(AsdfError::Value(format!(
            "tree deeper than {} levels at {}",
            MAX_TREE_DEPTH, path
        )));
    }

    if node.is_reference() {
        let uri = node
            .get("$ref")
            .and_then(|n| n.as_str())
            .unwrap_or_default()
            .to_string();
        return Ok(AsdfValue::Object(NativeObject::new(Reference::new(uri))));
    }

    let converted = match &node.value {
        NodeValue::Null => AsdfValue::Null,
        NodeValue::Bool(b) => AsdfValue::Bool(*b),
        NodeValue::Int(i) => AsdfValue::Int(*i),
        NodeValue::UInt(u) => AsdfValue::UInt(*u),
        NodeValue::Float(f) => AsdfValue::Float(*f),
        NodeValue::String(s) => AsdfValue::String(s.clone()),
        NodeValue::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, child) in items.iter().enumerate() {
                path.push(PathSegment::Index(i));
                out.push(convert_tagged(child, ctx, unknown, finalizers, path, depth + 1)?);
                path.pop();
            }
            AsdfValue::Sequence(out)
        }
        NodeValue::Mapping(entries) => {
            let mut out = indexmap::IndexMap::new();
            for (key, child) in entries {
                path.push(PathSegment::Key(key.clone()));
                out.insert(
                    key.clone(),
                    convert_tagged(child, ctx, unknown, finalizers, path, depth + 1)?,
                );
                path.pop();
            }
            AsdfValue::Mapping(out)
        }
    };

    let tag = match &node.tag {
        Some(tag) => tag.clone(),
        None => return Ok(converted),
    };

    if !ctx.extension_manager().handles_tag(&tag) {
        unknown.push((path.to_string(), tag.clone()));
        return Ok(AsdfValue::Object(NativeObject::new(RawTagged {
            tag,
            value: converted,
        })));
    }

    let entry = ctx.extension_manager().converter_for_tag(&tag)?;
    ctx.begin_object(None);
    let result = entry.converter.from_yaml_tree(&converted, &tag, ctx)?;
    ctx.mark_extension_used(&entry.extension_uri)?;
    match result {
        ConversionResult::Complete(value) => {
            if let AsdfValue::Object(obj) = &value {
                ctx.end_object_deserialization(obj)?;
            }
            Ok(value)
        }
        ConversionResult::Deferred { placeholder, finalize } => {
            if let AsdfValue::Object(obj) = &placeholder {
                ctx.end_object_deserialization(obj)?;
            }
            finalizers.push(finalize);
            Ok(placeholder)
        }
    }
}

/// Convert the native tree into a tagged tree, dispatching native objects
/// to converters top-down.
pub fn native_to_tagged(
    value: &AsdfValue,
    ctx: &mut SerializationContext<'_>,
) -> Result<TaggedNode> {
    convert_native(value, ctx, 0)
}

fn convert_native(
    value: &AsdfValue,
    ctx: &mut SerializationContext<'_>,
    depth: usize,
) -> Result<TaggedNode> {
    if depth > MAX_TREE_DEPTH {
        return Err(AsdfError::Value(format!(
            "tree deeper than {} levels; converters may be producing a cycle",
            MAX_TREE_DEPTH
        )));
    }
    Ok(match value {
        AsdfValue::Null => TaggedNode::null(),
        AsdfValue::Bool(b) => TaggedNode::bool(*b),
        AsdfValue::Int(i) => TaggedNode::int(*i),
        AsdfValue::UInt(u) => TaggedNode::new(NodeValue::UInt(*u)),
        AsdfValue::Float(f) => TaggedNode::float(*f),
        AsdfValue::String(s) => TaggedNode::string(s.clone()),
        AsdfValue::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for child in items {
                out.push(convert_native(child, ctx, depth + 1)?);
            }
            TaggedNode::sequence(out)
        }
        AsdfValue::Mapping(entries) => {
            let mut out = indexmap::IndexMap::new();
            for (key, child) in entries {
                out.insert(key.clone(), convert_native(child, ctx, depth + 1)?);
            }
            TaggedNode::mapping(out)
        }
        AsdfValue::Object(obj) => {
            if let Some(reference) = obj.downcast_ref::<Reference>() {
                let mut entry = indexmap::IndexMap::new();
                entry.insert("$ref".to_string(), TaggedNode::string(reference.uri.clone()));
                return Ok(TaggedNode::mapping(entry));
            }
            if let Some(raw) = obj.downcast_ref::<RawTagged>() {
                let mut node = convert_native(&raw.value, ctx, depth + 1)?;
                node.tag = Some(raw.tag.clone());
                return Ok(node);
            }

            let entry = ctx.extension_manager().converter_for_object(obj)?;
            let tags = ctx
                .extension_manager()
                .concrete_tags_for_converter(&entry.converter);
            ctx.begin_object(Some(obj.identity()));
            let tag = entry.converter.select_tag(obj, &tags, ctx)?;
            let sub = entry.converter.to_yaml_tree(obj, &tag, ctx)?;
            ctx.mark_extension_used(&entry.extension_uri)?;
            let mut node = convert_native(&sub, ctx, depth + 1)?;
            node.tag = Some(tag);
            node
        }
    })
}
