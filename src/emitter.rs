//! YAML emission for tagged trees.
//!
//! The emitter renders block style by default, switches to flow style for
//! sequences of scalars (so numeric data reads as `[0.0, 1.0, 2.0]`) and
//! wherever a schema recorded a `flowStyle: flow` hint, honors
//! `propertyOrder`, and writes tags in the standard shorthand under the
//! `tag:stsci.edu:asdf/` handle.

use asdf_core::constants::STSCI_TAG_PREFIX;
use asdf_core::{FlowStyle, NodeValue, StringStyle, TaggedNode};

/// Render a complete document body: `--- ` through the final newline.
/// Directives and the `...` terminator are the caller's business.
pub fn emit_document(root: &TaggedNode) -> String {
    let mut out = String::from("---");
    match render_tag(root) {
        Some(tag) => {
            out.push(' ');
            out.push_str(&tag);
        }
        None => {}
    }
    if is_scalar(root) {
        out.push(' ');
        out.push_str(&render_scalar(root));
        out.push('\n');
    } else if should_flow(root) {
        out.push(' ');
        out.push_str(&render_flow(root, false));
        out.push('\n');
    } else {
        out.push('\n');
        emit_block(root, 0, &mut out);
    }
    out
}

fn render_tag(node: &TaggedNode) -> Option<String> {
    let tag = node.tag.as_deref()?;
    match tag.strip_prefix(STSCI_TAG_PREFIX) {
        Some(short) => Some(format!("!{}", short)),
        None => Some(format!("!<{}>", tag)),
    }
}

fn is_scalar(node: &TaggedNode) -> bool {
    !matches!(node.value, NodeValue::Sequence(_) | NodeValue::Mapping(_))
}

fn is_empty_container(node: &TaggedNode) -> bool {
    match &node.value {
        NodeValue::Sequence(items) => items.is_empty(),
        NodeValue::Mapping(entries) => entries.is_empty(),
        _ => false,
    }
}

fn should_flow(node: &TaggedNode) -> bool {
    match node.flow_style {
        Some(FlowStyle::Flow) => return true,
        Some(FlowStyle::Block) => return is_empty_container(node),
        None => {}
    }
    match &node.value {
        NodeValue::Sequence(items) => items.iter().all(is_scalar),
        NodeValue::Mapping(entries) => entries.is_empty(),
        _ => false,
    }
}

/// Keys in emission order: `propertyOrder` names first, the rest in
/// insertion order.
fn ordered_keys(node: &TaggedNode) -> Vec<String> {
    let entries = match node.as_mapping() {
        Some(entries) => entries,
        None => return Vec::new(),
    };
    match &node.property_order {
        None => entries.keys().cloned().collect(),
        Some(order) => {
            let mut keys: Vec<String> = order
                .iter()
                .filter(|k| entries.contains_key(*k))
                .cloned()
                .collect();
            for key in entries.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
            keys
        }
    }
}

fn emit_block(node: &TaggedNode, indent: usize, out: &mut String) {
    match &node.value {
        NodeValue::Mapping(entries) => {
            for key in ordered_keys(node) {
                let child = &entries[&key];
                out.push_str(&" ".repeat(indent));
                out.push_str(&render_string(&key, None));
                out.push(':');
                emit_block_value(child, indent, out);
            }
        }
        NodeValue::Sequence(items) => {
            for child in items {
                out.push_str(&" ".repeat(indent));
                out.push('-');
                // An untagged block mapping starts compactly on the dash
                // line.
                if child.tag.is_none()
                    && matches!(child.value, NodeValue::Mapping(_))
                    && !should_flow(child)
                    && !is_empty_container(child)
                {
                    emit_mapping_compact(child, indent + 2, out);
                } else {
                    emit_block_value(child, indent, out);
                }
            }
        }
        _ => {
            out.push_str(&" ".repeat(indent));
            out.push_str(&render_scalar(node));
            out.push('\n');
        }
    }
}

/// Emit the value part after `key:` or `-`, choosing same-line or nested
/// placement.
fn emit_block_value(node: &TaggedNode, indent: usize, out: &mut String) {
    let tag = render_tag(node);

    if let NodeValue::String(s) = &node.value {
        if node.string_style == Some(StringStyle::Literal) || s.contains('\n') {
            if let Some(tag) = &tag {
                out.push(' ');
                out.push_str(tag);
            }
            emit_literal_string(s, indent + 2, out);
            return;
        }
    }

    if is_scalar(node) {
        out.push(' ');
        if let Some(tag) = &tag {
            out.push_str(tag);
            out.push(' ');
        }
        out.push_str(&render_scalar(node));
        out.push('\n');
        return;
    }

    if should_flow(node) {
        out.push(' ');
        out.push_str(&render_flow(node, true));
        out.push('\n');
        return;
    }

    if let Some(tag) = &tag {
        out.push(' ');
        out.push_str(tag);
    }
    out.push('\n');
    emit_block(node, indent + 2, out);
}

/// Emit a block mapping whose first entry shares the line with the
/// sequence dash.
fn emit_mapping_compact(node: &TaggedNode, indent: usize, out: &mut String) {
    let entries = node.as_mapping().expect("caller checked for a mapping");
    for (i, key) in ordered_keys(node).iter().enumerate() {
        if i == 0 {
            out.push(' ');
        } else {
            out.push_str(&" ".repeat(indent));
        }
        out.push_str(&render_string(key, None));
        out.push(':');
        emit_block_value(&entries[key], indent, out);
    }
}

fn emit_literal_string(s: &str, indent: usize, out: &mut String) {
    out.push_str(" |");
    if !s.ends_with('\n') {
        out.push('-');
    }
    out.push('\n');
    for line in s.lines() {
        out.push_str(&" ".repeat(indent));
        out.push_str(line);
        out.push('\n');
    }
}

fn render_flow(node: &TaggedNode, with_tag: bool) -> String {
    let mut out = String::new();
    if with_tag {
        if let Some(tag) = render_tag(node) {
            out.push_str(&tag);
            out.push(' ');
        }
    }
    match &node.value {
        NodeValue::Sequence(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&render_flow(item, true));
            }
            out.push(']');
        }
        NodeValue::Mapping(entries) => {
            out.push('{');
            let keys = ordered_keys(node);
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&render_string(key, None));
                out.push_str(": ");
                out.push_str(&render_flow(&entries[key], true));
            }
            out.push('}');
        }
        _ => out.push_str(&render_scalar(node)),
    }
    out
}

fn render_scalar(node: &TaggedNode) -> String {
    match &node.value {
        NodeValue::Null => "null".to_string(),
        NodeValue::Bool(true) => "true".to_string(),
        NodeValue::Bool(false) => "false".to_string(),
        NodeValue::Int(i) => i.to_string(),
        NodeValue::UInt(u) => u.to_string(),
        NodeValue::Float(f) => render_float(*f),
        NodeValue::String(s) => render_string(s, node.string_style),
        NodeValue::Sequence(_) | NodeValue::Mapping(_) => {
            unreachable!("containers are rendered by emit_block/render_flow")
        }
    }
}

fn render_float(f: f64) -> String {
    if f.is_nan() {
        return ".NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { ".Inf" } else { "-.Inf" }.to_string();
    }
    let repr = format!("{:?}", f);
    if repr.contains('.') || repr.contains('e') || repr.contains('E') {
        repr
    } else {
        format!("{}.0", repr)
    }
}

fn render_string(s: &str, _style: Option<StringStyle>) -> String {
    if !needs_quoting(s) {
        return s.to_string();
    }
    if s.chars().any(|c| c.is_control()) {
        // Double-quoted with escapes.
        let mut out = String::from("\"");
        for c in s.chars() {
            match c {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                '\r' => out.push_str("\\r"),
                c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
                c => out.push(c),
            }
        }
        out.push('"');
        out
    } else {
        format!("'{}'", s.replace('\'', "''"))
    }
}

fn needs_quoting(s: &str) -> bool {
    if s.is_empty() {
        return true;
    }
    if s.trim() != s {
        return true;
    }
    let first = s.chars().next().expect("nonempty");
    if "!&*-?#|>%@`\"'{}[],:".contains(first) {
        return true;
    }
    // Colons anywhere are quoted: YAML 1.1 reads 1:30 as sexagesimal.
    // Flow indicators are quoted so the string survives flow context.
    if s.contains([':', ',', '[', ']', '{', '}']) || s.contains(" #") {
        return true;
    }
    if s.contains(|c: char| c.is_control()) {
        return true;
    }
    // Strings that would parse as another scalar type.
    let lowered = s.to_ascii_lowercase();
    if matches!(
        lowered.as_str(),
        "null" | "~" | "true" | "false" | "yes" | "no" | "on" | "off" | ".nan" | ".inf" | "-.inf"
    ) {
        return true;
    }
    if s.parse::<f64>().is_ok() || s.parse::<i64>().is_ok() {
        return true;
    }
    // YAML 1.1 also resolves hex, octal, binary and underscore-grouped
    // integers.
    let digits = s.trim_start_matches(['+', '-']);
    if digits.len() > 2 && (digits.starts_with("0x") || digits.starts_with("0o") || digits.starts_with("0b")) {
        return true;
    }
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit() || c == '_') {
        return true;
    }
    false
}
