//! Custom schema keywords for ndarray nodes: `ndim`, `max_ndim`,
//! `datatype` (with `exact_datatype`).

use asdf_core::{NodeValue, TaggedNode};
use asdf_schema::CustomKeyword;

use super::datatype::Datatype;
use super::converter::NDARRAY_TAG_PATTERN;

fn node_ndim(node: &TaggedNode) -> Option<usize> {
    if let Some(shape) = node.get("shape").and_then(|n| n.as_sequence()) {
        return Some(shape.len());
    }
    if let Some(data) = node.get("data") {
        let mut ndim = 0;
        let mut current = data;
        while let NodeValue::Sequence(items) = &current.value {
            ndim += 1;
            match items.first() {
                Some(first) => current = first,
                None => break,
            }
        }
        return Some(ndim);
    }
    None
}

fn node_datatype(node: &TaggedNode) -> Option<Datatype> {
    if let Some(datatype) = node.get("datatype") {
        return Datatype::from_node(datatype).ok();
    }
    // Infer from inline data: floats dominate ints, ints dominate bools.
    let data = node.get("data")?;
    let mut saw_float = false;
    let mut saw_int = false;
    let mut saw_bool = false;
    let mut saw_string = false;
    let mut max_chars: u64 = 0;
    data.walk(&mut |_, n| match &n.value {
        NodeValue::Float(_) => saw_float = true,
        NodeValue::Int(_) | NodeValue::UInt(_) => saw_int = true,
        NodeValue::Bool(_) => saw_bool = true,
        NodeValue::String(s) => {
            saw_string = true;
            max_chars = max_chars.max(s.chars().count() as u64);
        }
        _ => {}
    });
    if saw_string {
        Some(Datatype::Ucs4(max_chars.max(1)))
    } else if saw_float {
        Some(Datatype::Scalar(super::ScalarKind::Float64))
    } else if saw_int {
        Some(Datatype::Scalar(super::ScalarKind::Int64))
    } else if saw_bool {
        Some(Datatype::Scalar(super::ScalarKind::Bool8))
    } else {
        None
    }
}

/// Enforces `ndim`: the array's dimensionality must equal the declared
/// value.
pub struct NdimValidator;

impl CustomKeyword for NdimValidator {
    fn keyword(&self) -> &str {
        "ndim"
    }

    fn tags(&self) -> Vec<String> {
        vec![NDARRAY_TAG_PATTERN.to_string()]
    }

    fn validate(
        &self,
        keyword_value: &serde_json::Value,
        node: &TaggedNode,
        _schema: &serde_json::Value,
    ) -> Vec<String> {
        let expected = match keyword_value.as_u64() {
            Some(v) => v as usize,
            None => return Vec::new(),
        };
        match node_ndim(node) {
            Some(actual) if actual != expected => vec![format!(
                "Wrong number of dimensions: Expected {}, got {}",
                expected, actual
            )],
            Some(_) => Vec::new(),
            None => vec!["Not a valid ndarray".to_string()],
        }
    }
}

/// Enforces `max_ndim`: the array's dimensionality must not exceed the
/// declared value.
pub struct MaxNdimValidator;

impl CustomKeyword for MaxNdimValidator {
    fn keyword(&self) -> &str {
        "max_ndim"
    }

    fn tags(&self) -> Vec<String> {
        vec![NDARRAY_TAG_PATTERN.to_string()]
    }

    fn validate(
        &self,
        keyword_value: &serde_json::Value,
        node: &TaggedNode,
        _schema: &serde_json::Value,
    ) -> Vec<String> {
        let max = match keyword_value.as_u64() {
            Some(v) => v as usize,
            None => return Vec::new(),
        };
        match node_ndim(node) {
            Some(actual) if actual > max => vec![format!(
                "Wrong number of dimensions: Expected max of {}, got {}",
                max, actual
            )],
            Some(_) => Vec::new(),
            None => vec!["Not a valid ndarray".to_string()],
        }
    }
}

/// Enforces `datatype`: safe-cast compatibility, or exact equality when
/// the schema also sets `exact_datatype: true`.
pub struct DatatypeValidator;

impl CustomKeyword for DatatypeValidator {
    fn keyword(&self) -> &str {
        "datatype"
    }

    fn tags(&self) -> Vec<String> {
        vec![NDARRAY_TAG_PATTERN.to_string()]
    }

    fn validate(
        &self,
        keyword_value: &serde_json::Value,
        node: &TaggedNode,
        schema: &serde_json::Value,
    ) -> Vec<String> {
        let expected = match Datatype::from_node(&asdf_schema::json_to_node(keyword_value)) {
            Ok(expected) => expected,
            // A malformed schema is not the node's fault.
            Err(_) => return Vec::new(),
        };
        let actual = match node_datatype(node) {
            Some(actual) => actual,
            None => return vec!["Not a valid ndarray".to_string()],
        };

        if actual == expected {
            return Vec::new();
        }

        let exact = schema
            .get("exact_datatype")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if exact {
            return vec![format!(
                "Expected datatype '{}', got '{}'",
                expected.display_name(),
                actual.display_name()
            )];
        }

        match (&expected, &actual) {
            (Datatype::Record(expected_fields), Datatype::Record(actual_fields)) => {
                if expected_fields.len() != actual_fields.len() {
                    return vec![format!(
                        "Mismatch in number of columns: Expected {}, got {}",
                        expected_fields.len(),
                        actual_fields.len()
                    )];
                }
                let mut errors = Vec::new();
                for (expected_field, actual_field) in expected_fields.iter().zip(actual_fields) {
                    if !Datatype::can_cast_safe(&actual_field.datatype, &expected_field.datatype) {
                        errors.push(format!(
                            "Cannot safely cast to expected datatype: Expected {}, got {}",
                            expected_field.datatype.display_name(),
                            actual_field.datatype.display_name()
                        ));
                    }
                }
                errors
            }
            (Datatype::Record(_), _) => vec![format!(
                "Expected structured datatype '{}', got '{}'",
                expected.display_name(),
                actual.display_name()
            )],
            (_, Datatype::Record(_)) => vec![format!(
                "Expected scalar datatype '{}', got '{}'",
                expected.display_name(),
                actual.display_name()
            )],
            _ => {
                if Datatype::can_cast_safe(&actual, &expected) {
                    Vec::new()
                } else {
                    vec![format!(
                        "Cannot safely cast from '{}' to '{}'",
                        actual.display_name(),
                        expected.display_name()
                    )]
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn ndarray_node(entries: Vec<(&str, TaggedNode)>) -> TaggedNode {
        let mut m = IndexMap::new();
        for (k, v) in entries {
            m.insert(k.to_string(), v);
        }
        TaggedNode::with_tag("tag:stsci.edu:asdf/core/ndarray-1.0.0", NodeValue::Mapping(m))
    }

    fn shape(dims: &[i64]) -> TaggedNode {
        TaggedNode::sequence(dims.iter().map(|&d| TaggedNode::int(d)).collect())
    }

    #[test]
    fn test_ndim_from_shape() {
        let node = ndarray_node(vec![("shape", shape(&[3, 4]))]);
        let errors = NdimValidator.validate(&serde_json::json!(2), &node, &serde_json::json!({}));
        assert!(errors.is_empty());
        let errors = NdimValidator.validate(&serde_json::json!(3), &node, &serde_json::json!({}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Expected 3, got 2"));
    }

    #[test]
    fn test_ndim_from_inline_data() {
        let data = TaggedNode::sequence(vec![TaggedNode::sequence(vec![TaggedNode::int(1)])]);
        let node = ndarray_node(vec![("data", data)]);
        let errors = NdimValidator.validate(&serde_json::json!(2), &node, &serde_json::json!({}));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_max_ndim() {
        let node = ndarray_node(vec![("shape", shape(&[3, 4, 5]))]);
        let errors =
            MaxNdimValidator.validate(&serde_json::json!(2), &node, &serde_json::json!({}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Expected max of 2, got 3"));
    }

    #[test]
    fn test_datatype_safe_cast_allowed() {
        let node = ndarray_node(vec![("datatype", TaggedNode::string("int32"))]);
        let errors = DatatypeValidator.validate(
            &serde_json::json!("float64"),
            &node,
            &serde_json::json!({}),
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn test_datatype_unsafe_cast_rejected() {
        let node = ndarray_node(vec![("datatype", TaggedNode::string("float64"))]);
        let errors = DatatypeValidator.validate(
            &serde_json::json!("int64"),
            &node,
            &serde_json::json!({}),
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Cannot safely cast from 'float64' to 'int64'"));
    }

    #[test]
    fn test_exact_datatype() {
        let node = ndarray_node(vec![("datatype", TaggedNode::string("int32"))]);
        let errors = DatatypeValidator.validate(
            &serde_json::json!("float64"),
            &node,
            &serde_json::json!({"exact_datatype": true}),
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Expected datatype 'float64', got 'int32'"));
    }

    #[test]
    fn test_column_count_mismatch() {
        let actual = TaggedNode::sequence(vec![
            TaggedNode::mapping({
                let mut m = IndexMap::new();
                m.insert("name".to_string(), TaggedNode::string("a"));
                m.insert("datatype".to_string(), TaggedNode::string("int32"));
                m
            }),
        ]);
        let node = ndarray_node(vec![("datatype", actual)]);
        let expected = serde_json::json!([
            {"name": "a", "datatype": "int32"},
            {"name": "b", "datatype": "float64"},
        ]);
        let errors = DatatypeValidator.validate(&expected, &node, &serde_json::json!({}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Mismatch in number of columns: Expected 2, got 1"));
    }
}
