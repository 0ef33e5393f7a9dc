//! The tagged tree: the intermediate representation of the YAML document.
//!
//! Every node retains the YAML tag it was read with (or will be written
//! with), plus rendering hints picked up from schemas (`propertyOrder`,
//! `flowStyle`, `style`). Structural equality ignores the hints.

use std::fmt;

use indexmap::IndexMap;

/// Rendering style hint for mappings and sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStyle {
    /// One entry per line, indentation-delimited.
    Block,
    /// Single-line `[a, b]` / `{a: 1}` rendering.
    Flow,
}

/// Rendering style hint for strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringStyle {
    /// Plain scalar on one line.
    Inline,
    /// Folded multi-line scalar (`>`).
    Folded,
    /// Literal multi-line scalar (`|`).
    Literal,
}

/// The value carried by a [`TaggedNode`].
#[derive(Debug, Clone)]
pub enum NodeValue {
    /// YAML null.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Signed integer scalar.
    Int(i64),
    /// Unsigned integer scalar that does not fit in `i64`.
    UInt(u64),
    /// Floating point scalar.
    Float(f64),
    /// String scalar.
    String(String),
    /// Ordered sequence.
    Sequence(Vec<TaggedNode>),
    /// Insertion-ordered mapping with string keys.
    Mapping(IndexMap<String, TaggedNode>),
}

/// A node in the tagged tree.
#[derive(Debug, Clone)]
pub struct TaggedNode {
    /// The YAML tag URI, if the node carries a custom tag.
    pub tag: Option<String>,
    /// The node's value.
    pub value: NodeValue,
    /// Preferred property order, recorded from a schema's `propertyOrder`.
    pub property_order: Option<Vec<String>>,
    /// Mapping/sequence rendering hint from a schema's `flowStyle`.
    pub flow_style: Option<FlowStyle>,
    /// String rendering hint from a schema's `style`.
    pub string_style: Option<StringStyle>,
}

impl TaggedNode {
    /// Create an untagged node.
    pub fn new(value: NodeValue) -> Self {
        TaggedNode {
            tag: None,
            value,
            property_order: None,
            flow_style: None,
            string_style: None,
        }
    }

    /// Create a node carrying a tag URI.
    pub fn with_tag(tag: impl Into<String>, value: NodeValue) -> Self {
        TaggedNode {
            tag: Some(tag.into()),
            value,
            property_order: None,
            flow_style: None,
            string_style: None,
        }
    }

    /// Null node.
    pub fn null() -> Self {
        TaggedNode::new(NodeValue::Null)
    }

    /// String node.
    pub fn string(s: impl Into<String>) -> Self {
        TaggedNode::new(NodeValue::String(s.into()))
    }

    /// Integer node.
    pub fn int(i: i64) -> Self {
        TaggedNode::new(NodeValue::Int(i))
    }

    /// Float node.
    pub fn float(f: f64) -> Self {
        TaggedNode::new(NodeValue::Float(f))
    }

    /// Boolean node.
    pub fn bool(b: bool) -> Self {
        TaggedNode::new(NodeValue::Bool(b))
    }

    /// Sequence node.
    pub fn sequence(items: Vec<TaggedNode>) -> Self {
        TaggedNode::new(NodeValue::Sequence(items))
    }

    /// Mapping node.
    pub fn mapping(entries: IndexMap<String, TaggedNode>) -> Self {
        TaggedNode::new(NodeValue::Mapping(entries))
    }

    /// The mapping entries, if this node is a mapping.
    pub fn as_mapping(&self) -> Option<&IndexMap<String, TaggedNode>> {
        match &self.value {
            NodeValue::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Mutable mapping entries, if this node is a mapping.
    pub fn as_mapping_mut(&mut self) -> Option<&mut IndexMap<String, TaggedNode>> {
        match &mut self.value {
            NodeValue::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// The sequence items, if this node is a sequence.
    pub fn as_sequence(&self) -> Option<&[TaggedNode]> {
        match &self.value {
            NodeValue::Sequence(s) => Some(s),
            _ => None,
        }
    }

    /// The string value, if this node is a string scalar.
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            NodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The value as an `i64`, if integral and in range.
    pub fn as_i64(&self) -> Option<i64> {
        match &self.value {
            NodeValue::Int(i) => Some(*i),
            NodeValue::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// The value as a `u64`, if integral and non-negative.
    pub fn as_u64(&self) -> Option<u64> {
        match &self.value {
            NodeValue::Int(i) if *i >= 0 => Some(*i as u64),
            NodeValue::UInt(u) => Some(*u),
            _ => None,
        }
    }

    /// The value as an `f64`, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match &self.value {
            NodeValue::Float(f) => Some(*f),
            NodeValue::Int(i) => Some(*i as f64),
            NodeValue::UInt(u) => Some(*u as f64),
            _ => None,
        }
    }

    /// The boolean value, if this node is a bool scalar.
    pub fn as_bool(&self) -> Option<bool> {
        match &self.value {
            NodeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Look up a key in a mapping node.
    pub fn get(&self, key: &str) -> Option<&TaggedNode> {
        self.as_mapping().and_then(|m| m.get(key))
    }

    /// `true` if this node is a mapping of the form `{"$ref": <uri>}`.
    pub fn is_reference(&self) -> bool {
        match self.as_mapping() {
            Some(m) => m.len() == 1 && m.contains_key("$ref"),
            None => false,
        }
    }

    /// Visit this node and all descendants depth-first, parents before
    /// children, with the path to each node.
    pub fn walk<F>(&self, visit: &mut F)
    where
        F: FnMut(&TreePath, &TaggedNode),
    {
        let mut path = TreePath::root();
        self.walk_inner(&mut path, visit);
    }

    fn walk_inner<F>(&self, path: &mut TreePath, visit: &mut F)
    where
        F: FnMut(&TreePath, &TaggedNode),
    {
        visit(path, self);
        match &self.value {
            NodeValue::Mapping(m) => {
                for (key, child) in m {
                    path.push(PathSegment::Key(key.clone()));
                    child.walk_inner(path, visit);
                    path.pop();
                }
            }
            NodeValue::Sequence(s) => {
                for (i, child) in s.iter().enumerate() {
                    path.push(PathSegment::Index(i));
                    child.walk_inner(path, visit);
                    path.pop();
                }
            }
            _ => {}
        }
    }
}

// Structural equality: tag and value only. Rendering hints are excluded, and
// NaN compares equal to NaN so masked-value sentinels round-trip.
impl PartialEq for TaggedNode {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && node_value_eq(&self.value, &other.value)
    }
}

fn node_value_eq(a: &NodeValue, b: &NodeValue) -> bool {
    match (a, b) {
        (NodeValue::Null, NodeValue::Null) => true,
        (NodeValue::Bool(x), NodeValue::Bool(y)) => x == y,
        (NodeValue::Int(x), NodeValue::Int(y)) => x == y,
        (NodeValue::UInt(x), NodeValue::UInt(y)) => x == y,
        (NodeValue::Int(x), NodeValue::UInt(y)) | (NodeValue::UInt(y), NodeValue::Int(x)) => {
            u64::try_from(*x).map(|x| x == *y).unwrap_or(false)
        }
        (NodeValue::Float(x), NodeValue::Float(y)) => x == y || (x.is_nan() && y.is_nan()),
        (NodeValue::String(x), NodeValue::String(y)) => x == y,
        (NodeValue::Sequence(x), NodeValue::Sequence(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| a == b)
        }
        (NodeValue::Mapping(x), NodeValue::Mapping(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).map(|w| v == w).unwrap_or(false))
        }
        _ => false,
    }
}

/// One step of a [`TreePath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Mapping key.
    Key(String),
    /// Sequence index.
    Index(usize),
}

/// Path from the tree root to a node, used in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TreePath {
    segments: Vec<PathSegment>,
}

impl TreePath {
    /// The empty path (the tree root).
    pub fn root() -> Self {
        TreePath::default()
    }

    /// Append a segment.
    pub fn push(&mut self, segment: PathSegment) {
        self.segments.push(segment);
    }

    /// Remove the last segment.
    pub fn pop(&mut self) {
        self.segments.pop();
    }

    /// The path segments, root first.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// A new path with one more segment.
    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        TreePath { segments }
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree")?;
        for segment in &self.segments {
            match segment {
                PathSegment::Key(k) => write!(f, ".{}", k)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mapping() -> TaggedNode {
        let mut m = IndexMap::new();
        m.insert("a".to_string(), TaggedNode::int(1));
        m.insert(
            "b".to_string(),
            TaggedNode::sequence(vec![TaggedNode::float(1.5), TaggedNode::null()]),
        );
        TaggedNode::mapping(m)
    }

    #[test]
    fn test_structural_equality_ignores_hints() {
        let mut a = sample_mapping();
        let b = sample_mapping();
        a.flow_style = Some(FlowStyle::Flow);
        a.property_order = Some(vec!["b".into(), "a".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_tag_participates_in_equality() {
        let a = TaggedNode::with_tag("tag:example.com/x-1.0.0", NodeValue::Int(1));
        let b = TaggedNode::int(1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_nan_equals_nan() {
        assert_eq!(TaggedNode::float(f64::NAN), TaggedNode::float(f64::NAN));
        assert_ne!(TaggedNode::float(f64::NAN), TaggedNode::float(0.0));
    }

    #[test]
    fn test_walk_paths() {
        let tree = sample_mapping();
        let mut seen = Vec::new();
        tree.walk(&mut |path, _node| seen.push(path.to_string()));
        assert_eq!(seen, vec!["tree", "tree.a", "tree.b", "tree.b[0]", "tree.b[1]"]);
    }

    #[test]
    fn test_reference_detection() {
        let mut m = IndexMap::new();
        m.insert("$ref".to_string(), TaggedNode::string("other.asdf#/data"));
        assert!(TaggedNode::mapping(m).is_reference());
        assert!(!sample_mapping().is_reference());
    }
}
