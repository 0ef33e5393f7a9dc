//! JSON References (`{"$ref": "<uri>"}`) in the tree.
//!
//! On load, reference mappings become [`Reference`] objects and their
//! subtrees are left untouched by validation. `AsdfFile::resolve_references`
//! replaces each with the target node, loading external files on demand.

use asdf_core::{AsdfError, AsdfValue, Result};

/// An unresolved reference to a node in this or another file.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    /// The target: a file URI, optionally with a `#/json/pointer`
    /// fragment. An empty base refers to the current file.
    pub uri: String,
}

impl Reference {
    /// Reference to `uri`.
    pub fn new(uri: impl Into<String>) -> Self {
        Reference { uri: uri.into() }
    }

    /// Reference to a path within the current file.
    pub fn local(path: &[&str]) -> Self {
        let mut pointer = String::from("#");
        for segment in path {
            pointer.push('/');
            pointer.push_str(&segment.replace('~', "~0").replace('/', "~1"));
        }
        Reference { uri: pointer }
    }
}

/// Follow a JSON pointer (`/a/0/b`) into a native tree.
pub fn resolve_fragment<'a>(root: &'a AsdfValue, pointer: &str) -> Result<&'a AsdfValue> {
    let mut current = root;
    if pointer.is_empty() || pointer == "/" {
        return Ok(current);
    }
    for token in pointer.trim_start_matches('/').split('/') {
        let token = token.replace("~1", "/").replace("~0", "~");
        current = match current {
            AsdfValue::Mapping(entries) => entries.get(&token).ok_or_else(|| {
                AsdfError::ReferenceUnresolved {
                    uri: format!("#{}", pointer),
                    reason: format!("no property '{}'", token),
                }
            })?,
            AsdfValue::Sequence(items) => {
                let index: usize = token.parse().map_err(|_| AsdfError::ReferenceUnresolved {
                    uri: format!("#{}", pointer),
                    reason: format!("'{}' is not a sequence index", token),
                })?;
                items.get(index).ok_or_else(|| AsdfError::ReferenceUnresolved {
                    uri: format!("#{}", pointer),
                    reason: format!("index {} out of range", index),
                })?
            }
            _ => {
                return Err(AsdfError::ReferenceUnresolved {
                    uri: format!("#{}", pointer),
                    reason: format!("cannot index a scalar with '{}'", token),
                })
            }
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn sample() -> AsdfValue {
        let mut inner = IndexMap::new();
        inner.insert(
            "items".to_string(),
            AsdfValue::Sequence(vec![AsdfValue::Int(10), AsdfValue::Int(20)]),
        );
        let mut root = IndexMap::new();
        root.insert("data".to_string(), AsdfValue::Mapping(inner));
        AsdfValue::Mapping(root)
    }

    #[test]
    fn test_resolve_fragment() {
        let tree = sample();
        let node = resolve_fragment(&tree, "/data/items/1").unwrap();
        assert!(matches!(node, AsdfValue::Int(20)));
    }

    #[test]
    fn test_missing_fragment() {
        let tree = sample();
        let err = resolve_fragment(&tree, "/data/absent").unwrap_err();
        assert!(matches!(err, AsdfError::ReferenceUnresolved { .. }));
    }

    #[test]
    fn test_local_reference_pointer() {
        let reference = Reference::local(&["data", "items"]);
        assert_eq!(reference.uri, "#/data/items");
    }
}
