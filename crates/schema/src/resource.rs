//! URI → bytes providers for schemas and manifests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use asdf_core::{AsdfError, Result};

/// A source of schema/manifest documents addressed by URI.
pub trait ResourceProvider: Send + Sync {
    /// The bytes for `uri`, when this provider has them.
    fn get(&self, uri: &str) -> Option<Vec<u8>>;

    /// Every URI this provider can serve.
    fn uris(&self) -> Vec<String>;
}

/// Resources held in a map.
#[derive(Default)]
pub struct InMemoryResourceProvider {
    resources: HashMap<String, Vec<u8>>,
}

impl InMemoryResourceProvider {
    /// New empty provider.
    pub fn new() -> Self {
        InMemoryResourceProvider::default()
    }

    /// Add a resource, replacing any previous content for the URI.
    pub fn insert(&mut self, uri: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.resources.insert(uri.into(), content.into());
    }
}

impl ResourceProvider for InMemoryResourceProvider {
    fn get(&self, uri: &str) -> Option<Vec<u8>> {
        self.resources.get(uri).cloned()
    }

    fn uris(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }
}

/// Resources loaded from a directory tree.
///
/// A file `<root>/a/b.yaml` is served as `<prefix>/a/b`: the relative path
/// with its extension stripped, appended to the URI prefix.
pub struct DirectoryResourceProvider {
    root: PathBuf,
    uri_prefix: String,
    recursive: bool,
}

impl DirectoryResourceProvider {
    /// Serve `*.yaml` files under `root` with URIs starting at `uri_prefix`.
    pub fn new(root: impl Into<PathBuf>, uri_prefix: impl Into<String>, recursive: bool) -> Self {
        DirectoryResourceProvider {
            root: root.into(),
            uri_prefix: uri_prefix.into(),
            recursive,
        }
    }

    fn uri_to_path(&self, uri: &str) -> Option<PathBuf> {
        let rest = uri.strip_prefix(&self.uri_prefix)?.strip_prefix('/')?;
        if rest.is_empty() || rest.contains("..") {
            return None;
        }
        Some(self.root.join(format!("{}.yaml", rest)))
    }

    fn collect(&self, dir: &Path, rel: &str, out: &mut Vec<String>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if path.is_dir() {
                if self.recursive {
                    let child = if rel.is_empty() {
                        name.to_string()
                    } else {
                        format!("{}/{}", rel, name)
                    };
                    self.collect(&path, &child, out);
                }
            } else if let Some(stem) = name.strip_suffix(".yaml") {
                let rel_uri = if rel.is_empty() {
                    stem.to_string()
                } else {
                    format!("{}/{}", rel, stem)
                };
                out.push(format!("{}/{}", self.uri_prefix, rel_uri));
            }
        }
    }
}

impl ResourceProvider for DirectoryResourceProvider {
    fn get(&self, uri: &str) -> Option<Vec<u8>> {
        let path = self.uri_to_path(uri)?;
        std::fs::read(path).ok()
    }

    fn uris(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect(&self.root, "", &mut out);
        out.sort();
        out
    }
}

/// URI of the JSON Schema draft-04 metaschema.
pub const DRAFT04_URI: &str = "http://json-schema.org/draft-04/schema";

/// The subset of the draft-04 metaschema the engine relies on. Schemas are
/// trusted to be valid; this document exists so `$ref`s to the metaschema
/// resolve.
const DRAFT04_METASCHEMA: &str = r##"{
    "id": "http://json-schema.org/draft-04/schema#",
    "$schema": "http://json-schema.org/draft-04/schema#",
    "description": "Core schema meta-schema",
    "type": "object",
    "properties": {
        "id": {"type": "string"},
        "$schema": {"type": "string"},
        "title": {"type": "string"},
        "description": {"type": "string"},
        "default": {},
        "type": {},
        "enum": {"type": "array", "minItems": 1},
        "properties": {"type": "object", "additionalProperties": {"$ref": "#"}},
        "patternProperties": {"type": "object", "additionalProperties": {"$ref": "#"}},
        "additionalProperties": {},
        "items": {},
        "additionalItems": {},
        "required": {"type": "array", "items": {"type": "string"}},
        "minItems": {"type": "integer", "minimum": 0},
        "maxItems": {"type": "integer", "minimum": 0},
        "uniqueItems": {"type": "boolean"},
        "minLength": {"type": "integer", "minimum": 0},
        "maxLength": {"type": "integer", "minimum": 0},
        "pattern": {"type": "string", "format": "regex"},
        "minimum": {"type": "number"},
        "maximum": {"type": "number"},
        "exclusiveMinimum": {"type": "boolean"},
        "exclusiveMaximum": {"type": "boolean"},
        "multipleOf": {"type": "number"},
        "allOf": {"type": "array", "items": {"$ref": "#"}},
        "anyOf": {"type": "array", "items": {"$ref": "#"}},
        "oneOf": {"type": "array", "items": {"$ref": "#"}},
        "not": {"$ref": "#"},
        "definitions": {"type": "object", "additionalProperties": {"$ref": "#"}}
    },
    "default": {}
}"##;

/// Provider serving the built-in JSON Schema draft-04 metaschema.
pub fn metaschema_provider() -> InMemoryResourceProvider {
    let mut provider = InMemoryResourceProvider::new();
    provider.insert(DRAFT04_URI, DRAFT04_METASCHEMA.as_bytes().to_vec());
    provider
}

/// Layers providers with first-wins precedence.
#[derive(Clone)]
pub struct ResourceStore {
    providers: Vec<Arc<dyn ResourceProvider>>,
}

impl ResourceStore {
    /// Store with only the built-in metaschema provider.
    pub fn new() -> Self {
        ResourceStore {
            providers: vec![Arc::new(metaschema_provider())],
        }
    }

    /// Store over an explicit provider list; earlier providers win.
    pub fn from_providers(providers: Vec<Arc<dyn ResourceProvider>>) -> Self {
        ResourceStore { providers }
    }

    /// Add a provider with lowest precedence.
    pub fn push(&mut self, provider: Arc<dyn ResourceProvider>) {
        self.providers.push(provider);
    }

    /// Add a provider with highest precedence.
    pub fn push_front(&mut self, provider: Arc<dyn ResourceProvider>) {
        self.providers.insert(0, provider);
    }

    /// Load the bytes for `uri` from the first provider that has them.
    pub fn load(&self, uri: &str) -> Result<Vec<u8>> {
        for provider in &self.providers {
            if let Some(content) = provider.get(uri) {
                return Ok(content);
            }
        }
        Err(AsdfError::ResourceMissing { uri: uri.to_string() })
    }

    /// `true` when some provider can serve `uri`.
    pub fn contains(&self, uri: &str) -> bool {
        self.providers.iter().any(|p| p.get(uri).is_some())
    }

    /// Every servable URI, first-wins deduplicated.
    pub fn uris(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for provider in &self.providers {
            for uri in provider.uris() {
                if seen.insert(uri.clone()) {
                    out.push(uri);
                }
            }
        }
        out
    }
}

impl Default for ResourceStore {
    fn default() -> Self {
        ResourceStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_provider_wins() {
        let mut a = InMemoryResourceProvider::new();
        a.insert("asdf://example.com/schemas/thing-1.0.0", b"from a".to_vec());
        let mut b = InMemoryResourceProvider::new();
        b.insert("asdf://example.com/schemas/thing-1.0.0", b"from b".to_vec());

        let store = ResourceStore::from_providers(vec![Arc::new(a), Arc::new(b)]);
        assert_eq!(
            store.load("asdf://example.com/schemas/thing-1.0.0").unwrap(),
            b"from a"
        );
    }

    #[test]
    fn test_missing_uri() {
        let store = ResourceStore::new();
        let err = store.load("asdf://example.com/absent-1.0.0").unwrap_err();
        assert!(matches!(err, AsdfError::ResourceMissing { .. }));
    }

    #[test]
    fn test_metaschema_available() {
        let store = ResourceStore::new();
        assert!(store.contains(DRAFT04_URI));
    }

    #[test]
    fn test_directory_provider() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("thing-1.0.0.yaml"), b"type: object").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/other-1.0.0.yaml"), b"type: array").unwrap();

        let provider =
            DirectoryResourceProvider::new(dir.path(), "asdf://example.com/schemas", true);
        let mut uris = provider.uris();
        uris.sort();
        assert_eq!(
            uris,
            vec![
                "asdf://example.com/schemas/nested/other-1.0.0",
                "asdf://example.com/schemas/thing-1.0.0",
            ]
        );
        assert_eq!(
            provider.get("asdf://example.com/schemas/thing-1.0.0").unwrap(),
            b"type: object"
        );
        assert!(provider.get("asdf://example.com/schemas/../../etc/passwd").is_none());
    }

    #[test]
    fn test_non_recursive_directory_provider() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/other-1.0.0.yaml"), b"{}").unwrap();
        let provider =
            DirectoryResourceProvider::new(dir.path(), "asdf://example.com/schemas", false);
        assert!(provider.uris().is_empty());
    }
}
