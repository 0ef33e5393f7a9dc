//! Schema loading and caching.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use asdf_core::{AsdfError, Result};

use crate::resource::ResourceStore;

/// Loads schema documents through a [`ResourceStore`] and caches them by
/// resolved URI.
///
/// Loaded documents are immutable (`Arc`), so clones of the loader share
/// one cache and readers only hold the lock long enough to clone a
/// pointer.
#[derive(Clone)]
pub struct SchemaLoader {
    store: Arc<ResourceStore>,
    cache: Arc<Mutex<HashMap<String, Arc<serde_json::Value>>>>,
}

impl SchemaLoader {
    /// Loader over a resource store.
    pub fn new(store: Arc<ResourceStore>) -> Self {
        SchemaLoader {
            store,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The underlying resource store.
    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    /// Load (or fetch from cache) the schema at `uri`.
    ///
    /// Schemas are written in YAML; JSON documents parse through the same
    /// path since YAML is a superset.
    pub fn load(&self, uri: &str) -> Result<Arc<serde_json::Value>> {
        // Fragments address into the document; the cache key is the base.
        let (base, fragment) = split_fragment(uri);

        let document = {
            let cached = self.cache.lock().get(base).cloned();
            match cached {
                Some(doc) => doc,
                None => {
                    let bytes = self.store.load(base)?;
                    let parsed: serde_json::Value =
                        serde_yaml::from_slice(&bytes).map_err(|e| {
                            AsdfError::Value(format!("failed to parse schema '{}': {}", base, e))
                        })?;
                    debug!(uri = base, "loaded schema");
                    let doc = Arc::new(parsed);
                    self.cache.lock().insert(base.to_string(), Arc::clone(&doc));
                    doc
                }
            }
        };

        match fragment {
            None | Some("") => Ok(document),
            Some(pointer) => {
                let resolved = resolve_pointer(&document, pointer).ok_or_else(|| {
                    AsdfError::Value(format!("schema fragment '#{}' not found in '{}'", pointer, base))
                })?;
                Ok(Arc::new(resolved.clone()))
            }
        }
    }
}

fn split_fragment(uri: &str) -> (&str, Option<&str>) {
    match uri.find('#') {
        Some(idx) => (&uri[..idx], Some(&uri[idx + 1..])),
        None => (uri, None),
    }
}

/// Resolve a JSON pointer (`/definitions/foo`) within a document.
pub fn resolve_pointer<'a>(document: &'a serde_json::Value, pointer: &str) -> Option<&'a serde_json::Value> {
    if pointer.is_empty() {
        return Some(document);
    }
    let mut current = document;
    for token in pointer.trim_start_matches('/').split('/') {
        let token = token.replace("~1", "/").replace("~0", "~");
        current = match current {
            serde_json::Value::Object(map) => map.get(&token)?,
            serde_json::Value::Array(items) => items.get(token.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
