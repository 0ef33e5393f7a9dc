//! The per-operation context handed to every converter invocation.
//!
//! One context exists per open/write operation. It exposes the standard
//! version, the file URI, the active registry, and the block callbacks —
//! read-side callbacks during deserialization, block reservation during
//! serialization. Calling a read-side method on a write context (or vice
//! versa) is an error, as is generating a key that is never used.

use std::collections::{HashMap, HashSet};

use asdf_blocks::{BlockDataCallback, BlockKey, BlockManager, DataCallback};
use asdf_core::{AsdfError, NativeObject, Result};

use crate::registry::ExtensionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Serialize,
    Deserialize,
}

/// Context for one serialization or deserialization operation.
pub struct SerializationContext<'a> {
    version: String,
    url: Option<String>,
    registry: &'a ExtensionRegistry,
    blocks: &'a mut BlockManager,
    operation: Operation,
    extensions_used: HashSet<String>,

    // Deserialization state for the object currently being converted: the
    // keyless callback (at most one block without a key) and the keys the
    // converter generated, each of which must be used before the object is
    // finished.
    keyless_access: Option<(usize, BlockDataCallback)>,
    keys_to_assign: HashMap<BlockKey, Option<(usize, BlockDataCallback)>>,

    // Serialization state: the identity of the object currently being
    // converted, used to correlate keyless block reservations.
    current_identity: Option<usize>,
}

impl<'a> SerializationContext<'a> {
    /// Context for a write operation.
    pub fn for_serialization(
        version: String,
        url: Option<String>,
        registry: &'a ExtensionRegistry,
        blocks: &'a mut BlockManager,
    ) -> Self {
        SerializationContext {
            version,
            url,
            registry,
            blocks,
            operation: Operation::Serialize,
            extensions_used: HashSet::new(),
            keyless_access: None,
            keys_to_assign: HashMap::new(),
            current_identity: None,
        }
    }

    /// Context for a read operation.
    pub fn for_deserialization(
        version: String,
        url: Option<String>,
        registry: &'a ExtensionRegistry,
        blocks: &'a mut BlockManager,
    ) -> Self {
        SerializationContext {
            version,
            url,
            registry,
            blocks,
            operation: Operation::Deserialize,
            extensions_used: HashSet::new(),
            keyless_access: None,
            keys_to_assign: HashMap::new(),
            current_identity: None,
        }
    }

    /// The active ASDF Standard version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The URI of the file being read or written, when it has one.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Read-only view of the active extension registry.
    pub fn extension_manager(&self) -> &ExtensionRegistry {
        self.registry
    }

    /// The block manager, for engine-internal converters.
    pub fn blocks(&mut self) -> &mut BlockManager {
        self.blocks
    }

    /// Record that an extension's converter was exercised, for the
    /// history metadata appended on write.
    pub fn mark_extension_used(&mut self, extension_uri: &str) -> Result<()> {
        if !self.registry.has_extension(extension_uri) {
            return Err(AsdfError::NotAnExtension(extension_uri.to_string()));
        }
        self.extensions_used.insert(extension_uri.to_string());
        Ok(())
    }

    /// URIs of the extensions exercised so far.
    pub fn extensions_used(&self) -> &HashSet<String> {
        &self.extensions_used
    }

    /// Mint a key for correlating one of a converter's blocks across
    /// reads and writes.
    pub fn generate_block_key(&mut self) -> BlockKey {
        let key = BlockKey::generate();
        if self.operation == Operation::Deserialize {
            self.keys_to_assign.insert(key, None);
        }
        key
    }

    /// Deserialization: a zero-argument callback yielding the bytes of
    /// block `index`.
    ///
    /// A converter reading more than one block must pass a distinct key
    /// for each; a single keyless access is allowed.
    pub fn get_block_data_callback(
        &mut self,
        index: usize,
        key: Option<BlockKey>,
    ) -> Result<BlockDataCallback> {
        if self.operation != Operation::Deserialize {
            return Err(AsdfError::InvalidContextUsage(
                "get_block_data_callback is only available when deserializing".to_string(),
            ));
        }
        match key {
            None => {
                if let Some((existing_index, callback)) = &self.keyless_access {
                    if *existing_index == index {
                        return Ok(callback.clone());
                    }
                    return Err(AsdfError::ConverterBlockKeyRequired);
                }
                let callback = self.blocks.data_callback(index)?;
                self.keyless_access = Some((index, callback.clone()));
                Ok(callback)
            }
            Some(key) => {
                if let Some(Some((_, callback))) = self.keys_to_assign.get(&key) {
                    return Ok(callback.clone());
                }
                let callback = self.blocks.data_callback(index)?;
                self.keys_to_assign.insert(key, Some((index, callback.clone())));
                Ok(callback)
            }
        }
    }

    /// Serialization: reserve a block whose payload `data_callback` will
    /// produce at flush time, returning its index.
    ///
    /// Without a key the block is correlated with the object currently
    /// being serialized, so repeated writes of the same object reuse one
    /// block.
    pub fn find_available_block_index(
        &mut self,
        data_callback: DataCallback,
        key: Option<BlockKey>,
    ) -> Result<usize> {
        if self.operation != Operation::Serialize {
            return Err(AsdfError::InvalidContextUsage(
                "find_available_block_index is only available when serializing".to_string(),
            ));
        }
        match key {
            Some(key) => {
                if let Some(identity) = self.current_identity {
                    self.blocks.bind_key_owner(key, identity);
                }
                self.blocks.make_write_block(data_callback, key)
            }
            None => {
                // Keyless access correlates the block with the object
                // being serialized, so every write of the same object
                // reuses one block.
                let identity = self.current_identity.ok_or_else(|| {
                    AsdfError::InvalidContextUsage("no object is being serialized".to_string())
                })?;
                if let Some(index) = self.blocks.block_for_identity(identity) {
                    return Ok(index);
                }
                let key = BlockKey::generate();
                self.blocks.bind_key_owner(key, identity);
                let index = self.blocks.make_write_block(data_callback, key)?;
                self.blocks.bind_identity(identity, index);
                Ok(index)
            }
        }
    }

    /// Begin converting one object (both directions). Resets the
    /// per-object block access state.
    pub fn begin_object(&mut self, identity: Option<usize>) {
        self.current_identity = identity;
        self.keyless_access = None;
        self.keys_to_assign.clear();
    }

    /// Finish deserializing one object: bind the accessed blocks and keys
    /// to it so later writes reuse the same blocks.
    ///
    /// Fails with `UnusedBlockKey` when the converter generated a key it
    /// never passed to `get_block_data_callback`.
    pub fn end_object_deserialization(&mut self, obj: &NativeObject) -> Result<()> {
        if let Some((index, _)) = self.keyless_access.take() {
            self.blocks.bind_identity(obj.identity(), index);
        }
        for (key, assignment) in self.keys_to_assign.drain() {
            match assignment {
                Some((index, _)) => {
                    self.blocks.bind_key(key, index);
                    self.blocks.bind_key_owner(key, obj.identity());
                }
                None => return Err(AsdfError::UnusedBlockKey),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::ExtensionEntry;
    use std::sync::Arc;

    fn registry() -> ExtensionRegistry {
        ExtensionRegistry::from_extensions(Vec::new())
    }

    fn manager_with_blocks(n: usize) -> BlockManager {
        let mut manager = BlockManager::new();
        for i in 0..n {
            manager
                .find_or_create_block_for_data(i + 1, || Arc::new(vec![i as u8; 4]))
                .unwrap();
        }
        manager
    }

    #[test]
    fn test_wrong_direction_is_error() {
        let registry = registry();
        let mut blocks = manager_with_blocks(1);
        let mut write_ctx = SerializationContext::for_serialization(
            "1.5.0".to_string(),
            None,
            &registry,
            &mut blocks,
        );
        assert!(matches!(
            write_ctx.get_block_data_callback(0, None),
            Err(AsdfError::InvalidContextUsage(_))
        ));

        let mut blocks = manager_with_blocks(1);
        let mut read_ctx = SerializationContext::for_deserialization(
            "1.5.0".to_string(),
            None,
            &registry,
            &mut blocks,
        );
        assert!(matches!(
            read_ctx.find_available_block_index(Arc::new(|| Vec::new()), None),
            Err(AsdfError::InvalidContextUsage(_))
        ));
    }

    #[test]
    fn test_keyless_multi_block_access_requires_keys() {
        let registry = registry();
        let mut blocks = manager_with_blocks(2);
        let mut ctx = SerializationContext::for_deserialization(
            "1.5.0".to_string(),
            None,
            &registry,
            &mut blocks,
        );
        ctx.begin_object(None);
        ctx.get_block_data_callback(0, None).unwrap();
        // Same block again is fine.
        ctx.get_block_data_callback(0, None).unwrap();
        assert!(matches!(
            ctx.get_block_data_callback(1, None),
            Err(AsdfError::ConverterBlockKeyRequired)
        ));
    }

    #[test]
    fn test_unused_key_fails_at_assignment() {
        let registry = registry();
        let mut blocks = manager_with_blocks(1);
        let mut ctx = SerializationContext::for_deserialization(
            "1.5.0".to_string(),
            None,
            &registry,
            &mut blocks,
        );
        ctx.begin_object(None);
        let _unused = ctx.generate_block_key();
        let obj = NativeObject::new(17u32);
        assert!(matches!(
            ctx.end_object_deserialization(&obj),
            Err(AsdfError::UnusedBlockKey)
        ));
    }

    #[test]
    fn test_keys_bound_after_object_construction() {
        let registry = registry();
        let mut blocks = manager_with_blocks(2);
        let mut ctx = SerializationContext::for_deserialization(
            "1.5.0".to_string(),
            None,
            &registry,
            &mut blocks,
        );
        ctx.begin_object(None);
        let key_a = ctx.generate_block_key();
        let key_b = ctx.generate_block_key();
        ctx.get_block_data_callback(0, Some(key_a)).unwrap();
        ctx.get_block_data_callback(1, Some(key_b)).unwrap();
        let obj = NativeObject::new(17u32);
        ctx.end_object_deserialization(&obj).unwrap();

        assert_eq!(blocks.block_for_key(key_a), Some(0));
        assert_eq!(blocks.block_for_key(key_b), Some(1));
    }

    #[test]
    fn test_write_block_reuse_via_implicit_key() {
        let registry = registry();
        let mut blocks = BlockManager::new();
        let mut ctx = SerializationContext::for_serialization(
            "1.5.0".to_string(),
            None,
            &registry,
            &mut blocks,
        );
        ctx.begin_object(Some(0xABC));
        let a = ctx
            .find_available_block_index(Arc::new(|| vec![1, 2, 3]), None)
            .unwrap();
        let b = ctx
            .find_available_block_index(Arc::new(|| vec![1, 2, 3]), None)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mark_extension_used_requires_registered_extension() {
        struct Plain;
        impl crate::extension::Extension for Plain {
            fn extension_uri(&self) -> &str {
                "asdf://example.com/extensions/plain-1.0.0"
            }
        }
        let registry =
            ExtensionRegistry::from_extensions(vec![ExtensionEntry::new(Arc::new(Plain))]);
        let mut blocks = BlockManager::new();
        let mut ctx = SerializationContext::for_serialization(
            "1.5.0".to_string(),
            None,
            &registry,
            &mut blocks,
        );
        ctx.mark_extension_used("asdf://example.com/extensions/plain-1.0.0").unwrap();
        assert!(matches!(
            ctx.mark_extension_used("asdf://example.com/extensions/other-1.0.0"),
            Err(AsdfError::NotAnExtension(_))
        ));
        assert_eq!(ctx.extensions_used().len(), 1);
    }
}
