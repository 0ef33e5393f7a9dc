//! Opaque keys correlating converter objects with their blocks.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// An opaque, hashable identifier minted by the serialization context.
///
/// A converter that stores several blocks for one object generates one key
/// per block so reads and writes can be correlated. Keys minted during read
/// are bound to the reconstructed object once it exists; keys minted during
/// write are bound to the object being serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey(u64);

impl BlockKey {
    /// Mint a fresh, process-unique key.
    pub fn generate() -> Self {
        BlockKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_unique() {
        let a = BlockKey::generate();
        let b = BlockKey::generate();
        assert_ne!(a, b);
    }
}
