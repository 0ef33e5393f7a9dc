//! The block compression interface.
//!
//! No codecs are built in; extensions register [`Compressor`]s keyed by
//! their four-byte label (`zlib`, `bzp2`, ...). A block carrying a label
//! with no registered compressor is an error naming the label.

use std::collections::HashMap;
use std::sync::Arc;

use asdf_core::{AsdfError, Result};

/// A pluggable block compression codec.
pub trait Compressor: Send + Sync {
    /// Four-byte label stored in block headers.
    fn label(&self) -> [u8; 4];

    /// Compress a payload.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress a payload. `data_size` is the expected decompressed size
    /// from the block header.
    fn decompress(&self, data: &[u8], data_size: usize) -> Result<Vec<u8>>;
}

/// Compressors indexed by label.
#[derive(Default, Clone)]
pub struct CompressorRegistry {
    by_label: HashMap<[u8; 4], Arc<dyn Compressor>>,
}

impl CompressorRegistry {
    /// New empty registry.
    pub fn new() -> Self {
        CompressorRegistry::default()
    }

    /// Register a compressor. The first registration for a label wins.
    pub fn register(&mut self, compressor: Arc<dyn Compressor>) {
        self.by_label.entry(compressor.label()).or_insert(compressor);
    }

    /// Look up the compressor for a label.
    pub fn get(&self, label: &[u8; 4]) -> Result<&Arc<dyn Compressor>> {
        self.by_label.get(label).ok_or_else(|| {
            AsdfError::Value(format!(
                "no compressor registered for label '{}'",
                String::from_utf8_lossy(&label.iter().copied().take_while(|b| *b != 0).collect::<Vec<_>>())
            ))
        })
    }

    /// `true` when a compressor for the label is registered.
    pub fn contains(&self, label: &[u8; 4]) -> bool {
        self.by_label.contains_key(label)
    }
}

/// Parse a textual compression label (`"zlib"`) into header form.
pub fn parse_label(label: &str) -> Result<[u8; 4]> {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(AsdfError::Value(format!(
            "compression label must be 1-4 bytes, got '{}'",
            label
        )));
    }
    let mut out = [0u8; 4];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    impl Compressor for Doubler {
        fn label(&self) -> [u8; 4] {
            *b"dbl\0"
        }
        fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.iter().flat_map(|b| [*b, *b]).collect())
        }
        fn decompress(&self, data: &[u8], _data_size: usize) -> Result<Vec<u8>> {
            Ok(data.iter().step_by(2).copied().collect())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = CompressorRegistry::new();
        registry.register(Arc::new(Doubler));
        let compressor = registry.get(b"dbl\0").unwrap();
        let compressed = compressor.compress(&[1, 2]).unwrap();
        assert_eq!(compressed, vec![1, 1, 2, 2]);
        assert_eq!(compressor.decompress(&compressed, 2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_missing_label_names_label() {
        let registry = CompressorRegistry::new();
        let err = match registry.get(b"zlib") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(err.to_string().contains("zlib"));
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(parse_label("zlib").unwrap(), *b"zlib");
        assert_eq!(parse_label("lz4").unwrap(), *b"lz4\0");
        assert!(parse_label("toolong").is_err());
    }
}
