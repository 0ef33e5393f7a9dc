//! Lazy block payloads.
//!
//! A payload is not loaded when its header is read. Forcing it either
//! memory-maps the range (seekable real file with mapping enabled) or reads
//! it into a heap buffer; the result is cached for the life of the block.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use asdf_core::Result;
use asdf_io::{GenericFile, MappedRegion};

/// Shared handle to the file a payload loads from.
pub type SharedFile = Arc<Mutex<Box<dyn GenericFile>>>;

/// Write-time payload producer supplied by a converter.
pub type DataCallback = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Read-time callback handed to converters: yields the block's bytes.
pub type BlockDataCallback = Arc<dyn Fn() -> Result<PayloadBytes> + Send + Sync>;

/// Where a payload's bytes come from before it is forced.
pub enum PayloadSource {
    /// A range of an open file, loaded or mapped on demand.
    File {
        /// Handle to the open file.
        fd: SharedFile,
        /// Offset of the first payload byte.
        data_offset: u64,
        /// Number of used bytes.
        len: u64,
        /// Prefer memory mapping when the file supports it.
        memmap: bool,
    },
    /// Bytes already in memory.
    Owned(Arc<Vec<u8>>),
    /// Bytes produced by a converter callback at flush time.
    Deferred(DataCallback),
}

/// Loaded payload bytes, cheaply cloneable.
#[derive(Clone)]
pub enum PayloadBytes {
    /// Backed by a memory-mapped region.
    Mapped(MappedRegion),
    /// Backed by a heap buffer.
    Owned(Arc<Vec<u8>>),
}

impl PayloadBytes {
    /// The payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            PayloadBytes::Mapped(region) => region.as_slice(),
            PayloadBytes::Owned(bytes) => bytes.as_slice(),
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// `true` when empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when backed by a memory mapping.
    pub fn is_mapped(&self) -> bool {
        matches!(self, PayloadBytes::Mapped(_))
    }
}

impl std::fmt::Debug for PayloadBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadBytes::Mapped(r) => write!(f, "PayloadBytes::Mapped({} bytes)", r.len()),
            PayloadBytes::Owned(b) => write!(f, "PayloadBytes::Owned({} bytes)", b.len()),
        }
    }
}

/// A payload that loads itself at most once.
pub struct LazyPayload {
    source: Mutex<PayloadSource>,
    cell: OnceCell<PayloadBytes>,
}

impl LazyPayload {
    /// Payload backed by a file range.
    pub fn from_file(fd: SharedFile, data_offset: u64, len: u64, memmap: bool) -> Arc<Self> {
        Arc::new(LazyPayload {
            source: Mutex::new(PayloadSource::File {
                fd,
                data_offset,
                len,
                memmap,
            }),
            cell: OnceCell::new(),
        })
    }

    /// Payload already in memory.
    pub fn from_owned(bytes: Arc<Vec<u8>>) -> Arc<Self> {
        Arc::new(LazyPayload {
            source: Mutex::new(PayloadSource::Owned(bytes)),
            cell: OnceCell::new(),
        })
    }

    /// Payload produced by a converter callback at flush time.
    pub fn from_callback(callback: DataCallback) -> Arc<Self> {
        Arc::new(LazyPayload {
            source: Mutex::new(PayloadSource::Deferred(callback)),
            cell: OnceCell::new(),
        })
    }

    /// Force the payload, returning (and caching) its bytes.
    pub fn bytes(&self) -> Result<PayloadBytes> {
        if let Some(loaded) = self.cell.get() {
            return Ok(loaded.clone());
        }
        let loaded = self.load()?;
        // A concurrent load of the same payload yields identical bytes, so
        // whichever insertion wins is fine.
        let _ = self.cell.set(loaded.clone());
        Ok(self.cell.get().cloned().unwrap_or(loaded))
    }

    /// `true` if the payload has been forced already.
    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    /// `true` if the forced payload is a memory mapping.
    pub fn is_mapped(&self) -> bool {
        self.cell.get().map(|b| b.is_mapped()).unwrap_or(false)
    }

    /// Redirect an unforced payload at a new file range. Used by in-place
    /// update when a block's bytes move; a forced payload keeps whatever it
    /// loaded.
    pub fn rebind(&self, fd: SharedFile, data_offset: u64, len: u64, memmap: bool) {
        *self.source.lock() = PayloadSource::File {
            fd,
            data_offset,
            len,
            memmap,
        };
    }

    fn load(&self) -> Result<PayloadBytes> {
        let source = self.source.lock();
        match &*source {
            PayloadSource::Owned(bytes) => Ok(PayloadBytes::Owned(Arc::clone(bytes))),
            PayloadSource::Deferred(callback) => Ok(PayloadBytes::Owned(Arc::new(callback()))),
            PayloadSource::File {
                fd,
                data_offset,
                len,
                memmap,
            } => {
                let mut fd = fd.lock();
                if *memmap && fd.can_memmap() {
                    let region = fd.memmap(*data_offset, *len as usize)?;
                    return Ok(PayloadBytes::Mapped(region));
                }
                // Restore the position afterwards so header scans that are
                // in flight are not disturbed.
                let saved = fd.tell()?;
                fd.seek(std::io::SeekFrom::Start(*data_offset))?;
                let mut buffer = vec![0u8; *len as usize];
                let result = fd.read_exact(&mut buffer);
                fd.seek(std::io::SeekFrom::Start(saved))?;
                result?;
                Ok(PayloadBytes::Owned(Arc::new(buffer)))
            }
        }
    }
}

impl std::fmt::Debug for LazyPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LazyPayload(loaded: {})", self.is_loaded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asdf_io::MemoryFile;

    fn shared(bytes: Vec<u8>) -> SharedFile {
        Arc::new(Mutex::new(Box::new(MemoryFile::from_bytes(bytes)) as Box<dyn GenericFile>))
    }

    #[test]
    fn test_file_payload_loads_once() {
        let fd = shared(b"xxHELLOyy".to_vec());
        let payload = LazyPayload::from_file(fd, 2, 5, false);
        assert!(!payload.is_loaded());
        assert_eq!(payload.bytes().unwrap().as_slice(), b"HELLO");
        assert!(payload.is_loaded());
        assert_eq!(payload.bytes().unwrap().as_slice(), b"HELLO");
    }

    #[test]
    fn test_deferred_payload() {
        let payload = LazyPayload::from_callback(Arc::new(|| vec![1, 2, 3]));
        assert_eq!(payload.bytes().unwrap().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_rebind_before_force() {
        let fd = shared(b"AABBB".to_vec());
        let payload = LazyPayload::from_file(Arc::clone(&fd), 0, 2, false);
        payload.rebind(fd, 2, 3, false);
        assert_eq!(payload.bytes().unwrap().as_slice(), b"BBB");
    }
}
