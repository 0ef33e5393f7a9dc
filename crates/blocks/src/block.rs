//! A single binary block and its lifecycle.

use std::sync::Arc;

use asdf_core::constants::BLOCK_HEADER_BOILERPLATE_SIZE;
use asdf_core::{AsdfError, BlockStorage, Result};
use asdf_io::GenericFile;

use crate::compression::CompressorRegistry;
use crate::header::{read_block_header, write_block_header, BlockHeader, NO_COMPRESSION};
use crate::payload::{DataCallback, LazyPayload, PayloadBytes, SharedFile};

/// A binary block: header bookkeeping plus a lazily-loaded payload.
///
/// Blocks are owned exclusively by the `BlockManager`; arrays refer to them
/// weakly through block keys and payload handles.
#[derive(Debug)]
pub struct Block {
    storage: BlockStorage,
    /// Offset of the block magic in the file, once known.
    offset: Option<u64>,
    /// Header length on disk, excluding magic and length prefix.
    header_size: usize,
    allocated: u64,
    used: u64,
    data_size: u64,
    compression: [u8; 4],
    checksum: Option<[u8; 16]>,
    payload: Arc<LazyPayload>,
}

impl Block {
    /// Block over bytes already in memory.
    pub fn from_data(data: Arc<Vec<u8>>, storage: BlockStorage) -> Self {
        let len = data.len() as u64;
        Block {
            storage,
            offset: None,
            header_size: asdf_core::constants::BLOCK_HEADER_SIZE,
            allocated: len,
            used: len,
            data_size: len,
            compression: NO_COMPRESSION,
            checksum: None,
            payload: LazyPayload::from_owned(data),
        }
    }

    /// Block whose payload a converter produces at flush time.
    pub fn from_callback(callback: DataCallback) -> Self {
        Block {
            storage: BlockStorage::Internal,
            offset: None,
            header_size: asdf_core::constants::BLOCK_HEADER_SIZE,
            allocated: 0,
            used: 0,
            data_size: 0,
            compression: NO_COMPRESSION,
            checksum: None,
            payload: LazyPayload::from_callback(callback),
        }
    }

    /// The streamed (open-ended) block. Its payload is written by the
    /// caller after the file body, so it owns no bytes here.
    pub fn streamed() -> Self {
        Block {
            storage: BlockStorage::Streamed,
            offset: None,
            header_size: asdf_core::constants::BLOCK_HEADER_SIZE,
            allocated: 0,
            used: 0,
            data_size: 0,
            compression: NO_COMPRESSION,
            checksum: None,
            payload: LazyPayload::from_owned(Arc::new(Vec::new())),
        }
    }

    /// Read the block at the current position of `fd`.
    ///
    /// Only the header is consumed eagerly; the payload stays lazy. With
    /// `past_magic` the position is just after the magic token. Returns
    /// `None` on a clean end of the block sequence.
    pub fn read(fd: &SharedFile, past_magic: bool, memmap: bool) -> Result<Option<Block>> {
        let raw = {
            let mut guard = fd.lock();
            match read_block_header(guard.as_mut(), past_magic)? {
                Some(raw) => raw,
                None => return Ok(None),
            }
        };

        let (storage, used, allocated) = if raw.header.is_streamed() {
            // A streamed block extends to the end of the file.
            let mut guard = fd.lock();
            let end = guard.len()?;
            guard.seek(std::io::SeekFrom::End(0))?;
            let len = end.saturating_sub(raw.data_offset);
            (BlockStorage::Streamed, len, len)
        } else {
            let mut guard = fd.lock();
            guard.fast_forward(raw.header.allocated_size as i64)?;
            (
                BlockStorage::Internal,
                raw.header.used_size,
                raw.header.allocated_size,
            )
        };

        let checksum = if raw.header.checksum == [0; 16] {
            None
        } else {
            Some(raw.header.checksum)
        };

        Ok(Some(Block {
            storage,
            offset: Some(raw.offset),
            header_size: raw.header_size as usize,
            allocated,
            used,
            data_size: if raw.header.is_streamed() { used } else { raw.header.data_size },
            compression: raw.header.compression,
            checksum,
            payload: LazyPayload::from_file(Arc::clone(fd), raw.data_offset, used, memmap),
        }))
    }

    /// Force and (when labeled) compress the payload, updating sizes and
    /// checksum. Returns the bytes as they will be stored.
    pub fn prepare(&mut self, compressors: &CompressorRegistry) -> Result<Vec<u8>> {
        let bytes = self.payload.bytes()?;
        let data = bytes.as_slice();
        self.data_size = data.len() as u64;

        let stored = if self.compression == NO_COMPRESSION {
            data.to_vec()
        } else {
            compressors.get(&self.compression)?.compress(data)?
        };

        self.used = stored.len() as u64;
        if self.allocated < self.used {
            self.allocated = self.used;
        }
        self.checksum = Some(md5::compute(&stored).0);
        Ok(stored)
    }

    /// Write header and payload at the current position, updating offset,
    /// sizes and checksum. Padding out to the allocation is the caller's
    /// business.
    pub fn write(&mut self, fd: &mut dyn GenericFile, compressors: &CompressorRegistry) -> Result<()> {
        self.offset = Some(fd.tell()?);
        self.header_size = asdf_core::constants::BLOCK_HEADER_SIZE;

        if self.storage == BlockStorage::Streamed {
            let header = BlockHeader {
                flags: asdf_core::constants::BLOCK_FLAG_STREAMED,
                compression: NO_COMPRESSION,
                allocated_size: 0,
                used_size: 0,
                data_size: 0,
                checksum: [0; 16],
            };
            return write_block_header(fd, &header);
        }

        let stored = self.prepare(compressors)?;
        let header = BlockHeader {
            flags: 0,
            compression: self.compression,
            allocated_size: self.allocated,
            used_size: self.used,
            data_size: self.data_size,
            checksum: self.checksum.expect("prepare sets the checksum"),
        };
        write_block_header(fd, &header)?;
        fd.write_all(&stored)?;
        Ok(())
    }

    /// The payload bytes, forcing a load or mapping on first use.
    ///
    /// Compressed payloads are decompressed through the registry.
    pub fn data(&self, compressors: &CompressorRegistry) -> Result<PayloadBytes> {
        let bytes = self.payload.bytes()?;
        if self.compression == NO_COMPRESSION {
            return Ok(bytes);
        }
        let compressor = compressors.get(&self.compression)?;
        let decompressed = compressor.decompress(bytes.as_slice(), self.data_size as usize)?;
        Ok(PayloadBytes::Owned(Arc::new(decompressed)))
    }

    /// Verify the stored checksum against the payload, when one is stored.
    pub fn verify_checksum(&self, index: usize) -> Result<()> {
        let stored = match self.checksum {
            Some(stored) => stored,
            None => return Ok(()),
        };
        let bytes = self.payload.bytes()?;
        let computed = md5::compute(bytes.as_slice()).0;
        if computed != stored {
            return Err(AsdfError::ChecksumMismatch {
                index,
                stored: hex(&stored),
                computed: hex(&computed),
            });
        }
        Ok(())
    }

    /// Handle used by arrays and read callbacks to force the payload later.
    pub fn payload_handle(&self) -> Arc<LazyPayload> {
        Arc::clone(&self.payload)
    }

    /// Storage class of this block.
    pub fn storage(&self) -> BlockStorage {
        self.storage
    }

    /// Reassign the storage class.
    pub fn set_storage(&mut self, storage: BlockStorage) {
        self.storage = storage;
    }

    /// Offset of the block magic in the file, once known.
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Fix the block at a file offset (used by the update layout).
    pub fn set_offset(&mut self, offset: Option<u64>) {
        self.offset = offset;
    }

    /// Bytes of payload in use.
    pub fn used_size(&self) -> u64 {
        self.used
    }

    /// Payload allocation in bytes.
    pub fn allocated_size(&self) -> u64 {
        self.allocated
    }

    /// Grow (or shrink) the payload allocation.
    pub fn set_allocated_size(&mut self, allocated: u64) {
        self.allocated = allocated;
    }

    /// Compression label, zeros for none.
    pub fn compression(&self) -> [u8; 4] {
        self.compression
    }

    /// Set the compression label used on the next write.
    pub fn set_compression(&mut self, label: [u8; 4]) {
        self.compression = label;
    }

    /// Stored checksum, when one is known.
    pub fn checksum(&self) -> Option<[u8; 16]> {
        self.checksum
    }

    /// Total on-disk footprint: boilerplate, header and used payload.
    pub fn size_on_disk(&self) -> u64 {
        BLOCK_HEADER_BOILERPLATE_SIZE as u64 + self.header_size as u64 + self.used
    }

    /// On-disk footprint including the full allocation.
    pub fn allocated_on_disk(&self) -> u64 {
        BLOCK_HEADER_BOILERPLATE_SIZE as u64 + self.header_size as u64 + self.allocated
    }

    /// Offset of the first payload byte, once the block is placed.
    pub fn data_offset(&self) -> Option<u64> {
        self.offset
            .map(|o| o + BLOCK_HEADER_BOILERPLATE_SIZE as u64 + self.header_size as u64)
    }

    /// `true` when the payload is currently memory mapped.
    pub fn is_memmapped(&self) -> bool {
        self.payload.is_mapped()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
