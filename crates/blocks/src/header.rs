//! On-disk block header codec.
//!
//! # Block Layout
//!
//! ```text
//! ┌──────────────┬────────────────┬──────────────────┬─────────┬─────────┐
//! │ Magic (4)    │ Header len (2) │ Header (>= 48)   │ Payload │ Padding │
//! │ 0xd3 "BLK"   │ u16 BE         │                  │         │ (zeros) │
//! └──────────────┴────────────────┴──────────────────┴─────────┴─────────┘
//!
//! Header fields (big-endian):
//! ┌───────────┬──────────────────┬────────────────────┬───────────────┬───────────────┬───────────────┐
//! │ flags (4) │ compression (4)  │ allocated_size (8) │ used_size (8) │ data_size (8) │ checksum (16) │
//! └───────────┴──────────────────┴────────────────────┴───────────────┴───────────────┴───────────────┘
//! ```

use byteorder::{BigEndian, ByteOrder as _};

use asdf_core::constants::{BLOCK_FLAG_STREAMED, BLOCK_HEADER_SIZE, BLOCK_MAGIC};
use asdf_core::{AsdfError, Result};
use asdf_io::GenericFile;

/// Compression label meaning "no compression".
pub const NO_COMPRESSION: [u8; 4] = [0; 4];

/// Flag bits this implementation understands. Unknown bits are ignored on
/// read and zeroed on write.
const KNOWN_FLAGS: u32 = BLOCK_FLAG_STREAMED;

/// The fixed header fields of a binary block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Flag bits; bit 0 marks a streamed block.
    pub flags: u32,
    /// Four-byte compression label, zeros for none.
    pub compression: [u8; 4],
    /// Bytes allocated for the payload (excluding header).
    pub allocated_size: u64,
    /// Bytes of payload actually in use.
    pub used_size: u64,
    /// Payload size before compression.
    pub data_size: u64,
    /// MD5 digest of the stored payload bytes.
    pub checksum: [u8; 16],
}

impl BlockHeader {
    /// `true` when the streamed flag bit is set.
    pub fn is_streamed(&self) -> bool {
        self.flags & BLOCK_FLAG_STREAMED != 0
    }

    /// `true` when a compression label is present.
    pub fn is_compressed(&self) -> bool {
        self.compression != NO_COMPRESSION
    }

    /// Serialize the header fields, zeroing unknown flag bits.
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        BigEndian::write_u32(&mut bytes[0..4], self.flags & KNOWN_FLAGS);
        bytes[4..8].copy_from_slice(&self.compression);
        BigEndian::write_u64(&mut bytes[8..16], self.allocated_size);
        BigEndian::write_u64(&mut bytes[16..24], self.used_size);
        BigEndian::write_u64(&mut bytes[24..32], self.data_size);
        bytes[32..48].copy_from_slice(&self.checksum);
        bytes
    }

    /// Parse the header fields from at least [`BLOCK_HEADER_SIZE`] bytes.
    ///
    /// Bytes past the fixed fields (from a future format revision) are
    /// ignored; unknown flag bits are kept so they can be reported but are
    /// not interpreted.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(AsdfError::block(format!(
                "header size must be >= {}, got {}",
                BLOCK_HEADER_SIZE,
                bytes.len()
            )));
        }
        let header = BlockHeader {
            flags: BigEndian::read_u32(&bytes[0..4]),
            compression: bytes[4..8].try_into().expect("slice length checked"),
            allocated_size: BigEndian::read_u64(&bytes[8..16]),
            used_size: BigEndian::read_u64(&bytes[16..24]),
            data_size: BigEndian::read_u64(&bytes[24..32]),
            checksum: bytes[32..48].try_into().expect("slice length checked"),
        };
        if !header.is_streamed() && header.used_size > header.allocated_size {
            return Err(AsdfError::block(format!(
                "used size {} exceeds allocated size {}",
                header.used_size, header.allocated_size
            )));
        }
        Ok(header)
    }
}

/// Result of reading one block header off the file.
#[derive(Debug)]
pub struct RawBlockHeader {
    /// Offset of the block magic in the file.
    pub offset: u64,
    /// Declared header length (may exceed the fixed field size).
    pub header_size: u16,
    /// Parsed fixed fields.
    pub header: BlockHeader,
    /// Offset of the first payload byte.
    pub data_offset: u64,
}

/// Read a block header at the current position.
///
/// With `past_magic` the position is just after the magic token; otherwise
/// it is at the magic itself. Returns `None` on a clean end of input (end
/// of file or the start of something that is not a block).
pub fn read_block_header(fd: &mut dyn GenericFile, past_magic: bool) -> Result<Option<RawBlockHeader>> {
    let mut offset = fd.tell()?;
    if !past_magic {
        let mut magic = [0u8; 4];
        let n = fd.read(&mut magic)?;
        if n == 0 {
            return Ok(None);
        }
        if n < 4 || &magic != BLOCK_MAGIC {
            return Err(AsdfError::BlockMalformed {
                message: "bad magic number in block; the file's block sizes may be inconsistent"
                    .to_string(),
                offset: Some(offset),
            });
        }
    } else {
        offset = offset.saturating_sub(4);
    }

    let mut len_bytes = [0u8; 2];
    fd.read_exact(&mut len_bytes)?;
    let header_size = u16::from_be_bytes(len_bytes);
    if (header_size as usize) < BLOCK_HEADER_SIZE {
        return Err(AsdfError::BlockMalformed {
            message: format!("header size must be >= {}, got {}", BLOCK_HEADER_SIZE, header_size),
            offset: Some(offset),
        });
    }

    let mut header_bytes = vec![0u8; header_size as usize];
    fd.read_exact(&mut header_bytes)?;
    let header = BlockHeader::from_bytes(&header_bytes).map_err(|e| match e {
        AsdfError::BlockMalformed { message, .. } => AsdfError::BlockMalformed {
            message,
            offset: Some(offset),
        },
        other => other,
    })?;

    let data_offset = fd.tell()?;
    Ok(Some(RawBlockHeader {
        offset,
        header_size,
        header,
        data_offset,
    }))
}

/// Write magic, header length and header fields at the current position.
pub fn write_block_header(fd: &mut dyn GenericFile, header: &BlockHeader) -> Result<()> {
    fd.write_all(BLOCK_MAGIC)?;
    fd.write_all(&(BLOCK_HEADER_SIZE as u16).to_be_bytes())?;
    fd.write_all(&header.to_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use asdf_io::{GenericFile as _, MemoryFile};

    fn sample_header() -> BlockHeader {
        BlockHeader {
            flags: 0,
            compression: NO_COMPRESSION,
            allocated_size: 64,
            used_size: 32,
            data_size: 32,
            checksum: [0xAB; 16],
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = sample_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), BLOCK_HEADER_SIZE);
        let parsed = BlockHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_unknown_flags_zeroed_on_write() {
        let mut header = sample_header();
        header.flags = 0xFFFF_FFFF;
        let parsed = BlockHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.flags, BLOCK_FLAG_STREAMED);
    }

    #[test]
    fn test_used_exceeding_allocated_rejected() {
        let mut header = sample_header();
        header.used_size = 128;
        assert!(BlockHeader::from_bytes(&header.to_bytes()).is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let mut fd = MemoryFile::new();
        write_block_header(&mut fd, &sample_header()).unwrap();
        fd.seek(std::io::SeekFrom::Start(0)).unwrap();
        let raw = read_block_header(&mut fd, false).unwrap().unwrap();
        assert_eq!(raw.offset, 0);
        assert_eq!(raw.header, sample_header());
        assert_eq!(raw.data_offset, 54);
    }

    #[test]
    fn test_eof_returns_none() {
        let mut fd = MemoryFile::new();
        assert!(read_block_header(&mut fd, false).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_is_error() {
        let mut fd = MemoryFile::from_bytes(b"NOPE".to_vec());
        assert!(read_block_header(&mut fd, false).is_err());
    }

    #[test]
    fn test_short_declared_header_rejected() {
        let mut fd = MemoryFile::new();
        fd.write_all(BLOCK_MAGIC).unwrap();
        fd.write_all(&10u16.to_be_bytes()).unwrap();
        fd.write_all(&[0u8; 10]).unwrap();
        fd.seek(std::io::SeekFrom::Start(0)).unwrap();
        assert!(read_block_header(&mut fd, false).is_err());
    }
}
