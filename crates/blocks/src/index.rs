//! The optional block index trailer.
//!
//! The trailer gives readers O(1) random access to blocks. It is advisory:
//! any validation failure makes the reader fall back to scanning for block
//! magic, never an error.
//!
//! ```text
//! #ASDF BLOCK INDEX
//! %YAML 1.1
//! --- [366, 4462, 8558]
//! ...
//! ```

use std::io::SeekFrom;

use tracing::debug;

use asdf_core::constants::{BLOCK_MAGIC, INDEX_HEADER, MAX_BLOCKS};
use asdf_core::Result;
use asdf_io::GenericFile;

/// How far back from the end of the file the trailer is searched for.
/// Enough for the maximum number of blocks with 20-digit offsets.
const INDEX_SEARCH_WINDOW: u64 = (MAX_BLOCKS as u64) * 22 + 64;

/// Write the index trailer for the given block offsets.
pub fn write_block_index(fd: &mut dyn GenericFile, offsets: &[u64]) -> Result<()> {
    if offsets.is_empty() {
        return Ok(());
    }
    let rendered: Vec<String> = offsets.iter().map(|o| o.to_string()).collect();
    let mut out = Vec::new();
    out.extend_from_slice(INDEX_HEADER);
    out.push(b'\n');
    out.extend_from_slice(b"%YAML 1.1\n--- [");
    out.extend_from_slice(rendered.join(", ").as_bytes());
    out.extend_from_slice(b"]\n...\n");
    fd.write_all(&out)
}

/// Locate and parse the index trailer, validating it against the file.
///
/// Returns `None` when there is no trailer or it fails validation.
pub fn read_block_index(fd: &mut dyn GenericFile) -> Result<Option<Vec<u64>>> {
    let file_len = fd.len()?;
    let window = INDEX_SEARCH_WINDOW.min(file_len);
    fd.seek(SeekFrom::Start(file_len - window))?;
    let mut tail = vec![0u8; window as usize];
    fd.read_exact(&mut tail)?;

    let header_pos = match rfind(&tail, INDEX_HEADER) {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let body = &tail[header_pos + INDEX_HEADER.len()..];

    let offsets: Vec<u64> = match serde_yaml::from_slice(body) {
        Ok(offsets) => offsets,
        Err(err) => {
            debug!("block index trailer failed to parse, falling back to scan: {}", err);
            return Ok(None);
        }
    };

    if offsets.is_empty() || offsets.len() > MAX_BLOCKS {
        return Ok(None);
    }
    if !offsets.windows(2).all(|w| w[0] < w[1]) {
        debug!("block index offsets are not increasing, falling back to scan");
        return Ok(None);
    }

    // Only the first and last entries are probed; a trailer that lies about
    // the middle is caught when the block headers are read.
    for &offset in [offsets[0], *offsets.last().expect("nonempty")].iter() {
        if !magic_at(fd, offset)? {
            debug!(offset, "block index entry does not point at block magic");
            return Ok(None);
        }
    }

    Ok(Some(offsets))
}

fn magic_at(fd: &mut dyn GenericFile, offset: u64) -> Result<bool> {
    if offset + BLOCK_MAGIC.len() as u64 > fd.len()? {
        return Ok(false);
    }
    fd.seek(SeekFrom::Start(offset))?;
    let mut magic = [0u8; 4];
    fd.read_exact(&mut magic)?;
    Ok(&magic == BLOCK_MAGIC)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).rev().find(|&i| &haystack[i..i + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asdf_io::MemoryFile;

    fn file_with_blocks_and_index(offsets: &[u64]) -> MemoryFile {
        // Lay out a fake file with block magic at each offset.
        let max = offsets.iter().copied().max().unwrap_or(0) + 64;
        let mut bytes = vec![b'x'; max as usize];
        for &o in offsets {
            bytes[o as usize..o as usize + 4].copy_from_slice(BLOCK_MAGIC);
        }
        let mut fd = MemoryFile::from_bytes(bytes);
        fd.seek(SeekFrom::End(0)).unwrap();
        write_block_index(&mut fd, offsets).unwrap();
        fd
    }

    #[test]
    fn test_index_round_trip() {
        let offsets = vec![100, 500, 1200];
        let mut fd = file_with_blocks_and_index(&offsets);
        let read = read_block_index(&mut fd).unwrap();
        assert_eq!(read, Some(offsets));
    }

    #[test]
    fn test_missing_index() {
        let mut fd = MemoryFile::from_bytes(vec![b'x'; 256]);
        assert_eq!(read_block_index(&mut fd).unwrap(), None);
    }

    #[test]
    fn test_index_not_pointing_at_magic_rejected() {
        let mut fd = MemoryFile::from_bytes(vec![b'x'; 2048]);
        fd.seek(SeekFrom::End(0)).unwrap();
        write_block_index(&mut fd, &[100, 500]).unwrap();
        assert_eq!(read_block_index(&mut fd).unwrap(), None);
    }

    #[test]
    fn test_unordered_index_rejected() {
        let mut fd = file_with_blocks_and_index(&[500, 100]);
        assert_eq!(read_block_index(&mut fd).unwrap(), None);
    }

    #[test]
    fn test_empty_offsets_write_nothing() {
        let mut fd = MemoryFile::new();
        write_block_index(&mut fd, &[]).unwrap();
        assert!(fd.bytes().is_empty());
    }
}
