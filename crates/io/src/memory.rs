//! In-memory files backed by a byte buffer.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use asdf_core::Result;

use crate::generic::GenericFile;

/// A seekable, writable file held entirely in memory.
pub struct MemoryFile {
    cursor: Cursor<Vec<u8>>,
    uri: Option<String>,
}

impl MemoryFile {
    /// New empty buffer.
    pub fn new() -> Self {
        MemoryFile {
            cursor: Cursor::new(Vec::new()),
            uri: None,
        }
    }

    /// Wrap existing bytes, positioned at the start.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        MemoryFile {
            cursor: Cursor::new(bytes),
            uri: None,
        }
    }

    /// Attach a URI, for files that stand in for a remote resource.
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Borrow the underlying bytes.
    pub fn bytes(&self) -> &[u8] {
        self.cursor.get_ref()
    }

    /// Consume the file, returning the underlying bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.cursor.into_inner()
    }
}

impl Default for MemoryFile {
    fn default() -> Self {
        MemoryFile::new()
    }
}

impl GenericFile for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.cursor.read(buf)?)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        Ok(self.cursor.write_all(buf)?)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.cursor.seek(pos)?)
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.cursor.position())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.cursor.get_mut().truncate(size as usize);
        if self.cursor.position() > size {
            self.cursor.set_position(size);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn seekable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        true
    }

    fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::bytes::Regex;

    #[test]
    fn test_write_then_read_back() {
        let mut fd = MemoryFile::new();
        fd.write_all(b"hello world").unwrap();
        fd.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 5];
        fd.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_yaml_end_marker_scan() {
        let mut fd = MemoryFile::from_bytes(b"--- {a: 1}\n...\nBINARY".to_vec());
        let pattern = Regex::new(asdf_core::constants::YAML_END_MARKER_REGEX).unwrap();
        let content = fd.read_until(&pattern, "end of YAML marker", true).unwrap();
        assert_eq!(content, b"--- {a: 1}\n...\n");
        assert_eq!(fd.tell().unwrap(), 15);
    }

    #[test]
    fn test_end_marker_at_eof() {
        let mut fd = MemoryFile::from_bytes(b"--- {a: 1}\n...".to_vec());
        let pattern = Regex::new(asdf_core::constants::YAML_END_MARKER_REGEX).unwrap();
        let content = fd.read_until(&pattern, "end of YAML marker", true).unwrap();
        assert_eq!(content, b"--- {a: 1}\n...");
    }

    #[test]
    fn test_truncate_clamps_position() {
        let mut fd = MemoryFile::from_bytes(vec![1, 2, 3, 4, 5]);
        fd.seek(SeekFrom::End(0)).unwrap();
        fd.truncate(2).unwrap();
        assert_eq!(fd.tell().unwrap(), 2);
        assert_eq!(fd.bytes(), &[1, 2]);
    }
}
