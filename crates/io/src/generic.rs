//! The `GenericFile` abstraction over seekable files and one-way streams.

use std::io::SeekFrom;
use std::sync::Arc;

use memmap2::Mmap;
use regex::bytes::Regex;

use asdf_core::{AsdfError, Result};

/// Chunk size used when scanning for delimiters.
pub(crate) const SCAN_CHUNK: usize = 8192;

/// Overlap kept between scan chunks so a delimiter split across a chunk
/// boundary is still found. Must be at least the longest possible match
/// minus one; the delimiters used by the format are all short.
pub(crate) const SCAN_OVERLAP: usize = 16;

/// A read-only view into a memory-mapped region of a file.
///
/// The whole file is mapped once and regions borrow from that mapping, so
/// region offsets need no page alignment.
#[derive(Debug, Clone)]
pub struct MappedRegion {
    map: Arc<Mmap>,
    offset: usize,
    len: usize,
}

impl MappedRegion {
    pub(crate) fn new(map: Arc<Mmap>, offset: usize, len: usize) -> Result<Self> {
        if offset.checked_add(len).map(|end| end > map.len()).unwrap_or(true) {
            return Err(AsdfError::Value(format!(
                "mapped region {}..{} exceeds file length {}",
                offset,
                offset + len,
                map.len()
            )));
        }
        Ok(MappedRegion { map, offset, len })
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.map[self.offset..self.offset + self.len]
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` when the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Abstraction over the file-like objects the engine reads and writes.
///
/// Seekable implementations support random access, delimiter scanning and
/// (for real files) memory mapping; stream implementations support only the
/// forward operations, with `fast_forward` writing zero padding on output
/// streams.
pub trait GenericFile: Send {
    /// Read up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Read exactly `buf.len()` bytes or fail.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(AsdfError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("expected {} bytes, got {}", buf.len(), filled),
                )));
            }
            filled += n;
        }
        Ok(())
    }

    /// Read all remaining bytes.
    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; SCAN_CHUNK];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Write all of `buf`.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Reposition the file. Fails on non-seekable streams.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Current position from the start of the file.
    fn tell(&mut self) -> Result<u64>;

    /// Total length in bytes. Fails on non-seekable streams.
    fn len(&mut self) -> Result<u64> {
        let pos = self.tell()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }

    /// Read from the current position until `pattern` matches.
    ///
    /// Returns the bytes up to and including the match (or excluding it
    /// when `include` is false) and leaves the position just past the
    /// returned bytes. Fails with a malformed-header error naming
    /// `delimiter_name` when the pattern is never found.
    fn read_until(&mut self, pattern: &Regex, delimiter_name: &str, include: bool) -> Result<Vec<u8>> {
        let start = self.tell()?;
        let mut buffer = Vec::new();
        let mut chunk = [0u8; SCAN_CHUNK];
        loop {
            let searched = buffer.len();
            let n = self.read(&mut chunk)?;
            let at_eof = n == 0;
            buffer.extend_from_slice(&chunk[..n]);

            // Rescan a little before the new bytes in case the delimiter
            // straddles the chunk boundary.
            let scan_from = searched.saturating_sub(SCAN_OVERLAP);
            if let Some(m) = pattern.find(&buffer[scan_from..]) {
                // A match ending exactly at the buffer end may be a prefix
                // of a longer match; read more unless the file is done.
                if scan_from + m.end() == buffer.len() && !at_eof {
                    continue;
                }
                let cut = if include { scan_from + m.end() } else { scan_from + m.start() };
                buffer.truncate(cut);
                self.seek(SeekFrom::Start(start + cut as u64))?;
                return Ok(buffer);
            }
            if at_eof {
                return Err(AsdfError::header(format!("{} not found", delimiter_name)));
            }
        }
    }

    /// Scan forward until `pattern` matches, without retaining the bytes.
    ///
    /// Leaves the position just past the match (or at its start when
    /// `include` is false). Returns `false` if the pattern was never found,
    /// with the position at end of file.
    fn seek_until(&mut self, pattern: &Regex, include: bool) -> Result<bool> {
        let mut window: Vec<u8> = Vec::new();
        let mut window_start = self.tell()?;
        let mut chunk = [0u8; SCAN_CHUNK];
        loop {
            let n = self.read(&mut chunk)?;
            let at_eof = n == 0;
            window.extend_from_slice(&chunk[..n]);

            if let Some(m) = pattern.find(&window) {
                if window_start + m.end() as u64 == window_start + window.len() as u64 && !at_eof {
                    // Possible prefix of a longer match; keep reading.
                    continue;
                }
                let target = if include { m.end() } else { m.start() };
                self.seek(SeekFrom::Start(window_start + target as u64))?;
                return Ok(true);
            }
            if at_eof {
                return Ok(false);
            }
            // Keep only the tail that could begin a split match.
            if window.len() > SCAN_OVERLAP {
                let drop = window.len() - SCAN_OVERLAP;
                window.drain(..drop);
                window_start += drop as u64;
            }
        }
    }

    /// Skip `size` bytes; `-1` skips to end of file. On output streams
    /// this writes zero padding instead of seeking.
    fn fast_forward(&mut self, size: i64) -> Result<()> {
        if size < 0 {
            self.seek(SeekFrom::End(0))?;
        } else {
            self.seek(SeekFrom::Current(size))?;
        }
        Ok(())
    }

    /// Overwrite the next `size` bytes with zeros.
    fn clear(&mut self, size: u64) -> Result<()> {
        let zeros = vec![0u8; SCAN_CHUNK.min(size as usize).max(1)];
        let mut remaining = size;
        while remaining > 0 {
            let n = zeros.len().min(remaining as usize);
            self.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Truncate the file to `size` bytes. Fails on streams.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Flush buffered writes.
    fn flush(&mut self) -> Result<()>;

    /// Size of a filesystem block on the underlying device.
    fn block_size(&self) -> u64 {
        4096
    }

    /// `true` when the file supports random access.
    fn seekable(&self) -> bool;

    /// `true` when the file accepts writes.
    fn writable(&self) -> bool;

    /// `true` when payload ranges can be memory mapped.
    fn can_memmap(&self) -> bool {
        false
    }

    /// Map `len` bytes starting at `offset`.
    fn memmap(&mut self, _offset: u64, _len: usize) -> Result<MappedRegion> {
        Err(AsdfError::Value("this file does not support memory mapping".to_string()))
    }

    /// Drop any cached whole-file mapping, so the file can be truncated or
    /// rewritten. Regions handed out earlier keep their own reference.
    fn drop_memmap(&mut self) {}

    /// The URI this file was opened from, when known.
    fn uri(&self) -> Option<&str>;
}
