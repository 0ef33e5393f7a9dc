//! Real (on-disk) files, with memory mapping and atomic replacement.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use asdf_core::{AsdfError, Result};

use crate::generic::{GenericFile, MappedRegion};

/// Access mode of a [`RealFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Read only.
    Read,
    /// Read and write.
    ReadWrite,
    /// Write only (created/truncated).
    Write,
}

/// A seekable file on disk.
pub struct RealFile {
    file: File,
    mode: FileMode,
    uri: Option<String>,
    // Whole-file mapping, created on first request and shared by every
    // region handed out. Dropped before truncation or rewrite.
    map: Option<Arc<Mmap>>,
}

impl RealFile {
    /// Open an existing file for reading.
    pub fn open_read(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(RealFile {
            file,
            mode: FileMode::Read,
            uri: Some(path_to_uri(path)),
            map: None,
        })
    }

    /// Open an existing file for reading and writing.
    pub fn open_read_write(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(RealFile {
            file,
            mode: FileMode::ReadWrite,
            uri: Some(path_to_uri(path)),
            map: None,
        })
    }

    /// Create (or truncate) a file for writing.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).write(true).read(true).truncate(true).open(path)?;
        Ok(RealFile {
            file,
            mode: FileMode::Write,
            uri: Some(path_to_uri(path)),
            map: None,
        })
    }

    /// Wrap an already opened file handle.
    pub fn from_file(file: File, mode: FileMode, uri: Option<String>) -> Self {
        RealFile { file, mode, uri, map: None }
    }

    fn ensure_map(&mut self) -> Result<Arc<Mmap>> {
        if let Some(map) = &self.map {
            return Ok(Arc::clone(map));
        }
        // Safety: the mapping is read-only and the engine keeps block
        // offsets stable while any region is alive.
        let map = Arc::new(unsafe { Mmap::map(&self.file)? });
        self.map = Some(Arc::clone(&map));
        Ok(map)
    }
}

impl GenericFile for RealFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if !self.writable() {
            return Err(AsdfError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "file is not open for writing",
            )));
        }
        Ok(self.file.write_all(buf)?)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file.seek(pos)?)
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.drop_memmap();
        self.file.set_len(size)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.file.flush()?)
    }

    fn seekable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        matches!(self.mode, FileMode::ReadWrite | FileMode::Write)
    }

    fn can_memmap(&self) -> bool {
        true
    }

    fn memmap(&mut self, offset: u64, len: usize) -> Result<MappedRegion> {
        let map = self.ensure_map()?;
        MappedRegion::new(map, offset as usize, len)
    }

    fn drop_memmap(&mut self) {
        self.map = None;
    }

    fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }
}

/// Writes a file through a temporary sibling, renaming into place on
/// commit so a failure mid-write leaves the target path unchanged.
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: Option<RealFile>,
}

impl AtomicFile {
    /// Start an atomic write of `target`.
    pub fn create(target: &Path) -> Result<Self> {
        let file_name = target
            .file_name()
            .ok_or_else(|| AsdfError::Value(format!("invalid target path '{}'", target.display())))?;
        let mut temp_name = file_name.to_os_string();
        temp_name.push(format!(".tmp{}", std::process::id()));
        let temp_path = target.with_file_name(temp_name);
        let mut file = RealFile::create(&temp_path)?;
        // The payload should act as if written at the final location.
        file.uri = Some(path_to_uri(target));
        Ok(AtomicFile {
            target: target.to_path_buf(),
            temp_path,
            file: Some(file),
        })
    }

    /// The open temporary file.
    pub fn file(&mut self) -> &mut RealFile {
        self.file.as_mut().expect("atomic file already committed")
    }

    /// Flush and rename the temporary file over the target.
    pub fn commit(mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.file.sync_all()?;
        }
        std::fs::rename(&self.temp_path, &self.target)?;
        Ok(())
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            // Abandoned without commit; leave the target untouched.
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

fn path_to_uri(path: &Path) -> String {
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", absolute.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generic::GenericFile;
    use regex::bytes::Regex;
    use std::io::Write as _;

    #[test]
    fn test_read_until_and_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"#ASDF 1.0.0\npayload").unwrap();

        let mut fd = RealFile::open_read(&path).unwrap();
        let pattern = Regex::new(r"\r?\n").unwrap();
        let line = fd.read_until(&pattern, "newline", true).unwrap();
        assert_eq!(line, b"#ASDF 1.0.0\n");
        assert_eq!(fd.tell().unwrap(), 12);

        let mut rest = Vec::new();
        let mut buf = [0u8; 32];
        let n = fd.read(&mut buf).unwrap();
        rest.extend_from_slice(&buf[..n]);
        assert_eq!(rest, b"payload");
    }

    #[test]
    fn test_read_until_missing_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"no newline here").unwrap();

        let mut fd = RealFile::open_read(&path).unwrap();
        let pattern = Regex::new(r"\r?\n").unwrap();
        let err = fd.read_until(&pattern, "newline", true).unwrap_err();
        assert!(err.to_string().contains("newline"));
    }

    #[test]
    fn test_seek_until_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let mut content = vec![0u8; 20000];
        content.extend_from_slice(b"\xd3BLK");
        content.extend_from_slice(&[7u8; 10]);
        std::fs::write(&path, &content).unwrap();

        let mut fd = RealFile::open_read(&path).unwrap();
        let pattern = Regex::new(r"(?-u)\xd3BLK").unwrap();
        assert!(fd.seek_until(&pattern, true).unwrap());
        assert_eq!(fd.tell().unwrap(), 20004);
    }

    #[test]
    fn test_memmap_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let mut fd = RealFile::open_read(&path).unwrap();
        assert!(fd.can_memmap());
        let region = fd.memmap(3, 4).unwrap();
        assert_eq!(region.as_slice(), b"3456");
    }

    #[test]
    fn test_atomic_commit_and_abandon() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.asdf");

        {
            let mut atomic = AtomicFile::create(&target).unwrap();
            atomic.file().write_all(b"partial").unwrap();
            // Dropped without commit.
        }
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let mut atomic = AtomicFile::create(&target).unwrap();
        atomic.file().write_all(b"complete").unwrap();
        atomic.commit().unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"complete");
    }

    #[test]
    fn test_clear_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(&[0xFFu8; 16]).unwrap();
        }
        let mut fd = RealFile::open_read_write(&path).unwrap();
        fd.seek(SeekFrom::Start(4)).unwrap();
        fd.clear(8).unwrap();
        fd.flush().unwrap();
        let content = std::fs::read(&path).unwrap();
        assert_eq!(&content[..4], &[0xFF; 4]);
        assert_eq!(&content[4..12], &[0u8; 8]);
        assert_eq!(&content[12..], &[0xFF; 4]);
    }
}
