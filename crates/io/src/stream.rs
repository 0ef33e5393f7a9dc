//! Forward-only output streams.

use std::io::{SeekFrom, Write};

use asdf_core::{AsdfError, Result};

use crate::generic::GenericFile;

/// A write-only, non-seekable stream target.
///
/// `fast_forward` and `clear` write zero padding; `seek` is only accepted
/// when it lands on the current position.
pub struct OutputStream {
    inner: Box<dyn Write + Send>,
    pos: u64,
    uri: Option<String>,
}

impl OutputStream {
    /// Wrap a writer.
    pub fn new(inner: Box<dyn Write + Send>, uri: Option<String>) -> Self {
        OutputStream { inner, pos: 0, uri }
    }
}

impl GenericFile for OutputStream {
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(AsdfError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "output stream is not readable",
        )))
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        match pos {
            SeekFrom::Start(p) if p == self.pos => Ok(self.pos),
            SeekFrom::Current(0) => Ok(self.pos),
            _ => Err(AsdfError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "output stream is not seekable",
            ))),
        }
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    fn fast_forward(&mut self, size: i64) -> Result<()> {
        if size < 0 {
            return Err(AsdfError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "cannot fast-forward an output stream to end of file",
            )));
        }
        self.clear(size as u64)
    }

    fn truncate(&mut self, _size: u64) -> Result<()> {
        Err(AsdfError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "output stream cannot be truncated",
        )))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.inner.flush()?)
    }

    fn seekable(&self) -> bool {
        false
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
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_fast_forward_pads_with_zeros() {
        let buf = SharedBuf::default();
        let mut fd = OutputStream::new(Box::new(buf.clone()), None);
        fd.write_all(b"ab").unwrap();
        fd.fast_forward(3).unwrap();
        fd.write_all(b"cd").unwrap();
        assert_eq!(*buf.0.lock().unwrap(), b"ab\0\0\0cd");
        assert_eq!(fd.tell().unwrap(), 7);
    }

    #[test]
    fn test_seek_rejected() {
        let buf = SharedBuf::default();
        let mut fd = OutputStream::new(Box::new(buf), None);
        fd.write_all(b"abc").unwrap();
        assert!(fd.seek(SeekFrom::Start(0)).is_err());
        assert!(fd.seek(SeekFrom::Start(3)).is_ok());
    }
}
