//! File abstraction layer for the ASDF engine
//!
//! Everything above this crate reads and writes through [`GenericFile`],
//! which unifies real seekable files (with memory mapping), in-memory
//! buffers, and forward-only output streams. Delimiter scanning
//! (`read_until`, `seek_until`) is the primitive the header and block
//! layers are built on.

pub mod generic;
pub mod memory;
pub mod real;
pub mod stream;
pub mod uri;

pub use generic::{GenericFile, MappedRegion};
pub use memory::MemoryFile;
pub use real::{AtomicFile, FileMode, RealFile};
pub use stream::OutputStream;
pub use uri::{is_absolute, relative_uri, resolve_uri, split_fragment};
