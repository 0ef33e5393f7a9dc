//! Error types for the ASDF engine.
//!
//! All layers report failures through the unified [`AsdfError`] enum. Every
//! variant maps to a machine-stable [`ErrorKind`] and may carry a pointer
//! (a path in the tree or a byte offset in the file) locating the failure.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for ASDF operations.
pub type Result<T> = std::result::Result<T, AsdfError>;

/// Unified error type for all ASDF operations.
#[derive(Debug, Error)]
pub enum AsdfError {
    /// Underlying file or stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Missing magic, unknown version syntax, or truncated file header.
    #[error("malformed header: {message}")]
    HeaderMalformed {
        /// What was wrong with the header.
        message: String,
        /// Byte offset at which the problem was detected.
        offset: Option<u64>,
    },

    /// Bad block magic, undersized header, or inconsistent block sizes.
    #[error("malformed block: {message}")]
    BlockMalformed {
        /// What was wrong with the block.
        message: String,
        /// Byte offset of the offending block.
        offset: Option<u64>,
    },

    /// Stored block checksum does not match the block payload.
    #[error("checksum mismatch in block {index}: stored {stored}, computed {computed}")]
    ChecksumMismatch {
        /// Index of the block that failed verification.
        index: usize,
        /// Checksum stored in the block header, hex encoded.
        stored: String,
        /// Checksum computed over the payload, hex encoded.
        computed: String,
    },

    /// A tree node failed validation against its schema.
    #[error("schema validation failed at {path}: {message}")]
    SchemaViolation {
        /// Path of the offending node in the tree.
        path: String,
        /// Description of the violation, including the offending value.
        message: String,
    },

    /// A tag has no definition and no converter in the active registry.
    #[error("no support available for YAML tag '{tag}'")]
    UnknownTag {
        /// The unrecognized tag URI.
        tag: String,
    },

    /// The file declares an extension the current registry does not provide.
    #[error("file was created with extension '{extension_uri}', which is not currently installed")]
    MissingExtension {
        /// URI of the missing extension.
        extension_uri: String,
    },

    /// A schema or manifest URI is not available from any resource provider.
    #[error("resource unavailable for URI: {uri}")]
    ResourceMissing {
        /// The URI that could not be resolved.
        uri: String,
    },

    /// A converter accessed more than one block without distinct keys.
    #[error("converters accessing >1 block must provide a key for each block")]
    ConverterBlockKeyRequired,

    /// A converter generated a block key during read but never used it.
    #[error("converter generated a key that was never used")]
    UnusedBlockKey,

    /// More than one block carries the streamed flag.
    #[error("found {count} streamed blocks, but there must be only one")]
    MultipleStreamedBlocks {
        /// How many streamed blocks were found.
        count: usize,
    },

    /// A read-only context method was called during write, or vice versa.
    #[error("invalid serialization context usage: {0}")]
    InvalidContextUsage(String),

    /// An object that is not a registered extension was marked as used.
    #[error("'{0}' is not an enabled extension")]
    NotAnExtension(String),

    /// An external `$ref` target could not be loaded or located.
    #[error("unresolvable reference '{uri}': {reason}")]
    ReferenceUnresolved {
        /// The reference URI.
        uri: String,
        /// Why resolution failed.
        reason: String,
    },

    /// Invalid input or operation not covered by a more specific variant.
    #[error("{0}")]
    Value(String),
}

/// Machine-stable discriminant for [`AsdfError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    Io,
    HeaderMalformed,
    BlockMalformed,
    ChecksumMismatch,
    SchemaViolation,
    UnknownTag,
    MissingExtension,
    ResourceMissing,
    ConverterBlockKeyRequired,
    UnusedBlockKey,
    MultipleStreamedBlocks,
    InvalidContextUsage,
    NotAnExtension,
    ReferenceUnresolved,
    Value,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Location of a failure: a path in the tree or a byte offset in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pointer {
    /// A path in the YAML tree, e.g. `tree.data[2].value`.
    Path(String),
    /// A byte offset in the file.
    Offset(u64),
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pointer::Path(p) => write!(f, "{}", p),
            Pointer::Offset(o) => write!(f, "byte offset {}", o),
        }
    }
}

impl AsdfError {
    /// Get the machine-stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AsdfError::Io(_) => ErrorKind::Io,
            AsdfError::HeaderMalformed { .. } => ErrorKind::HeaderMalformed,
            AsdfError::BlockMalformed { .. } => ErrorKind::BlockMalformed,
            AsdfError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            AsdfError::SchemaViolation { .. } => ErrorKind::SchemaViolation,
            AsdfError::UnknownTag { .. } => ErrorKind::UnknownTag,
            AsdfError::MissingExtension { .. } => ErrorKind::MissingExtension,
            AsdfError::ResourceMissing { .. } => ErrorKind::ResourceMissing,
            AsdfError::ConverterBlockKeyRequired => ErrorKind::ConverterBlockKeyRequired,
            AsdfError::UnusedBlockKey => ErrorKind::UnusedBlockKey,
            AsdfError::MultipleStreamedBlocks { .. } => ErrorKind::MultipleStreamedBlocks,
            AsdfError::InvalidContextUsage(_) => ErrorKind::InvalidContextUsage,
            AsdfError::NotAnExtension(_) => ErrorKind::NotAnExtension,
            AsdfError::ReferenceUnresolved { .. } => ErrorKind::ReferenceUnresolved,
            AsdfError::Value(_) => ErrorKind::Value,
        }
    }

    /// Get the pointer locating this error, when one is known.
    pub fn pointer(&self) -> Option<Pointer> {
        match self {
            AsdfError::HeaderMalformed { offset: Some(o), .. }
            | AsdfError::BlockMalformed { offset: Some(o), .. } => Some(Pointer::Offset(*o)),
            AsdfError::SchemaViolation { path, .. } => Some(Pointer::Path(path.clone())),
            _ => None,
        }
    }

    /// Shorthand for a malformed-header error without a known offset.
    pub fn header(message: impl Into<String>) -> Self {
        AsdfError::HeaderMalformed {
            message: message.into(),
            offset: None,
        }
    }

    /// Shorthand for a malformed-block error without a known offset.
    pub fn block(message: impl Into<String>) -> Self {
        AsdfError::BlockMalformed {
            message: message.into(),
            offset: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        let err = AsdfError::UnknownTag {
            tag: "tag:example.com/foo-1.0.0".into(),
        };
        assert_eq!(err.kind(), ErrorKind::UnknownTag);
        assert!(err.to_string().contains("tag:example.com/foo-1.0.0"));
    }

    #[test]
    fn test_pointer_for_schema_violation() {
        let err = AsdfError::SchemaViolation {
            path: "tree.foo.value".into(),
            message: "12 is not of type 'string'".into(),
        };
        assert_eq!(err.pointer(), Some(Pointer::Path("tree.foo.value".into())));
    }

    #[test]
    fn test_io_conversion() {
        let err: AsdfError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
