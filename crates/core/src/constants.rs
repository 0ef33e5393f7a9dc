//! File format constants shared by every layer.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ "#ASDF 1.0.0\n"                    │
//! │ "#ASDF_STANDARD 1.5.0\n"           │
//! ├────────────────────────────────────┤
//! │ "%YAML 1.1\n%TAG ! ...\n--- ..."   │
//! │ <tagged YAML document>             │
//! │ "\n...\n"                          │
//! ├────────────────────────────────────┤
//! │ Block 0                            │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! ├────────────────────────────────────┤
//! │ Block index trailer (optional)     │
//! └────────────────────────────────────┘
//! ```

/// Magic bytes opening an ASDF file, followed by the file format version.
pub const ASDF_MAGIC: &[u8] = b"#ASDF ";

/// Comment line carrying the ASDF Standard version of the YAML tree.
pub const ASDF_STANDARD_MAGIC: &[u8] = b"#ASDF_STANDARD ";

/// Magic bytes identifying a binary block: 0xd3 "BLK".
pub const BLOCK_MAGIC: &[u8; 4] = b"\xd3BLK";

/// Header line opening the block index trailer.
pub const INDEX_HEADER: &[u8] = b"#ASDF BLOCK INDEX";

/// Regex matching the YAML document end marker, including its newline.
pub const YAML_END_MARKER_REGEX: &str = r"\r?\n\.\.\.((\r?\n)|$)";

/// Tag prefix for the plain YAML types (str, int, map, ...).
pub const YAML_TAG_PREFIX: &str = "tag:yaml.org,2002:";

/// Tag prefix covered by the standard `%TAG !` handle.
pub const STSCI_TAG_PREFIX: &str = "tag:stsci.edu:asdf/";

/// Block header flag bit marking a streamed (open-ended) block.
pub const BLOCK_FLAG_STREAMED: u32 = 0x1;

/// Size of the fixed block header fields, excluding magic and length prefix.
///
/// flags (4) + compression (4) + allocated_size (8) + used_size (8)
/// + data_size (8) + checksum (16).
pub const BLOCK_HEADER_SIZE: usize = 48;

/// Bytes preceding the header fields: magic (4) + header length (2).
pub const BLOCK_HEADER_BOILERPLATE_SIZE: usize = 6;

/// The maximum number of blocks supported in one file.
pub const MAX_BLOCKS: usize = 1 << 16;

/// Version of the file format itself (the `#ASDF` header line).
pub const FILE_FORMAT_VERSION: &str = "1.0.0";

/// ASDF Standard version used for new files unless configured otherwise.
pub const DEFAULT_VERSION: &str = "1.5.0";

/// ASDF Standard versions this implementation recognizes.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0.0", "1.1.0", "1.2.0", "1.3.0", "1.4.0", "1.5.0", "1.6.0"];
