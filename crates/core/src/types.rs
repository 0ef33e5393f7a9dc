//! Small shared enums used across the block and tree layers.

use std::fmt;
use std::str::FromStr;

use crate::error::AsdfError;

/// How a block's payload is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockStorage {
    /// Written as a binary block in the current file.
    Internal,
    /// Serialized as a literal YAML sequence inside the tree.
    Inline,
    /// The final, open-ended block.
    Streamed,
    /// Stored in a sibling file referenced by relative URI.
    External,
}

impl fmt::Display for BlockStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockStorage::Internal => "internal",
            BlockStorage::Inline => "inline",
            BlockStorage::Streamed => "streamed",
            BlockStorage::External => "external",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BlockStorage {
    type Err = AsdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(BlockStorage::Internal),
            "inline" => Ok(BlockStorage::Inline),
            "streamed" => Ok(BlockStorage::Streamed),
            "external" => Ok(BlockStorage::External),
            other => Err(AsdfError::Value(format!(
                "array storage must be one of 'internal', 'external', 'streamed' or 'inline', got '{}'",
                other
            ))),
        }
    }
}

/// Byte order of numeric payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    /// Most significant byte first.
    Big,
    /// Least significant byte first.
    Little,
}

impl ByteOrder {
    /// The byte order of the machine running this process.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Big => write!(f, "big"),
            ByteOrder::Little => write!(f, "little"),
        }
    }
}

impl FromStr for ByteOrder {
    type Err = AsdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "big" => Ok(ByteOrder::Big),
            "little" => Ok(ByteOrder::Little),
            other => Err(AsdfError::Value(format!("invalid byteorder '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_round_trip() {
        for s in ["internal", "inline", "streamed", "external"] {
            let parsed: BlockStorage = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("sideways".parse::<BlockStorage>().is_err());
    }

    #[test]
    fn test_byteorder_parse() {
        assert_eq!("big".parse::<ByteOrder>().unwrap(), ByteOrder::Big);
        assert!("middle".parse::<ByteOrder>().is_err());
    }
}
