//! Key types, flags and metadata shared by the engine and the wire protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OdbError, Result};

/// Maximum key name length in bytes, including the terminating NUL
pub const NAME_LENGTH: usize = 32;

/// Item size used for string keys created without an explicit length
pub const DEFAULT_STRING_LENGTH: usize = 32;

/// Maximum number of link hops followed while resolving a path
pub const MAX_LINK_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Key flags
// ---------------------------------------------------------------------------

/// Value and structure may not be changed
pub const FLAG_READ_ONLY: u32 = 0x0001;
/// Key is bound exclusively by one record owner
pub const FLAG_EXCLUSIVE: u32 = 0x0002;
/// Key is skipped by enumeration and export
pub const FLAG_HIDDEN: u32 = 0x0004;

/// Type of a key. Discriminants follow the historical type ids.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeId {
    UInt8 = 1,
    Int8 = 2,
    Char = 3,
    UInt16 = 4,
    Int16 = 5,
    UInt32 = 6,
    Int32 = 7,
    Bool = 8,
    Float = 9,
    Double = 10,
    String = 12,
    Blob = 13,
    Key = 15,
    Link = 16,
    Int64 = 17,
    UInt64 = 18,
}

impl TypeId {
    pub const ALL: [TypeId; 16] = [
        TypeId::UInt8,
        TypeId::Int8,
        TypeId::Char,
        TypeId::UInt16,
        TypeId::Int16,
        TypeId::UInt32,
        TypeId::Int32,
        TypeId::Bool,
        TypeId::Float,
        TypeId::Double,
        TypeId::String,
        TypeId::Blob,
        TypeId::Key,
        TypeId::Link,
        TypeId::Int64,
        TypeId::UInt64,
    ];

    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| *t as u32 == raw)
            .ok_or(OdbError::InvalidType(raw))
    }

    /// Fixed item size in bytes, `None` for variable-size types
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            TypeId::UInt8 | TypeId::Int8 | TypeId::Char => Some(1),
            TypeId::UInt16 | TypeId::Int16 => Some(2),
            TypeId::UInt32 | TypeId::Int32 | TypeId::Bool | TypeId::Float => Some(4),
            TypeId::Double | TypeId::Int64 | TypeId::UInt64 => Some(8),
            TypeId::Key => Some(0),
            TypeId::String | TypeId::Blob | TypeId::Link => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(
            self,
            TypeId::String | TypeId::Blob | TypeId::Key | TypeId::Link
        )
    }

    pub fn is_directory(self) -> bool {
        self == TypeId::Key
    }

    /// True if values of `self` can be read as `other`
    pub fn compatible_with(self, other: TypeId) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (a, b) if a.is_numeric() && b.is_numeric() => true,
            (TypeId::Blob, TypeId::UInt8) | (TypeId::UInt8, TypeId::Blob) => true,
            _ => false,
        }
    }

    /// Name used by the schema grammar
    pub fn name(self) -> &'static str {
        match self {
            TypeId::UInt8 => "BYTE",
            TypeId::Int8 => "SBYTE",
            TypeId::Char => "CHAR",
            TypeId::UInt16 => "WORD",
            TypeId::Int16 => "SHORT",
            TypeId::UInt32 => "DWORD",
            TypeId::Int32 => "INT",
            TypeId::Bool => "BOOL",
            TypeId::Float => "FLOAT",
            TypeId::Double => "DOUBLE",
            TypeId::String => "STRING",
            TypeId::Blob => "ARRAY",
            TypeId::Key => "KEY",
            TypeId::Link => "LINK",
            TypeId::Int64 => "INT64",
            TypeId::UInt64 => "UINT64",
        }
    }

    /// Parse a schema type name, accepting the fixed-width aliases
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let ty = match upper.as_str() {
            "BYTE" | "UINT8" => TypeId::UInt8,
            "SBYTE" | "INT8" => TypeId::Int8,
            "CHAR" => TypeId::Char,
            "WORD" | "UINT16" => TypeId::UInt16,
            "SHORT" | "INT16" => TypeId::Int16,
            "DWORD" | "UINT32" => TypeId::UInt32,
            "INT" | "INT32" => TypeId::Int32,
            "BOOL" => TypeId::Bool,
            "FLOAT" | "FLOAT32" => TypeId::Float,
            "DOUBLE" | "FLOAT64" => TypeId::Double,
            "STRING" => TypeId::String,
            "ARRAY" | "BLOB" => TypeId::Blob,
            "KEY" | "DIR" => TypeId::Key,
            "LINK" => TypeId::Link,
            "INT64" => TypeId::Int64,
            "UINT64" => TypeId::UInt64,
            _ => return None,
        };
        Some(ty)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable handle to a key: the arena offset of its key record.
///
/// Key records never move, so a `KeyRef` stays valid until the key is deleted.
/// Value storage may relocate and is always resolved through the key record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRef(pub u32);

impl KeyRef {
    pub fn offset(self) -> usize {
        self.0 as usize
    }
}

/// Snapshot of a key's metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key: KeyRef,
    pub name: String,
    pub type_id: TypeId,
    pub num_values: usize,
    pub item_size: usize,
    pub flags: u32,
    pub serial: u64,
    pub generation: u64,
    pub subtree_generation: u64,
    pub num_children: usize,
}

impl KeyInfo {
    pub fn total_size(&self) -> usize {
        self.num_values * self.item_size
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & FLAG_READ_ONLY != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.flags & FLAG_HIDDEN != 0
    }
}

/// Validate a single path component used as a key name
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.len() >= NAME_LENGTH
        || name.contains(['/', '[', ']'])
        || name.chars().any(|c| c.is_control());
    if invalid {
        return Err(OdbError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Split a trailing `[index]` off a path: `/a/b[3]` -> (`/a/b`, Some(3))
pub fn split_index(path: &str) -> Result<(&str, Option<usize>)> {
    let trimmed = path.trim_end();
    if !trimmed.ends_with(']') {
        return Ok((trimmed, None));
    }
    let open = trimmed.rfind('[').ok_or_else(|| OdbError::InvalidName {
        name: path.to_string(),
    })?;
    let index = trimmed[open + 1..trimmed.len() - 1]
        .trim()
        .parse::<usize>()
        .map_err(|_| OdbError::InvalidName {
            name: path.to_string(),
        })?;
    Ok((&trimmed[..open], Some(index)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names_roundtrip() {
        for ty in TypeId::ALL {
            assert_eq!(TypeId::from_name(ty.name()), Some(ty));
            assert_eq!(TypeId::from_raw(ty as u32).unwrap(), ty);
        }
        assert_eq!(TypeId::from_name("int32"), Some(TypeId::Int32));
        assert_eq!(TypeId::from_name("UINT16"), Some(TypeId::UInt16));
        assert!(TypeId::from_name("QUAD").is_none());
        assert!(TypeId::from_raw(11).is_err());
    }

    #[test]
    fn test_compatibility() {
        assert!(TypeId::Int32.compatible_with(TypeId::Double));
        assert!(TypeId::Bool.compatible_with(TypeId::UInt8));
        assert!(!TypeId::String.compatible_with(TypeId::Int32));
        assert!(!TypeId::Key.compatible_with(TypeId::Int32));
        assert!(TypeId::Blob.compatible_with(TypeId::UInt8));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Run number").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("x[1]").is_err());
        assert!(validate_name(&"n".repeat(NAME_LENGTH)).is_err());
        assert!(validate_name(&"n".repeat(NAME_LENGTH - 1)).is_ok());
    }

    #[test]
    fn test_split_index() {
        assert_eq!(split_index("/a/b").unwrap(), ("/a/b", None));
        assert_eq!(split_index("/a/b[3]").unwrap(), ("/a/b", Some(3)));
        assert!(split_index("/a/b[x]").is_err());
    }
}
