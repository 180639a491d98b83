//! Type identifiers and per-type encoding traits.

use serde::{Deserialize, Serialize};

/// Width in bytes of the length prefix written before every variable-length field.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Identifier for all field types the storage core can encode.
///
/// Type IDs are carried in index descriptors to describe the schema
/// of every tuple stored in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeId {
    // Boolean
    Boolean = 1,

    // Integer types
    Int8 = 10,
    Int16 = 11,
    Int32 = 12,
    Int64 = 13,

    // Floating point types
    Float32 = 30,
    Float64 = 31,

    // String types
    Utf8 = 52,

    // Binary types
    Binary = 60,
}

impl TypeId {
    /// Returns the fixed byte size for this type, or None for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            TypeId::Boolean | TypeId::Int8 => Some(1),
            TypeId::Int16 => Some(2),
            TypeId::Int32 | TypeId::Float32 => Some(4),
            TypeId::Int64 | TypeId::Float64 => Some(8),

            // Variable-length types
            TypeId::Utf8 | TypeId::Binary => None,
        }
    }

    /// Returns true if this type has a fixed byte size.
    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size().is_some()
    }

    /// Returns true if this type is an integer type.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            TypeId::Int8 | TypeId::Int16 | TypeId::Int32 | TypeId::Int64
        )
    }

    /// Returns true if this type is a floating-point type.
    pub fn is_floating_point(&self) -> bool {
        matches!(self, TypeId::Float32 | TypeId::Float64)
    }

    /// Returns true if this type is stored as a length-prefixed byte sequence.
    pub fn is_byte_sequence(&self) -> bool {
        matches!(self, TypeId::Utf8 | TypeId::Binary)
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TypeId::Boolean => "BOOLEAN",
            TypeId::Int8 => "INT8",
            TypeId::Int16 => "INT16",
            TypeId::Int32 => "INT32",
            TypeId::Int64 => "INT64",
            TypeId::Float32 => "FLOAT32",
            TypeId::Float64 => "FLOAT64",
            TypeId::Utf8 => "UTF8",
            TypeId::Binary => "BINARY",
        };
        write!(f, "{}", name)
    }
}

/// Encoding rule for one field type.
///
/// Immutable and shared by every tuple of a schema. Fixed-length fields are
/// written as raw big-endian bytes; variable-length fields are written as
/// `[u32 big-endian length][payload]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeTrait {
    /// Type of the field.
    pub type_id: TypeId,
    /// Byte width for fixed-length types, None for length-prefixed types.
    pub fixed_length: Option<u32>,
}

impl TypeTrait {
    pub const BOOLEAN: TypeTrait = TypeTrait::fixed(TypeId::Boolean, 1);
    pub const INT8: TypeTrait = TypeTrait::fixed(TypeId::Int8, 1);
    pub const INT16: TypeTrait = TypeTrait::fixed(TypeId::Int16, 2);
    pub const INT32: TypeTrait = TypeTrait::fixed(TypeId::Int32, 4);
    pub const INT64: TypeTrait = TypeTrait::fixed(TypeId::Int64, 8);
    pub const FLOAT32: TypeTrait = TypeTrait::fixed(TypeId::Float32, 4);
    pub const FLOAT64: TypeTrait = TypeTrait::fixed(TypeId::Float64, 8);
    pub const UTF8: TypeTrait = TypeTrait::variable(TypeId::Utf8);
    pub const BINARY: TypeTrait = TypeTrait::variable(TypeId::Binary);

    const fn fixed(type_id: TypeId, width: u32) -> Self {
        Self {
            type_id,
            fixed_length: Some(width),
        }
    }

    const fn variable(type_id: TypeId) -> Self {
        Self {
            type_id,
            fixed_length: None,
        }
    }

    /// Returns the canonical trait for a type.
    pub const fn of(type_id: TypeId) -> Self {
        match type_id {
            TypeId::Boolean => Self::BOOLEAN,
            TypeId::Int8 => Self::INT8,
            TypeId::Int16 => Self::INT16,
            TypeId::Int32 => Self::INT32,
            TypeId::Int64 => Self::INT64,
            TypeId::Float32 => Self::FLOAT32,
            TypeId::Float64 => Self::FLOAT64,
            TypeId::Utf8 => Self::UTF8,
            TypeId::Binary => Self::BINARY,
        }
    }

    /// Returns true if this field carries no length prefix.
    #[inline]
    pub fn is_fixed_length(&self) -> bool {
        self.fixed_length.is_some()
    }

    /// Returns the number of bytes the field occupies given its payload length.
    #[inline]
    pub fn encoded_len(&self, payload_len: usize) -> usize {
        match self.fixed_length {
            Some(width) => width as usize,
            None => LENGTH_PREFIX_SIZE + payload_len,
        }
    }
}

impl From<TypeId> for TypeTrait {
    fn from(type_id: TypeId) -> Self {
        TypeTrait::of(type_id)
    }
}
