//! Normalized key computation.
//!
//! A normalized key is a 32-bit unsigned integer derived from the leading
//! bytes of a field such that `a < b` implies `nk(a) <= nk(b)`. Sort and
//! merge paths compare normalized keys first and only fall back to a full
//! field comparison on ties.
//!
//! Byte-array layout of the key:
//! ```text
//! bit 31      30..23     22..15     14..7      6..0
//! +---+----------+----------+----------+----------+
//! | 0 | byte 0   | byte 1   | byte 2   | byte 3>>1|
//! +---+----------+----------+----------+----------+
//! ```
//! The fourth content byte contributes only its top 7 bits so the key stays
//! within `0..=i32::MAX` and a signed comparison orders keys identically.

use kestrel_common::{LENGTH_PREFIX_SIZE, TypeId};
use std::cmp::Ordering;

/// Computes an order-preserving fixed-width prefix of an encoded field.
pub trait NormalizedKeyComputer: Send + Sync {
    /// Computes the key of the field stored at `bytes[start..start + length]`.
    ///
    /// Pure function of the input bytes. Bytes past the end of the buffer
    /// are treated as zero.
    fn normalize(&self, bytes: &[u8], start: usize, length: usize) -> u32;

    /// Returns true if equal keys imply equal fields, so no fallback comparison is needed.
    fn is_decisive(&self) -> bool {
        false
    }
}

#[inline(always)]
fn byte_at(bytes: &[u8], idx: usize) -> u32 {
    bytes.get(idx).copied().unwrap_or(0) as u32
}

#[inline(always)]
fn read_u32(bytes: &[u8], start: usize) -> u32 {
    (byte_at(bytes, start) << 24)
        | (byte_at(bytes, start + 1) << 16)
        | (byte_at(bytes, start + 2) << 8)
        | byte_at(bytes, start + 3)
}

#[inline(always)]
fn read_u64(bytes: &[u8], start: usize) -> u64 {
    ((read_u32(bytes, start) as u64) << 32) | read_u32(bytes, start + 4) as u64
}

/// Normalized keys for length-prefixed byte arrays and UTF-8 strings.
#[derive(Debug, Clone, Copy)]
pub struct ByteArrayNormalizedKeyComputer;

impl NormalizedKeyComputer for ByteArrayNormalizedKeyComputer {
    fn normalize(&self, bytes: &[u8], start: usize, _length: usize) -> u32 {
        let real_length = read_u32(bytes, start) as usize;
        let content = start + LENGTH_PREFIX_SIZE;

        let mut key: u32 = 0;
        for i in 0..3 {
            key <<= 8;
            if i < real_length {
                key += byte_at(bytes, content + i);
            }
        }

        key <<= 7;
        if 3 < real_length {
            key += (byte_at(bytes, content + 3) & 0xfe) >> 1;
        }
        key
    }
}

/// Normalized keys for big-endian signed integers.
#[derive(Debug, Clone, Copy)]
pub struct IntegerNormalizedKeyComputer {
    type_id: TypeId,
}

impl NormalizedKeyComputer for IntegerNormalizedKeyComputer {
    fn normalize(&self, bytes: &[u8], start: usize, _length: usize) -> u32 {
        match self.type_id {
            TypeId::Int8 => (byte_at(bytes, start) ^ 0x80) << 24,
            TypeId::Int16 => {
                (((byte_at(bytes, start) << 8) | byte_at(bytes, start + 1)) ^ 0x8000) << 16
            }
            TypeId::Int32 => read_u32(bytes, start) ^ 0x8000_0000,
            _ => ((read_u64(bytes, start) ^ (1 << 63)) >> 32) as u32,
        }
    }

    fn is_decisive(&self) -> bool {
        self.type_id != TypeId::Int64
    }
}

/// Normalized keys for IEEE-754 floats, following the total order.
#[derive(Debug, Clone, Copy)]
pub struct FloatNormalizedKeyComputer {
    type_id: TypeId,
}

impl NormalizedKeyComputer for FloatNormalizedKeyComputer {
    fn normalize(&self, bytes: &[u8], start: usize, _length: usize) -> u32 {
        match self.type_id {
            TypeId::Float32 => {
                let bits = read_u32(bytes, start);
                if bits & 0x8000_0000 != 0 {
                    !bits
                } else {
                    bits ^ 0x8000_0000
                }
            }
            _ => {
                let bits = read_u64(bytes, start);
                let ordered = if bits & (1 << 63) != 0 {
                    !bits
                } else {
                    bits ^ (1 << 63)
                };
                (ordered >> 32) as u32
            }
        }
    }

    fn is_decisive(&self) -> bool {
        self.type_id == TypeId::Float32
    }
}

/// Normalized keys for booleans.
#[derive(Debug, Clone, Copy)]
pub struct BooleanNormalizedKeyComputer;

impl NormalizedKeyComputer for BooleanNormalizedKeyComputer {
    fn normalize(&self, bytes: &[u8], start: usize, _length: usize) -> u32 {
        byte_at(bytes, start) << 24
    }

    fn is_decisive(&self) -> bool {
        true
    }
}

pub static BYTE_ARRAY_KEY: ByteArrayNormalizedKeyComputer = ByteArrayNormalizedKeyComputer;
pub static BOOLEAN_KEY: BooleanNormalizedKeyComputer = BooleanNormalizedKeyComputer;
pub static INT8_KEY: IntegerNormalizedKeyComputer = IntegerNormalizedKeyComputer { type_id: TypeId::Int8 };
pub static INT16_KEY: IntegerNormalizedKeyComputer = IntegerNormalizedKeyComputer { type_id: TypeId::Int16 };
pub static INT32_KEY: IntegerNormalizedKeyComputer = IntegerNormalizedKeyComputer { type_id: TypeId::Int32 };
pub static INT64_KEY: IntegerNormalizedKeyComputer = IntegerNormalizedKeyComputer { type_id: TypeId::Int64 };
pub static FLOAT32_KEY: FloatNormalizedKeyComputer = FloatNormalizedKeyComputer { type_id: TypeId::Float32 };
pub static FLOAT64_KEY: FloatNormalizedKeyComputer = FloatNormalizedKeyComputer { type_id: TypeId::Float64 };

/// Returns the shared normalized key computer for a field type.
pub fn computer_for(type_id: TypeId) -> &'static dyn NormalizedKeyComputer {
    match type_id {
        TypeId::Boolean => &BOOLEAN_KEY,
        TypeId::Int8 => &INT8_KEY,
        TypeId::Int16 => &INT16_KEY,
        TypeId::Int32 => &INT32_KEY,
        TypeId::Int64 => &INT64_KEY,
        TypeId::Float32 => &FLOAT32_KEY,
        TypeId::Float64 => &FLOAT64_KEY,
        TypeId::Utf8 | TypeId::Binary => &BYTE_ARRAY_KEY,
    }
}

/// Orders two records by normalized key, running the full comparison only on ties.
#[inline]
pub fn compare_with_normalized<F>(a: u32, b: u32, full: F) -> Ordering
where
    F: FnOnce() -> Ordering,
{
    match a.cmp(&b) {
        Ordering::Equal => full(),
        ord => ord,
    }
}
