//! Owned field values and their canonical binary encoding.

use bytes::{BufMut, Bytes, BytesMut};
use kestrel_common::{KestrelError, LENGTH_PREFIX_SIZE, Result, TypeId, TypeTrait};
use std::cmp::Ordering;

/// A single typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Utf8(String),
    Binary(Bytes),
}

impl Value {
    /// Returns the type of this value.
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Boolean(_) => TypeId::Boolean,
            Value::Int8(_) => TypeId::Int8,
            Value::Int16(_) => TypeId::Int16,
            Value::Int32(_) => TypeId::Int32,
            Value::Int64(_) => TypeId::Int64,
            Value::Float32(_) => TypeId::Float32,
            Value::Float64(_) => TypeId::Float64,
            Value::Utf8(_) => TypeId::Utf8,
            Value::Binary(_) => TypeId::Binary,
        }
    }

    /// Returns the number of bytes this value occupies when encoded.
    pub fn encoded_len(&self) -> usize {
        let type_trait = TypeTrait::of(self.type_id());
        match self {
            Value::Utf8(s) => type_trait.encoded_len(s.len()),
            Value::Binary(b) => type_trait.encoded_len(b.len()),
            _ => type_trait.encoded_len(0),
        }
    }

    /// Appends the canonical encoding of this value.
    ///
    /// Fails with `Encoding` if a variable-length payload does not fit the
    /// 32-bit length prefix; `out` is left untouched in that case.
    pub fn encode_into(&self, out: &mut BytesMut) -> Result<()> {
        match self {
            Value::Boolean(v) => out.put_u8(*v as u8),
            Value::Int8(v) => out.put_i8(*v),
            Value::Int16(v) => out.put_i16(*v),
            Value::Int32(v) => out.put_i32(*v),
            Value::Int64(v) => out.put_i64(*v),
            Value::Float32(v) => out.put_f32(*v),
            Value::Float64(v) => out.put_f64(*v),
            Value::Utf8(s) => put_length_prefixed(s.as_bytes(), out)?,
            Value::Binary(b) => put_length_prefixed(b, out)?,
        }
        Ok(())
    }

    /// Appends the encoding of this value after checking it against a field trait.
    pub fn encode_as(&self, type_trait: &TypeTrait, out: &mut BytesMut) -> Result<()> {
        if self.type_id() != type_trait.type_id {
            return Err(KestrelError::TypeMismatch {
                expected: type_trait.type_id,
                actual: self.type_id(),
            });
        }
        self.encode_into(out)
    }

    /// Decodes a value from its encoded field bytes (length prefix included).
    pub fn decode(type_trait: &TypeTrait, field: &[u8]) -> Result<Value> {
        let payload = match type_trait.fixed_length {
            Some(width) => {
                let width = width as usize;
                if field.len() < width {
                    return Err(KestrelError::BufferTooShort {
                        needed: width,
                        available: field.len(),
                    });
                }
                &field[..width]
            }
            None => {
                let len = read_length_prefix(field, 0)?;
                let end = LENGTH_PREFIX_SIZE + len;
                if field.len() < end {
                    return Err(KestrelError::BufferTooShort {
                        needed: end,
                        available: field.len(),
                    });
                }
                &field[LENGTH_PREFIX_SIZE..end]
            }
        };
        Self::decode_payload(type_trait.type_id, payload)
    }

    /// Decodes a value from its payload bytes (no length prefix).
    pub fn decode_payload(type_id: TypeId, payload: &[u8]) -> Result<Value> {
        if let Some(width) = type_id.fixed_size() {
            if payload.len() != width {
                return Err(KestrelError::Encoding(format!(
                    "{} payload must be {} bytes, got {}",
                    type_id,
                    width,
                    payload.len()
                )));
            }
        }

        let value = match type_id {
            TypeId::Boolean => match payload[0] {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => {
                    return Err(KestrelError::Encoding(format!(
                        "invalid boolean byte 0x{:02x}",
                        other
                    )));
                }
            },
            TypeId::Int8 => Value::Int8(payload[0] as i8),
            TypeId::Int16 => Value::Int16(i16::from_be_bytes([payload[0], payload[1]])),
            TypeId::Int32 => Value::Int32(i32::from_be_bytes(fixed::<4>(payload))),
            TypeId::Int64 => Value::Int64(i64::from_be_bytes(fixed::<8>(payload))),
            TypeId::Float32 => Value::Float32(f32::from_be_bytes(fixed::<4>(payload))),
            TypeId::Float64 => Value::Float64(f64::from_be_bytes(fixed::<8>(payload))),
            TypeId::Utf8 => {
                let s = std::str::from_utf8(payload)
                    .map_err(|e| KestrelError::Encoding(format!("invalid UTF-8 field: {}", e)))?;
                Value::Utf8(s.to_string())
            }
            TypeId::Binary => Value::Binary(Bytes::copy_from_slice(payload)),
        };
        Ok(value)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Utf8(s) => write!(f, "'{}'", s),
            Value::Binary(b) => {
                for byte in b.iter() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

/// Copies a payload of known width into an array.
#[inline(always)]
fn fixed<const N: usize>(payload: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&payload[..N]);
    buf
}

/// Converts a payload length into its 32-bit prefix.
pub fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        KestrelError::Encoding(format!(
            "payload of {} bytes exceeds the {} byte limit",
            len,
            u32::MAX
        ))
    })
}

/// Appends `payload` behind its length prefix.
pub fn put_length_prefixed(payload: &[u8], out: &mut BytesMut) -> Result<()> {
    out.put_u32(length_prefix(payload.len())?);
    out.put_slice(payload);
    Ok(())
}

/// Reads the big-endian length prefix of a variable-length field starting at `start`.
#[inline]
pub fn read_length_prefix(buf: &[u8], start: usize) -> Result<usize> {
    let end = start + LENGTH_PREFIX_SIZE;
    if buf.len() < end {
        return Err(KestrelError::BufferTooShort {
            needed: end,
            available: buf.len(),
        });
    }
    Ok(u32::from_be_bytes([buf[start], buf[start + 1], buf[start + 2], buf[start + 3]]) as usize)
}

/// Compares two encoded payloads of the same type in their natural order.
///
/// Payloads exclude the length prefix. Floats use IEEE total ordering.
pub fn compare_payloads(type_id: TypeId, a: &[u8], b: &[u8]) -> Ordering {
    match type_id {
        TypeId::Int8 => (a[0] as i8).cmp(&(b[0] as i8)),
        TypeId::Int16 => i16::from_be_bytes([a[0], a[1]]).cmp(&i16::from_be_bytes([b[0], b[1]])),
        TypeId::Int32 => i32::from_be_bytes(fixed::<4>(a)).cmp(&i32::from_be_bytes(fixed::<4>(b))),
        TypeId::Int64 => i64::from_be_bytes(fixed::<8>(a)).cmp(&i64::from_be_bytes(fixed::<8>(b))),
        TypeId::Float32 => {
            f32::from_be_bytes(fixed::<4>(a)).total_cmp(&f32::from_be_bytes(fixed::<4>(b)))
        }
        TypeId::Float64 => {
            f64::from_be_bytes(fixed::<8>(a)).total_cmp(&f64::from_be_bytes(fixed::<8>(b)))
        }
        TypeId::Boolean | TypeId::Utf8 | TypeId::Binary => a.cmp(b),
    }
}
