//! Text-to-binary value parsers used by bulk-load and import paths.
//!
//! Every parser is a stateless value shared by all callers. Parsing writes the
//! canonical field encoding straight into the output buffer, so an imported
//! record can be assembled without materializing intermediate `Value`s.
//!
//! Grammar (no implicit trimming):
//! - integers: optional `+`/`-` followed by one or more ASCII digits, range checked
//!   against the target width
//! - floats: decimal or scientific notation; results that overflow to infinity
//!   and the literals `inf`/`nan` are rejected
//! - booleans: `true` or `false`, case-insensitive
//! - strings: any valid UTF-8
//! - hex byte arrays: an even number of hex digits

use bytes::{BufMut, BytesMut};
use crate::value::put_length_prefixed;
use kestrel_common::{KestrelError, Result, TypeId};
use serde::{Deserialize, Serialize};

/// Parses a bounded character sequence into the binary encoding of one field.
pub trait ValueParser: Send + Sync {
    /// Type produced by this parser.
    fn type_id(&self) -> TypeId;

    /// Parses `input[start..start + length]` and appends the encoded field to `out`.
    ///
    /// On failure nothing is appended.
    fn parse(&self, input: &[u8], start: usize, length: usize, out: &mut BytesMut) -> Result<()>;

    /// Parses a whole string.
    fn parse_str(&self, text: &str, out: &mut BytesMut) -> Result<()> {
        self.parse(text.as_bytes(), 0, text.len(), out)
    }
}

/// Returns the bounded slice, or an encoding error if the bounds exceed the input.
fn bounded(input: &[u8], start: usize, length: usize) -> Result<&[u8]> {
    let end = start
        .checked_add(length)
        .ok_or_else(|| KestrelError::Encoding("parse bounds overflow".to_string()))?;
    input.get(start..end).ok_or(KestrelError::FieldOutOfBounds {
        field: 0,
        offset: start,
        len: length,
        buffer_len: input.len(),
    })
}

fn parse_error(type_id: TypeId, text: &[u8]) -> KestrelError {
    KestrelError::parse(type_id, String::from_utf8_lossy(text))
}

/// Parser for signed integers of any supported width.
#[derive(Debug, Clone, Copy)]
pub struct IntegerParser {
    type_id: TypeId,
}

impl IntegerParser {
    fn range(&self) -> (i64, i64) {
        match self.type_id {
            TypeId::Int8 => (i8::MIN as i64, i8::MAX as i64),
            TypeId::Int16 => (i16::MIN as i64, i16::MAX as i64),
            TypeId::Int32 => (i32::MIN as i64, i32::MAX as i64),
            _ => (i64::MIN, i64::MAX),
        }
    }

    fn parse_i64(&self, text: &[u8]) -> Result<i64> {
        let (negative, digits) = match text.first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        if digits.is_empty() {
            return Err(parse_error(self.type_id, text));
        }

        // Accumulate negatively so i64::MIN parses without overflow.
        let mut acc: i64 = 0;
        for &ch in digits {
            if !ch.is_ascii_digit() {
                return Err(parse_error(self.type_id, text));
            }
            let digit = (ch - b'0') as i64;
            acc = acc
                .checked_mul(10)
                .and_then(|v| v.checked_sub(digit))
                .ok_or_else(|| parse_error(self.type_id, text))?;
        }

        let value = if negative {
            acc
        } else {
            acc.checked_neg()
                .ok_or_else(|| parse_error(self.type_id, text))?
        };

        let (min, max) = self.range();
        if value < min || value > max {
            return Err(parse_error(self.type_id, text));
        }
        Ok(value)
    }
}

impl ValueParser for IntegerParser {
    fn type_id(&self) -> TypeId {
        self.type_id
    }

    fn parse(&self, input: &[u8], start: usize, length: usize, out: &mut BytesMut) -> Result<()> {
        let text = bounded(input, start, length)?;
        let value = self.parse_i64(text)?;
        match self.type_id {
            TypeId::Int8 => out.put_i8(value as i8),
            TypeId::Int16 => out.put_i16(value as i16),
            TypeId::Int32 => out.put_i32(value as i32),
            _ => out.put_i64(value),
        }
        Ok(())
    }
}

/// Parser for 32- and 64-bit IEEE-754 floats.
#[derive(Debug, Clone, Copy)]
pub struct FloatParser {
    type_id: TypeId,
}

impl FloatParser {
    fn text<'a>(&self, raw: &'a [u8]) -> Result<&'a str> {
        let text = std::str::from_utf8(raw).map_err(|_| parse_error(self.type_id, raw))?;
        // Rust accepts "inf"/"nan" spellings; only digits, signs, '.', 'e' are allowed here.
        let valid = !text.is_empty()
            && text
                .bytes()
                .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'))
            && text.bytes().any(|b| b.is_ascii_digit());
        if !valid {
            return Err(parse_error(self.type_id, raw));
        }
        Ok(text)
    }
}

impl ValueParser for FloatParser {
    fn type_id(&self) -> TypeId {
        self.type_id
    }

    fn parse(&self, input: &[u8], start: usize, length: usize, out: &mut BytesMut) -> Result<()> {
        let raw = bounded(input, start, length)?;
        let text = self.text(raw)?;
        match self.type_id {
            TypeId::Float32 => {
                let value: f32 = text.parse().map_err(|_| parse_error(self.type_id, raw))?;
                if !value.is_finite() {
                    return Err(parse_error(self.type_id, raw));
                }
                out.put_f32(value);
            }
            _ => {
                let value: f64 = text.parse().map_err(|_| parse_error(self.type_id, raw))?;
                if !value.is_finite() {
                    return Err(parse_error(self.type_id, raw));
                }
                out.put_f64(value);
            }
        }
        Ok(())
    }
}

/// Parser for `true`/`false`.
#[derive(Debug, Clone, Copy)]
pub struct BooleanParser;

impl ValueParser for BooleanParser {
    fn type_id(&self) -> TypeId {
        TypeId::Boolean
    }

    fn parse(&self, input: &[u8], start: usize, length: usize, out: &mut BytesMut) -> Result<()> {
        let text = bounded(input, start, length)?;
        if text.eq_ignore_ascii_case(b"true") {
            out.put_u8(1);
        } else if text.eq_ignore_ascii_case(b"false") {
            out.put_u8(0);
        } else {
            return Err(parse_error(TypeId::Boolean, text));
        }
        Ok(())
    }
}

/// Parser that stores validated UTF-8 text as a length-prefixed string.
#[derive(Debug, Clone, Copy)]
pub struct Utf8Parser;

impl ValueParser for Utf8Parser {
    fn type_id(&self) -> TypeId {
        TypeId::Utf8
    }

    fn parse(&self, input: &[u8], start: usize, length: usize, out: &mut BytesMut) -> Result<()> {
        let text = bounded(input, start, length)?;
        if std::str::from_utf8(text).is_err() {
            return Err(parse_error(TypeId::Utf8, text));
        }
        put_length_prefixed(text, out)
    }
}

/// Parser for byte arrays written as hex digits.
#[derive(Debug, Clone, Copy)]
pub struct HexBinaryParser;

impl HexBinaryParser {
    #[inline]
    fn nibble(ch: u8) -> Option<u8> {
        match ch {
            b'0'..=b'9' => Some(ch - b'0'),
            b'a'..=b'f' => Some(ch - b'a' + 10),
            b'A'..=b'F' => Some(ch - b'A' + 10),
            _ => None,
        }
    }
}

impl ValueParser for HexBinaryParser {
    fn type_id(&self) -> TypeId {
        TypeId::Binary
    }

    fn parse(&self, input: &[u8], start: usize, length: usize, out: &mut BytesMut) -> Result<()> {
        let text = bounded(input, start, length)?;
        if text.len() % 2 != 0 {
            return Err(parse_error(TypeId::Binary, text));
        }

        let mut decoded = Vec::with_capacity(text.len() / 2);
        for pair in text.chunks_exact(2) {
            let hi = Self::nibble(pair[0]).ok_or_else(|| parse_error(TypeId::Binary, text))?;
            let lo = Self::nibble(pair[1]).ok_or_else(|| parse_error(TypeId::Binary, text))?;
            decoded.push((hi << 4) | lo);
        }

        put_length_prefixed(&decoded, out)
    }
}

pub static BOOLEAN_PARSER: BooleanParser = BooleanParser;
pub static INT8_PARSER: IntegerParser = IntegerParser { type_id: TypeId::Int8 };
pub static INT16_PARSER: IntegerParser = IntegerParser { type_id: TypeId::Int16 };
pub static INT32_PARSER: IntegerParser = IntegerParser { type_id: TypeId::Int32 };
pub static INT64_PARSER: IntegerParser = IntegerParser { type_id: TypeId::Int64 };
pub static FLOAT32_PARSER: FloatParser = FloatParser { type_id: TypeId::Float32 };
pub static FLOAT64_PARSER: FloatParser = FloatParser { type_id: TypeId::Float64 };
pub static UTF8_PARSER: Utf8Parser = Utf8Parser;
pub static HEX_BINARY_PARSER: HexBinaryParser = HexBinaryParser;

/// Serializable selector for a parser, carried in import configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Utf8,
    HexBinary,
}

impl ParserKind {
    /// Returns the default parser kind for a field type.
    pub fn for_type(type_id: TypeId) -> Self {
        match type_id {
            TypeId::Boolean => ParserKind::Boolean,
            TypeId::Int8 => ParserKind::Int8,
            TypeId::Int16 => ParserKind::Int16,
            TypeId::Int32 => ParserKind::Int32,
            TypeId::Int64 => ParserKind::Int64,
            TypeId::Float32 => ParserKind::Float32,
            TypeId::Float64 => ParserKind::Float64,
            TypeId::Utf8 => ParserKind::Utf8,
            TypeId::Binary => ParserKind::HexBinary,
        }
    }

    /// Returns the shared parser instance.
    pub fn parser(&self) -> &'static dyn ValueParser {
        match self {
            ParserKind::Boolean => &BOOLEAN_PARSER,
            ParserKind::Int8 => &INT8_PARSER,
            ParserKind::Int16 => &INT16_PARSER,
            ParserKind::Int32 => &INT32_PARSER,
            ParserKind::Int64 => &INT64_PARSER,
            ParserKind::Float32 => &FLOAT32_PARSER,
            ParserKind::Float64 => &FLOAT64_PARSER,
            ParserKind::Utf8 => &UTF8_PARSER,
            ParserKind::HexBinary => &HEX_BINARY_PARSER,
        }
    }
}

/// Returns the default parser for a field type.
pub fn parser_for(type_id: TypeId) -> &'static dyn ValueParser {
    ParserKind::for_type(type_id).parser()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use kestrel_common::TypeTrait;

    fn parse_value(type_id: TypeId, text: &str) -> Result<Value> {
        let mut out = BytesMut::new();
        parser_for(type_id).parse_str(text, &mut out)?;
        Value::decode(&TypeTrait::of(type_id), &out)
    }

    #[test]
    fn test_float_encoding_of_pi() {
        let mut out = BytesMut::new();
        FLOAT32_PARSER.parse_str("3.14", &mut out).unwrap();
        assert_eq!(&out[..], &3.14f32.to_be_bytes());
    }

    #[test]
    fn test_float_rejects_garbage() {
        let mut out = BytesMut::new();
        let err = FLOAT32_PARSER.parse_str("abc", &mut out).unwrap_err();
        assert!(err.is_parse_error());
        assert!(err.to_string().contains("abc"));
        assert!(out.is_empty());
    }

    #[test]
    fn test_float_rejects_overflow_and_specials() {
        assert!(parse_value(TypeId::Float32, "1e40").unwrap_err().is_parse_error());
        assert!(parse_value(TypeId::Float64, "inf").unwrap_err().is_parse_error());
        assert!(parse_value(TypeId::Float64, "NaN").unwrap_err().is_parse_error());
        assert!(parse_value(TypeId::Float64, "").unwrap_err().is_parse_error());
        assert_eq!(
            parse_value(TypeId::Float64, "-2.5e3").unwrap(),
            Value::Float64(-2500.0)
        );
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(parse_value(TypeId::Int8, "-128").unwrap(), Value::Int8(-128));
        assert_eq!(parse_value(TypeId::Int16, "+300").unwrap(), Value::Int16(300));
        assert_eq!(parse_value(TypeId::Int32, "42").unwrap(), Value::Int32(42));
        assert_eq!(
            parse_value(TypeId::Int64, "-9223372036854775808").unwrap(),
            Value::Int64(i64::MIN)
        );
    }

    #[test]
    fn test_integer_out_of_range_is_not_coerced() {
        assert!(parse_value(TypeId::Int8, "128").unwrap_err().is_parse_error());
        assert!(parse_value(TypeId::Int32, "2147483648").unwrap_err().is_parse_error());
        assert!(
            parse_value(TypeId::Int64, "9223372036854775808")
                .unwrap_err()
                .is_parse_error()
        );
    }

    #[test]
    fn test_integer_grammar() {
        for bad in ["", "-", "+", "12a", " 12", "12 ", "1.0", "0x10"] {
            let err = parse_value(TypeId::Int32, bad).unwrap_err();
            assert!(err.is_parse_error(), "expected parse error for {:?}", bad);
        }
    }

    #[test]
    fn test_parse_respects_bounds() {
        let input = b"xx1234yy";
        let mut out = BytesMut::new();
        INT32_PARSER.parse(input, 2, 4, &mut out).unwrap();
        assert_eq!(&out[..], &1234i32.to_be_bytes());

        let err = INT32_PARSER.parse(input, 6, 10, &mut out).unwrap_err();
        assert!(err.is_encoding_error());
    }

    #[test]
    fn test_boolean() {
        assert_eq!(parse_value(TypeId::Boolean, "TRUE").unwrap(), Value::Boolean(true));
        assert_eq!(parse_value(TypeId::Boolean, "false").unwrap(), Value::Boolean(false));
        assert!(parse_value(TypeId::Boolean, "yes").unwrap_err().is_parse_error());
    }

    #[test]
    fn test_utf8() {
        assert_eq!(
            parse_value(TypeId::Utf8, "héllo").unwrap(),
            Value::Utf8("héllo".to_string())
        );
        let mut out = BytesMut::new();
        let err = UTF8_PARSER.parse(&[0xff, 0xfe], 0, 2, &mut out).unwrap_err();
        assert!(err.is_parse_error());
    }

    #[test]
    fn test_hex_binary() {
        let mut out = BytesMut::new();
        HEX_BINARY_PARSER.parse_str("0A1b", &mut out).unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 2, 0x0a, 0x1b]);

        assert!(parse_value(TypeId::Binary, "abc").unwrap_err().is_parse_error());
        assert!(parse_value(TypeId::Binary, "zz").unwrap_err().is_parse_error());
    }

    #[test]
    fn test_parser_kind_serde_and_lookup() {
        let kind: ParserKind = serde_json::from_str("\"hex_binary\"").unwrap();
        assert_eq!(kind, ParserKind::HexBinary);
        assert_eq!(kind.parser().type_id(), TypeId::Binary);
        assert_eq!(ParserKind::for_type(TypeId::Float32), ParserKind::Float32);
    }

    #[test]
    fn test_parsers_shared_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|t| {
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let mut out = BytesMut::new();
                        let text = (t * 1000 + i).to_string();
                        INT64_PARSER.parse_str(&text, &mut out).unwrap();
                        assert_eq!(&out[..], &((t * 1000 + i) as i64).to_be_bytes());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
