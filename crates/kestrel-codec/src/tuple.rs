//! Tuple serialization and zero-copy tuple views.
//!
//! Binary tuple layout (no header, field order fixed by the schema):
//! ```text
//! +-----------------+-----------------+-----+-----------------+
//! | field_1 bytes   | field_2 bytes   | ... | field_n bytes   |
//! +-----------------+-----------------+-----+-----------------+
//! fixed-length field:    [width bytes, big-endian]
//! variable-length field: [u32 BE length][payload]
//! ```

use crate::normalize::{compare_with_normalized, computer_for};
use crate::value::{Value, compare_payloads, read_length_prefix};
use bytes::{BufMut, BytesMut};
use kestrel_common::{KestrelError, LENGTH_PREFIX_SIZE, Result, TypeTrait};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::sync::Arc;

/// Random access to the encoded fields of a tuple.
pub trait FieldAccess {
    /// Returns the number of fields.
    fn field_count(&self) -> usize;

    /// Returns the encoded bytes of a field, length prefix included.
    fn field_bytes(&self, field: usize) -> Result<&[u8]>;
}

/// Returns the encoded length of the field starting at `offset`.
#[inline]
fn encoded_field_len(type_trait: &TypeTrait, buf: &[u8], offset: usize) -> Result<usize> {
    match type_trait.fixed_length {
        Some(width) => Ok(width as usize),
        None => Ok(LENGTH_PREFIX_SIZE + read_length_prefix(buf, offset)?),
    }
}

/// Serializes tuples of one schema.
///
/// Bound once to a schema and reused for every tuple; holds no per-tuple state.
#[derive(Debug, Clone)]
pub struct TupleWriter {
    schema: Arc<[TypeTrait]>,
}

impl TupleWriter {
    /// Creates a writer for the given field traits.
    pub fn new(schema: impl Into<Arc<[TypeTrait]>>) -> Self {
        Self {
            schema: schema.into(),
        }
    }

    /// Returns the field traits of this writer.
    pub fn schema(&self) -> &[TypeTrait] {
        &self.schema
    }

    /// Returns a shared handle to the field traits.
    pub fn shared_schema(&self) -> Arc<[TypeTrait]> {
        Arc::clone(&self.schema)
    }

    fn check_field_count(&self, count: usize) -> Result<()> {
        if count != self.schema.len() {
            return Err(KestrelError::Encoding(format!(
                "tuple has {} fields, schema expects {}",
                count,
                self.schema.len()
            )));
        }
        Ok(())
    }

    /// Returns the number of bytes `write_values` will append for these values.
    pub fn bytes_required(&self, values: &[Value]) -> Result<usize> {
        self.check_field_count(values.len())?;
        Ok(values.iter().map(Value::encoded_len).sum())
    }

    /// Encodes values in schema order. Returns the number of bytes written.
    ///
    /// On error `out` is left unchanged.
    pub fn write_values(&self, values: &[Value], out: &mut BytesMut) -> Result<usize> {
        let required = self.bytes_required(values)?;
        let mark = out.len();
        out.reserve(required);

        for (value, type_trait) in values.iter().zip(self.schema.iter()) {
            if let Err(e) = value.encode_as(type_trait, out) {
                out.truncate(mark);
                return Err(e);
            }
        }
        Ok(out.len() - mark)
    }

    /// Copies every field of `tuple`. Returns the number of bytes written.
    pub fn write<T: FieldAccess + ?Sized>(&self, tuple: &T, out: &mut BytesMut) -> Result<usize> {
        self.check_field_count(tuple.field_count())?;
        self.copy_fields(tuple, 0, tuple.field_count(), out)
    }

    /// Copies `count` fields of `tuple` starting at `start_field`.
    ///
    /// The writer's schema describes the copied fields, so a key writer can be
    /// bound to the leading fields of a wider tuple schema.
    pub fn write_fields<T: FieldAccess + ?Sized>(
        &self,
        tuple: &T,
        start_field: usize,
        count: usize,
        out: &mut BytesMut,
    ) -> Result<usize> {
        self.check_field_count(count)?;
        self.copy_fields(tuple, start_field, count, out)
    }

    fn copy_fields<T: FieldAccess + ?Sized>(
        &self,
        tuple: &T,
        start_field: usize,
        count: usize,
        out: &mut BytesMut,
    ) -> Result<usize> {
        if start_field + count > tuple.field_count() {
            return Err(KestrelError::Encoding(format!(
                "cannot copy fields {}..{} of a {}-field tuple",
                start_field,
                start_field + count,
                tuple.field_count()
            )));
        }

        let mark = out.len();
        for field in start_field..start_field + count {
            match tuple.field_bytes(field) {
                Ok(bytes) => out.put_slice(bytes),
                Err(e) => {
                    out.truncate(mark);
                    return Err(e);
                }
            }
        }
        Ok(out.len() - mark)
    }

    /// Creates a reusable view for reading tuples written with this schema.
    pub fn create_tuple_reference<'a>(&self) -> TupleReference<'a> {
        TupleReference::new(Arc::clone(&self.schema))
    }
}

/// Reusable, repositionable view over an encoded tuple.
///
/// Borrows the underlying buffer; `reset` points the view at another tuple
/// without allocating. Field offsets are resolved left to right on first
/// access and cached until the next reset. Not shared between threads.
#[derive(Debug)]
pub struct TupleReference<'a> {
    /// Field traits of the viewed tuple.
    schema: Arc<[TypeTrait]>,
    /// Buffer holding the tuple.
    buf: &'a [u8],
    /// Absolute offsets of resolved field starts; `offsets[0]` is the tuple start.
    offsets: RefCell<Vec<usize>>,
}

impl<'a> TupleReference<'a> {
    /// Creates an unpositioned view for the given schema.
    pub fn new(schema: Arc<[TypeTrait]>) -> Self {
        let capacity = schema.len() + 1;
        let mut offsets = Vec::with_capacity(capacity);
        offsets.push(0);
        Self {
            schema,
            buf: &[],
            offsets: RefCell::new(offsets),
        }
    }

    /// Creates a view positioned at `offset` in `buf`.
    pub fn at(schema: Arc<[TypeTrait]>, buf: &'a [u8], offset: usize) -> Self {
        let mut tuple = Self::new(schema);
        tuple.reset(buf, offset);
        tuple
    }

    /// Repositions the view on the tuple starting at `offset` in `buf`.
    #[inline]
    pub fn reset(&mut self, buf: &'a [u8], offset: usize) {
        self.buf = buf;
        let offsets = self.offsets.get_mut();
        offsets.clear();
        offsets.push(offset);
    }

    /// Returns the field traits of this view.
    pub fn schema(&self) -> &[TypeTrait] {
        &self.schema
    }

    /// Returns the tuple start offset within the buffer.
    pub fn start(&self) -> usize {
        self.offsets.borrow()[0]
    }

    /// Resolves field start offsets up to and including index `upto`.
    fn resolve(&self, upto: usize) -> Result<usize> {
        let mut offsets = self.offsets.borrow_mut();
        while offsets.len() <= upto {
            let field = offsets.len() - 1;
            let offset = offsets[field];
            let len = encoded_field_len(&self.schema[field], self.buf, offset).map_err(|_| {
                KestrelError::FieldOutOfBounds {
                    field,
                    offset,
                    len: LENGTH_PREFIX_SIZE,
                    buffer_len: self.buf.len(),
                }
            })?;
            if offset + len > self.buf.len() {
                return Err(KestrelError::FieldOutOfBounds {
                    field,
                    offset,
                    len,
                    buffer_len: self.buf.len(),
                });
            }
            offsets.push(offset + len);
        }
        Ok(offsets[upto])
    }

    fn check_index(&self, field: usize) -> Result<()> {
        if field >= self.schema.len() {
            return Err(KestrelError::Encoding(format!(
                "field index {} out of range for {}-field tuple",
                field,
                self.schema.len()
            )));
        }
        Ok(())
    }

    /// Returns the absolute offset of a field's first byte.
    pub fn field_offset(&self, field: usize) -> Result<usize> {
        self.check_index(field)?;
        self.resolve(field)
    }

    /// Returns the encoded length of a field, length prefix included.
    pub fn field_length(&self, field: usize) -> Result<usize> {
        self.check_index(field)?;
        let end = self.resolve(field + 1)?;
        Ok(end - self.offsets.borrow()[field])
    }

    /// Returns the encoded bytes of a field, length prefix included.
    pub fn field(&self, field: usize) -> Result<&'a [u8]> {
        self.check_index(field)?;
        let end = self.resolve(field + 1)?;
        let start = self.offsets.borrow()[field];
        let buf = self.buf;
        Ok(&buf[start..end])
    }

    /// Returns the payload of a field, without its length prefix.
    pub fn payload(&self, field: usize) -> Result<&'a [u8]> {
        let bytes = self.field(field)?;
        if self.schema[field].is_fixed_length() {
            Ok(bytes)
        } else {
            Ok(&bytes[LENGTH_PREFIX_SIZE..])
        }
    }

    /// Decodes a field into an owned value.
    pub fn value(&self, field: usize) -> Result<Value> {
        let payload = self.payload(field)?;
        Value::decode_payload(self.schema[field].type_id, payload)
    }

    /// Decodes every field.
    pub fn values(&self) -> Result<Vec<Value>> {
        (0..self.schema.len()).map(|i| self.value(i)).collect()
    }

    /// Returns the normalized key of a field.
    pub fn normalized_key(&self, field: usize) -> Result<u32> {
        let start = self.field_offset(field)?;
        let len = self.field_length(field)?;
        Ok(computer_for(self.schema[field].type_id).normalize(self.buf, start, len))
    }

    /// Returns the total encoded size of the tuple.
    pub fn tuple_size(&self) -> Result<usize> {
        let end = self.resolve(self.schema.len())?;
        Ok(end - self.start())
    }

    /// Returns the encoded bytes of the whole tuple.
    pub fn tuple_bytes(&self) -> Result<&'a [u8]> {
        let end = self.resolve(self.schema.len())?;
        let buf = self.buf;
        Ok(&buf[self.start()..end])
    }
}

impl FieldAccess for TupleReference<'_> {
    fn field_count(&self) -> usize {
        self.schema.len()
    }

    fn field_bytes(&self, field: usize) -> Result<&[u8]> {
        self.field(field)
    }
}

/// Checks that `buf` holds exactly one well-formed tuple of the schema.
pub fn validate_tuple(schema: &Arc<[TypeTrait]>, buf: &[u8]) -> Result<()> {
    let tuple = TupleReference::at(Arc::clone(schema), buf, 0);
    let size = tuple.tuple_size()?;
    if size != buf.len() {
        return Err(KestrelError::Encoding(format!(
            "tuple occupies {} bytes but buffer holds {}",
            size,
            buf.len()
        )));
    }
    Ok(())
}

/// Compares the leading `field_count` fields of two encoded tuples.
///
/// Each field is compared by normalized key first and by full value on ties.
/// Tuples must be well formed; a malformed field falls back to comparing the
/// remaining raw bytes so the order stays total.
pub fn compare_tuples(schema: &[TypeTrait], a: &[u8], b: &[u8], field_count: usize) -> Ordering {
    let (mut oa, mut ob) = (0usize, 0usize);

    for type_trait in schema.iter().take(field_count) {
        let (la, lb) = match (
            encoded_field_len(type_trait, a, oa),
            encoded_field_len(type_trait, b, ob),
        ) {
            (Ok(la), Ok(lb)) if oa + la <= a.len() && ob + lb <= b.len() => (la, lb),
            _ => return a[oa.min(a.len())..].cmp(&b[ob.min(b.len())..]),
        };

        let computer = computer_for(type_trait.type_id);
        let ka = computer.normalize(a, oa, la);
        let kb = computer.normalize(b, ob, lb);
        let skip = if type_trait.is_fixed_length() { 0 } else { LENGTH_PREFIX_SIZE };

        let ord = compare_with_normalized(ka, kb, || {
            if computer.is_decisive() {
                Ordering::Equal
            } else {
                compare_payloads(
                    type_trait.type_id,
                    &a[oa + skip..oa + la],
                    &b[ob + skip..ob + lb],
                )
            }
        });
        if ord != Ordering::Equal {
            return ord;
        }

        oa += la;
        ob += lb;
    }
    Ordering::Equal
}
