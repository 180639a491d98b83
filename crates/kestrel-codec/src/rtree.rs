//! Bounding keys and tuple writers for R-tree indexes.
//!
//! An R-tree tuple starts with its bounding key, `2 * dims` FLOAT64 fields
//! laid out as `[min_0, .., min_{d-1}, max_0, .., max_{d-1}]`, followed by
//! the payload fields (typically the primary key of the indexed record).

use crate::tuple::{FieldAccess, TupleReference, TupleWriter};
use bytes::{BufMut, BytesMut};
use kestrel_common::{KestrelError, Result, TypeId, TypeTrait};
use std::sync::Arc;

/// Minimum bounding rectangle in `dims` dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Mbr {
    mins: Vec<f64>,
    maxs: Vec<f64>,
}

impl Mbr {
    /// Creates a rectangle from its lower and upper corners.
    pub fn new(mins: Vec<f64>, maxs: Vec<f64>) -> Result<Self> {
        if mins.is_empty() || mins.len() != maxs.len() {
            return Err(KestrelError::Encoding(format!(
                "bounding key needs matching corners, got {} and {} coordinates",
                mins.len(),
                maxs.len()
            )));
        }
        if mins.iter().zip(&maxs).any(|(lo, hi)| lo > hi || lo.is_nan() || hi.is_nan()) {
            return Err(KestrelError::Encoding(
                "bounding key has min greater than max".to_string(),
            ));
        }
        Ok(Self { mins, maxs })
    }

    /// Creates a degenerate rectangle covering a single point.
    pub fn from_point(point: &[f64]) -> Result<Self> {
        Self::new(point.to_vec(), point.to_vec())
    }

    /// Returns the number of dimensions.
    pub fn dims(&self) -> usize {
        self.mins.len()
    }

    /// Returns the lower corner.
    pub fn mins(&self) -> &[f64] {
        &self.mins
    }

    /// Returns the upper corner.
    pub fn maxs(&self) -> &[f64] {
        &self.maxs
    }

    fn check_dims(&self, other: &Mbr) -> Result<()> {
        if self.dims() != other.dims() {
            return Err(KestrelError::Encoding(format!(
                "bounding key dimension mismatch: {} vs {}",
                self.dims(),
                other.dims()
            )));
        }
        Ok(())
    }

    /// Returns the smallest rectangle enclosing both rectangles.
    pub fn union(&self, other: &Mbr) -> Result<Mbr> {
        self.check_dims(other)?;
        Ok(Mbr {
            mins: self.mins.iter().zip(&other.mins).map(|(a, b)| a.min(*b)).collect(),
            maxs: self.maxs.iter().zip(&other.maxs).map(|(a, b)| a.max(*b)).collect(),
        })
    }

    /// Returns true if the rectangles share at least one point.
    pub fn intersects(&self, other: &Mbr) -> bool {
        self.dims() == other.dims()
            && (0..self.dims())
                .all(|d| self.mins[d] <= other.maxs[d] && other.mins[d] <= self.maxs[d])
    }

    /// Returns true if `other` lies entirely inside this rectangle.
    pub fn contains(&self, other: &Mbr) -> bool {
        self.dims() == other.dims()
            && (0..self.dims())
                .all(|d| self.mins[d] <= other.mins[d] && other.maxs[d] <= self.maxs[d])
    }

    /// Returns the hyper-volume of the rectangle.
    pub fn area(&self) -> f64 {
        self.mins
            .iter()
            .zip(&self.maxs)
            .map(|(lo, hi)| hi - lo)
            .product()
    }

    /// Appends the encoded bounding key fields.
    pub fn encode_into(&self, out: &mut BytesMut) {
        for v in self.mins.iter().chain(&self.maxs) {
            out.put_f64(*v);
        }
    }
}

/// Writes R-tree tuples: a bounding key followed by payload fields.
///
/// Besides building fresh entries, the writer provides the verbatim copy
/// path merge operations use to move entries into a new component.
#[derive(Debug, Clone)]
pub struct RTreeTupleWriter {
    dims: usize,
    writer: TupleWriter,
}

impl RTreeTupleWriter {
    /// Creates a writer for a schema whose first `2 * dims` fields are FLOAT64.
    pub fn new(schema: impl Into<Arc<[TypeTrait]>>, dims: usize) -> Result<Self> {
        let writer = TupleWriter::new(schema);
        let key_fields = 2 * dims;
        if dims == 0 || writer.schema().len() < key_fields {
            return Err(KestrelError::Encoding(format!(
                "R-tree schema with {} fields cannot hold a {}-dimensional bounding key",
                writer.schema().len(),
                dims
            )));
        }
        if let Some(bad) = writer.schema()[..key_fields]
            .iter()
            .find(|t| t.type_id != TypeId::Float64)
        {
            return Err(KestrelError::TypeMismatch {
                expected: TypeId::Float64,
                actual: bad.type_id,
            });
        }
        Ok(Self { dims, writer })
    }

    /// Returns the number of dimensions.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Returns the number of bounding key fields.
    pub fn key_field_count(&self) -> usize {
        2 * self.dims
    }

    /// Returns the full tuple schema.
    pub fn schema(&self) -> &[TypeTrait] {
        self.writer.schema()
    }

    /// Writes `mbr` followed by the payload fields of `payload` starting at `payload_start`.
    pub fn write_with_bounding_key<T: FieldAccess + ?Sized>(
        &self,
        mbr: &Mbr,
        payload: &T,
        payload_start: usize,
        out: &mut BytesMut,
    ) -> Result<usize> {
        if mbr.dims() != self.dims {
            return Err(KestrelError::Encoding(format!(
                "bounding key has {} dimensions, index expects {}",
                mbr.dims(),
                self.dims
            )));
        }

        let payload_fields = self.schema().len() - self.key_field_count();
        if payload_start + payload_fields > payload.field_count() {
            return Err(KestrelError::Encoding(format!(
                "payload source has {} fields, need {} from field {}",
                payload.field_count(),
                payload_fields,
                payload_start
            )));
        }

        let mark = out.len();
        mbr.encode_into(out);
        for field in payload_start..payload_start + payload_fields {
            match payload.field_bytes(field) {
                Ok(bytes) => out.put_slice(bytes),
                Err(e) => {
                    out.truncate(mark);
                    return Err(e);
                }
            }
        }
        Ok(out.len() - mark)
    }

    /// Copies an existing R-tree tuple verbatim.
    pub fn write_copy<T: FieldAccess + ?Sized>(&self, src: &T, out: &mut BytesMut) -> Result<usize> {
        self.writer.write(src, out)
    }

    /// Extracts the bounding key of an R-tree tuple.
    pub fn bounding_key(&self, tuple: &TupleReference<'_>) -> Result<Mbr> {
        let mut coords = Vec::with_capacity(self.key_field_count());
        for field in 0..self.key_field_count() {
            let payload = tuple.payload(field)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(payload);
            coords.push(f64::from_be_bytes(raw));
        }
        let maxs = coords.split_off(self.dims);
        Mbr::new(coords, maxs)
    }

    /// Extracts the bounding key of the R-tree tuple stored at the start of `buf`.
    pub fn bounding_key_of(&self, buf: &[u8]) -> Result<Mbr> {
        let tuple = TupleReference::at(self.writer.shared_schema(), buf, 0);
        self.bounding_key(&tuple)
    }

    /// Creates a reusable view for reading R-tree tuples.
    pub fn create_tuple_reference<'a>(&self) -> TupleReference<'a> {
        self.writer.create_tuple_reference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn rtree_schema() -> Vec<TypeTrait> {
        vec![
            TypeTrait::FLOAT64,
            TypeTrait::FLOAT64,
            TypeTrait::FLOAT64,
            TypeTrait::FLOAT64,
            TypeTrait::INT64,
        ]
    }

    #[test]
    fn test_mbr_geometry() {
        let a = Mbr::new(vec![0.0, 0.0], vec![2.0, 2.0]).unwrap();
        let b = Mbr::new(vec![1.0, 1.0], vec![3.0, 4.0]).unwrap();
        let c = Mbr::from_point(&[10.0, 10.0]).unwrap();

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.area(), 4.0);

        let u = a.union(&b).unwrap();
        assert_eq!(u.mins(), &[0.0, 0.0]);
        assert_eq!(u.maxs(), &[3.0, 4.0]);
        assert!(u.contains(&a));
        assert!(u.contains(&b));
        assert!(!a.contains(&b));
    }

    #[test]
    fn test_mbr_validation() {
        assert!(Mbr::new(vec![1.0], vec![0.0]).is_err());
        assert!(Mbr::new(vec![], vec![]).is_err());
        assert!(Mbr::new(vec![0.0], vec![1.0, 2.0]).is_err());
        let a = Mbr::from_point(&[0.0]).unwrap();
        let b = Mbr::from_point(&[0.0, 1.0]).unwrap();
        assert!(a.union(&b).is_err());
        assert!(!a.intersects(&b));
    }

    #[test]
    fn test_writer_rejects_non_float_key() {
        let schema = vec![TypeTrait::INT32, TypeTrait::FLOAT64, TypeTrait::INT64];
        let err = RTreeTupleWriter::new(schema, 1).unwrap_err();
        assert!(matches!(err, KestrelError::TypeMismatch { .. }));
        assert!(RTreeTupleWriter::new(rtree_schema(), 3).is_err());
    }

    #[test]
    fn test_bounding_key_embedded_before_payload() {
        let writer = RTreeTupleWriter::new(rtree_schema(), 2).unwrap();

        // Source record: [id, x, y]; payload is the id.
        let record_writer = TupleWriter::new(vec![
            TypeTrait::INT64,
            TypeTrait::FLOAT64,
            TypeTrait::FLOAT64,
        ]);
        let mut record = BytesMut::new();
        record_writer
            .write_values(
                &[Value::Int64(77), Value::Float64(1.5), Value::Float64(-2.0)],
                &mut record,
            )
            .unwrap();
        let record_ref = TupleReference::at(record_writer.shared_schema(), &record, 0);

        let mbr = Mbr::from_point(&[1.5, -2.0]).unwrap();
        let mut entry = BytesMut::new();
        let written = writer
            .write_with_bounding_key(&mbr, &record_ref, 0, &mut entry)
            .unwrap();
        assert_eq!(written, 4 * 8 + 8);

        assert_eq!(writer.bounding_key_of(&entry).unwrap(), mbr);
        let mut view = writer.create_tuple_reference();
        view.reset(&entry, 0);
        assert_eq!(view.value(4).unwrap(), Value::Int64(77));
    }

    #[test]
    fn test_copy_path_is_verbatim() {
        let writer = RTreeTupleWriter::new(rtree_schema(), 2).unwrap();
        let mut entry = BytesMut::new();
        TupleWriter::new(rtree_schema())
            .write_values(
                &[
                    Value::Float64(0.0),
                    Value::Float64(1.0),
                    Value::Float64(2.0),
                    Value::Float64(3.0),
                    Value::Int64(9),
                ],
                &mut entry,
            )
            .unwrap();

        let src = TupleReference::at(Arc::from(rtree_schema()), &entry, 0);
        let mut copy = BytesMut::new();
        writer.write_copy(&src, &mut copy).unwrap();
        assert_eq!(&copy[..], &entry[..]);
    }

    #[test]
    fn test_dimension_mismatch_leaves_output_untouched() {
        let writer = RTreeTupleWriter::new(rtree_schema(), 2).unwrap();
        let src_schema: Arc<[TypeTrait]> = Arc::from(vec![TypeTrait::INT64]);
        let mut src_buf = BytesMut::new();
        Value::Int64(1).encode_into(&mut src_buf).unwrap();
        let src = TupleReference::at(src_schema, &src_buf, 0);

        let mut out = BytesMut::new();
        let mbr = Mbr::from_point(&[1.0]).unwrap();
        assert!(writer.write_with_bounding_key(&mbr, &src, 0, &mut out).is_err());
        assert!(out.is_empty());
    }
}
