//! Tuple codec for KestrelDB.
//!
//! This crate provides:
//! - Owned field values with canonical big-endian encodings
//! - Stateless text-to-binary value parsers for bulk load
//! - Normalized key computers for cheap pre-comparison in sort and merge
//! - A schema-bound tuple writer and a reusable zero-copy tuple reference
//! - Bounding keys and copy writers for R-tree indexes

pub mod normalize;
pub mod parse;
pub mod rtree;
pub mod tuple;
pub mod value;

pub use normalize::{NormalizedKeyComputer, compare_with_normalized, computer_for};
pub use parse::{ParserKind, ValueParser, parser_for};
pub use rtree::{Mbr, RTreeTupleWriter};
pub use tuple::{FieldAccess, TupleReference, TupleWriter, compare_tuples, validate_tuple};
pub use value::{Value, compare_payloads, length_prefix, put_length_prefixed, read_length_prefix};
