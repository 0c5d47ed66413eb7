//! Binary record codec.
//!
//! Records are written in Avro binary encoding: for every schema field, in
//! schema order, the zig-zag varint union branch index followed by the value
//! for the non-null branch (8-byte little-endian double, or zig-zag varint
//! long). The output depends only on the record and the schema.

use crate::schema::{FieldSchema, NumericKind, RecordSchema};
use crate::telemetry::{FieldName, PositionRecord, FIELD_COUNT};
use arrayvec::ArrayVec;
use static_assertions::const_assert;
use thiserror::Error;

const MAX_VARINT_SIZE: usize = 10;
// One-byte branch index plus the widest value encoding
const MAX_FIELD_SIZE: usize = 1 + MAX_VARINT_SIZE;
pub const MAX_RECORD_SIZE: usize = FIELD_COUNT * MAX_FIELD_SIZE;

const_assert!(MAX_FIELD_SIZE >= 1 + 8);
const_assert!(MAX_RECORD_SIZE <= 256);

pub type EncodedRecord = ArrayVec<u8, MAX_RECORD_SIZE>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("record truncated while reading field {0}")]
    Truncated(FieldName),
    #[error("field {field} has invalid union branch {branch}")]
    InvalidBranch { field: FieldName, branch: i64 },
    #[error("varint overflow in field {0}")]
    VarintOverflow(FieldName),
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone)]
pub struct RecordEncoder {
    schema: RecordSchema,
}

impl RecordEncoder {
    pub fn new(schema: RecordSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    pub fn encode(&self, record: &PositionRecord) -> EncodedRecord {
        let mut out = EncodedRecord::new();
        for field in self.schema.fields() {
            match record.get(field.field) {
                None => write_long(&mut out, i64::from(field.null_branch)),
                Some(value) => {
                    write_long(&mut out, i64::from(field.value_branch));
                    match field.kind {
                        NumericKind::Double => out.extend(value.to_le_bytes()),
                        NumericKind::Long => write_long(&mut out, value.trunc() as i64),
                    }
                }
            }
        }
        out
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<PositionRecord, CodecError> {
        let mut reader = Reader { bytes, pos: 0 };
        let mut record = PositionRecord::default();

        for field in self.schema.fields() {
            let value = reader.read_field(field)?;
            record.set(field.field, value);
        }

        match bytes.len() - reader.pos {
            0 => Ok(record),
            remaining => Err(CodecError::TrailingBytes(remaining)),
        }
    }
}

fn write_long(out: &mut EncodedRecord, value: i64) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        if n & !0x7f == 0 {
            out.push(n as u8);
            return;
        }
        out.push((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn read_field(&mut self, field: &FieldSchema) -> Result<Option<f64>, CodecError> {
        let branch = self.read_long(field.field)?;
        if branch == i64::from(field.null_branch) {
            return Ok(None);
        }
        if branch != i64::from(field.value_branch) {
            return Err(CodecError::InvalidBranch { field: field.field, branch });
        }

        match field.kind {
            NumericKind::Double => {
                let end = self.pos + 8;
                let raw = self.bytes.get(self.pos..end).ok_or(CodecError::Truncated(field.field))?;
                let mut le = [0u8; 8];
                le.copy_from_slice(raw);
                self.pos = end;
                Ok(Some(f64::from_le_bytes(le)))
            }
            NumericKind::Long => Ok(Some(self.read_long(field.field)? as f64)),
        }
    }

    fn read_long(&mut self, field: FieldName) -> Result<i64, CodecError> {
        let mut n: u64 = 0;
        for i in 0..MAX_VARINT_SIZE {
            let byte = *self.bytes.get(self.pos).ok_or(CodecError::Truncated(field))?;
            self.pos += 1;
            n |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok((n >> 1) as i64 ^ -((n & 1) as i64));
            }
        }
        Err(CodecError::VarintOverflow(field))
    }
}
