//! Little-endian binary encoding of cells and rows.
//!
//! Used for spill records and as the byte image fed to xxh3 when hashing
//! join keys into partitions.
//!
//! Cell layout: one tag byte followed by the value.
//!
//! | tag | value                                |
//! |-----|--------------------------------------|
//! | 0   | missing (no payload)                 |
//! | 1   | boolean, one byte                    |
//! | 2   | `i32`                                |
//! | 3   | `i64`                                |
//! | 4   | `f64` bit pattern as `u64`           |
//! | 5   | string: `u32` byte length, then UTF-8 |

use hashjoin_error::{JoinError, Result};
use hashjoin_types::{DataCell, DataRow, RowKey, canonical_double_bits};

const TAG_MISSING: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_LONG: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_STRING: u8 = 5;

/// Append the encoding of `cell` to `out`.
///
/// With `canonical` set, doubles are written with their canonical bit
/// pattern so that cells that compare equal encode identically.
pub fn encode_cell(cell: &DataCell, canonical: bool, out: &mut Vec<u8>) -> Result<()> {
    match cell {
        DataCell::Missing => out.push(TAG_MISSING),
        DataCell::Boolean(v) => {
            out.push(TAG_BOOLEAN);
            out.push(u8::from(*v));
        }
        DataCell::Int(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        DataCell::Long(v) => {
            out.push(TAG_LONG);
            out.extend_from_slice(&v.to_le_bytes());
        }
        DataCell::Double(v) => {
            out.push(TAG_DOUBLE);
            let bits = if canonical {
                canonical_double_bits(*v)
            } else {
                v.to_bits()
            };
            out.extend_from_slice(&bits.to_le_bytes());
        }
        DataCell::String(v) => {
            out.push(TAG_STRING);
            encode_str(v, out)?;
        }
    }
    Ok(())
}

fn encode_str(value: &str, out: &mut Vec<u8>) -> Result<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| JoinError::internal(format!("string of {} bytes too long", value.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Append `offset`, the row key and all cells of `row` to `out`.
pub fn encode_row(row: &DataRow, offset: u64, out: &mut Vec<u8>) -> Result<()> {
    out.extend_from_slice(&offset.to_le_bytes());
    encode_str(row.key().as_str(), out)?;
    let count = u32::try_from(row.num_cells())
        .map_err(|_| JoinError::internal("row has more than u32::MAX cells"))?;
    out.extend_from_slice(&count.to_le_bytes());
    for cell in row.cells() {
        encode_cell(cell, false, out)?;
    }
    Ok(())
}

/// Decode a payload written by [`encode_row`]. Trailing bytes are an error.
pub fn decode_row(bytes: &[u8]) -> Result<(DataRow, u64)> {
    let mut reader = Reader::new(bytes);
    let offset = reader.u64("row_offset")?;
    let key = reader.string("row_key")?;
    let count = reader.u32("cell_count")?;
    let mut cells = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        cells.push(reader.cell()?);
    }
    if !reader.is_exhausted() {
        return Err(corrupt(format!(
            "{} trailing bytes after row payload",
            bytes.len() - reader.pos
        )));
    }
    Ok((DataRow::new(RowKey::new(key), cells), offset))
}

pub(crate) fn corrupt(detail: impl Into<String>) -> JoinError {
    JoinError::SpillCorrupt {
        detail: detail.into(),
    }
}

/// Bounds-checked cursor over a byte slice.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) const fn position(&self) -> usize {
        self.pos
    }

    pub(crate) const fn is_exhausted(&self) -> bool {
        self.pos == self.bytes.len()
    }

    pub(crate) fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| corrupt(format!("overflow while reading field {field}")))?;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| {
            corrupt(format!(
                "field {field} out of bounds: start={}, end={end}, len={}",
                self.pos,
                self.bytes.len()
            ))
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let slice = self.take(N, field)?;
        slice
            .try_into()
            .map_err(|_| corrupt(format!("failed to parse field {field}")))
    }

    pub(crate) fn u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.array::<1>(field)?[0])
    }

    pub(crate) fn u32(&mut self, field: &str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array(field)?))
    }

    pub(crate) fn u64(&mut self, field: &str) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array(field)?))
    }

    fn string(&mut self, field: &str) -> Result<String> {
        let len = self.u32(field)? as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| corrupt(format!("field {field} is not valid UTF-8: {err}")))
    }

    fn cell(&mut self) -> Result<DataCell> {
        let tag = self.u8("cell_tag")?;
        Ok(match tag {
            TAG_MISSING => DataCell::Missing,
            TAG_BOOLEAN => DataCell::Boolean(self.u8("boolean")? != 0),
            TAG_INT => DataCell::Int(i32::from_le_bytes(self.array("int")?)),
            TAG_LONG => DataCell::Long(i64::from_le_bytes(self.array("long")?)),
            TAG_DOUBLE => DataCell::Double(f64::from_bits(self.u64("double")?)),
            TAG_STRING => DataCell::String(self.string("string")?),
            other => return Err(corrupt(format!("unknown cell tag {other}"))),
        })
    }
}
