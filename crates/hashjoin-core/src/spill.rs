//! Disk buckets for spilled partitions.
//!
//! A bucket is an anonymous temporary file holding the rows of one partition
//! of one input, in the order they were added. The file is created on the
//! first write and disappears when the bucket is dropped.
//!
//! File layout:
//!
//! - header (16 bytes): magic `"HJSP"`, `version: u32`, `header_xxh3: u64`
//!   (hash of the preceding 8 bytes)
//! - records: `payload_len: u32`, payload (see [`crate::codec::encode_row`]),
//!   `payload_xxh3: u64`
//!
//! All integers are little-endian.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;

use hashjoin_error::{JoinError, Result};
use hashjoin_types::{DataRow, InputTable, RowRef};

use crate::codec::{Reader, corrupt, decode_row, encode_row};
use crate::instrumentation;

pub const SPILL_MAGIC: [u8; 4] = *b"HJSP";
pub const SPILL_VERSION: u32 = 1;
pub const SPILL_HEADER_BYTES: usize = 16;
const SPILL_HEADER_HASH_INPUT_BYTES: usize = 8;

/// Encode the file header.
#[must_use]
pub fn encode_header() -> [u8; SPILL_HEADER_BYTES] {
    let mut out = [0_u8; SPILL_HEADER_BYTES];
    out[0..4].copy_from_slice(&SPILL_MAGIC);
    out[4..8].copy_from_slice(&SPILL_VERSION.to_le_bytes());
    let checksum = xxh3_64(&out[..SPILL_HEADER_HASH_INPUT_BYTES]);
    out[8..16].copy_from_slice(&checksum.to_le_bytes());
    out
}

/// Validate a file header.
pub fn decode_header(bytes: &[u8]) -> Result<()> {
    if bytes.len() < SPILL_HEADER_BYTES {
        return Err(corrupt(format!(
            "spill header too short: expected {SPILL_HEADER_BYTES}, got {}",
            bytes.len()
        )));
    }
    let mut reader = Reader::new(bytes);
    if *reader.take(4, "magic")? != SPILL_MAGIC {
        return Err(corrupt("spill file magic mismatch"));
    }
    let version = reader.u32("version")?;
    if version != SPILL_VERSION {
        return Err(corrupt(format!(
            "unsupported spill version {version}, expected {SPILL_VERSION}"
        )));
    }
    let stored = reader.u64("header_xxh3")?;
    let computed = xxh3_64(&bytes[..SPILL_HEADER_HASH_INPUT_BYTES]);
    if stored != computed {
        return Err(corrupt(format!(
            "spill header checksum mismatch: stored={stored:#018x}, computed={computed:#018x}"
        )));
    }
    Ok(())
}

/// Append one framed record to `out`. `scratch` is reused for the payload.
pub fn encode_record(
    row: &DataRow,
    offset: u64,
    scratch: &mut Vec<u8>,
    out: &mut Vec<u8>,
) -> Result<()> {
    scratch.clear();
    encode_row(row, offset, scratch)?;
    let len = u32::try_from(scratch.len())
        .map_err(|_| JoinError::internal(format!("spill record of {} bytes", scratch.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(scratch);
    out.extend_from_slice(&xxh3_64(scratch).to_le_bytes());
    Ok(())
}

/// Decode every record following the header.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<(RowRef, u64)>> {
    let mut reader = Reader::new(bytes);
    let mut rows = Vec::new();
    while !reader.is_exhausted() {
        let record_start = reader.position();
        let len = reader.u32("payload_len")? as usize;
        let payload = reader.take(len, "payload")?;
        let stored = reader.u64("payload_xxh3")?;
        let computed = xxh3_64(payload);
        if stored != computed {
            return Err(corrupt(format!(
                "record at byte {record_start} checksum mismatch: \
                 stored={stored:#018x}, computed={computed:#018x}"
            )));
        }
        let (row, offset) = decode_row(payload)?;
        rows.push((row.into_ref(), offset));
    }
    Ok(rows)
}

#[derive(Debug)]
enum BucketState {
    Empty,
    Writing(BufWriter<File>),
    Closed(File),
}

/// Rows of one partition of one input, on disk.
#[derive(Debug)]
pub struct DiskBucket {
    side: InputTable,
    spill_dir: Option<PathBuf>,
    state: BucketState,
    rows: u64,
    bytes_written: u64,
    scratch: Vec<u8>,
    frame: Vec<u8>,
}

impl DiskBucket {
    /// Bucket whose file will live in `spill_dir`, or the system temp
    /// directory when `None`.
    #[must_use]
    pub fn new(side: InputTable, spill_dir: Option<&Path>) -> Self {
        Self {
            side,
            spill_dir: spill_dir.map(Path::to_path_buf),
            state: BucketState::Empty,
            rows: 0,
            bytes_written: 0,
            scratch: Vec::new(),
            frame: Vec::new(),
        }
    }

    #[must_use]
    pub const fn side(&self) -> InputTable {
        self.side
    }

    /// Number of rows added.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.rows
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Bytes written so far, header included.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        if matches!(self.state, BucketState::Empty) {
            let file = match &self.spill_dir {
                Some(dir) => tempfile::tempfile_in(dir)?,
                None => tempfile::tempfile()?,
            };
            let mut writer = BufWriter::new(file);
            writer.write_all(&encode_header())?;
            self.bytes_written = SPILL_HEADER_BYTES as u64;
            debug!(side = %self.side, dir = ?self.spill_dir, "spill file created");
            self.state = BucketState::Writing(writer);
        }
        match &mut self.state {
            BucketState::Writing(writer) => Ok(writer),
            BucketState::Empty => Err(JoinError::internal("spill writer missing")),
            BucketState::Closed(_) => Err(JoinError::internal(format!(
                "{} spill bucket already closed",
                self.side
            ))),
        }
    }

    /// Append `row` with its original `offset`.
    pub fn add(&mut self, row: &DataRow, offset: u64) -> Result<()> {
        let mut frame = std::mem::take(&mut self.frame);
        frame.clear();
        encode_record(row, offset, &mut self.scratch, &mut frame)?;
        self.writer()?.write_all(&frame)?;
        self.bytes_written += frame.len() as u64;
        self.rows += 1;
        instrumentation::record_spill_row(frame.len() as u64);
        self.frame = frame;
        trace!(side = %self.side, offset, "row spilled");
        Ok(())
    }

    /// Flush buffered records. Further [`DiskBucket::add`] calls fail.
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, BucketState::Empty) {
            BucketState::Writing(writer) => {
                let file = writer.into_inner().map_err(|err| err.into_error())?;
                self.state = BucketState::Closed(file);
            }
            other => self.state = other,
        }
        Ok(())
    }

    /// Close the bucket and stream its rows back, in the order they were
    /// added. Only one record is decoded at a time.
    pub fn records(&mut self) -> Result<BucketRecords<'_>> {
        self.close()?;
        let side = self.side;
        let expected = self.rows;
        let BucketState::Closed(file) = &mut self.state else {
            return Ok(BucketRecords {
                reader: None,
                side,
                remaining: 0,
                scratch: Vec::new(),
            });
        };
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);
        let mut header = [0_u8; SPILL_HEADER_BYTES];
        read_exact_or_corrupt(&mut reader, &mut header, "spill header")?;
        decode_header(&header)?;
        Ok(BucketRecords {
            reader: Some(reader),
            side,
            remaining: expected,
            scratch: Vec::new(),
        })
    }

    /// Close the bucket and read all rows back, in the order they were added.
    pub fn read_all(&mut self) -> Result<Vec<(RowRef, u64)>> {
        let rows = self.records()?.collect::<Result<Vec<_>>>()?;
        debug!(side = %self.side, rows = rows.len(), bytes = self.bytes_written, "spill file read back");
        Ok(rows)
    }
}

fn read_exact_or_corrupt(reader: &mut impl Read, buf: &mut [u8], field: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            corrupt(format!("spill file truncated while reading {field}"))
        } else {
            JoinError::Io(err)
        }
    })
}

/// Iterator over the records of a closed [`DiskBucket`].
pub struct BucketRecords<'a> {
    reader: Option<BufReader<&'a mut File>>,
    side: InputTable,
    remaining: u64,
    scratch: Vec<u8>,
}

impl BucketRecords<'_> {
    fn next_record(&mut self) -> Result<Option<(RowRef, u64)>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        if self.remaining == 0 {
            let mut extra = [0_u8; 1];
            let trailing = reader.read(&mut extra)?;
            self.reader = None;
            if trailing != 0 {
                return Err(corrupt(format!(
                    "{} spill bucket holds more records than were written",
                    self.side
                )));
            }
            return Ok(None);
        }

        let mut len = [0_u8; 4];
        read_exact_or_corrupt(reader, &mut len, "payload_len")?;
        let len = u32::from_le_bytes(len) as usize;
        self.scratch.resize(len, 0);
        read_exact_or_corrupt(reader, &mut self.scratch, "payload")?;
        let mut stored = [0_u8; 8];
        read_exact_or_corrupt(reader, &mut stored, "payload_xxh3")?;
        let stored = u64::from_le_bytes(stored);
        let computed = xxh3_64(&self.scratch);
        if stored != computed {
            return Err(corrupt(format!(
                "{} spill record checksum mismatch: stored={stored:#018x}, computed={computed:#018x}",
                self.side
            )));
        }
        let (row, offset) = decode_row(&self.scratch)?;
        self.remaining -= 1;
        Ok(Some((row.into_ref(), offset)))
    }
}

impl Iterator for BucketRecords<'_> {
    type Item = Result<(RowRef, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(record) => record.map(Ok),
            Err(err) => {
                self.reader = None;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<DataRow> {
        ["A,A,1,2", "B,B,3,4", "C,?,7,8"]
            .iter()
            .map(|l| DataRow::parse_fixture(l))
            .collect()
    }

    #[test]
    fn bucket_round_trips_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut bucket = DiskBucket::new(InputTable::Left, Some(dir.path()));
        assert!(bucket.read_all().unwrap().is_empty(), "unused bucket reads empty");

        let mut bucket = DiskBucket::new(InputTable::Left, Some(dir.path()));
        for (i, row) in rows().iter().enumerate() {
            bucket.add(row, 10 + i as u64).unwrap();
        }
        assert_eq!(bucket.len(), 3);
        assert!(bucket.bytes_written() > SPILL_HEADER_BYTES as u64);

        let back = bucket.read_all().unwrap();
        let offsets: Vec<u64> = back.iter().map(|(_, o)| *o).collect();
        assert_eq!(offsets, vec![10, 11, 12]);
        assert_eq!(back[2].0.to_string(), "C,?,7,8");
        // Reading twice is fine.
        assert_eq!(bucket.read_all().unwrap().len(), 3);
    }

    #[test]
    fn records_stream_in_insertion_order() {
        let mut bucket = DiskBucket::new(InputTable::Right, None);
        assert_eq!(bucket.records().unwrap().count(), 0);

        let mut bucket = DiskBucket::new(InputTable::Right, None);
        for (i, row) in rows().iter().enumerate() {
            bucket.add(row, 7 * i as u64).unwrap();
        }
        let mut records = bucket.records().unwrap();
        let (first, offset) = records.next().unwrap().unwrap();
        assert_eq!((first.to_string(), offset), ("A,A,1,2".to_owned(), 0));
        let rest: Vec<u64> = records.map(|r| r.unwrap().1).collect();
        assert_eq!(rest, vec![7, 14]);

        // A second pass starts from the beginning again.
        assert_eq!(bucket.records().unwrap().count(), 3);
    }

    #[test]
    fn closed_bucket_rejects_writes() {
        let mut bucket = DiskBucket::new(InputTable::Right, None);
        bucket.add(&rows()[0], 0).unwrap();
        bucket.close().unwrap();
        let err = bucket.add(&rows()[1], 1).unwrap_err();
        assert!(err.to_string().contains("already closed"), "got {err}");
    }

    #[test]
    fn header_validation() {
        let header = encode_header();
        assert!(decode_header(&header).is_ok());

        let mut bad_magic = header;
        bad_magic[0] = b'X';
        assert!(decode_header(&bad_magic).is_err());

        let mut bad_version = header;
        bad_version[4] = 9;
        let err = decode_header(&bad_version).unwrap_err();
        assert!(err.to_string().contains("unsupported spill version"), "got {err}");

        assert!(decode_header(&header[..10]).is_err());
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let mut scratch = Vec::new();
        let mut buf = Vec::new();
        encode_record(&rows()[0], 0, &mut scratch, &mut buf).unwrap();
        encode_record(&rows()[1], 1, &mut scratch, &mut buf).unwrap();
        assert_eq!(decode_records(&buf).unwrap().len(), 2);

        buf[6] ^= 0xff;
        let err = decode_records(&buf).unwrap_err();
        assert!(matches!(err, JoinError::SpillCorrupt { .. }), "got {err}");
        assert!(err.to_string().contains("checksum mismatch"), "got {err}");
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let mut scratch = Vec::new();
        let mut buf = Vec::new();
        encode_record(&rows()[0], 0, &mut scratch, &mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            decode_records(&buf),
            Err(JoinError::SpillCorrupt { .. })
        ));
    }
}
