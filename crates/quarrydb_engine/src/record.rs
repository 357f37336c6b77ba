//! On-disk record framing for the reference engine.
//!
//! Durable state is a header followed by framed records:
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload | crc32 (4) |
//! ```
//!
//! The CRC covers everything before it. Frames are self-delimiting and
//! carry their own checksum so a salvager can resynchronize on the magic
//! bytes and skip damaged regions without losing the intact ones.

use crate::status::{NativeError, NativeResult};

/// Magic bytes identifying a record frame.
pub const FRAME_MAGIC: [u8; 4] = *b"QREC";
/// Magic bytes at the start of a main store file.
pub const MAIN_MAGIC: [u8; 4] = *b"QDB1";
/// Magic bytes at the start of a write-ahead-log file.
pub const WAL_MAGIC: [u8; 4] = *b"QWAL";
/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;
/// Frame header size (magic + version + type + length).
pub const FRAME_HEADER_SIZE: usize = 4 + 2 + 1 + 4;
/// Frame footer size (crc32).
pub const FRAME_CRC_SIZE: usize = 4;
/// File header size (magic + version + flags + reserved + kdf salt).
pub const FILE_HEADER_SIZE: usize = 4 + 2 + 1 + 1 + 16;

/// File header flag: record payloads are encrypted.
pub const FLAG_ENCRYPTED: u8 = 0b0000_0001;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A 64-bit integer.
    Integer(i64),
    /// A text string.
    Text(String),
}

impl Value {
    /// Renders the value as a SQL literal.
    #[must_use]
    pub fn to_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

/// A durable record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A table definition.
    Schema {
        /// Table name.
        table: String,
        /// Column names.
        columns: Vec<String>,
    },
    /// One stored row.
    Row {
        /// Owning table.
        table: String,
        /// Row id within the table.
        rowid: i64,
        /// Column values.
        values: Vec<Value>,
    },
    /// A row deletion.
    Delete {
        /// Owning table.
        table: String,
        /// Row id that was removed.
        rowid: i64,
    },
}

impl Record {
    const TYPE_SCHEMA: u8 = 1;
    const TYPE_ROW: u8 = 2;
    const TYPE_DELETE: u8 = 3;

    /// The frame type byte for this record.
    #[must_use]
    pub fn type_byte(&self) -> u8 {
        match self {
            Record::Schema { .. } => Self::TYPE_SCHEMA,
            Record::Row { .. } => Self::TYPE_ROW,
            Record::Delete { .. } => Self::TYPE_DELETE,
        }
    }

    /// Encodes the record payload (without the frame envelope).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Record::Schema { table, columns } => {
                put_str(&mut out, table);
                put_u16(&mut out, columns.len() as u16);
                for c in columns {
                    put_str(&mut out, c);
                }
            }
            Record::Row {
                table,
                rowid,
                values,
            } => {
                put_str(&mut out, table);
                out.extend_from_slice(&rowid.to_le_bytes());
                put_u16(&mut out, values.len() as u16);
                for v in values {
                    match v {
                        Value::Null => out.push(0),
                        Value::Integer(i) => {
                            out.push(1);
                            out.extend_from_slice(&i.to_le_bytes());
                        }
                        Value::Text(s) => {
                            out.push(2);
                            put_u32(&mut out, s.len() as u32);
                            out.extend_from_slice(s.as_bytes());
                        }
                    }
                }
            }
            Record::Delete { table, rowid } => {
                put_str(&mut out, table);
                out.extend_from_slice(&rowid.to_le_bytes());
            }
        }
        out
    }

    /// Decodes a record payload.
    ///
    /// # Errors
    ///
    /// Returns a corruption error on an unknown type byte or a payload
    /// that does not parse cleanly.
    pub fn decode_payload(type_byte: u8, payload: &[u8]) -> NativeResult<Self> {
        let mut cursor = Cursor::new(payload);
        match type_byte {
            Self::TYPE_SCHEMA => {
                let table = cursor.take_str()?;
                let count = cursor.take_u16()? as usize;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    columns.push(cursor.take_str()?);
                }
                Ok(Record::Schema { table, columns })
            }
            Self::TYPE_ROW => {
                let table = cursor.take_str()?;
                let rowid = cursor.take_i64()?;
                let count = cursor.take_u16()? as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(match cursor.take_u8()? {
                        0 => Value::Null,
                        1 => Value::Integer(cursor.take_i64()?),
                        2 => {
                            let len = cursor.take_u32()? as usize;
                            Value::Text(cursor.take_string(len)?)
                        }
                        t => {
                            return Err(NativeError::corrupt(format!(
                                "unknown value tag {t} in row record"
                            )))
                        }
                    });
                }
                Ok(Record::Row {
                    table,
                    rowid,
                    values,
                })
            }
            Self::TYPE_DELETE => {
                let table = cursor.take_str()?;
                let rowid = cursor.take_i64()?;
                Ok(Record::Delete { table, rowid })
            }
            t => Err(NativeError::corrupt(format!("unknown record type {t}"))),
        }
    }
}

/// A raw frame lifted off disk before payload decryption/decoding.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Record type byte.
    pub type_byte: u8,
    /// Payload bytes, possibly encrypted.
    pub payload: Vec<u8>,
}

/// Frames a payload with the standard envelope.
#[must_use]
pub fn encode_frame(type_byte: u8, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_CRC_SIZE);
    data.extend_from_slice(&FRAME_MAGIC);
    data.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    data.push(type_byte);
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(payload);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    data
}

/// Encodes a file header.
#[must_use]
pub fn encode_file_header(magic: [u8; 4], flags: u8, kdf_salt: &[u8; 16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FILE_HEADER_SIZE);
    out.extend_from_slice(&magic);
    out.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    out.push(flags);
    out.push(0); // reserved
    out.extend_from_slice(kdf_salt);
    out
}

/// A parsed file header.
#[derive(Debug, Clone, Copy)]
pub struct FileHeader {
    /// Header flags.
    pub flags: u8,
    /// Key-derivation salt stored with the file.
    pub kdf_salt: [u8; 16],
}

/// Parses a file header, checking the expected magic.
///
/// # Errors
///
/// Returns a corruption error on a short or mismatched header.
pub fn decode_file_header(data: &[u8], magic: [u8; 4]) -> NativeResult<FileHeader> {
    if data.len() < FILE_HEADER_SIZE {
        return Err(NativeError::not_a_database());
    }
    if data[0..4] != magic {
        return Err(NativeError::not_a_database());
    }
    let version = u16::from_le_bytes([data[4], data[5]]);
    if version != FRAME_VERSION {
        return Err(NativeError::corrupt(format!(
            "unsupported file format version {version}"
        )));
    }
    let mut kdf_salt = [0u8; 16];
    kdf_salt.copy_from_slice(&data[8..24]);
    Ok(FileHeader {
        flags: data[6],
        kdf_salt,
    })
}

/// Scans `data` for record frames starting at `offset`.
///
/// In strict mode the first damaged frame is an error. In lenient mode
/// (salvage) the scanner resynchronizes on the next magic occurrence and
/// keeps going; the number of skipped damaged regions is returned.
///
/// # Errors
///
/// In strict mode, returns a corruption error for the first frame that
/// fails its checksum or envelope checks.
pub fn scan_frames(data: &[u8], offset: usize, lenient: bool) -> NativeResult<(Vec<RawFrame>, u32)> {
    let mut frames = Vec::new();
    let mut skipped = 0u32;
    let mut pos = offset;

    while pos < data.len() {
        match try_frame_at(data, pos) {
            FrameScan::Frame { frame, next } => {
                frames.push(frame);
                pos = next;
            }
            FrameScan::Truncated => {
                // An incomplete tail frame ends a strict scan quietly; in
                // lenient mode it may be a damaged length field, so keep
                // resynchronizing until the data truly runs out.
                if !lenient {
                    break;
                }
                match find_magic(data, pos + 1) {
                    Some(next) => {
                        skipped += 1;
                        pos = next;
                    }
                    None => break,
                }
            }
            FrameScan::Damaged(reason) => {
                if !lenient {
                    return Err(NativeError::corrupt(reason));
                }
                skipped += 1;
                // Resync on the next magic occurrence.
                match find_magic(data, pos + 1) {
                    Some(next) => pos = next,
                    None => break,
                }
            }
        }
    }
    Ok((frames, skipped))
}

enum FrameScan {
    Frame { frame: RawFrame, next: usize },
    Truncated,
    Damaged(String),
}

fn try_frame_at(data: &[u8], pos: usize) -> FrameScan {
    if pos + FRAME_HEADER_SIZE > data.len() {
        return FrameScan::Truncated;
    }
    if data[pos..pos + 4] != FRAME_MAGIC {
        return FrameScan::Damaged(format!("bad frame magic at offset {pos}"));
    }
    let version = u16::from_le_bytes([data[pos + 4], data[pos + 5]]);
    if version != FRAME_VERSION {
        return FrameScan::Damaged(format!("bad frame version at offset {pos}"));
    }
    let type_byte = data[pos + 6];
    let len = u32::from_le_bytes([data[pos + 7], data[pos + 8], data[pos + 9], data[pos + 10]])
        as usize;
    let total = FRAME_HEADER_SIZE + len + FRAME_CRC_SIZE;
    if pos + total > data.len() {
        return FrameScan::Truncated;
    }
    let body_end = pos + FRAME_HEADER_SIZE + len;
    let stored = u32::from_le_bytes([
        data[body_end],
        data[body_end + 1],
        data[body_end + 2],
        data[body_end + 3],
    ]);
    let computed = compute_crc32(&data[pos..body_end]);
    if stored != computed {
        return FrameScan::Damaged(format!("frame checksum mismatch at offset {pos}"));
    }
    FrameScan::Frame {
        frame: RawFrame {
            type_byte,
            payload: data[pos + FRAME_HEADER_SIZE..body_end].to_vec(),
        },
        next: pos + total,
    }
}

fn find_magic(data: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while pos + 4 <= data.len() {
        if data[pos..pos + 4] == FRAME_MAGIC {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

/// Computes a CRC32 checksum (IEEE polynomial).
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u16(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> NativeResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(NativeError::corrupt("record payload truncated"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> NativeResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> NativeResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> NativeResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_i64(&mut self) -> NativeResult<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn take_str(&mut self) -> NativeResult<String> {
        let len = self.take_u16()? as usize;
        self.take_string(len)
    }

    fn take_string(&mut self, len: usize) -> NativeResult<String> {
        let b = self.take(len)?;
        String::from_utf8(b.to_vec())
            .map_err(|_| NativeError::corrupt("record payload is not valid UTF-8"))
    }
}
