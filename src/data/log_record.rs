use bytes::{BufMut, BytesMut};
use derive_more::Display;
use prost::encoding::{decode_varint, encode_varint};

use crate::errors::{Errors, Result};

/// crc(4) + type(1) + key size(max 5) + value size(max 5)
pub const MAX_LOG_RECORD_HEADER_SIZE: usize = CRC_SIZE + 1 + MAX_VARINT32_LEN * 2;

const CRC_SIZE: usize = 4;
const MAX_VARINT32_LEN: usize = 5;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum LogRecordType {
  /// A live key/value pair.
  Normal = 0,

  /// A tombstone, the value is empty.
  Deleted = 1,

  /// Marks the end of a committed write batch.
  TxnFinished = 2,
}

impl TryFrom<u8> for LogRecordType {
  type Error = Errors;

  fn try_from(v: u8) -> Result<Self> {
    match v {
      0 => Ok(LogRecordType::Normal),
      1 => Ok(LogRecordType::Deleted),
      2 => Ok(LogRecordType::TxnFinished),
      _ => Err(Errors::UnknownLogRecordType(v)),
    }
  }
}

/// A record appended to a data file. Records are never modified once written,
/// an update appends a new record for the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
  pub(crate) key: Vec<u8>,
  pub(crate) value: Vec<u8>,
  pub(crate) rec_type: LogRecordType,
}

/// Location of a record on disk, stored by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[display("file_id={file_id}, offset={offset}, size={size}")]
pub struct LogRecordPos {
  pub(crate) file_id: u32,
  pub(crate) offset: u64,
  /// encoded size of the record, accounted as reclaimable once it goes stale
  pub(crate) size: u32,
}

/// A decoded record together with the number of bytes it occupies on disk.
#[derive(Debug)]
pub struct ReadLogRecord {
  pub(crate) record: LogRecord,
  pub(crate) size: usize,
}

/// A batch record seen during recovery whose batch has not been confirmed yet.
pub struct TransactionRecord {
  pub(crate) record: LogRecord,
  pub(crate) pos: LogRecordPos,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct LogRecordHeader {
  pub(crate) crc: u32,
  pub(crate) rec_type: u8,
  pub(crate) key_size: usize,
  pub(crate) value_size: usize,
}

impl LogRecord {
  /// Encodes the record as
  ///
  /// ```text
  /// +-------+------+-----------+-------------+-----+-------+
  /// | crc   | type | key size  | value size  | key | value |
  /// | 4B LE | 1B   | varint<=5 | varint<=5   |     |       |
  /// +-------+------+-----------+-------------+-----+-------+
  /// ```
  ///
  /// The crc covers every byte after itself.
  pub fn encode(&self) -> Vec<u8> {
    let mut header = BytesMut::with_capacity(MAX_LOG_RECORD_HEADER_SIZE - CRC_SIZE);
    header.put_u8(self.rec_type as u8);
    encode_varint_i64(self.key.len() as i64, &mut header);
    encode_varint_i64(self.value.len() as i64, &mut header);

    let crc = get_log_record_crc(&header, &self.key, &self.value);

    let mut buf = BytesMut::with_capacity(CRC_SIZE + header.len() + self.key.len() + self.value.len());
    buf.put_u32_le(crc);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&self.key);
    buf.extend_from_slice(&self.value);
    buf.to_vec()
  }

  pub fn encoded_length(&self) -> usize {
    CRC_SIZE
      + 1
      + varint_i64_len(self.key.len() as i64)
      + varint_i64_len(self.value.len() as i64)
      + self.key.len()
      + self.value.len()
  }
}

impl LogRecordPos {
  /// Encodes the position as three varints, used as the value of hint records.
  pub fn encode(&self) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_varint(self.file_id as u64, &mut buf);
    encode_varint(self.offset, &mut buf);
    encode_varint(self.size as u64, &mut buf);
    buf.to_vec()
  }
}

pub fn decode_log_record_pos(pos: &[u8]) -> Result<LogRecordPos> {
  let mut buf = pos;
  let file_id = decode_varint(&mut buf).map_err(|_| Errors::InvalidMetadataFile)?;
  let offset = decode_varint(&mut buf).map_err(|_| Errors::InvalidMetadataFile)?;
  let size = decode_varint(&mut buf).map_err(|_| Errors::InvalidMetadataFile)?;
  Ok(LogRecordPos {
    file_id: file_id as u32,
    offset,
    size: size as u32,
  })
}

/// Decodes the header at the start of `buf`, returning it with its encoded length.
///
/// `None` means the bytes cannot hold a complete header, which readers treat
/// as the end of the readable data.
pub(crate) fn decode_log_record_header(buf: &[u8]) -> Option<(LogRecordHeader, usize)> {
  if buf.len() <= CRC_SIZE {
    return None;
  }

  let crc = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
  let rec_type = buf[CRC_SIZE];

  let mut rest = &buf[CRC_SIZE + 1..];
  let before = rest.len();
  let key_size = decode_varint_i64(&mut rest)?;
  let value_size = decode_varint_i64(&mut rest)?;
  if key_size < 0 || value_size < 0 {
    return None;
  }
  let header_size = CRC_SIZE + 1 + (before - rest.len());

  Some((
    LogRecordHeader {
      crc,
      rec_type,
      key_size: key_size as usize,
      value_size: value_size as usize,
    },
    header_size,
  ))
}

/// `header` is the encoded header without its leading crc bytes.
pub(crate) fn get_log_record_crc(header: &[u8], key: &[u8], value: &[u8]) -> u32 {
  let mut hasher = crc32fast::Hasher::new();
  hasher.update(header);
  hasher.update(key);
  hasher.update(value);
  hasher.finalize()
}

// lengths are written as zigzag varints
fn encode_varint_i64(v: i64, buf: &mut BytesMut) {
  encode_varint(((v << 1) ^ (v >> 63)) as u64, buf);
}

fn decode_varint_i64(buf: &mut &[u8]) -> Option<i64> {
  let v = decode_varint(buf).ok()?;
  Some(((v >> 1) as i64) ^ -((v & 1) as i64))
}

fn varint_i64_len(v: i64) -> usize {
  prost::encoding::encoded_len_varint(((v << 1) ^ (v >> 63)) as u64)
}
