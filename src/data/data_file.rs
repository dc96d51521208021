use std::path::{Path, PathBuf};

use bytes::BytesMut;
use parking_lot::RwLock;

use crate::{
  errors::{Errors, Result},
  fio::{new_io_manager, IOManager},
  option::IOManagerType,
};

use super::log_record::{
  decode_log_record_header, get_log_record_crc, LogRecord, LogRecordPos, LogRecordType,
  ReadLogRecord, MAX_LOG_RECORD_HEADER_SIZE,
};

pub const DATA_FILE_NAME_SUFFIX: &str = ".data";
pub const HINT_FILE_NAME: &str = "hint-index";
pub const MERGE_FINISHED_FILE_NAME: &str = "merge-finished";
pub const SEQ_NO_FILE_NAME: &str = "seq-no";

/// An append-only file of log records. Only the active data file of an
/// engine is written to, every other one is immutable.
pub struct DataFile {
  file_id: u32,
  write_off: RwLock<u64>,
  io_manager: Box<dyn IOManager>,
}

impl DataFile {
  /// Opens (or creates) the data file `file_id` inside `dir_path`.
  ///
  /// The write offset starts at 0, callers reopening an existing file are
  /// responsible for moving it to the real end of the data.
  pub fn new<P>(dir_path: P, file_id: u32, io_type: IOManagerType) -> Result<DataFile>
  where
    P: AsRef<Path>,
  {
    let file_name = get_data_file_name(&dir_path, file_id);
    let io_manager = new_io_manager(file_name, io_type)?;
    Ok(DataFile {
      file_id,
      write_off: RwLock::new(0),
      io_manager,
    })
  }

  pub fn new_hint_file<P>(dir_path: P) -> Result<DataFile>
  where
    P: AsRef<Path>,
  {
    Self::new_named(dir_path.as_ref().join(HINT_FILE_NAME))
  }

  pub fn new_merge_fin_file<P>(dir_path: P) -> Result<DataFile>
  where
    P: AsRef<Path>,
  {
    Self::new_named(dir_path.as_ref().join(MERGE_FINISHED_FILE_NAME))
  }

  pub fn new_seq_no_file<P>(dir_path: P) -> Result<DataFile>
  where
    P: AsRef<Path>,
  {
    Self::new_named(dir_path.as_ref().join(SEQ_NO_FILE_NAME))
  }

  fn new_named(file_name: PathBuf) -> Result<DataFile> {
    let io_manager = new_io_manager(file_name, IOManagerType::StandardFileIO)?;
    Ok(DataFile {
      file_id: 0,
      write_off: RwLock::new(0),
      io_manager,
    })
  }

  pub fn file_size(&self) -> Result<u64> {
    self.io_manager.size()
  }

  pub fn get_write_off(&self) -> u64 {
    *self.write_off.read()
  }

  pub fn set_write_off(&self, offset: u64) {
    *self.write_off.write() = offset;
  }

  pub fn get_file_id(&self) -> u32 {
    self.file_id
  }

  /// Reads the record starting at `offset`.
  ///
  /// Returns `ReadDataFileEOF` once no complete record is left, and
  /// `InvalidLogRecordCrc` when a complete record fails its checksum.
  pub fn read_log_record(&self, offset: u64) -> Result<ReadLogRecord> {
    let file_size = self.io_manager.size()?;
    if offset >= file_size {
      return Err(Errors::ReadDataFileEOF);
    }

    // the header has a variable length, read the largest possible one
    let header_bytes = (MAX_LOG_RECORD_HEADER_SIZE as u64).min(file_size - offset) as usize;
    let mut header_buf = BytesMut::zeroed(header_bytes);
    self.io_manager.read(&mut header_buf, offset)?;

    let (header, header_size) = match decode_log_record_header(&header_buf) {
      Some(res) => res,
      None => return Err(Errors::ReadDataFileEOF),
    };

    // a zero filled tail is not data
    if header.crc == 0 && header.key_size == 0 && header.value_size == 0 {
      return Err(Errors::ReadDataFileEOF);
    }

    let kv_size = header.key_size + header.value_size;
    if offset + (header_size + kv_size) as u64 > file_size {
      return Err(Errors::ReadDataFileEOF);
    }

    let mut kv_buf = BytesMut::zeroed(kv_size);
    if kv_size > 0 {
      self
        .io_manager
        .read(&mut kv_buf, offset + header_size as u64)?;
    }
    let (key, value) = kv_buf.split_at(header.key_size);

    let crc = get_log_record_crc(&header_buf[4..header_size], key, value);
    if crc != header.crc {
      return Err(Errors::InvalidLogRecordCrc);
    }

    Ok(ReadLogRecord {
      record: LogRecord {
        key: key.to_vec(),
        value: value.to_vec(),
        rec_type: LogRecordType::try_from(header.rec_type)?,
      },
      size: header_size + kv_size,
    })
  }

  pub fn write(&self, buf: &[u8]) -> Result<usize> {
    let n_bytes = self.io_manager.write(buf)?;
    let mut write_off = self.write_off.write();
    *write_off += n_bytes as u64;
    Ok(n_bytes)
  }

  /// Appends a hint record: the real key and its encoded position.
  pub fn write_hint_record(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<()> {
    let hint_record = LogRecord {
      key,
      value: pos.encode(),
      rec_type: LogRecordType::Normal,
    };
    let enc_record = hint_record.encode();
    self.write(&enc_record)?;
    Ok(())
  }

  pub fn sync(&self) -> Result<()> {
    self.io_manager.sync()
  }

  /// Drops everything after `size` and moves the write offset there.
  pub fn truncate(&self, size: u64) -> Result<()> {
    self.io_manager.truncate(size)?;
    self.set_write_off(size);
    Ok(())
  }

  pub fn set_io_manager<P>(&mut self, dir_path: P, io_type: IOManagerType) -> Result<()>
  where
    P: AsRef<Path>,
  {
    self.io_manager = new_io_manager(get_data_file_name(dir_path, self.file_id), io_type)?;
    Ok(())
  }
}

pub fn get_data_file_name<P>(dir_path: P, file_id: u32) -> PathBuf
where
  P: AsRef<Path>,
{
  let name = format!("{:09}", file_id) + DATA_FILE_NAME_SUFFIX;
  dir_path.as_ref().join(name)
}
