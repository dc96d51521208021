use std::{
  collections::HashMap,
  fs::{self, File, OpenOptions},
  mem,
  path::Path,
  sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use bytes::Bytes;
use derive_more::Display;
use fs2::FileExt;
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
  batch::{log_record_key_with_seq, parse_log_record_key, NON_TXN_SEQ_NO},
  data::{
    data_file::{
      DataFile, DATA_FILE_NAME_SUFFIX, MERGE_FINISHED_FILE_NAME, SEQ_NO_FILE_NAME,
    },
    log_record::{LogRecord, LogRecordPos, LogRecordType, TransactionRecord},
  },
  errors::{Errors, Result},
  index::{new_indexer, Indexer},
  merge::{get_non_merge_file_id, load_merge_files},
  option::{IOManagerType, IndexType, Options},
  util,
};

pub(crate) const FILE_LOCK_NAME: &str = "flock";
const SEQ_NO_KEY: &str = "seq.no";
const INITIAL_FILE_ID: u32 = 0;

/// A bitcask storage engine instance bound to one directory.
pub struct Engine {
  pub(crate) options: Options,
  /// only this file receives writes, its write lock serializes every writer
  pub(crate) active_data_file: RwLock<DataFile>,
  pub(crate) old_data_files: RwLock<HashMap<u32, DataFile>>,
  pub(crate) index: Box<dyn Indexer>,
  /// last sequence number handed to a write batch
  pub(crate) seq_no: AtomicU64,
  pub(crate) merging_lock: Mutex<()>,
  pub(crate) seq_file_exists: bool,
  pub(crate) is_initial: bool,
  lock_file: File,
  bytes_write: AtomicUsize,
  pub(crate) reclaim_size: AtomicUsize,
  closed: AtomicBool,
}

/// A point-in-time summary of the engine.
#[derive(Debug, Clone, PartialEq, Display)]
#[display(
  "keys={key_num}, data_files={data_file_num}, reclaimable={reclaim_size}, disk={disk_size}"
)]
pub struct Stat {
  pub key_num: usize,
  pub data_file_num: usize,
  /// bytes held by overwritten or deleted records
  pub reclaim_size: usize,
  pub disk_size: u64,
  /// reclaimable bytes reached `file_merge_threshold` of the disk size
  pub merge_recommended: bool,
}

impl Engine {
  /// Opens the database in `opts.dir_path`, creating it when missing.
  ///
  /// A finished merge is moved into place first, then the index is rebuilt
  /// from the hint file and the data files written after the merge.
  pub fn open(opts: Options) -> Result<Self> {
    check_options(&opts)?;

    let options = opts;
    let dir_path = options.dir_path.clone();

    let mut is_initial = false;
    if !dir_path.is_dir() {
      is_initial = true;
      if let Err(e) = fs::create_dir_all(&dir_path) {
        error!("create database directory err: {}", e);
        return Err(Errors::FailedToCreateDatabaseDir);
      }
    }

    let entries = fs::read_dir(&dir_path).map_err(|e| {
      error!("failed to read database dir: {}", e);
      Errors::FailedToReadDatabaseDir
    })?;
    if entries
      .flatten()
      .all(|entry| entry.file_name() == FILE_LOCK_NAME)
    {
      is_initial = true;
    }

    let lock_file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(dir_path.join(FILE_LOCK_NAME))
      .map_err(|e| {
        error!("failed to open lock file: {}", e);
        Errors::FailedToOpenDataFile
      })?;
    if lock_file.try_lock_exclusive().is_err() {
      return Err(Errors::DatabaseIsUsing);
    }

    let relocated = load_merge_files(&dir_path)?;

    let mut data_files = load_data_files(&dir_path, options.mmap_at_startup)?;
    let file_ids: Vec<u32> = data_files.iter().map(|f| f.get_file_id()).collect();

    // the highest file id is the active one
    let active_file = match data_files.pop() {
      Some(file) => file,
      None => DataFile::new(&dir_path, INITIAL_FILE_ID, IOManagerType::StandardFileIO)?,
    };
    let old_files: HashMap<u32, DataFile> = data_files
      .into_iter()
      .map(|file| (file.get_file_id(), file))
      .collect();

    let index = new_indexer(options.index_type, &dir_path)?;
    let persisted_seq_no = load_seq_no(&dir_path)?;

    let engine = Self {
      options,
      active_data_file: RwLock::new(active_file),
      old_data_files: RwLock::new(old_files),
      index,
      seq_no: AtomicU64::new(persisted_seq_no.unwrap_or(NON_TXN_SEQ_NO)),
      merging_lock: Mutex::new(()),
      seq_file_exists: persisted_seq_no.is_some(),
      is_initial,
      lock_file,
      bytes_write: AtomicUsize::new(0),
      reclaim_size: AtomicUsize::new(0),
      closed: AtomicBool::new(false),
    };

    if let Err(e) = engine.recover(&file_ids, persisted_seq_no, relocated) {
      // nothing was written, dropping the engine must not persist anything
      engine.closed.store(true, Ordering::SeqCst);
      return Err(e);
    }

    Ok(engine)
  }

  fn recover(&self, file_ids: &[u32], persisted_seq_no: Option<u64>, relocated: bool) -> Result<()> {
    let mut current_seq_no = NON_TXN_SEQ_NO;
    if self.options.index_type != IndexType::BPlusTree {
      self.load_index_from_hint_file(None)?;
      current_seq_no = self.scan_data_files(file_ids, true)?;
    } else {
      if persisted_seq_no.is_some() {
        // clean shutdown, the log ends where the file ends
        let active_file = self.active_data_file.read();
        active_file.set_write_off(active_file.file_size()?);
      } else {
        current_seq_no = self.scan_data_files(file_ids, false)?;
      }
      if relocated {
        let non_merge_file_id = get_non_merge_file_id(&self.options.dir_path)?;
        self.load_index_from_hint_file(Some(non_merge_file_id))?;
      }
    }

    let seq_no = current_seq_no.max(persisted_seq_no.unwrap_or(NON_TXN_SEQ_NO));
    self.seq_no.store(seq_no, Ordering::SeqCst);

    if self.options.mmap_at_startup {
      self.reset_io_type()?;
    }

    {
      let active_file = self.active_data_file.write();
      let write_off = active_file.get_write_off();
      let file_size = active_file.file_size()?;
      if file_size > write_off {
        warn!(
          "truncating {} trailing bytes of data file {}",
          file_size - write_off,
          active_file.get_file_id()
        );
        active_file.truncate(write_off)?;
      }
    }

    let seq_no_path = self.options.dir_path.join(SEQ_NO_FILE_NAME);
    if seq_no_path.is_file() {
      fs::remove_file(seq_no_path).map_err(|e| {
        error!("failed to remove seq no file: {}", e);
        Errors::FailedToOpenDataFile
      })?;
    }
    Ok(())
  }

  /// Stores a key/value pair, replacing any previous value of `key`.
  pub fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
    self.check_open()?;
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }

    let log_record = LogRecord {
      key: log_record_key_with_seq(key.to_vec(), NON_TXN_SEQ_NO),
      value: value.to_vec(),
      rec_type: LogRecordType::Normal,
    };

    let mut active_file = self.active_data_file.write();
    self.check_open()?;
    let log_record_pos = self.append_log_record_with_guard(&mut active_file, &log_record)?;
    if let Some(old_pos) = self.index.put(key.to_vec(), log_record_pos)? {
      self
        .reclaim_size
        .fetch_add(old_pos.size as usize, Ordering::SeqCst);
    }
    Ok(())
  }

  /// Removes `key`, a missing key is not an error.
  pub fn delete(&self, key: Bytes) -> Result<()> {
    self.check_open()?;
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }

    let mut active_file = self.active_data_file.write();
    self.check_open()?;
    if self.index.get(key.to_vec()).is_none() {
      return Ok(());
    }

    let log_record = LogRecord {
      key: log_record_key_with_seq(key.to_vec(), NON_TXN_SEQ_NO),
      value: Default::default(),
      rec_type: LogRecordType::Deleted,
    };
    let pos = self.append_log_record_with_guard(&mut active_file, &log_record)?;
    self.update_index(key.to_vec(), LogRecordType::Deleted, pos)
  }

  pub fn get(&self, key: Bytes) -> Result<Bytes> {
    self.check_open()?;
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }

    let pos = self.index.get(key.to_vec()).ok_or(Errors::KeyNotFound)?;
    self.get_value_by_position(&pos)
  }

  pub(crate) fn get_value_by_position(&self, log_record_pos: &LogRecordPos) -> Result<Bytes> {
    let active_file = self.active_data_file.read();
    let old_files = self.old_data_files.read();
    read_value(&active_file, &old_files, log_record_pos)
  }

  /// Calls `f` with every key/value pair in ascending key order until it
  /// returns `false`. Writers are blocked meanwhile, `f` must not call back
  /// into the engine.
  pub fn fold<F>(&self, mut f: F) -> Result<()>
  where
    F: FnMut(Bytes, Bytes) -> bool,
  {
    self.check_open()?;
    let active_file = self.active_data_file.read();
    let old_files = self.old_data_files.read();

    let mut index_iter = self.index.iterator(false);
    while let Some((key, pos)) = index_iter.current() {
      let value = read_value(&active_file, &old_files, pos)?;
      if !f(Bytes::copy_from_slice(key), value) {
        break;
      }
      index_iter.next();
    }
    Ok(())
  }

  pub fn list_keys(&self) -> Result<Vec<Bytes>> {
    self.check_open()?;
    self.index.list_keys()
  }

  /// Flushes the active data file to disk.
  pub fn sync(&self) -> Result<()> {
    self.check_open()?;
    let active_file = self.active_data_file.read();
    active_file.sync()
  }

  /// Persists the sequence number, syncs and releases the directory lock.
  /// Every later call on the engine fails with `EngineClosed`.
  pub fn close(&self) -> Result<()> {
    // writers check `closed` under this lock, nothing is appended after the
    // sequence number below is persisted
    let active_file = self.active_data_file.write();
    if self.closed.swap(true, Ordering::SeqCst) {
      return Ok(());
    }

    self.index.close()?;

    let seq_no_path = self.options.dir_path.join(SEQ_NO_FILE_NAME);
    if seq_no_path.is_file() {
      fs::remove_file(&seq_no_path).map_err(|e| {
        error!("failed to remove seq no file: {}", e);
        Errors::FailedToWriteToDataFile
      })?;
    }
    let seq_no_file = DataFile::new_seq_no_file(&self.options.dir_path)?;
    let seq_no = self.seq_no.load(Ordering::SeqCst);
    let record = LogRecord {
      key: SEQ_NO_KEY.as_bytes().to_vec(),
      value: seq_no.to_string().into_bytes(),
      rec_type: LogRecordType::Normal,
    };
    seq_no_file.write(&record.encode())?;
    seq_no_file.sync()?;
    active_file.sync()?;

    FileExt::unlock(&self.lock_file).map_err(|e| {
      error!("failed to unlock database dir: {}", e);
      Errors::FailedToReadDatabaseDir
    })?;
    Ok(())
  }

  pub fn stat(&self) -> Result<Stat> {
    self.check_open()?;
    let data_file_num = self.old_data_files.read().len() + 1;
    let reclaim_size = self.reclaim_size.load(Ordering::SeqCst);
    let disk_size = util::file::dir_disk_size(&self.options.dir_path)?;
    let merge_recommended =
      disk_size > 0 && reclaim_size as f32 / disk_size as f32 >= self.options.file_merge_threshold;

    Ok(Stat {
      key_num: self.index.size(),
      data_file_num,
      reclaim_size,
      disk_size,
      merge_recommended,
    })
  }

  pub(crate) fn check_open(&self) -> Result<()> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(Errors::EngineClosed);
    }
    Ok(())
  }

  pub(crate) fn append_log_record(&self, log_record: &LogRecord) -> Result<LogRecordPos> {
    let mut active_file = self.active_data_file.write();
    self.check_open()?;
    self.append_log_record_with_guard(&mut active_file, log_record)
  }

  /// Appends to the active data file, sealing it first when the record
  /// would not fit. The caller holds the active file write lock.
  pub(crate) fn append_log_record_with_guard(
    &self,
    active_file: &mut DataFile,
    log_record: &LogRecord,
  ) -> Result<LogRecordPos> {
    let enc_record = log_record.encode();
    let record_len = enc_record.len() as u64;

    let write_off = active_file.get_write_off();
    if write_off > 0 && write_off + record_len > self.options.data_file_size {
      active_file.sync()?;
      let current_fid = active_file.get_file_id();
      let new_file = DataFile::new(
        &self.options.dir_path,
        current_fid + 1,
        IOManagerType::StandardFileIO,
      )?;
      let sealed = mem::replace(active_file, new_file);
      self.old_data_files.write().insert(current_fid, sealed);
      debug!("data file {} sealed, now writing to {}", current_fid, current_fid + 1);
    }

    let write_off = active_file.get_write_off();
    active_file.write(&enc_record)?;

    let previous = self
      .bytes_write
      .fetch_add(enc_record.len(), Ordering::SeqCst);
    let need_sync = self.options.sync_writes
      || (self.options.bytes_per_sync > 0
        && previous + enc_record.len() >= self.options.bytes_per_sync);
    if need_sync {
      active_file.sync()?;
      self.bytes_write.store(0, Ordering::SeqCst);
    }

    Ok(LogRecordPos {
      file_id: active_file.get_file_id(),
      offset: write_off,
      size: enc_record.len() as u32,
    })
  }

  /// Applies one record to the index and accounts the bytes it makes stale.
  pub(crate) fn update_index(
    &self,
    key: Vec<u8>,
    rec_type: LogRecordType,
    pos: LogRecordPos,
  ) -> Result<()> {
    match rec_type {
      LogRecordType::Normal => {
        if let Some(old_pos) = self.index.put(key, pos)? {
          self
            .reclaim_size
            .fetch_add(old_pos.size as usize, Ordering::SeqCst);
        }
      }
      LogRecordType::Deleted => {
        let mut size = pos.size;
        if let Some(old_pos) = self.index.delete(key)? {
          size += old_pos.size;
        }
        self.reclaim_size.fetch_add(size as usize, Ordering::SeqCst);
      }
      LogRecordType::TxnFinished => {}
    }
    Ok(())
  }

  /// Reads the data files not covered by the hint file, oldest first, and
  /// moves the active write offset to the end of the valid records.
  ///
  /// Batch records only reach the index once their finish marker is seen.
  /// Returns the highest sequence number found.
  fn scan_data_files(&self, file_ids: &[u32], rebuild_index: bool) -> Result<u64> {
    let mut current_seq_no = NON_TXN_SEQ_NO;
    if file_ids.is_empty() {
      return Ok(current_seq_no);
    }

    let non_merge_file_id = if self
      .options
      .dir_path
      .join(MERGE_FINISHED_FILE_NAME)
      .is_file()
    {
      get_non_merge_file_id(&self.options.dir_path)?
    } else {
      0
    };

    let mut transaction_records: HashMap<u64, Vec<TransactionRecord>> = HashMap::new();
    let active_file = self.active_data_file.read();
    let old_files = self.old_data_files.read();

    for file_id in file_ids {
      if *file_id < non_merge_file_id {
        continue;
      }

      let is_active = *file_id == active_file.get_file_id();
      let data_file = if is_active {
        &*active_file
      } else {
        old_files.get(file_id).ok_or(Errors::DataFileNotFound)?
      };

      let mut offset = 0;
      loop {
        let (log_record, size) = match data_file.read_log_record(offset) {
          Ok(result) => (result.record, result.size as u64),
          Err(Errors::ReadDataFileEOF) => break,
          Err(Errors::InvalidLogRecordCrc) if is_active => {
            warn!(
              "corrupted record at offset {} of active data file {}, dropping the tail",
              offset, file_id
            );
            break;
          }
          Err(e) => return Err(e),
        };

        let pos = LogRecordPos {
          file_id: *file_id,
          offset,
          size: size as u32,
        };
        let (real_key, seq_no) = parse_log_record_key(&log_record.key)?;
        current_seq_no = current_seq_no.max(seq_no);

        if rebuild_index {
          if seq_no == NON_TXN_SEQ_NO {
            self.update_index(real_key, log_record.rec_type, pos)?;
          } else if log_record.rec_type == LogRecordType::TxnFinished {
            if let Some(records) = transaction_records.remove(&seq_no) {
              for txn_record in records {
                self.update_index(txn_record.record.key, txn_record.record.rec_type, txn_record.pos)?;
              }
            }
          } else {
            transaction_records
              .entry(seq_no)
              .or_default()
              .push(TransactionRecord {
                record: LogRecord {
                  key: real_key,
                  ..log_record
                },
                pos,
              });
          }
        }

        offset += size;
      }

      if is_active {
        active_file.set_write_off(offset);
      }
    }

    if !transaction_records.is_empty() {
      warn!(
        "discarded {} write batches without a finish marker",
        transaction_records.len()
      );
    }
    Ok(current_seq_no)
  }

  fn reset_io_type(&self) -> Result<()> {
    let mut active_file = self.active_data_file.write();
    active_file.set_io_manager(&self.options.dir_path, IOManagerType::StandardFileIO)?;
    let mut old_files = self.old_data_files.write();
    for (_, file) in old_files.iter_mut() {
      file.set_io_manager(&self.options.dir_path, IOManagerType::StandardFileIO)?;
    }
    Ok(())
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      error!("error whilst closing engine: {}", e);
    }
  }
}

fn read_value(
  active_file: &DataFile,
  old_files: &HashMap<u32, DataFile>,
  log_record_pos: &LogRecordPos,
) -> Result<Bytes> {
  let log_record = if active_file.get_file_id() == log_record_pos.file_id {
    active_file.read_log_record(log_record_pos.offset)?.record
  } else {
    match old_files.get(&log_record_pos.file_id) {
      Some(data_file) => data_file.read_log_record(log_record_pos.offset)?.record,
      None => return Err(Errors::DataFileNotFound),
    }
  };

  if log_record.rec_type == LogRecordType::Deleted {
    return Err(Errors::KeyNotFound);
  }
  Ok(log_record.value.into())
}

fn check_options(opts: &Options) -> Result<()> {
  if opts.dir_path.as_os_str().is_empty() {
    return Err(Errors::DirPathIsEmpty);
  }
  if opts.data_file_size == 0 {
    return Err(Errors::DataFileSizeTooSmall);
  }
  if !(0.0..=1.0).contains(&opts.file_merge_threshold) {
    return Err(Errors::InvalidMergeRatio);
  }
  Ok(())
}

/// Opens every data file of the directory in ascending id order.
fn load_data_files<P>(dir_path: P, use_mmap: bool) -> Result<Vec<DataFile>>
where
  P: AsRef<Path>,
{
  let dir = fs::read_dir(&dir_path).map_err(|e| {
    error!("failed to read database dir: {}", e);
    Errors::FailedToReadDatabaseDir
  })?;

  let mut file_ids = Vec::new();
  for entry in dir.flatten() {
    let file_os_str = entry.file_name();
    let Some(file_name) = file_os_str.to_str() else {
      continue;
    };
    if let Some(file_id) = file_name.strip_suffix(DATA_FILE_NAME_SUFFIX) {
      match file_id.parse::<u32>() {
        Ok(fid) => file_ids.push(fid),
        Err(_) => return Err(Errors::DataDirectoryCorrupted),
      }
    }
  }
  file_ids.sort_unstable();

  let io_type = if use_mmap {
    IOManagerType::MemoryMap
  } else {
    IOManagerType::StandardFileIO
  };
  file_ids
    .iter()
    .map(|fid| DataFile::new(&dir_path, *fid, io_type))
    .collect()
}

/// Reads the sequence number saved by the last clean close.
fn load_seq_no<P>(dir_path: P) -> Result<Option<u64>>
where
  P: AsRef<Path>,
{
  if !dir_path.as_ref().join(SEQ_NO_FILE_NAME).is_file() {
    return Ok(None);
  }

  let seq_no_file = DataFile::new_seq_no_file(&dir_path)?;
  let record = match seq_no_file.read_log_record(0) {
    Ok(result) => result.record,
    Err(Errors::ReadDataFileEOF) | Err(Errors::InvalidLogRecordCrc) => {
      warn!("ignoring unreadable seq no file");
      return Ok(None);
    }
    Err(e) => return Err(e),
  };
  let seq_no = String::from_utf8(record.value)
    .map_err(|_| Errors::InvalidMetadataFile)?
    .parse::<u64>()
    .map_err(|_| Errors::InvalidMetadataFile)?;
  Ok(Some(seq_no))
}
