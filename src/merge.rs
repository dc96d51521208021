use std::{
  fs, mem,
  path::{Path, PathBuf},
  sync::atomic::Ordering,
};

use log::{error, info};

use crate::{
  batch::{log_record_key_with_seq, parse_log_record_key, NON_TXN_SEQ_NO},
  data::{
    data_file::{
      get_data_file_name, DataFile, DATA_FILE_NAME_SUFFIX, HINT_FILE_NAME,
      MERGE_FINISHED_FILE_NAME, SEQ_NO_FILE_NAME,
    },
    log_record::{decode_log_record_pos, LogRecord, LogRecordType},
  },
  db::{Engine, FILE_LOCK_NAME},
  errors::{Errors, Result},
  option::{IOManagerType, IndexType, Options},
  util,
};

const MERGE_DIR_SUFFIX: &str = "merge";
const MERGE_FIN_KEY: &[u8] = "merge.finished".as_bytes();

impl Engine {
  /// Rewrites the live records of every sealed data file into a sibling
  /// merge directory, together with a hint file of their new positions.
  ///
  /// Writers are only blocked while the active file is rotated. The merged
  /// files replace the originals the next time the database is opened.
  pub fn merge(&self) -> Result<()> {
    self.check_open()?;
    let _merging = self
      .merging_lock
      .try_lock()
      .ok_or(Errors::MergeInProgress)?;

    if self.is_engine_empty() {
      return Err(Errors::DatabaseEmpty);
    }

    let reclaim_size = self.reclaim_size.load(Ordering::SeqCst) as u64;
    let total_size = util::file::dir_disk_size(&self.options.dir_path)?;
    let available_space = util::file::available_disk_space(&self.options.dir_path)?;
    if total_size.saturating_sub(reclaim_size) >= available_space {
      return Err(Errors::MergeNoEnoughSpace);
    }

    let merge_files = self.rotate_merge_files()?;
    let non_merge_file_id = match merge_files.last() {
      Some(data_file) => data_file.get_file_id() + 1,
      None => return Err(Errors::DatabaseEmpty),
    };

    let merge_path = get_merge_path(&self.options.dir_path)?;
    if merge_path.is_dir() {
      fs::remove_dir_all(&merge_path).map_err(|e| {
        error!("failed to remove stale merge dir: {}", e);
        Errors::FailedToCreateDatabaseDir
      })?;
    }
    fs::create_dir_all(&merge_path).map_err(|e| {
      error!("failed to create merge dir: {}", e);
      Errors::FailedToCreateDatabaseDir
    })?;
    info!(
      "merging {} data files below {} into {:?}",
      merge_files.len(),
      non_merge_file_id,
      merge_path
    );

    let merge_db = Engine::open(Options {
      dir_path: merge_path.clone(),
      data_file_size: self.options.data_file_size,
      sync_writes: false,
      bytes_per_sync: 0,
      index_type: IndexType::BTree,
      mmap_at_startup: false,
      file_merge_threshold: self.options.file_merge_threshold,
    })?;
    let hint_file = DataFile::new_hint_file(&merge_path)?;

    let mut rewritten = 0usize;
    for data_file in merge_files.iter() {
      let mut offset = 0;
      loop {
        let (mut log_record, size) = match data_file.read_log_record(offset) {
          Ok(result) => (result.record, result.size as u64),
          Err(Errors::ReadDataFileEOF) => break,
          Err(e) => return Err(e),
        };

        // only the record the index points at is still alive
        let (real_key, _) = parse_log_record_key(&log_record.key)?;
        if let Some(index_pos) = self.index.get(real_key.clone()) {
          if index_pos.file_id == data_file.get_file_id() && index_pos.offset == offset {
            log_record.key = log_record_key_with_seq(real_key.clone(), NON_TXN_SEQ_NO);
            let log_record_pos = merge_db.append_log_record(&log_record)?;
            hint_file.write_hint_record(real_key, log_record_pos)?;
            rewritten += 1;
          }
        }
        offset += size;
      }
    }

    hint_file.sync()?;
    merge_db.sync()?;
    merge_db.close()?;

    // the marker makes the merge visible to the next open
    let merge_fin_file = DataFile::new_merge_fin_file(&merge_path)?;
    let merge_fin_record = LogRecord {
      key: MERGE_FIN_KEY.to_vec(),
      value: non_merge_file_id.to_string().into_bytes(),
      rec_type: LogRecordType::Normal,
    };
    merge_fin_file.write(&merge_fin_record.encode())?;
    merge_fin_file.sync()?;

    info!("merge finished, {} live records rewritten", rewritten);
    Ok(())
  }

  fn is_engine_empty(&self) -> bool {
    let active_file = self.active_data_file.read();
    let old_files = self.old_data_files.read();
    active_file.get_write_off() == 0 && old_files.is_empty()
  }

  /// Seals the active file and returns fresh handles on every sealed file,
  /// in ascending id order.
  fn rotate_merge_files(&self) -> Result<Vec<DataFile>> {
    let mut merge_file_ids = Vec::new();
    {
      let mut active_file = self.active_data_file.write();
      self.check_open()?;
      let mut old_files = self.old_data_files.write();
      merge_file_ids.extend(old_files.keys().copied());

      active_file.sync()?;
      let active_file_id = active_file.get_file_id();
      let new_active_file = DataFile::new(
        &self.options.dir_path,
        active_file_id + 1,
        IOManagerType::StandardFileIO,
      )?;
      let sealed = mem::replace(&mut *active_file, new_active_file);
      old_files.insert(active_file_id, sealed);
      merge_file_ids.push(active_file_id);
    }

    merge_file_ids.sort_unstable();
    merge_file_ids
      .iter()
      .map(|fid| DataFile::new(&self.options.dir_path, *fid, IOManagerType::StandardFileIO))
      .collect()
  }

  /// Replays the hint file into the index. With `only_below` set, a hint is
  /// applied only to keys whose current position is in a merged file.
  pub(crate) fn load_index_from_hint_file(&self, only_below: Option<u32>) -> Result<()> {
    let hint_file_name = self.options.dir_path.join(HINT_FILE_NAME);
    if !hint_file_name.is_file() {
      return Ok(());
    }

    let hint_file = DataFile::new_hint_file(&self.options.dir_path)?;
    let mut offset = 0;
    loop {
      let (log_record, size) = match hint_file.read_log_record(offset) {
        Ok(result) => (result.record, result.size as u64),
        Err(Errors::ReadDataFileEOF) => break,
        Err(e) => return Err(e),
      };

      let log_record_pos = decode_log_record_pos(&log_record.value)?;
      let apply = match only_below {
        None => true,
        Some(non_merge_file_id) => self
          .index
          .get(log_record.key.clone())
          .is_some_and(|current| current.file_id < non_merge_file_id),
      };
      if apply {
        self.index.put(log_record.key, log_record_pos)?;
      }

      offset += size;
    }

    Ok(())
  }
}

/// The merge directory of `/a/b` is `/a/b-merge`.
fn get_merge_path<P>(dir_path: P) -> Result<PathBuf>
where
  P: AsRef<Path>,
{
  let dir_path = dir_path.as_ref();
  let (Some(file_name), Some(parent)) = (
    dir_path.file_name().and_then(|name| name.to_str()),
    dir_path.parent(),
  ) else {
    error!("no merge dir for database dir {:?}", dir_path);
    return Err(Errors::FailedToReadDatabaseDir);
  };
  Ok(parent.join(format!("{}-{}", file_name, MERGE_DIR_SUFFIX)))
}

/// Reads the first file id not covered by the merge recorded in `dir_path`.
pub(crate) fn get_non_merge_file_id<P>(dir_path: P) -> Result<u32>
where
  P: AsRef<Path>,
{
  let merge_fin_file = DataFile::new_merge_fin_file(&dir_path)?;
  let merge_fin_record = merge_fin_file.read_log_record(0)?;
  String::from_utf8(merge_fin_record.record.value)
    .map_err(|_| Errors::InvalidMetadataFile)?
    .parse::<u32>()
    .map_err(|_| Errors::InvalidMetadataFile)
}

/// Moves the result of a finished merge into `dir_path`, replacing the data
/// files it covers. An unfinished merge directory is discarded.
///
/// Returns whether merged files were moved in.
pub(crate) fn load_merge_files<P>(dir_path: P) -> Result<bool>
where
  P: AsRef<Path>,
{
  let merge_path = get_merge_path(&dir_path)?;
  if !merge_path.is_dir() {
    return Ok(false);
  }

  let dir = fs::read_dir(&merge_path).map_err(|e| {
    error!("failed to read merge dir: {}", e);
    Errors::FailedToReadDatabaseDir
  })?;

  let mut merge_file_names = Vec::new();
  let mut merge_finished = false;
  for entry in dir.flatten() {
    let file_os_str = entry.file_name();
    let Some(file_name) = file_os_str.to_str() else {
      continue;
    };

    if file_name == MERGE_FINISHED_FILE_NAME {
      merge_finished = true;
    }
    if file_name == SEQ_NO_FILE_NAME || file_name == FILE_LOCK_NAME {
      continue;
    }
    let is_empty = entry.metadata().map(|meta| meta.len() == 0).unwrap_or(true);
    if file_name.ends_with(DATA_FILE_NAME_SUFFIX) && is_empty {
      continue;
    }

    merge_file_names.push(entry.file_name());
  }

  let remove_merge_dir = |merge_path: &Path| {
    fs::remove_dir_all(merge_path).map_err(|e| {
      error!("failed to remove merge dir: {}", e);
      Errors::FailedToReadDatabaseDir
    })
  };

  // a marker that never fully reached the disk does not count
  let non_merge_file_id = if merge_finished {
    match get_non_merge_file_id(&merge_path) {
      Ok(fid) => Some(fid),
      Err(Errors::ReadDataFileEOF) | Err(Errors::InvalidLogRecordCrc) => None,
      Err(e) => return Err(e),
    }
  } else {
    None
  };
  let Some(non_merge_file_id) = non_merge_file_id else {
    info!("discarding unfinished merge in {:?}", merge_path);
    remove_merge_dir(&merge_path)?;
    return Ok(false);
  };

  for fid in 0..non_merge_file_id {
    let file = get_data_file_name(&dir_path, fid);
    if file.is_file() {
      fs::remove_file(&file).map_err(|e| {
        error!("failed to remove merged data file {:?}: {}", file, e);
        Errors::FailedToReadDatabaseDir
      })?;
    }
  }

  for file_name in merge_file_names {
    let src_path = merge_path.join(&file_name);
    let dst_path = dir_path.as_ref().join(&file_name);
    fs::rename(&src_path, &dst_path).map_err(|e| {
      error!("failed to move {:?} out of the merge dir: {}", src_path, e);
      Errors::FailedToReadDatabaseDir
    })?;
  }

  remove_merge_dir(&merge_path)?;
  info!(
    "moved merged data files below {} into {:?}",
    non_merge_file_id,
    dir_path.as_ref()
  );
  Ok(true)
}
