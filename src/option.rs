use lazy_static::lazy_static;
use std::path::PathBuf;

use derive_more::Display;

lazy_static! {
  pub static ref DEFAULT_DIR_PATH: PathBuf = std::env::temp_dir().join("caskdb");
}

#[derive(Debug, Clone)]
pub struct Options {
  /// Directory holding the data files of one database.
  pub dir_path: PathBuf,

  /// Size in bytes after which the active data file is sealed and a new one opened.
  pub data_file_size: u64,

  /// Sync the active data file after every write.
  pub sync_writes: bool,

  /// Sync once this many bytes were written since the last sync, 0 disables it.
  pub bytes_per_sync: usize,

  pub index_type: IndexType,

  /// Read data files through memory maps while rebuilding the index.
  pub mmap_at_startup: bool,

  /// Reclaimable / total bytes ratio from which a merge is recommended.
  pub file_merge_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum IndexType {
  /// Ordered in-memory tree.
  BTree,

  /// Adaptive radix tree.
  ART,

  /// Concurrent skip list.
  SkipList,

  /// B+ tree persisted on disk, survives restarts without a log replay.
  BPlusTree,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      dir_path: DEFAULT_DIR_PATH.clone(),
      data_file_size: 256 * 1024 * 1024, // 256MB
      sync_writes: false,
      bytes_per_sync: 0,
      index_type: IndexType::BTree,
      mmap_at_startup: true,
      file_merge_threshold: 0.5,
    }
  }
}

#[derive(Debug, Clone)]
pub struct IteratorOptions {
  pub prefix: Vec<u8>,
  pub reverse: bool,
}

#[allow(clippy::derivable_impls)]
impl Default for IteratorOptions {
  fn default() -> Self {
    Self {
      prefix: Default::default(),
      reverse: false,
    }
  }
}

#[derive(Debug, Clone)]
pub struct WriteBatchOptions {
  pub max_batch_num: usize,

  pub sync_writes: bool,
}

impl Default for WriteBatchOptions {
  fn default() -> Self {
    Self {
      max_batch_num: 10000,
      sync_writes: true,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IOManagerType {
  StandardFileIO,

  MemoryMap,
}
