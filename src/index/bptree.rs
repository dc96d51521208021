use std::path::Path;

use bytes::Bytes;
use jammdb::DB;
use log::error;

use crate::{
  data::log_record::{decode_log_record_pos, LogRecordPos},
  errors::{Errors, Result},
};

use super::{IndexIterator, Indexer, SnapshotIterator};

pub const BPTREE_INDEX_FILE_NAME: &str = "bptree-index";
const BPTREE_BUCKET_NAME: &str = "caskdb-index";

/// Disk backed B+ tree index on top of jammdb.
///
/// Every mutation runs in its own read-write transaction, jammdb serializes
/// writers itself so no lock is held here.
pub struct BPlusTree {
  tree: DB,
}

impl BPlusTree {
  pub fn new<P>(dir_path: P) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    let tree = DB::open(dir_path.as_ref().join(BPTREE_INDEX_FILE_NAME)).map_err(|e| {
      error!("failed to open bptree index: {}", e);
      Errors::FailedToOpenIndex
    })?;

    let tx = tree.tx(true).map_err(|e| {
      error!("failed to begin bptree tx: {}", e);
      Errors::FailedToOpenIndex
    })?;
    tx.get_or_create_bucket(BPTREE_BUCKET_NAME).map_err(|e| {
      error!("failed to create bptree bucket: {}", e);
      Errors::FailedToOpenIndex
    })?;
    tx.commit().map_err(|e| {
      error!("failed to commit bptree tx: {}", e);
      Errors::FailedToOpenIndex
    })?;

    Ok(Self { tree })
  }

  /// Collects every entry in ascending key order.
  fn entries(&self) -> Vec<(Vec<u8>, LogRecordPos)> {
    let mut items = Vec::new();
    let tx = match self.tree.tx(false) {
      Ok(tx) => tx,
      Err(e) => {
        error!("failed to begin bptree tx: {}", e);
        return items;
      }
    };
    let bucket = match tx.get_bucket(BPTREE_BUCKET_NAME) {
      Ok(bucket) => bucket,
      Err(e) => {
        error!("failed to get bptree bucket: {}", e);
        return items;
      }
    };
    for data in bucket.cursor() {
      if !data.is_kv() {
        continue;
      }
      let kv = data.kv();
      match decode_log_record_pos(kv.value()) {
        Ok(pos) => items.push((kv.key().to_vec(), pos)),
        Err(e) => error!("skip undecodable bptree entry: {}", e),
      }
    }
    items
  }
}

impl Indexer for BPlusTree {
  fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>> {
    let update_failed = |e: jammdb::Error| {
      error!("failed to put value in bptree: {}", e);
      Errors::IndexUpdateFailed
    };

    let tx = self.tree.tx(true).map_err(update_failed)?;
    let bucket = tx.get_bucket(BPTREE_BUCKET_NAME).map_err(update_failed)?;
    let old = match bucket.get_kv(&key) {
      Some(kv) => Some(decode_log_record_pos(kv.value())?),
      None => None,
    };
    bucket.put(key, pos.encode()).map_err(update_failed)?;
    tx.commit().map_err(update_failed)?;
    Ok(old)
  }

  fn get(&self, key: Vec<u8>) -> Option<LogRecordPos> {
    let tx = match self.tree.tx(false) {
      Ok(tx) => tx,
      Err(e) => {
        error!("failed to begin bptree tx: {}", e);
        return None;
      }
    };
    let bucket = tx.get_bucket(BPTREE_BUCKET_NAME).ok()?;
    let kv = bucket.get_kv(&key)?;
    let decoded = decode_log_record_pos(kv.value());
    match decoded {
      Ok(pos) => Some(pos),
      Err(e) => {
        error!("undecodable bptree entry: {}", e);
        None
      }
    }
  }

  fn delete(&self, key: Vec<u8>) -> Result<Option<LogRecordPos>> {
    let update_failed = |e: jammdb::Error| {
      error!("failed to delete value in bptree: {}", e);
      Errors::IndexUpdateFailed
    };

    let tx = self.tree.tx(true).map_err(update_failed)?;
    let bucket = tx.get_bucket(BPTREE_BUCKET_NAME).map_err(update_failed)?;
    let old = match bucket.get_kv(&key) {
      Some(kv) => Some(decode_log_record_pos(kv.value())?),
      None => return Ok(None),
    };
    bucket.delete(&key).map_err(update_failed)?;
    tx.commit().map_err(update_failed)?;
    Ok(old)
  }

  fn size(&self) -> usize {
    let tx = match self.tree.tx(false) {
      Ok(tx) => tx,
      Err(e) => {
        error!("failed to begin bptree tx: {}", e);
        return 0;
      }
    };
    let bucket = match tx.get_bucket(BPTREE_BUCKET_NAME) {
      Ok(bucket) => bucket,
      Err(e) => {
        error!("failed to get bptree bucket: {}", e);
        return 0;
      }
    };
    let count = bucket.cursor().filter(|data| data.is_kv()).count();
    count
  }

  fn list_keys(&self) -> Result<Vec<Bytes>> {
    Ok(
      self
        .entries()
        .into_iter()
        .map(|(key, _)| Bytes::from(key))
        .collect(),
    )
  }

  fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
    Box::new(SnapshotIterator::new(self.entries(), reverse))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::index::tests::{check_indexer_contract, pos};

  #[test]
  fn test_bptree_contract() {
    let dir = tempfile::tempdir().unwrap();
    let bpt = BPlusTree::new(dir.path()).unwrap();
    check_indexer_contract(&bpt);
  }

  #[test]
  fn test_bptree_is_persistent() {
    let dir = tempfile::tempdir().unwrap();
    {
      let bpt = BPlusTree::new(dir.path()).unwrap();
      bpt.put(b"persist-a".to_vec(), pos(1, 100)).unwrap();
      bpt.put(b"persist-b".to_vec(), pos(2, 200)).unwrap();
      bpt.delete(b"persist-a".to_vec()).unwrap();
    }
    assert!(dir.path().join(BPTREE_INDEX_FILE_NAME).is_file());

    let bpt = BPlusTree::new(dir.path()).unwrap();
    assert_eq!(bpt.get(b"persist-a".to_vec()), None);
    assert_eq!(bpt.get(b"persist-b".to_vec()), Some(pos(2, 200)));
    assert_eq!(bpt.size(), 1);
  }

  #[test]
  fn test_bptree_size_ignores_entry_contents() {
    let dir = tempfile::tempdir().unwrap();
    let bpt = BPlusTree::new(dir.path()).unwrap();
    for i in 0..50u32 {
      bpt.put(format!("size-{:02}", i).into_bytes(), pos(i, 0)).unwrap();
    }
    bpt.delete(b"size-07".to_vec()).unwrap();
    bpt.put(b"size-08".to_vec(), pos(8, 64)).unwrap();

    // a value that is not a position still counts as a key
    {
      let tx = bpt.tree.tx(true).unwrap();
      let bucket = tx.get_bucket(BPTREE_BUCKET_NAME).unwrap();
      bucket.put(b"size-raw".to_vec(), vec![0xffu8; 3]).unwrap();
      tx.commit().unwrap();
    }
    assert_eq!(bpt.size(), 50);
  }
}
