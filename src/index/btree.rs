use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::{data::log_record::LogRecordPos, errors::Result};

use super::{IndexIterator, Indexer, SnapshotIterator};

/// Ordered in-memory index over the standard library BTreeMap.
pub struct BTree {
  tree: RwLock<BTreeMap<Vec<u8>, LogRecordPos>>,
}

impl BTree {
  pub fn new() -> Self {
    Self {
      tree: RwLock::new(BTreeMap::new()),
    }
  }
}

impl Default for BTree {
  fn default() -> Self {
    Self::new()
  }
}

impl Indexer for BTree {
  fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>> {
    let mut write_guard = self.tree.write();
    Ok(write_guard.insert(key, pos))
  }

  fn get(&self, key: Vec<u8>) -> Option<LogRecordPos> {
    let read_guard = self.tree.read();
    read_guard.get(&key).copied()
  }

  fn delete(&self, key: Vec<u8>) -> Result<Option<LogRecordPos>> {
    let mut write_guard = self.tree.write();
    Ok(write_guard.remove(&key))
  }

  fn size(&self) -> usize {
    self.tree.read().len()
  }

  fn list_keys(&self) -> Result<Vec<Bytes>> {
    let read_guard = self.tree.read();
    let mut keys = Vec::with_capacity(read_guard.len());
    for k in read_guard.keys() {
      keys.push(Bytes::copy_from_slice(k));
    }
    Ok(keys)
  }

  fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
    let read_guard = self.tree.read();
    let mut items = Vec::with_capacity(read_guard.len());
    for (key, value) in read_guard.iter() {
      items.push((key.clone(), *value));
    }
    Box::new(SnapshotIterator::new(items, reverse))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::index::tests::{check_indexer_contract, pos};

  #[test]
  fn test_btree_contract() {
    let bt = BTree::new();
    check_indexer_contract(&bt);
  }

  #[test]
  fn test_btree_put_returns_old_pos() {
    let bt = BTree::new();
    assert_eq!(bt.put(b"key".to_vec(), pos(1, 0)), Ok(None));
    assert_eq!(bt.put(b"key".to_vec(), pos(2, 8)), Ok(Some(pos(1, 0))));
    assert_eq!(bt.get(b"key".to_vec()), Some(pos(2, 8)));
    assert_eq!(bt.delete(b"key".to_vec()), Ok(Some(pos(2, 8))));
    assert_eq!(bt.delete(b"key".to_vec()), Ok(None));
    assert_eq!(bt.size(), 0);
  }
}
