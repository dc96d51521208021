use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use crate::{data::log_record::LogRecordPos, errors::Result};

use super::{IndexIterator, Indexer, SnapshotIterator};

/// Concurrent skip list index, needs no external lock.
pub struct SkipList {
  skl: SkipMap<Vec<u8>, LogRecordPos>,
}

impl SkipList {
  pub fn new() -> Self {
    Self {
      skl: SkipMap::new(),
    }
  }
}

impl Default for SkipList {
  fn default() -> Self {
    Self::new()
  }
}

impl Indexer for SkipList {
  fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>> {
    let old = self.skl.get(&key).map(|entry| *entry.value());
    self.skl.insert(key, pos);
    Ok(old)
  }

  fn get(&self, key: Vec<u8>) -> Option<LogRecordPos> {
    self.skl.get(&key).map(|entry| *entry.value())
  }

  fn delete(&self, key: Vec<u8>) -> Result<Option<LogRecordPos>> {
    Ok(self.skl.remove(&key).map(|entry| *entry.value()))
  }

  fn size(&self) -> usize {
    self.skl.len()
  }

  fn list_keys(&self) -> Result<Vec<Bytes>> {
    let mut keys = Vec::with_capacity(self.skl.len());
    for entry in self.skl.iter() {
      keys.push(Bytes::copy_from_slice(entry.key()));
    }
    Ok(keys)
  }

  fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
    let mut items = Vec::with_capacity(self.skl.len());
    for entry in self.skl.iter() {
      items.push((entry.key().clone(), *entry.value()));
    }
    Box::new(SnapshotIterator::new(items, reverse))
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, thread};

  use super::*;
  use crate::index::tests::{check_indexer_contract, pos};

  #[test]
  fn test_skiplist_contract() {
    let skl = SkipList::new();
    check_indexer_contract(&skl);
  }

  #[test]
  fn test_skiplist_concurrent_put() {
    let skl = Arc::new(SkipList::new());
    let handles: Vec<_> = (0..4u32)
      .map(|t| {
        let skl = skl.clone();
        thread::spawn(move || {
          for i in 0..250u64 {
            let key = format!("t{}-k{:03}", t, i).into_bytes();
            skl.put(key, pos(t, i)).unwrap();
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(skl.size(), 1000);
    let keys = skl.list_keys().unwrap();
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(skl.get(b"t3-k249".to_vec()), Some(pos(3, 249)));
  }
}
