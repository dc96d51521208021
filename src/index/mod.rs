pub mod art;
pub mod bptree;
pub mod btree;
pub mod skiplist;

use std::path::Path;

use bytes::Bytes;

use crate::{data::log_record::LogRecordPos, errors::Result, option::IndexType};

/// Maps a user key to the position of its latest record.
pub trait Indexer: Sync + Send {
  /// Inserts or replaces the position of `key`, returning the replaced one.
  fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Result<Option<LogRecordPos>>;

  /// Retrieves a key's position from the index.
  fn get(&self, key: Vec<u8>) -> Option<LogRecordPos>;

  /// Deletes a key's position from the index, `None` if the key was absent.
  fn delete(&self, key: Vec<u8>) -> Result<Option<LogRecordPos>>;

  /// Number of keys in the index.
  fn size(&self) -> usize;

  /// All keys in ascending order.
  fn list_keys(&self) -> Result<Vec<Bytes>>;

  /// Creates a cursor over a point-in-time copy of the index.
  fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator>;

  /// Releases backing resources, a no-op for the in-memory indexes.
  fn close(&self) -> Result<()> {
    Ok(())
  }
}

/// Creates a new indexer based on the specified index type and directory path.
pub fn new_indexer<P>(index_type: IndexType, dir_path: P) -> Result<Box<dyn Indexer>>
where
  P: AsRef<Path>,
{
  match index_type {
    IndexType::BTree => Ok(Box::new(btree::BTree::new())),
    IndexType::ART => Ok(Box::new(art::AdaptiveRadixTree::new())),
    IndexType::SkipList => Ok(Box::new(skiplist::SkipList::new())),
    IndexType::BPlusTree => Ok(Box::new(bptree::BPlusTree::new(dir_path)?)),
  }
}

/// A cursor over the keys of an index, in ascending or descending order.
pub trait IndexIterator: Sync + Send {
  /// Goes back to the first key.
  fn rewind(&mut self);

  /// Moves to the first key >= `key` (<= `key` when reversed).
  fn seek(&mut self, key: Vec<u8>);

  /// Advances one key.
  fn next(&mut self);

  fn valid(&self) -> bool;

  /// The key and position under the cursor, `None` once exhausted.
  fn current(&self) -> Option<(&Vec<u8>, &LogRecordPos)>;
}

/// Iterator over a sorted snapshot of index entries.
pub struct SnapshotIterator {
  items: Vec<(Vec<u8>, LogRecordPos)>,
  curr_index: usize,
  reverse: bool,
}

impl SnapshotIterator {
  /// `items` must be sorted in ascending key order.
  pub fn new(mut items: Vec<(Vec<u8>, LogRecordPos)>, reverse: bool) -> Self {
    if reverse {
      items.reverse();
    }
    Self {
      items,
      curr_index: 0,
      reverse,
    }
  }
}

impl IndexIterator for SnapshotIterator {
  fn rewind(&mut self) {
    self.curr_index = 0;
  }

  fn seek(&mut self, key: Vec<u8>) {
    self.curr_index = match self.items.binary_search_by(|(x, _)| {
      if self.reverse {
        x.cmp(&key).reverse()
      } else {
        x.cmp(&key)
      }
    }) {
      Ok(equal_val) => equal_val,
      Err(insert_val) => insert_val,
    };
  }

  fn next(&mut self) {
    if self.curr_index < self.items.len() {
      self.curr_index += 1;
    }
  }

  fn valid(&self) -> bool {
    self.curr_index < self.items.len()
  }

  fn current(&self) -> Option<(&Vec<u8>, &LogRecordPos)> {
    self.items.get(self.curr_index).map(|(k, p)| (k, p))
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) fn pos(file_id: u32, offset: u64) -> LogRecordPos {
    LogRecordPos {
      file_id,
      offset,
      size: 10,
    }
  }

  /// Runs the shared index contract against one implementation.
  pub(crate) fn check_indexer_contract(index: &dyn Indexer) {
    // put
    assert_eq!(index.put("0".as_bytes().to_vec(), pos(1, 10)), Ok(None));
    assert_eq!(index.put("aa".as_bytes().to_vec(), pos(1, 20)), Ok(None));
    assert_eq!(
      index.put("aa".as_bytes().to_vec(), pos(11, 22)),
      Ok(Some(pos(1, 20)))
    );
    assert_eq!(index.put("ab".as_bytes().to_vec(), pos(2, 30)), Ok(None));
    assert_eq!(index.put("b".as_bytes().to_vec(), pos(3, 40)), Ok(None));
    assert_eq!(index.size(), 4);

    // get
    assert_eq!(index.get("0".as_bytes().to_vec()), Some(pos(1, 10)));
    assert_eq!(index.get("aa".as_bytes().to_vec()), Some(pos(11, 22)));
    assert_eq!(index.get("a".as_bytes().to_vec()), None);
    assert_eq!(index.get("not exist".as_bytes().to_vec()), None);

    // delete
    assert_eq!(index.delete("not exist".as_bytes().to_vec()), Ok(None));
    assert_eq!(
      index.delete("0".as_bytes().to_vec()),
      Ok(Some(pos(1, 10)))
    );
    assert_eq!(index.get("0".as_bytes().to_vec()), None);
    assert_eq!(index.size(), 3);

    // list keys
    let keys = index.list_keys().unwrap();
    assert_eq!(
      keys,
      vec![Bytes::from("aa"), Bytes::from("ab"), Bytes::from("b")]
    );

    // ascending iterator with seek
    let mut iter = index.iterator(false);
    let mut seen = Vec::new();
    while let Some((key, _)) = iter.current() {
      seen.push(key.clone());
      iter.next();
    }
    assert_eq!(seen, vec![b"aa".to_vec(), b"ab".to_vec(), b"b".to_vec()]);
    assert!(!iter.valid());

    iter.rewind();
    assert_eq!(iter.current().map(|(k, _)| k.clone()), Some(b"aa".to_vec()));
    iter.seek(b"aaa".to_vec());
    assert_eq!(iter.current().map(|(k, _)| k.clone()), Some(b"ab".to_vec()));
    assert_eq!(iter.current().map(|(_, p)| *p), Some(pos(2, 30)));
    iter.seek(b"zz".to_vec());
    assert!(!iter.valid());

    // descending iterator with seek
    let mut rev = index.iterator(true);
    assert_eq!(rev.current().map(|(k, _)| k.clone()), Some(b"b".to_vec()));
    rev.seek(b"aaz".to_vec());
    assert_eq!(rev.current().map(|(k, _)| k.clone()), Some(b"aa".to_vec()));
    rev.next();
    assert!(!rev.valid());

    // the iterator is a snapshot
    let mut snapshot = index.iterator(false);
    index.put(b"c".to_vec(), pos(4, 50)).unwrap();
    let mut count = 0;
    while snapshot.valid() {
      count += 1;
      snapshot.next();
    }
    assert_eq!(count, 3);
    assert!(index.close().is_ok());
  }

  #[test]
  fn test_snapshot_iterator_seek() {
    let items = vec![
      (b"a".to_vec(), pos(0, 0)),
      (b"c".to_vec(), pos(0, 1)),
      (b"e".to_vec(), pos(0, 2)),
    ];

    let mut iter = SnapshotIterator::new(items.clone(), false);
    iter.seek(b"c".to_vec());
    assert_eq!(iter.current().map(|(k, _)| k.clone()), Some(b"c".to_vec()));
    iter.seek(b"b".to_vec());
    assert_eq!(iter.current().map(|(k, _)| k.clone()), Some(b"c".to_vec()));

    let mut rev = SnapshotIterator::new(items, true);
    rev.seek(b"d".to_vec());
    assert_eq!(rev.current().map(|(k, _)| k.clone()), Some(b"c".to_vec()));
    rev.seek(b"0".to_vec());
    assert!(!rev.valid());
    rev.rewind();
    assert_eq!(rev.current().map(|(k, _)| k.clone()), Some(b"e".to_vec()));
  }
}
