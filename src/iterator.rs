use bytes::Bytes;
use parking_lot::RwLock;

use crate::{
  db::Engine,
  errors::{Errors, Result},
  index::IndexIterator,
  option::IteratorOptions,
};

/// Cursor over the live keys of an engine. Keys come from a snapshot of the
/// index taken at creation, values are read from the data files on demand.
pub struct Iterator<'a> {
  index_iter: RwLock<Box<dyn IndexIterator>>,
  engine: &'a Engine,
  options: IteratorOptions,
}

impl Engine {
  pub fn iter(&self, options: IteratorOptions) -> Result<Iterator<'_>> {
    self.check_open()?;
    let index_iter = self.index.iterator(options.reverse);
    let iter = Iterator {
      index_iter: RwLock::new(index_iter),
      engine: self,
      options,
    };
    iter.skip_to_next();
    Ok(iter)
  }
}

impl Iterator<'_> {
  /// Goes back to the first matching key.
  pub fn rewind(&self) {
    self.index_iter.write().rewind();
    self.skip_to_next();
  }

  /// Moves to the first matching key >= `key` (<= `key` when reversed).
  pub fn seek(&self, key: Vec<u8>) {
    self.index_iter.write().seek(key);
    self.skip_to_next();
  }

  #[allow(clippy::should_implement_trait)]
  pub fn next(&self) {
    self.index_iter.write().next();
    self.skip_to_next();
  }

  pub fn valid(&self) -> bool {
    self.index_iter.read().valid()
  }

  pub fn key(&self) -> Option<Bytes> {
    let index_iter = self.index_iter.read();
    index_iter.current().map(|(key, _)| Bytes::copy_from_slice(key))
  }

  pub fn value(&self) -> Result<Bytes> {
    let pos = match self.index_iter.read().current() {
      Some((_, pos)) => *pos,
      None => return Err(Errors::KeyNotFound),
    };
    self.engine.get_value_by_position(&pos)
  }

  // steps over keys outside of the prefix
  fn skip_to_next(&self) {
    if self.options.prefix.is_empty() {
      return;
    }

    let mut index_iter = self.index_iter.write();
    while let Some((key, _)) = index_iter.current() {
      if key.starts_with(&self.options.prefix) {
        break;
      }
      index_iter.next();
    }
  }
}
