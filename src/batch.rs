use std::{collections::HashMap, sync::atomic::Ordering};

use bytes::{Bytes, BytesMut};
use log::error;
use parking_lot::Mutex;
use prost::encoding::{decode_varint, encode_varint};

use crate::{
  data::log_record::{LogRecord, LogRecordType},
  db::Engine,
  errors::{Errors, Result},
  option::{IndexType, WriteBatchOptions},
};

const TXN_FIN_KEY: &[u8] = "txn-fin".as_bytes();

/// Sequence number of records written outside of a write batch.
pub(crate) const NON_TXN_SEQ_NO: u64 = 0;

/// Writes staged in memory and applied atomically by `commit`.
///
/// On disk every record of a batch carries the batch sequence number in
/// front of its key and the batch ends with a finish marker. Recovery drops
/// the records of any batch whose marker never made it to disk.
pub struct WriteBatch<'a> {
  pending_writes: Mutex<HashMap<Vec<u8>, LogRecord>>,
  engine: &'a Engine,
  options: WriteBatchOptions,
}

impl Engine {
  pub fn new_write_batch(&self, options: WriteBatchOptions) -> Result<WriteBatch<'_>> {
    self.check_open()?;
    // a B+ tree index cannot tell which batches were committed without the
    // sequence number of a clean close
    if self.options.index_type == IndexType::BPlusTree && !self.seq_file_exists && !self.is_initial
    {
      return Err(Errors::UnableToUseWriteBatch);
    }

    Ok(WriteBatch {
      pending_writes: Mutex::new(HashMap::new()),
      engine: self,
      options,
    })
  }
}

impl WriteBatch<'_> {
  pub fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }

    let record = LogRecord {
      key: key.to_vec(),
      value: value.to_vec(),
      rec_type: LogRecordType::Normal,
    };
    let mut pending_writes = self.pending_writes.lock();
    pending_writes.insert(key.to_vec(), record);
    Ok(())
  }

  pub fn delete(&self, key: Bytes) -> Result<()> {
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }

    let mut pending_writes = self.pending_writes.lock();
    if self.engine.index.get(key.to_vec()).is_none() {
      pending_writes.remove(&key[..]);
      return Ok(());
    }

    let record = LogRecord {
      key: key.to_vec(),
      value: Default::default(),
      rec_type: LogRecordType::Deleted,
    };
    pending_writes.insert(key.to_vec(), record);
    Ok(())
  }

  /// Number of staged writes.
  pub fn len(&self) -> usize {
    self.pending_writes.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending_writes.lock().is_empty()
  }

  /// Writes the staged records followed by the finish marker, then updates
  /// the index. Other writers are blocked for the whole commit.
  pub fn commit(&self) -> Result<()> {
    self.engine.check_open()?;
    let mut pending_writes = self.pending_writes.lock();
    if pending_writes.is_empty() {
      return Ok(());
    }
    if pending_writes.len() > self.options.max_batch_num {
      return Err(Errors::ExceedMaxBatchNum);
    }

    let mut active_file = self.engine.active_data_file.write();
    self.engine.check_open()?;
    let seq_no = self.engine.seq_no.fetch_add(1, Ordering::SeqCst) + 1;

    let mut positions = Vec::with_capacity(pending_writes.len());
    for (key, record) in pending_writes.iter() {
      let log_record = LogRecord {
        key: log_record_key_with_seq(key.clone(), seq_no),
        value: record.value.clone(),
        rec_type: record.rec_type,
      };
      let pos = self
        .engine
        .append_log_record_with_guard(&mut active_file, &log_record)?;
      positions.push((key.clone(), record.rec_type, pos));
    }

    let finish_record = LogRecord {
      key: log_record_key_with_seq(TXN_FIN_KEY.to_vec(), seq_no),
      value: Default::default(),
      rec_type: LogRecordType::TxnFinished,
    };
    self
      .engine
      .append_log_record_with_guard(&mut active_file, &finish_record)?;

    if self.options.sync_writes {
      active_file.sync()?;
    }

    for (key, rec_type, pos) in positions {
      self.engine.update_index(key, rec_type, pos)?;
    }

    pending_writes.clear();
    Ok(())
  }
}

/// Prefixes `key` with `seq_no` as an unsigned varint.
pub(crate) fn log_record_key_with_seq(key: Vec<u8>, seq_no: u64) -> Vec<u8> {
  let mut enc_key = BytesMut::new();
  encode_varint(seq_no, &mut enc_key);
  enc_key.extend_from_slice(&key);
  enc_key.to_vec()
}

/// Splits a record key into the user key and its sequence number.
pub(crate) fn parse_log_record_key(key: &[u8]) -> Result<(Vec<u8>, u64)> {
  let mut buf = key;
  let seq_no = decode_varint(&mut buf).map_err(|e| {
    error!("failed to decode record key seq no: {}", e);
    Errors::DataDirectoryCorrupted
  })?;
  Ok((buf.to_vec(), seq_no))
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use super::*;
  use crate::{
    option::Options,
    util::rand_kv::{get_test_key, get_test_value},
  };

  fn open_engine(dir_path: PathBuf) -> Engine {
    let opts = Options {
      dir_path,
      data_file_size: 64 * 1024,
      ..Default::default()
    };
    Engine::open(opts).expect("failed to open engine")
  }

  #[test]
  fn test_log_record_key_with_seq() {
    let enc = log_record_key_with_seq(b"key".to_vec(), NON_TXN_SEQ_NO);
    assert_eq!(enc, vec![0, b'k', b'e', b'y']);
    assert_eq!(parse_log_record_key(&enc), Ok((b"key".to_vec(), 0)));

    let enc = log_record_key_with_seq(b"key".to_vec(), 300);
    assert_eq!(&enc[..2], &[0xac, 0x02]);
    assert_eq!(parse_log_record_key(&enc), Ok((b"key".to_vec(), 300)));

    assert_eq!(
      parse_log_record_key(&[0xff]),
      Err(Errors::DataDirectoryCorrupted)
    );
  }

  #[test]
  fn test_write_batch_commit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path().join("db"));

    let wb = engine
      .new_write_batch(WriteBatchOptions::default())
      .unwrap();
    wb.put(get_test_key(1), get_test_value(10)).unwrap();
    wb.put(get_test_key(2), get_test_value(20)).unwrap();
    assert_eq!(wb.put(Bytes::new(), get_test_value(0)), Err(Errors::KeyIsEmpty));
    assert_eq!(wb.len(), 2);

    // nothing is visible before commit
    assert_eq!(engine.get(get_test_key(1)), Err(Errors::KeyNotFound));
    assert_eq!(engine.get(get_test_key(2)), Err(Errors::KeyNotFound));

    wb.commit().unwrap();
    assert!(wb.is_empty());
    assert_eq!(engine.get(get_test_key(1)), Ok(get_test_value(10)));
    assert_eq!(engine.get(get_test_key(2)), Ok(get_test_value(20)));
    assert_eq!(engine.seq_no.load(Ordering::SeqCst), 1);

    // an empty commit does not use a sequence number
    wb.commit().unwrap();
    assert_eq!(engine.seq_no.load(Ordering::SeqCst), 1);

    let wb = engine
      .new_write_batch(WriteBatchOptions::default())
      .unwrap();
    wb.delete(get_test_key(1)).unwrap();
    wb.put(get_test_key(3), get_test_value(30)).unwrap();
    wb.commit().unwrap();
    assert_eq!(engine.get(get_test_key(1)), Err(Errors::KeyNotFound));
    assert_eq!(engine.get(get_test_key(3)), Ok(get_test_value(30)));
    assert_eq!(engine.seq_no.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_write_batch_last_write_wins() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path().join("db"));
    engine.put(get_test_key(5), get_test_value(5)).unwrap();

    let wb = engine
      .new_write_batch(WriteBatchOptions::default())
      .unwrap();
    wb.put(get_test_key(5), get_test_value(50)).unwrap();
    wb.delete(get_test_key(5)).unwrap();
    wb.put(get_test_key(6), get_test_value(6)).unwrap();
    // deleting a key the index never saw drops the staged put
    wb.delete(get_test_key(6)).unwrap();
    assert_eq!(wb.len(), 1);

    wb.commit().unwrap();
    assert_eq!(engine.get(get_test_key(5)), Err(Errors::KeyNotFound));
    assert_eq!(engine.get(get_test_key(6)), Err(Errors::KeyNotFound));
  }

  #[test]
  fn test_write_batch_exceed_max_num() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path().join("db"));

    let wb = engine
      .new_write_batch(WriteBatchOptions {
        max_batch_num: 3,
        sync_writes: false,
      })
      .unwrap();
    for i in 0..4 {
      wb.put(get_test_key(i), get_test_value(i)).unwrap();
    }
    assert_eq!(wb.commit(), Err(Errors::ExceedMaxBatchNum));
    assert_eq!(engine.list_keys().unwrap().len(), 0);
  }

  #[test]
  fn test_write_batch_seq_no_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let dir_path = dir.path().join("db");
    {
      let engine = open_engine(dir_path.clone());
      for i in 0..3 {
        let wb = engine
          .new_write_batch(WriteBatchOptions::default())
          .unwrap();
        wb.put(get_test_key(i), get_test_value(i)).unwrap();
        wb.commit().unwrap();
      }
      engine.close().unwrap();
    }

    let engine = open_engine(dir_path);
    assert_eq!(engine.seq_no.load(Ordering::SeqCst), 3);
    assert_eq!(engine.list_keys().unwrap().len(), 3);
    assert!(!dir.path().join("db").join("seq-no").exists());
  }

  #[test]
  fn test_write_batch_bptree_needs_seq_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let dir_path = dir.path().join("db");
    let opts = Options {
      dir_path: dir_path.clone(),
      index_type: IndexType::BPlusTree,
      ..Default::default()
    };

    {
      let engine = Engine::open(opts.clone()).unwrap();
      assert!(engine.is_initial);
      let wb = engine
        .new_write_batch(WriteBatchOptions::default())
        .unwrap();
      wb.put(get_test_key(1), get_test_value(1)).unwrap();
      wb.commit().unwrap();
      engine.close().unwrap();
    }

    {
      let engine = Engine::open(opts.clone()).unwrap();
      assert!(engine.seq_file_exists);
      assert!(engine
        .new_write_batch(WriteBatchOptions::default())
        .is_ok());
      assert_eq!(engine.get(get_test_key(1)), Ok(get_test_value(1)));
      engine.close().unwrap();
    }

    // an unclean shutdown leaves no seq no file behind
    std::fs::remove_file(dir_path.join("seq-no")).unwrap();
    let engine = Engine::open(opts).unwrap();
    assert_eq!(
      engine
        .new_write_batch(WriteBatchOptions::default())
        .err(),
      Some(Errors::UnableToUseWriteBatch)
    );
  }
}
