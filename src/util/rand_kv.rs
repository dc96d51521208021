use bytes::Bytes;
use rand::{distr::Alphanumeric, Rng};

/// Deterministic key for index `i`, keys sort in index order.
pub fn get_test_key(i: usize) -> Bytes {
  Bytes::from(format!("caskdb-key-{:09}", i))
}

pub fn get_test_value(i: usize) -> Bytes {
  Bytes::from(format!(
    "caskdb-value-value-value-value-value-value-value-value-value-{:09}",
    i
  ))
}

/// Random alphanumeric value of `len` bytes.
pub fn random_value(len: usize) -> Bytes {
  let value: Vec<u8> = rand::rng().sample_iter(&Alphanumeric).take(len).collect();
  Bytes::from(value)
}
