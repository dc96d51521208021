//! caskdb: an embedded key/value storage engine following the bitcask design.
//!
//! Every write is appended to a log of data files and an in-memory index maps
//! each key to the position of its latest record, so a read costs one index
//! lookup and one positional read.
//!
//! # Features
//!
//! * Checksummed records, torn tails are detected and dropped on open
//! * Atomic write batches
//! * Online merge that rewrites only live records
//! * B-tree, adaptive radix tree, skip list or on-disk B+ tree index
//! * Memory-mapped reads while rebuilding the index
//!
//! # Basic Usage
//!
//! ```
//! use bytes::Bytes;
//! use caskdb::{db::Engine, option::Options};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let opts = Options {
//!   dir_path: dir.path().join("caskdb"),
//!   ..Default::default()
//! };
//! let engine = Engine::open(opts).expect("failed to open caskdb engine");
//!
//! let key = Bytes::from("hello");
//! engine.put(key.clone(), Bytes::from("world")).expect("failed to put");
//! assert_eq!(engine.get(key.clone()).unwrap(), Bytes::from("world"));
//!
//! engine.delete(key).expect("failed to delete");
//! ```

mod data;

mod fio;
mod index;

pub mod batch;
pub mod db;
pub mod errors;
pub mod iterator;
pub mod merge;
pub mod option;
pub mod util;
