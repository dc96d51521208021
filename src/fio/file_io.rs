use std::{
  fs::{File, OpenOptions},
  io::{ErrorKind, Write},
  os::unix::fs::FileExt,
  path::Path,
};

use log::error;
use parking_lot::RwLock;

use crate::errors::{Errors, Result};

use super::IOManager;

/// Standard file I/O: positional reads, appending writes.
pub struct FileIO {
  fd: RwLock<File>,
}

impl FileIO {
  pub fn new<P>(file_name: P) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    match OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(file_name)
    {
      Ok(file) => Ok(FileIO {
        fd: RwLock::new(file),
      }),
      Err(e) => {
        error!("failed to open data file error: {}", e);
        Err(Errors::FailedToOpenDataFile)
      }
    }
  }
}

impl IOManager for FileIO {
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
    let read_guard = self.fd.read();
    match read_guard.read_exact_at(buf, offset) {
      Ok(()) => Ok(buf.len()),
      Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Errors::ReadDataFileEOF),
      Err(e) => {
        error!("read from data file error: {}", e);
        Err(Errors::FailedToReadFromDataFile)
      }
    }
  }

  fn write(&self, buf: &[u8]) -> Result<usize> {
    let mut write_guard = self.fd.write();
    match write_guard.write_all(buf) {
      Ok(()) => Ok(buf.len()),
      Err(e) => {
        error!("write data file error: {}", e);
        Err(Errors::FailedToWriteToDataFile)
      }
    }
  }

  fn sync(&self) -> Result<()> {
    let read_guard = self.fd.read();
    if let Err(e) = read_guard.sync_all() {
      error!("failed to sync data file: {}", e);
      return Err(Errors::FailedToSyncDataFile);
    }
    Ok(())
  }

  fn size(&self) -> Result<u64> {
    let read_guard = self.fd.read();
    match read_guard.metadata() {
      Ok(metadata) => Ok(metadata.len()),
      Err(e) => {
        error!("failed to read data file metadata: {}", e);
        Err(Errors::FailedToReadFromDataFile)
      }
    }
  }

  fn truncate(&self, size: u64) -> Result<()> {
    let write_guard = self.fd.write();
    if let Err(e) = write_guard.set_len(size) {
      error!("failed to truncate data file: {}", e);
      return Err(Errors::FailedToWriteToDataFile);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use super::*;

  #[test]
  fn test_file_io_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.data");
    let fio = FileIO::new(&path).unwrap();

    assert_eq!(fio.write("key-a".as_bytes()), Ok(5));
    assert_eq!(fio.write("key-bc".as_bytes()), Ok(6));
    assert_eq!(fio.size(), Ok(11));
  }

  #[test]
  fn test_file_io_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b.data");
    let fio = FileIO::new(&path).unwrap();
    fio.write("key-a".as_bytes()).unwrap();
    fio.write("key-b".as_bytes()).unwrap();

    let mut buf = [0u8; 5];
    assert_eq!(fio.read(&mut buf, 0), Ok(5));
    assert_eq!(&buf, b"key-a");
    assert_eq!(fio.read(&mut buf, 5), Ok(5));
    assert_eq!(&buf, b"key-b");

    // reading past the end is reported as eof, not as an io failure
    assert_eq!(fio.read(&mut buf, 8), Err(Errors::ReadDataFileEOF));
  }

  #[test]
  fn test_file_io_sync_and_truncate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("c.data");
    let fio = FileIO::new(&path).unwrap();
    fio.write(b"hello world").unwrap();
    assert!(fio.sync().is_ok());

    fio.truncate(5).unwrap();
    assert_eq!(fio.size(), Ok(5));

    // appends continue at the new end of file
    fio.write(b"!").unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"hello!");
  }
}
