use std::{fs::OpenOptions, path::Path};

use log::error;
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::errors::{Errors, Result};

use super::IOManager;

/// Read-only memory map over a data file, used to speed up index loading.
pub struct MMapIO {
  map: Mutex<Mmap>,
}

impl MMapIO {
  pub fn new<P>(file_name: P) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    let file = match OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(file_name)
    {
      Ok(file) => file,
      Err(e) => {
        error!("failed to open data file error: {}", e);
        return Err(Errors::FailedToOpenDataFile);
      }
    };

    // the file is only ever appended to through a separate handle after the
    // engine switched back to standard io, so the mapping is never mutated
    match unsafe { Mmap::map(&file) } {
      Ok(map) => Ok(MMapIO {
        map: Mutex::new(map),
      }),
      Err(e) => {
        error!("failed to map data file error: {}", e);
        Err(Errors::FailedToOpenDataFile)
      }
    }
  }
}

impl IOManager for MMapIO {
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
    let map_arr = self.map.lock();
    let end = offset + buf.len() as u64;
    if end > map_arr.len() as u64 {
      return Err(Errors::ReadDataFileEOF);
    }

    let val = &map_arr[offset as usize..end as usize];
    buf.copy_from_slice(val);
    Ok(val.len())
  }

  fn write(&self, _buf: &[u8]) -> Result<usize> {
    Err(Errors::MmapWriteUnsupported)
  }

  fn sync(&self) -> Result<()> {
    Err(Errors::MmapWriteUnsupported)
  }

  fn size(&self) -> Result<u64> {
    let map_arr = self.map.lock();
    Ok(map_arr.len() as u64)
  }

  fn truncate(&self, _size: u64) -> Result<()> {
    Err(Errors::MmapWriteUnsupported)
  }
}
