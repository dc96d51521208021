use std::path::Path;

use log::error;

use crate::errors::{Errors, Result};

/// Size in bytes of everything stored under `dir_path`.
pub fn dir_disk_size<P>(dir_path: P) -> Result<u64>
where
  P: AsRef<Path>,
{
  fs_extra::dir::get_size(dir_path).map_err(|e| {
    error!("failed to get database dir size: {}", e);
    Errors::FailedToReadDatabaseDir
  })
}

/// Free space of the filesystem holding `dir_path`.
pub fn available_disk_space<P>(dir_path: P) -> Result<u64>
where
  P: AsRef<Path>,
{
  fs2::available_space(dir_path).map_err(|e| {
    error!("failed to get available disk space: {}", e);
    Errors::FailedToReadDatabaseDir
  })
}
