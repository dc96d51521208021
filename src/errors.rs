use std::result;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Errors {
  #[error("failed to read from data file")]
  FailedToReadFromDataFile,

  #[error("failed to write to data file")]
  FailedToWriteToDataFile,

  #[error("failed to sync data file")]
  FailedToSyncDataFile,

  #[error("failed to open data file")]
  FailedToOpenDataFile,

  #[error("the key is empty")]
  KeyIsEmpty,

  #[error("memory index failed to update")]
  IndexUpdateFailed,

  #[error("key is not found in database")]
  KeyNotFound,

  #[error("data file is not found in database")]
  DataFileNotFound,

  #[error("database dir path can not be empty")]
  DirPathIsEmpty,

  #[error("database data file size must be greater than 0")]
  DataFileSizeTooSmall,

  #[error("invalid merge ratio, must be between 0 and 1")]
  InvalidMergeRatio,

  #[error("failed to create the database directory")]
  FailedToCreateDatabaseDir,

  #[error("failed to read the database directory")]
  FailedToReadDatabaseDir,

  #[error("the database directory maybe corrupted")]
  DataDirectoryCorrupted,

  #[error("read data file eof")]
  ReadDataFileEOF,

  #[error("invalid crc value, log record maybe corrupted")]
  InvalidLogRecordCrc,

  #[error("unknown log record type: {0}")]
  UnknownLogRecordType(u8),

  #[error("exceed the max batch num")]
  ExceedMaxBatchNum,

  #[error("merge is in progress, try again later")]
  MergeInProgress,

  #[error("cannot use write batch, seq no file not exists")]
  UnableToUseWriteBatch,

  #[error("the database directory is used by another process")]
  DatabaseIsUsing,

  #[error("the database is empty, nothing to merge")]
  DatabaseEmpty,

  #[error("no enough disk space for merge")]
  MergeNoEnoughSpace,

  #[error("failed to open the index")]
  FailedToOpenIndex,

  #[error("memory mapped data files are read only")]
  MmapWriteUnsupported,

  #[error("the engine has been closed")]
  EngineClosed,

  #[error("invalid metadata file, database maybe corrupted")]
  InvalidMetadataFile,
}

pub type Result<T> = result::Result<T, Errors>;
