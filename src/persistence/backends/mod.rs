// Copyright © 2024 Pathway

use std::fmt::Debug;
use std::io::Error as IoError;

use glob::PatternError;

pub use file::FilesystemKVStorage;
pub use memory::MemoryKVStorage;

pub mod file;
pub mod memory;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("path is not UTF-8 encoded")]
    PathIsNotUtf8,

    #[error("key not found: {0}")]
    NoSuchKey(String),
}

/// Flat key-value store that snapshots and cached results are kept in.
/// Keys are `/`-separated relative paths.
pub trait PersistenceBackend: Send + Debug {
    fn list_keys(&self) -> Result<Vec<String>, Error>;

    fn get_value(&self, key: &str) -> Result<Vec<u8>, Error>;

    /// Stores `value` under `key`. Once this returns, `get_value` sees
    /// the whole value.
    fn put_value(&mut self, key: &str, value: Vec<u8>) -> Result<(), Error>;
}
