// Copyright © 2024 Pathway

use xxhash_rust::xxh3::Xxh3 as Hasher;

pub mod backends;
pub mod config;
pub mod tracker;
pub mod udf_cache;

pub use config::{PersistenceConfig, PersistenceMode, PersistentStorageConfig, SnapshotAccess};

pub type PersistentId = u128;
pub type ExternalPersistentId = String;

pub trait IntoPersistentId {
    fn into_persistent_id(self) -> PersistentId;
}

impl IntoPersistentId for ExternalPersistentId {
    fn into_persistent_id(self) -> PersistentId {
        self.as_str().into_persistent_id()
    }
}

impl IntoPersistentId for &str {
    fn into_persistent_id(self) -> PersistentId {
        let mut hasher = Hasher::default();
        hasher.update(self.as_bytes());
        hasher.digest128()
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[allow(clippy::module_name_repetitions)]
pub enum PersistenceError {
    #[error(transparent)]
    Backend(#[from] backends::Error),

    #[error("snapshot chunk {0:?} is corrupted: {1}")]
    CorruptedChunk(String, String),

    #[error("snapshot chunk {0:?} does not end with a time advancement")]
    MissingAdvanceTime(String),

    #[error("failed to serialize snapshot event: {0}")]
    Serialization(String),
}
