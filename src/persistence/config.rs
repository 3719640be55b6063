// Copyright © 2024 Pathway

#![allow(clippy::module_name_repetitions)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::persistence::backends::{
    Error as BackendError, FilesystemKVStorage, MemoryKVStorage, PersistenceBackend,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    Batch,
    Record,
    Replay,
    SpeedrunReplay,
    RealtimeReplay,
    Persisting,
    UdfCaching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotAccess {
    Record,
    Replay,
    Full,
}

impl SnapshotAccess {
    pub fn is_replay_allowed(self) -> bool {
        matches!(self, Self::Replay | Self::Full)
    }

    pub fn is_recording_allowed(self) -> bool {
        matches!(self, Self::Record | Self::Full)
    }
}

/// How replayed rows are placed in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPacing {
    /// Everything at time 0.
    Collapsed,
    /// Original times, as fast as possible.
    Speedrun,
    /// Original times, sleeping for their differences.
    Realtime,
}

/// The configuration for the backend that stores persisted state.
#[derive(Debug, Clone)]
pub enum PersistentStorageConfig {
    Filesystem(PathBuf),
    Memory(MemoryKVStorage),
}

impl PersistentStorageConfig {
    pub fn create(&self) -> Result<Box<dyn PersistenceBackend>, BackendError> {
        match &self {
            Self::Filesystem(root_path) => Ok(Box::new(FilesystemKVStorage::new(root_path)?)),
            Self::Memory(storage) => Ok(Box::new(storage.clone())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub backend: PersistentStorageConfig,
    pub snapshot_access: SnapshotAccess,
    pub persistence_mode: PersistenceMode,
    pub continue_after_replay: bool,
}

impl PersistenceConfig {
    pub fn new(
        backend: PersistentStorageConfig,
        snapshot_access: SnapshotAccess,
        persistence_mode: PersistenceMode,
        continue_after_replay: bool,
    ) -> Self {
        Self {
            backend,
            snapshot_access,
            persistence_mode,
            continue_after_replay,
        }
    }

    /// Whether sources append their input to the snapshot log.
    pub fn records(&self) -> bool {
        let mode_records = matches!(
            self.persistence_mode,
            PersistenceMode::Record | PersistenceMode::Persisting | PersistenceMode::Batch
        );
        mode_records && self.snapshot_access.is_recording_allowed()
    }

    /// Whether sources start by re-reading the snapshot log.
    pub fn replays(&self) -> bool {
        let mode_replays = matches!(
            self.persistence_mode,
            PersistenceMode::Replay
                | PersistenceMode::SpeedrunReplay
                | PersistenceMode::RealtimeReplay
                | PersistenceMode::Persisting
                | PersistenceMode::Batch
        );
        mode_replays && self.snapshot_access.is_replay_allowed()
    }

    pub fn caches_udf_results(&self) -> bool {
        matches!(
            self.persistence_mode,
            PersistenceMode::Persisting | PersistenceMode::UdfCaching
        )
    }

    pub fn replay_pacing(&self) -> ReplayPacing {
        match self.persistence_mode {
            PersistenceMode::SpeedrunReplay => ReplayPacing::Speedrun,
            PersistenceMode::RealtimeReplay => ReplayPacing::Realtime,
            _ => ReplayPacing::Collapsed,
        }
    }

    pub fn create_backend(&self) -> Result<SharedBackend, BackendError> {
        Ok(Arc::new(Mutex::new(self.backend.create()?)))
    }
}

pub type SharedBackend = Arc<Mutex<Box<dyn PersistenceBackend>>>;
