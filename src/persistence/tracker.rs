// Copyright © 2024 Pathway

use log::info;
use std::collections::HashSet;

use crate::connectors::snapshot::{read_snapshot, Snapshot, SnapshotWriter};
use crate::persistence::config::{PersistenceConfig, ReplayPacing, SharedBackend};
use crate::persistence::udf_cache::UdfCache;
use crate::persistence::{PersistenceError, PersistentId};

/// Persistence entry point of a single worker: hands out snapshot writers
/// and readers for the sources it owns.
pub struct WorkerPersistentStorage {
    config: PersistenceConfig,
    backend: SharedBackend,
    worker_id: usize,
    registered_persistent_ids: HashSet<PersistentId>,
}

impl WorkerPersistentStorage {
    pub fn new(config: PersistenceConfig, backend: SharedBackend, worker_id: usize) -> Self {
        Self {
            config,
            backend,
            worker_id,
            registered_persistent_ids: HashSet::new(),
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Returns `false` if the id is already taken by another source.
    pub fn register(&mut self, persistent_id: PersistentId) -> bool {
        self.registered_persistent_ids.insert(persistent_id)
    }

    pub fn snapshot_writer(
        &self,
        persistent_id: PersistentId,
    ) -> Result<Option<SnapshotWriter>, PersistenceError> {
        if !self.config.records() {
            return Ok(None);
        }
        SnapshotWriter::new(self.backend.clone(), persistent_id, self.worker_id).map(Some)
    }

    pub fn read_snapshot(
        &self,
        persistent_id: PersistentId,
    ) -> Result<Option<Snapshot>, PersistenceError> {
        if !self.config.replays() {
            return Ok(None);
        }
        let snapshot = read_snapshot(&self.backend, persistent_id)?;
        info!(
            "worker {} replays {} times of {persistent_id}",
            self.worker_id,
            snapshot.batches.len()
        );
        Ok(Some(snapshot))
    }

    pub fn replay_pacing(&self) -> ReplayPacing {
        self.config.replay_pacing()
    }

    pub fn continue_after_replay(&self) -> bool {
        self.config.continue_after_replay
    }

    pub fn udf_cache(&self, persistent_id: PersistentId) -> Option<UdfCache> {
        self.config
            .caches_udf_results()
            .then(|| UdfCache::new(self.backend.clone(), persistent_id))
    }
}
