// Copyright © 2024 Pathway

use std::collections::BTreeMap;
use std::time::Instant;

use log::{info, warn};

use crate::connectors::snapshot::SnapshotWriter;
use crate::connectors::DataRow;
use crate::engine::{Key, Result, Value};
use crate::persistence::config::ReplayPacing;
use crate::persistence::tracker::WorkerPersistentStorage;
use crate::persistence::PersistentId;

type Rows = Vec<(Key, Vec<Value>, isize)>;

/// Snapshot handling of one persisted source. Lives on the worker that
/// reads the source.
pub struct SourcePersistence {
    persistent_id: PersistentId,
    writer: Option<SnapshotWriter>,
    replay: BTreeMap<u64, Rows>,
    pacing: ReplayPacing,
    first_replay_time: Option<u64>,
    replay_started: Option<Instant>,
    horizon: Option<u64>,
    continue_after_replay: bool,
    to_record: BTreeMap<u64, Rows>,
}

impl SourcePersistence {
    pub fn new(storage: &WorkerPersistentStorage, persistent_id: PersistentId) -> Result<Self> {
        let snapshot = storage.read_snapshot(persistent_id)?.unwrap_or_default();
        let horizon = snapshot.last_time();
        if snapshot.finished {
            info!("snapshot of {persistent_id} comes from a finished run");
        }
        Ok(Self {
            persistent_id,
            writer: storage.snapshot_writer(persistent_id)?,
            first_replay_time: snapshot.batches.keys().next().copied(),
            replay: snapshot.batches,
            pacing: storage.replay_pacing(),
            replay_started: None,
            horizon,
            continue_after_replay: storage.continue_after_replay(),
            to_record: BTreeMap::new(),
        })
    }

    /// Last time covered by the snapshot. Live rows up to it were already
    /// processed by a previous run.
    pub fn horizon(&self) -> Option<u64> {
        self.horizon
    }

    pub fn continue_after_replay(&self) -> bool {
        self.continue_after_replay
    }

    pub fn replay_finished(&self) -> bool {
        self.replay.is_empty()
    }

    /// Takes the replayed rows that are due. Returns them together with the
    /// earliest time that may still be replayed.
    pub fn take_replayed(&mut self) -> (Vec<DataRow>, Option<u64>) {
        let mut rows = Vec::new();
        match self.pacing {
            ReplayPacing::Collapsed => {
                for (_time, batch) in std::mem::take(&mut self.replay) {
                    rows.extend(batch.into_iter().map(|(key, values, diff)| {
                        DataRow::from_engine(key, values, 0, diff)
                    }));
                }
            }
            ReplayPacing::Speedrun => {
                for (time, batch) in std::mem::take(&mut self.replay) {
                    rows.extend(batch.into_iter().map(|(key, values, diff)| {
                        DataRow::from_engine(key, values, time, diff)
                    }));
                }
            }
            ReplayPacing::Realtime => {
                let started = *self.replay_started.get_or_insert_with(Instant::now);
                let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                let first = self.first_replay_time.unwrap_or(0);
                while let Some(entry) = self.replay.first_entry() {
                    if entry.key().saturating_sub(first) > elapsed {
                        break;
                    }
                    let (time, batch) = entry.remove_entry();
                    rows.extend(batch.into_iter().map(|(key, values, diff)| {
                        DataRow::from_engine(key, values, time, diff)
                    }));
                }
            }
        }
        (rows, self.replay.keys().next().copied())
    }

    /// Whether a live row was already processed before the restart.
    pub fn is_persisted(&self, row: &DataRow) -> bool {
        self.horizon.is_some_and(|horizon| row.time <= horizon)
    }

    pub fn record(&mut self, row: &DataRow) {
        if self.writer.is_some() {
            self.to_record
                .entry(row.time)
                .or_default()
                .push((row.key, row.values.clone(), row.diff));
        }
    }

    /// Writes everything recorded for times up to `time`, which are all
    /// fully processed.
    pub fn commit(&mut self, time: u64) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let later = self.to_record.split_off(&time.saturating_add(1));
        for (time, rows) in std::mem::replace(&mut self.to_record, later) {
            writer.write_batch(&rows, time.into())?;
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        if !self.to_record.is_empty() {
            warn!(
                "{} times of {} were not committed before finishing",
                self.to_record.len(),
                self.persistent_id
            );
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.finish()?;
        }
        Ok(())
    }
}
