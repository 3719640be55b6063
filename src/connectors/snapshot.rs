// Copyright © 2024 Pathway

use log::{debug, info};
use std::collections::BTreeMap;
use std::io::Cursor;

use bincode::{deserialize_from, serialize_into};
use serde::{Deserialize, Serialize};

use crate::engine::{Key, Timestamp, Value};
use crate::persistence::config::SharedBackend;
use crate::persistence::{PersistenceError, PersistentId};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    Insert(Key, Vec<Value>),
    Delete(Key, Vec<Value>),
    AdvanceTime(Timestamp),
    Finished,
}

pub fn chunk_key(persistent_id: PersistentId, worker: usize, seq: u64) -> String {
    format!("{persistent_id}/{worker}/{seq:020}")
}

fn parse_chunk_key(persistent_id: PersistentId, key: &str) -> Option<(usize, u64)> {
    let rest = key.strip_prefix(&format!("{persistent_id}/"))?;
    let (worker, seq) = rest.split_once('/')?;
    Some((worker.parse().ok()?, seq.parse().ok()?))
}

pub fn encode_chunk(events: &[Event]) -> Result<Vec<u8>, PersistenceError> {
    let mut buffer = Vec::new();
    for event in events {
        serialize_into(&mut buffer, event)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
    }
    Ok(buffer)
}

/// Decodes one chunk and checks that it is a complete unit: data events
/// closed by exactly one trailing `AdvanceTime`, or a lone `Finished`.
pub fn decode_chunk(key: &str, bytes: &[u8]) -> Result<Vec<Event>, PersistenceError> {
    let mut cursor = Cursor::new(bytes);
    let mut events = Vec::new();
    while usize::try_from(cursor.position()).is_ok_and(|position| position < bytes.len()) {
        let event: Event = deserialize_from(&mut cursor)
            .map_err(|e| PersistenceError::CorruptedChunk(key.to_string(), e.to_string()))?;
        events.push(event);
    }
    match events.split_last() {
        Some((Event::Finished, [])) => Ok(events),
        Some((Event::AdvanceTime(_), data)) => {
            if data
                .iter()
                .any(|event| matches!(event, Event::AdvanceTime(_) | Event::Finished))
            {
                return Err(PersistenceError::CorruptedChunk(
                    key.to_string(),
                    "control event in the middle of a chunk".to_string(),
                ));
            }
            Ok(events)
        }
        _ => Err(PersistenceError::MissingAdvanceTime(key.to_string())),
    }
}

/// Appends one chunk per committed time to the log of a single source and
/// worker.
pub struct SnapshotWriter {
    backend: SharedBackend,
    persistent_id: PersistentId,
    worker: usize,
    next_seq: u64,
}

impl SnapshotWriter {
    pub fn new(
        backend: SharedBackend,
        persistent_id: PersistentId,
        worker: usize,
    ) -> Result<Self, PersistenceError> {
        let next_seq = backend
            .lock()
            .unwrap()
            .list_keys()?
            .iter()
            .filter_map(|key| parse_chunk_key(persistent_id, key))
            .filter(|(chunk_worker, _seq)| *chunk_worker == worker)
            .map(|(_worker, seq)| seq + 1)
            .max()
            .unwrap_or(0);
        Ok(Self {
            backend,
            persistent_id,
            worker,
            next_seq,
        })
    }

    fn put_chunk(&mut self, events: &[Event]) -> Result<(), PersistenceError> {
        let key = chunk_key(self.persistent_id, self.worker, self.next_seq);
        let bytes = encode_chunk(events)?;
        self.backend.lock().unwrap().put_value(&key, bytes)?;
        self.next_seq += 1;
        Ok(())
    }

    /// Writes the changes of one fully processed time.
    pub fn write_batch(
        &mut self,
        rows: &[(Key, Vec<Value>, isize)],
        time: Timestamp,
    ) -> Result<(), PersistenceError> {
        let mut events = Vec::with_capacity(rows.len() + 1);
        for (key, values, diff) in rows {
            let event = if *diff > 0 {
                Event::Insert(*key, values.clone())
            } else {
                Event::Delete(*key, values.clone())
            };
            for _ in 0..diff.unsigned_abs() {
                events.push(event.clone());
            }
        }
        events.push(Event::AdvanceTime(time));
        self.put_chunk(&events)
    }

    pub fn finish(&mut self) -> Result<(), PersistenceError> {
        debug!(
            "finishing snapshot of {} on worker {}",
            self.persistent_id, self.worker
        );
        self.put_chunk(&[Event::Finished])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Changes grouped by the time they were recorded at.
    pub batches: BTreeMap<u64, Vec<(Key, Vec<Value>, isize)>>,
    pub finished: bool,
}

impl Snapshot {
    pub fn last_time(&self) -> Option<u64> {
        self.batches.keys().next_back().copied()
    }
}

/// Reads the log of a source written by all workers of previous runs.
/// Fails on the first chunk that is not a complete unit.
pub fn read_snapshot(
    backend: &SharedBackend,
    persistent_id: PersistentId,
) -> Result<Snapshot, PersistenceError> {
    let backend = backend.lock().unwrap();
    let mut chunks: Vec<(usize, u64, String)> = backend
        .list_keys()?
        .into_iter()
        .filter_map(|key| {
            parse_chunk_key(persistent_id, &key).map(|(worker, seq)| (worker, seq, key))
        })
        .collect();
    chunks.sort_unstable();

    let mut snapshot = Snapshot::default();
    let mut finished_workers = 0;
    let mut workers_seen = 0;
    let mut last_worker = None;
    for (worker, _seq, key) in &chunks {
        if last_worker != Some(*worker) {
            workers_seen += 1;
            last_worker = Some(*worker);
        }
        let events = decode_chunk(key, &backend.get_value(key)?)?;
        let mut rows = Vec::new();
        for event in events {
            match event {
                Event::Insert(key, values) => rows.push((key, values, 1)),
                Event::Delete(key, values) => rows.push((key, values, -1)),
                Event::AdvanceTime(time) => {
                    snapshot
                        .batches
                        .entry(time.time)
                        .or_default()
                        .append(&mut rows);
                }
                Event::Finished => finished_workers += 1,
            }
        }
    }
    snapshot.finished = workers_seen > 0 && finished_workers >= workers_seen;
    info!(
        "read {} snapshot chunks of {persistent_id}, {} times",
        chunks.len(),
        snapshot.batches.len()
    );
    Ok(snapshot)
}
