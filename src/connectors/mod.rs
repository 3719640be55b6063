// Copyright © 2024 Pathway

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

pub mod data_format;
pub mod data_storage;
pub mod snapshot;

use crate::engine::dataflow::shard::Shard;
use crate::engine::{Error as EngineError, Key, Value};

pub use data_storage::ConnectorMode;

/// A single change supplied from outside of the dataflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub key: Key,
    pub values: Vec<Value>,
    pub time: u64,
    pub diff: isize,
    pub shard: Option<usize>,
}

impl DataRow {
    pub fn from_engine(key: Key, values: Vec<Value>, time: u64, diff: isize) -> Self {
        DataRow {
            key,
            values,
            time,
            diff,
            shard: None,
        }
    }

    #[must_use]
    pub fn with_shard(mut self, shard: usize) -> Self {
        self.shard = Some(shard);
        self
    }

    /// Worker that owns the row. An explicit shard takes precedence over
    /// the shard bits of the key.
    pub fn worker(&self, worker_count: usize) -> usize {
        match self.shard {
            Some(shard) => shard % worker_count,
            None => self.key.shard_as_usize() % worker_count,
        }
    }
}

#[derive(Debug)]
enum SubjectEvent {
    Row(DataRow),
    AdvanceTo(u64),
    Close,
}

/// Push-based input. Rows may be pushed from any thread while the dataflow
/// is running; `advance_to` promises that no further rows with earlier times
/// will follow and `close` ends the stream.
///
/// Events travel through a channel, so the reader sees rows and frontier
/// moves in the order they were issued.
#[derive(Debug, Clone)]
pub struct InputSubject {
    sender: Sender<SubjectEvent>,
    receiver: Receiver<SubjectEvent>,
    frontier: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

/// What the reader has seen of a subject so far.
#[derive(Debug, Default)]
pub(crate) struct SubjectPoll {
    pub rows: Vec<DataRow>,
    pub frontier: u64,
    pub closed: bool,
}

impl SubjectPoll {
    fn apply(&mut self, event: SubjectEvent) {
        match event {
            SubjectEvent::Row(row) => self.rows.push(row),
            SubjectEvent::AdvanceTo(time) => self.frontier = self.frontier.max(time),
            SubjectEvent::Close => self.closed = true,
        }
    }
}

impl Default for InputSubject {
    fn default() -> Self {
        Self::new()
    }
}

impl InputSubject {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            frontier: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn push(&self, row: DataRow) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ValueError(
                "cannot push to a closed input".into(),
            ));
        }
        let frontier = self.frontier.load(Ordering::Acquire);
        if row.time < frontier {
            return Err(EngineError::InputTimeRegression(
                format!("{:?}", row.key),
                row.time,
                frontier,
            ));
        }
        self.send(SubjectEvent::Row(row));
        Ok(())
    }

    pub fn push_all(&self, rows: impl IntoIterator<Item = DataRow>) -> Result<(), EngineError> {
        rows.into_iter().try_for_each(|row| self.push(row))
    }

    pub fn advance_to(&self, time: u64) {
        if self.frontier.fetch_max(time, Ordering::AcqRel) < time {
            self.send(SubjectEvent::AdvanceTo(time));
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(
                "input closed at frontier {}",
                self.frontier.load(Ordering::Acquire)
            );
            self.send(SubjectEvent::Close);
        }
    }

    fn send(&self, event: SubjectEvent) {
        // the subject holds a receiver itself, so the channel is never disconnected
        let _ = self.sender.send(event);
    }

    /// Moves every pending event into `poll` without blocking.
    pub(crate) fn drain_into(&self, poll: &mut SubjectPoll) {
        for event in self.receiver.try_iter() {
            poll.apply(event);
        }
    }

    /// Blocks until something is pushed, the frontier moves or the input is
    /// closed, at most for `timeout`.
    pub(crate) fn wait(&self, poll: &mut SubjectPoll, timeout: Duration) {
        if !poll.rows.is_empty() || poll.closed {
            return;
        }
        if let Ok(event) = self.receiver.recv_timeout(timeout) {
            poll.apply(event);
        }
    }
}
