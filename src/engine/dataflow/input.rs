// Copyright © 2024 Pathway

use std::collections::BTreeMap;
use std::time::Duration;

use differential_dataflow::consolidation::consolidate_updates;
use log::{debug, info};

use super::exchange::WorkerContext;
use super::operators::{Batch, MultiplicityCheck, Pending};
use super::persist::SourcePersistence;
use crate::connectors::{ConnectorMode, DataRow, InputSubject, SubjectPoll};
use crate::engine::{Error, Key, Result, Value};

/// Input of one table, polled by the scheduler. `poll` is collective: all
/// workers call it for every source in the same order.
pub trait Source {
    /// Fetches new rows and routes them to the workers owning them.
    fn poll(&mut self, worker: &WorkerContext) -> Result<()>;

    /// Earliest time with rows waiting on this worker.
    fn next_time(&self) -> Option<u64>;

    /// No rows with times before the frontier will appear anymore.
    /// `u64::MAX` once the source is exhausted. Equal on all workers.
    fn frontier(&self) -> u64;

    /// Moves the rows of `time` to the table.
    fn feed(&mut self, time: u64) -> Result<()>;

    /// Called once `time` is fully processed.
    fn commit(&mut self, _time: u64) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    /// Last time restored from a snapshot, known on the reading worker.
    fn replay_horizon(&self) -> Option<u64> {
        None
    }

    /// Blocks for a while waiting for new data.
    fn wait(&mut self, _timeout: Duration) {}
}

#[derive(Default)]
struct SourceRows {
    rows: BTreeMap<u64, Batch>,
    check: MultiplicityCheck,
}

impl SourceRows {
    fn add(&mut self, time: u64, update: (Key, Value, isize)) {
        self.rows.entry(time).or_default().push(update);
    }

    fn next_time(&self) -> Option<u64> {
        self.rows.keys().next().copied()
    }

    fn take(&mut self, time: u64) -> Result<Batch> {
        let mut batch = self.rows.remove(&time).unwrap_or_default();
        consolidate_updates(&mut batch);
        self.check.check(&batch)?;
        Ok(batch)
    }
}

// Times are carried bit for bit, so the whole `u64` range survives the trip.
#[allow(clippy::cast_possible_wrap)]
fn time_to_value(time: u64) -> Value {
    Value::from(time as i64)
}

#[allow(clippy::cast_sign_loss)]
fn time_from_value(value: &Value) -> Result<u64> {
    Ok(value.as_int()? as u64)
}

/// Rows known upfront. Each worker keeps only the rows it owns.
pub struct StaticSource {
    rows: SourceRows,
    target: Pending,
}

impl StaticSource {
    pub fn new(data: Vec<DataRow>, worker: &WorkerContext, target: Pending) -> Self {
        let mut rows = SourceRows::default();
        for row in data {
            if row.worker(worker.count()) == worker.index() {
                rows.add(row.time, (row.key, Value::from(row.values), row.diff));
            }
        }
        Self { rows, target }
    }
}

impl Source for StaticSource {
    fn poll(&mut self, _worker: &WorkerContext) -> Result<()> {
        Ok(())
    }

    fn next_time(&self) -> Option<u64> {
        self.rows.next_time()
    }

    fn frontier(&self) -> u64 {
        u64::MAX
    }

    fn feed(&mut self, time: u64) -> Result<()> {
        let batch = self.rows.take(time)?;
        self.target.borrow_mut().extend(batch);
        Ok(())
    }
}

/// Rows pushed to an `InputSubject`. The first worker reads the subject and
/// the snapshot, then rows travel to the workers owning them.
pub struct SubjectSource {
    subject: InputSubject,
    mode: ConnectorMode,
    persistence: Option<SourcePersistence>,
    received: SubjectPoll,
    rows: SourceRows,
    frontier: u64,
    target: Pending,
    reads: bool,
}

impl SubjectSource {
    pub fn new(
        subject: InputSubject,
        mode: ConnectorMode,
        persistence: Option<SourcePersistence>,
        worker: &WorkerContext,
        target: Pending,
    ) -> Self {
        Self {
            subject,
            mode,
            persistence,
            received: SubjectPoll::default(),
            rows: SourceRows::default(),
            frontier: 0,
            target,
            reads: worker.index() == 0,
        }
    }

    /// Reads the subject and the snapshot. Returns the rows and the frontier
    /// as seen by the reading worker.
    fn read(&mut self) -> (Vec<DataRow>, u64) {
        let mut rows = Vec::new();
        let mut replay_frontier = None;
        if let Some(persistence) = self.persistence.as_mut() {
            let (replayed, next_replay_time) = persistence.take_replayed();
            if !replayed.is_empty() {
                debug!("replaying {} rows", replayed.len());
            }
            rows.extend(replayed);
            replay_frontier = next_replay_time;
            if !persistence.continue_after_replay() {
                let frontier = if persistence.replay_finished() {
                    u64::MAX
                } else {
                    replay_frontier.unwrap_or(u64::MAX)
                };
                return (rows, frontier);
            }
        }

        self.subject.drain_into(&mut self.received);
        for row in std::mem::take(&mut self.received.rows) {
            match self.persistence.as_mut() {
                Some(persistence) if persistence.is_persisted(&row) => {
                    debug!("skipping row {} already processed at {}", row.key, row.time);
                }
                Some(persistence) => {
                    persistence.record(&row);
                    rows.push(row);
                }
                None => rows.push(row),
            }
        }
        let mut frontier = match (self.mode, self.received.closed) {
            (_, true) => u64::MAX,
            (ConnectorMode::Static, false) => 0,
            (ConnectorMode::Streaming, false) => self.received.frontier,
        };
        if let Some(replay_frontier) = replay_frontier {
            frontier = frontier.min(replay_frontier);
        }
        (rows, frontier)
    }
}

impl Source for SubjectSource {
    fn poll(&mut self, worker: &WorkerContext) -> Result<()> {
        let (rows, frontier) = if self.reads {
            self.read()
        } else {
            (Vec::new(), 0)
        };

        let mut parts: Vec<Batch> = (0..worker.count()).map(|_| Vec::new()).collect();
        for row in rows {
            let owner = row.worker(worker.count());
            // the time travels in front of the row values
            let carrier = Value::Tuple(
                [time_to_value(row.time), Value::from(row.values)]
                    .into_iter()
                    .collect(),
            );
            parts[owner].push((row.key, carrier, row.diff));
        }
        let received = if worker.is_single() {
            parts.into_iter().flatten().collect()
        } else {
            worker.exchange_partitioned(parts)?
        };
        for (key, carrier, diff) in received {
            let carrier = carrier.as_tuple()?;
            let (Some(time), Some(values)) = (carrier.first(), carrier.get(1)) else {
                continue;
            };
            let time = time_from_value(time)?;
            self.rows.add(time, (key, values.clone(), diff));
        }

        let frontiers = worker.all_gather(frontier)?;
        let frontier = frontiers.first().copied().unwrap_or(u64::MAX);
        if frontier < self.frontier {
            return Err(Error::InputTimeRegression(
                "frontier".to_string(),
                frontier,
                self.frontier,
            ));
        }
        if frontier == u64::MAX && self.frontier != u64::MAX {
            info!("input on worker {} exhausted", worker.index());
        }
        self.frontier = frontier;
        Ok(())
    }

    fn next_time(&self) -> Option<u64> {
        self.rows.next_time()
    }

    fn frontier(&self) -> u64 {
        self.frontier
    }

    fn feed(&mut self, time: u64) -> Result<()> {
        let batch = self.rows.take(time)?;
        self.target.borrow_mut().extend(batch);
        Ok(())
    }

    fn commit(&mut self, time: u64) -> Result<()> {
        match self.persistence.as_mut() {
            Some(persistence) => persistence.commit(time),
            None => Ok(()),
        }
    }

    fn finish(&mut self) -> Result<()> {
        match self.persistence.as_mut() {
            Some(persistence) => persistence.finish(),
            None => Ok(()),
        }
    }

    fn replay_horizon(&self) -> Option<u64> {
        self.persistence
            .as_ref()
            .and_then(SourcePersistence::horizon)
    }

    fn wait(&mut self, timeout: Duration) {
        if self.reads {
            self.subject.wait(&mut self.received, timeout);
        }
    }
}
