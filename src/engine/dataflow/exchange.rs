// Copyright © 2024 Pathway

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use differential_dataflow::consolidation::consolidate_updates;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use timely::communication::Allocator;
use timely::dataflow::operators::probe::Handle as ProbeHandle;
use timely::dataflow::operators::{Exchange, Inspect, Input, Probe};
use timely::dataflow::InputHandle;
use timely::worker::Worker;

use super::operators::{Batch, Update};
use super::shard::Shard;
use crate::engine::{Error, Key, Result};

const PARK_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Message {
    Updates(Batch),
    Gathered { from: usize, payload: Vec<u8> },
    Abort,
}

/// A message with the index of the worker it is addressed to.
type Envelope = (usize, Message);

/// Collective rounds of one worker. Every round is a timestamp of a small
/// timely dataflow that routes envelopes to their workers. A round is
/// complete once its frontier passes it, which happens only after every worker
/// has sent its part.
struct Mailbox {
    worker: Worker<Allocator>,
    input: InputHandle<u64, Envelope>,
    probe: ProbeHandle<u64>,
    received: Rc<RefCell<BTreeMap<u64, Vec<Message>>>>,
    round: u64,
    aborted: bool,
}

impl Mailbox {
    fn new(worker: &mut Worker<Allocator>) -> Self {
        let received: Rc<RefCell<BTreeMap<u64, Vec<Message>>>> = Rc::default();
        let mut input = InputHandle::new();
        let mut probe = ProbeHandle::new();
        let sink = received.clone();
        worker.dataflow::<u64, _, _>(|scope| {
            scope
                .input_from(&mut input)
                .exchange(|(destination, _message): &Envelope| *destination as u64)
                .inspect_batch(move |round, envelopes| {
                    sink.borrow_mut().entry(*round).or_default().extend(
                        envelopes
                            .iter()
                            .map(|(_destination, message)| message.clone()),
                    );
                })
                .probe_with(&mut probe);
        });
        Self {
            worker: worker.clone(),
            input,
            probe,
            received,
            round: 0,
            aborted: false,
        }
    }

    fn round(&mut self, outgoing: Vec<Envelope>) -> Result<Vec<Message>> {
        if self.aborted {
            return Err(Error::Aborted);
        }
        let round = self.round;
        for envelope in outgoing {
            self.input.send(envelope);
        }
        self.round += 1;
        self.input.advance_to(self.round);
        let probe = self.probe.clone();
        self.worker
            .step_or_park_while(Some(PARK_TIMEOUT), || probe.less_than(&(round + 1)));
        let messages = self
            .received
            .borrow_mut()
            .remove(&round)
            .unwrap_or_default();
        if messages
            .iter()
            .any(|message| matches!(message, Message::Abort))
        {
            self.aborted = true;
            return Err(Error::Aborted);
        }
        Ok(messages)
    }
}

/// A worker's handle to the collective operations shared with its peers.
/// All workers must issue the same sequence of collective calls.
#[derive(Clone)]
pub struct WorkerContext {
    index: usize,
    count: usize,
    mailbox: Rc<RefCell<Mailbox>>,
}

impl WorkerContext {
    pub fn new(worker: &mut Worker<Allocator>) -> Self {
        Self {
            index: worker.index(),
            count: worker.peers(),
            mailbox: Rc::new(RefCell::new(Mailbox::new(worker))),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_single(&self) -> bool {
        self.count == 1
    }

    pub fn worker_for(&self, key: &Key) -> usize {
        key.shard_as_usize() % self.count
    }

    fn round(&self, outgoing: Vec<Envelope>) -> Result<Vec<Message>> {
        self.mailbox.borrow_mut().round(outgoing)
    }

    /// Returns once every worker got here. Fails if any of them aborted.
    pub fn barrier(&self) -> Result<()> {
        if self.is_single() {
            return Ok(());
        }
        self.round(Vec::new()).map(drop)
    }

    /// Makes the pending and all future collective calls of the other
    /// workers fail with `Error::Aborted`.
    pub fn abort(&self) {
        let Ok(mut mailbox) = self.mailbox.try_borrow_mut() else {
            return;
        };
        if mailbox.aborted {
            return;
        }
        debug!("worker {} aborts the dataflow", self.index);
        mailbox.aborted = true;
        for destination in 0..self.count {
            mailbox.input.send((destination, Message::Abort));
        }
        let next = mailbox.round + 1;
        mailbox.input.advance_to(next);
    }

    /// Sends `parts[w]` to worker `w` and returns everything addressed to
    /// this worker, consolidated.
    pub fn exchange_partitioned(&self, mut parts: Vec<Batch>) -> Result<Batch> {
        if self.is_single() {
            let mut batch: Batch = parts.into_iter().flatten().collect();
            consolidate_updates(&mut batch);
            return Ok(batch);
        }
        let mut own = std::mem::take(&mut parts[self.index]);
        let outgoing = parts
            .into_iter()
            .enumerate()
            .filter(|(_destination, part)| !part.is_empty())
            .map(|(destination, part)| (destination, Message::Updates(part)))
            .collect();
        for message in self.round(outgoing)? {
            if let Message::Updates(mut part) = message {
                own.append(&mut part);
            }
        }
        consolidate_updates(&mut own);
        Ok(own)
    }

    /// Moves every update to the worker owning `route(update)`.
    pub fn exchange(&self, batch: Batch, route: impl Fn(&Update) -> usize) -> Result<Batch> {
        if self.is_single() {
            return Ok(batch);
        }
        let mut parts: Vec<Batch> = (0..self.count).map(|_| Vec::new()).collect();
        for update in batch {
            let worker = route(&update) % self.count;
            parts[worker].push(update);
        }
        self.exchange_partitioned(parts)
    }

    /// Moves every update to the worker owning its key.
    pub fn exchange_by_key(&self, batch: Batch) -> Result<Batch> {
        self.exchange(batch, |(key, _value, _diff)| key.shard_as_usize())
    }

    /// Makes every update available on every worker.
    pub fn broadcast(&self, batch: Batch) -> Result<Batch> {
        if self.is_single() {
            return Ok(batch);
        }
        let parts = (0..self.count).map(|_| batch.clone()).collect();
        self.exchange_partitioned(parts)
    }

    /// Returns the values contributed by all workers, ordered by worker.
    pub fn all_gather<T: Serialize + DeserializeOwned>(&self, value: T) -> Result<Vec<T>> {
        if self.is_single() {
            return Ok(vec![value]);
        }
        let payload = bincode::serialize(&value).map_err(|e| Error::Other(e.into()))?;
        let outgoing = (0..self.count)
            .map(|destination| {
                (
                    destination,
                    Message::Gathered {
                        from: self.index,
                        payload: payload.clone(),
                    },
                )
            })
            .collect();
        let mut gathered: Vec<(usize, Vec<u8>)> = self
            .round(outgoing)?
            .into_iter()
            .filter_map(|message| match message {
                Message::Gathered { from, payload } => Some((from, payload)),
                _ => None,
            })
            .collect();
        if gathered.len() != self.count {
            return Err(Error::Aborted);
        }
        gathered.sort_by_key(|(from, _payload)| *from);
        gathered
            .into_iter()
            .map(|(_from, payload)| {
                bincode::deserialize(&payload).map_err(|e| Error::Other(e.into()))
            })
            .collect()
    }

    pub fn all_reduce_min(&self, value: u64) -> Result<u64> {
        Ok(self
            .all_gather(value)?
            .into_iter()
            .min()
            .unwrap_or(value))
    }

    pub fn all_reduce_or(&self, value: bool) -> Result<bool> {
        Ok(self.all_gather(value)?.into_iter().any(|value| value))
    }
}
