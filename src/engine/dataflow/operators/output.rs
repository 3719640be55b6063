// Copyright © 2024 Pathway

use std::cell::Cell;
use std::rc::Rc;

use differential_dataflow::consolidation::consolidate_updates;
use log::{debug, info};

use super::{Batch, NodeId, Operator, StepContext};
use crate::connectors::data_format::Formatter;
use crate::connectors::data_storage::Writer;
use crate::engine::graph::{ColumnPath, SubscribeCallbacks};
use crate::engine::{Error, Key, Result, Value};

/// Receives the consolidated changes of a table, one logical time at a
/// time.
pub trait Sink {
    fn on_data(&mut self, key: Key, values: &[Value], time: u64, diff: isize) -> Result<()>;

    fn on_time_end(&mut self, _time: u64) -> Result<()> {
        Ok(())
    }

    fn on_end(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Sink for SubscribeCallbacks {
    fn on_data(&mut self, key: Key, values: &[Value], time: u64, diff: isize) -> Result<()> {
        if let Some(on_data) = self.on_data.as_mut() {
            on_data(key, values, time, diff)?;
        }
        Ok(())
    }

    fn on_time_end(&mut self, time: u64) -> Result<()> {
        if let Some(on_time_end) = self.on_time_end.as_mut() {
            on_time_end(time)?;
        }
        Ok(())
    }

    fn on_end(&mut self) -> Result<()> {
        if let Some(on_end) = self.on_end.as_mut() {
            on_end()?;
        }
        Ok(())
    }
}

/// Formats every change and hands it to a writer.
pub struct FormattedSink {
    writer: Box<dyn Writer>,
    formatter: Box<dyn Formatter>,
}

impl FormattedSink {
    pub fn new(writer: Box<dyn Writer>, formatter: Box<dyn Formatter>) -> Self {
        info!(
            "writing to {} with {}",
            writer.name(),
            formatter.short_description()
        );
        Self { writer, formatter }
    }
}

impl Sink for FormattedSink {
    fn on_data(&mut self, _key: Key, values: &[Value], time: u64, diff: isize) -> Result<()> {
        let formatted = self
            .formatter
            .format(values, time, diff)
            .map_err(|e| Error::Writer(e.into()))?;
        self.writer.write(formatted)?;
        Ok(())
    }

    fn on_time_end(&mut self, _time: u64) -> Result<()> {
        self.writer.flush(false)?;
        Ok(())
    }

    fn on_end(&mut self) -> Result<()> {
        self.writer.flush(true)?;
        Ok(())
    }
}

/// Collects the changes of both sub-steps of a time and delivers them,
/// retractions first, once the time is complete.
pub struct SinkOperator {
    input: NodeId,
    column_paths: Vec<ColumnPath>,
    sink: Box<dyn Sink>,
    pending: Batch,
    skip_until: Option<Rc<Cell<Option<u64>>>>,
}

impl SinkOperator {
    /// With `skip_until`, times not later than the shared replay horizon are
    /// not delivered.
    pub fn new(
        input: NodeId,
        column_paths: Vec<ColumnPath>,
        sink: Box<dyn Sink>,
        skip_until: Option<Rc<Cell<Option<u64>>>>,
    ) -> Self {
        Self {
            input,
            column_paths,
            sink,
            pending: Vec::new(),
            skip_until,
        }
    }
}

impl Operator for SinkOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let mut batch = ctx.worker.exchange_by_key(ctx.input_owned(self.input))?;
        self.pending.append(&mut batch);
        Ok(Vec::new())
    }

    fn on_time_end(&mut self, time: u64) -> Result<()> {
        let mut batch = std::mem::take(&mut self.pending);
        consolidate_updates(&mut batch);
        let horizon = self.skip_until.as_ref().and_then(|horizon| horizon.get());
        if horizon.is_some_and(|horizon| time <= horizon) {
            debug!("skipping {} persisted changes at time {time}", batch.len());
            return Ok(());
        }
        if batch.is_empty() {
            return Ok(());
        }
        let (retractions, insertions): (Batch, Batch) =
            batch.into_iter().partition(|(_key, _value, diff)| *diff < 0);
        for (key, value, diff) in retractions.iter().chain(&insertions) {
            let values = ColumnPath::extract_all(&self.column_paths, key, value)?;
            self.sink.on_data(*key, &values, time, *diff)?;
        }
        self.sink.on_time_end(time)
    }

    fn on_end(&mut self) -> Result<()> {
        self.sink.on_end()
    }
}
