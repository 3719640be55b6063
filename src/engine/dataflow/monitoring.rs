// Copyright © 2024 Pathway

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::SystemTime;

use log::info;
use once_cell::unsync::Lazy;

use super::operators::{Batch, NodeId, Operator, StepContext};
use crate::engine::graph::{OperatorStats, ProberStats};
use crate::engine::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitoringLevel {
    #[default]
    None,
    InOut,
    All,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProbeState {
    pub time: Option<u64>,
    pub rows: isize,
}

pub type Probes = Rc<RefCell<HashMap<usize, ProbeState>>>;

/// Counts the rows of a table and remembers the latest time it changed.
pub struct ProbeOperator {
    input: NodeId,
    operator_id: usize,
    probes: Probes,
}

impl ProbeOperator {
    pub fn new(input: NodeId, operator_id: usize, probes: Probes) -> Self {
        probes.borrow_mut().entry(operator_id).or_default();
        Self {
            input,
            operator_id,
            probes,
        }
    }
}

impl Operator for ProbeOperator {
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<Batch> {
        let batch = ctx.input(self.input);
        if !batch.is_empty() {
            let mut probes = self.probes.borrow_mut();
            let state = probes.entry(self.operator_id).or_default();
            state.time = Some(ctx.time.time);
            state.rows += batch.iter().map(|(_key, _value, diff)| diff).sum::<isize>();
        }
        Ok(Vec::new())
    }
}

/// Reports progress of the dataflow to a callback after processed times.
pub struct Prober {
    input_time: Option<u64>,
    output_time: Option<u64>,
    intermediate_probes_required: bool,
    run_callback_every_time: bool,
    stats: HashMap<usize, OperatorStats>,
    callback: Box<dyn FnMut(ProberStats)>,
}

impl Prober {
    pub fn new(
        callback: Box<dyn FnMut(ProberStats)>,
        intermediate_probes_required: bool,
        run_callback_every_time: bool,
    ) -> Self {
        Self {
            input_time: None,
            output_time: None,
            intermediate_probes_required,
            run_callback_every_time,
            stats: HashMap::new(),
            callback,
        }
    }

    fn create_stats(time: Option<u64>, input_time: Option<u64>, done: bool) -> OperatorStats {
        if done {
            return OperatorStats {
                time: None,
                lag: None,
                done: true,
            };
        }
        OperatorStats {
            time,
            lag: time.zip(input_time).map(|(time, input_time)| input_time.saturating_sub(time)),
            done: false,
        }
    }

    pub fn update(
        &mut self,
        input_time: Option<u64>,
        output_time: Option<u64>,
        probes: &HashMap<usize, ProbeState>,
        done: bool,
    ) {
        let mut changed = done;
        if input_time != self.input_time {
            self.input_time = input_time;
            changed = true;
        }
        if output_time != self.output_time {
            self.output_time = output_time;
            changed = true;
        }
        if self.intermediate_probes_required {
            for (id, probe) in probes {
                if self.stats.get(id).is_none_or(|stat| stat.time != probe.time) {
                    changed = true;
                }
            }
        }

        if changed || self.run_callback_every_time {
            let mut row_counts = HashMap::new();
            if self.intermediate_probes_required {
                for (id, probe) in probes {
                    self.stats
                        .insert(*id, Self::create_stats(probe.time, self.input_time, done));
                    row_counts.insert(*id, probe.rows);
                }
            }
            let prober_stats = ProberStats {
                input_stats: Self::create_stats(self.input_time, self.input_time, done),
                output_stats: Self::create_stats(self.output_time, self.input_time, done),
                operators_stats: self.stats.clone(),
                row_counts,
            };
            (self.callback)(prober_stats);
        }
    }
}

/// Logs progress according to the monitoring level.
pub struct ProgressLogger {
    level: MonitoringLevel,
    started: Lazy<SystemTime>,
}

impl ProgressLogger {
    pub fn new(level: MonitoringLevel) -> Self {
        Self {
            level,
            started: Lazy::new(SystemTime::now),
        }
    }

    pub fn time_processed(&self, worker: usize, time: u64, probes: &HashMap<usize, ProbeState>) {
        if self.level == MonitoringLevel::None {
            return;
        }
        let elapsed = self.started.elapsed().unwrap_or_default();
        info!("[{worker}] processed time {time} after {elapsed:?}");
        if self.level == MonitoringLevel::All {
            let mut ids: Vec<_> = probes.keys().collect();
            ids.sort();
            for id in ids {
                let probe = probes[id];
                info!(
                    "[{worker}] operator {id}: {} rows, last changed at {:?}",
                    probe.rows, probe.time
                );
            }
        }
    }
}
