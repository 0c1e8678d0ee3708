use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::runner_unit::RunnerUnit;
use crate::spawn::AsyncProcessStarter;

/// Fans a flat list of runnable units out through a dispatch mechanism with
/// a per-call item limit.
///
/// A node directly dispatches at most `batch_size` sub-batches plus
/// `batch_size` leaf units; everything beyond that nests. The tree is an
/// explicit data structure so the whole batch — not just each leaf —
/// survives serialization across the out-of-band boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncBatchStarter {
    batch_size: usize,
    sub_batches: Vec<AsyncBatchStarter>,
    runners: Vec<RunnerUnit>,
}

impl AsyncBatchStarter {
    /// Build a balanced tree over `units` for the given batch size.
    pub fn new(batch_size: usize, units: Vec<RunnerUnit>) -> Self {
        let batch_size = batch_size.max(1);
        let levels = nesting_levels(batch_size, units.len());
        Self::build(batch_size, levels, units)
    }

    fn build(batch_size: usize, levels: u32, mut units: Vec<RunnerUnit>) -> Self {
        if levels == 0 {
            return Self {
                batch_size,
                sub_batches: Vec::new(),
                runners: units,
            };
        }

        // Only as many sub-batches as needed for the remainder to ride as
        // direct leaves; each sub-batch is filled to capacity.
        let sub_capacity = capacity(batch_size, levels - 1);
        let mut wanted = 0usize;
        while units.len().saturating_sub(wanted * sub_capacity) > batch_size {
            wanted += 1;
        }

        let mut sub_batches = Vec::with_capacity(wanted);
        for _ in 0..wanted {
            let take = sub_capacity.min(units.len());
            let chunk: Vec<RunnerUnit> = units.drain(..take).collect();
            sub_batches.push(Self::new(batch_size, chunk));
        }

        Self {
            batch_size,
            sub_batches,
            runners: units,
        }
    }

    /// Dispatch every child through the starter: sub-batches ride out as
    /// `RunBatch` units and re-run themselves on the other side.
    pub fn run(&self, starter: &dyn AsyncProcessStarter) -> Result<(), QueueError> {
        for sub in &self.sub_batches {
            starter.start(RunnerUnit::RunBatch { batch: sub.clone() })?;
        }
        for unit in &self.runners {
            starter.start(unit.clone())?;
        }
        Ok(())
    }

    /// Tree depth below this node. 0 means all units dispatch directly.
    pub fn max_nesting_levels(&self) -> u32 {
        self.sub_batches
            .iter()
            .map(|sub| sub.max_nesting_levels() + 1)
            .max()
            .unwrap_or(0)
    }

    /// Best-effort upper bound on how long a synchronous caller should wait
    /// for all nested dispatches to land: one request round per tree level.
    pub fn wait_time(&self, request_timeout: Duration) -> Duration {
        request_timeout * (self.max_nesting_levels() + 1)
    }

    /// Leaf units in dispatch order, flattened across the tree.
    pub fn leaves(&self) -> Vec<&RunnerUnit> {
        let mut out = Vec::new();
        for sub in &self.sub_batches {
            out.extend(sub.leaves());
        }
        out.extend(self.runners.iter());
        out
    }
}

/// Units a tree of the given depth can hold: a node carries `batch_size`
/// full sub-batches plus `batch_size` direct leaves.
fn capacity(batch_size: usize, levels: u32) -> usize {
    let mut cap = batch_size;
    for _ in 0..levels {
        cap = batch_size.saturating_mul(cap).saturating_add(batch_size);
    }
    cap
}

/// Smallest depth whose capacity covers `total` units.
fn nesting_levels(batch_size: usize, total: usize) -> u32 {
    let mut levels = 0;
    while capacity(batch_size, levels) < total {
        levels += 1;
    }
    levels
}
