//! Pair task scheduling with resumption.
//!
//! Tasks run in canonical order (ascending `i`, then `j`). A task whose block
//! already exists is skipped, so an interrupted run picks up where it left
//! off. The primary subset's graphs stay loaded across consecutive tasks
//! sharing the same `i`; the secondary subset is loaded per task.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::{KernelMatrixError, Result};
use crate::graph::GraphRecord;
use crate::loader::load_graphs;
use crate::partition::Partition;
use crate::store::{BlockHeader, BlockStore, KernelBlock};
use crate::wl::KernelComputer;

/// Unit of work: the pooled kernel over subsets `i` and `j`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairTask {
    pub i: usize,
    pub j: usize,
}

impl fmt::Display for PairTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.i, self.j)
    }
}

/// All tasks for `k` subsets in canonical order.
///
/// For `k >= 2` these are the `k(k-1)/2` pairs `i < j`. A single subset has
/// no partner, so its only task is `(0, 0)`.
pub fn pair_tasks(k: usize) -> Vec<PairTask> {
    if k == 1 {
        return vec![PairTask { i: 0, j: 0 }];
    }
    (0..k)
        .flat_map(|i| (i + 1..k).map(move |j| PairTask { i, j }))
        .collect()
}

/// Selects every `count`-th task starting at `index`, so separate machines
/// can split the task space without overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskShard {
    index: usize,
    count: usize,
}

impl Default for TaskShard {
    fn default() -> Self {
        Self { index: 0, count: 1 }
    }
}

impl TaskShard {
    pub fn new(index: usize, count: usize) -> Result<Self> {
        if count == 0 || index >= count {
            return Err(KernelMatrixError::Config(format!(
                "invalid shard {index} of {count}"
            )));
        }
        Ok(Self { index, count })
    }

    pub fn selects(&self, position: usize) -> bool {
        position % self.count == self.index
    }
}

#[derive(Debug)]
pub struct TaskFailure {
    pub task: PairTask,
    pub error: KernelMatrixError,
}

/// Outcome of one scheduler run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub computed: Vec<PairTask>,
    pub skipped: Vec<PairTask>,
    pub failed: Vec<TaskFailure>,
    pub timings: Vec<(PairTask, Duration)>,
}

impl RunReport {
    pub fn total_time(&self) -> Duration {
        self.timings.iter().map(|(_, d)| *d).sum()
    }

    pub fn average_time(&self) -> Option<Duration> {
        let n = u32::try_from(self.timings.len()).ok().filter(|&n| n > 0)?;
        Some(self.total_time() / n)
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Scheduler<'a, C: KernelComputer> {
    partition: &'a Partition,
    store: &'a BlockStore,
    computer: &'a C,
    fingerprint: [u8; 32],
    shard: TaskShard,
}

impl<'a, C: KernelComputer> Scheduler<'a, C> {
    pub fn new(
        partition: &'a Partition,
        store: &'a BlockStore,
        computer: &'a C,
        fingerprint: [u8; 32],
    ) -> Self {
        Self {
            partition,
            store,
            computer,
            fingerprint,
            shard: TaskShard::default(),
        }
    }

    pub fn with_shard(mut self, shard: TaskShard) -> Self {
        self.shard = shard;
        self
    }

    /// Tasks in this shard, canonical order.
    pub fn tasks(&self) -> Vec<PairTask> {
        pair_tasks(self.partition.k())
            .into_iter()
            .enumerate()
            .filter(|(pos, _)| self.shard.selects(*pos))
            .map(|(_, task)| task)
            .collect()
    }

    /// Tasks in this shard without a stored block.
    pub fn pending(&self) -> Vec<PairTask> {
        self.tasks()
            .into_iter()
            .filter(|t| !self.store.exists(t.i, t.j))
            .collect()
    }

    /// Run every pending task in order. Task failures are collected, not raised.
    pub fn run(&self) -> RunReport {
        let mut report = RunReport::default();
        let mut primary: Option<(usize, Vec<GraphRecord>)> = None;

        for task in self.tasks() {
            if self.store.exists(task.i, task.j) {
                debug!(i = task.i, j = task.j, "Block exists, skipping");
                report.skipped.push(task);
                continue;
            }

            let start = Instant::now();
            if primary.as_ref().map(|(idx, _)| *idx) != Some(task.i) {
                primary = None;
                match self.load_subset(task.i) {
                    Ok(graphs) => primary = Some((task.i, graphs)),
                    Err(e) => {
                        error!(i = task.i, j = task.j, error = %e, "Task failed");
                        report.failed.push(TaskFailure { task, error: e });
                        continue;
                    }
                }
            }
            let Some((_, graphs)) = primary.as_mut() else {
                continue;
            };

            match self.run_task(task, graphs) {
                Ok(()) => {
                    let elapsed = start.elapsed();
                    info!(
                        i = task.i,
                        j = task.j,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Task complete"
                    );
                    report.computed.push(task);
                    report.timings.push((task, elapsed));
                }
                Err(e) => {
                    error!(i = task.i, j = task.j, error = %e, "Task failed");
                    report.failed.push(TaskFailure { task, error: e });
                }
            }
        }

        if let Some(avg) = report.average_time() {
            info!(
                computed = report.computed.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                total_ms = report.total_time().as_millis() as u64,
                average_ms = avg.as_millis() as u64,
                "Scheduler finished"
            );
        } else {
            info!(
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "Scheduler finished with nothing computed"
            );
        }
        report
    }

    fn load_subset(&self, s: usize) -> Result<Vec<GraphRecord>> {
        info!(subset = s, files = self.partition.size(s), "Loading subset");
        load_graphs(self.partition.subset(s)).into_complete(s)
    }

    /// Load `j`, compute over `primary ++ j`, persist. `primary` is restored
    /// to its original length whatever the outcome.
    fn run_task(&self, task: PairTask, primary: &mut Vec<GraphRecord>) -> Result<()> {
        let rows_i = primary.len();
        let rows_j = if task.i == task.j {
            0
        } else {
            let secondary = self.load_subset(task.j)?;
            let n = secondary.len();
            primary.extend(secondary);
            n
        };
        info!(i = task.i, j = task.j, graphs = rows_i + rows_j, "Computing kernel block");

        let computed = self.computer.compute(primary);
        primary.truncate(rows_i);
        let matrix = computed.map_err(|e| KernelMatrixError::Kernel {
            task,
            reason: e.to_string(),
        })?;
        if matrix.dim() != rows_i + rows_j {
            return Err(KernelMatrixError::Kernel {
                task,
                reason: format!(
                    "kernel returned {0}x{0} for {1} graphs",
                    matrix.dim(),
                    rows_i + rows_j
                ),
            });
        }

        let block = KernelBlock {
            header: BlockHeader {
                i: task.i,
                j: task.j,
                rows_i,
                rows_j,
                fingerprint: self.fingerprint,
            },
            matrix,
        };
        self.store.put(&block)?;
        Ok(())
    }
}
