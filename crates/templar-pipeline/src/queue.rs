//! The priority-aware task queue and the results channel back to the
//! dispatcher.
//!
//! Built on `crossbeam_channel` rather than `std::sync::mpsc`: the teacher
//! crate's channels (`pool.rs`, `timeout.rs`) are simple one-shot response
//! channels with a single receiver, but a worker here must wait on two
//! distinct task channels at once with a strict preference order, which
//! `crossbeam_channel::Select` expresses directly.
//!
//! Every enqueue and publish path here is non-blocking. A full channel
//! means a drop, recorded in the metrics accumulator, never a block —
//! the submitter (and the worker on the result-publish path) must never
//! stall behind a slow consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Select, Sender, TrySendError};

use crate::error::PipelineError;
use crate::metrics::MetricsAccumulator;
use crate::types::{BuildResult, BuildTask};

pub struct TaskQueue {
    tasks_tx: Sender<BuildTask>,
    tasks_rx: Receiver<BuildTask>,
    priority_tx: Sender<BuildTask>,
    priority_rx: Receiver<BuildTask>,
    results_tx: Sender<BuildResult>,
    results_rx: Receiver<BuildResult>,
    closed: AtomicBool,
    metrics: Arc<MetricsAccumulator>,
}

impl TaskQueue {
    pub fn new(
        tasks_capacity: usize,
        priority_capacity: usize,
        results_capacity: usize,
        metrics: Arc<MetricsAccumulator>,
    ) -> Self {
        let (tasks_tx, tasks_rx) = bounded(tasks_capacity);
        let (priority_tx, priority_rx) = bounded(priority_capacity);
        let (results_tx, results_rx) = bounded(results_capacity);
        Self {
            tasks_tx,
            tasks_rx,
            priority_tx,
            priority_rx,
            results_tx,
            results_rx,
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Non-blocking send to the normal-priority channel. On full, the task
    /// spills over into the priority channel; only when both are full is
    /// the task dropped (recorded with reason `task_queue_full`).
    pub fn enqueue(&self, task: BuildTask) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::QueueClosed);
        }
        match self.tasks_tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                let name = task.descriptor.name.clone();
                if let Err(_) = self.priority_tx.try_send(task) {
                    self.metrics.record_dropped_task(&name, "task_queue_full");
                }
                Ok(())
            }
        }
    }

    /// Non-blocking send to the priority channel. No spillover to `tasks`:
    /// on full, the task is dropped with reason `priority_queue_full`.
    pub fn enqueue_priority(&self, task: BuildTask) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::QueueClosed);
        }
        let name = task.descriptor.name.clone();
        if let Err(_) = self.priority_tx.try_send(task) {
            self.metrics.record_dropped_task(&name, "priority_queue_full");
        }
        Ok(())
    }

    /// Non-blocking send to the results channel. On full, the result is
    /// dropped with reason `results_queue_full` (or the cache-hit variant,
    /// kept distinct so the drop histogram can tell the two apart).
    pub fn publish_result(&self, result: BuildResult) {
        let name = result.component_name.clone();
        let cache_hit = result.cache_hit;
        if let Err(_) = self.results_tx.try_send(result) {
            let reason = if cache_hit {
                "results_queue_full_cache_hit"
            } else {
                "results_queue_full"
            };
            self.metrics.record_dropped_result(&name, reason);
        }
    }

    /// Blocks until a task is available or `shutdown` fires, returning
    /// `None` in the latter case. Checks both task channels non-blockingly
    /// first (priority before normal) so an already-waiting item is never
    /// missed by a `Select` that might otherwise pick either ready
    /// operation arbitrarily; only falls through to a blocking select when
    /// neither channel currently has anything staged.
    pub fn next_task(&self, shutdown: &Receiver<()>) -> Option<BuildTask> {
        loop {
            if let Ok(task) = self.priority_rx.try_recv() {
                return Some(task);
            }
            match shutdown.try_recv() {
                Ok(()) => return None,
                Err(crossbeam_channel::TryRecvError::Disconnected) => return None,
                Err(crossbeam_channel::TryRecvError::Empty) => {}
            }
            if let Ok(task) = self.tasks_rx.try_recv() {
                return Some(task);
            }

            let mut select = Select::new();
            let priority_idx = select.recv(&self.priority_rx);
            let tasks_idx = select.recv(&self.tasks_rx);
            let shutdown_idx = select.recv(shutdown);
            let oper = select.select();

            match oper.index() {
                i if i == priority_idx => {
                    if let Ok(task) = oper.recv(&self.priority_rx) {
                        return Some(task);
                    }
                }
                i if i == tasks_idx => {
                    if let Ok(task) = oper.recv(&self.tasks_rx) {
                        return Some(task);
                    }
                }
                i if i == shutdown_idx => {
                    let _ = oper.recv(shutdown);
                    return None;
                }
                _ => unreachable!("Select only registered three operations"),
            }
        }
    }

    /// Blocks until a completed result is available to hand to the
    /// dispatcher, or `shutdown` fires. Once `shutdown` has fired, this
    /// stops blocking: each subsequent call performs one non-blocking
    /// `try_recv`, so a dispatcher loop calling this repeatedly drains
    /// every already-published result before seeing `None` and exiting —
    /// the orchestrator's bounded-stop guarantee depends on this draining
    /// rather than discarding results that completed just before
    /// shutdown.
    pub fn next_result(&self, shutdown: &Receiver<()>) -> Option<BuildResult> {
        if let Ok(result) = self.results_rx.try_recv() {
            return Some(result);
        }
        let shutdown_fired = matches!(
            shutdown.try_recv(),
            Ok(()) | Err(crossbeam_channel::TryRecvError::Disconnected)
        );
        if shutdown_fired {
            return self.results_rx.try_recv().ok();
        }

        let mut select = Select::new();
        let results_idx = select.recv(&self.results_rx);
        let shutdown_idx = select.recv(shutdown);
        let oper = select.select();
        match oper.index() {
            i if i == results_idx => oper.recv(&self.results_rx).ok(),
            i if i == shutdown_idx => {
                let _ = oper.recv(shutdown);
                self.results_rx.try_recv().ok()
            }
            _ => unreachable!("Select only registered two operations"),
        }
    }

    /// Marks the queue closed: subsequent `enqueue`/`enqueue_priority`
    /// calls return `Err(PipelineError::QueueClosed)`. Does not itself
    /// disconnect the channels — the orchestrator drops its sender handles
    /// separately to let in-flight consumers drain naturally.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
