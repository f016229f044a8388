//! The fixed pool of worker executors (spec §4.6).
//!
//! Each worker is a dedicated `std::thread`, spawned the same way
//! `pool.rs`'s `start_slot_thread` spawns named `pyexec-pool-slot-{id}`
//! threads in the teacher crate. A worker owns one recyclable
//! [`WorkerContext`] for the lifetime of the thread and loops: block on
//! the queue's next-task selector, fingerprint, check the cache, invoke
//! the generator on a miss, emit a result. Every outbound send is guarded
//! by a concurrent check of the shutdown signal so a stuck dispatcher can
//! never deadlock a worker (spec §4.6, §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;

use crate::cache::LruTtlCache;
use crate::fingerprint;
use crate::invoker::CommandInvoker;
use crate::metrics::MetricsAccumulator;
use crate::pools::{ResultPool, WorkerContextPool};
use crate::queue::TaskQueue;
use crate::registry::ErrorParser;
use crate::types::{BuildError, BuildResult, BuildTask};

/// Recyclable per-worker scratch state: a temp-dir hint, output/error
/// buffers, and an environment map passed to the generator. Not currently
/// threaded into `CommandInvoker` (which owns its own output buffer via
/// the pool), but held here so a future generator integration that needs
/// per-worker scratch space (e.g. a working directory override) has
/// somewhere to put it without adding another pool.
pub struct WorkerContext {
    pub temp_dir_hint: Option<std::path::PathBuf>,
    pub output_buffer: Vec<u8>,
    pub error_buffer: Vec<u8>,
    pub env: HashMap<String, String>,
}

const OUTPUT_BUFFER_RELEASE_THRESHOLD: usize = 1024 * 1024;
const ERROR_BUFFER_RELEASE_THRESHOLD: usize = 64 * 1024;
const ENV_PRESIZE: usize = 8;

impl WorkerContext {
    pub fn new() -> Self {
        Self {
            temp_dir_hint: None,
            output_buffer: Vec::new(),
            error_buffer: Vec::new(),
            env: HashMap::with_capacity(ENV_PRESIZE),
        }
    }

    /// Resets this context for reuse. Buffers whose capacity exceeds the
    /// release threshold are dropped and replaced; smaller buffers are
    /// kept (at their current capacity) and truncated to length 0. The
    /// env map is emptied and preserved.
    pub fn reset(&mut self) {
        self.temp_dir_hint = None;
        if self.output_buffer.capacity() > OUTPUT_BUFFER_RELEASE_THRESHOLD {
            self.output_buffer = Vec::new();
        } else {
            self.output_buffer.clear();
        }
        if self.error_buffer.capacity() > ERROR_BUFFER_RELEASE_THRESHOLD {
            self.error_buffer = Vec::new();
        } else {
            self.error_buffer.clear();
        }
        self.env.clear();
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, read-only state every worker thread needs. Built once by the
/// orchestrator and cloned (as an `Arc`) into each spawned thread.
pub struct WorkerShared {
    pub queue: Arc<TaskQueue>,
    pub cache: Arc<LruTtlCache>,
    pub metrics: Arc<MetricsAccumulator>,
    pub invoker: Arc<CommandInvoker>,
    pub error_parser: Arc<dyn ErrorParser>,
    pub result_pool: Arc<ResultPool>,
    pub context_pool: Arc<WorkerContextPool>,
    pub build_timeout: std::time::Duration,
    pub active_workers: Arc<AtomicU64>,
}

/// Runs the worker loop for one thread until `shutdown` fires. See spec
/// §4.6 for the numbered steps this mirrors.
pub fn run_worker(shared: Arc<WorkerShared>, shutdown: Receiver<()>) {
    let mut ctx = shared.context_pool.acquire();
    loop {
        let task = match shared.queue.next_task(&shutdown) {
            Some(task) => task,
            None => break,
        };

        record_parallelism(&shared, 1);
        let result = build_one(&shared, &task, &shutdown);
        record_parallelism(&shared, -1);

        shared.metrics.record_build(&result);
        emit_result(&shared, result);

        ctx.reset();
    }
    shared.context_pool.release(ctx);
}

fn record_parallelism(shared: &WorkerShared, delta: i64) {
    let current = if delta > 0 {
        shared.active_workers.fetch_add(delta as u64, Ordering::Relaxed) + delta as u64
    } else {
        shared
            .active_workers
            .fetch_sub((-delta) as u64, Ordering::Relaxed)
            .saturating_sub((-delta) as u64)
    };
    shared.metrics.record_parallel_processing(current);
}

fn build_one(shared: &WorkerShared, task: &BuildTask, shutdown: &Receiver<()>) -> BuildResult {
    let start = Instant::now();
    let mut result = shared.result_pool.acquire();
    result.component_name = task.descriptor.name.clone();
    result.task_id = Some(task.task_id);

    // Cancellation fast-path: shutdown signalled before real work begins.
    if shutdown.try_recv().is_ok() || is_shutdown_disconnected(shutdown) {
        result.error = Some(BuildError::Cancellation);
        result.duration_ns = start.elapsed().as_nanos() as u64;
        return result;
    }

    let fp = fingerprint::fingerprint(&task.descriptor, &shared.cache);
    result.fingerprint = fp.clone();

    if shutdown.try_recv().is_ok() || is_shutdown_disconnected(shutdown) {
        result.error = Some(BuildError::Cancellation);
        result.duration_ns = start.elapsed().as_nanos() as u64;
        return result;
    }

    if let Some(artifact) = shared.cache.get(&fp) {
        result.artifact = artifact;
        result.cache_hit = true;
        result.duration_ns = start.elapsed().as_nanos() as u64;
        return result;
    }

    match shared.invoker.compile(shared.build_timeout, &task.descriptor) {
        Ok(artifact) => {
            shared.cache.set(&fp, artifact.clone());
            result.artifact = artifact;
        }
        Err(err @ BuildError::Execution { .. }) => {
            if let BuildError::Execution { raw_output, .. } = &err {
                result.parsed_errors = shared.error_parser.parse(&task.descriptor.name, raw_output.as_bytes());
            }
            result.error = Some(err);
        }
        Err(err) => {
            result.error = Some(err);
        }
    }

    result.duration_ns = start.elapsed().as_nanos() as u64;
    result
}

fn is_shutdown_disconnected(shutdown: &Receiver<()>) -> bool {
    matches!(shutdown.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected))
}

/// Publishes `result` onto the results channel. `publish_result` is
/// already non-blocking (it drops and records rather than stalling on a
/// full channel), so a stuck dispatcher can never deadlock a worker here,
/// including one draining its backlog during an orderly stop.
fn emit_result(shared: &WorkerShared, result: BuildResult) {
    shared.queue.publish_result(result);
}
