//! The pipeline orchestrator (spec §4.9): composes the queue, worker
//! pool, hash provider, cache, object pools, and dispatcher, and owns
//! their lifecycle.
//!
//! `start` spawns N named worker threads and one dispatcher thread, the
//! same way `InterpreterPool::new` in the teacher crate blocks until
//! every slot thread reports ready before returning — here, because
//! workers have no warm-up phase, "ready" is simply "spawned". `stop`/
//! `stop_with_timeout` close a single shutdown broadcast channel (closing
//! a `crossbeam_channel::bounded(0)` sender disconnects every receiver
//! clone simultaneously, which is how one signal reaches every worker and
//! the dispatcher at once) and then join every thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::cache::LruTtlCache;
use crate::config::PipelineConfig;
use crate::dispatcher::{run_dispatcher, ResultCallback};
use crate::error::PipelineError;
use crate::invoker::CommandInvoker;
use crate::metrics::MetricsAccumulator;
use crate::pools::{ResultPool, WorkerContextPool};
use crate::queue::TaskQueue;
use crate::registry::{ErrorParser, HeuristicErrorParser};
use crate::types::{BuildTask, ComponentDescriptor, MetricsSnapshot, HIGH_PRIORITY, NORMAL_PRIORITY};
use crate::worker::{run_worker, WorkerShared};

/// Composes every component of the build pipeline and owns its threads.
///
/// Construct with [`Orchestrator::new`], call [`Orchestrator::start`]
/// once, submit work with [`Orchestrator::submit`] /
/// [`Orchestrator::submit_priority`], and shut down with
/// [`Orchestrator::stop`] or [`Orchestrator::stop_with_timeout`].
pub struct Orchestrator {
    config: PipelineConfig,
    queue: Arc<TaskQueue>,
    cache: Arc<LruTtlCache>,
    metrics: Arc<MetricsAccumulator>,
    invoker: Arc<CommandInvoker>,
    error_parser: Arc<dyn ErrorParser>,
    result_pool: Arc<ResultPool>,
    context_pool: Arc<WorkerContextPool>,
    callbacks: Arc<Vec<ResultCallback>>,
    active_workers: Arc<AtomicU64>,
    next_task_id: AtomicU64,
    started: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Builds an [`Orchestrator`] with a fluent, teacher-style configuration
/// surface (mirroring `EngineConfig`'s `with_*` builder methods in the
/// pack's CI-executor example), before [`OrchestratorBuilder::build`]
/// is invoked exactly once at startup.
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    error_parser: Option<Arc<dyn ErrorParser>>,
    callbacks: Vec<ResultCallback>,
}

impl OrchestratorBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config, error_parser: None, callbacks: Vec::new() }
    }

    pub fn with_error_parser(mut self, parser: Arc<dyn ErrorParser>) -> Self {
        self.error_parser = Some(parser);
        self
    }

    /// Registers a callback invoked, in registration order, once per
    /// dispatched result.
    pub fn with_callback(mut self, callback: ResultCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator::new(self.config, self.error_parser, self.callbacks)
    }
}

impl Orchestrator {
    fn new(
        config: PipelineConfig,
        error_parser: Option<Arc<dyn ErrorParser>>,
        callbacks: Vec<ResultCallback>,
    ) -> Self {
        let metrics = Arc::new(MetricsAccumulator::new());
        let queue = Arc::new(TaskQueue::new(
            config.task_queue_capacity,
            config.priority_queue_capacity,
            config.results_queue_capacity,
            Arc::clone(&metrics),
        ));
        let cache = Arc::new(LruTtlCache::new(config.cache_max_bytes, config.cache_ttl));
        let invoker = Arc::new(
            CommandInvoker::new(
                config.allowed_commands.first().cloned().unwrap_or_default(),
                config.generator_args.clone(),
            )
            .with_allowed_commands(config.allowed_commands.clone()),
        );
        Self {
            result_pool: Arc::new(ResultPool::new(config.resolved_worker_count() * 4)),
            context_pool: Arc::new(WorkerContextPool::new(config.resolved_worker_count())),
            queue,
            cache,
            metrics,
            invoker,
            error_parser: error_parser.unwrap_or_else(|| Arc::new(HeuristicErrorParser)),
            callbacks: Arc::new(callbacks),
            active_workers: Arc::new(AtomicU64::new(0)),
            next_task_id: AtomicU64::new(0),
            started: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Spawns `config.resolved_worker_count()` worker threads and one
    /// dispatcher thread. Returns [`PipelineError::AlreadyStarted`] if
    /// called twice without an intervening `stop`.
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::AlreadyStarted);
        }

        // A shutdown broadcast: closing `shutdown_tx` (dropping the last
        // `Sender`) disconnects every clone of `shutdown_rx` at once, so
        // one `stop()` call reaches every worker and the dispatcher.
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let shared = Arc::new(WorkerShared {
            queue: Arc::clone(&self.queue),
            cache: Arc::clone(&self.cache),
            metrics: Arc::clone(&self.metrics),
            invoker: Arc::clone(&self.invoker),
            error_parser: Arc::clone(&self.error_parser),
            result_pool: Arc::clone(&self.result_pool),
            context_pool: Arc::clone(&self.context_pool),
            build_timeout: self.config.resolved_build_timeout(),
            active_workers: Arc::clone(&self.active_workers),
        });

        let mut handles = Vec::with_capacity(self.config.resolved_worker_count() + 1);
        for id in 0..self.config.resolved_worker_count() {
            let shared = Arc::clone(&shared);
            let shutdown_rx = shutdown_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("templar-pipeline-worker-{id}"))
                .spawn(move || {
                    tracing::info!(worker_id = id, "worker starting");
                    run_worker(shared, shutdown_rx);
                    tracing::info!(worker_id = id, "worker stopped");
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        let queue = Arc::clone(&self.queue);
        let callbacks = Arc::clone(&self.callbacks);
        let dispatcher_shutdown_rx = shutdown_rx.clone();
        let dispatcher_handle = std::thread::Builder::new()
            .name("templar-pipeline-dispatcher".to_string())
            .spawn(move || {
                tracing::info!("dispatcher starting");
                run_dispatcher(queue, dispatcher_shutdown_rx, callbacks);
                tracing::info!("dispatcher stopped");
            })
            .expect("failed to spawn dispatcher thread");
        handles.push(dispatcher_handle);

        *self.shutdown_tx.lock().expect("shutdown_tx lock poisoned") = Some(shutdown_tx);
        *self.handles.lock().expect("handles lock poisoned") = handles;
        tracing::info!(workers = self.config.resolved_worker_count(), "pipeline started");
        Ok(())
    }

    /// Enqueues a normal-priority build for `descriptor`. Never blocks;
    /// see [`TaskQueue::enqueue`] for drop semantics on a full queue.
    pub fn submit(&self, descriptor: Arc<ComponentDescriptor>) -> Result<(), PipelineError> {
        let task = BuildTask::new(descriptor, NORMAL_PRIORITY, self.next_task_id());
        self.queue.enqueue(task)
    }

    /// Enqueues a high-priority build for `descriptor`. Strictly
    /// preferred by workers over normal-priority submissions.
    pub fn submit_priority(&self, descriptor: Arc<ComponentDescriptor>) -> Result<(), PipelineError> {
        let task = BuildTask::new(descriptor, HIGH_PRIORITY, self.next_task_id());
        self.queue.enqueue_priority(task)
    }

    fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns an independent copy of the current metrics.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    /// Cancels every worker and the dispatcher, then blocks until all of
    /// them have exited. Returns [`PipelineError::NotStarted`] if `start`
    /// was never called.
    pub fn stop(&self) -> Result<(), PipelineError> {
        self.signal_shutdown()?;
        self.join_all();
        Ok(())
    }

    /// Same as [`Self::stop`], but returns
    /// [`PipelineError::ShutdownTimeout`] if the threads have not all
    /// exited within `timeout`. The shutdown signal has already been
    /// sent regardless of the outcome — a timed-out caller may retry
    /// `stop_with_timeout`/`stop` to keep waiting, rather than leaking
    /// the in-progress shutdown.
    pub fn stop_with_timeout(&self, timeout: Duration) -> Result<(), PipelineError> {
        self.signal_shutdown()?;

        let deadline = Instant::now() + timeout;
        let mut handles = self.handles.lock().expect("handles lock poisoned");
        let mut remaining = Vec::new();
        for handle in handles.drain(..) {
            if Instant::now() >= deadline {
                remaining.push(handle);
                continue;
            }
            // `JoinHandle` has no `join_timeout`; poll `is_finished` until
            // the deadline, then join unconditionally (which may still
            // block past `deadline` for a single stuck thread, but every
            // other thread was already given its fair share of the
            // window).
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                remaining.push(handle);
            }
        }

        if remaining.is_empty() {
            tracing::info!("pipeline stopped within timeout");
            Ok(())
        } else {
            *handles = remaining;
            tracing::warn!("pipeline shutdown exceeded the configured timeout");
            Err(PipelineError::ShutdownTimeout)
        }
    }

    fn signal_shutdown(&self) -> Result<(), PipelineError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(PipelineError::NotStarted);
        }
        self.queue.close();
        // Dropping the sender (if this is the first call) disconnects
        // every shutdown_rx clone. A second `stop` call after the first
        // already took it finds `None` and is a harmless no-op.
        let _ = self.shutdown_tx.lock().expect("shutdown_tx lock poisoned").take();
        Ok(())
    }

    fn join_all(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().expect("handles lock poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn descriptor(path: &std::path::Path, name: &str) -> Arc<ComponentDescriptor> {
        Arc::new(ComponentDescriptor {
            name: name.to_string(),
            source_path: path.to_path_buf(),
            package: "pkg".to_string(),
            params: Vec::new(),
        })
    }

    fn noop_config() -> PipelineConfig {
        PipelineConfig {
            worker_count: 2,
            allowed_commands: vec!["true".to_string()],
            generator_args: Vec::new(),
            build_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    #[test]
    fn test_start_twice_returns_already_started() {
        let orchestrator = OrchestratorBuilder::new(noop_config()).build();
        orchestrator.start().unwrap();
        let err = orchestrator.start().unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyStarted));
        orchestrator.stop().unwrap();
    }

    #[test]
    fn test_stop_without_start_returns_not_started() {
        let orchestrator = OrchestratorBuilder::new(noop_config()).build();
        assert!(matches!(orchestrator.stop(), Err(PipelineError::NotStarted)));
    }

    #[test]
    fn test_submit_and_stop_processes_a_build_and_invokes_callback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("widget.tmpl");
        std::fs::write(&path, b"hello").unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let orchestrator = OrchestratorBuilder::new(noop_config())
            .with_callback(Box::new(move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .build();

        orchestrator.start().unwrap();
        orchestrator.submit(descriptor(&path, "widget")).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        orchestrator.stop().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let snap = orchestrator.metrics_snapshot();
        assert_eq!(snap.total_builds, 1);
        assert_eq!(snap.successful_builds, 1);
    }

    #[test]
    fn test_shutdown_is_bounded_under_timeout() {
        let orchestrator = OrchestratorBuilder::new(PipelineConfig {
            worker_count: 4,
            allowed_commands: vec!["true".to_string()],
            generator_args: Vec::new(),
            ..Default::default()
        })
        .build();
        orchestrator.start().unwrap();

        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            let path = dir.path().join(format!("c{i}.tmpl"));
            std::fs::write(&path, format!("c{i}")).unwrap();
            let _ = orchestrator.submit(descriptor(&path, &format!("c{i}")));
        }

        let started = Instant::now();
        let result = orchestrator.stop_with_timeout(Duration::from_secs(1));
        assert!(started.elapsed() <= Duration::from_millis(1500));
        assert!(result.is_ok(), "expected a clean stop within the timeout, got {result:?}");
    }

    #[test]
    fn test_cache_hit_speeds_up_second_build() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("widget.tmpl");
        std::fs::write(&path, b"hello").unwrap();

        let results = Arc::new(Mutex::new(Vec::new()));
        let results_clone = Arc::clone(&results);
        let orchestrator = OrchestratorBuilder::new(PipelineConfig {
            worker_count: 1,
            allowed_commands: vec!["true".to_string()],
            generator_args: Vec::new(),
            ..Default::default()
        })
        .with_callback(Box::new(move |r| results_clone.lock().unwrap().push(r.clone())))
        .build();
        orchestrator.start().unwrap();

        let d = descriptor(&path, "widget");
        orchestrator.submit(Arc::clone(&d)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while results.lock().unwrap().len() < 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        orchestrator.submit(d).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while results.lock().unwrap().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        orchestrator.stop().unwrap();

        let collected = results.lock().unwrap();
        assert_eq!(collected.len(), 2);
        assert!(!collected[0].cache_hit, "first build must be a miss");
        assert!(collected[1].cache_hit, "second build of an unchanged file must be a cache hit");
    }
}
