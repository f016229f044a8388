//! Foundational public types for the templar-pipeline library.
//!
//! This module defines the core data structures flowing through the build
//! pipeline:
//! - [`ComponentDescriptor`] — external input identifying a thing to build.
//! - [`BuildTask`] — an enqueued intent to build a descriptor.
//! - [`BuildResult`] — the outcome of one build.
//! - [`BuildError`] — structured error variants carried inside a result.
//! - [`ParsedError`] — one structured diagnostic produced by an error parser.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// External input describing one component to build.
///
/// Immutable once observed by the core; owned externally (by the component
/// registry) and treated as read-only here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDescriptor {
    /// Logical component name, used for diagnostics and log correlation.
    pub name: String,
    /// Absolute path to the source file on disk.
    pub source_path: std::path::PathBuf,
    /// The package that owns this component.
    pub package: String,
    /// Opaque parameter list passed through to the generator untouched.
    pub params: Vec<String>,
}

/// Priority ordinal for a [`BuildTask`]. Higher values are serviced first.
pub type Priority = u8;

/// The default priority assigned to normal (non-priority) submissions.
pub const NORMAL_PRIORITY: Priority = 0;

/// The default priority assigned to submissions made via `SubmitPriority`.
pub const HIGH_PRIORITY: Priority = 10;

/// An enqueued intent to build a component.
///
/// Created by the orchestrator on submit; consumed exactly once by a worker.
#[derive(Debug, Clone)]
pub struct BuildTask {
    /// Shared reference to the descriptor being built.
    pub descriptor: Arc<ComponentDescriptor>,
    /// Priority ordinal; higher is serviced first.
    pub priority: Priority,
    /// Wall-clock time the task was created (enqueue time), for diagnostics.
    pub created_at: Instant,
    /// Monotonic id assigned at enqueue time, for log correlation only.
    /// Participates in no ordering guarantee.
    pub task_id: u64,
}

impl BuildTask {
    pub fn new(descriptor: Arc<ComponentDescriptor>, priority: Priority, task_id: u64) -> Self {
        Self {
            descriptor,
            priority,
            created_at: Instant::now(),
            task_id,
        }
    }
}

/// The outcome of building one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    /// Logical component name (copied out of the descriptor for convenience).
    pub component_name: String,
    /// Produced artifact bytes. May be empty on failure.
    pub artifact: Vec<u8>,
    /// `None` on success; `Some(e)` if the build failed or was cancelled.
    pub error: Option<BuildError>,
    /// Structured diagnostics parsed from generator output. Empty unless
    /// `error` is `Some(BuildError::Execution { .. })`.
    pub parsed_errors: Vec<ParsedError>,
    /// Wall-clock duration of this build attempt, in nanoseconds.
    pub duration_ns: u64,
    /// `true` if the artifact came from the cache rather than a fresh
    /// generator invocation.
    pub cache_hit: bool,
    /// The fingerprint of the source file at build time.
    pub fingerprint: String,
    /// Correlation id copied from the originating [`BuildTask`].
    pub task_id: Option<u64>,
}

impl BuildResult {
    /// Resets this result to a blank, reusable state in place, for the
    /// object pool. Every field is cleared but retained allocations (the
    /// `artifact` and `parsed_errors` vectors) are kept at their current
    /// capacity.
    pub fn reset(&mut self) {
        self.component_name.clear();
        self.artifact.clear();
        self.error = None;
        self.parsed_errors.clear();
        self.duration_ns = 0;
        self.cache_hit = false;
        self.fingerprint.clear();
        self.task_id = None;
    }
}

impl Default for BuildResult {
    fn default() -> Self {
        Self {
            component_name: String::new(),
            artifact: Vec::new(),
            error: None,
            parsed_errors: Vec::new(),
            duration_ns: 0,
            cache_hit: false,
            fingerprint: String::new(),
            task_id: None,
        }
    }
}

/// Structured error variants produced when a build fails.
///
/// Serialized with an internally-tagged `"type"` discriminator so JSON
/// consumers can switch on `error.type` without a wrapper object. This enum
/// is always *constructed* and stored as data inside a [`BuildResult`] — it
/// is never raised via `?`, so it does not implement `std::error::Error`
/// (compare [`crate::error::PipelineError`], which is raised via `?`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BuildError {
    /// The configured command or one of its arguments failed validation.
    /// Never retried.
    Validation {
        /// Human-readable reason the validator rejected the invocation.
        reason: String,
    },

    /// The child process exceeded the per-build deadline.
    Timeout {
        /// The deadline that was exceeded, in nanoseconds.
        limit_ns: u64,
    },

    /// The child process exited non-zero.
    Execution {
        /// The exit code, if the process actually exited (as opposed to
        /// being killed by a signal).
        exit_code: Option<i32>,
        /// The combined stdout+stderr captured from the child, verbatim.
        raw_output: String,
    },

    /// Shutdown was signalled before or during this build.
    Cancellation,
}

/// One structured diagnostic record produced by an [`crate::registry::ErrorParser`]
/// from a failing build's combined output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedError {
    /// Coarse classification of the diagnostic (e.g. `"syntax"`, `"type"`).
    pub kind: String,
    /// Severity, e.g. `"error"` or `"warning"`.
    pub severity: String,
    /// The component the diagnostic belongs to.
    pub component: String,
    /// Source file the diagnostic points at, if known.
    pub file: Option<String>,
    /// 1-based line number, if known.
    pub line: Option<u32>,
    /// 1-based column number, if known.
    pub column: Option<u32>,
    /// Human-readable diagnostic message.
    pub message: String,
    /// The raw line(s) this record was parsed from.
    pub raw: String,
}

/// Snapshot of the metrics accumulator at a point in time. See
/// [`crate::metrics::MetricsAccumulator::snapshot`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_builds: u64,
    pub successful_builds: u64,
    pub failed_builds: u64,
    pub cache_hits: u64,
    pub dropped_tasks: u64,
    pub dropped_results: u64,
    pub average_duration_ns: f64,
    pub total_duration_ns: u64,
    pub drop_reasons: std::collections::HashMap<String, u64>,
    pub current_parallelism: u64,
    pub peak_parallelism: u64,
}

impl MetricsSnapshot {
    /// Percentage of builds that completed successfully, in `[0, 100]`.
    /// Returns `0.0` when no builds have completed yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_builds == 0 {
            return 0.0;
        }
        (self.successful_builds as f64 / self.total_builds as f64) * 100.0
    }

    /// Percentage of builds served from cache, in `[0, 100]`.
    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_builds == 0 {
            return 0.0;
        }
        (self.cache_hits as f64 / self.total_builds as f64) * 100.0
    }
}
