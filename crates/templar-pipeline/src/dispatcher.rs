//! The single-consumer result dispatcher (spec §4.7).
//!
//! One dedicated thread, spawned in the same style as a worker thread,
//! drains the results channel, formats a human-readable status line, and
//! fans callbacks out synchronously in registration order. Callbacks are
//! expected to be cheap; per spec, the dispatcher does not itself retry,
//! rate-limit, or isolate a misbehaving one. Metrics recording for a
//! build's outcome happens once, on the worker side (spec §4.6 step 7 /
//! §4.8), before the result is published — the dispatcher's job is
//! purely status-line emission and callback fan-out.

use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::queue::TaskQueue;
use crate::types::BuildResult;

/// A registered callback invoked once per dispatched [`BuildResult`].
pub type ResultCallback = Box<dyn Fn(&BuildResult) + Send + Sync>;

/// Formats the dispatcher's human-readable status line for one result.
pub fn format_status_line(result: &BuildResult) -> String {
    let millis = result.duration_ns as f64 / 1_000_000.0;
    match &result.error {
        None if result.cache_hit => {
            format!("{}: cached ({millis:.2}ms)", result.component_name)
        }
        None => format!("{}: success ({millis:.2}ms)", result.component_name),
        Some(err) => format!(
            "{}: failed ({millis:.2}ms) — {}",
            result.component_name,
            describe_error(err)
        ),
    }
}

fn describe_error(err: &crate::types::BuildError) -> String {
    use crate::types::BuildError;
    match err {
        BuildError::Validation { reason } => format!("validation error: {reason}"),
        BuildError::Timeout { limit_ns } => {
            format!("timed out after {}ms", limit_ns / 1_000_000)
        }
        BuildError::Execution { exit_code, .. } => {
            format!("generator exited with code {exit_code:?}")
        }
        BuildError::Cancellation => "cancelled by shutdown".to_string(),
    }
}

/// Drains `queue`'s results channel, invoking every registered callback
/// synchronously (in registration order) for each result, until
/// `shutdown` fires and the channel has been fully drained. See
/// [`TaskQueue::next_result`] for the drain-then-stop contract this
/// relies on.
pub fn run_dispatcher(
    queue: Arc<TaskQueue>,
    shutdown: Receiver<()>,
    callbacks: Arc<Vec<ResultCallback>>,
) {
    while let Some(result) = queue.next_result(&shutdown) {
        tracing::info!(component = %result.component_name, "{}", format_status_line(&result));
        for callback in callbacks.iter() {
            callback(&result);
        }
    }
    tracing::debug!("dispatcher drained and exiting");
}
