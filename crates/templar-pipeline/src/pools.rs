//! Object pools for the pipeline's hot-path allocations.
//!
//! Follows the teacher crate's free-list-with-reset discipline
//! (`InterpreterPool`'s queue of ready slots, the output-buffer sizing
//! policy) but without thread affinity: none of `BuildResult`, `BuildTask`,
//! or the byte buffers pooled here are pinned to a thread, so a plain
//! `Mutex<Vec<T>>` free list is enough — there is no need for
//! `InterpreterPool`'s dedicated-thread-per-slot design, which exists
//! there only because `PyInterp` is not `Send`.
//!
//! Every `acquire` and `release` resets the object, so correctness holds
//! regardless of which side a caller forgets to reset (the invariant the
//! spec calls out explicitly).

use std::sync::Mutex;

use crate::types::BuildResult;
use crate::worker::WorkerContext;

/// Output buffers start pre-sized to this capacity...
const BUFFER_PRESIZE: usize = 64 * 1024;
/// ...and are discarded rather than recycled once they grow past this.
const BUFFER_DISCARD_THRESHOLD: usize = 1024 * 1024;

/// String-builder buffers start pre-sized to this capacity...
const STRING_BUFFER_PRESIZE: usize = 4 * 1024;
/// ...and are truncated back to this capacity on return, never larger.
const STRING_BUFFER_CAP_ON_RETURN: usize = 64 * 1024;

/// A generic bounded free list with reset-on-both-ends semantics.
struct FreeList<T> {
    items: Mutex<Vec<T>>,
    max_parked: usize,
}

impl<T> FreeList<T> {
    fn new(max_parked: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            max_parked,
        }
    }

    fn pop(&self) -> Option<T> {
        self.items.lock().expect("pool lock poisoned").pop()
    }

    fn push(&self, item: T) {
        let mut items = self.items.lock().expect("pool lock poisoned");
        if items.len() < self.max_parked {
            items.push(item);
        }
        // Otherwise the item is simply dropped: the pool caps steady-state
        // size rather than growing unbounded under bursty load.
    }

    fn len(&self) -> usize {
        self.items.lock().expect("pool lock poisoned").len()
    }
}

/// Pool of reusable [`BuildResult`] instances.
pub struct ResultPool {
    free: FreeList<BuildResult>,
}

impl ResultPool {
    pub fn new(max_parked: usize) -> Self {
        Self {
            free: FreeList::new(max_parked),
        }
    }

    /// Returns a `BuildResult` in a fully reset state — either a recycled
    /// one (freshly reset) or a fresh `Default`.
    pub fn acquire(&self) -> BuildResult {
        match self.free.pop() {
            Some(mut result) => {
                result.reset();
                result
            }
            None => BuildResult::default(),
        }
    }

    /// Resets `result` and returns it to the pool.
    pub fn release(&self, mut result: BuildResult) {
        result.reset();
        self.free.push(result);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }
}

/// Pool of reusable output byte buffers (used for combined stdout+stderr
/// capture in the command invoker).
pub struct BufferPool {
    free: FreeList<Vec<u8>>,
}

impl BufferPool {
    pub fn new(max_parked: usize) -> Self {
        Self {
            free: FreeList::new(max_parked),
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(BUFFER_PRESIZE),
        }
    }

    /// Returns `buf` to the pool, unless it grew past the discard
    /// threshold — an occasional giant allocation should not become the
    /// steady-state pool content.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > BUFFER_DISCARD_THRESHOLD {
            return;
        }
        buf.clear();
        self.free.push(buf);
    }
}

/// Pool of reusable `String` scratch buffers (used for status-line
/// formatting in the dispatcher).
pub struct StringBufferPool {
    free: FreeList<String>,
}

impl StringBufferPool {
    pub fn new(max_parked: usize) -> Self {
        Self {
            free: FreeList::new(max_parked),
        }
    }

    pub fn acquire(&self) -> String {
        match self.free.pop() {
            Some(mut s) => {
                s.clear();
                s
            }
            None => String::with_capacity(STRING_BUFFER_PRESIZE),
        }
    }

    pub fn release(&self, mut s: String) {
        s.clear();
        if s.capacity() > STRING_BUFFER_CAP_ON_RETURN {
            s.shrink_to(STRING_BUFFER_CAP_ON_RETURN);
        }
        self.free.push(s);
    }
}

/// Pool of reusable [`WorkerContext`] instances. See `worker.rs` for the
/// reset rules applied on release (buffer capacity caps, env map reuse).
pub struct WorkerContextPool {
    free: FreeList<WorkerContext>,
}

impl WorkerContextPool {
    pub fn new(max_parked: usize) -> Self {
        Self {
            free: FreeList::new(max_parked),
        }
    }

    pub fn acquire(&self) -> WorkerContext {
        match self.free.pop() {
            Some(mut ctx) => {
                ctx.reset();
                ctx
            }
            None => WorkerContext::new(),
        }
    }

    pub fn release(&self, mut ctx: WorkerContext) {
        ctx.reset();
        self.free.push(ctx);
    }
}
