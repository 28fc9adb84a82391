//! External row-exchange boundary
//!
//! The engine neither encodes nor decodes subband data; it exchanges
//! finished component rows with the surrounding wavelet/entropy machinery
//! through these traits. A sink absorbs rows during analysis, a source
//! produces rows during synthesis. Either side reports its own blocking
//! potential back to the owning queue through a [`DependencySignal`],
//! which is how downstream buffer exhaustion throttles job scheduling.

use mct_core::LineBuf;

/// Dependency feedback channel handed to sinks and sources.
///
/// `add_dependency` must only be called from inside a `push`/`pull`
/// delivery (it is deferred until the current stripe boundary);
/// `remove_dependency` may be called from any thread, typically when a
/// downstream buffer drains.
pub trait DependencySignal: Send + Sync {
    /// One new potentially-blocking dependency (deferred)
    fn add_dependency(&self);
    /// One dependency resolved; may cause a job to be scheduled
    fn remove_dependency(&self);
    /// Adjust the maximum number of future dependencies
    fn change_max_dependencies(&self, delta: i32);
}

/// Consumes analysed component rows (compression direction)
pub trait RowSink: Send {
    /// Prepare for delivery; may be called repeatedly until it returns
    /// true, enabling delayed multi-threaded start-up.
    fn start(&mut self, signal: &dyn DependencySignal) -> bool {
        let _ = signal;
        true
    }
    fn push(&mut self, row: &mut LineBuf, signal: &dyn DependencySignal);
}

/// Produces synthesized component rows (decompression direction)
pub trait RowSource: Send {
    /// Prepare for delivery; may be called repeatedly until it returns
    /// true, enabling delayed multi-threaded start-up.
    fn start(&mut self, signal: &dyn DependencySignal) -> bool {
        let _ = signal;
        true
    }
    fn pull(&mut self, row: &mut LineBuf, signal: &dyn DependencySignal);
}

/// Row-buffer accounting used by the facades' `create` entry points.
///
/// Backing memory is reserved in a declaration pass, finalized once, and
/// only then considered allocated; the finalized total is what `create`
/// reports to the caller.
pub trait SampleAllocator {
    fn reserve(&mut self, bytes: usize);
    fn finalize(&mut self) -> usize;
}

/// Byte-counting allocator; row buffers themselves live inside the lines
/// and stripe rings they belong to.
#[derive(Debug, Default)]
pub struct DefaultAllocator {
    reserved: usize,
    finalized: bool,
}

impl DefaultAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleAllocator for DefaultAllocator {
    fn reserve(&mut self, bytes: usize) {
        debug_assert!(!self.finalized);
        self.reserved += bytes;
    }

    fn finalize(&mut self) -> usize {
        self.finalized = true;
        self.reserved
    }
}

/// Parent-side observer of a queue's blocking potential.
///
/// Mirrors the dependency propagation a queue performs towards its parent:
/// `new_dependencies` counts conditions that would currently block the
/// transform side, `delta_max` adjusts how many such conditions remain
/// possible in the future. Returns false when the observer has no further
/// interest in updates.
pub trait DependencyMonitor: Send + Sync {
    fn update_dependencies(&self, new_dependencies: i32, delta_max: i32) -> bool;
}
