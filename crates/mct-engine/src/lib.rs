//! Concurrency machinery and processing facades for the multi-component
//! transform network
//!
//! The transform network in `mct-transform` is purely synchronous row
//! arithmetic; this crate wraps it in the stripe/queue protocol that lets
//! the per-component wavelet exchanges run on worker threads. Each
//! codestream component owns a [`TransformQueue`] whose packed
//! dependency-state and stripe-accounting words coordinate job scheduling
//! without locks on the hot path, plus a [`ComponentEngine`] cursor the
//! transform side uses to walk the stripe ring. The application-facing
//! entry points are [`MultiSynthesis`] (decompression) and
//! [`MultiAnalysis`] (compression).

pub mod analysis;
pub mod cancel;
pub mod component;
pub mod dstate;
pub mod io;
pub mod queue;
pub mod scheduler;
pub mod sync_mdw;
pub mod synthesis;
pub mod wait;

pub use analysis::MultiAnalysis;
pub use cancel::CancelToken;
pub use component::ComponentEngine;
pub use io::{
    DefaultAllocator, DependencyMonitor, DependencySignal, RowSink, RowSource, SampleAllocator,
};
pub use queue::TransformQueue;
pub use scheduler::{InlineScheduler, JobScheduler, ThreadPoolScheduler};
pub use synthesis::MultiSynthesis;
pub use wait::WaitHandle;
