//! Multi-component transform engine
//!
//! Umbrella crate re-exporting the public surface of the three layers:
//!
//! - `mct-core`: row buffers, arenas, error types and fixed-point
//!   constants
//! - `mct-transform`: the declarative transform description and the
//!   executable per-tile network built from it
//! - `mct-engine`: stripe queues, job scheduling and the
//!   [`MultiSynthesis`]/[`MultiAnalysis`] processing facades
//!
//! A typical decompression caller builds a [`TileDescription`], creates a
//! [`MultiSynthesis`] with one [`RowSource`] per codestream component and
//! drains output rows with [`MultiSynthesis::get_line`]. Compression runs
//! the same network backwards through [`MultiAnalysis::exchange_line`].

pub use mct_core::{
    consts, Arena, ArenaHandle, BlockHandle, CompressionMode, Coords, Direction, LineBuf,
    LineHandle, MctError, MctResult,
};
pub use mct_engine::{
    CancelToken, ComponentEngine, DefaultAllocator, DependencyMonitor, DependencySignal,
    InlineScheduler, JobScheduler, MultiAnalysis, MultiSynthesis, RowSink, RowSource,
    SampleAllocator, ThreadPoolScheduler, TransformQueue, WaitHandle,
};
pub use mct_transform::{
    BlockDescription, BlockKindDescription, ComponentDescription, CustomKernel,
    DependencyCoefficients, DwtDescription, DwtKernel, LiftingStepSpec, NetworkConfig,
    OutputDescription, StageDescription, TileDescription, TransformNetwork,
};
