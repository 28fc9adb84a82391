//! Multi-component transform network
//!
//! This crate turns a declarative per-tile transform description into an
//! executable graph of transform blocks over shared row buffers. The
//! network runs forwards (synthesis: codestream components to output
//! components) or, after inversion preparation, backwards (analysis).
//! All per-row numeric work lives here; scheduling and stripe management
//! belong to the engine crate built on top.

pub mod block;
pub mod dependency;
pub mod description;
pub mod dwt;
pub mod line;
pub mod matrix;
pub mod network;
pub mod rxform;
pub mod ycc;

pub use block::{Block, BlockKind, Blocks, Lines};
pub use dependency::DependencyBlock;
pub use description::{
    BlockDescription, BlockKindDescription, ComponentDescription, CustomKernel,
    DependencyCoefficients, DwtDescription, DwtKernel, LiftingStepSpec, OutputDescription,
    StageDescription, TileDescription,
};
pub use dwt::DwtBlock;
pub use line::MultiLine;
pub use matrix::MatrixBlock;
pub use network::{CodestreamComponent, NetworkConfig, TransformNetwork};
pub use rxform::RxformBlock;
