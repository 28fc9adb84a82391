//! Declarative per-tile transform description
//!
//! The tile header machinery (outside this engine) decodes the
//! multi-component transform segments into this plain data form; the
//! network builder consumes it without ever touching codestream syntax.

use mct_core::CompressionMode;

/// One codestream tile-component as seen by the entropy coder
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComponentDescription {
    /// Codestream component index
    pub comp_idx: usize,
    pub width: i32,
    pub height: i32,
    /// Declared dynamic range in bits
    pub bit_depth: i32,
    pub mode: CompressionMode,
}

/// Final output component as seen by the application
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutputDescription {
    pub width: i32,
    pub height: i32,
    /// Declared dynamic range in bits
    pub bit_depth: i32,
    /// Signed sample representation; unsigned components get a level
    /// offset during network construction
    pub signed: bool,
}

/// Complete transform description for one tile
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TileDescription {
    pub components: Vec<ComponentDescription>,
    /// Final output components, matching the last stage's output count
    /// (or the codestream components when there are no stages)
    pub outputs: Vec<OutputDescription>,
    /// Transform stages, codestream side first; may be empty
    pub stages: Vec<StageDescription>,
    /// Apply the component (RCT/ICT) transform to the first three
    /// codestream components
    pub use_ycc: bool,
}

/// One stage of the transform pipeline
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StageDescription {
    /// Number of component lines in the collection this stage produces
    pub num_outputs: usize,
    pub blocks: Vec<BlockDescription>,
}

/// One declared transform block within a stage
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockDescription {
    /// Indices into the stage's input collection
    pub input_indices: Vec<usize>,
    /// Indices into the stage's output collection
    pub output_indices: Vec<usize>,
    /// Per-output integer offsets (reversible data); dependency blocks
    /// interpret these as per-internal-component pre-transform offsets
    pub rev_offsets: Vec<i32>,
    /// Per-output real-valued offsets (irreversible data)
    pub irrev_offsets: Vec<f32>,
    /// Reversible/dependency transforms: internal component exported as
    /// output `k`; identity when empty
    pub active_outputs: Vec<usize>,
    pub kind: BlockKindDescription,
}

/// Transform-specific payload of a block description
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockKindDescription {
    /// Pass-through: first K outputs mirror the K inputs, the rest are
    /// constant
    Null,
    /// `output = M * input + offset`; coefficients row-major,
    /// `num_outputs x num_inputs`
    Matrix { coefficients: Vec<f32> },
    /// N+1 lifting passes over an `N x (N+1)` triangular integer table;
    /// divisors must be powers of two
    ReversibleTransform { coefficients: Vec<i32> },
    /// Triangular prediction of each component from those before it
    Dependency(DependencyCoefficients),
    /// Multi-level 1-D wavelet decomposition
    Dwt(DwtDescription),
}

/// Coefficients of a dependency (triangular) block
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DependencyCoefficients {
    /// `N x N` lower triangular with power-of-two divisors on the diagonal
    /// (first diagonal entry is implicitly 1)
    Reversible(Vec<i32>),
    /// `N x N` strictly lower triangular real matrix
    Irreversible(Vec<f32>),
}

/// One declared wavelet decomposition
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DwtDescription {
    pub kernel: DwtKernel,
    pub num_levels: i32,
    /// Canvas origin of the top decomposition level
    pub canvas_min: i32,
    /// Canvas extent of the top decomposition level
    pub canvas_size: i32,
    /// Subband sample positions supplied as block inputs, packed with the
    /// lowest level's low-pass band first
    pub active_inputs: Vec<i32>,
    /// Output positions, relative to `canvas_min`
    pub active_outputs: Vec<i32>,
}

/// Wavelet kernel selector
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DwtKernel {
    /// Reversible 5/3 spline kernel
    Spline5x3,
    /// Irreversible 9/7 kernel
    Cdf9x7,
    /// Arbitrary kernel supplied through the tile description
    Custom(CustomKernel),
}

/// Lifting description of an arbitrary wavelet kernel
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CustomKernel {
    pub reversible: bool,
    /// Symmetric boundary extension; constant extension otherwise
    pub sym_extension: bool,
    pub steps: Vec<LiftingStepSpec>,
}

/// One lifting step of a wavelet kernel
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LiftingStepSpec {
    /// Position of the first support sample relative to the updated sample
    pub support_min: i32,
    pub coefficients: Vec<f32>,
    /// Reversible kernels only: the explicit power-of-two downshift
    pub downshift: i32,
}

impl BlockDescription {
    /// Offset pair declared for output `n`, zero-filled past the end
    pub fn offsets(&self, n: usize) -> (i32, f32) {
        let rev = self.rev_offsets.get(n).copied().unwrap_or(0);
        let irrev = self.irrev_offsets.get(n).copied().unwrap_or(0.0);
        (rev, irrev)
    }
}
