//! Transform blocks
//!
//! A block is a pure function from a set of dependency lines to a set of
//! output lines, invertible on demand. The five variants form a closed
//! enum; every operation dispatches through [`Block`] so the network never
//! needs open-ended polymorphism.

use mct_core::consts::{COEFF_SCALE_LIMIT, MAX_COEFF_DOWNSHIFT};
use mct_core::{Arena, BlockHandle, LineHandle};

use crate::dependency::DependencyBlock;
use crate::dwt::DwtBlock;
use crate::line::MultiLine;
use crate::matrix::MatrixBlock;
use crate::rxform::RxformBlock;

/// Line arena of one transform network
pub type Lines = Arena<LineHandle, MultiLine>;

/// Transform-specific state of a block
#[derive(Debug)]
pub enum BlockKind {
    Null,
    Matrix(MatrixBlock),
    ReversibleTransform(RxformBlock),
    Dependency(DependencyBlock),
    Dwt(DwtBlock),
}

/// One transform block of the network
#[derive(Debug)]
pub struct Block {
    /// Output lines generated by this block, in the line arena
    pub components: Vec<LineHandle>,
    /// Dependency lines; `None` is treated as an all-zero input
    pub dependencies: Vec<Option<LineHandle>>,
    /// Synthesis cursor: dependencies realized so far for the next row
    pub num_available_dependencies: usize,
    /// Analysis: output rows not yet written (set up by inversion
    /// preparation), aggregated over all output lines
    pub outstanding_consumers: i32,
    pub kind: BlockKind,
}

impl Block {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            components: Vec::new(),
            dependencies: Vec::new(),
            num_available_dependencies: 0,
            outstanding_consumers: 0,
            kind,
        }
    }

    /// Pass-through blocks are handled specially by both facades and by
    /// the bypass optimization
    pub fn is_null_transform(&self) -> bool {
        matches!(self.kind, BlockKind::Null)
    }

    /// Rescale irreversible coefficients once all bit-depths are final
    pub fn normalize_coefficients(&mut self, lines: &mut Lines) {
        match &mut self.kind {
            BlockKind::Null => {}
            BlockKind::Matrix(m) => m.normalize(&self.components, &self.dependencies, lines),
            BlockKind::ReversibleTransform(_) => {}
            BlockKind::Dependency(d) => d.normalize(&self.components, &self.dependencies, lines),
            BlockKind::Dwt(d) => d.normalize(&self.components, &self.dependencies, lines),
        }
    }

    /// Block-specific bit-depth inference; returns true if anything changed
    pub fn propagate_bit_depths(
        &mut self,
        lines: &mut Lines,
        need_input_bit_depth: bool,
        need_output_bit_depth: bool,
    ) -> bool {
        match &mut self.kind {
            BlockKind::Dwt(d) => d.propagate_bit_depths(
                &self.components,
                &self.dependencies,
                lines,
                need_input_bit_depth,
                need_output_bit_depth,
            ),
            _ => false,
        }
    }

    /// Run the forward (synthesis) transform for the current row
    pub fn perform_transform(&mut self, lines: &mut Lines) {
        match &mut self.kind {
            BlockKind::Null => unreachable!("pass-through blocks are realized by line copies"),
            BlockKind::Matrix(m) => m.transform(&self.components, &self.dependencies, lines),
            BlockKind::ReversibleTransform(r) => {
                r.transform(&self.components, &self.dependencies, lines)
            }
            BlockKind::Dependency(d) => d.transform(&self.components, &self.dependencies, lines),
            BlockKind::Dwt(d) => d.transform(&self.components, &self.dependencies, lines),
        }
    }

    /// Check invertibility and build any inverse state.
    ///
    /// On success the aggregated outstanding write count over this block's
    /// outputs is recorded; on failure the diagnostic is reported to the
    /// caller, which appends it verbatim to its own error.
    pub fn prepare_for_inversion(&mut self, lines: &Lines) -> Result<(), &'static str> {
        let outstanding = match &mut self.kind {
            BlockKind::Null => 0,
            BlockKind::Matrix(m) => m.prepare(&self.components, &self.dependencies, lines)?,
            BlockKind::ReversibleTransform(r) => {
                r.prepare(&self.components, &self.dependencies, lines)?
            }
            BlockKind::Dependency(d) => d.prepare(&self.components, &self.dependencies, lines)?,
            BlockKind::Dwt(d) => d.prepare(&self.components, &self.dependencies, lines)?,
        };
        self.outstanding_consumers = outstanding;
        Ok(())
    }

    /// Run the inverse (analysis) transform for the current row
    pub fn perform_inverse(&mut self, lines: &mut Lines) {
        match &mut self.kind {
            BlockKind::Null => unreachable!("pass-through blocks are inverted by line copies"),
            BlockKind::Matrix(m) => m.inverse(&self.components, &self.dependencies, lines),
            BlockKind::ReversibleTransform(r) => {
                r.inverse(&self.components, &self.dependencies, lines)
            }
            BlockKind::Dependency(d) => d.inverse(&self.components, &self.dependencies, lines),
            BlockKind::Dwt(d) => d.inverse(&self.components, &self.dependencies, lines),
        }
    }
}

/// Blocks arena of one transform network
pub type Blocks = Arena<BlockHandle, Block>;

/// Quantize real coefficients onto a shared 16-bit grid.
///
/// The factor is grown by doublings while `factor * max <= 16383.0` and
/// fewer than 16 doublings have occurred; quantized values saturate at
/// the 16-bit limits.
pub(crate) fn quantize_short_coefficients(coeffs: &[f32]) -> (Vec<i16>, i32) {
    let mut max_val = 0.00001f32;
    for &v in coeffs {
        if v > max_val {
            max_val = v;
        } else if v < -max_val {
            max_val = -v;
        }
    }
    let mut factor = 1.0f32;
    let mut downshift = 0i32;
    while factor * max_val <= COEFF_SCALE_LIMIT && downshift < MAX_COEFF_DOWNSHIFT {
        downshift += 1;
        factor *= 2.0;
    }
    let quantized = coeffs
        .iter()
        .map(|&v| {
            let ival = f64::from(v * factor + 0.5).floor() as i32;
            ival.clamp(-(1 << 15), (1 << 15) - 1) as i16
        })
        .collect();
    (quantized, downshift)
}

/// Fixed-point image of an irreversible offset
pub(crate) fn fix_point_offset32(irrev_off: f32) -> i32 {
    (0.5 + f64::from(irrev_off) * f64::from(1 << mct_core::consts::FIX_POINT)).floor() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_coefficients_saturate_near_range_limit() {
        // A coefficient just under the growth threshold is doubled all the
        // way to the edge of the 16-bit range and then clamped.
        let (q, shift) = quantize_short_coefficients(&[16383.0]);
        assert_eq!(shift, 1);
        assert_eq!(q[0], 32766);

        let (q, shift) = quantize_short_coefficients(&[40000.0]);
        assert_eq!(shift, 0);
        assert_eq!(q[0], 32767);
    }

    #[test]
    fn test_short_coefficients_small_values_use_full_precision() {
        let (q, shift) = quantize_short_coefficients(&[0.5, -0.25]);
        assert_eq!(shift, 15);
        assert_eq!(q[0], 16384);
        assert_eq!(q[1], -8192);
    }
}
