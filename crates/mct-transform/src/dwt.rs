//! Component-domain wavelet blocks
//!
//! A DWT block treats a window of output components as consecutive samples
//! of a 1-D signal on a canvas and synthesizes them from subband samples
//! supplied as block inputs. Levels are stored coarsest first; within a
//! level, low-pass lines are shared with the level above wherever the
//! positions coincide, so each physical line is lifted in place exactly
//! once per row. The lifting machinery follows the usual alternating
//! convention: step 0 updates odd canvas positions, step 1 even ones, and
//! so on.

use lazy_static::lazy_static;

use mct_core::consts::FIX_POINT;
use mct_core::{LineHandle, MctError, MctResult};

use crate::block::Lines;
use crate::description::{DwtDescription, DwtKernel};

const ALPHA: f32 = -1.586_134_3;
const BETA: f32 = -0.052_980_118;
const GAMMA: f32 = 0.882_911_1;
const DELTA: f32 = 0.443_506_85;
/// Scaling constant of the irreversible 9/7 kernel
const KAPPA: f64 = 1.230_174_104_914_001;

/// One lifting step, with integer coefficients quantized to `downshift`
/// fractional bits
#[derive(Debug, Clone)]
pub struct LiftingStep {
    /// Position of the first support sample, in subband steps of two,
    /// relative to the sample being updated
    pub support_min: i32,
    pub coeffs: Vec<f32>,
    pub icoeffs: Vec<i32>,
    pub downshift: i32,
    pub rounding_offset: i32,
}

impl LiftingStep {
    fn from_coeffs(support_min: i32, coeffs: &[f32], downshift: i32) -> Self {
        let rounding_offset = (1 << downshift) >> 1;
        let factor = (1i64 << downshift) as f64;
        let icoeffs = coeffs
            .iter()
            .map(|&c| (0.5 + f64::from(c) * factor).floor() as i32)
            .collect();
        Self {
            support_min,
            coeffs: coeffs.to_vec(),
            icoeffs,
            downshift,
            rounding_offset,
        }
    }

    /// Irreversible steps pick the largest downshift that keeps the
    /// quantized coefficients comfortably inside 16 bits.
    fn from_irreversible_coeffs(support_min: i32, coeffs: &[f32]) -> Self {
        let mut max_factor = 0.4f32;
        for &c in coeffs {
            if c > max_factor {
                max_factor = c;
            } else if c < -max_factor {
                max_factor = -c;
            }
        }
        let mut downshift = 16;
        while max_factor >= 0.499 {
            downshift -= 1;
            max_factor *= 0.5;
        }
        Self::from_coeffs(support_min, coeffs, downshift)
    }
}

lazy_static! {
    /// Reversible 5/3 spline kernel: predict then update
    static ref SPLINE_5X3_STEPS: Vec<LiftingStep> = vec![
        LiftingStep::from_coeffs(0, &[-0.5, -0.5], 1),
        LiftingStep::from_coeffs(-1, &[0.25, 0.25], 2),
    ];
    /// Irreversible 9/7 kernel: two predict/update pairs
    static ref CDF_9X7_STEPS: Vec<LiftingStep> = vec![
        LiftingStep::from_irreversible_coeffs(0, &[ALPHA, ALPHA]),
        LiftingStep::from_irreversible_coeffs(-1, &[BETA, BETA]),
        LiftingStep::from_irreversible_coeffs(0, &[GAMMA, GAMMA]),
        LiftingStep::from_irreversible_coeffs(-1, &[DELTA, DELTA]),
    ];
}

/// One decomposition level; index 0 of [`DwtBlock::levels`] is the
/// coarsest
#[derive(Debug)]
struct DwtLevel {
    canvas_min: i32,
    canvas_size: i32,
    region_min: i32,
    region_size: i32,
    canvas_low_size: i32,
    canvas_high_size: i32,
    region_low_size: i32,
    region_high_size: i32,
    /// Nominal range of the low- and high-pass subbands feeding this level
    low_range: f32,
    high_range: f32,
    /// Extra headroom shift applied after synthesis of this level
    normalizing_shift: i32,
    /// Per relative position, index into the block's component list
    comp: Vec<usize>,
    /// Per relative position, index into the block's dependency list
    dep_slot: Vec<Option<usize>>,
}

#[derive(Debug)]
pub struct DwtBlock {
    is_reversible: bool,
    sym_extension: bool,
    steps: Vec<LiftingStep>,
    levels: Vec<DwtLevel>,
    num_components: usize,
    num_dependencies: usize,
}

impl DwtBlock {
    pub fn from_description(desc: &DwtDescription) -> MctResult<Self> {
        if desc.num_levels < 1 {
            return Err(MctError::InvalidConfiguration(
                "wavelet transform block must declare at least one decomposition level".into(),
            ));
        }
        if desc.canvas_size < 1 {
            return Err(MctError::InvalidConfiguration(
                "wavelet transform block must cover a non-empty canvas".into(),
            ));
        }
        let (is_reversible, sym_extension, steps) = match &desc.kernel {
            DwtKernel::Spline5x3 => (true, true, SPLINE_5X3_STEPS.clone()),
            DwtKernel::Cdf9x7 => (false, true, CDF_9X7_STEPS.clone()),
            DwtKernel::Custom(custom) => {
                let steps = custom
                    .steps
                    .iter()
                    .map(|s| {
                        if custom.reversible {
                            if s.downshift < 0 || s.downshift > 31 {
                                return Err(MctError::InvalidConfiguration(format!(
                                    "lifting step downshift {} is out of range",
                                    s.downshift
                                )));
                            }
                            Ok(LiftingStep::from_coeffs(
                                s.support_min,
                                &s.coefficients,
                                s.downshift,
                            ))
                        } else {
                            Ok(LiftingStep::from_irreversible_coeffs(
                                s.support_min,
                                &s.coefficients,
                            ))
                        }
                    })
                    .collect::<MctResult<Vec<_>>>()?;
                (custom.reversible, custom.sym_extension, steps)
            }
        };
        if steps.is_empty() {
            return Err(MctError::InvalidConfiguration(
                "wavelet transform block must declare at least one lifting step".into(),
            ));
        }

        let (low_scale, high_scale) = if is_reversible {
            (1.0f64, 1.0f64)
        } else {
            match &desc.kernel {
                DwtKernel::Cdf9x7 => (1.0 / KAPPA, KAPPA / 2.0),
                _ => (1.0, 1.0),
            }
        };
        let (low_support_min, low_support_max) = synthesis_support(&steps, false);
        let (high_support_min, high_support_max) = synthesis_support(&steps, true);

        // Region occupied by the active outputs on the top-level canvas
        let mut canvas_min = desc.canvas_min;
        let mut canvas_lim = desc.canvas_min + desc.canvas_size;
        let mut region_min = canvas_lim;
        let mut region_lim = canvas_min;
        for &out in &desc.active_outputs {
            let loc = out + canvas_min;
            if loc < canvas_min || loc >= canvas_lim {
                return Err(MctError::InvalidConfiguration(format!(
                    "wavelet transform output position {out} lies outside the canvas"
                )));
            }
            region_min = region_min.min(loc);
            region_lim = region_lim.max(loc + 1);
        }
        if region_min >= region_lim {
            return Err(MctError::InvalidConfiguration(
                "wavelet transform block declares no output components".into(),
            ));
        }

        let num_levels = desc.num_levels as usize;
        let mut levels: Vec<DwtLevel> = Vec::with_capacity(num_levels);
        let mut range = 1.0f64; // Nominal range prior to analysis
        for _lev_idx in (0..num_levels).rev() {
            let lev_canvas_min = canvas_min;
            let lev_canvas_size = canvas_lim - canvas_min;

            // Grow the region to everything the requested outputs depend
            // on, then reflect out-of-canvas samples back inside
            let mut low_min = region_min - low_support_max;
            low_min += low_min & 1;
            let mut high_min = region_min - high_support_max;
            high_min += 1 - (high_min & 1);
            let mut low_lim = region_lim - low_support_min;
            low_lim -= 1 - (low_lim & 1);
            let mut high_lim = region_lim - high_support_min;
            high_lim -= high_lim & 1;
            region_min = low_min.min(high_min);
            region_lim = low_lim.max(high_lim);
            while region_min < canvas_min || region_lim > canvas_lim {
                if lev_canvas_size < 2 {
                    region_min = canvas_min;
                    region_lim = canvas_lim;
                }
                if region_min < canvas_min {
                    let refl = 2 * canvas_min - region_min;
                    if refl >= region_lim {
                        region_lim = refl + 1;
                    }
                    region_min = canvas_min;
                }
                if region_lim > canvas_lim {
                    let refl = 2 * (canvas_lim - 1) - (region_lim - 1);
                    if refl < region_min {
                        region_min = refl;
                    }
                    region_lim = canvas_lim;
                }
            }
            let lev_region_min = region_min;
            let lev_region_size = region_lim - region_min;

            let mut normalizing_shift = 0;
            let (low_range, high_range);
            if is_reversible {
                low_range = 1.0f32;
                high_range = 2.0f32;
            } else if lev_canvas_size < 2 {
                // Unit length signals pass through unaltered
                low_range = range as f32;
                high_range = range as f32;
            } else {
                let bibo_max =
                    analysis_bibo_max(&steps, sym_extension, lev_canvas_min, lev_canvas_size)
                        * range;
                let mut bibo = bibo_max;
                let mut low = range / low_scale;
                let mut high = range / high_scale;
                let overflow_limit = f64::from(1 << (16 - FIX_POINT));
                while bibo > 0.75 * overflow_limit {
                    normalizing_shift += 1;
                    low *= 0.5;
                    high *= 0.5;
                    bibo *= 0.5;
                }
                low_range = low as f32;
                high_range = high as f32;
                range = low;
            }

            canvas_min = (canvas_min + 1) >> 1;
            canvas_lim = (canvas_lim + 1) >> 1;
            let next_region_min = (region_min + 1) >> 1;
            let next_region_lim = (region_lim + 1) >> 1;
            let canvas_low_size = canvas_lim - canvas_min;
            let region_low_size = next_region_lim - next_region_min;
            levels.push(DwtLevel {
                canvas_min: lev_canvas_min,
                canvas_size: lev_canvas_size,
                region_min: lev_region_min,
                region_size: lev_region_size,
                canvas_low_size,
                canvas_high_size: lev_canvas_size - canvas_low_size,
                region_low_size,
                region_high_size: lev_region_size - region_low_size,
                low_range,
                high_range,
                normalizing_shift,
                comp: vec![usize::MAX; lev_region_size as usize],
                dep_slot: vec![None; lev_region_size as usize],
            });
            region_min = next_region_min;
            region_lim = next_region_lim;
        }
        levels.reverse(); // Coarsest first

        // Assign component indices, sharing low-pass lines downward
        let mut num_components = 0usize;
        for lev_idx in (0..num_levels).rev() {
            if lev_idx == num_levels - 1 {
                for n in 0..levels[lev_idx].region_size as usize {
                    levels[lev_idx].comp[n] = num_components;
                    num_components += 1;
                }
            } else {
                for n in 0..levels[lev_idx].region_size as usize {
                    let loc = 2 * (levels[lev_idx].region_min + n as i32);
                    let idx = loc - levels[lev_idx + 1].region_min;
                    if idx >= 0 && idx < levels[lev_idx + 1].region_size {
                        levels[lev_idx].comp[n] = levels[lev_idx + 1].comp[idx as usize];
                    } else {
                        levels[lev_idx].comp[n] = num_components;
                        num_components += 1;
                    }
                }
            }
        }

        // Assign dependency slots: the coarsest level's low-pass band
        // first, then each level's high-pass band
        let mut num_dependencies = 0usize;
        for (lev_idx, lev) in levels.iter_mut().enumerate() {
            let parity = (lev.region_min & 1) as usize;
            if lev_idx == 0 {
                for n in 0..lev.region_low_size as usize {
                    lev.dep_slot[parity + 2 * n] = Some(num_dependencies);
                    num_dependencies += 1;
                }
            }
            for n in 0..lev.region_high_size as usize {
                lev.dep_slot[(1 - parity) + 2 * n] = Some(num_dependencies);
                num_dependencies += 1;
            }
        }

        Ok(Self {
            is_reversible,
            sym_extension,
            steps,
            levels,
            num_components,
            num_dependencies,
        })
    }

    pub fn is_reversible(&self) -> bool {
        self.is_reversible
    }

    pub fn num_components(&self) -> usize {
        self.num_components
    }

    pub fn num_dependencies(&self) -> usize {
        self.num_dependencies
    }

    /// Component index generating the output at canvas-relative position
    /// `out`
    pub fn output_component_index(&self, out: i32) -> MctResult<usize> {
        let top = self.levels.last().unwrap_or_else(|| unreachable!());
        let idx = out + top.canvas_min - top.region_min;
        if idx < 0 || idx >= top.region_size {
            return Err(MctError::InvalidConfiguration(format!(
                "wavelet transform output position {out} lies outside the synthesized region"
            )));
        }
        Ok(top.comp[idx as usize])
    }

    /// Dependency slot fed by subband input ordinal `input`, packed with
    /// the coarsest low-pass band first. Returns `None` when the sample is
    /// not needed to synthesize the requested outputs.
    pub fn input_dependency_slot(&self, input: i32) -> MctResult<Option<usize>> {
        let mut loc = input;
        for (lev_idx, lev) in self.levels.iter().enumerate() {
            if lev_idx == 0 {
                if loc < lev.canvas_low_size {
                    let abs_loc = lev.canvas_min + (lev.canvas_min & 1) + 2 * loc;
                    let rel = abs_loc - lev.region_min;
                    if rel >= 0 && rel < lev.region_size {
                        return Ok(lev.dep_slot[rel as usize]);
                    }
                    return Ok(None);
                }
                loc -= lev.canvas_low_size;
            }
            if loc < lev.canvas_high_size {
                let abs_loc = lev.canvas_min + 1 - (lev.canvas_min & 1) + 2 * loc;
                let rel = abs_loc - lev.region_min;
                if rel >= 0 && rel < lev.region_size {
                    return Ok(lev.dep_slot[rel as usize]);
                }
                return Ok(None);
            }
            loc -= lev.canvas_high_size;
        }
        Err(MctError::InvalidConfiguration(format!(
            "wavelet transform input ordinal {input} exceeds the declared subband structure"
        )))
    }

    /// Unify output bit-depths and mark every line precise if any input or
    /// output needs it; all outputs of one block must agree on bit-depth.
    pub fn normalize(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        if self.is_reversible {
            return;
        }
        let mut need_precise = false;
        let mut max_bit_depth = 0;
        for &comp in components {
            let line = lines.get(comp);
            max_bit_depth = max_bit_depth.max(line.bit_depth);
            if line.need_precise {
                need_precise = true;
            }
        }
        if max_bit_depth == 0 {
            need_precise = true;
        }
        for dep in dependencies.iter().flatten() {
            let line = lines.get(*dep);
            if line.need_precise || line.bit_depth == 0 {
                need_precise = true;
            }
        }
        for &comp in components {
            let line = lines.get_mut(comp);
            line.need_precise = need_precise;
            if line.bit_depth == 0 {
                line.bit_depth = max_bit_depth;
            }
        }
        for dep in dependencies.iter().flatten() {
            lines.get_mut(*dep).need_precise = need_precise;
        }
    }

    /// Infer unknown bit-depths from the declared ones: all outputs share
    /// one depth, the coarsest low band matches it and high-pass bands sit
    /// one bit above.
    pub fn propagate_bit_depths(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
        need_input_bit_depth: bool,
        need_output_bit_depth: bool,
    ) -> bool {
        if !(need_input_bit_depth || need_output_bit_depth) {
            return false;
        }
        let mut any_change = false;
        let mut out_depth = 0;
        for &comp in components {
            let bd = lines.get(comp).bit_depth;
            if bd != 0 {
                if out_depth != 0 && out_depth != bd {
                    return false;
                }
                out_depth = bd;
            }
        }
        if out_depth == 0 {
            if need_input_bit_depth {
                return false;
            }
            let coarsest = &self.levels[0];
            let mut max_ll = 0;
            let mut min_ll = 0;
            for n in 0..coarsest.region_size as usize {
                let slot = match coarsest.dep_slot[n] {
                    Some(s) => s,
                    None => continue,
                };
                if let Some(dep) = dependencies[slot] {
                    let bd = lines.get(dep).bit_depth;
                    if bd != 0 {
                        max_ll = max_ll.max(bd);
                        if min_ll == 0 || bd < min_ll {
                            min_ll = bd;
                        }
                    }
                }
            }
            if min_ll > 0 {
                out_depth = min_ll;
            } else {
                return false;
            }
        }

        if need_output_bit_depth {
            for &comp in components {
                let line = lines.get_mut(comp);
                if line.bit_depth == 0 {
                    line.bit_depth = out_depth;
                    any_change = true;
                }
            }
        }
        if need_input_bit_depth {
            for (lev_idx, lev) in self.levels.iter().enumerate() {
                for n in 0..lev.region_size as usize {
                    let slot = match lev.dep_slot[n] {
                        Some(s) => s,
                        None => continue,
                    };
                    if let Some(dep) = dependencies[slot] {
                        let line = lines.get_mut(dep);
                        if line.bit_depth == 0 {
                            line.bit_depth = out_depth + if lev_idx == 0 { 0 } else { 1 };
                            any_change = true;
                        }
                    }
                }
            }
        }
        any_change
    }

    pub fn prepare(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &Lines,
    ) -> Result<i32, &'static str> {
        let top = self.levels.last().unwrap_or_else(|| unreachable!());
        for n in 0..top.canvas_size as usize {
            if top.region_min != top.canvas_min
                || top.region_size != top.canvas_size
                || lines.get(components[top.comp[n]]).num_consumers < 1
            {
                return Err(
                    "DWT transform block cannot be inverted unless all output components can \
                     be computed by downstream transform blocks in the multi-component \
                     transform network, or by the application supplying them.",
                );
            }
        }
        if !self.is_reversible {
            for dep in dependencies.iter().flatten() {
                if lines.get(*dep).reversible {
                    return Err(
                        "Encountered an irreversible DWT transform block which operates on \
                         reversible codestream sample data; such a block is not inverted \
                         during compression.",
                    );
                }
            }
        }
        Ok(top.canvas_size)
    }

    /// Synthesis: pull subband rows in from the dependencies, lift each
    /// level in place from coarsest to finest, then apply output offsets.
    pub fn transform(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        let num_levels = self.levels.len();
        for lev_idx in 0..num_levels {
            self.transfer_subbands_in(lev_idx, components, dependencies, lines);

            let lev = &self.levels[lev_idx];
            if lev.canvas_size == 1 {
                // Single-sample levels pass straight through, except that a
                // lone high-pass sample carries a doubled reversible range
                debug_assert_eq!(lev.normalizing_shift, 0);
                if (lev.region_min & 1) != 0 && self.is_reversible {
                    halve_samples(lines, components[lev.comp[0]]);
                }
            } else {
                for s in (0..self.steps.len()).rev() {
                    self.lift_level(lev_idx, components, lines, s, true);
                }
                let lev = &self.levels[lev_idx];
                if !self.is_reversible && lev.normalizing_shift > 0 {
                    for n in 0..lev.region_size as usize {
                        upshift_samples(lines, components[lev.comp[n]], lev.normalizing_shift);
                    }
                }
            }

            // Final results appear only at the finest level
            if lev_idx == num_levels - 1 {
                let lev = &self.levels[lev_idx];
                for n in 0..lev.region_size as usize {
                    let line = lines.get_mut(components[lev.comp[n]]);
                    let (rev, irrev) = (line.rev_offset, line.irrev_offset);
                    line.apply_offset(rev, irrev);
                }
            }
        }
    }

    /// Analysis: lift each level in place from finest to coarsest and push
    /// the subband rows out to the dependencies.
    pub fn inverse(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        for lev_idx in (0..self.levels.len()).rev() {
            let lev = &self.levels[lev_idx];
            if lev.canvas_size == 1 {
                debug_assert_eq!(lev.normalizing_shift, 0);
                if (lev.canvas_min & 1) != 0 && self.is_reversible {
                    double_samples(lines, components[lev.comp[0]]);
                }
            } else {
                if !self.is_reversible && lev.normalizing_shift > 0 {
                    let shift = lev.normalizing_shift;
                    for n in 0..lev.region_size as usize {
                        downshift_samples(lines, components[lev.comp[n]], shift);
                    }
                }
                for s in 0..self.steps.len() {
                    self.lift_level(lev_idx, components, lines, s, false);
                }
            }
            self.transfer_subbands_out(lev_idx, components, dependencies, lines);
        }
    }

    /// Apply lifting step `s` to every sample of the step's parity within
    /// the level, with boundary reflection at the region (synthesis) or
    /// canvas (analysis) bounds
    fn lift_level(
        &self,
        lev_idx: usize,
        components: &[LineHandle],
        lines: &mut Lines,
        s: usize,
        synthesis: bool,
    ) {
        let lev = &self.levels[lev_idx];
        let step = &self.steps[s];
        let parity = 1 - (s as i32 & 1);
        let (bound_min, bound_max) = if synthesis {
            (lev.region_min, lev.region_min + lev.region_size - 1)
        } else {
            (lev.canvas_min, lev.canvas_min + lev.canvas_size - 1)
        };
        let mut n = (lev.region_min ^ parity) & 1;
        while n < lev.region_size {
            let dst = components[lev.comp[n as usize]];
            let mut sources = Vec::with_capacity(step.coeffs.len());
            let mut src_idx = ((n + lev.region_min) ^ 1) + 2 * step.support_min;
            for _ in 0..step.coeffs.len() {
                let mut k = src_idx;
                while k < bound_min || k > bound_max {
                    if k < bound_min {
                        k = if self.sym_extension {
                            2 * bound_min - k
                        } else {
                            bound_min + ((bound_min ^ k) & 1)
                        };
                    } else {
                        k = if self.sym_extension {
                            2 * bound_max - k
                        } else {
                            bound_max - ((bound_max ^ k) & 1)
                        };
                    }
                }
                let rel = k - lev.region_min;
                debug_assert!(rel >= 0 && rel < lev.region_size);
                sources.push(components[lev.comp[rel as usize]]);
                src_idx += 2;
            }
            lift_line(lines, dst, &sources, step, synthesis);
            n += 2;
        }
    }

    fn transfer_subbands_in(
        &self,
        lev_idx: usize,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        let lev = &self.levels[lev_idx];
        for n in 0..lev.region_size as usize {
            let slot = match lev.dep_slot[n] {
                Some(s) => s,
                None => continue,
            };
            let comp = components[lev.comp[n]];
            let dep = match dependencies[slot] {
                Some(d) => d,
                None => {
                    lines.get_mut(comp).reset(0, 0.0);
                    continue;
                }
            };
            if self.is_reversible {
                let (dst, src) = lines.pair_mut(comp, dep);
                dst.copy_from(src, 0, 0.0);
                continue;
            }
            // The MCT definition expects high-pass subbands to carry a
            // nominal range twice that of the synthesized data
            let range_expansion = if (n as i32 + lev.region_min) & 1 != 0 {
                lev.high_range * 0.5
            } else {
                lev.low_range
            };
            let (dst_line, src_line) = lines.pair_mut(comp, dep);
            let dst_bit_depth = dst_line.bit_depth;
            let dst = dst_line.buf.as_mut().unwrap_or_else(|| unreachable!());
            let src = src_line.buf.as_ref().unwrap_or_else(|| unreachable!());
            match dst.as_f32_mut() {
                Some(d) => {
                    if src_line.reversible {
                        let scale = range_expansion / (1i64 << dst_bit_depth) as f32;
                        let s = src.as_i32().unwrap_or_else(|| unreachable!());
                        for (x, &y) in d.iter_mut().zip(s) {
                            *x = y as f32 * scale;
                        }
                    } else {
                        let scale = range_expansion * (1i64 << src_line.bit_depth) as f32
                            / (1i64 << dst_bit_depth) as f32;
                        let s = src.as_f32().unwrap_or_else(|| unreachable!());
                        for (x, &y) in d.iter_mut().zip(s) {
                            *x = y * scale;
                        }
                    }
                }
                None => {
                    let mut scale = range_expansion / (1i64 << dst_bit_depth) as f32;
                    scale *= if src_line.reversible {
                        (1i64 << FIX_POINT) as f32
                    } else {
                        (1i64 << src_line.bit_depth) as f32
                    };
                    let (i_scale, downshift) = quantize_scale(scale);
                    let s = src.as_i16().unwrap_or_else(|| unreachable!());
                    let d = dst.as_i16_mut().unwrap_or_else(|| unreachable!());
                    if downshift >= 0 {
                        let offset = (1i32 << downshift) >> 1;
                        for (x, &y) in d.iter_mut().zip(s) {
                            *x = ((i32::from(y) * i_scale + offset) >> downshift) as i16;
                        }
                    } else {
                        let upshift = -downshift;
                        for (x, &y) in d.iter_mut().zip(s) {
                            *x = ((i32::from(y) * i_scale) << upshift) as i16;
                        }
                    }
                }
            }
        }
    }

    fn transfer_subbands_out(
        &self,
        lev_idx: usize,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        let lev = &self.levels[lev_idx];
        for n in 0..lev.region_size as usize {
            let slot = match lev.dep_slot[n] {
                Some(s) => s,
                None => continue,
            };
            let dep = match dependencies[slot] {
                Some(d) => d,
                None => continue,
            };
            let comp = components[lev.comp[n]];
            if self.is_reversible {
                let (dst, src) = lines.pair_mut(dep, comp);
                let (rev, irrev) = (dst.rev_offset, dst.irrev_offset);
                dst.copy_from(src, -rev, -irrev);
                continue;
            }
            let range_expansion = if (n as i32 + lev.region_min) & 1 != 0 {
                lev.high_range * 0.5
            } else {
                lev.low_range
            };
            let (dst_line, src_line) = lines.pair_mut(dep, comp);
            debug_assert!(!dst_line.reversible);
            let scale = (1i64 << src_line.bit_depth) as f32
                / (range_expansion * (1i64 << dst_line.bit_depth) as f32);
            let irrev_offset = dst_line.irrev_offset;
            let dst = dst_line.buf.as_mut().unwrap_or_else(|| unreachable!());
            let src = src_line.buf.as_ref().unwrap_or_else(|| unreachable!());
            match dst.as_f32_mut() {
                Some(d) => {
                    let s = src.as_f32().unwrap_or_else(|| unreachable!());
                    for (x, &y) in d.iter_mut().zip(s) {
                        *x = y * scale - irrev_offset;
                    }
                }
                None => {
                    let (i_scale, downshift) = quantize_scale(scale);
                    let fix_offset =
                        (0.5 + f64::from(irrev_offset) * f64::from(1 << FIX_POINT)).floor() as i32;
                    let s = src.as_i16().unwrap_or_else(|| unreachable!());
                    let d = dst.as_i16_mut().unwrap_or_else(|| unreachable!());
                    if downshift >= 0 {
                        let offset = ((1i32 << downshift) >> 1) - (fix_offset << downshift);
                        for (x, &y) in d.iter_mut().zip(s) {
                            *x = ((i32::from(y) * i_scale + offset) >> downshift) as i16;
                        }
                    } else {
                        let upshift = -downshift;
                        for (x, &y) in d.iter_mut().zip(s) {
                            *x = (((i32::from(y) * i_scale) << upshift) - fix_offset) as i16;
                        }
                    }
                }
            }
        }
    }
}

/// Normalize a positive real scale into a 16-bit multiplier and shift
fn quantize_scale(mut scale: f32) -> (i32, i32) {
    let mut downshift = 0;
    while scale < 16383.0 {
        scale *= 2.0;
        downshift += 1;
    }
    while scale > 32767.0 {
        scale *= 0.5;
        downshift -= 1;
    }
    ((f64::from(scale) + 0.5).floor() as i32, downshift)
}

/// One lifting update of a single line; synthesis subtracts the step term,
/// analysis adds it
fn lift_line(
    lines: &mut Lines,
    dst: LineHandle,
    sources: &[LineHandle],
    step: &LiftingStep,
    synthesis: bool,
) {
    let width = lines.get(dst).size.x as usize;
    let use_floats = !lines
        .get(dst)
        .buf
        .as_ref()
        .map(|b| b.is_short())
        .unwrap_or(false)
        && !lines.get(dst).reversible;
    if use_floats {
        let mut acc = vec![0.0f32; width];
        for (i, &src_h) in sources.iter().enumerate() {
            let factor = step.coeffs[i];
            let s = lines
                .get(src_h)
                .buf
                .as_ref()
                .and_then(|b| b.as_f32())
                .unwrap_or_else(|| unreachable!());
            for (a, &x) in acc.iter_mut().zip(s) {
                *a += factor * x;
            }
        }
        let d = lines
            .get_mut(dst)
            .buf
            .as_mut()
            .and_then(|b| b.as_f32_mut())
            .unwrap_or_else(|| unreachable!());
        if synthesis {
            for (x, a) in d.iter_mut().zip(acc) {
                *x -= a;
            }
        } else {
            for (x, a) in d.iter_mut().zip(acc) {
                *x += a;
            }
        }
    } else {
        let mut acc = vec![step.rounding_offset; width];
        for (i, &src_h) in sources.iter().enumerate() {
            let factor = step.icoeffs[i];
            let src = lines
                .get(src_h)
                .buf
                .as_ref()
                .unwrap_or_else(|| unreachable!());
            match src.as_i32() {
                Some(s) => {
                    for (a, &x) in acc.iter_mut().zip(s) {
                        *a += x * factor;
                    }
                }
                None => {
                    let s = src.as_i16().unwrap_or_else(|| unreachable!());
                    for (a, &x) in acc.iter_mut().zip(s) {
                        *a += i32::from(x) * factor;
                    }
                }
            }
        }
        let downshift = step.downshift;
        let dst_buf = lines.get_mut(dst).buf.as_mut().unwrap_or_else(|| unreachable!());
        match dst_buf.as_i32_mut() {
            Some(d) => {
                if synthesis {
                    for (x, a) in d.iter_mut().zip(acc) {
                        *x -= a >> downshift;
                    }
                } else {
                    for (x, a) in d.iter_mut().zip(acc) {
                        *x += a >> downshift;
                    }
                }
            }
            None => {
                let d = dst_buf.as_i16_mut().unwrap_or_else(|| unreachable!());
                if synthesis {
                    for (x, a) in d.iter_mut().zip(acc) {
                        *x = x.wrapping_sub((a >> downshift) as i16);
                    }
                } else {
                    for (x, a) in d.iter_mut().zip(acc) {
                        *x = x.wrapping_add((a >> downshift) as i16);
                    }
                }
            }
        }
    }
}

fn halve_samples(lines: &mut Lines, handle: LineHandle) {
    let buf = lines.get_mut(handle).buf.as_mut().unwrap_or_else(|| unreachable!());
    match buf.as_i32_mut() {
        Some(d) => {
            for x in d.iter_mut() {
                *x >>= 1;
            }
        }
        None => {
            let d = buf.as_i16_mut().unwrap_or_else(|| unreachable!());
            for x in d.iter_mut() {
                *x >>= 1;
            }
        }
    }
}

fn double_samples(lines: &mut Lines, handle: LineHandle) {
    let buf = lines.get_mut(handle).buf.as_mut().unwrap_or_else(|| unreachable!());
    match buf.as_i32_mut() {
        Some(d) => {
            for x in d.iter_mut() {
                *x <<= 1;
            }
        }
        None => {
            let d = buf.as_i16_mut().unwrap_or_else(|| unreachable!());
            for x in d.iter_mut() {
                *x <<= 1;
            }
        }
    }
}

fn upshift_samples(lines: &mut Lines, handle: LineHandle, shift: i32) {
    let buf = lines.get_mut(handle).buf.as_mut().unwrap_or_else(|| unreachable!());
    match buf.as_f32_mut() {
        Some(d) => {
            let scale = (1i64 << shift) as f32;
            for x in d.iter_mut() {
                *x *= scale;
            }
        }
        None => {
            let d = buf.as_i16_mut().unwrap_or_else(|| unreachable!());
            for x in d.iter_mut() {
                *x <<= shift;
            }
        }
    }
}

fn downshift_samples(lines: &mut Lines, handle: LineHandle, shift: i32) {
    let buf = lines.get_mut(handle).buf.as_mut().unwrap_or_else(|| unreachable!());
    match buf.as_f32_mut() {
        Some(d) => {
            let scale = 1.0 / (1i64 << shift) as f32;
            for x in d.iter_mut() {
                *x *= scale;
            }
        }
        None => {
            let d = buf.as_i16_mut().unwrap_or_else(|| unreachable!());
            let offset = (1i16 << shift) >> 1;
            for x in d.iter_mut() {
                *x = (*x + offset) >> shift;
            }
        }
    }
}

/// Support of the single-level synthesis impulse response, measured by
/// feeding a subband impulse through the float lifting steps on an
/// unbounded window
fn synthesis_support(steps: &[LiftingStep], high: bool) -> (i32, i32) {
    let mut reach = 1;
    for step in steps {
        reach += 2 * (step.support_min.abs() + step.coeffs.len() as i32);
    }
    let width = (2 * reach + 3) as usize;
    let center = reach + 1;
    let mut window = vec![0.0f64; width];
    let impulse_pos = center + i32::from(high);
    window[impulse_pos as usize] = 1.0;

    for s in (0..steps.len()).rev() {
        let step = &steps[s];
        let parity = 1 - (s as i32 & 1);
        let mut updates = Vec::new();
        for p in 0..width as i32 {
            if (p & 1) != parity {
                continue;
            }
            let mut sum = 0.0f64;
            let mut src = (p ^ 1) + 2 * step.support_min;
            for &c in &step.coeffs {
                if src >= 0 && (src as usize) < width {
                    sum += f64::from(c) * window[src as usize];
                }
                src += 2;
            }
            updates.push((p as usize, sum));
        }
        for (p, sum) in updates {
            window[p] -= sum;
        }
    }

    let mut min = 0;
    let mut max = 0;
    for (p, &v) in window.iter().enumerate() {
        if v.abs() > 1e-9 {
            let rel = p as i32 - impulse_pos;
            min = min.min(rel);
            max = max.max(rel);
        }
    }
    (min, max)
}

/// Largest BIBO gain seen at any intermediate node of a single analysis
/// level on the given canvas, computed by running a unit impulse from each
/// canvas position through the float lifting steps
fn analysis_bibo_max(
    steps: &[LiftingStep],
    sym_extension: bool,
    canvas_min: i32,
    canvas_size: i32,
) -> f64 {
    let size = canvas_size as usize;
    let bound_min = canvas_min;
    let bound_max = canvas_min + canvas_size - 1;
    let mut gains = vec![vec![0.0f64; size]; steps.len()];
    for j in 0..size {
        let mut window = vec![0.0f64; size];
        window[j] = 1.0;
        for (s, step) in steps.iter().enumerate() {
            let parity = 1 - (s as i32 & 1);
            let mut updates = Vec::new();
            for n in 0..canvas_size {
                let p = canvas_min + n;
                if (p & 1) != parity {
                    continue;
                }
                let mut sum = 0.0f64;
                let mut src = (p ^ 1) + 2 * step.support_min;
                for &c in &step.coeffs {
                    let mut k = src;
                    while k < bound_min || k > bound_max {
                        if k < bound_min {
                            k = if sym_extension {
                                2 * bound_min - k
                            } else {
                                bound_min + ((bound_min ^ k) & 1)
                            };
                        } else {
                            k = if sym_extension {
                                2 * bound_max - k
                            } else {
                                bound_max - ((bound_max ^ k) & 1)
                            };
                        }
                    }
                    sum += f64::from(c) * window[(k - canvas_min) as usize];
                    src += 2;
                }
                updates.push((n as usize, sum));
            }
            for (n, sum) in updates {
                window[n] += sum;
            }
            for n in 0..size {
                gains[s][n] += window[n].abs();
            }
        }
    }
    let mut bibo_max = 1.0f64;
    for per_step in &gains {
        for &g in per_step {
            bibo_max = bibo_max.max(g);
        }
    }
    bibo_max
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::MultiLine;
    use mct_core::{Arena, Coords, LineBuf};

    fn spline_desc(canvas_size: i32, outputs: Vec<i32>, inputs: Vec<i32>) -> DwtDescription {
        DwtDescription {
            kernel: DwtKernel::Spline5x3,
            num_levels: 1,
            canvas_min: 0,
            canvas_size,
            active_inputs: inputs,
            active_outputs: outputs,
        }
    }

    fn int_line(lines: &mut Lines, data: Option<Vec<i32>>, width: i32) -> LineHandle {
        let mut line = MultiLine {
            size: Coords::new(width, 1),
            reversible: true,
            need_precise: true,
            bit_depth: 8,
            num_consumers: 1,
            ..Default::default()
        };
        line.allocate();
        if let Some(d) = data {
            line.buf = Some(LineBuf::I32(d));
        }
        lines.alloc(line)
    }

    #[test]
    fn test_spline_synthesis_supports() {
        let (lmin, lmax) = synthesis_support(&SPLINE_5X3_STEPS, false);
        assert_eq!((lmin, lmax), (-1, 1));
        let (hmin, hmax) = synthesis_support(&SPLINE_5X3_STEPS, true);
        assert_eq!((hmin, hmax), (-2, 2));
    }

    #[test]
    fn test_irreversible_step_quantization() {
        // The first 9/7 step has |alpha| ~ 1.59, so 14 fractional bits keep
        // the quantized coefficients under the 0.499 threshold.
        let step = &CDF_9X7_STEPS[0];
        assert_eq!(step.downshift, 14);
        assert_eq!(step.rounding_offset, 1 << 13);
        assert_eq!(
            step.icoeffs[0],
            (0.5 + f64::from(ALPHA) * f64::from(1 << 14)).floor() as i32
        );
    }

    #[test]
    fn test_spline_round_trip_exact() {
        let mut lines: Lines = Arena::new();
        let desc = spline_desc(4, vec![0, 1, 2, 3], vec![0, 1, 2, 3]);
        let mut block = DwtBlock::from_description(&desc).unwrap();
        assert_eq!(block.num_components(), 4);
        assert_eq!(block.num_dependencies(), 4);

        let width = 3;
        let subbands = [
            vec![40i32, -3, 17],
            vec![12i32, 0, -25],
            vec![-6i32, 9, 2],
            vec![4i32, 4, -4],
        ];
        let mut deps: Vec<Option<LineHandle>> = vec![None; 4];
        for (ordinal, data) in subbands.iter().enumerate() {
            let slot = block
                .input_dependency_slot(ordinal as i32)
                .unwrap()
                .unwrap();
            deps[slot] = Some(int_line(&mut lines, Some(data.clone()), width));
        }
        let comps: Vec<LineHandle> = (0..4).map(|_| int_line(&mut lines, None, width)).collect();

        block.transform(&comps, &deps, &mut lines);
        block.inverse(&comps, &deps, &mut lines);
        for (ordinal, data) in subbands.iter().enumerate() {
            let slot = block
                .input_dependency_slot(ordinal as i32)
                .unwrap()
                .unwrap();
            let got = lines
                .get(deps[slot].unwrap())
                .buf
                .as_ref()
                .unwrap()
                .as_i32()
                .unwrap();
            assert_eq!(got, data.as_slice(), "subband {ordinal}");
        }
    }

    #[test]
    fn test_partial_outputs_shrink_region_and_block_inversion() {
        let mut lines: Lines = Arena::new();
        let desc = spline_desc(8, vec![0], vec![0, 1, 2, 3, 4, 5, 6, 7]);
        let mut block = DwtBlock::from_description(&desc).unwrap();
        let top = block.levels.last().unwrap();
        assert!(top.region_size < top.canvas_size);

        let comps: Vec<LineHandle> = (0..block.num_components())
            .map(|_| int_line(&mut lines, None, 2))
            .collect();
        let deps: Vec<Option<LineHandle>> = (0..block.num_dependencies())
            .map(|_| Some(int_line(&mut lines, None, 2)))
            .collect();
        let err = block.prepare(&comps, &deps, &lines).unwrap_err();
        assert!(err.contains("cannot be inverted"));
    }

    #[test]
    fn test_propagate_bit_depths_from_outputs() {
        let mut lines: Lines = Arena::new();
        let desc = spline_desc(4, vec![0, 1, 2, 3], vec![0, 1, 2, 3]);
        let mut block = DwtBlock::from_description(&desc).unwrap();
        let comps: Vec<LineHandle> = (0..4).map(|_| int_line(&mut lines, None, 2)).collect();
        let deps: Vec<Option<LineHandle>> =
            (0..4).map(|_| Some(int_line(&mut lines, None, 2))).collect();
        lines.get_mut(comps[0]).bit_depth = 10;
        for &c in &comps[1..] {
            lines.get_mut(c).bit_depth = 0;
        }
        for d in deps.iter().flatten() {
            lines.get_mut(*d).bit_depth = 0;
        }
        let changed = block.propagate_bit_depths(&comps, &deps, &mut lines, true, true);
        assert!(changed);
        for &c in &comps {
            assert_eq!(lines.get(c).bit_depth, 10);
        }
        // Every first-level subband matches the outputs; only subbands of
        // deeper levels sit one bit above.
        let low_slot = block.input_dependency_slot(0).unwrap().unwrap();
        let high_slot = block.input_dependency_slot(2).unwrap().unwrap();
        assert_eq!(lines.get(deps[low_slot].unwrap()).bit_depth, 10);
        assert_eq!(lines.get(deps[high_slot].unwrap()).bit_depth, 10);
    }
}
