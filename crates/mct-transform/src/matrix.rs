//! Linear (matrix) decorrelation blocks
//!
//! `output = M * input + offset`, always irreversible. The forward
//! direction runs in floats or, when every line has a known bit-depth and
//! precision is not required, through a lazily built 16-bit fixed-point
//! cache with a single shared downshift. Inversion computes the
//! Moore-Penrose pseudo-inverse of the consumed sub-matrix through normal
//! equations and a Cholesky factorization.

use mct_core::consts::FIX_POINT;
use mct_core::LineHandle;

use crate::block::{fix_point_offset32, quantize_short_coefficients, Lines};

/// Relative pivot threshold below which the normal equations are treated
/// as singular
const SINGULARITY_THRESHOLD: f64 = 1e-13;

#[derive(Debug)]
pub struct MatrixBlock {
    /// Row-major forward coefficients, `num_components x num_dependencies`
    pub coefficients: Vec<f32>,
    /// Row-major inverse coefficients, `num_dependencies x num_components`,
    /// built by [`MatrixBlock::prepare`]
    pub inverse_coefficients: Option<Vec<f32>>,
    /// Shared 16-bit cache for whichever direction runs first
    short_coefficients: Option<Vec<i16>>,
    short_downshift: i32,
}

impl MatrixBlock {
    pub fn new(coefficients: Vec<f32>) -> Self {
        Self {
            coefficients,
            inverse_coefficients: None,
            short_coefficients: None,
            short_downshift: 0,
        }
    }

    /// Fold a constant dependency's contribution into every output offset;
    /// the caller then clears the dependency slot.
    pub fn fold_constant_dependency(
        &self,
        dep_idx: usize,
        num_dependencies: usize,
        constant_offset: f32,
        components: &[LineHandle],
        lines: &mut Lines,
    ) {
        for (m, &comp) in components.iter().enumerate() {
            lines.get_mut(comp).irrev_offset +=
                constant_offset * self.coefficients[m * num_dependencies + dep_idx];
        }
    }

    /// Scale columns by each dependency's range and rows by each output's
    /// range, so coefficients act on normalized data. Unknown bit-depths
    /// force the precise (float) representation throughout.
    pub fn normalize(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        let num_deps = dependencies.len();
        let mut need_precise = false;
        for (n, dep) in dependencies.iter().enumerate() {
            let dep = match dep {
                Some(d) => lines.get(*d),
                None => continue,
            };
            assert!(!dep.is_constant);
            if dep.bit_depth == 0 {
                need_precise = true;
                continue;
            }
            if dep.need_precise {
                need_precise = true;
            }
            let factor = (1i64 << dep.bit_depth) as f32;
            for m in 0..components.len() {
                self.coefficients[m * num_deps + n] *= factor;
            }
        }
        for (m, &comp) in components.iter().enumerate() {
            let line = lines.get(comp);
            if line.bit_depth == 0 {
                need_precise = true;
                continue;
            }
            if line.need_precise {
                need_precise = true;
            }
            let factor = 1.0f32 / (1i64 << line.bit_depth) as f32;
            for n in 0..num_deps {
                self.coefficients[m * num_deps + n] *= factor;
            }
        }
        if need_precise {
            for dep in dependencies.iter().flatten() {
                lines.get_mut(*dep).need_precise = true;
            }
            for &comp in components {
                lines.get_mut(comp).need_precise = true;
            }
        }
    }

    pub fn transform(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        let num_deps = dependencies.len();
        for (m, &comp) in components.iter().enumerate() {
            let line = lines.get(comp);
            let width = line.size.x as usize;
            let irrev_offset = line.irrev_offset;
            let use_floats = !line.buf.as_ref().map(|b| b.is_short()).unwrap_or(false);
            if use_floats {
                let mut acc = vec![irrev_offset; width];
                for (n, dep) in dependencies.iter().enumerate() {
                    let mut factor = self.coefficients[m * num_deps + n];
                    let dep = match dep {
                        Some(d) if factor != 0.0 => lines.get(*d),
                        _ => continue,
                    };
                    let src = dep.buf.as_ref().unwrap_or_else(|| unreachable!());
                    if !dep.reversible {
                        let s = src.as_f32().unwrap_or_else(|| unreachable!());
                        for (a, &x) in acc.iter_mut().zip(s) {
                            *a += factor * x;
                        }
                    } else {
                        // Convert source samples from ints to floats on
                        // the fly
                        if dep.bit_depth > 0 {
                            factor *= 1.0 / (1i64 << dep.bit_depth) as f32;
                        }
                        match src.as_i32() {
                            Some(s) => {
                                for (a, &x) in acc.iter_mut().zip(s) {
                                    *a += factor * x as f32;
                                }
                            }
                            None => {
                                let s = src.as_i16().unwrap_or_else(|| unreachable!());
                                for (a, &x) in acc.iter_mut().zip(s) {
                                    *a += factor * f32::from(x);
                                }
                            }
                        }
                    }
                }
                let dst = lines.get_mut(comp).buf.as_mut().unwrap();
                dst.as_f32_mut()
                    .unwrap_or_else(|| unreachable!())
                    .copy_from_slice(&acc);
            } else {
                if self.short_coefficients.is_none() {
                    let (q, shift) = quantize_short_coefficients(&masked(
                        &self.coefficients,
                        dependencies,
                        num_deps,
                    ));
                    self.short_coefficients = Some(q);
                    self.short_downshift = shift;
                }
                let shorts = self.short_coefficients.as_ref().unwrap();
                let mut acc = vec![0i32; width];
                for (n, dep) in dependencies.iter().enumerate() {
                    let mut factor = i32::from(shorts[m * num_deps + n]);
                    let dep = match dep {
                        Some(d) if factor != 0 => lines.get(*d),
                        _ => continue,
                    };
                    let src = dep
                        .buf
                        .as_ref()
                        .and_then(|b| b.as_i16())
                        .unwrap_or_else(|| unreachable!());
                    if !dep.reversible {
                        for (a, &x) in acc.iter_mut().zip(src) {
                            *a += i32::from(x) * factor;
                        }
                    } else {
                        // Reversible shorts become fixed-point on the fly
                        let mut upshift = FIX_POINT - dep.bit_depth;
                        if upshift < 0 {
                            // High bit-depth reversible data is normally
                            // 32-bit, so accuracy is not a concern here
                            factor = (factor + (1 << (-upshift - 1))) >> (-upshift);
                            upshift = 0;
                        }
                        for (a, &x) in acc.iter_mut().zip(src) {
                            *a += (i32::from(x) << upshift) * factor;
                        }
                    }
                }
                let downshift = self.short_downshift;
                let mut offset = fix_point_offset32(irrev_offset);
                offset <<= downshift;
                offset += (1 << downshift) >> 1;
                let dst = lines.get_mut(comp).buf.as_mut().unwrap();
                let d = dst.as_i16_mut().unwrap_or_else(|| unreachable!());
                for (x, a) in d.iter_mut().zip(acc) {
                    *x = ((a + offset) >> downshift) as i16;
                }
            }
        }
    }

    /// Build the pseudo-inverse restricted to outputs that are actually
    /// consumed. Requires at least as many consumed outputs as
    /// dependencies, and refuses reversible inputs.
    pub fn prepare(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &Lines,
    ) -> Result<i32, &'static str> {
        let available_inputs = dependencies.len();
        let mut available_outputs = 0usize;
        for &comp in components {
            if lines.get(comp).num_consumers > 0 {
                available_outputs += 1;
            }
        }
        if self.inverse_coefficients.is_some() {
            return Ok(available_outputs as i32);
        }
        if available_outputs < available_inputs {
            return Err(
                "Encountered an underdetermined decorrelation transform block: fewer of its \
                 output components are computable than it has codestream inputs, so no \
                 pseudo-inverse exists.",
            );
        }
        for dep in dependencies.iter().flatten() {
            if lines.get(*dep).reversible {
                return Err(
                    "Encountered an irreversible decorrelation transform block which operates \
                     on reversible codestream sample data; such a block is not inverted during \
                     compression.",
                );
            }
        }

        // Forward matrix A restricted to the consumed outputs; A may have
        // more rows than columns.
        let mut a = Vec::with_capacity(available_outputs * available_inputs);
        for (m, &comp) in components.iter().enumerate() {
            if lines.get(comp).num_consumers < 1 {
                continue;
            }
            for n in 0..available_inputs {
                a.push(f64::from(self.coefficients[m * available_inputs + n]));
            }
        }

        // Normal equations: pinv_A = inv(A^t*A) * A^t, with inv(A^t*A)
        // obtained from the Cholesky factorization AtA = G*G^t.
        let k = available_inputs;
        let mut ata = vec![0.0f64; k * k];
        let mut max_energy = 0.0f64;
        for m in 0..k {
            for n in 0..k {
                let mut sum = 0.0;
                for r in 0..available_outputs {
                    sum += a[r * k + m] * a[r * k + n];
                }
                ata[m * k + n] = sum;
                if m == n && sum > max_energy {
                    max_energy = sum;
                }
            }
        }

        let mut g = vec![0.0f64; k * k];
        for m in 0..k {
            let mut sum = ata[m * k + m];
            for n in 0..m {
                sum -= g[m * k + n] * g[m * k + n];
            }
            if sum < max_energy * SINGULARITY_THRESHOLD {
                return Err(
                    "Near singular irreversible decorrelation transform block encountered in \
                     the multi-component transform description; its pseudo-inverse cannot be \
                     computed reliably.",
                );
            }
            g[m * k + m] = sum.sqrt();
            let factor = 1.0 / g[m * k + m];
            for n in (m + 1)..k {
                let mut sum = ata[n * k + m];
                for j in 0..m {
                    sum -= g[n * k + j] * g[m * k + j];
                }
                g[n * k + m] = sum * factor;
            }
        }

        // Invert the lower triangular factor
        let mut inv_g = vec![0.0f64; k * k];
        for n in 0..k {
            inv_g[n * k + n] = 1.0 / g[n * k + n];
            for m in (n + 1)..k {
                let mut sum = 0.0;
                for j in 0..m {
                    sum += inv_g[j * k + n] * g[m * k + j];
                }
                inv_g[m * k + n] = -sum / g[m * k + m];
            }
        }

        // pinv_A = inv(G)^t * inv(G) * A^t; evaluated as
        // (A * inv(G)^t) * inv(G), transposed on the way out.
        let mut a_invgt = vec![0.0f64; available_outputs * k];
        for m in 0..available_outputs {
            for n in 0..k {
                let mut sum = 0.0;
                for j in 0..k {
                    sum += a[m * k + j] * inv_g[n * k + j];
                }
                a_invgt[m * k + n] = sum;
            }
        }
        let mut pinv = vec![0.0f64; k * available_outputs];
        for m in 0..available_outputs {
            for n in 0..k {
                let mut sum = 0.0;
                for j in 0..k {
                    sum += a_invgt[m * k + j] * inv_g[j * k + n];
                }
                pinv[n * available_outputs + m] = sum;
            }
        }

        // Expand back to the full output set, zero for unconsumed outputs
        let mut inverse = vec![0.0f32; dependencies.len() * components.len()];
        let mut sp = pinv.iter();
        for m in 0..dependencies.len() {
            for (n, &comp) in components.iter().enumerate() {
                inverse[m * components.len() + n] = if lines.get(comp).num_consumers < 1 {
                    0.0
                } else {
                    *sp.next().unwrap_or_else(|| unreachable!()) as f32
                };
            }
        }
        self.inverse_coefficients = Some(inverse);
        Ok(available_outputs as i32)
    }

    pub fn inverse(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        let inverse = self
            .inverse_coefficients
            .as_ref()
            .unwrap_or_else(|| unreachable!());
        let num_comps = components.len();
        for (m, dep) in dependencies.iter().enumerate() {
            let dep = match dep {
                Some(d) => *d,
                None => continue,
            };
            let line = lines.get(dep);
            let width = line.size.x as usize;
            let irrev_offset = line.irrev_offset;
            let use_floats = !line.buf.as_ref().map(|b| b.is_short()).unwrap_or(false);
            if use_floats {
                let mut acc = vec![-irrev_offset; width];
                for (n, &comp) in components.iter().enumerate() {
                    let src_line = lines.get(comp);
                    if src_line.num_consumers < 1 {
                        continue;
                    }
                    let factor = inverse[m * num_comps + n];
                    let s = src_line
                        .buf
                        .as_ref()
                        .and_then(|b| b.as_f32())
                        .unwrap_or_else(|| unreachable!());
                    for (a, &x) in acc.iter_mut().zip(s) {
                        *a += factor * x;
                    }
                }
                let dst = lines.get_mut(dep).buf.as_mut().unwrap();
                dst.as_f32_mut()
                    .unwrap_or_else(|| unreachable!())
                    .copy_from_slice(&acc);
            } else {
                if self.short_coefficients.is_none() {
                    let (q, shift) = quantize_short_coefficients(inverse);
                    self.short_coefficients = Some(q);
                    self.short_downshift = shift;
                }
                let shorts = self.short_coefficients.as_ref().unwrap();
                let mut acc = vec![0i32; width];
                for (n, &comp) in components.iter().enumerate() {
                    let src_line = lines.get(comp);
                    if src_line.num_consumers < 1 {
                        continue;
                    }
                    let factor = i32::from(shorts[m * num_comps + n]);
                    let s = src_line
                        .buf
                        .as_ref()
                        .and_then(|b| b.as_i16())
                        .unwrap_or_else(|| unreachable!());
                    for (a, &x) in acc.iter_mut().zip(s) {
                        *a += i32::from(x) * factor;
                    }
                }
                let downshift = self.short_downshift;
                let offset = ((-fix_point_offset32(irrev_offset)) << downshift)
                    + ((1 << downshift) >> 1);
                let dst = lines.get_mut(dep).buf.as_mut().unwrap();
                let d = dst.as_i16_mut().unwrap_or_else(|| unreachable!());
                for (x, a) in d.iter_mut().zip(acc) {
                    *x = ((a + offset) >> downshift) as i16;
                }
            }
        }
    }
}

/// Forward coefficients with columns of missing dependencies zeroed, so
/// the 16-bit quantization ignores them
fn masked(coefficients: &[f32], dependencies: &[Option<LineHandle>], num_deps: usize) -> Vec<f32> {
    let mut out = coefficients.to_vec();
    for (n, dep) in dependencies.iter().enumerate() {
        if dep.is_none() {
            let mut idx = n;
            while idx < out.len() {
                out[idx] = 0.0;
                idx += num_deps;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::MultiLine;
    use mct_core::{Arena, Coords};

    fn float_line(lines: &mut Lines, width: i32, bit_depth: i32, data: Option<Vec<f32>>) -> LineHandle {
        let mut line = MultiLine {
            size: Coords::new(width, 1),
            need_irreversible: true,
            need_precise: true,
            bit_depth,
            ..Default::default()
        };
        line.allocate();
        if let Some(d) = data {
            line.buf = Some(mct_core::LineBuf::F32(d));
        }
        lines.alloc(line)
    }

    #[test]
    fn test_diagonal_matrix_inverts_to_reciprocal() {
        let mut lines: Lines = Arena::new();
        let d0 = float_line(&mut lines, 4, 8, None);
        let d1 = float_line(&mut lines, 4, 8, None);
        let c0 = float_line(&mut lines, 4, 8, None);
        let c1 = float_line(&mut lines, 4, 8, None);
        lines.get_mut(c0).num_consumers = 1;
        lines.get_mut(c1).num_consumers = 1;

        let mut m = MatrixBlock::new(vec![2.0, 0.0, 0.0, 2.0]);
        let comps = [c0, c1];
        let deps = [Some(d0), Some(d1)];
        let outstanding = m.prepare(&comps, &deps, &lines).unwrap();
        assert_eq!(outstanding, 2);
        let inv = m.inverse_coefficients.as_ref().unwrap();
        let expected = [0.5, 0.0, 0.0, 0.5];
        for (v, e) in inv.iter().zip(expected) {
            assert!((v - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_underdetermined_matrix_rejected() {
        let mut lines: Lines = Arena::new();
        let d0 = float_line(&mut lines, 4, 8, None);
        let d1 = float_line(&mut lines, 4, 8, None);
        let c0 = float_line(&mut lines, 4, 8, None);
        let c1 = float_line(&mut lines, 4, 8, None);
        lines.get_mut(c0).num_consumers = 1;
        // c1 is never consumed, so only one output is available for two
        // inputs.
        let mut m = MatrixBlock::new(vec![1.0, 0.0, 0.0, 1.0]);
        let err = m
            .prepare(&[c0, c1], &[Some(d0), Some(d1)], &lines)
            .unwrap_err();
        assert!(err.contains("underdetermined"));
    }

    #[test]
    fn test_near_singular_matrix_rejected() {
        let mut lines: Lines = Arena::new();
        let d0 = float_line(&mut lines, 4, 8, None);
        let d1 = float_line(&mut lines, 4, 8, None);
        let c0 = float_line(&mut lines, 4, 8, None);
        let c1 = float_line(&mut lines, 4, 8, None);
        lines.get_mut(c0).num_consumers = 1;
        lines.get_mut(c1).num_consumers = 1;
        // Rank deficient: second row is a copy of the first.
        let mut m = MatrixBlock::new(vec![1.0, 2.0, 1.0, 2.0]);
        let err = m
            .prepare(&[c0, c1], &[Some(d0), Some(d1)], &lines)
            .unwrap_err();
        assert!(err.contains("singular"));
    }

    #[test]
    fn test_float_round_trip_within_epsilon() {
        let mut lines: Lines = Arena::new();
        let d0 = float_line(&mut lines, 2, 8, Some(vec![0.25, -0.5]));
        let d1 = float_line(&mut lines, 2, 8, Some(vec![0.125, 0.375]));
        let c0 = float_line(&mut lines, 2, 8, None);
        let c1 = float_line(&mut lines, 2, 8, None);
        lines.get_mut(c0).num_consumers = 1;
        lines.get_mut(c1).num_consumers = 1;

        let mut m = MatrixBlock::new(vec![2.0, 0.0, 0.0, 2.0]);
        let comps = [c0, c1];
        let deps = [Some(d0), Some(d1)];
        m.transform(&comps, &deps, &mut lines);
        m.prepare(&comps, &deps, &lines).unwrap();
        m.inverse(&comps, &deps, &mut lines);
        let r0 = lines.get(d0).buf.as_ref().unwrap().as_f32().unwrap();
        assert!((r0[0] - 0.25).abs() < 1e-6 && (r0[1] + 0.5).abs() < 1e-6);
        let r1 = lines.get(d1).buf.as_ref().unwrap().as_f32().unwrap();
        assert!((r1[0] - 0.125).abs() < 1e-6 && (r1[1] - 0.375).abs() < 1e-6);
    }
}
