//! Dependency (prediction) blocks
//!
//! Each output is the matching input plus a prediction formed from the
//! outputs before it, so the coefficient matrix is lower triangular and
//! the block is invertible whenever every output is available. Reversible
//! blocks carry integer coefficients with power-of-two divisors on the
//! diagonal; irreversible blocks carry a strictly lower triangular real
//! matrix and per-component real offsets.

use mct_core::{LineHandle, MctError, MctResult};

use crate::block::{quantize_short_coefficients, Lines};
use crate::description::DependencyCoefficients;

#[derive(Debug)]
enum DepCoefficients {
    Reversible {
        /// Row-major `N x N` lower triangular, divisors on the diagonal
        matrix: Vec<i32>,
        offsets: Vec<i32>,
    },
    Irreversible {
        /// Row-major `N x N` strictly lower triangular
        matrix: Vec<f32>,
        offsets: Vec<f32>,
    },
}

#[derive(Debug)]
pub struct DependencyBlock {
    coefficients: DepCoefficients,
    short_matrix: Option<Vec<i16>>,
    short_downshift: i32,
}

impl DependencyBlock {
    /// Expand the declared triangular coefficient list into square form.
    ///
    /// Reversible lists carry `m` sub-diagonal entries plus a diagonal
    /// divisor per row (the first row's divisor is implicitly 1);
    /// irreversible lists carry the strictly lower triangle only.
    pub fn from_description(
        desc: &DependencyCoefficients,
        num_components: usize,
    ) -> MctResult<Self> {
        let n = num_components;
        let coefficients = match desc {
            DependencyCoefficients::Reversible(triangular) => {
                let expected = (n * (n + 1)) / 2 - 1;
                if triangular.len() != expected {
                    return Err(MctError::InvalidConfiguration(format!(
                        "reversible dependency transform over {n} components requires \
                         {expected} triangular coefficients, found {}",
                        triangular.len()
                    )));
                }
                let mut matrix = vec![0i32; n * n];
                let mut src = triangular.iter();
                for m in 0..n {
                    for k in 0..m {
                        matrix[m * n + k] = *src.next().unwrap_or_else(|| unreachable!());
                    }
                    matrix[m * n + m] = if m == 0 {
                        1
                    } else {
                        *src.next().unwrap_or_else(|| unreachable!())
                    };
                }
                for m in 0..n {
                    let divisor = matrix[m * n + m];
                    if divisor <= 0 || (divisor & (divisor - 1)) != 0 {
                        return Err(MctError::InvalidConfiguration(format!(
                            "reversible dependency transforms must have exact positive powers \
                             of 2 on the diagonal of their triangular coefficient matrix; \
                             these are the divisors used to scale and round the prediction \
                             terms; the offending divisor is {divisor}"
                        )));
                    }
                }
                DepCoefficients::Reversible {
                    matrix,
                    offsets: vec![0; n],
                }
            }
            DependencyCoefficients::Irreversible(triangular) => {
                let expected = (n * (n - 1)) / 2;
                if triangular.len() != expected {
                    return Err(MctError::InvalidConfiguration(format!(
                        "irreversible dependency transform over {n} components requires \
                         {expected} triangular coefficients, found {}",
                        triangular.len()
                    )));
                }
                let mut matrix = vec![0.0f32; n * n];
                let mut src = triangular.iter();
                for m in 0..n {
                    for k in 0..m {
                        matrix[m * n + k] = *src.next().unwrap_or_else(|| unreachable!());
                    }
                }
                DepCoefficients::Irreversible {
                    matrix,
                    offsets: vec![0.0; n],
                }
            }
        };
        Ok(Self {
            coefficients,
            short_matrix: None,
            short_downshift: 0,
        })
    }

    pub fn is_reversible(&self) -> bool {
        matches!(self.coefficients, DepCoefficients::Reversible { .. })
    }

    /// Whether any coefficient exceeds the 16-bit range, forcing the
    /// precise representation (reversible blocks only)
    pub fn needs_precise(&self) -> bool {
        match &self.coefficients {
            DepCoefficients::Reversible { matrix, .. } => {
                matrix.iter().any(|&c| !(-0x7FFF..=0x7FFF).contains(&c))
            }
            DepCoefficients::Irreversible { .. } => false,
        }
    }

    /// Declared per-component offsets, set during network construction
    pub fn set_offsets(&mut self, rev: &[i32], irrev: &[f32]) {
        match &mut self.coefficients {
            DepCoefficients::Reversible { offsets, .. } => {
                for (dst, &src) in offsets.iter_mut().zip(rev) {
                    *dst = src;
                }
            }
            DepCoefficients::Irreversible { offsets, .. } => {
                for (dst, &src) in offsets.iter_mut().zip(irrev) {
                    *dst = src;
                }
            }
        }
    }

    /// Rescale irreversible coefficients so predictions act on normalized
    /// data; reversible blocks need no normalization.
    pub fn normalize(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        let (matrix, offsets) = match &mut self.coefficients {
            DepCoefficients::Irreversible { matrix, offsets } => (matrix, offsets),
            DepCoefficients::Reversible { .. } => return,
        };
        let num = components.len();
        let mut need_precise = false;
        for (n, &comp) in components.iter().enumerate() {
            let dep_bit_depth = dependencies[n].map(|d| lines.get(d).bit_depth);
            let line = lines.get_mut(comp);
            if line.bit_depth == 0 {
                // Better not risk fixed-point overflow
                need_precise = true;
                if let Some(bd) = dep_bit_depth {
                    line.bit_depth = bd;
                }
            } else if dep_bit_depth == Some(0) {
                need_precise = true;
            }
            if line.need_precise {
                need_precise = true;
            }

            if line.bit_depth > 0 {
                let source_factor = (1i64 << line.bit_depth) as f32;
                for m in (n + 1)..num {
                    matrix[m * num + n] *= source_factor;
                }
                let target_factor = 1.0 / source_factor;
                for m in 0..n {
                    matrix[n * num + m] *= target_factor;
                }
                offsets[n] *= target_factor;
            }
        }
        if need_precise {
            for &comp in components {
                lines.get_mut(comp).need_precise = true;
            }
            for dep in dependencies.iter().flatten() {
                lines.get_mut(*dep).need_precise = true;
            }
        }
    }

    pub fn transform(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        let num = components.len();
        for m in 0..num {
            let comp = components[m];
            match &self.coefficients {
                DepCoefficients::Irreversible { offsets, .. } => {
                    let offset = offsets[m];
                    match dependencies[m] {
                        Some(dep) => {
                            let (dst, src) = lines.pair_mut(comp, dep);
                            dst.copy_from(src, 0, offset);
                        }
                        None => lines.get_mut(comp).reset(0, offset),
                    }
                    if m > 0 {
                        self.irrev_predict(components, lines, m, false);
                    }
                }
                DepCoefficients::Reversible { offsets, .. } => {
                    let offset = offsets[m];
                    match dependencies[m] {
                        Some(dep) => {
                            let (dst, src) = lines.pair_mut(comp, dep);
                            dst.copy_from(src, offset, 0.0);
                        }
                        None => lines.get_mut(comp).reset(offset, 0.0),
                    }
                    if m > 0 {
                        self.rev_predict(components, lines, m, false);
                    }
                }
            }
        }

        for &comp in components {
            let line = lines.get_mut(comp);
            let (rev, irrev) = (line.rev_offset, line.irrev_offset);
            line.apply_offset(rev, irrev);
        }
    }

    pub fn prepare(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &Lines,
    ) -> Result<i32, &'static str> {
        for &comp in components {
            if lines.get(comp).num_consumers < 1 {
                return Err(
                    "Dependency transform block cannot be inverted or partially inverted \
                     unless a contiguous prefix of the output components can be computed by \
                     downstream transform blocks, or by the application supplying them.",
                );
            }
        }
        if !self.is_reversible() {
            for dep in dependencies.iter().flatten() {
                if lines.get(*dep).reversible {
                    return Err(
                        "Encountered an irreversible dependency transform block which operates \
                         on reversible codestream sample data; such a block is not inverted \
                         during compression.",
                    );
                }
            }
        }
        Ok(components.len() as i32)
    }

    pub fn inverse(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        let num = components.len();
        let reversible = self.is_reversible();
        for m in (0..num).rev() {
            let comp = components[m];
            if reversible {
                if m > 0 {
                    self.rev_predict(components, lines, m, true);
                }
                if let Some(dep) = dependencies[m] {
                    let offset = match &self.coefficients {
                        DepCoefficients::Reversible { offsets, .. } => offsets[m],
                        DepCoefficients::Irreversible { .. } => unreachable!(),
                    };
                    let (dst, src) = lines.pair_mut(dep, comp);
                    let rev_offset = dst.rev_offset;
                    dst.copy_from(src, -rev_offset - offset, 0.0);
                }
            } else {
                if m > 0 {
                    self.irrev_predict(components, lines, m, true);
                }
                if let Some(dep) = dependencies[m] {
                    let offset = match &self.coefficients {
                        DepCoefficients::Irreversible { offsets, .. } => offsets[m],
                        DepCoefficients::Reversible { .. } => unreachable!(),
                    };
                    let (dst, src) = lines.pair_mut(dep, comp);
                    debug_assert!(!(dst.reversible || src.reversible));
                    let scale = (1i64 << src.bit_depth) as f32 / (1i64 << dst.bit_depth) as f32;
                    let irrev_offset = dst.irrev_offset;
                    dst.copy_from(src, 0, -irrev_offset - scale * offset);
                }
            }
        }
    }

    /// Add (or, inverting, subtract) the irreversible prediction of
    /// component `m` from the components before it
    fn irrev_predict(&mut self, components: &[LineHandle], lines: &mut Lines, m: usize, invert: bool) {
        let num = components.len();
        let matrix = match &self.coefficients {
            DepCoefficients::Irreversible { matrix, .. } => matrix,
            DepCoefficients::Reversible { .. } => unreachable!(),
        };
        let line = lines.get(components[m]);
        let width = line.size.x as usize;
        let use_floats = !line.buf.as_ref().map(|b| b.is_short()).unwrap_or(false);
        if use_floats {
            let mut acc = vec![0.0f32; width];
            for (n, &src_h) in components.iter().enumerate().take(m) {
                let factor = matrix[m * num + n];
                if factor == 0.0 {
                    continue;
                }
                let src = lines
                    .get(src_h)
                    .buf
                    .as_ref()
                    .and_then(|b| b.as_f32())
                    .unwrap_or_else(|| unreachable!());
                for (a, &x) in acc.iter_mut().zip(src) {
                    *a += x * factor;
                }
            }
            let dst = lines.get_mut(components[m]).buf.as_mut().unwrap();
            let d = dst.as_f32_mut().unwrap_or_else(|| unreachable!());
            if invert {
                for (x, a) in d.iter_mut().zip(acc) {
                    *x -= a;
                }
            } else {
                for (x, a) in d.iter_mut().zip(acc) {
                    *x += a;
                }
            }
        } else {
            if self.short_matrix.is_none() {
                let (q, shift) = quantize_short_coefficients(matrix);
                self.short_matrix = Some(q);
                self.short_downshift = shift;
            }
            let shorts = self.short_matrix.as_ref().unwrap();
            let downshift = self.short_downshift;
            let mut acc = vec![(1i32 << downshift) >> 1; width];
            for (n, &src_h) in components.iter().enumerate().take(m) {
                let factor = i32::from(shorts[m * num + n]);
                if factor == 0 {
                    continue;
                }
                let src = lines
                    .get(src_h)
                    .buf
                    .as_ref()
                    .and_then(|b| b.as_i16())
                    .unwrap_or_else(|| unreachable!());
                for (a, &x) in acc.iter_mut().zip(src) {
                    *a += i32::from(x) * factor;
                }
            }
            let dst = lines.get_mut(components[m]).buf.as_mut().unwrap();
            let d = dst.as_i16_mut().unwrap_or_else(|| unreachable!());
            if invert {
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

    /// Integer prediction of component `m`, rounded by the diagonal divisor
    fn rev_predict(&mut self, components: &[LineHandle], lines: &mut Lines, m: usize, invert: bool) {
        let num = components.len();
        let matrix = match &self.coefficients {
            DepCoefficients::Reversible { matrix, .. } => matrix,
            DepCoefficients::Irreversible { .. } => unreachable!(),
        };
        let divisor = matrix[m * num + m];
        let mut downshift = 0;
        while (1 << downshift) < divisor {
            downshift += 1;
        }
        debug_assert_eq!(1 << downshift, divisor);

        let width = lines.get(components[m]).size.x as usize;
        let mut acc = vec![(1i32 << downshift) >> 1; width];
        for (n, &src_h) in components.iter().enumerate().take(m) {
            let factor = matrix[m * num + n];
            if factor == 0 {
                continue;
            }
            let src = lines.get(src_h).buf.as_ref().unwrap_or_else(|| unreachable!());
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
        let dst = lines.get_mut(components[m]).buf.as_mut().unwrap();
        match dst.as_i32_mut() {
            Some(d) => {
                if invert {
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
                let d = dst.as_i16_mut().unwrap_or_else(|| unreachable!());
                if invert {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::MultiLine;
    use mct_core::{Arena, Coords, LineBuf};

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
    fn test_reversible_triangle_expansion() {
        // N = 3: entries are row1 [c10, d1], row2 [c20, c21, d2].
        let block = DependencyBlock::from_description(
            &DependencyCoefficients::Reversible(vec![5, 2, -3, 7, 4]),
            3,
        )
        .unwrap();
        match &block.coefficients {
            DepCoefficients::Reversible { matrix, .. } => {
                assert_eq!(matrix, &[1, 0, 0, 5, 2, 0, -3, 7, 4]);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn test_non_power_of_two_diagonal_rejected() {
        let err = DependencyBlock::from_description(
            &DependencyCoefficients::Reversible(vec![5, 3]),
            2,
        )
        .unwrap_err();
        assert!(matches!(err, MctError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_reversible_round_trip_exact() {
        let mut lines: Lines = Arena::new();
        let inputs = [vec![9i32, -4, 100, 3], vec![-7i32, 20, 0, 55]];
        let d0 = int_line(&mut lines, Some(inputs[0].clone()), 4);
        let d1 = int_line(&mut lines, Some(inputs[1].clone()), 4);
        let c0 = int_line(&mut lines, None, 4);
        let c1 = int_line(&mut lines, None, 4);
        let mut block = DependencyBlock::from_description(
            &DependencyCoefficients::Reversible(vec![3, 2]),
            2,
        )
        .unwrap();
        block.set_offsets(&[10, -5], &[]);
        let comps = [c0, c1];
        let deps = [Some(d0), Some(d1)];
        block.transform(&comps, &deps, &mut lines);
        block.inverse(&comps, &deps, &mut lines);
        for (dep, orig) in [d0, d1].iter().zip(&inputs) {
            let got = lines.get(*dep).buf.as_ref().unwrap().as_i32().unwrap();
            assert_eq!(got, orig.as_slice());
        }
    }

    fn float_line(lines: &mut Lines, data: Option<Vec<f32>>, width: i32) -> LineHandle {
        let mut line = MultiLine {
            size: Coords::new(width, 1),
            reversible: false,
            need_precise: true,
            bit_depth: 8,
            num_consumers: 1,
            ..Default::default()
        };
        line.allocate();
        if let Some(d) = data {
            line.buf = Some(LineBuf::F32(d));
        }
        lines.alloc(line)
    }

    #[test]
    fn test_irreversible_round_trip_with_offsets() {
        let mut lines: Lines = Arena::new();
        let inputs = [
            vec![0.5f32, -0.25, 0.125, 1.0],
            vec![-1.5f32, 0.25, -0.5, 0.0],
        ];
        let d0 = float_line(&mut lines, Some(inputs[0].clone()), 4);
        let d1 = float_line(&mut lines, Some(inputs[1].clone()), 4);
        let c0 = float_line(&mut lines, None, 4);
        let c1 = float_line(&mut lines, None, 4);
        let mut block = DependencyBlock::from_description(
            &DependencyCoefficients::Irreversible(vec![0.5]),
            2,
        )
        .unwrap();
        block.set_offsets(&[], &[0.25, -0.5]);
        let comps = [c0, c1];
        let deps = [Some(d0), Some(d1)];
        block.transform(&comps, &deps, &mut lines);
        // c0 = d0 + 0.25; c1 = d1 - 0.5 + 0.5 * c0
        assert_eq!(
            lines.get(c1).buf.as_ref().unwrap().as_f32().unwrap(),
            &[-1.625, -0.25, -0.8125, 0.125]
        );
        block.inverse(&comps, &deps, &mut lines);
        for (dep, orig) in [d0, d1].iter().zip(&inputs) {
            let got = lines.get(*dep).buf.as_ref().unwrap().as_f32().unwrap();
            assert_eq!(got, orig.as_slice());
        }
    }

    #[test]
    fn test_unconsumed_output_blocks_inversion() {
        let mut lines: Lines = Arena::new();
        let d0 = int_line(&mut lines, None, 4);
        let d1 = int_line(&mut lines, None, 4);
        let c0 = int_line(&mut lines, None, 4);
        let c1 = int_line(&mut lines, None, 4);
        lines.get_mut(c1).num_consumers = 0;
        let mut block = DependencyBlock::from_description(
            &DependencyCoefficients::Reversible(vec![1, 2]),
            2,
        )
        .unwrap();
        let err = block
            .prepare(&[c0, c1], &[Some(d0), Some(d1)], &lines)
            .unwrap_err();
        assert!(err.contains("contiguous prefix"));
    }
}
