//! Reversible decorrelation blocks
//!
//! An N-input, N-output integer transform realized as N+1 in-place lifting
//! passes over the columns of an `N x (N+1)` coefficient table. Pass `n`
//! updates component `(N-1) - (n mod N)` by the rounded, divisor-scaled
//! sum of the other components; the divisor in each pass must be a power
//! of two, and a negative divisor in the final pass flips the sign of the
//! updated component. Integer offsets are applied after the forward
//! passes, so the whole block inverts exactly.

use mct_core::{LineHandle, MctError, MctResult};

use crate::block::Lines;

#[derive(Debug)]
pub struct RxformBlock {
    /// Row-major `N x (N+1)` integer table
    pub coefficients: Vec<i32>,
}

/// The destination component and downshift of lifting pass `n`
fn pass_params(coefficients: &[i32], num_components: usize, n: usize) -> (usize, i32, bool) {
    let dst_idx = (num_components - 1) - (n % num_components);
    let divisor = coefficients[dst_idx * (num_components + 1) + n];
    let negate = n == num_components && divisor < 0;
    let abs_divisor = if negate { -divisor } else { divisor };
    let mut downshift = 0;
    while (1 << downshift) < abs_divisor {
        downshift += 1;
    }
    debug_assert_eq!(1 << downshift, abs_divisor);
    (dst_idx, downshift, negate)
}

impl RxformBlock {
    pub fn new(coefficients: Vec<i32>) -> Self {
        Self { coefficients }
    }

    /// Reject divisors that are not exact positive powers of two (the
    /// final pass alone may carry a negative sign).
    pub fn validate_divisors(&self, num_components: usize) -> MctResult<()> {
        for n in 0..=num_components {
            let dst_idx = (num_components - 1) - (n % num_components);
            let divisor = self.coefficients[dst_idx * (num_components + 1) + n];
            let abs_divisor = if n == num_components && divisor < 0 {
                -divisor
            } else {
                divisor
            };
            if abs_divisor <= 0 || (abs_divisor & (abs_divisor - 1)) != 0 {
                return Err(MctError::InvalidConfiguration(format!(
                    "reversible decorrelation transforms must have exact positive powers of 2 \
                     for the divisors which scale and round the update terms; the offending \
                     divisor is {divisor}"
                )));
            }
        }
        Ok(())
    }

    /// Whether any coefficient falls outside the 16-bit range, forcing the
    /// precise representation onto every line this block touches
    pub fn needs_precise(&self) -> bool {
        self.coefficients.iter().any(|&c| !(-0x7FFF..=0x7FFF).contains(&c))
    }

    pub fn transform(
        &mut self,
        components: &[LineHandle],
        dependencies: &[Option<LineHandle>],
        lines: &mut Lines,
    ) {
        let num = components.len();
        debug_assert_eq!(dependencies.len(), num);

        // Seed the outputs from the inputs; missing inputs read as zero
        for (m, &comp) in components.iter().enumerate() {
            match dependencies[m] {
                Some(dep) => {
                    let (dst, src) = lines.pair_mut(comp, dep);
                    dst.copy_from(src, 0, 0.0);
                }
                None => lines.get_mut(comp).reset(0, 0.0),
            }
        }

        for n in 0..=num {
            self.lifting_pass(components, lines, n, false);
        }

        for &comp in components {
            let line = lines.get_mut(comp);
            let rev_offset = line.rev_offset;
            line.apply_offset(rev_offset, 0.0);
        }
    }

    pub fn prepare(
        &mut self,
        components: &[LineHandle],
        _dependencies: &[Option<LineHandle>],
        lines: &Lines,
    ) -> Result<i32, &'static str> {
        // Inversion needs every output; there is no partial inverse.
        for &comp in components {
            if lines.get(comp).num_consumers < 1 {
                return Err(
                    "Reversible decorrelation transform block cannot be inverted unless all of \
                     its outputs can be computed by downstream transform blocks, or by the \
                     application supplying them.",
                );
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
        for n in (0..=num).rev() {
            self.lifting_pass(components, lines, n, true);
        }

        // Deliver to the inputs, undoing their offsets
        for (m, &comp) in components.iter().enumerate() {
            if let Some(dep) = dependencies[m] {
                let (dst, src) = lines.pair_mut(dep, comp);
                let rev_offset = dst.rev_offset;
                dst.copy_from(src, -rev_offset, 0.0);
            }
        }
    }

    /// One lifting pass; `invert` subtracts what the forward pass added
    fn lifting_pass(&self, components: &[LineHandle], lines: &mut Lines, n: usize, invert: bool) {
        let num = components.len();
        let (dst_idx, downshift, negate) = pass_params(&self.coefficients, num, n);
        let width = lines.get(components[dst_idx]).size.x as usize;

        let mut acc = vec![(1i32 << downshift) >> 1; width];
        for (m, &comp) in components.iter().enumerate() {
            if m == dst_idx {
                continue;
            }
            let factor = self.coefficients[m * (num + 1) + n];
            if factor == 0 {
                continue;
            }
            let src = lines.get(comp).buf.as_ref().unwrap_or_else(|| unreachable!());
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

        let dst = lines
            .get_mut(components[dst_idx])
            .buf
            .as_mut()
            .unwrap_or_else(|| unreachable!());
        match dst.as_i32_mut() {
            Some(d) => {
                for (x, a) in d.iter_mut().zip(acc) {
                    let update = a >> downshift;
                    *x = match (negate, invert) {
                        (false, false) => *x - update,
                        (false, true) => *x + update,
                        (true, false) => -(*x - update),
                        (true, true) => -*x + update,
                    };
                }
            }
            None => {
                let d = dst.as_i16_mut().unwrap_or_else(|| unreachable!());
                for (x, a) in d.iter_mut().zip(acc) {
                    let update = (a >> downshift) as i16;
                    *x = match (negate, invert) {
                        (false, false) => x.wrapping_sub(update),
                        (false, true) => x.wrapping_add(update),
                        (true, false) => update.wrapping_sub(*x),
                        (true, true) => update.wrapping_sub(*x),
                    };
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

    fn int_line(lines: &mut Lines, data: Option<Vec<i32>>, rev_offset: i32) -> LineHandle {
        let width = data.as_ref().map(|d| d.len()).unwrap_or(4) as i32;
        let mut line = MultiLine {
            size: Coords::new(width, 1),
            reversible: true,
            need_precise: true,
            bit_depth: 8,
            rev_offset,
            num_consumers: 1,
            ..Default::default()
        };
        line.allocate();
        if let Some(d) = data {
            line.buf = Some(LineBuf::I32(d));
        }
        lines.alloc(line)
    }

    fn round_trip(coefficients: Vec<i32>, inputs: Vec<Vec<i32>>, offsets: Vec<i32>) {
        let mut lines: Lines = Arena::new();
        let deps: Vec<_> = inputs
            .iter()
            .map(|d| Some(int_line(&mut lines, Some(d.clone()), 0)))
            .collect();
        let comps: Vec<_> = offsets
            .iter()
            .map(|&off| int_line(&mut lines, None, off))
            .collect();
        let mut block = RxformBlock::new(coefficients);
        block.validate_divisors(comps.len()).unwrap();
        block.transform(&comps, &deps, &mut lines);
        // Compression strips the component offsets before rows re-enter
        // the network; the block inverse itself never touches them.
        for &comp in &comps {
            let line = lines.get_mut(comp);
            let rev_offset = line.rev_offset;
            line.apply_offset(-rev_offset, 0.0);
        }
        block.inverse(&comps, &deps, &mut lines);
        for (dep, orig) in deps.iter().zip(&inputs) {
            let got = lines
                .get(dep.unwrap())
                .buf
                .as_ref()
                .unwrap()
                .as_i32()
                .unwrap();
            assert_eq!(got, orig.as_slice());
        }
    }

    #[test]
    fn test_round_trip_exact_with_offsets() {
        // Two components, three passes; the divisor of pass n sits at
        // row (N-1)-(n mod N), column n, and each must be a power of two.
        let coefficients = vec![
            3, 2, 4, //
            2, 1, 2,
        ];
        round_trip(
            coefficients,
            vec![vec![7, -100, 31, 0], vec![-2, 55, 1, 9]],
            vec![17, -4],
        );
    }

    #[test]
    fn test_round_trip_with_negative_final_divisor() {
        // A negative divisor in the last pass negates the updated
        // component; the inverse must still restore the inputs exactly.
        let coefficients = vec![
            1, 2, 4, //
            2, 1, -4,
        ];
        round_trip(
            coefficients,
            vec![vec![12, 3, -8, 120], vec![0, -1, 44, -77]],
            vec![0, 0],
        );
    }

    #[test]
    fn test_non_power_of_two_divisor_rejected() {
        let block = RxformBlock::new(vec![
            1, 2, 4, //
            3, 1, 2,
        ]);
        let err = block.validate_divisors(2).unwrap_err();
        assert!(matches!(err, MctError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_missing_input_reads_as_zero() {
        let mut lines: Lines = Arena::new();
        let d0 = int_line(&mut lines, Some(vec![5, -5]), 0);
        let c0 = int_line(&mut lines, Some(vec![99, 99]), 0);
        let c1 = int_line(&mut lines, Some(vec![99, 99]), 0);
        let mut block = RxformBlock::new(vec![
            1, 1, 2, //
            1, 1, 2,
        ]);
        let comps = [c0, c1];
        let deps = [Some(d0), None];
        block.transform(&comps, &deps, &mut lines);
        // The second component has no input; the passes must see it seeded
        // with zeros, not with the stale sentinel contents.
        assert_eq!(
            lines.get(c0).buf.as_ref().unwrap().as_i32().unwrap(),
            &[10, -10]
        );
        assert_eq!(
            lines.get(c1).buf.as_ref().unwrap().as_i32().unwrap(),
            &[-15, 15]
        );
    }
}
