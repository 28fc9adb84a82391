//! Intermediate component lines
//!
//! A [`MultiLine`] is one row-buffer of one intermediate component in the
//! transform network, together with the precision, reversibility and
//! consumer bookkeeping that the network propagates across blocks. The
//! three primitives `reset`, `apply_offset` and `copy_from` are the only
//! way blocks exchange sample data, so every numeric-format conversion is
//! centralized here.

use mct_core::consts::FIX_POINT;
use mct_core::{BlockHandle, Coords, LineBuf, LineHandle};

/// One row of one intermediate component
#[derive(Debug)]
pub struct MultiLine {
    /// Row buffer; `None` until resources are created (or for a line that
    /// was bypassed away)
    pub buf: Option<LineBuf>,
    /// Absolute row index of the data currently in `buf`; -1 before the
    /// first row is produced
    pub row_idx: i32,
    pub size: Coords,
    /// Declared dynamic range in bits; 0 means not yet known
    pub bit_depth: i32,
    pub reversible: bool,
    pub need_irreversible: bool,
    pub need_precise: bool,
    pub is_constant: bool,
    /// Number of block dependency slots and collection outputs reading this
    /// line
    pub num_consumers: i32,
    /// Synthesis only: consumers that have not yet taken the current row
    pub outstanding_consumers: i32,
    /// Analysis only: the current row has been written by a consumer but
    /// not yet absorbed by the generating block's inverse
    pub waiting_for_inversion: bool,
    pub rev_offset: i32,
    pub irrev_offset: f32,
    /// Pass-through alias installed by the bypass optimization
    pub bypass: Option<LineHandle>,
    /// Block whose transform generates this line, if any
    pub block: Option<BlockHandle>,
    /// Index into the codestream collection, or -1 for interior lines
    pub collection_idx: i32,
}

impl Default for MultiLine {
    fn default() -> Self {
        Self {
            buf: None,
            row_idx: -1,
            size: Coords::default(),
            bit_depth: 0,
            reversible: false,
            need_irreversible: false,
            need_precise: false,
            is_constant: false,
            num_consumers: 0,
            outstanding_consumers: 0,
            waiting_for_inversion: false,
            rev_offset: 0,
            irrev_offset: 0.0,
            bypass: None,
            block: None,
            collection_idx: -1,
        }
    }
}

/// Quantize an irreversible offset to the 16-bit fixed-point grid
fn fix_point_offset(irrev_off: f32) -> i16 {
    (0.5 + f64::from(irrev_off) * f64::from(1 << FIX_POINT)).floor() as i16
}

impl MultiLine {
    /// Allocate the row buffer for this line.
    ///
    /// Precise lines get a 32-bit representation; everything else uses
    /// 16-bit words (absolute for reversible data, fixed-point otherwise).
    pub fn allocate(&mut self) {
        let use_shorts = !self.need_precise;
        self.buf = Some(LineBuf::new(
            self.size.x as usize,
            use_shorts,
            self.reversible,
        ));
    }

    /// Set every sample to a constant offset value
    pub fn reset(&mut self, rev_off: i32, irrev_off: f32) {
        let reversible = self.reversible;
        let buf = self.buf.as_mut().unwrap_or_else(|| unreachable!());
        if reversible {
            buf.fill_int(rev_off);
        } else {
            match buf {
                LineBuf::I16(v) => v.fill(fix_point_offset(irrev_off)),
                LineBuf::F32(v) => v.fill(irrev_off),
                LineBuf::I32(_) => unreachable!(),
            }
        }
    }

    /// Add an offset to the existing contents
    pub fn apply_offset(&mut self, rev_off: i32, irrev_off: f32) {
        let reversible = self.reversible;
        let buf = match self.buf.as_mut() {
            Some(b) => b,
            None => return,
        };
        if reversible {
            if rev_off == 0 {
                return;
            }
            match buf {
                LineBuf::I16(v) => {
                    for x in v.iter_mut() {
                        *x = x.wrapping_add(rev_off as i16);
                    }
                }
                LineBuf::I32(v) => {
                    for x in v.iter_mut() {
                        *x += rev_off;
                    }
                }
                LineBuf::F32(_) => unreachable!(),
            }
        } else {
            if irrev_off == 0.0 {
                return;
            }
            match buf {
                LineBuf::F32(v) => {
                    for x in v.iter_mut() {
                        *x += irrev_off;
                    }
                }
                LineBuf::I16(v) => {
                    let off = fix_point_offset(irrev_off);
                    for x in v.iter_mut() {
                        *x = x.wrapping_add(off);
                    }
                }
                LineBuf::I32(_) => unreachable!(),
            }
        }
    }

    /// Copy a source line into this one, converting between representations
    /// and adding the given offsets.
    ///
    /// Reversible destinations require a reversible source. Irreversible
    /// destinations rescale by the ratio of the two sides' bit-depth
    /// derived ranges (reversible sources are first divided by
    /// `2^bit_depth` to reach the normalized range).
    pub fn copy_from(&mut self, src: &MultiLine, rev_offset: i32, irrev_offset: f32) {
        assert_eq!(self.size.x, src.size.x);
        let dst_reversible = self.reversible;
        let dst_bit_depth = self.bit_depth;
        let dst = self.buf.as_mut().unwrap_or_else(|| unreachable!());
        let sbuf = src.buf.as_ref().unwrap_or_else(|| unreachable!());
        if dst_reversible {
            assert!(src.reversible);
            match (dst, sbuf) {
                (LineBuf::I32(d), LineBuf::I32(s)) => {
                    for (x, y) in d.iter_mut().zip(s.iter()) {
                        *x = *y + rev_offset;
                    }
                }
                (LineBuf::I16(d), LineBuf::I16(s)) => {
                    for (x, y) in d.iter_mut().zip(s.iter()) {
                        *x = y.wrapping_add(rev_offset as i16);
                    }
                }
                (LineBuf::I32(d), LineBuf::I16(s)) => {
                    for (x, y) in d.iter_mut().zip(s.iter()) {
                        *x = i32::from(*y) + rev_offset;
                    }
                }
                (LineBuf::I16(d), LineBuf::I32(s)) => {
                    for (x, y) in d.iter_mut().zip(s.iter()) {
                        *x = (*y + rev_offset) as i16;
                    }
                }
                _ => unreachable!(),
            }
        } else {
            match dst {
                LineBuf::F32(d) => {
                    if src.reversible {
                        // Convert to the irreversible representation on the
                        // way through
                        let factor = 1.0f32 / (1i64 << dst_bit_depth) as f32;
                        match sbuf {
                            LineBuf::I32(s) => {
                                for (x, y) in d.iter_mut().zip(s.iter()) {
                                    *x = *y as f32 * factor + irrev_offset;
                                }
                            }
                            LineBuf::I16(s) => {
                                for (x, y) in d.iter_mut().zip(s.iter()) {
                                    *x = f32::from(*y) * factor + irrev_offset;
                                }
                            }
                            LineBuf::F32(_) => unreachable!(),
                        }
                    } else {
                        let s = sbuf.as_f32().unwrap_or_else(|| unreachable!());
                        if src.bit_depth == dst_bit_depth {
                            for (x, y) in d.iter_mut().zip(s.iter()) {
                                *x = *y + irrev_offset;
                            }
                        } else {
                            let factor =
                                (1i64 << src.bit_depth) as f32 / (1i64 << dst_bit_depth) as f32;
                            for (x, y) in d.iter_mut().zip(s.iter()) {
                                *x = *y * factor + irrev_offset;
                            }
                        }
                    }
                }
                LineBuf::I16(d) => {
                    let s = sbuf.as_i16().unwrap_or_else(|| unreachable!());
                    let off16 = fix_point_offset(irrev_offset);
                    let src_scale = if src.reversible {
                        FIX_POINT
                    } else {
                        src.bit_depth
                    };
                    let upshift = src_scale - dst_bit_depth;
                    if upshift == 0 {
                        for (x, y) in d.iter_mut().zip(s.iter()) {
                            *x = y.wrapping_add(off16);
                        }
                    } else if upshift > 0 {
                        for (x, y) in d.iter_mut().zip(s.iter()) {
                            *x = ((i32::from(*y) << upshift) + i32::from(off16)) as i16;
                        }
                    } else {
                        let downshift = -upshift;
                        let off32 = (i32::from(off16) << downshift) + (1 << (downshift - 1));
                        for (x, y) in d.iter_mut().zip(s.iter()) {
                            *x = ((off32 + i32::from(*y)) >> downshift) as i16;
                        }
                    }
                }
                LineBuf::I32(_) => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_line(width: i32, reversible: bool, precise: bool, bit_depth: i32) -> MultiLine {
        let mut line = MultiLine {
            size: Coords::new(width, 1),
            reversible,
            need_irreversible: !reversible,
            need_precise: precise,
            bit_depth,
            ..Default::default()
        };
        line.allocate();
        line
    }

    #[test]
    fn test_reset_reversible() {
        let mut line = make_line(4, true, true, 8);
        line.reset(-128, 0.0);
        assert_eq!(line.buf.as_ref().unwrap().as_i32().unwrap(), &[-128; 4]);
    }

    #[test]
    fn test_reset_fixed_point_quantizes_offset() {
        let mut line = make_line(2, false, false, 8);
        line.reset(0, -0.5);
        let expected = (0.5 + (-0.5f64) * f64::from(1 << FIX_POINT)).floor() as i16;
        assert_eq!(line.buf.as_ref().unwrap().as_i16().unwrap(), &[expected; 2]);
    }

    #[test]
    fn test_copy_reversible_adds_offset() {
        let mut src = make_line(3, true, true, 8);
        src.buf = Some(LineBuf::I32(vec![1, 2, 3]));
        let mut dst = make_line(3, true, true, 8);
        dst.copy_from(&src, 10, 0.0);
        assert_eq!(dst.buf.as_ref().unwrap().as_i32().unwrap(), &[11, 12, 13]);
    }

    #[test]
    fn test_copy_reversible_to_float_normalizes() {
        let mut src = make_line(2, true, true, 8);
        src.buf = Some(LineBuf::I32(vec![128, -128]));
        let mut dst = make_line(2, false, true, 8);
        dst.copy_from(&src, 0, 0.0);
        assert_eq!(dst.buf.as_ref().unwrap().as_f32().unwrap(), &[0.5, -0.5]);
    }

    #[test]
    fn test_copy_float_rescales_by_bit_depth_ratio() {
        let mut src = make_line(2, false, true, 10);
        src.buf = Some(LineBuf::F32(vec![0.25, -0.25]));
        let mut dst = make_line(2, false, true, 8);
        dst.copy_from(&src, 0, 0.0);
        assert_eq!(dst.buf.as_ref().unwrap().as_f32().unwrap(), &[1.0, -1.0]);
    }

    #[test]
    fn test_copy_short_negative_upshift_rounds_symmetrically() {
        // Reversible 16-bit source with bit depth above FIX_POINT forces the
        // rounded downshift path.
        let mut src = make_line(3, true, false, FIX_POINT + 2);
        src.buf = Some(LineBuf::I16(vec![4, 5, -4]));
        let mut dst = make_line(3, false, false, FIX_POINT + 2);
        dst.bit_depth = FIX_POINT + 2;
        dst.copy_from(&src, 0, 0.0);
        // downshift = 2, offset = 2: (4+2)>>2 = 1, (5+2)>>2 = 1, (-4+2)>>2 = -1
        assert_eq!(dst.buf.as_ref().unwrap().as_i16().unwrap(), &[1, 1, -1]);
    }
}
