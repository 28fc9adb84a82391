//! Component (YCC) colour transforms
//!
//! When a tile declares the component transform, the first three
//! codestream components carry luminance/chrominance data and are
//! converted as a triple: the reversible (RCT) form for integer data and
//! the irreversible (ICT) form for fixed/floating point data. Both
//! facades apply these only once all three rows for a given row index are
//! available.

use mct_core::consts::FIX_POINT;
use mct_core::LineBuf;

const ALPHA_R: f32 = 0.299;
const ALPHA_G: f32 = 0.587;
const ALPHA_B: f32 = 0.114;
const CB_FACT: f32 = 1.0 / 1.772;
const CR_FACT: f32 = 1.0 / 1.402;
const CR_FACT_R: f32 = 1.402;
const CB_FACT_B: f32 = 1.772;
const CR_FACT_G: f32 = 0.714_136;
const CB_FACT_G: f32 = 0.344_136;

fn fix(x: f32) -> i32 {
    (0.5 + f64::from(x) * f64::from(1 << FIX_POINT)).floor() as i32
}

/// Forward transform: RGB rows to YCC rows, in place.
///
/// Integer buffers use the RCT; float/fixed-point buffers use the ICT.
pub fn rgb_to_ycc(c0: &mut LineBuf, c1: &mut LineBuf, c2: &mut LineBuf) {
    match (c0, c1, c2) {
        (LineBuf::I32(r), LineBuf::I32(g), LineBuf::I32(b)) => {
            for n in 0..r.len() {
                let (rv, gv, bv) = (r[n], g[n], b[n]);
                r[n] = (rv + 2 * gv + bv) >> 2;
                g[n] = bv - gv;
                b[n] = rv - gv;
            }
        }
        (LineBuf::F32(r), LineBuf::F32(g), LineBuf::F32(b)) => {
            for n in 0..r.len() {
                let (rv, gv, bv) = (r[n], g[n], b[n]);
                let y = ALPHA_R * rv + ALPHA_G * gv + ALPHA_B * bv;
                r[n] = y;
                g[n] = CB_FACT * (bv - y);
                b[n] = CR_FACT * (rv - y);
            }
        }
        (LineBuf::I16(r), LineBuf::I16(g), LineBuf::I16(b)) => {
            // Fixed-point ICT; reversible short triples are routed to
            // `rgb_to_ycc_rev16` by the caller.
            let (ar, ag, ab) = (fix(ALPHA_R), fix(ALPHA_G), fix(ALPHA_B));
            let (cb, cr) = (fix(CB_FACT), fix(CR_FACT));
            for n in 0..r.len() {
                let (rv, gv, bv) = (i32::from(r[n]), i32::from(g[n]), i32::from(b[n]));
                let y = (ar * rv + ag * gv + ab * bv + (1 << (FIX_POINT - 1))) >> FIX_POINT;
                r[n] = y as i16;
                g[n] = ((cb * (bv - y) + (1 << (FIX_POINT - 1))) >> FIX_POINT) as i16;
                b[n] = ((cr * (rv - y) + (1 << (FIX_POINT - 1))) >> FIX_POINT) as i16;
            }
        }
        _ => panic!("component transform requires three identically formatted rows"),
    }
}

/// Reversible forward transform on absolute 16-bit rows
pub fn rgb_to_ycc_rev16(r: &mut [i16], g: &mut [i16], b: &mut [i16]) {
    for n in 0..r.len() {
        let (rv, gv, bv) = (i32::from(r[n]), i32::from(g[n]), i32::from(b[n]));
        r[n] = ((rv + 2 * gv + bv) >> 2) as i16;
        g[n] = (bv - gv) as i16;
        b[n] = (rv - gv) as i16;
    }
}

/// Inverse transform: YCC rows back to RGB rows, in place
pub fn ycc_to_rgb(c0: &mut LineBuf, c1: &mut LineBuf, c2: &mut LineBuf) {
    match (c0, c1, c2) {
        (LineBuf::I32(y), LineBuf::I32(cb), LineBuf::I32(cr)) => {
            for n in 0..y.len() {
                let (yv, cbv, crv) = (y[n], cb[n], cr[n]);
                let g = yv - ((cbv + crv) >> 2);
                y[n] = crv + g;
                cb[n] = g;
                cr[n] = cbv + g;
            }
        }
        (LineBuf::F32(y), LineBuf::F32(cb), LineBuf::F32(cr)) => {
            for n in 0..y.len() {
                let (yv, cbv, crv) = (y[n], cb[n], cr[n]);
                y[n] = yv + CR_FACT_R * crv;
                let g = yv - CB_FACT_G * cbv - CR_FACT_G * crv;
                let b = yv + CB_FACT_B * cbv;
                cb[n] = g;
                cr[n] = b;
            }
        }
        (LineBuf::I16(y), LineBuf::I16(cb), LineBuf::I16(cr)) => {
            let (fr, fgb, fgr, fb) = (
                fix(CR_FACT_R),
                fix(CB_FACT_G),
                fix(CR_FACT_G),
                fix(CB_FACT_B),
            );
            for n in 0..y.len() {
                let (yv, cbv, crv) = (i32::from(y[n]), i32::from(cb[n]), i32::from(cr[n]));
                let half = 1 << (FIX_POINT - 1);
                y[n] = (yv + ((fr * crv + half) >> FIX_POINT)) as i16;
                let g = yv - ((fgb * cbv + fgr * crv + half) >> FIX_POINT);
                cb[n] = g as i16;
                cr[n] = (yv + ((fb * cbv + half) >> FIX_POINT)) as i16;
            }
        }
        _ => panic!("component transform requires three identically formatted rows"),
    }
}

/// Reversible inverse transform on absolute 16-bit rows
pub fn ycc_to_rgb_rev16(y: &mut [i16], cb: &mut [i16], cr: &mut [i16]) {
    for n in 0..y.len() {
        let (yv, cbv, crv) = (i32::from(y[n]), i32::from(cb[n]), i32::from(cr[n]));
        let g = yv - ((cbv + crv) >> 2);
        y[n] = (crv + g) as i16;
        cb[n] = g as i16;
        cr[n] = (cbv + g) as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rct_round_trip_exact() {
        let mut c0 = LineBuf::I32(vec![10, -7, 200, 0]);
        let mut c1 = LineBuf::I32(vec![4, 33, -100, 1]);
        let mut c2 = LineBuf::I32(vec![-5, 8, 55, 127]);
        let (o0, o1, o2) = (c0.clone(), c1.clone(), c2.clone());
        rgb_to_ycc(&mut c0, &mut c1, &mut c2);
        ycc_to_rgb(&mut c0, &mut c1, &mut c2);
        assert_eq!(c0, o0);
        assert_eq!(c1, o1);
        assert_eq!(c2, o2);
    }

    #[test]
    fn test_rct_round_trip_exact_16bit() {
        let mut r = vec![10i16, -7, 200, 0];
        let mut g = vec![4i16, 33, -100, 1];
        let mut b = vec![-5i16, 8, 55, 127];
        let (or, og, ob) = (r.clone(), g.clone(), b.clone());
        rgb_to_ycc_rev16(&mut r, &mut g, &mut b);
        ycc_to_rgb_rev16(&mut r, &mut g, &mut b);
        assert_eq!(r, or);
        assert_eq!(g, og);
        assert_eq!(b, ob);
    }

    #[test]
    fn test_ict_round_trip_close() {
        let mut c0 = LineBuf::F32(vec![0.5, -0.25, 0.125]);
        let mut c1 = LineBuf::F32(vec![0.1, 0.2, -0.3]);
        let mut c2 = LineBuf::F32(vec![-0.4, 0.0, 0.25]);
        let (o0, o1, o2) = (c0.clone(), c1.clone(), c2.clone());
        rgb_to_ycc(&mut c0, &mut c1, &mut c2);
        ycc_to_rgb(&mut c0, &mut c1, &mut c2);
        for (a, b) in [(&c0, &o0), (&c1, &o1), (&c2, &o2)] {
            for (x, y) in a.as_f32().unwrap().iter().zip(b.as_f32().unwrap()) {
                assert!((x - y).abs() < 1e-5);
            }
        }
    }
}
