//! Row buffers for intermediate component lines
//!
//! A line holds one row of one component in one of three working
//! representations: 16-bit integers (absolute samples for reversible data,
//! or fixed-point with [`crate::consts::FIX_POINT`] fractional bits for
//! irreversible data), 32-bit absolute integers, or 32-bit floats.

/// Row buffer that can hold different sample representations
#[derive(Debug, Clone, PartialEq)]
pub enum LineBuf {
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
}

impl LineBuf {
    /// Create a zeroed row buffer.
    ///
    /// `use_shorts` selects the 16-bit representation; otherwise reversible
    /// data uses absolute 32-bit integers and irreversible data uses floats.
    pub fn new(width: usize, use_shorts: bool, reversible: bool) -> Self {
        if use_shorts {
            LineBuf::I16(vec![0; width])
        } else if reversible {
            LineBuf::I32(vec![0; width])
        } else {
            LineBuf::F32(vec![0.0; width])
        }
    }

    pub fn len(&self) -> usize {
        match self {
            LineBuf::I16(v) => v.len(),
            LineBuf::I32(v) => v.len(),
            LineBuf::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for the 16-bit representation
    pub fn is_short(&self) -> bool {
        matches!(self, LineBuf::I16(_))
    }

    pub fn as_i16(&self) -> Option<&[i16]> {
        match self {
            LineBuf::I16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i16_mut(&mut self) -> Option<&mut [i16]> {
        match self {
            LineBuf::I16(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            LineBuf::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32_mut(&mut self) -> Option<&mut [i32]> {
        match self {
            LineBuf::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            LineBuf::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            LineBuf::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Overwrite every sample with the given integer value
    pub fn fill_int(&mut self, value: i32) {
        match self {
            LineBuf::I16(v) => v.fill(value as i16),
            LineBuf::I32(v) => v.fill(value),
            LineBuf::F32(v) => v.fill(value as f32),
        }
    }

    /// Overwrite every sample with the given float value
    pub fn fill_float(&mut self, value: f32) {
        match self {
            LineBuf::I16(v) => v.fill(value as i16),
            LineBuf::I32(v) => v.fill(value as i32),
            LineBuf::F32(v) => v.fill(value),
        }
    }

    /// Copy samples from a buffer of the same representation and width
    pub fn copy_from(&mut self, src: &LineBuf) {
        match (self, src) {
            (LineBuf::I16(d), LineBuf::I16(s)) => d.copy_from_slice(s),
            (LineBuf::I32(d), LineBuf::I32(s)) => d.copy_from_slice(s),
            (LineBuf::F32(d), LineBuf::F32(s)) => d.copy_from_slice(s),
            _ => panic!("mismatched line buffer representations"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_representation_selection() {
        assert!(LineBuf::new(8, true, true).is_short());
        assert!(LineBuf::new(8, true, false).is_short());
        assert!(matches!(LineBuf::new(8, false, true), LineBuf::I32(_)));
        assert!(matches!(LineBuf::new(8, false, false), LineBuf::F32(_)));
    }

    #[test]
    fn test_fill_and_copy() {
        let mut a = LineBuf::new(4, true, true);
        a.fill_int(-7);
        assert_eq!(a.as_i16().unwrap(), &[-7, -7, -7, -7]);

        let mut b = LineBuf::new(4, true, true);
        b.copy_from(&a);
        assert_eq!(b, a);
    }
}
