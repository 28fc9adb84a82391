//! Core types for the multi-component transform engine

/// Integer coordinates or extents on the tile canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Coords {
    pub x: i32,
    pub y: i32,
}

impl Coords {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// True when either dimension is still unknown (zero)
    pub fn is_unknown(&self) -> bool {
        self.x == 0 && self.y == 0
    }
}

/// Compression mode of one tile-component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CompressionMode {
    /// Integer, exactly invertible processing
    Reversible,
    /// Fixed/floating point approximate processing
    Irreversible,
}

impl CompressionMode {
    pub fn is_reversible(&self) -> bool {
        matches!(self, CompressionMode::Reversible)
    }
}

/// Direction the transform network is being driven in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Codestream components -> output components (decompression)
    Synthesis,
    /// Output components -> codestream components (compression)
    Analysis,
}
