//! Fixed-point constants shared by the transform engine

/// Number of fractional bits used by the 16-bit fixed-point representation
/// of irreversible sample data.
pub const FIX_POINT: i32 = 13;

/// Largest magnitude representable by a 16-bit transform coefficient.
pub const MAX_COEFF_16: i32 = 0x7FFF;

/// Threshold used when growing a floating-point scale factor into a 16-bit
/// integer coefficient: the factor is doubled while `factor * max <= 16383.0`.
pub const COEFF_SCALE_LIMIT: f32 = 16383.0;

/// Maximum downshift allowed for a shared 16-bit coefficient cache.
pub const MAX_COEFF_DOWNSHIFT: i32 = 16;

/// Headroom available above the fixed-point binary point; irreversible
/// wavelet normalization keeps worst-case BIBO gain below 3/4 of this.
pub const FIXED_POINT_HEADROOM: i32 = 16 - FIX_POINT;

/// Target number of buffered bytes per tile-component used when choosing
/// the stripe height.
pub const STRIPE_BYTES_TARGET: usize = 400_000;

/// Upper bound on the number of stripes any component will use.
pub const MAX_STRIPES: i32 = 64;
