//! Packed stripe-synchronization word
//!
//! One atomic word per codestream component coordinates its stripe ring
//! between the transform network and the wavelet engine:
//!
//!   - `D` (bits 0..8): stripes available to the wavelet engine,
//!   - `M` (bits 16..24): stripes available to the transform network,
//!   - `W` (bit 30): a transform-side thread is waiting on `M > 0`.
//!
//! Field increments and decrements are plain adds of the field's unit bit;
//! the gap between the fields absorbs carries only when a field is moved
//! past zero, which the protocol never does (asserted in debug builds).

use std::sync::atomic::{AtomicU32, Ordering};

pub const SYNC_D_POS: u32 = 0;
pub const SYNC_D0_BIT: u32 = 1 << SYNC_D_POS;
pub const SYNC_D_MASK: u32 = 255 << SYNC_D_POS;
pub const SYNC_M_POS: u32 = 16;
pub const SYNC_M0_BIT: u32 = 1 << SYNC_M_POS;
pub const SYNC_M_MASK: u32 = 255 << SYNC_M_POS;
pub const SYNC_W_BIT: u32 = 1 << 30;

/// Stripes available to the wavelet engine
pub fn d_of(word: u32) -> u32 {
    (word & SYNC_D_MASK) >> SYNC_D_POS
}

/// Stripes available to the transform network
pub fn m_of(word: u32) -> u32 {
    (word & SYNC_M_MASK) >> SYNC_M_POS
}

/// A transform-side thread is waiting on `M > 0`
pub fn w_of(word: u32) -> bool {
    word & SYNC_W_BIT != 0
}

#[derive(Debug, Default)]
pub struct SyncMdw {
    word: AtomicU32,
}

impl SyncMdw {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u32) {
        self.word.store(value, Ordering::Release);
    }

    pub fn exchange(&self, value: u32) -> u32 {
        self.word.swap(value, Ordering::AcqRel)
    }

    /// Returns the previous word
    pub fn exchange_add(&self, delta: u32) -> u32 {
        self.word.fetch_add(delta, Ordering::AcqRel)
    }

    fn compare_and_set(&self, old: u32, new: u32) -> bool {
        self.word
            .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Wavelet side completed one stripe: `M += 1`, `D -= 1`, clear `W`.
    /// Returns `(old, new)`; the caller signals the waiter when the old
    /// word had `W` set.
    pub fn stripe_processed(&self) -> (u32, u32) {
        loop {
            let old = self.get();
            let new = (old & !SYNC_W_BIT).wrapping_add(SYNC_M0_BIT.wrapping_sub(SYNC_D0_BIT));
            debug_assert!(d_of(old) > 0);
            if self.compare_and_set(old, new) {
                return (old, new);
            }
        }
    }

    /// Transform side finished writing a stripe (analysis): `M -= 1`,
    /// `D += 1`. Returns `(old, new)`.
    pub fn stripe_written(&self) -> (u32, u32) {
        let delta = SYNC_D0_BIT.wrapping_sub(SYNC_M0_BIT);
        let old = self.exchange_add(delta);
        debug_assert!(m_of(old) > 0);
        (old, old.wrapping_add(delta))
    }

    /// Transform side consumed the last row of a stripe (synthesis):
    /// `M -= 1`. Returns `(old, new)`.
    pub fn stripe_consumed(&self) -> (u32, u32) {
        let delta = 0u32.wrapping_sub(SYNC_M0_BIT);
        let old = self.exchange_add(delta);
        debug_assert!(m_of(old) > 0);
        (old, old.wrapping_add(delta))
    }

    /// Synthesis side needs a new stripe: optionally `D += 1`, and set `W`
    /// whenever `M == 0` so the wavelet side knows to signal. Returns the
    /// old word.
    pub fn request_stripe(&self, increment_d: bool) -> u32 {
        let inc = if increment_d { SYNC_D0_BIT } else { 0 };
        loop {
            let old = self.get();
            let mut new = old.wrapping_add(inc);
            if m_of(old) == 0 {
                new |= SYNC_W_BIT;
            }
            if self.compare_and_set(old, new) {
                return old;
            }
        }
    }

    /// Analysis side found `M == 0` and wants to wait: set `W` while the
    /// condition persists. Returns the old word; when its `M` field is
    /// non-zero the caller need not wait after all.
    pub fn set_wait_flag(&self) -> u32 {
        loop {
            let old = self.get();
            if m_of(old) != 0 {
                return old;
            }
            let new = old | SYNC_W_BIT;
            if self.compare_and_set(old, new) {
                return old;
            }
        }
    }

    /// Termination: make `M` saturated so the transform side can never
    /// block again. Returns the old word.
    pub fn release_all(&self) -> u32 {
        self.exchange(SYNC_M_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_accessors() {
        let word = 3 * SYNC_M0_BIT + 2 * SYNC_D0_BIT + SYNC_W_BIT;
        assert_eq!(m_of(word), 3);
        assert_eq!(d_of(word), 2);
        assert!(w_of(word));
    }

    #[test]
    fn test_stripe_processed_moves_one_stripe_and_clears_wait() {
        let sync = SyncMdw::new();
        sync.set(2 * SYNC_D0_BIT + SYNC_W_BIT);
        let (old, new) = sync.stripe_processed();
        assert!(w_of(old));
        assert_eq!(m_of(new), 1);
        assert_eq!(d_of(new), 1);
        assert!(!w_of(new));
    }

    #[test]
    fn test_stripe_written_mirrors_processed() {
        let sync = SyncMdw::new();
        sync.set(2 * SYNC_M0_BIT);
        let (old, new) = sync.stripe_written();
        assert_eq!(m_of(old), 2);
        assert_eq!(m_of(new), 1);
        assert_eq!(d_of(new), 1);
    }

    #[test]
    fn test_request_stripe_sets_wait_only_when_m_zero() {
        let sync = SyncMdw::new();
        sync.set(SYNC_M0_BIT);
        sync.request_stripe(true);
        assert!(!w_of(sync.get()));
        assert_eq!(d_of(sync.get()), 1);

        sync.set(0);
        sync.request_stripe(false);
        assert!(w_of(sync.get()));
    }

    #[test]
    fn test_release_all_saturates_m() {
        let sync = SyncMdw::new();
        sync.set(SYNC_D0_BIT + SYNC_W_BIT);
        let old = sync.release_all();
        assert!(w_of(old));
        assert_eq!(m_of(sync.get()), 255);
        assert_eq!(d_of(sync.get()), 0);
    }
}
