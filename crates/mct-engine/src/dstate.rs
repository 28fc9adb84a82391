//! Packed queue-dependency word
//!
//! One atomic word per queue drives job scheduling:
//!
//!   - `MAX` (bits 0..11): maximum number of future blocking dependencies,
//!   - guard (bit 11): trips on `MAX` under/overflow (asserted clear),
//!   - `RUN` (bit 12): a job is in flight or committed to be scheduled,
//!   - `LLA` (bit 13): last line of the buffered stripe has been accessed
//!     (single-stripe mode only),
//!   - guard (bit 14): trips on `LLA` double-set,
//!   - `T` (bit 15): termination requested,
//!   - `NUM` (bit 16 up, signed): current blocking-dependency count.
//!
//! `NUM` occupies the top bits so deltas of either sign are plain adds; a
//! negative running sum is legitimate while decrements race ahead of the
//! deferred increments folded in at stripe boundaries.

use std::sync::atomic::{AtomicI32, Ordering};

pub const DSTATE_MAX_POS: i32 = 0;
pub const DSTATE_MAX_MASK: i32 = 2047 << DSTATE_MAX_POS;
pub const DSTATE_GUARD_BIT: i32 = 1 << 11;
pub const DSTATE_RUN_BIT: i32 = 1 << 12;
pub const DSTATE_LLA_BIT: i32 = 1 << 13;
pub const DSTATE_LLA_GUARD_BIT: i32 = 1 << 14;
pub const DSTATE_T_BIT: i32 = 1 << 15;
pub const DSTATE_NUM_POS: i32 = 16;
pub const DSTATE_NUM_BIT: i32 = 1 << DSTATE_NUM_POS;
pub const DSTATE_NUM_MASK: i32 = -1 << DSTATE_NUM_POS;

/// Maximum number of future blocking dependencies
pub fn max_of(word: i32) -> i32 {
    (word & DSTATE_MAX_MASK) >> DSTATE_MAX_POS
}

/// Current blocking-dependency count (signed)
pub fn num_of(word: i32) -> i32 {
    word >> DSTATE_NUM_POS
}

pub fn run_of(word: i32) -> bool {
    word & DSTATE_RUN_BIT != 0
}

pub fn lla_of(word: i32) -> bool {
    word & DSTATE_LLA_BIT != 0
}

pub fn terminating(word: i32) -> bool {
    word & DSTATE_T_BIT != 0
}

/// Combined delta for one `update_dependencies` call
pub fn delta(new_dependencies: i32, delta_max: i32) -> i32 {
    (new_dependencies << DSTATE_NUM_POS) + (delta_max << DSTATE_MAX_POS)
}

#[derive(Debug, Default)]
pub struct DState {
    word: AtomicI32,
}

impl DState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> i32 {
        self.word.load(Ordering::Acquire)
    }

    pub fn set(&self, value: i32) {
        self.word.store(value, Ordering::Release);
    }

    /// Returns the previous word
    pub fn exchange_add(&self, delta: i32) -> i32 {
        let old = self.word.fetch_add(delta, Ordering::AcqRel);
        debug_assert!((old + delta) & DSTATE_GUARD_BIT == 0);
        debug_assert!((old + delta) & DSTATE_LLA_GUARD_BIT == 0);
        old
    }

    /// Returns the previous word
    pub fn exchange_or(&self, bits: i32) -> i32 {
        self.word.fetch_or(bits, Ordering::AcqRel)
    }

    fn compare_and_set(&self, old: i32, new: i32) -> bool {
        self.word
            .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Apply a negative dependency delta and claim the `RUN` bit when the
    /// resulting word shows schedulable work: `NUM <= 0`, no job running,
    /// not terminating, and the caller has rows left. Returns `(old, new)`;
    /// a job must be scheduled exactly when the `RUN` bit differs between
    /// the two.
    pub fn apply_delta_maybe_run(&self, delta: i32, have_rows: bool) -> (i32, i32) {
        loop {
            let old = self.get();
            let mut new = old + delta;
            if new & (DSTATE_NUM_MASK | DSTATE_RUN_BIT | DSTATE_T_BIT) == 0 && have_rows {
                new |= DSTATE_RUN_BIT;
            }
            if self.compare_and_set(old, new) {
                debug_assert!(new & DSTATE_GUARD_BIT == 0);
                return (old, new);
            }
        }
    }

    /// Fold deferred positive dependencies into `NUM` from inside a running
    /// job; drops the `RUN` bit when the result leaves blocking
    /// dependencies outstanding. Returns `(old, new)`; when the `RUN` bit
    /// is clear in `new` the job must return without touching the queue
    /// again.
    pub fn fold_deferred(&self, accumulated: i32) -> (i32, i32) {
        let delta = accumulated << DSTATE_NUM_POS;
        loop {
            let old = self.get();
            let mut new = old + delta;
            if num_of(new) > 0 {
                new &= !DSTATE_RUN_BIT;
            }
            if self.compare_and_set(old, new) {
                debug_assert!(run_of(old));
                return (old, new);
            }
        }
    }

    /// Synchronous-mode stripe-boundary transition: set `LLA`, fold the
    /// deferred dependencies, and drop `RUN` (plus `LLA` unless
    /// `leave_lla_set`) when blocked or ending. Returns `(old, new)`.
    pub fn sync_boundary(
        &self,
        accumulated: i32,
        leave_lla_set: bool,
        force_stop: bool,
    ) -> (i32, i32) {
        let delta = accumulated << DSTATE_NUM_POS;
        let end_mask = if leave_lla_set {
            !DSTATE_RUN_BIT
        } else {
            !(DSTATE_RUN_BIT | DSTATE_LLA_BIT)
        };
        loop {
            let old = self.get();
            let mut new = (old | DSTATE_LLA_BIT) + delta;
            if force_stop || new & DSTATE_NUM_MASK != 0 {
                new &= end_mask;
            }
            if self.compare_and_set(old, new) {
                return (old, new);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_is_signed() {
        let state = DState::new();
        state.exchange_add(delta(-2, 0));
        assert_eq!(num_of(state.get()), -2);
        state.exchange_add(delta(3, 0));
        assert_eq!(num_of(state.get()), 1);
        assert_eq!(max_of(state.get()), 0);
    }

    #[test]
    fn test_max_and_num_do_not_interfere() {
        let state = DState::new();
        state.exchange_add(delta(1, 2));
        assert_eq!(num_of(state.get()), 1);
        assert_eq!(max_of(state.get()), 2);
        state.exchange_add(delta(-1, -1));
        assert_eq!(num_of(state.get()), 0);
        assert_eq!(max_of(state.get()), 1);
    }

    #[test]
    fn test_run_claimed_only_when_unblocked() {
        let state = DState::new();
        state.set(delta(1, 1));
        // NUM drops to zero with rows left: RUN is claimed.
        let (old, new) = state.apply_delta_maybe_run(delta(-1, 0), true);
        assert!(!run_of(old));
        assert!(run_of(new));
        // A second decrement while RUN holds must not re-claim it.
        state.exchange_add(delta(1, 0));
        let (_, new) = state.apply_delta_maybe_run(delta(-1, 0), true);
        assert!(run_of(new)); // unchanged, still the first claim
    }

    #[test]
    fn test_run_not_claimed_when_terminating_or_out_of_rows() {
        let state = DState::new();
        state.set(DSTATE_T_BIT + delta(1, 0));
        let (_, new) = state.apply_delta_maybe_run(delta(-1, 0), true);
        assert!(!run_of(new));

        let state = DState::new();
        state.set(delta(1, 0));
        let (_, new) = state.apply_delta_maybe_run(delta(-1, 0), false);
        assert!(!run_of(new));
    }

    #[test]
    fn test_fold_deferred_drops_run_when_blocked() {
        let state = DState::new();
        state.set(DSTATE_RUN_BIT + delta(-1, 0));
        let (_, new) = state.fold_deferred(1);
        assert!(run_of(new)); // balanced: 1 deferred against -1 applied
        let (_, new) = state.fold_deferred(1);
        assert!(!run_of(new));
        assert_eq!(num_of(new), 1);
    }

    #[test]
    fn test_sync_boundary_clears_lla_unless_kept() {
        let state = DState::new();
        state.set(DSTATE_RUN_BIT);
        let (_, new) = state.sync_boundary(1, false, true);
        assert!(!run_of(new));
        assert!(!lla_of(new));
        assert_eq!(num_of(new), 1);

        let state = DState::new();
        state.set(DSTATE_RUN_BIT | DSTATE_LLA_BIT);
        let (_, new) = state.sync_boundary(1, true, true);
        assert!(!run_of(new));
        assert!(lla_of(new));
    }
}
