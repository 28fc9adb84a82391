//! Transform-side stripe cursor for one codestream component
//!
//! The transform network exchanges rows with a component's [`TransformQueue`]
//! through this cursor. Synthesis pulls rows the wavelet side has already
//! written into the ring; analysis hands out ring slots for the network to
//! fill and releases whole stripes back to the wavelet side. In
//! single-stripe operation the release runs the wavelet exchange
//! synchronously on the caller's thread; in multi-stripe operation it only
//! adjusts the [`crate::sync_mdw::SyncMdw`] word, waiting on the queue's
//! handle when the wavelet side has fallen behind.

use std::sync::Arc;

use mct_core::{Direction, LineBuf, MctError, MctResult};

use crate::queue::TransformQueue;
use crate::sync_mdw::{d_of, m_of};

pub struct ComponentEngine {
    queue: Arc<TransformQueue>,
    /// Rows of the active stripe not yet handed to the transform side
    rows_left_in_stripe: i32,
    rows_left_in_component: i32,
    next_stripe_row_idx: i32,
    /// Ring index of the active stripe's first row; `None` before the
    /// first stripe is entered
    active_stripe: Option<usize>,
    /// Ring slot handed out for the row currently being written
    /// (analysis only)
    pending_row: Option<usize>,
}

impl ComponentEngine {
    pub fn new(queue: Arc<TransformQueue>) -> MctResult<Self> {
        if queue.num_stripes > 1 && !queue.has_scheduler() {
            return Err(MctError::MissingThreadContext(
                "multi-stripe processing requires a job scheduler".into(),
            ));
        }
        let rows_left_in_component = queue.total_rows;
        Ok(Self {
            queue,
            rows_left_in_stripe: 0,
            rows_left_in_component,
            next_stripe_row_idx: 0,
            active_stripe: None,
            pending_row: None,
        })
    }

    pub fn queue(&self) -> &Arc<TransformQueue> {
        &self.queue
    }

    pub fn rows_left(&self) -> i32 {
        self.rows_left_in_component
    }

    /// True when a ring slot is already reserved for the next written row
    pub fn has_pending_row(&self) -> bool {
        self.pending_row.is_some()
    }

    /// Synthesis: copy the next wavelet-synthesized row into `dst`,
    /// waiting for (or synchronously running) the wavelet side as needed
    pub fn pull_row(&mut self, dst: &mut LineBuf) {
        debug_assert!(matches!(self.queue.direction(), Direction::Synthesis));
        debug_assert!(self.rows_left_in_component > 0);
        let ring_idx = if self.rows_left_in_stripe == 0 {
            self.get_new_synthesized_stripe()
        } else {
            self.advance_stripe_line(false)
        };
        dst.copy_from(
            &self
                .queue
                .ring[ring_idx]
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
    }

    /// Analysis: reserve a ring slot for the next row without committing
    /// anything, blocking until the wavelet side has freed one
    pub fn reserve_row(&mut self) {
        debug_assert!(matches!(self.queue.direction(), Direction::Analysis));
        if self.pending_row.is_none() && self.rows_left_in_component > 0 {
            self.get_first_line_of_stripe();
        }
    }

    /// Analysis: commit one written row, releasing the stripe to the
    /// wavelet side when it fills
    pub fn push_row(&mut self, src: &LineBuf) {
        debug_assert!(matches!(self.queue.direction(), Direction::Analysis));
        if self.pending_row.is_none() {
            self.get_first_line_of_stripe();
        }
        let ring_idx = self
            .pending_row
            .take()
            .unwrap_or_else(|| unreachable!());
        self.queue.ring[ring_idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .copy_from(src);
        if self.rows_left_in_stripe == 0 {
            self.new_stripe_ready_for_analysis();
        } else {
            self.advance_stripe_line(false);
        }
    }

    /// Hand out the next row of the active stripe, firing the
    /// last-line-accessed or stripe-consumed transitions when the stripe
    /// empties with rows still to come. Returns the row's ring index.
    fn advance_stripe_line(&mut self, lla_already_set: bool) -> usize {
        let base = self.active_stripe.unwrap_or(0);
        let ring_idx = base + self.next_stripe_row_idx as usize;
        self.next_stripe_row_idx += 1;
        if self.next_stripe_row_idx == self.queue.max_stripe_rows {
            self.next_stripe_row_idx = 0;
        }
        self.pending_row = Some(ring_idx);
        self.rows_left_in_component -= 1;
        self.rows_left_in_stripe -= 1;
        if self.rows_left_in_stripe == 0 && self.rows_left_in_component > 0 {
            if self.queue.num_stripes == 1 {
                if !lla_already_set {
                    self.queue.lla_set();
                }
            } else if matches!(self.queue.direction(), Direction::Synthesis) {
                self.reached_last_line_of_multi_stripe();
            }
        }
        ring_idx
    }

    /// Synthesis, multi-stripe: the transform side consumed its stripe;
    /// give it back and report the transform as blocked when no further
    /// stripe is ready yet
    fn reached_last_line_of_multi_stripe(&mut self) {
        let (_, new) = self.queue.sync_mdw.stripe_consumed();
        if self.rows_left_in_component > 0 && m_of(new) == 0 {
            self.queue.propagate(1, 0);
        }
    }

    /// Advance the active stripe one position around the ring
    fn advance_ring(&mut self) {
        self.active_stripe = Some(match self.active_stripe {
            Some(base) => {
                let next = base + self.queue.max_stripe_rows as usize;
                if next >= self.queue.ring.len() {
                    0
                } else {
                    next
                }
            }
            None => 0,
        });
    }

    /// Synthesis: enter the next stripe and hand out its first row
    fn get_new_synthesized_stripe(&mut self) -> usize {
        debug_assert!(self.rows_left_in_component > 0);
        if self.queue.num_stripes > 1 {
            let increment_d = self.active_stripe.is_some();
            let old = self.queue.sync_mdw.request_stripe(increment_d);
            if increment_d && d_of(old) == 0 {
                // Returning this stripe may unblock the wavelet side
                let old_m = m_of(old) as i32;
                if self.rows_left_in_component > old_m * self.queue.max_stripe_rows {
                    self.queue.update_dependencies(-1, 0);
                }
            }
            if m_of(old) == 0 {
                let queue = &self.queue;
                queue
                    .wait
                    .wait_until(|| m_of(queue.sync_mdw.get()) > 0);
            }
            self.rows_left_in_stripe =
                self.queue.max_stripe_rows.min(self.rows_left_in_component);
            self.next_stripe_row_idx = 0;
            self.advance_ring();
            self.advance_stripe_line(false)
        } else {
            let leave_lla_set = self.sync_pull_stripe();
            self.active_stripe = Some(0);
            self.advance_stripe_line(leave_lla_set)
        }
    }

    /// Synthesis, single-stripe: run the wavelet exchange synchronously,
    /// refilling consumed ring slots in reading order. Returns whether
    /// the exchange left the last-line-accessed bit set.
    fn sync_pull_stripe(&mut self) -> bool {
        let queue = self.queue.clone();
        let mut st = queue.lock_state();
        queue.dwt_start(&mut st);
        let mut count = queue.max_stripe_rows.min(self.rows_left_in_component);
        let mut leave_lla_set = true;
        let mut n = self.next_stripe_row_idx;
        loop {
            queue.deliver_row(&mut st, n as usize);
            count -= 1;
            st.comp_rows_left -= 1;
            self.rows_left_in_stripe += 1;
            if count == 0 {
                queue.dwt_end(&mut st, leave_lla_set);
                break;
            }
            if !queue.dwt_continue(&mut st, leave_lla_set) {
                break;
            }
            leave_lla_set = false;
            n += 1;
            if n == queue.max_stripe_rows {
                n = 0;
            }
        }
        let done = st.comp_rows_left == 0;
        drop(st);
        if done {
            queue.mark_done();
        }
        leave_lla_set
    }

    /// Analysis: enter the active stripe (waiting for the wavelet side in
    /// multi-stripe operation) and reserve its next row
    fn get_first_line_of_stripe(&mut self) {
        if self.active_stripe.is_none() {
            self.active_stripe = Some(0);
            self.rows_left_in_stripe =
                self.queue.max_stripe_rows.min(self.rows_left_in_component);
            self.next_stripe_row_idx = 0;
        }
        if self.queue.num_stripes > 1 {
            let old = self.queue.sync_mdw.set_wait_flag();
            if m_of(old) == 0 {
                let queue = &self.queue;
                queue
                    .wait
                    .wait_until(|| m_of(queue.sync_mdw.get()) > 0);
            }
        }
        self.advance_stripe_line(false);
    }

    /// Analysis: the active stripe is fully written; release it to the
    /// wavelet side and move on
    fn new_stripe_ready_for_analysis(&mut self) {
        self.pending_row = None;
        if self.queue.num_stripes > 1 {
            let (old, new) = self.queue.sync_mdw.stripe_written();
            if d_of(old) == 0 {
                self.queue.update_dependencies(-1, 0);
            }
            let mut can_advance = self.rows_left_in_component > 0;
            if can_advance && m_of(new) == 0 {
                // The next row has nowhere to go until a job frees a stripe
                can_advance = false;
                self.queue.propagate(1, 0);
            }
            self.rows_left_in_stripe =
                self.queue.max_stripe_rows.min(self.rows_left_in_component);
            self.next_stripe_row_idx = 0;
            self.advance_ring();
            if can_advance {
                self.advance_stripe_line(false);
            }
        } else {
            let leave_lla_set = self.sync_push_stripe();
            if self.rows_left_in_stripe > self.rows_left_in_component {
                self.rows_left_in_stripe = self.rows_left_in_component;
            }
            if self.rows_left_in_component > 0 {
                self.advance_stripe_line(leave_lla_set);
            }
        }
    }

    /// Analysis, single-stripe: push committed rows through the wavelet
    /// exchange synchronously, freeing their ring slots. Returns whether
    /// the exchange left the last-line-accessed bit set.
    fn sync_push_stripe(&mut self) -> bool {
        let queue = self.queue.clone();
        let mut st = queue.lock_state();
        queue.dwt_start(&mut st);
        // First committed-but-unpushed row: the write cursor minus the lag
        // between the two sides.
        let mut n = self.next_stripe_row_idx - (st.comp_rows_left - self.rows_left_in_component);
        if n < 0 {
            n += queue.max_stripe_rows;
        }
        let mut leave_lla_set = true;
        loop {
            queue.deliver_row(&mut st, n as usize);
            st.comp_rows_left -= 1;
            self.rows_left_in_stripe += 1;
            if st.comp_rows_left == self.rows_left_in_component {
                queue.dwt_end(&mut st, leave_lla_set);
                break;
            }
            if !queue.dwt_continue(&mut st, leave_lla_set) {
                break;
            }
            leave_lla_set = false;
            n += 1;
            if n == queue.max_stripe_rows {
                n = 0;
            }
        }
        let done = st.comp_rows_left == 0;
        drop(st);
        if done {
            queue.mark_done();
        }
        leave_lla_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::io::{DependencySignal, RowSink, RowSource};
    use std::sync::Mutex;

    struct CountingSource {
        next: i32,
    }

    impl RowSource for CountingSource {
        fn pull(&mut self, row: &mut LineBuf, _signal: &dyn DependencySignal) {
            row.fill_int(self.next);
            self.next += 1;
        }
    }

    struct CollectSink {
        rows: Arc<Mutex<Vec<i16>>>,
    }

    impl RowSink for CollectSink {
        fn push(&mut self, row: &mut LineBuf, _signal: &dyn DependencySignal) {
            self.rows.lock().unwrap().push(row.as_i16().unwrap()[0]);
        }
    }

    #[test]
    fn test_single_stripe_synthesis_pulls_rows_in_order() {
        let queue = TransformQueue::new(
            Direction::Synthesis,
            1,
            2,
            4,
            2,
            true,
            true,
            None,
            None,
            CancelToken::new(),
        );
        queue.attach_source(Box::new(CountingSource { next: 1 }));
        queue.init();
        queue.set_ready_for_pull();
        let mut engine = ComponentEngine::new(queue.clone()).unwrap();

        let mut dst = LineBuf::new(2, true, true);
        for expected in 1..=4 {
            engine.pull_row(&mut dst);
            assert_eq!(dst.as_i16().unwrap(), &[expected, expected]);
        }
        assert!(queue.is_done());
        assert_eq!(engine.rows_left(), 0);
    }

    #[test]
    fn test_single_stripe_analysis_pushes_rows_in_order() {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let queue = TransformQueue::new(
            Direction::Analysis,
            1,
            2,
            4,
            2,
            true,
            true,
            None,
            None,
            CancelToken::new(),
        );
        queue.attach_sink(Box::new(CollectSink { rows: rows.clone() }));
        queue.init();
        let mut engine = ComponentEngine::new(queue.clone()).unwrap();

        let mut src = LineBuf::new(2, true, true);
        for value in 1..=4 {
            src.fill_int(value);
            engine.push_row(&src);
        }
        assert!(queue.is_done());
        assert_eq!(rows.lock().unwrap().as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_multi_stripe_without_scheduler_is_an_error() {
        let queue = TransformQueue::new(
            Direction::Synthesis,
            2,
            2,
            8,
            2,
            true,
            true,
            None,
            None,
            CancelToken::new(),
        );
        assert!(matches!(
            ComponentEngine::new(queue),
            Err(MctError::MissingThreadContext(_))
        ));
    }

    #[test]
    fn test_multi_stripe_synthesis_round_trip() {
        let queue = TransformQueue::new(
            Direction::Synthesis,
            2,
            2,
            6,
            2,
            true,
            true,
            None,
            Some(Arc::new(crate::scheduler::InlineScheduler)),
            CancelToken::new(),
        );
        queue.attach_source(Box::new(CountingSource { next: 1 }));
        queue.init();
        queue.set_ready_for_pull();
        let mut engine = ComponentEngine::new(queue.clone()).unwrap();

        let mut dst = LineBuf::new(2, true, true);
        for expected in 1..=6 {
            engine.pull_row(&mut dst);
            assert_eq!(dst.as_i16().unwrap(), &[expected, expected]);
        }
        assert!(queue.is_done());
    }

    #[test]
    fn test_multi_stripe_analysis_round_trip() {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let queue = TransformQueue::new(
            Direction::Analysis,
            2,
            2,
            6,
            2,
            true,
            true,
            None,
            Some(Arc::new(crate::scheduler::InlineScheduler)),
            CancelToken::new(),
        );
        queue.attach_sink(Box::new(CollectSink { rows: rows.clone() }));
        queue.init();
        let mut engine = ComponentEngine::new(queue.clone()).unwrap();

        let mut src = LineBuf::new(2, true, true);
        for value in 1..=6 {
            src.fill_int(value);
            engine.push_row(&src);
        }
        assert!(queue.is_done());
        assert_eq!(rows.lock().unwrap().as_slice(), &[1, 2, 3, 4, 5, 6]);
    }
}
