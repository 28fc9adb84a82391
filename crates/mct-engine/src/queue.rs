//! Per-component job queue
//!
//! Each codestream component owns one queue that mediates between the
//! transform network (which produces or consumes rows on the caller's
//! thread) and the wavelet side (which absorbs or supplies rows through a
//! [`RowSink`]/[`RowSource`], possibly on worker threads).
//!
//! In multi-stripe operation the queue schedules at most one job at a
//! time, guarded by the `RUN` bit of its [`DState`] word. The job drains
//! whole stripes of the ring, accounting hand-offs in the [`SyncMdw`]
//! word, and defers any dependencies reported during delivery until the
//! next stripe boundary. When folding the deferred count leaves blocking
//! dependencies outstanding, the job drops `RUN` and returns; the next
//! `remove_dependency` re-claims it and schedules a successor.
//!
//! In single-stripe operation no jobs are scheduled; the wavelet exchange
//! runs synchronously on the transform caller's thread between
//! [`TransformQueue::dwt_start`] and [`TransformQueue::dwt_end`], with the
//! `LLA` bit standing in for stripe availability.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use mct_core::{Direction, LineBuf};

use crate::cancel::CancelToken;
use crate::dstate::{
    delta, lla_of, max_of, num_of, run_of, terminating, DState, DSTATE_LLA_BIT, DSTATE_NUM_BIT,
    DSTATE_RUN_BIT, DSTATE_T_BIT,
};
use crate::io::{DependencyMonitor, DependencySignal, RowSink, RowSource};
use crate::scheduler::JobScheduler;
use crate::sync_mdw::{d_of, m_of, w_of, SyncMdw, SYNC_D0_BIT, SYNC_M0_BIT};
use crate::wait::WaitHandle;

/// The wavelet-side row exchange attached to a queue
pub(crate) enum RowIo {
    None,
    Push(Box<dyn RowSink>),
    Pull(Box<dyn RowSource>),
}

/// Job-private cursors and the attached row exchange. Only the running
/// job (or, in single-stripe mode, the transform caller) ever holds this
/// lock, so holding it for the duration of a job is deliberate.
pub(crate) struct JobState {
    pub(crate) io: RowIo,
    /// Rows of the active stripe already exchanged
    pub(crate) next_stripe_row_idx: i32,
    /// Rows of the component not yet exchanged with the wavelet side
    pub(crate) comp_rows_left: i32,
    /// Ring index of the active stripe's first row
    pub(crate) active_row: usize,
    /// `DState` word saved by `dwt_start`, consulted when the
    /// synchronous exchange ends
    pub(crate) save_dstate: i32,
}

/// Exactly-once completion latch with an optional callback
struct Completion {
    fired: AtomicBool,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    done: WaitHandle,
}

impl Completion {
    fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            callback: Mutex::new(None),
            done: WaitHandle::new(),
        }
    }

    fn fire(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(callback) = callback {
            callback();
        }
        self.done.notify();
    }
}

pub struct TransformQueue {
    direction: Direction,
    pub(crate) num_stripes: usize,
    pub(crate) max_stripe_rows: i32,
    pub(crate) total_rows: i32,
    pub(crate) dstate: DState,
    pub(crate) sync_mdw: SyncMdw,
    pub(crate) wait: WaitHandle,
    cancel: CancelToken,
    /// Dependencies reported during delivery, folded in at stripe
    /// boundaries by whichever side holds the `RUN` bit
    acc_new_dependencies: AtomicI32,
    have_all_scheduled: AtomicBool,
    ignore_dependency_updates: AtomicBool,
    initialized: AtomicBool,
    ready_for_pull: AtomicBool,
    /// Wavelet-side rows remaining in the active stripe
    pub(crate) rows_left_in_stripe: AtomicI32,
    pub(crate) stripes_left_in_component: AtomicI32,
    pub(crate) state: Mutex<JobState>,
    /// `num_stripes * max_stripe_rows` row buffers shared with the
    /// transform side
    pub(crate) ring: Vec<Mutex<LineBuf>>,
    monitor: Option<Arc<dyn DependencyMonitor>>,
    scheduler: Option<Arc<dyn JobScheduler>>,
    completion: Completion,
    weak_self: Weak<TransformQueue>,
}

impl TransformQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: Direction,
        num_stripes: usize,
        max_stripe_rows: i32,
        total_rows: i32,
        width: usize,
        use_shorts: bool,
        reversible: bool,
        monitor: Option<Arc<dyn DependencyMonitor>>,
        scheduler: Option<Arc<dyn JobScheduler>>,
        cancel: CancelToken,
    ) -> Arc<Self> {
        debug_assert!(num_stripes >= 1 && max_stripe_rows >= 1);
        let ring = (0..num_stripes * max_stripe_rows as usize)
            .map(|_| Mutex::new(LineBuf::new(width, use_shorts, reversible)))
            .collect();
        Arc::new_cyclic(|weak| Self {
            direction,
            num_stripes,
            max_stripe_rows,
            total_rows,
            dstate: DState::new(),
            sync_mdw: SyncMdw::new(),
            wait: WaitHandle::new(),
            cancel,
            acc_new_dependencies: AtomicI32::new(0),
            have_all_scheduled: AtomicBool::new(false),
            ignore_dependency_updates: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            ready_for_pull: AtomicBool::new(false),
            rows_left_in_stripe: AtomicI32::new(0),
            stripes_left_in_component: AtomicI32::new(0),
            state: Mutex::new(JobState {
                io: RowIo::None,
                next_stripe_row_idx: 0,
                comp_rows_left: 0,
                active_row: 0,
                save_dstate: 0,
            }),
            ring,
            monitor,
            scheduler,
            completion: Completion::new(),
            weak_self: weak.clone(),
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn has_scheduler(&self) -> bool {
        self.scheduler.is_some()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn attach_sink(&self, sink: Box<dyn RowSink>) {
        debug_assert!(matches!(self.direction, Direction::Analysis));
        self.lock_state().io = RowIo::Push(sink);
    }

    pub fn attach_source(&self, source: Box<dyn RowSource>) {
        debug_assert!(matches!(self.direction, Direction::Synthesis));
        self.lock_state().io = RowIo::Pull(source);
    }

    pub fn set_completion(&self, callback: Box<dyn FnOnce() + Send>) {
        *self
            .completion
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callback);
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set up the dependency and stripe words for this component. Must be
    /// called once, after the row exchange is attached and before any
    /// dependency updates arrive from the wavelet side.
    pub fn init(&self) {
        let stripes = if self.total_rows > 0 {
            1 + (self.total_rows - 1) / self.max_stripe_rows
        } else {
            0
        };
        {
            let mut st = self.lock_state();
            st.comp_rows_left = self.total_rows;
            st.next_stripe_row_idx = 0;
            st.active_row = 0;
        }
        self.stripes_left_in_component.store(stripes, Ordering::Release);
        self.rows_left_in_stripe
            .store(self.max_stripe_rows.min(self.total_rows), Ordering::Release);

        if self.num_stripes > 1 {
            match self.direction {
                Direction::Analysis => {
                    // Blocked until the transform side writes a stripe
                    self.sync_mdw.set(self.num_stripes as u32 * SYNC_M0_BIT);
                    self.dstate.exchange_add(DSTATE_NUM_BIT);
                    if stripes > self.num_stripes as i32 {
                        self.propagate(0, 1);
                    }
                }
                Direction::Synthesis => {
                    // One pretend dependency holds jobs off until the row
                    // source has fully started; `set_ready_for_pull`
                    // removes it.
                    self.sync_mdw.set(self.num_stripes as u32 * SYNC_D0_BIT);
                    self.dstate.exchange_add(DSTATE_NUM_BIT);
                    self.propagate(1, 1);
                }
            }
        } else if self.total_rows > 0 {
            match self.direction {
                Direction::Synthesis => {
                    self.dstate.exchange_add(DSTATE_LLA_BIT);
                    if !self.propagate(1, 1) {
                        self.ignore_dependency_updates.store(true, Ordering::Release);
                    }
                }
                Direction::Analysis => {
                    if max_of(self.dstate.get()) == 0 || !self.propagate(0, 1) {
                        self.ignore_dependency_updates.store(true, Ordering::Release);
                    }
                }
            }
        }
        self.initialized.store(true, Ordering::Release);
    }

    /// Run the row exchange's deferred start-up step. Returns true once
    /// the exchange is ready for delivery.
    pub fn start_io(&self) -> bool {
        let mut st = self.lock_state();
        match &mut st.io {
            RowIo::Push(sink) => sink.start(self),
            RowIo::Pull(source) => source.start(self),
            RowIo::None => true,
        }
    }

    /// The row source has fully started; retract the pretend dependency
    /// installed by [`TransformQueue::init`], possibly scheduling the
    /// first job.
    pub fn set_ready_for_pull(&self) {
        if self.ready_for_pull.swap(true, Ordering::AcqRel) {
            return;
        }
        if matches!(self.direction, Direction::Synthesis) && self.num_stripes > 1 {
            self.update_dependencies(-1, 0);
        }
    }

    pub(crate) fn propagate(&self, new_dependencies: i32, delta_max: i32) -> bool {
        if self.ignore_dependency_updates.load(Ordering::Acquire) {
            return false;
        }
        match &self.monitor {
            Some(monitor) => monitor.update_dependencies(new_dependencies, delta_max),
            None => false,
        }
    }

    /// Dependency update from the wavelet side. Positive counts are
    /// deferred (they may only arrive from inside a delivery, while the
    /// `RUN` bit is held); negative counts may claim the `RUN` bit and
    /// schedule a job. Returns false once updates are being ignored.
    pub fn update_dependencies(&self, new_dependencies: i32, delta_max: i32) -> bool {
        if self.ignore_dependency_updates.load(Ordering::Acquire) || self.cancel.is_cancelled() {
            return false;
        }
        if !self.initialized.load(Ordering::Acquire) {
            self.dstate.exchange_add(delta(new_dependencies, delta_max));
            return true;
        }
        let mut new_dependencies = new_dependencies;
        if new_dependencies > 0 {
            debug_assert!(run_of(self.dstate.get()));
            debug_assert_eq!(delta_max, 0);
            self.acc_new_dependencies
                .fetch_add(new_dependencies, Ordering::AcqRel);
            new_dependencies = 0;
        }
        if new_dependencies == 0 && delta_max == 0 {
            return true;
        }
        if self.num_stripes > 1 {
            if new_dependencies < 0 {
                let have_rows = self.rows_left_in_stripe.load(Ordering::Acquire) > 0;
                let (old, new) = self
                    .dstate
                    .apply_delta_maybe_run(delta(new_dependencies, delta_max), have_rows);
                if run_of(new) && !run_of(old) {
                    let mut last = self.have_all_scheduled.load(Ordering::Acquire);
                    if !last && max_of(new) == 0 {
                        let available = d_of(self.sync_mdw.get()) as i32;
                        if available >= self.stripes_left_in_component.load(Ordering::Acquire) {
                            self.have_all_scheduled.store(true, Ordering::Release);
                            last = true;
                        }
                    }
                    self.schedule(last);
                }
            } else {
                self.dstate.exchange_add(delta(0, delta_max));
            }
        } else {
            let change = delta(new_dependencies, delta_max);
            let old = self.dstate.exchange_add(change);
            let new = old + change;
            if !run_of(new) {
                self.sync_dwt_propagate(old, new);
            }
        }
        true
    }

    fn schedule(&self, last: bool) {
        let me = match self.weak_self.upgrade() {
            Some(me) => me,
            None => return,
        };
        if let Some(scheduler) = &self.scheduler {
            scheduler.schedule_job(Box::new(move || me.run_job()), last);
        } else {
            debug_assert!(false, "multi-stripe queue requires a scheduler");
        }
    }

    /// Exchange one ring row with the wavelet side
    pub(crate) fn deliver_row(&self, st: &mut JobState, ring_idx: usize) {
        let mut row = self.ring[ring_idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &mut st.io {
            RowIo::Push(sink) => sink.push(&mut row, self),
            RowIo::Pull(source) => source.pull(&mut row, self),
            RowIo::None => debug_assert!(false, "row exchange not attached"),
        }
    }

    /// Multi-stripe job body: exchange rows until the component is done,
    /// a fold leaves blocking dependencies (drop `RUN` and return), or
    /// termination is requested.
    fn run_job(self: Arc<Self>) {
        let mut guard = self.lock_state();
        let st = &mut *guard;
        let mut all_finished = false;
        let mut dwt_stripes_available: i32 = -1;
        let mut have_all_scheduled = self.have_all_scheduled.load(Ordering::Acquire);
        while !all_finished {
            debug_assert!(self.rows_left_in_stripe.load(Ordering::Acquire) > 0);
            if st.next_stripe_row_idx == 0
                && !have_all_scheduled
                && dwt_stripes_available >= self.stripes_left_in_component.load(Ordering::Acquire)
                && max_of(self.dstate.get()) == 0
            {
                // No further dependency can block this component; once the
                // current run finishes every remaining stripe is covered.
                have_all_scheduled = true;
                self.have_all_scheduled.store(true, Ordering::Release);
            }

            let ring_idx = st.active_row + st.next_stripe_row_idx as usize;
            self.deliver_row(st, ring_idx);
            st.next_stripe_row_idx += 1;
            if self.rows_left_in_stripe.fetch_sub(1, Ordering::AcqRel) - 1 == 0 {
                let (old_sync, new_sync) = self.sync_mdw.stripe_processed();
                dwt_stripes_available = d_of(new_sync) as i32;
                if dwt_stripes_available == 0 {
                    // The exchange itself is now a blocking condition
                    self.acc_new_dependencies.fetch_add(1, Ordering::AcqRel);
                }
                if w_of(old_sync) {
                    self.wait.notify();
                }

                let stripes_left = self.stripes_left_in_component.fetch_sub(1, Ordering::AcqRel) - 1;
                st.comp_rows_left -= st.next_stripe_row_idx;
                st.next_stripe_row_idx = 0;
                let mut rows = self.max_stripe_rows;
                if rows >= st.comp_rows_left {
                    rows = st.comp_rows_left;
                    if rows == 0 {
                        all_finished = true;
                    }
                }
                self.rows_left_in_stripe.store(rows, Ordering::Release);
                st.active_row += self.max_stripe_rows as usize;
                if st.active_row >= self.ring.len() {
                    st.active_row = 0;
                }

                match self.direction {
                    Direction::Analysis => {
                        let mut delta_deps = 0;
                        if m_of(old_sync) == 0 && stripes_left > dwt_stripes_available {
                            delta_deps = -1;
                        }
                        if stripes_left == self.num_stripes as i32 {
                            self.propagate(delta_deps, -1);
                        } else if delta_deps != 0 {
                            self.propagate(delta_deps, 0);
                        }
                    }
                    Direction::Synthesis => {
                        if all_finished {
                            if m_of(old_sync) == 0 {
                                self.propagate(-1, -1);
                            } else {
                                self.propagate(0, -1);
                            }
                        } else if m_of(old_sync) == 0 {
                            self.propagate(-1, 0);
                        }
                    }
                }
            }

            if self.cancel.is_cancelled() {
                all_finished = true;
            } else if !(all_finished || have_all_scheduled)
                && self.acc_new_dependencies.load(Ordering::Acquire) > 0
            {
                let accumulated = self.acc_new_dependencies.swap(0, Ordering::AcqRel);
                let (_, new) = self.dstate.fold_deferred(accumulated);
                if !run_of(new) {
                    // A successor job owns the queue from here on
                    return;
                }
                if terminating(new) {
                    all_finished = true;
                }
            }
        }
        if self.cancel.is_cancelled() {
            let old = self.sync_mdw.release_all();
            if w_of(old) {
                self.wait.notify();
            }
        }
        drop(guard);
        self.completion.fire();
    }

    /// Single-stripe mode: the last line of the buffered stripe has been
    /// handed out, so the transform side would block next time
    pub(crate) fn lla_set(&self) {
        let old = self.dstate.exchange_add(DSTATE_LLA_BIT);
        if num_of(old + DSTATE_LLA_BIT) == 0 {
            self.propagate(1, 0);
        }
    }

    /// Begin a synchronous wavelet exchange on the caller's thread
    pub(crate) fn dwt_start(&self, st: &mut JobState) {
        st.save_dstate = self.dstate.exchange_add(DSTATE_RUN_BIT);
        debug_assert!(!run_of(st.save_dstate));
    }

    /// Between rows of a synchronous exchange: fold deferred dependencies
    /// and stop (returning false) when any remain blocking
    pub(crate) fn dwt_continue(&self, st: &mut JobState, leave_lla_set: bool) -> bool {
        if self.acc_new_dependencies.load(Ordering::Acquire) == 0 {
            return true;
        }
        let accumulated = self.acc_new_dependencies.swap(0, Ordering::AcqRel);
        let (_, new) = self.dstate.sync_boundary(accumulated, leave_lla_set, false);
        if run_of(new) {
            return true;
        }
        self.sync_dwt_propagate(st.save_dstate, new);
        false
    }

    /// End a synchronous wavelet exchange unconditionally
    pub(crate) fn dwt_end(&self, st: &mut JobState, leave_lla_set: bool) {
        let accumulated = self.acc_new_dependencies.swap(0, Ordering::AcqRel);
        let (_, new) = self.dstate.sync_boundary(accumulated, leave_lla_set, true);
        self.sync_dwt_propagate(st.save_dstate, new);
    }

    /// Translate a single-stripe `DState` transition into parent
    /// propagation: report entering/leaving the blocked condition while
    /// the queue can still block, and retract the maximum once it no
    /// longer can.
    fn sync_dwt_propagate(&self, old: i32, new: i32) {
        if self.ignore_dependency_updates.load(Ordering::Acquire) {
            return;
        }
        let was_blocked = lla_of(old) && num_of(old) > 0;
        let now_blocked = lla_of(new) && num_of(new) > 0;
        let was_able = max_of(old) != 0 || num_of(old) != 0;
        let is_able = max_of(new) != 0 || num_of(new) != 0;
        if is_able {
            if was_blocked && !now_blocked {
                self.propagate(-1, 0);
            } else if now_blocked && !was_blocked {
                self.propagate(1, 0);
            }
        } else if was_able {
            if was_blocked {
                self.propagate(-1, -1);
            } else {
                self.propagate(0, -1);
            }
        }
    }

    /// Fire the completion latch; used by single-stripe exchanges when
    /// the component's last row has been exchanged
    pub(crate) fn mark_done(&self) {
        self.completion.fire();
    }

    /// Stop the component as soon as the in-flight row (if any) settles.
    /// Completion fires exactly once, from here when no job holds the
    /// `RUN` bit, from the job otherwise.
    pub fn request_termination(&self) {
        self.cancel.cancel();
        if self.num_stripes > 1 {
            let old = self.dstate.exchange_or(DSTATE_T_BIT);
            if !run_of(old) {
                let old_sync = self.sync_mdw.release_all();
                if w_of(old_sync) {
                    self.wait.notify();
                }
                self.completion.fire();
            }
        } else {
            self.completion.fire();
        }
    }

    pub fn is_done(&self) -> bool {
        self.completion.fired.load(Ordering::Acquire)
    }

    /// Block until the component's completion latch fires
    pub fn wait_done(&self) {
        self.completion.done.wait_until(|| self.is_done());
    }
}

impl DependencySignal for TransformQueue {
    fn add_dependency(&self) {
        self.update_dependencies(1, 0);
    }

    fn remove_dependency(&self) {
        self.update_dependencies(-1, 0);
    }

    fn change_max_dependencies(&self, delta_max: i32) {
        self.update_dependencies(0, delta_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::InlineScheduler;
    use std::sync::atomic::AtomicU32;

    struct CollectSink {
        rows: Arc<Mutex<Vec<Vec<i16>>>>,
    }

    impl RowSink for CollectSink {
        fn push(&mut self, row: &mut LineBuf, _signal: &dyn DependencySignal) {
            self.rows
                .lock()
                .unwrap()
                .push(row.as_i16().unwrap().to_vec());
        }
    }

    struct CountingSource {
        next: i16,
    }

    impl RowSource for CountingSource {
        fn pull(&mut self, row: &mut LineBuf, _signal: &dyn DependencySignal) {
            row.fill_int(self.next as i32);
            self.next += 1;
        }
    }

    fn analysis_queue(
        rows: Arc<Mutex<Vec<Vec<i16>>>>,
    ) -> Arc<TransformQueue> {
        let queue = TransformQueue::new(
            Direction::Analysis,
            2,
            2,
            4,
            4,
            true,
            true,
            None,
            Some(Arc::new(InlineScheduler)),
            CancelToken::new(),
        );
        queue.attach_sink(Box::new(CollectSink { rows }));
        queue.init();
        queue
    }

    fn write_stripe(queue: &TransformQueue, first_row: usize, values: [i16; 2]) {
        for (offset, value) in values.iter().enumerate() {
            queue.ring[first_row + offset].lock().unwrap().fill_int(*value as i32);
        }
        let (old, _) = queue.sync_mdw.stripe_written();
        if d_of(old) == 0 {
            queue.update_dependencies(-1, 0);
        }
    }

    #[test]
    fn test_analysis_jobs_drain_written_stripes_in_order() {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let queue = analysis_queue(rows.clone());

        write_stripe(&queue, 0, [10, 11]);
        write_stripe(&queue, 2, [12, 13]);
        assert!(queue.is_done());
        let rows = rows.lock().unwrap();
        assert_eq!(rows.len(), 4);
        for (idx, row) in rows.iter().enumerate() {
            assert!(row.iter().all(|&v| v == 10 + idx as i16));
        }
    }

    #[test]
    fn test_synthesis_job_fills_ring_after_ready_for_pull() {
        let queue = TransformQueue::new(
            Direction::Synthesis,
            2,
            1,
            2,
            2,
            true,
            true,
            None,
            Some(Arc::new(InlineScheduler)),
            CancelToken::new(),
        );
        queue.attach_source(Box::new(CountingSource { next: 1 }));
        queue.init();
        assert!(!queue.is_done());

        queue.set_ready_for_pull();
        assert!(queue.is_done());
        assert_eq!(queue.ring[0].lock().unwrap().as_i16().unwrap(), &[1, 1]);
        assert_eq!(queue.ring[1].lock().unwrap().as_i16().unwrap(), &[2, 2]);
        assert_eq!(m_of(queue.sync_mdw.get()), 2);
    }

    #[test]
    fn test_termination_fires_completion_exactly_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let rows = Arc::new(Mutex::new(Vec::new()));
        let queue = analysis_queue(rows.clone());
        let count = fired.clone();
        queue.set_completion(Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        write_stripe(&queue, 0, [1, 2]);
        queue.request_termination();
        queue.request_termination();
        queue.wait_done();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Only the first stripe was exchanged before termination.
        assert_eq!(rows.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_updates_refused_after_cancellation() {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let queue = analysis_queue(rows);
        queue.cancel_token().cancel();
        assert!(!queue.update_dependencies(-1, 0));
    }
}
