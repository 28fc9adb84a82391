//! Compression facade
//!
//! [`MultiAnalysis`] drives an inverted transform network in the
//! compression direction: the application writes output component rows
//! through the [`MultiAnalysis::exchange_line`] protocol and the network
//! inverts each transform block as soon as all of its outputs for a row
//! have arrived, pushing the resulting codestream component rows into the
//! per-component [`crate::io::RowSink`]s. A `None` from `exchange_line`
//! with `written` set means the row was absorbed but the next buffer is
//! not ready yet; with `written` clear it means the component is
//! exhausted.

use std::sync::Arc;

use mct_core::{Coords, Direction, LineBuf, LineHandle, MctError, MctResult};
use mct_transform::line::MultiLine;
use mct_transform::ycc;
use mct_transform::{NetworkConfig, TileDescription, TransformNetwork};

use crate::cancel::CancelToken;
use crate::component::ComponentEngine;
use crate::io::{DependencyMonitor, RowSink, SampleAllocator};
use crate::queue::TransformQueue;
use crate::scheduler::JobScheduler;

/// Forward component transform dispatch, mirroring the inverse dispatch
/// on the synthesis side
pub(crate) fn rgb_to_ycc_lines(l0: &mut MultiLine, l1: &mut MultiLine, l2: &mut MultiLine) {
    let reversible = l0.reversible;
    let b0 = l0.buf.as_mut().unwrap_or_else(|| unreachable!());
    let b1 = l1.buf.as_mut().unwrap_or_else(|| unreachable!());
    let b2 = l2.buf.as_mut().unwrap_or_else(|| unreachable!());
    if reversible && b0.is_short() {
        ycc::rgb_to_ycc_rev16(
            b0.as_i16_mut().unwrap_or_else(|| unreachable!()),
            b1.as_i16_mut().unwrap_or_else(|| unreachable!()),
            b2.as_i16_mut().unwrap_or_else(|| unreachable!()),
        );
    } else {
        ycc::rgb_to_ycc(b0, b1, b2);
    }
}

pub struct MultiAnalysis {
    network: TransformNetwork,
    /// One stripe engine per codestream component, in component order
    engines: Vec<ComponentEngine>,
    outputs: Vec<LineHandle>,
    /// Next row the application will supply, per output component
    source_rows: Vec<i32>,
    fully_started: bool,
    cancel: CancelToken,
}

impl MultiAnalysis {
    /// Build the network, prepare it for inversion, attach one row sink
    /// per codestream component and bring the queues up. Row-buffer bytes
    /// are reserved against `allocator`; the caller finalizes it to learn
    /// the total.
    pub fn create(
        desc: &TileDescription,
        config: &NetworkConfig,
        sinks: Vec<Box<dyn RowSink>>,
        scheduler: Option<Arc<dyn JobScheduler>>,
        monitor: Option<Arc<dyn DependencyMonitor>>,
        allocator: &mut dyn SampleAllocator,
    ) -> MctResult<Self> {
        let mut network = TransformNetwork::construct(desc, config)?;
        network.prepare_for_inversion()?;
        if sinks.len() != network.codestream.len() {
            return Err(MctError::InvalidParameter(format!(
                "expected {} row sinks, got {}",
                network.codestream.len(),
                sinks.len()
            )));
        }

        let cancel = CancelToken::new();
        let mut engines = Vec::with_capacity(network.codestream.len());
        for (comp, sink) in network.codestream.iter().zip(sinks) {
            let line = network.lines.get(comp.line);
            let queue = TransformQueue::new(
                Direction::Analysis,
                comp.num_stripes,
                comp.max_stripe_rows,
                comp.total_rows,
                line.size.x as usize,
                !line.need_precise,
                line.reversible,
                monitor.clone(),
                scheduler.clone(),
                cancel.clone(),
            );
            queue.attach_sink(sink);
            queue.init();
            allocator.reserve(
                comp.num_stripes
                    * comp.max_stripe_rows as usize
                    * line.size.x as usize
                    * if line.need_precise { 4 } else { 2 },
            );
            engines.push(ComponentEngine::new(queue)?);
        }
        network.create_resources()?;
        for (_, line) in network.lines.iter() {
            if line.buf.is_some() {
                allocator.reserve(line.size.x as usize * if line.need_precise { 4 } else { 2 });
            }
        }

        let outputs = network.output_lines();
        let source_rows = vec![0; outputs.len()];
        let mut this = Self {
            network,
            engines,
            outputs,
            source_rows,
            fully_started: false,
            cancel,
        };
        this.start();
        Ok(this)
    }

    /// Drive the deferred start-up of all row sinks; returns true once
    /// every sink is ready
    pub fn start(&mut self) -> bool {
        if self.fully_started {
            return true;
        }
        let mut all_started = true;
        for engine in &self.engines {
            if !engine.queue().start_io() {
                all_started = false;
            }
        }
        if all_started {
            self.fully_started = true;
        }
        all_started
    }

    pub fn num_components(&self) -> usize {
        self.outputs.len()
    }

    pub fn get_size(&self, comp_idx: usize) -> Coords {
        self.network.lines.get(self.outputs[comp_idx]).size
    }

    /// True when the component's rows use a 32-bit representation
    pub fn is_line_precise(&self, comp_idx: usize) -> bool {
        self.network.lines.get(self.outputs[comp_idx]).need_precise
    }

    /// True when the component's rows hold absolute integers rather than
    /// fixed/floating point values
    pub fn is_line_absolute(&self, comp_idx: usize) -> bool {
        self.network.lines.get(self.outputs[comp_idx]).reversible
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request termination of every component queue
    pub fn terminate_queues(&self) {
        for engine in &self.engines {
            engine.queue().request_termination();
        }
    }

    /// Block until every component queue has completed
    pub fn wait_done(&self) {
        for engine in &self.engines {
            engine.queue().wait_done();
        }
    }

    /// Exchange rows of one output component. With `written` set, the
    /// row currently in the component's buffer is absorbed into the
    /// network first; the returned buffer, when present, receives the
    /// next row. `None` with `written` clear means the component is
    /// exhausted; with `written` set it means the caller should come back
    /// later rather than block.
    pub fn exchange_line(&mut self, comp_idx: usize, written: bool) -> Option<&mut LineBuf> {
        while !self.fully_started {
            self.start();
        }
        let handle = self.outputs[comp_idx];
        let mut row = self.source_rows[comp_idx];
        if row >= self.network.lines.get(handle).size.y {
            return None;
        }
        debug_assert_eq!(self.network.lines.get(handle).num_consumers, 1);
        if written {
            debug_assert!(!self.network.lines.get(handle).waiting_for_inversion);
            {
                let line = self.network.lines.get_mut(handle);
                let (rev, irrev) = (-line.rev_offset, -line.irrev_offset);
                line.apply_offset(rev, irrev);
            }
            self.advance_line(handle, row);
            row += 1;
            self.source_rows[comp_idx] = row;
        }
        debug_assert_eq!(self.network.lines.get(handle).row_idx, row - 1);
        if self.network.lines.get(handle).waiting_for_inversion {
            return None;
        }
        let line = self.network.lines.get(handle);
        if line.block.is_none() && !line.is_constant && line.collection_idx >= 0 {
            // Codestream component written directly by the caller; make
            // sure a stripe slot exists to absorb the row
            let idx = line.collection_idx as usize;
            if !self.engines[idx].has_pending_row() {
                if written {
                    // The caller has no need to block; it can come back
                    return None;
                }
                self.engines[idx].reserve_row();
            }
        }
        self.network.lines.get_mut(handle).buf.as_mut()
    }

    /// Absorb row `new_row` of `handle` into the network, inverting any
    /// transform block whose outputs are now all present and pushing
    /// completed codestream rows into their engines
    fn advance_line(&mut self, handle: LineHandle, new_row: i32) {
        {
            let line = self.network.lines.get_mut(handle);
            debug_assert_eq!(line.row_idx, new_row - 1);
            line.row_idx = new_row;
            line.waiting_for_inversion = false;
            if line.is_constant {
                return;
            }
        }

        match self.network.lines.get(handle).block {
            Some(bh) if self.network.blocks.get(bh).is_null_transform() => {
                // Pass through to the corresponding dependency, if any
                let slot = self
                    .network
                    .blocks
                    .get(bh)
                    .components
                    .iter()
                    .position(|&c| c == handle)
                    .unwrap_or_else(|| unreachable!());
                debug_assert!(slot < self.network.blocks.get(bh).dependencies.len());
                let mut dep = self.network.blocks.get(bh).dependencies[slot];
                if let Some(d) = dep {
                    if self.network.lines.get(d).row_idx >= new_row {
                        // Another consumer has already written this row
                        let line = self.network.lines.get_mut(d);
                        debug_assert!(line.num_consumers > 1);
                        line.num_consumers -= 1;
                        self.network.blocks.get_mut(bh).dependencies[slot] = None;
                        dep = None;
                    }
                }
                let Some(d) = dep else { return };
                debug_assert!(
                    self.network.lines.get(d).num_consumers > 0
                        && !self.network.lines.get(d).is_constant
                );
                {
                    let (dst, src) = self.network.lines.pair_mut(d, handle);
                    let (rev, irrev) = (-dst.rev_offset, -dst.irrev_offset);
                    dst.copy_from(src, rev, irrev);
                }
                self.advance_line(d, new_row);
            }
            Some(bh) => {
                self.network.lines.get_mut(handle).waiting_for_inversion = true;
                {
                    let block = self.network.blocks.get_mut(bh);
                    block.outstanding_consumers -= 1;
                    if block.outstanding_consumers > 0 {
                        return;
                    }
                }
                // All of the block's consumed outputs hold the new row;
                // check that every dependency can be written
                loop {
                    let cursor = self.network.blocks.get(bh).num_available_dependencies;
                    if cursor >= self.network.blocks.get(bh).dependencies.len() {
                        break;
                    }
                    if let Some(d) = self.network.blocks.get(bh).dependencies[cursor] {
                        if self.network.lines.get(d).is_constant {
                            self.network.blocks.get_mut(bh).dependencies[cursor] = None;
                        } else if self.network.lines.get(d).row_idx < new_row
                            && self.network.lines.get(d).waiting_for_inversion
                        {
                            // Cannot write inversion results yet
                            return;
                        }
                    }
                    self.network.blocks.get_mut(bh).num_available_dependencies = cursor + 1;
                }
                // Remove dependencies another consumer already wrote
                for slot in 0..self.network.blocks.get(bh).dependencies.len() {
                    if let Some(d) = self.network.blocks.get(bh).dependencies[slot] {
                        if self.network.lines.get(d).row_idx >= new_row {
                            let line = self.network.lines.get_mut(d);
                            debug_assert!(line.num_consumers > 1);
                            line.num_consumers -= 1;
                            self.network.blocks.get_mut(bh).dependencies[slot] = None;
                        }
                    }
                }

                {
                    let TransformNetwork { blocks, lines, .. } = &mut self.network;
                    blocks.get_mut(bh).perform_inverse(lines);
                }

                let dependencies = self.network.blocks.get(bh).dependencies.clone();
                for d in dependencies.into_iter().flatten() {
                    self.advance_line(d, new_row);
                }
                let components = self.network.blocks.get(bh).components.clone();
                for &comp in &components {
                    let consumers = {
                        let line = self.network.lines.get_mut(comp);
                        line.waiting_for_inversion = false;
                        line.num_consumers
                    };
                    if consumers > 0 {
                        debug_assert_eq!(consumers, 1);
                        self.network.blocks.get_mut(bh).outstanding_consumers += 1;
                    }
                }
                self.network.blocks.get_mut(bh).num_available_dependencies = 0;
            }
            None => {
                let idx = self.network.lines.get(handle).collection_idx;
                debug_assert!(idx >= 0);
                let idx = idx as usize;
                let process_ycc = self.network.use_ycc && idx < 3;
                if process_ycc {
                    self.network.lines.get_mut(handle).waiting_for_inversion = true;
                    for k in 0..3 {
                        let yl = self.network.codestream[k].line;
                        if self.network.lines.get(yl).row_idx < new_row {
                            // Cannot run the component transform yet
                            return;
                        }
                    }
                    let (h0, h1, h2) = (
                        self.network.codestream[0].line,
                        self.network.codestream[1].line,
                        self.network.codestream[2].line,
                    );
                    let (l0, l1, l2) = self.network.lines.trio_mut(h0, h1, h2);
                    rgb_to_ycc_lines(l0, l1, l2);
                    for k in 0..3 {
                        let yl = self.network.codestream[k].line;
                        let line = self.network.lines.get_mut(yl);
                        debug_assert!(line.waiting_for_inversion);
                        line.waiting_for_inversion = false;
                    }
                    for k in 0..3 {
                        self.push_codestream(k);
                    }
                } else {
                    self.push_codestream(idx);
                }
            }
        }

        debug_assert!(!self.network.lines.get(handle).waiting_for_inversion);
    }

    fn push_codestream(&mut self, idx: usize) {
        let Self {
            network, engines, ..
        } = self;
        let handle = network.codestream[idx].line;
        let buf = network
            .lines
            .get(handle)
            .buf
            .as_ref()
            .unwrap_or_else(|| unreachable!());
        engines[idx].push_row(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DefaultAllocator, DependencySignal};
    use mct_core::CompressionMode;
    use mct_transform::{ComponentDescription, OutputDescription};
    use std::sync::Mutex;

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

    fn plain_tile(num: usize, width: i32, height: i32, use_ycc: bool) -> TileDescription {
        TileDescription {
            components: (0..num)
                .map(|comp_idx| ComponentDescription {
                    comp_idx,
                    width,
                    height,
                    bit_depth: 8,
                    mode: CompressionMode::Reversible,
                })
                .collect(),
            outputs: (0..num)
                .map(|_| OutputDescription {
                    width,
                    height,
                    bit_depth: 8,
                    signed: true,
                })
                .collect(),
            stages: Vec::new(),
            use_ycc,
        }
    }

    #[test]
    fn test_pass_through_rows_reach_the_sink() {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let mut alloc = DefaultAllocator::new();
        let mut analysis = MultiAnalysis::create(
            &plain_tile(1, 4, 3, false),
            &NetworkConfig::default(),
            vec![Box::new(CollectSink { rows: rows.clone() })],
            None,
            None,
            &mut alloc,
        )
        .unwrap();
        assert!(alloc.finalize() > 0);
        assert_eq!(analysis.get_size(0), Coords::new(4, 3));
        assert!(analysis.is_line_absolute(0));

        for value in 1..=3 {
            let buf = analysis.exchange_line(0, false).unwrap();
            buf.fill_int(value);
            analysis.exchange_line(0, true);
        }
        assert!(analysis.exchange_line(0, false).is_none());
        assert!(analysis.engines[0].queue().is_done());
        assert_eq!(
            rows.lock().unwrap().as_slice(),
            &[vec![1i16; 4], vec![2i16; 4], vec![3i16; 4]]
        );
    }

    #[test]
    fn test_component_transform_runs_when_the_triple_completes() {
        let sinks: Vec<Arc<Mutex<Vec<Vec<i16>>>>> =
            (0..3).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
        let mut alloc = DefaultAllocator::new();
        let mut analysis = MultiAnalysis::create(
            &plain_tile(3, 2, 2, true),
            &NetworkConfig::default(),
            sinks
                .iter()
                .map(|rows| {
                    Box::new(CollectSink { rows: rows.clone() }) as Box<dyn RowSink>
                })
                .collect(),
            None,
            None,
            &mut alloc,
        )
        .unwrap();

        // r=3, g=11, b=15: y = (3 + 22 + 15) >> 2 = 10, cb = 15 - 11 = 4,
        // cr = 3 - 11 = -8
        let rgb = [3, 11, 15];
        for _row in 0..2 {
            for (comp, value) in rgb.iter().enumerate() {
                let buf = analysis.exchange_line(comp, false).unwrap();
                buf.fill_int(*value);
                analysis.exchange_line(comp, true);
            }
        }
        // Nothing leaves the network until all three components of a row
        // are in; by the end both rows of every sink have arrived.
        assert_eq!(
            sinks[0].lock().unwrap().as_slice(),
            &[vec![10i16; 2], vec![10i16; 2]]
        );
        assert_eq!(
            sinks[1].lock().unwrap().as_slice(),
            &[vec![4i16; 2], vec![4i16; 2]]
        );
        assert_eq!(
            sinks[2].lock().unwrap().as_slice(),
            &[vec![-8i16; 2], vec![-8i16; 2]]
        );
        for engine in &analysis.engines {
            assert!(engine.queue().is_done());
        }
    }

    #[test]
    fn test_sink_count_mismatch_is_rejected() {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let mut alloc = DefaultAllocator::new();
        let result = MultiAnalysis::create(
            &plain_tile(2, 4, 4, false),
            &NetworkConfig::default(),
            vec![Box::new(CollectSink { rows })],
            None,
            None,
            &mut alloc,
        );
        assert!(matches!(result, Err(MctError::InvalidParameter(_))));
    }
}
