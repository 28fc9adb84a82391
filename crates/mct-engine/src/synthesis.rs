//! Decompression facade
//!
//! [`MultiSynthesis`] drives a constructed transform network in the
//! decompression direction: wavelet-synthesized codestream rows enter
//! through per-component [`crate::io::RowSource`]s and finished output
//! component rows leave through [`MultiSynthesis::get_line`]. Rows are
//! realized lazily and strictly in order; a `None` from `get_line` means
//! some sibling consumer of an intermediate line has not taken the
//! current row yet, and the caller should collect other components first.

use std::sync::Arc;

use mct_core::{Coords, Direction, LineBuf, LineHandle, MctError, MctResult};
use mct_transform::line::MultiLine;
use mct_transform::ycc;
use mct_transform::{NetworkConfig, TileDescription, TransformNetwork};

use crate::cancel::CancelToken;
use crate::component::ComponentEngine;
use crate::io::{DependencyMonitor, RowSource, SampleAllocator};
use crate::queue::TransformQueue;
use crate::scheduler::JobScheduler;

/// Inverse component transform dispatch: reversible 16-bit triples take
/// the RCT short path, everything else goes through the general form.
pub(crate) fn ycc_to_rgb_lines(l0: &mut MultiLine, l1: &mut MultiLine, l2: &mut MultiLine) {
    let reversible = l0.reversible;
    let b0 = l0.buf.as_mut().unwrap_or_else(|| unreachable!());
    let b1 = l1.buf.as_mut().unwrap_or_else(|| unreachable!());
    let b2 = l2.buf.as_mut().unwrap_or_else(|| unreachable!());
    if reversible && b0.is_short() {
        ycc::ycc_to_rgb_rev16(
            b0.as_i16_mut().unwrap_or_else(|| unreachable!()),
            b1.as_i16_mut().unwrap_or_else(|| unreachable!()),
            b2.as_i16_mut().unwrap_or_else(|| unreachable!()),
        );
    } else {
        ycc::ycc_to_rgb(b0, b1, b2);
    }
}

pub struct MultiSynthesis {
    network: TransformNetwork,
    /// One stripe engine per codestream component, in component order
    engines: Vec<ComponentEngine>,
    outputs: Vec<LineHandle>,
    /// Next row to hand out, per output component
    output_rows: Vec<i32>,
    fully_started: bool,
    cancel: CancelToken,
}

impl MultiSynthesis {
    /// Build the network, attach one row source per codestream component
    /// and bring the queues up. Row-buffer bytes are reserved against
    /// `allocator`; the caller finalizes it to learn the total.
    pub fn create(
        desc: &TileDescription,
        config: &NetworkConfig,
        sources: Vec<Box<dyn RowSource>>,
        scheduler: Option<Arc<dyn JobScheduler>>,
        monitor: Option<Arc<dyn DependencyMonitor>>,
        allocator: &mut dyn SampleAllocator,
    ) -> MctResult<Self> {
        let mut network = TransformNetwork::construct(desc, config)?;
        if sources.len() != network.codestream.len() {
            return Err(MctError::InvalidParameter(format!(
                "expected {} row sources, got {}",
                network.codestream.len(),
                sources.len()
            )));
        }

        let cancel = CancelToken::new();
        let mut engines = Vec::with_capacity(network.codestream.len());
        for (comp, source) in network.codestream.iter().zip(sources) {
            let line = network.lines.get(comp.line);
            let queue = TransformQueue::new(
                Direction::Synthesis,
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
            queue.attach_source(source);
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
        let output_rows = vec![0; outputs.len()];
        let mut this = Self {
            network,
            engines,
            outputs,
            output_rows,
            fully_started: false,
            cancel,
        };
        this.start();
        Ok(this)
    }

    /// Drive the deferred start-up of all row sources; returns true once
    /// every source is ready and the queues accept pulls
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
            for engine in &self.engines {
                engine.queue().set_ready_for_pull();
            }
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

    /// Produce the next row of one output component, or `None` when the
    /// component is exhausted or a sibling consumer lags behind
    pub fn get_line(&mut self, comp_idx: usize) -> Option<&LineBuf> {
        while !self.fully_started {
            self.start();
        }
        let handle = self.outputs[comp_idx];
        let row = self.output_rows[comp_idx];
        if row >= self.network.lines.get(handle).size.y {
            return None;
        }
        if !self.realize(handle, row) {
            return None;
        }
        self.output_rows[comp_idx] = row + 1;
        self.network.lines.get(handle).buf.as_ref()
    }

    /// Make `handle` hold row `tgt`, recursively realizing everything it
    /// depends on. Returns false when a previously generated row still
    /// has outstanding consumers somewhere along the way.
    fn realize(&mut self, handle: LineHandle, tgt: i32) -> bool {
        debug_assert!(self.network.lines.get(handle).bypass.is_none());
        if self.network.lines.get(handle).is_constant {
            return true;
        }
        if self.network.lines.get(handle).row_idx == tgt {
            // Already generated; just consume it
            let line = self.network.lines.get_mut(handle);
            debug_assert!(line.outstanding_consumers > 0);
            line.outstanding_consumers -= 1;
            if let Some(bh) = line.block {
                self.network.blocks.get_mut(bh).outstanding_consumers -= 1;
            }
            return true;
        }
        debug_assert_eq!(self.network.lines.get(handle).row_idx, tgt - 1);
        if self.network.lines.get(handle).outstanding_consumers > 0 {
            return false;
        }

        match self.network.lines.get(handle).block {
            Some(bh) if self.network.blocks.get(bh).is_null_transform() => {
                let slot = self
                    .network
                    .blocks
                    .get(bh)
                    .components
                    .iter()
                    .position(|&c| c == handle)
                    .unwrap_or_else(|| unreachable!());
                let dep = self.network.blocks.get(bh).dependencies[slot]
                    .unwrap_or_else(|| unreachable!());
                if !self.realize(dep, tgt) {
                    return false;
                }
                let (line, src) = self.network.lines.pair_mut(handle, dep);
                line.row_idx = tgt;
                line.outstanding_consumers = line.num_consumers;
                let (rev, irrev) = (line.rev_offset, line.irrev_offset);
                line.copy_from(src, rev, irrev);
            }
            Some(bh) => {
                if self.network.blocks.get(bh).outstanding_consumers > 0 {
                    return false;
                }
                loop {
                    let cursor = self.network.blocks.get(bh).num_available_dependencies;
                    if cursor >= self.network.blocks.get(bh).dependencies.len() {
                        break;
                    }
                    if let Some(dep) = self.network.blocks.get(bh).dependencies[cursor] {
                        if !self.network.lines.get(dep).is_constant {
                            if !self.realize(dep, tgt) {
                                return false;
                            }
                            // Hold the row; it is only consumed once the
                            // whole block runs
                            let line = self.network.lines.get_mut(dep);
                            line.outstanding_consumers += 1;
                            if let Some(db) = line.block {
                                self.network.blocks.get_mut(db).outstanding_consumers += 1;
                            }
                        }
                    }
                    self.network.blocks.get_mut(bh).num_available_dependencies = cursor + 1;
                }

                let components = self.network.blocks.get(bh).components.clone();
                for &comp in &components {
                    if self.network.lines.get(comp).outstanding_consumers > 0 {
                        return false;
                    }
                }

                {
                    let TransformNetwork { blocks, lines, .. } = &mut self.network;
                    blocks.get_mut(bh).perform_transform(lines);
                }

                let dependencies = self.network.blocks.get(bh).dependencies.clone();
                for dep in dependencies.into_iter().flatten() {
                    debug_assert_eq!(self.network.lines.get(dep).row_idx, tgt);
                    let line = self.network.lines.get_mut(dep);
                    line.outstanding_consumers -= 1;
                    if let Some(db) = line.block {
                        self.network.blocks.get_mut(db).outstanding_consumers -= 1;
                    }
                }
                for &comp in &components {
                    let line = self.network.lines.get_mut(comp);
                    debug_assert!(line.outstanding_consumers == 0 && line.row_idx == tgt - 1);
                    line.row_idx = tgt;
                    line.outstanding_consumers = line.num_consumers;
                    let held = line.outstanding_consumers;
                    self.network.blocks.get_mut(bh).outstanding_consumers += held;
                }
                self.network.blocks.get_mut(bh).num_available_dependencies = 0;
            }
            None => {
                let idx = self.network.lines.get(handle).collection_idx;
                debug_assert!(idx >= 0);
                let idx = idx as usize;
                let perform_ycc = self.network.use_ycc && idx < 3;
                if perform_ycc {
                    // All three component-transform rows advance together
                    for k in 0..3 {
                        let yl = self.network.codestream[k].line;
                        debug_assert_eq!(self.network.lines.get(yl).row_idx, tgt - 1);
                        if self.network.lines.get(yl).outstanding_consumers > 0 {
                            return false;
                        }
                    }
                    for k in 0..3 {
                        self.pull_codestream(k);
                    }
                    let (h0, h1, h2) = (
                        self.network.codestream[0].line,
                        self.network.codestream[1].line,
                        self.network.codestream[2].line,
                    );
                    let (l0, l1, l2) = self.network.lines.trio_mut(h0, h1, h2);
                    ycc_to_rgb_lines(l0, l1, l2);
                    for k in 0..3 {
                        let yl = self.network.codestream[k].line;
                        let line = self.network.lines.get_mut(yl);
                        let (rev, irrev) = (line.rev_offset, line.irrev_offset);
                        line.apply_offset(rev, irrev);
                        line.row_idx += 1;
                        line.outstanding_consumers = line.num_consumers;
                    }
                } else {
                    self.pull_codestream(idx);
                    let line = self.network.lines.get_mut(handle);
                    let (rev, irrev) = (line.rev_offset, line.irrev_offset);
                    line.apply_offset(rev, irrev);
                    line.row_idx += 1;
                    line.outstanding_consumers = line.num_consumers;
                }
            }
        }

        let line = self.network.lines.get_mut(handle);
        debug_assert!(line.row_idx == tgt && line.outstanding_consumers > 0);
        line.outstanding_consumers -= 1;
        if let Some(bh) = line.block {
            self.network.blocks.get_mut(bh).outstanding_consumers -= 1;
        }
        true
    }

    fn pull_codestream(&mut self, idx: usize) {
        let Self {
            network, engines, ..
        } = self;
        let handle = network.codestream[idx].line;
        let buf = network
            .lines
            .get_mut(handle)
            .buf
            .as_mut()
            .unwrap_or_else(|| unreachable!());
        engines[idx].pull_row(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DefaultAllocator, DependencySignal};
    use mct_core::CompressionMode;
    use mct_transform::{ComponentDescription, OutputDescription};

    struct CountingSource {
        next: i32,
    }

    impl RowSource for CountingSource {
        fn pull(&mut self, row: &mut LineBuf, _signal: &dyn DependencySignal) {
            row.fill_int(self.next);
            self.next += 1;
        }
    }

    struct ConstSource {
        value: i32,
    }

    impl RowSource for ConstSource {
        fn pull(&mut self, row: &mut LineBuf, _signal: &dyn DependencySignal) {
            row.fill_int(self.value);
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
    fn test_pass_through_rows_arrive_in_order() {
        let mut alloc = DefaultAllocator::new();
        let mut synthesis = MultiSynthesis::create(
            &plain_tile(1, 4, 3, false),
            &NetworkConfig::default(),
            vec![Box::new(CountingSource { next: 1 })],
            None,
            None,
            &mut alloc,
        )
        .unwrap();
        assert!(alloc.finalize() > 0);
        assert_eq!(synthesis.get_size(0), Coords::new(4, 3));
        assert!(synthesis.is_line_absolute(0));
        assert!(!synthesis.is_line_precise(0));

        for expected in 1i16..=3 {
            let row = synthesis.get_line(0).unwrap();
            assert_eq!(row.as_i16().unwrap(), &[expected; 4]);
        }
        assert!(synthesis.get_line(0).is_none());
        assert!(synthesis.engines[0].queue().is_done());
    }

    #[test]
    fn test_component_transform_rows_advance_as_a_triple() {
        let mut alloc = DefaultAllocator::new();
        let mut synthesis = MultiSynthesis::create(
            &plain_tile(3, 2, 2, true),
            &NetworkConfig::default(),
            vec![
                Box::new(ConstSource { value: 10 }),
                Box::new(ConstSource { value: 4 }),
                Box::new(ConstSource { value: -8 }),
            ],
            None,
            None,
            &mut alloc,
        )
        .unwrap();

        // y=10, cb=4, cr=-8: g = 10 - ((4-8)>>2) = 11, r = -8+11 = 3,
        // b = 4+11 = 15
        let row = synthesis.get_line(0).unwrap();
        assert_eq!(row.as_i16().unwrap(), &[3, 3]);

        // The second row of component 0 cannot advance until the two
        // chrominance consumers take their share of the first.
        assert!(synthesis.get_line(0).is_none());
        assert_eq!(synthesis.get_line(1).unwrap().as_i16().unwrap(), &[11, 11]);
        assert_eq!(synthesis.get_line(2).unwrap().as_i16().unwrap(), &[15, 15]);
        assert_eq!(synthesis.get_line(0).unwrap().as_i16().unwrap(), &[3, 3]);
    }

    #[test]
    fn test_source_count_mismatch_is_rejected() {
        let mut alloc = DefaultAllocator::new();
        let result = MultiSynthesis::create(
            &plain_tile(2, 4, 4, false),
            &NetworkConfig::default(),
            vec![Box::new(CountingSource { next: 0 })],
            None,
            None,
            &mut alloc,
        );
        assert!(matches!(result, Err(MctError::InvalidParameter(_))));
    }
}
