//! Transform network construction
//!
//! Builds the per-tile transform graph from the declarative description:
//! codestream lines first, then one collection of lines per stage, each
//! populated by its blocks. Everything the description leaves implicit is
//! settled here before any sample is touched: reversibility, precision
//! and size knowledge is propagated to a fixed point, irreversible
//! coefficients are normalized against the final bit-depths, pass-through
//! copies are bypassed away, and (for compression) the network is checked
//! to be invertible end to end.

use mct_core::consts::{MAX_STRIPES, STRIPE_BYTES_TARGET};
use mct_core::{
    BlockHandle, Coords, LineHandle, MctError, MctResult,
};

use crate::block::{Block, BlockKind, Blocks, Lines};
use crate::dependency::DependencyBlock;
use crate::description::{
    BlockDescription, BlockKindDescription, TileDescription,
};
use crate::dwt::DwtBlock;
use crate::line::MultiLine;
use crate::matrix::MatrixBlock;
use crate::rxform::RxformBlock;

/// Construction-time options, mirroring the caller's processing
/// environment
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    /// Force the 32-bit representation everywhere
    pub force_precise: bool,
    /// Allow the 16-bit representation even for high-precision
    /// irreversible data
    pub fast: bool,
    /// Ignore the tile's component colour transform flag
    pub skip_ycc: bool,
    /// A job scheduler is available to the engine
    pub multi_threaded: bool,
    /// Split codestream components into multiple stripes so wavelet jobs
    /// can overlap with transform processing
    pub multi_threaded_dwt: bool,
    /// Explicit stripe height; chosen automatically when absent
    pub processing_stripe_height: Option<i32>,
}

/// Per codestream component bookkeeping shared with the stripe engine
#[derive(Debug, Clone)]
pub struct CodestreamComponent {
    /// Codestream component index
    pub comp_idx: usize,
    pub line: LineHandle,
    pub num_stripes: usize,
    pub max_stripe_rows: i32,
    pub total_rows: i32,
}

/// The fully constructed transform graph of one tile
#[derive(Debug)]
pub struct TransformNetwork {
    pub lines: Lines,
    pub blocks: Blocks,
    /// Blocks in declaration order, codestream side first
    pub block_order: Vec<BlockHandle>,
    pub codestream: Vec<CodestreamComponent>,
    /// Line collections; `[0]` is the codestream collection and the last
    /// one holds the final output components. Interior `None` entries are
    /// stage outputs no block produces.
    pub collections: Vec<Vec<Option<LineHandle>>>,
    pub use_ycc: bool,
}

impl TransformNetwork {
    pub fn construct(desc: &TileDescription, config: &NetworkConfig) -> MctResult<Self> {
        if desc.components.is_empty() {
            return Err(MctError::InvalidParameter(
                "tile description declares no codestream components".into(),
            ));
        }
        let use_ycc = desc.use_ycc && !config.skip_ycc;
        if use_ycc && desc.components.len() < 3 {
            return Err(MctError::InvalidConfiguration(
                "the component colour transform requires at least three codestream components"
                    .into(),
            ));
        }

        let mut net = Self {
            lines: Lines::new(),
            blocks: Blocks::new(),
            block_order: Vec::new(),
            codestream: Vec::new(),
            collections: Vec::new(),
            use_ycc,
        };

        // Codestream collection, together with the stripe geometry the
        // engine will use for each component
        let mut stripe_height = config.processing_stripe_height;
        let mut codestream_collection = Vec::with_capacity(desc.components.len());
        for (n, comp) in desc.components.iter().enumerate() {
            if comp.width < 0 || comp.height < 0 {
                return Err(MctError::InvalidDimensions {
                    width: comp.width,
                    height: comp.height,
                });
            }
            let reversible = comp.mode.is_reversible();
            let need_precise = if config.force_precise {
                true
            } else if comp.bit_depth <= 16 {
                false
            } else if reversible {
                true
            } else {
                !config.fast
            };
            let handle = net.lines.alloc(MultiLine {
                collection_idx: n as i32,
                reversible,
                need_irreversible: !reversible,
                need_precise,
                bit_depth: comp.bit_depth,
                size: Coords::new(comp.width, comp.height),
                ..Default::default()
            });
            codestream_collection.push(Some(handle));

            let height = match stripe_height {
                Some(h) => h,
                None => {
                    let h = if !config.multi_threaded {
                        1
                    } else {
                        let mut bytes = ((comp.width as usize) * desc.components.len()) << 1;
                        if need_precise {
                            bytes <<= 1;
                        }
                        // Start with 8 rows as a reasonable minimum
                        let mut log2_height = 3;
                        while log2_height < 5 && (bytes << log2_height) < STRIPE_BYTES_TARGET {
                            log2_height += 1;
                        }
                        1 << log2_height
                    };
                    stripe_height = Some(h);
                    h
                }
            };
            let (num_stripes, max_stripe_rows);
            if config.multi_threaded_dwt
                && config.multi_threaded
                && comp.width > 0
                && comp.height > 0
            {
                // Memory is assessed on the basis of double buffering
                let total_lines = 2 * height;
                let mut stripes = 2;
                if total_lines >= 48 {
                    stripes = 3;
                }
                if total_lines >= 30 * stripes {
                    stripes = total_lines / 30;
                }
                num_stripes = stripes.min(MAX_STRIPES) as usize;
                max_stripe_rows = 1 + (total_lines - 1) / num_stripes as i32;
            } else {
                num_stripes = 1;
                max_stripe_rows = height;
            }
            net.codestream.push(CodestreamComponent {
                comp_idx: comp.comp_idx,
                line: handle,
                num_stripes,
                max_stripe_rows,
                total_rows: comp.height,
            });
        }
        net.collections.push(codestream_collection);

        // Stage loop
        for stage in &desc.stages {
            let prev = net
                .collections
                .last()
                .unwrap_or_else(|| unreachable!())
                .clone();
            let mut out: Vec<Option<LineHandle>> = vec![None; stage.num_outputs];
            for bdesc in &stage.blocks {
                net.init_block(bdesc, &prev, &mut out)?;
            }
            net.collections.push(out);
        }

        // Final outputs: size and bit-depth come from the application's
        // view; unproduced entries become constant lines
        let num_outputs = net
            .collections
            .last()
            .unwrap_or_else(|| unreachable!())
            .len();
        if desc.outputs.len() != num_outputs {
            return Err(MctError::InvalidConfiguration(format!(
                "tile description declares {} output components but the final stage produces {}",
                desc.outputs.len(),
                num_outputs
            )));
        }
        let mut constant_output_lines = Vec::new();
        for n in 0..num_outputs {
            let out = &desc.outputs[n];
            if out.width <= 0 || out.height <= 0 {
                return Err(MctError::InvalidDimensions {
                    width: out.width,
                    height: out.height,
                });
            }
            let last = net.collections.len() - 1;
            let handle = match net.collections[last][n] {
                Some(h) => h,
                None => {
                    let h = net.lines.alloc(MultiLine {
                        need_precise: config.force_precise,
                        need_irreversible: true,
                        is_constant: true,
                        ..Default::default()
                    });
                    net.collections[last][n] = Some(h);
                    constant_output_lines.push(h);
                    h
                }
            };
            let line = net.lines.get_mut(handle);
            line.num_consumers += 1;
            line.size = Coords::new(out.width, out.height);
            line.bit_depth = out.bit_depth;
        }

        // Iterate until reversibility, precision and size knowledge is
        // stable throughout the graph
        while net.propagate_knowledge(config.force_precise, false)? {}

        // Normalize coefficients now that bit-depths are known: offsets
        // move to the normalized range and each block rescales itself
        for bh in net.block_order.clone() {
            for comp in self_components(&net.blocks, bh) {
                let line = net.lines.get_mut(comp);
                if line.bit_depth != 0 && line.irrev_offset != 0.0 {
                    line.irrev_offset *= 1.0 / (1i64 << line.bit_depth) as f32;
                }
            }
            let Self { blocks, lines, .. } = &mut net;
            blocks.get_mut(bh).normalize_coefficients(lines);
        }

        // Normalization may have widened `need_precise`; settle again, then
        // force constants nothing depends on into the reversible camp
        while net.propagate_knowledge(false, false)? {}
        while net.propagate_knowledge(false, true)? {}

        // Unsigned output components get a level offset so the network
        // always works with signed data
        let last = net.collections.len() - 1;
        for (n, out) in desc.outputs.iter().enumerate() {
            if out.signed {
                continue;
            }
            if let Some(handle) = net.collections[last][n] {
                let line = net.lines.get_mut(handle);
                line.rev_offset -= (1 << line.bit_depth) >> 1;
                line.irrev_offset -= 0.5;
            }
        }

        net.merge_constant_outputs(&constant_output_lines);
        net.install_bypasses();
        Ok(net)
    }

    fn init_block(
        &mut self,
        bdesc: &BlockDescription,
        prev: &[Option<LineHandle>],
        out: &mut [Option<LineHandle>],
    ) -> MctResult<()> {
        for &idx in &bdesc.input_indices {
            if idx >= prev.len() {
                return Err(MctError::InvalidConfiguration(format!(
                    "transform block input index {idx} exceeds the previous collection"
                )));
            }
        }
        for &idx in &bdesc.output_indices {
            if idx >= out.len() {
                return Err(MctError::InvalidConfiguration(format!(
                    "transform block output index {idx} exceeds the stage's output collection"
                )));
            }
        }
        match &bdesc.kind {
            BlockKindDescription::Null => self.init_null(bdesc, prev, out),
            BlockKindDescription::Matrix { coefficients } => {
                self.init_matrix(bdesc, coefficients, prev, out)
            }
            BlockKindDescription::ReversibleTransform { coefficients } => {
                self.init_rxform(bdesc, coefficients, prev, out)
            }
            BlockKindDescription::Dependency(coeffs) => {
                let block = DependencyBlock::from_description(coeffs, bdesc.input_indices.len())?;
                self.init_dependency(bdesc, block, prev, out)
            }
            BlockKindDescription::Dwt(dwt) => {
                let block = DwtBlock::from_description(dwt)?;
                self.init_dwt(bdesc, block, prev, out)
            }
        }
    }

    /// Pass-through block: output `n` mirrors input `n`; outputs past the
    /// inputs are constant. Constant inputs are folded away immediately.
    fn init_null(
        &mut self,
        bdesc: &BlockDescription,
        prev: &[Option<LineHandle>],
        out: &mut [Option<LineHandle>],
    ) -> MctResult<()> {
        let num_components = bdesc.output_indices.len();
        let num_dependencies = bdesc.input_indices.len().min(num_components);
        let bh = self.blocks.alloc(Block::new(BlockKind::Null));
        let mut components = Vec::with_capacity(num_components);
        let mut dependencies = Vec::with_capacity(num_dependencies);
        for n in 0..num_components {
            let mut line = MultiLine {
                block: Some(bh),
                ..Default::default()
            };
            let mut dep_slot = None;
            if n >= num_dependencies {
                line.is_constant = true;
            } else {
                let dep = prev[bdesc.input_indices[n]].ok_or_else(|| {
                    MctError::InvalidConfiguration(
                        "pass-through block consumes a component no block produces".into(),
                    )
                })?;
                let dep_line = self.lines.get_mut(dep);
                line.need_irreversible = dep_line.need_irreversible;
                line.reversible = dep_line.reversible;
                if dep_line.is_constant {
                    line.is_constant = true;
                    line.rev_offset = dep_line.rev_offset;
                    line.irrev_offset = dep_line.irrev_offset;
                } else {
                    dep_line.num_consumers += 1;
                    dep_slot = Some(dep);
                }
            }
            let (rev, irrev) = bdesc.offsets(n);
            line.rev_offset += rev;
            line.irrev_offset += irrev;
            let handle = self.lines.alloc(line);
            components.push(handle);
            if n < num_dependencies {
                dependencies.push(dep_slot);
            }
            out[bdesc.output_indices[n]] = Some(handle);
        }
        let block = self.blocks.get_mut(bh);
        block.components = components;
        block.dependencies = dependencies;
        self.block_order.push(bh);
        Ok(())
    }

    fn init_matrix(
        &mut self,
        bdesc: &BlockDescription,
        coefficients: &[f32],
        prev: &[Option<LineHandle>],
        out: &mut [Option<LineHandle>],
    ) -> MctResult<()> {
        let num_components = bdesc.output_indices.len();
        let num_dependencies = bdesc.input_indices.len();
        if coefficients.len() != num_components * num_dependencies {
            return Err(MctError::InvalidConfiguration(format!(
                "decorrelation matrix needs {} coefficients, found {}",
                num_components * num_dependencies,
                coefficients.len()
            )));
        }
        let matrix = MatrixBlock::new(coefficients.to_vec());
        let bh = self.blocks.alloc(Block::new(BlockKind::Matrix(matrix)));

        let mut dependencies = Vec::with_capacity(num_dependencies);
        for &idx in &bdesc.input_indices {
            let dep = prev[idx];
            if let Some(d) = dep {
                self.lines.get_mut(d).num_consumers += 1;
            }
            dependencies.push(dep);
        }
        let mut components = Vec::with_capacity(num_components);
        for n in 0..num_components {
            let (_, irrev) = bdesc.offsets(n);
            let handle = self.lines.alloc(MultiLine {
                block: Some(bh),
                need_irreversible: true,
                irrev_offset: irrev,
                ..Default::default()
            });
            components.push(handle);
            out[bdesc.output_indices[n]] = Some(handle);
        }

        // Pre-compute the impact of constant inputs
        for n in 0..num_dependencies {
            let dep = match dependencies[n] {
                Some(d) if self.lines.get(d).is_constant => d,
                _ => continue,
            };
            let offset = self.lines.get(dep).irrev_offset;
            if let BlockKind::Matrix(m) = &self.blocks.get(bh).kind {
                m.fold_constant_dependency(n, num_dependencies, offset, &components, &mut self.lines);
            }
            self.lines.get_mut(dep).num_consumers -= 1;
            dependencies[n] = None;
        }

        let block = self.blocks.get_mut(bh);
        block.components = components;
        block.dependencies = dependencies;
        self.block_order.push(bh);
        Ok(())
    }

    fn init_rxform(
        &mut self,
        bdesc: &BlockDescription,
        coefficients: &[i32],
        prev: &[Option<LineHandle>],
        out: &mut [Option<LineHandle>],
    ) -> MctResult<()> {
        let n_internal = bdesc.input_indices.len();
        if bdesc.output_indices.len() > n_internal {
            return Err(MctError::InvalidConfiguration(
                "reversible decorrelation block cannot produce more outputs than inputs".into(),
            ));
        }
        if coefficients.len() != n_internal * (n_internal + 1) {
            return Err(MctError::InvalidConfiguration(format!(
                "reversible decorrelation block needs {} coefficients, found {}",
                n_internal * (n_internal + 1),
                coefficients.len()
            )));
        }
        let rxform = RxformBlock::new(coefficients.to_vec());
        rxform.validate_divisors(n_internal)?;
        let need_precise = rxform.needs_precise();
        let bh = self
            .blocks
            .alloc(Block::new(BlockKind::ReversibleTransform(rxform)));

        let mut dependencies = Vec::with_capacity(n_internal);
        for &idx in &bdesc.input_indices {
            let dep = prev[idx];
            if let Some(d) = dep {
                let line = self.lines.get_mut(d);
                line.num_consumers += 1;
                line.reversible = true;
                if need_precise {
                    line.need_precise = true;
                }
            }
            dependencies.push(dep);
        }
        let mut components = Vec::with_capacity(n_internal);
        for _ in 0..n_internal {
            components.push(self.lines.alloc(MultiLine {
                block: Some(bh),
                reversible: true,
                need_precise,
                ..Default::default()
            }));
        }
        for (k, &out_idx) in bdesc.output_indices.iter().enumerate() {
            let internal = active_output(bdesc, k, n_internal)?;
            let handle = components[internal];
            let (rev, _) = bdesc.offsets(k);
            self.lines.get_mut(handle).rev_offset = rev;
            out[out_idx] = Some(handle);
        }

        let block = self.blocks.get_mut(bh);
        block.components = components;
        block.dependencies = dependencies;
        self.block_order.push(bh);
        Ok(())
    }

    fn init_dependency(
        &mut self,
        bdesc: &BlockDescription,
        mut dep_block: DependencyBlock,
        prev: &[Option<LineHandle>],
        out: &mut [Option<LineHandle>],
    ) -> MctResult<()> {
        let n_internal = bdesc.input_indices.len();
        if bdesc.output_indices.len() > n_internal {
            return Err(MctError::InvalidConfiguration(
                "dependency transform block cannot produce more outputs than inputs".into(),
            ));
        }
        // The declared offsets belong to the prediction itself, applied
        // before the transform rather than to its outputs
        dep_block.set_offsets(&bdesc.rev_offsets, &bdesc.irrev_offsets);
        let is_reversible = dep_block.is_reversible();
        let need_precise = dep_block.needs_precise();
        let bh = self
            .blocks
            .alloc(Block::new(BlockKind::Dependency(dep_block)));

        let mut dependencies = Vec::with_capacity(n_internal);
        for &idx in &bdesc.input_indices {
            let dep = prev[idx];
            if let Some(d) = dep {
                let line = self.lines.get_mut(d);
                line.num_consumers += 1;
                if is_reversible {
                    line.reversible = true;
                }
                if need_precise {
                    line.need_precise = true;
                }
            }
            dependencies.push(dep);
        }
        let mut components = Vec::with_capacity(n_internal);
        for _ in 0..n_internal {
            components.push(self.lines.alloc(MultiLine {
                block: Some(bh),
                reversible: is_reversible,
                need_irreversible: !is_reversible,
                need_precise,
                ..Default::default()
            }));
        }
        for (k, &out_idx) in bdesc.output_indices.iter().enumerate() {
            let internal = active_output(bdesc, k, n_internal)?;
            out[out_idx] = Some(components[internal]);
        }

        let block = self.blocks.get_mut(bh);
        block.components = components;
        block.dependencies = dependencies;
        self.block_order.push(bh);
        Ok(())
    }

    fn init_dwt(
        &mut self,
        bdesc: &BlockDescription,
        dwt: DwtBlock,
        prev: &[Option<LineHandle>],
        out: &mut [Option<LineHandle>],
    ) -> MctResult<()> {
        let is_reversible = dwt.is_reversible();
        let num_components = dwt.num_components();
        let num_dependencies = dwt.num_dependencies();
        let active_inputs = match &bdesc.kind {
            BlockKindDescription::Dwt(d) => &d.active_inputs,
            _ => unreachable!(),
        };
        let active_outputs = match &bdesc.kind {
            BlockKindDescription::Dwt(d) => &d.active_outputs,
            _ => unreachable!(),
        };
        if active_inputs.len() != bdesc.input_indices.len()
            || active_outputs.len() != bdesc.output_indices.len()
        {
            return Err(MctError::InvalidConfiguration(
                "wavelet block subband position lists must match its input and output lists"
                    .into(),
            ));
        }
        let bh = self.blocks.alloc(Block::new(BlockKind::Dwt(dwt)));

        let mut components = Vec::with_capacity(num_components);
        for _ in 0..num_components {
            components.push(self.lines.alloc(MultiLine {
                block: Some(bh),
                reversible: is_reversible,
                need_irreversible: !is_reversible,
                ..Default::default()
            }));
        }
        let mut dependencies: Vec<Option<LineHandle>> = vec![None; num_dependencies];
        let dwt_ref = match &self.blocks.get(bh).kind {
            BlockKind::Dwt(d) => d,
            _ => unreachable!(),
        };
        let mut slot_of_input = Vec::with_capacity(active_inputs.len());
        let mut comp_of_output = Vec::with_capacity(active_outputs.len());
        for &subband in active_inputs {
            slot_of_input.push(dwt_ref.input_dependency_slot(subband)?);
        }
        for &position in active_outputs {
            comp_of_output.push(dwt_ref.output_component_index(position)?);
        }
        for (k, slot) in slot_of_input.into_iter().enumerate() {
            let slot = match slot {
                Some(s) => s,
                None => continue, // Not needed for the requested outputs
            };
            let dep = prev[bdesc.input_indices[k]];
            if let Some(d) = dep {
                let line = self.lines.get_mut(d);
                line.num_consumers += 1;
                if is_reversible {
                    line.reversible = true;
                }
            }
            dependencies[slot] = dep;
        }
        for (k, comp_idx) in comp_of_output.into_iter().enumerate() {
            let handle = components[comp_idx];
            let (rev, irrev) = bdesc.offsets(k);
            let line = self.lines.get_mut(handle);
            line.rev_offset = rev;
            line.irrev_offset = irrev;
            out[bdesc.output_indices[k]] = Some(handle);
        }

        let block = self.blocks.get_mut(bh);
        block.components = components;
        block.dependencies = dependencies;
        self.block_order.push(bh);
        Ok(())
    }

    /// One sweep of reversibility/precision/size unification; returns true
    /// if anything changed, so callers loop to a fixed point.
    fn propagate_knowledge(
        &mut self,
        force_precise: bool,
        force_hanging_constants_to_reversible: bool,
    ) -> MctResult<bool> {
        let Self {
            lines,
            blocks,
            block_order,
            collections,
            use_ycc,
            ..
        } = self;
        let mut any_change = false;

        if *use_ycc {
            // The colour transform binds the first three codestream
            // components together
            let ycc: Vec<LineHandle> = collections[0][..3]
                .iter()
                .map(|h| h.unwrap_or_else(|| unreachable!()))
                .collect();
            let mut reversible = false;
            let mut irreversible = false;
            let mut precise = force_precise;
            for &h in &ycc {
                let line = lines.get(h);
                reversible |= line.reversible;
                irreversible |= line.need_irreversible;
                precise |= line.need_precise;
            }
            let size0 = lines.get(ycc[0]).size;
            for &h in &ycc {
                let line = lines.get_mut(h);
                line.reversible = reversible;
                line.need_irreversible = irreversible;
                line.need_precise = precise;
                if line.size != size0 {
                    return Err(size_inconsistency());
                }
            }
        }

        for &bh in block_order.iter() {
            let is_null = blocks.get(bh).is_null_transform();
            if is_null {
                let block = blocks.get(bh);
                let components = block.components.clone();
                let dependencies = block.dependencies.clone();
                for (n, &comp) in components.iter().enumerate() {
                    if force_precise {
                        lines.get_mut(comp).need_precise = true;
                    }
                    if !lines.get(comp).is_constant {
                        let dep = dependencies[n].unwrap_or_else(|| unreachable!());
                        let (dep_line, line) = lines.pair_mut(dep, comp);
                        if dep_line.need_precise != line.need_precise {
                            any_change = true;
                            line.need_precise = true;
                            dep_line.need_precise = true;
                        }
                        if dep_line.need_irreversible != line.need_irreversible {
                            any_change = true;
                            line.need_irreversible = true;
                            dep_line.need_irreversible = true;
                        }
                        if dep_line.reversible != line.reversible {
                            any_change = true;
                            line.reversible = true;
                            dep_line.reversible = true;
                        }
                        if dep_line.size != line.size {
                            any_change = true;
                            if dep_line.size.is_unknown() {
                                dep_line.size = line.size;
                            } else if line.size.is_unknown() {
                                line.size = dep_line.size;
                            } else {
                                return Err(size_inconsistency());
                            }
                        }
                        if dep_line.bit_depth != line.bit_depth {
                            any_change = true;
                            if dep_line.bit_depth == 0 {
                                dep_line.bit_depth = line.bit_depth;
                            } else if line.bit_depth == 0 {
                                line.bit_depth = dep_line.bit_depth;
                            } else {
                                return Err(MctError::InvalidConfiguration(
                                    "a codestream component and the output component it passes \
                                     through to declare different bit-depths"
                                        .into(),
                                ));
                            }
                        }
                    } else if force_hanging_constants_to_reversible {
                        let line = lines.get_mut(comp);
                        if !line.need_irreversible && !line.reversible {
                            line.reversible = true;
                            any_change = true;
                        }
                    }
                }
            } else {
                // Everything a regular block touches must agree on
                // precision and size
                let block = blocks.get(bh);
                let components = block.components.clone();
                let dependencies = block.dependencies.clone();
                let mut needs_precise = force_precise;
                let mut size = Coords::default();
                let mut have_size = false;
                let mut unknown_input_depth = false;
                let mut unknown_output_depth = false;
                for dep in dependencies.iter().flatten() {
                    let line = lines.get(*dep);
                    needs_precise |= line.need_precise;
                    if !have_size && line.size != size {
                        size = line.size;
                        have_size = true;
                    }
                    if line.bit_depth == 0 {
                        unknown_input_depth = true;
                    }
                }
                for &comp in &components {
                    let line = lines.get(comp);
                    needs_precise |= line.need_precise;
                    if !have_size && line.size != size {
                        size = line.size;
                        have_size = true;
                    }
                    if line.bit_depth == 0 {
                        unknown_output_depth = true;
                    }
                }
                for handle in dependencies
                    .iter()
                    .flatten()
                    .copied()
                    .chain(components.iter().copied())
                {
                    let line = lines.get_mut(handle);
                    if line.need_precise != needs_precise {
                        any_change = true;
                        line.need_precise = true;
                    }
                    if line.size != size {
                        any_change = true;
                        if line.size.is_unknown() {
                            line.size = size;
                        } else {
                            return Err(size_inconsistency());
                        }
                    }
                }
                if blocks
                    .get_mut(bh)
                    .propagate_bit_depths(lines, unknown_input_depth, unknown_output_depth)
                {
                    any_change = true;
                }
            }
        }
        Ok(any_change)
    }

    /// Collapse duplicate constant output lines onto their first
    /// occurrence
    fn merge_constant_outputs(&mut self, constant_lines: &[LineHandle]) {
        if constant_lines.len() < 2 {
            return;
        }
        let last = self.collections.len() - 1;
        for n in 0..self.collections[last].len() {
            let handle = match self.collections[last][n] {
                Some(h) => h,
                None => continue,
            };
            let pos = match constant_lines.iter().position(|&c| c == handle) {
                Some(p) if p > 0 => p,
                _ => continue,
            };
            debug_assert!(self.lines.get(handle).is_constant);
            for &candidate in &constant_lines[..pos] {
                let (cand, line) = self.lines.pair_mut(candidate, handle);
                if cand.size.x == line.size.x && cand.irrev_offset == line.irrev_offset {
                    cand.num_consumers += line.num_consumers;
                    line.num_consumers = 0;
                    self.collections[last][n] = Some(candidate);
                    break;
                }
            }
        }
    }

    /// Alias pass-through outputs directly onto their inputs wherever the
    /// copy can be elided without offset or bit-depth conflicts
    fn install_bypasses(&mut self) {
        for bi in 0..self.block_order.len() {
            let bh = self.block_order[bi];
            let num_deps = self.blocks.get(bh).dependencies.len();
            for i in 0..num_deps {
                let mut dep = self.blocks.get(bh).dependencies[i];
                while let Some(d) = dep {
                    match self.lines.get(d).bypass {
                        Some(b) => dep = Some(b),
                        None => break,
                    }
                }
                self.blocks.get_mut(bh).dependencies[i] = dep;
            }
            if !self.blocks.get(bh).is_null_transform() {
                continue;
            }
            let components = self.blocks.get(bh).components.clone();
            for (n, &tgt) in components.iter().enumerate() {
                if self.lines.get(tgt).is_constant {
                    continue;
                }
                let src = match self.blocks.get(bh).dependencies[n] {
                    Some(s) => s,
                    None => continue,
                };
                let (src_line, tgt_line) = self.lines.pair_mut(src, tgt);
                debug_assert!(src_line.bypass.is_none());
                debug_assert_eq!(src_line.reversible, tgt_line.reversible);
                let have_offset = if tgt_line.reversible {
                    tgt_line.rev_offset != 0
                } else {
                    tgt_line.irrev_offset != 0.0
                };
                if have_offset && src_line.num_consumers > 1 {
                    continue; // Bypassing could cause offset conflicts
                }
                if !src_line.reversible && src_line.bit_depth != tgt_line.bit_depth {
                    continue; // Bypassing would change the nominal range
                }
                tgt_line.bypass = Some(src);
                src_line.rev_offset += tgt_line.rev_offset;
                src_line.irrev_offset += tgt_line.irrev_offset;
                src_line.num_consumers += tgt_line.num_consumers - 1;
            }
        }
        for ci in 1..self.collections.len() {
            for i in 0..self.collections[ci].len() {
                let mut entry = self.collections[ci][i];
                while let Some(h) = entry {
                    match self.lines.get(h).bypass {
                        Some(b) => entry = Some(b),
                        None => break,
                    }
                }
                self.collections[ci][i] = entry;
            }
        }
    }

    /// Allocate row buffers and check reversibility consistency across the
    /// whole network
    pub fn create_resources(&mut self) -> MctResult<()> {
        let mut consistent = true;
        for comp in &self.codestream {
            let line = self.lines.get(comp.line);
            if line.reversible != !line.need_irreversible {
                consistent = false;
            }
        }
        for &bh in &self.block_order {
            for comp in self_components(&self.blocks, bh) {
                let line = self.lines.get(comp);
                if line.reversible != !line.need_irreversible {
                    consistent = false;
                }
            }
        }
        let last = self.collections.len() - 1;
        for entry in self.collections[last].iter().flatten() {
            let line = self.lines.get(*entry);
            if line.reversible != !line.need_irreversible {
                consistent = false;
            }
        }
        if !consistent {
            return Err(MctError::ReversibilityConflict(
                "one or more transform steps require image samples to be treated as reversible \
                 where other steps require the same samples to be treated as irreversible"
                    .into(),
            ));
        }

        for comp in self.codestream.clone() {
            self.lines.get_mut(comp.line).allocate();
        }
        for bh in self.block_order.clone() {
            for comp in self_components(&self.blocks, bh) {
                let line = self.lines.get_mut(comp);
                if line.bypass.is_none() && line.buf.is_none() {
                    line.allocate();
                    if line.is_constant {
                        let (rev, irrev) = (line.rev_offset, line.irrev_offset);
                        line.reset(rev, irrev);
                    }
                }
            }
        }
        for n in 0..self.collections[last].len() {
            let handle = match self.collections[last][n] {
                Some(h) => h,
                None => continue,
            };
            let line = self.lines.get_mut(handle);
            if line.bypass.is_none()
                && line.block.is_none()
                && line.collection_idx < 0
                && line.buf.is_none()
            {
                debug_assert!(line.is_constant);
                line.allocate();
                let (rev, irrev) = (line.rev_offset, line.irrev_offset);
                line.reset(rev, irrev);
            }
        }
        Ok(())
    }

    /// Compression-side check that the synthesis network can be run
    /// backwards: every block must be invertible (or shed its unconsumed
    /// outputs) and every codestream line must end up with a consumer.
    pub fn prepare_for_inversion(&mut self) -> MctResult<()> {
        let mut failure_explanation: Option<&'static str> = None;
        for &bh in self.block_order.iter().rev() {
            if self.blocks.get(bh).is_null_transform() {
                let num_deps = self.blocks.get(bh).dependencies.len();
                for n in 0..num_deps {
                    let comp = self.blocks.get(bh).components[n];
                    let dep = self.blocks.get(bh).dependencies[n];
                    if let Some(d) = dep {
                        if self.lines.get(comp).num_consumers == 0 {
                            self.lines.get_mut(d).num_consumers -= 1;
                            self.blocks.get_mut(bh).dependencies[n] = None;
                        }
                    }
                }
            } else {
                let Self { blocks, lines, .. } = self;
                if let Err(explanation) = blocks.get_mut(bh).prepare_for_inversion(lines) {
                    failure_explanation = Some(explanation);
                    // Downstream blocks no longer need to write to this
                    // block's outputs
                    let components = self.blocks.get(bh).components.clone();
                    for comp in components {
                        self.lines.get_mut(comp).is_constant = true;
                    }
                    let num_deps = self.blocks.get(bh).dependencies.len();
                    for n in 0..num_deps {
                        if let Some(d) = self.blocks.get(bh).dependencies[n] {
                            self.lines.get_mut(d).num_consumers -= 1;
                            self.blocks.get_mut(bh).dependencies[n] = None;
                        }
                    }
                }
            }
        }

        // Forward sweep removing dependencies that became constant
        for &bh in &self.block_order {
            let num_deps = self.blocks.get(bh).dependencies.len();
            for n in 0..num_deps {
                let dep = match self.blocks.get(bh).dependencies[n] {
                    Some(d) => d,
                    None => continue,
                };
                if !self.lines.get(dep).is_constant {
                    continue;
                }
                self.blocks.get_mut(bh).dependencies[n] = None;
                self.lines.get_mut(dep).num_consumers -= 1;
                if self.blocks.get(bh).is_null_transform() {
                    let comp = self.blocks.get(bh).components[n];
                    self.lines.get_mut(comp).is_constant = true;
                }
            }
        }

        for comp in &self.codestream {
            if self.lines.get(comp.line).num_consumers <= 0 {
                let mut message = String::from(
                    "cannot perform the forward multi-component transform from the supplied \
                     source components: the transform is defined from the decompression \
                     perspective, and no invertible path leads back from the output \
                     components to every codestream component",
                );
                if let Some(explanation) = failure_explanation {
                    message.push_str(" ---- ");
                    message.push_str(explanation);
                }
                return Err(MctError::InversionFailure(message));
            }
        }

        // Every output row is supplied exactly once by the application, so
        // strip surplus consumers
        let last = self.collections.len() - 1;
        for n in 0..self.collections[last].len() {
            let handle = match self.collections[last][n] {
                Some(h) => h,
                None => continue,
            };
            for &bh in self.block_order.iter().rev() {
                if self.lines.get(handle).num_consumers <= 1 {
                    break;
                }
                let num_deps = self.blocks.get(bh).dependencies.len();
                for k in 0..num_deps {
                    if self.blocks.get(bh).dependencies[k] == Some(handle) {
                        self.blocks.get_mut(bh).dependencies[k] = None;
                        self.lines.get_mut(handle).num_consumers -= 1;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Final output lines, in component order
    pub fn output_lines(&self) -> Vec<LineHandle> {
        self.collections
            .last()
            .unwrap_or_else(|| unreachable!())
            .iter()
            .map(|h| h.unwrap_or_else(|| unreachable!()))
            .collect()
    }
}

fn self_components(blocks: &Blocks, bh: BlockHandle) -> Vec<LineHandle> {
    blocks.get(bh).components.clone()
}

fn active_output(bdesc: &BlockDescription, k: usize, n_internal: usize) -> MctResult<usize> {
    let internal = if bdesc.active_outputs.is_empty() {
        k
    } else {
        bdesc.active_outputs[k]
    };
    if internal >= n_internal {
        return Err(MctError::InvalidConfiguration(format!(
            "transform block exports internal component {internal} but only {n_internal} exist"
        )));
    }
    Ok(internal)
}

fn size_inconsistency() -> MctError {
    MctError::InvalidConfiguration(
        "image components processed by a common transform block have incompatible dimensions"
            .into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{
        ComponentDescription, OutputDescription, StageDescription,
    };
    use mct_core::CompressionMode;

    fn component(width: i32, height: i32, bit_depth: i32, mode: CompressionMode) -> ComponentDescription {
        ComponentDescription {
            comp_idx: 0,
            width,
            height,
            bit_depth,
            mode,
        }
    }

    fn output(width: i32, height: i32, bit_depth: i32, signed: bool) -> OutputDescription {
        OutputDescription {
            width,
            height,
            bit_depth,
            signed,
        }
    }

    fn null_block(inputs: Vec<usize>, outputs: Vec<usize>) -> BlockDescription {
        BlockDescription {
            input_indices: inputs,
            output_indices: outputs,
            rev_offsets: Vec::new(),
            irrev_offsets: Vec::new(),
            active_outputs: Vec::new(),
            kind: BlockKindDescription::Null,
        }
    }

    #[test]
    fn test_identity_stage_is_bypassed() {
        let desc = TileDescription {
            components: vec![component(8, 8, 8, CompressionMode::Reversible)],
            outputs: vec![output(8, 8, 8, true)],
            stages: vec![StageDescription {
                num_outputs: 1,
                blocks: vec![null_block(vec![0], vec![0])],
            }],
            use_ycc: false,
        };
        let net = TransformNetwork::construct(&desc, &NetworkConfig::default()).unwrap();
        // The output entry collapses straight onto the codestream line.
        assert_eq!(net.output_lines()[0], net.codestream[0].line);
        assert_eq!(net.lines.get(net.codestream[0].line).num_consumers, 1);
    }

    #[test]
    fn test_bypass_blocked_by_offset_conflict() {
        // Both outputs read the same codestream component and the unsigned
        // outputs carry level offsets, so aliasing would apply the offset
        // to both consumers at once.
        let desc = TileDescription {
            components: vec![component(4, 4, 8, CompressionMode::Reversible)],
            outputs: vec![output(4, 4, 8, false), output(4, 4, 8, false)],
            stages: vec![StageDescription {
                num_outputs: 2,
                blocks: vec![null_block(vec![0, 0], vec![0, 1])],
            }],
            use_ycc: false,
        };
        let net = TransformNetwork::construct(&desc, &NetworkConfig::default()).unwrap();
        let outs = net.output_lines();
        assert_ne!(outs[0], net.codestream[0].line);
        assert_ne!(outs[1], net.codestream[0].line);
        assert_eq!(net.lines.get(outs[0]).rev_offset, -128);
    }

    #[test]
    fn test_unproduced_outputs_become_merged_constants() {
        let desc = TileDescription {
            components: vec![component(4, 4, 8, CompressionMode::Reversible)],
            outputs: vec![
                output(4, 4, 8, true),
                output(4, 4, 8, true),
                output(4, 4, 8, true),
            ],
            stages: vec![StageDescription {
                num_outputs: 3,
                blocks: vec![null_block(vec![0], vec![0])],
            }],
            use_ycc: false,
        };
        let net = TransformNetwork::construct(&desc, &NetworkConfig::default()).unwrap();
        let outs = net.output_lines();
        assert!(net.lines.get(outs[1]).is_constant);
        assert_eq!(outs[1], outs[2]);
    }

    #[test]
    fn test_non_power_of_two_divisor_is_a_configuration_error() {
        let make = |divisor: i32| TileDescription {
            components: vec![
                component(4, 4, 8, CompressionMode::Reversible),
                component(4, 4, 8, CompressionMode::Reversible),
            ],
            outputs: vec![output(4, 4, 8, true), output(4, 4, 8, true)],
            stages: vec![StageDescription {
                num_outputs: 2,
                blocks: vec![BlockDescription {
                    input_indices: vec![0, 1],
                    output_indices: vec![0, 1],
                    rev_offsets: Vec::new(),
                    irrev_offsets: Vec::new(),
                    active_outputs: Vec::new(),
                    kind: BlockKindDescription::ReversibleTransform {
                        coefficients: vec![1, 2, 4, divisor, 1, 2],
                    },
                }],
            }],
            use_ycc: false,
        };
        assert!(TransformNetwork::construct(&make(4), &NetworkConfig::default()).is_ok());
        let err = TransformNetwork::construct(&make(3), &NetworkConfig::default()).unwrap_err();
        assert!(matches!(err, MctError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_reversibility_conflict_detected() {
        // An irreversible codestream component feeding a reversible
        // decorrelation block acquires both requirements at once.
        let desc = TileDescription {
            components: vec![
                component(4, 4, 8, CompressionMode::Irreversible),
                component(4, 4, 8, CompressionMode::Reversible),
            ],
            outputs: vec![output(4, 4, 8, true), output(4, 4, 8, true)],
            stages: vec![StageDescription {
                num_outputs: 2,
                blocks: vec![BlockDescription {
                    input_indices: vec![0, 1],
                    output_indices: vec![0, 1],
                    rev_offsets: Vec::new(),
                    irrev_offsets: Vec::new(),
                    active_outputs: Vec::new(),
                    kind: BlockKindDescription::ReversibleTransform {
                        coefficients: vec![1, 2, 4, 2, 1, 2],
                    },
                }],
            }],
            use_ycc: false,
        };
        let mut net = TransformNetwork::construct(&desc, &NetworkConfig::default()).unwrap();
        let err = net.create_resources().unwrap_err();
        assert!(matches!(err, MctError::ReversibilityConflict(_)));
    }

    #[test]
    fn test_inversion_fails_without_paths_to_codestream() {
        // A 2-in, 2-out matrix of which only one output is consumed is
        // underdetermined, leaving both codestream components unreachable.
        let desc = TileDescription {
            components: vec![
                component(4, 4, 8, CompressionMode::Irreversible),
                component(4, 4, 8, CompressionMode::Irreversible),
            ],
            outputs: vec![output(4, 4, 8, true)],
            stages: vec![StageDescription {
                num_outputs: 1,
                blocks: vec![BlockDescription {
                    input_indices: vec![0, 1],
                    output_indices: vec![0],
                    rev_offsets: Vec::new(),
                    irrev_offsets: Vec::new(),
                    active_outputs: Vec::new(),
                    kind: BlockKindDescription::Matrix {
                        coefficients: vec![1.0, 0.0],
                    },
                }],
            }],
            use_ycc: false,
        };
        let mut net = TransformNetwork::construct(&desc, &NetworkConfig::default()).unwrap();
        net.create_resources().unwrap();
        let err = net.prepare_for_inversion().unwrap_err();
        match err {
            MctError::InversionFailure(message) => {
                assert!(message.contains("underdetermined"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_stripe_heuristics_multi_threaded() {
        let desc = TileDescription {
            components: vec![component(256, 200, 8, CompressionMode::Reversible)],
            outputs: vec![output(256, 200, 8, true)],
            stages: Vec::new(),
            use_ycc: false,
        };
        let config = NetworkConfig {
            multi_threaded: true,
            multi_threaded_dwt: true,
            ..Default::default()
        };
        let net = TransformNetwork::construct(&desc, &config).unwrap();
        let comp = &net.codestream[0];
        // row bytes = 256*1*2 = 512; 512 << 5 < 400000 so height = 32;
        // total = 64 rows >= 48 -> 3 stripes, 64 >= 30*... no; 64/30 no.
        assert_eq!(comp.num_stripes, 3);
        assert_eq!(comp.max_stripe_rows, 1 + (64 - 1) / 3);
    }

    #[test]
    fn test_single_threaded_uses_one_stripe() {
        let desc = TileDescription {
            components: vec![component(16, 16, 8, CompressionMode::Reversible)],
            outputs: vec![output(16, 16, 8, true)],
            stages: Vec::new(),
            use_ycc: false,
        };
        let net = TransformNetwork::construct(&desc, &NetworkConfig::default()).unwrap();
        assert_eq!(net.codestream[0].num_stripes, 1);
        assert_eq!(net.codestream[0].max_stripe_rows, 1);
    }
}
