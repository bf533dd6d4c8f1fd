// eval/sampling.rs — nodes that evaluate their input in derived branches
//
//   Resample — input at another resolution, bilinearly resampled back
//   Normals  — height plus the +X/+Z neighbour tiles, for seamless normals
//   LodChain — input at halving resolutions, one branch per level
//
// Resample and Normals close the branches they open as soon as they have
// read from them. LodChain keeps its level branches open until the instance
// is reset, so downstream nodes may read the level buffers in place.

use crate::error::{EngineError, Result};
use crate::eval::branch::{close_branch, lock, BranchHandle, Pulled};
use crate::eval::graph::NodeDefinition;
use crate::eval::kernels;
use crate::eval::node::{NodeContext, NodeCore, NodeKind, NodeProcessor, NodeRegistry};
use crate::eval::nodes::BufferJob;
use crate::eval::ports::{PortData, PortSpec};
use crate::eval::value::{GridShape, PortValue, SharedBuffer};
use log::{debug, error, warn};
use rayon::prelude::*;
use std::sync::Arc;

pub(crate) fn register(registry: &mut NodeRegistry) {
    registry.register(Arc::new(ResampleKind));
    registry.register(Arc::new(NormalsKind));
    registry.register(Arc::new(LodChainKind));
}

const DEFERRED_IN: &[PortSpec] = &[PortSpec::deferred("Input")];
const VALUE_OUT: &[PortSpec] = &[PortSpec::single("Value")];
const HEIGHT_IN: &[PortSpec] = &[PortSpec::single("Height")];
const NORMAL_OUT: &[PortSpec] = &[PortSpec::single("Normal")];
const LEVELS_OUT: &[PortSpec] = &[PortSpec::list("Levels")];

fn close_all(branches: &mut Vec<BranchHandle>) {
    for branch in branches.drain(..) {
        if let Err(e) = close_branch(&branch) {
            error!("failed to close derived branch: {e}");
        }
    }
}

// ── Resample ────────────────────────────────────────────────────────

struct ResampleKind;

impl NodeKind for ResampleKind {
    fn type_name(&self) -> &'static str {
        "Resample"
    }

    fn inputs(&self) -> &'static [PortSpec] {
        DEFERRED_IN
    }

    fn outputs(&self) -> &'static [PortSpec] {
        VALUE_OUT
    }

    fn create(&self, _def: &NodeDefinition) -> Box<dyn NodeProcessor> {
        Box::new(ResampleNode::default())
    }
}

#[derive(Default)]
struct ResampleNode {
    source: Option<PortData>,
    branches: Vec<BranchHandle>,
    job: BufferJob,
}

impl NodeProcessor for ResampleNode {
    fn process(&mut self, core: &mut NodeCore, ctx: &mut NodeContext<'_>) -> Result<bool> {
        let guid = core.guid().clone();

        if core.sub_state == 0 {
            let resolution = core.definition().field_u32("Resolution", 16);
            if resolution == 0 {
                return Err(EngineError::invalid_field(&guid, "Resolution", "must be at least 1"));
            }
            let source = ctx
                .source_of(&guid, "Input")
                .ok_or_else(|| EngineError::missing_input(&guid, "Input"))?;
            let branch = ctx.derive_with_resolution(resolution, Some(vec![source.node.clone()]))?;
            self.branches.push(branch);
            self.source = Some(source);
            core.sub_state = 1;
        }

        if core.sub_state == 1 {
            let (Some(source), Some(branch)) = (&self.source, self.branches.first()) else {
                return Err(EngineError::missing_input(&guid, "Input"));
            };
            let pulled = lock(branch).pull(source)?;
            let value = match pulled {
                Pulled::Pending => return Ok(false),
                Pulled::Missing => {
                    close_all(&mut self.branches);
                    return Err(EngineError::missing_input(&guid, "Input"));
                }
                Pulled::Ready(value) => value,
            };
            close_all(&mut self.branches);
            match value {
                PortValue::Buffer(buffer) => {
                    let shape = ctx.grid_shape(buffer.shape().channels);
                    self.job
                        .start(ctx, shape, move |lease| kernels::resample(&buffer, lease))?;
                    core.sub_state = 2;
                }
                // resolution-independent
                other => {
                    core.set_output("Value", other);
                    return Ok(true);
                }
            }
        }

        match self.job.poll(ctx, "Resample")? {
            Some(buffer) => {
                core.set_output("Value", PortValue::Buffer(buffer));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn reset(&mut self) {
        close_all(&mut self.branches);
        self.source = None;
        self.job.reset();
    }
}

// ── Normals ─────────────────────────────────────────────────────────

struct NormalsKind;

impl NodeKind for NormalsKind {
    fn type_name(&self) -> &'static str {
        "Normals"
    }

    fn inputs(&self) -> &'static [PortSpec] {
        HEIGHT_IN
    }

    fn outputs(&self) -> &'static [PortSpec] {
        NORMAL_OUT
    }

    fn create(&self, _def: &NodeDefinition) -> Box<dyn NodeProcessor> {
        Box::new(NormalsNode::default())
    }
}

/// Branches `[east, north]` while their pulls are outstanding.
#[derive(Default)]
struct NormalsNode {
    source: Option<PortData>,
    neighbors: Vec<BranchHandle>,
    job: BufferJob,
}

impl NodeProcessor for NormalsNode {
    fn process(&mut self, core: &mut NodeCore, ctx: &mut NodeContext<'_>) -> Result<bool> {
        let guid = core.guid().clone();

        if core.sub_state == 0 {
            let source = ctx
                .source_of(&guid, "Height")
                .ok_or_else(|| EngineError::missing_input(&guid, "Height"))?;
            let terrain = ctx.terrain();
            for (dx, dz) in [(1, 0), (0, 1)] {
                let branch =
                    ctx.derive_with_terrain(terrain.neighbor(dx, dz), Some(vec![source.node.clone()]))?;
                self.neighbors.push(branch);
            }
            self.source = Some(source);
            core.sub_state = 1;
        }

        if core.sub_state == 1 {
            let Some(source) = &self.source else {
                return Err(EngineError::missing_input(&guid, "Height"));
            };
            let mut edges: Vec<Option<SharedBuffer>> = Vec::with_capacity(2);
            let mut ready = true;
            for branch in &self.neighbors {
                match lock(branch).pull(source)? {
                    Pulled::Pending => ready = false,
                    Pulled::Ready(value) => edges.push(value.as_buffer().cloned()),
                    Pulled::Missing => {
                        warn!("{guid}: neighbour tile produced no height, extrapolating");
                        edges.push(None);
                    }
                }
            }
            if !ready {
                return Ok(false);
            }
            close_all(&mut self.neighbors);

            let height = match core.input("Height") {
                Some(PortValue::Buffer(b)) => b.clone(),
                Some(PortValue::Float(_)) => {
                    // flat everywhere
                    let mut lease = ctx.request_buffer(ctx.grid_shape(3))?;
                    for cell in lease.data_mut().chunks_exact_mut(3) {
                        cell.copy_from_slice(&[0.0, 1.0, 0.0]);
                    }
                    let flat = ctx.publish_buffer(lease)?;
                    core.set_output("Normal", PortValue::Buffer(flat));
                    return Ok(true);
                }
                other => {
                    return Err(EngineError::invalid_field(
                        &guid,
                        "Height",
                        format!("expected a grid, got {}", other.map_or("nothing", PortValue::type_name)),
                    ))
                }
            };
            let step = ctx.terrain().tile_size / f64::from(ctx.mesh().resolution.max(1));
            let shape = GridShape {
                channels: 3,
                ..height.shape()
            };
            let (east, north) = (edges.first().cloned().flatten(), edges.get(1).cloned().flatten());
            self.job.start(ctx, shape, move |lease| {
                kernels::normals(&height, east.as_deref(), north.as_deref(), step, lease);
            })?;
            core.sub_state = 2;
        }

        match self.job.poll(ctx, "Normals")? {
            Some(buffer) => {
                core.set_output("Normal", PortValue::Buffer(buffer));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn reset(&mut self) {
        close_all(&mut self.neighbors);
        self.source = None;
        self.job.reset();
    }
}

// ── LOD chain ───────────────────────────────────────────────────────

struct LodChainKind;

impl NodeKind for LodChainKind {
    fn type_name(&self) -> &'static str {
        "LodChain"
    }

    fn inputs(&self) -> &'static [PortSpec] {
        DEFERRED_IN
    }

    fn outputs(&self) -> &'static [PortSpec] {
        LEVELS_OUT
    }

    fn create(&self, _def: &NodeDefinition) -> Box<dyn NodeProcessor> {
        Box::new(LodChainNode::default())
    }
}

/// Level `k` evaluates the input at `resolution >> k` (at least 1) and
/// `lod + k`. Levels are pulled in parallel.
#[derive(Default)]
struct LodChainNode {
    source: Option<PortData>,
    levels: Vec<BranchHandle>,
}

impl NodeProcessor for LodChainNode {
    fn process(&mut self, core: &mut NodeCore, ctx: &mut NodeContext<'_>) -> Result<bool> {
        let guid = core.guid().clone();

        if core.sub_state == 0 {
            let count = core.definition().field_u32("Levels", 3);
            if count == 0 {
                return Err(EngineError::invalid_field(&guid, "Levels", "must be at least 1"));
            }
            let source = ctx
                .source_of(&guid, "Input")
                .ok_or_else(|| EngineError::missing_input(&guid, "Input"))?;
            let (mesh, terrain) = (ctx.mesh(), ctx.terrain());
            for k in 0..count {
                let resolution = mesh.resolution.checked_shr(k).unwrap_or(0).max(1);
                let branch = ctx.derive_with(
                    mesh.with_resolution(resolution),
                    terrain.with_lod(terrain.lod + k),
                    Some(vec![source.node.clone()]),
                )?;
                self.levels.push(branch);
            }
            debug!("{guid}: opened {count} level branches");
            self.source = Some(source);
            core.sub_state = 1;
        }

        let Some(source) = &self.source else {
            return Err(EngineError::missing_input(&guid, "Input"));
        };
        let pulled: Vec<Result<Pulled>> = self
            .levels
            .par_iter()
            .map(|branch| lock(branch).pull(source))
            .collect();

        let mut values = Vec::with_capacity(pulled.len());
        let mut ready = true;
        for result in pulled {
            match result? {
                Pulled::Pending => ready = false,
                Pulled::Ready(value) => values.push(value),
                Pulled::Missing => return Err(EngineError::missing_input(&guid, "Input")),
            }
        }
        if !ready {
            return Ok(false);
        }
        for (k, value) in values.into_iter().enumerate() {
            core.set_list_output("Levels", Some(k as u32), value);
        }
        Ok(true)
    }

    fn reset(&mut self) {
        close_all(&mut self.levels);
        self.source = None;
    }
}
