// eval/nodes.rs — built-in generator and combinator nodes
//
// Constant, Position, CoordinateX/Z, Noise, Combine and Output. Anything
// that fills a grid does so in a job: the first `process` call leases a
// buffer and schedules the fill (sub_state 0 → 1), later calls poll the job
// until it finishes or the tree's token forces it.

use crate::error::{EngineError, Result};
use crate::eval::branch::Pulled;
use crate::eval::graph::{NodeDefinition, NodeGuid};
use crate::eval::jobs::JobHandle;
use crate::eval::kernels::{self, CombineOp, GridSampler, Permutation};
use crate::eval::node::{NodeContext, NodeCore, NodeKind, NodeProcessor, NodeRegistry};
use crate::eval::ports::{PortData, PortSpec};
use crate::eval::value::{Buffer, BufferLease, GridShape, PortValue, SharedBuffer};
use std::sync::Arc;

pub(crate) fn register(registry: &mut NodeRegistry) {
    registry.register(Arc::new(ConstantKind));
    registry.register(Arc::new(CoordinateKind::POSITION));
    registry.register(Arc::new(CoordinateKind::X));
    registry.register(Arc::new(CoordinateKind::Z));
    registry.register(Arc::new(NoiseKind));
    registry.register(Arc::new(CombineKind));
    registry.register(Arc::new(OutputKind));
}

/// Memo key under which a branch may hold a ready-made height map for an
/// `Output` node.
pub fn height_memo_key(guid: &NodeGuid) -> String {
    format!("height/{guid}")
}

const VALUE_OUT: &[PortSpec] = &[PortSpec::single("Value")];
const COMBINE_IN: &[PortSpec] = &[PortSpec::list("Inputs")];
const DEFERRED_IN: &[PortSpec] = &[PortSpec::deferred("Input")];
const HEIGHT_OUT: &[PortSpec] = &[PortSpec::single("Height")];

// ── Buffer jobs ─────────────────────────────────────────────────────

/// A grid fill running on the job substrate.
#[derive(Default)]
pub(crate) struct BufferJob {
    handle: Option<JobHandle<BufferLease>>,
}

impl BufferJob {
    pub fn start<F>(&mut self, ctx: &mut NodeContext<'_>, shape: GridShape, fill: F) -> Result<()>
    where
        F: FnOnce(&mut BufferLease) + Send + 'static,
    {
        let mut lease = ctx.request_buffer(shape)?;
        self.handle = Some(ctx.schedule(move || {
            fill(&mut lease);
            lease
        }));
        Ok(())
    }

    /// The published buffer once the job is done, `None` while it runs.
    pub fn poll(&mut self, ctx: &mut NodeContext<'_>, what: &str) -> Result<Option<SharedBuffer>> {
        let Some(handle) = &self.handle else {
            return Err(EngineError::JobFailed(format!("{what}: no job scheduled")));
        };
        if !ctx.forced_or_finished(handle) {
            return Ok(None);
        }
        let lease = handle.take_result(what)?;
        self.handle = None;
        ctx.publish_buffer(lease).map(Some)
    }

    pub fn reset(&mut self) {
        self.handle = None;
    }
}

/// Shared shape of the grid nodes: schedule once, then poll into `Value`.
fn run_grid_job<F>(
    job: &mut BufferJob,
    core: &mut NodeCore,
    ctx: &mut NodeContext<'_>,
    shape: GridShape,
    fill: F,
) -> Result<bool>
where
    F: FnOnce(&mut BufferLease) + Send + 'static,
{
    if core.sub_state == 0 {
        job.start(ctx, shape, fill)?;
        core.sub_state = 1;
    }
    let what = core.kind().type_name();
    match job.poll(ctx, what)? {
        Some(buffer) => {
            core.set_output("Value", PortValue::Buffer(buffer));
            Ok(true)
        }
        None => Ok(false),
    }
}

// ── Constant ────────────────────────────────────────────────────────

struct ConstantKind;

impl NodeKind for ConstantKind {
    fn type_name(&self) -> &'static str {
        "Constant"
    }

    fn inputs(&self) -> &'static [PortSpec] {
        &[]
    }

    fn outputs(&self) -> &'static [PortSpec] {
        VALUE_OUT
    }

    fn create(&self, _def: &NodeDefinition) -> Box<dyn NodeProcessor> {
        Box::new(ConstantNode)
    }
}

struct ConstantNode;

impl NodeProcessor for ConstantNode {
    fn process(&mut self, core: &mut NodeCore, _ctx: &mut NodeContext<'_>) -> Result<bool> {
        let value = core.definition().field_f64("Value", 0.0);
        core.set_output("Value", PortValue::Float(value));
        Ok(true)
    }
}

// ── Coordinates ─────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Axis {
    All,
    X,
    Z,
}

/// World coordinates of every sample of the branch's tile.
struct CoordinateKind {
    name: &'static str,
    axis: Axis,
}

impl CoordinateKind {
    const POSITION: CoordinateKind = CoordinateKind {
        name: "Position",
        axis: Axis::All,
    };
    const X: CoordinateKind = CoordinateKind {
        name: "CoordinateX",
        axis: Axis::X,
    };
    const Z: CoordinateKind = CoordinateKind {
        name: "CoordinateZ",
        axis: Axis::Z,
    };
}

impl NodeKind for CoordinateKind {
    fn type_name(&self) -> &'static str {
        self.name
    }

    fn inputs(&self) -> &'static [PortSpec] {
        &[]
    }

    fn outputs(&self) -> &'static [PortSpec] {
        VALUE_OUT
    }

    fn create(&self, _def: &NodeDefinition) -> Box<dyn NodeProcessor> {
        Box::new(CoordinateNode {
            axis: self.axis,
            job: BufferJob::default(),
        })
    }
}

struct CoordinateNode {
    axis: Axis,
    job: BufferJob,
}

impl NodeProcessor for CoordinateNode {
    fn process(&mut self, core: &mut NodeCore, ctx: &mut NodeContext<'_>) -> Result<bool> {
        let sampler = GridSampler::new(ctx.mesh(), &ctx.terrain());
        let axis = self.axis;
        let channels = if matches!(axis, Axis::All) { 3 } else { 1 };
        let shape = ctx.grid_shape(channels);
        run_grid_job(&mut self.job, core, ctx, shape, move |lease| {
            kernels::fill_grid(lease, &sampler, |x, z, cell| match axis {
                Axis::All => {
                    cell[0] = x as f32;
                    cell[1] = sampler.y as f32;
                    cell[2] = z as f32;
                }
                Axis::X => cell[0] = x as f32,
                Axis::Z => cell[0] = z as f32,
            });
        })
    }

    fn reset(&mut self) {
        self.job.reset();
    }
}

// ── Noise ───────────────────────────────────────────────────────────

struct NoiseKind;

impl NodeKind for NoiseKind {
    fn type_name(&self) -> &'static str {
        "Noise"
    }

    fn inputs(&self) -> &'static [PortSpec] {
        &[]
    }

    fn outputs(&self) -> &'static [PortSpec] {
        VALUE_OUT
    }

    fn create(&self, _def: &NodeDefinition) -> Box<dyn NodeProcessor> {
        Box::new(NoiseNode::default())
    }
}

#[derive(Default)]
struct NoiseNode {
    job: BufferJob,
}

impl NodeProcessor for NoiseNode {
    fn process(&mut self, core: &mut NodeCore, ctx: &mut NodeContext<'_>) -> Result<bool> {
        let def = core.definition().clone();
        let frequency = def.field_f64("Frequency", 0.01);
        let amplitude = def.field_f64("Amplitude", 1.0);
        let seed = def.field_i64("Seed", 0) as u64;
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(EngineError::invalid_field(
                def.guid(),
                "Frequency",
                format!("must be positive, got {frequency}"),
            ));
        }

        let sampler = GridSampler::new(ctx.mesh(), &ctx.terrain());
        let shape = ctx.grid_shape(1);
        run_grid_job(&mut self.job, core, ctx, shape, move |lease| {
            let perm = Permutation::new(seed);
            kernels::fill_grid(lease, &sampler, |x, z, cell| {
                cell[0] = (kernels::simplex_2d(&perm, x * frequency, z * frequency) * amplitude) as f32;
            });
        })
    }

    fn reset(&mut self) {
        self.job.reset();
    }
}

// ── Combine ─────────────────────────────────────────────────────────

struct CombineKind;

impl NodeKind for CombineKind {
    fn type_name(&self) -> &'static str {
        "Combine"
    }

    fn inputs(&self) -> &'static [PortSpec] {
        COMBINE_IN
    }

    fn outputs(&self) -> &'static [PortSpec] {
        VALUE_OUT
    }

    fn create(&self, _def: &NodeDefinition) -> Box<dyn NodeProcessor> {
        Box::new(CombineNode::default())
    }
}

#[derive(Default)]
struct CombineNode {
    job: BufferJob,
}

/// Grid values of one operand at `shape`: scalars broadcast, other grids
/// are resampled.
fn operand_values(item: &PortValue, shape: GridShape) -> Option<Vec<f32>> {
    match item {
        PortValue::Float(v) => Some(vec![*v as f32; shape.len()]),
        PortValue::Buffer(b) if b.shape() == shape => Some(b.data().to_vec()),
        PortValue::Buffer(b) => {
            let mut tmp = BufferLease::new(shape, vec![0.0; shape.len()]);
            kernels::resample(b, &mut tmp);
            Some(tmp.data().to_vec())
        }
        _ => None,
    }
}

impl NodeProcessor for CombineNode {
    fn process(&mut self, core: &mut NodeCore, ctx: &mut NodeContext<'_>) -> Result<bool> {
        if core.sub_state == 1 {
            return match self.job.poll(ctx, "Combine")? {
                Some(buffer) => {
                    core.set_output("Value", PortValue::Buffer(buffer));
                    Ok(true)
                }
                None => Ok(false),
            };
        }

        let def = core.definition().clone();
        let op_name = def.field_str("Operation", "Sum");
        let op = CombineOp::parse(op_name).ok_or_else(|| {
            EngineError::invalid_field(def.guid(), "Operation", format!("unknown operation '{op_name}'"))
        })?;
        let items: Vec<PortValue> = core
            .input("Inputs")
            .and_then(PortValue::as_list)
            .map(<[PortValue]>::to_vec)
            .unwrap_or_default();
        if let Some(bad) = items
            .iter()
            .find(|v| !matches!(v, PortValue::Float(_) | PortValue::Buffer(_)))
        {
            return Err(EngineError::invalid_field(
                def.guid(),
                "Inputs",
                format!("cannot combine a {}", bad.type_name()),
            ));
        }

        let target = items.iter().find_map(|v| v.as_buffer().map(|b| b.shape()));
        let Some(shape) = target else {
            // all scalar
            let mut values = items.iter().filter_map(PortValue::as_f64);
            let first = match op.identity() {
                Some(id) => id,
                None => values
                    .next()
                    .ok_or_else(|| EngineError::missing_input(def.guid(), "Inputs"))?,
            };
            let result = values.fold(first, |acc, v| op.apply(acc, v));
            core.set_output("Value", PortValue::Float(result));
            return Ok(true);
        };

        self.job.start(ctx, shape, move |lease| {
            let out = lease.data_mut();
            let mut operands = items.iter().filter_map(|item| operand_values(item, shape));
            match op.identity() {
                Some(id) => out.fill(id as f32),
                None => {
                    if let Some(first) = operands.next() {
                        out.copy_from_slice(&first);
                    }
                }
            }
            for values in operands {
                for (o, v) in out.iter_mut().zip(values) {
                    *o = op.apply(*o as f64, v as f64) as f32;
                }
            }
        })?;
        core.sub_state = 1;
        self.process(core, ctx)
    }

    fn reset(&mut self) {
        self.job.reset();
    }
}

// ── Output ──────────────────────────────────────────────────────────

struct OutputKind;

impl NodeKind for OutputKind {
    fn type_name(&self) -> &'static str {
        "Output"
    }

    fn inputs(&self) -> &'static [PortSpec] {
        DEFERRED_IN
    }

    fn outputs(&self) -> &'static [PortSpec] {
        HEIGHT_OUT
    }

    fn create(&self, _def: &NodeDefinition) -> Box<dyn NodeProcessor> {
        Box::new(OutputNode::default())
    }
}

/// Turns whatever reaches `Input` into a single-channel height map at the
/// branch's resolution. A height map already in the branch memo (seeded by
/// a cache) short-circuits the upstream pull.
#[derive(Default)]
struct OutputNode {
    source: Option<PortData>,
    job: BufferJob,
}

impl NodeProcessor for OutputNode {
    fn process(&mut self, core: &mut NodeCore, ctx: &mut NodeContext<'_>) -> Result<bool> {
        let guid = core.guid().clone();
        let shape = ctx.grid_shape(1);

        if core.sub_state == 0 {
            if let Some(cached) = ctx.memo()?.get::<Buffer>(&height_memo_key(&guid))? {
                core.set_output("Height", PortValue::Buffer(cached));
                return Ok(true);
            }
            let source = ctx
                .source_of(&guid, "Input")
                .ok_or_else(|| EngineError::missing_input(&guid, "Input"))?;
            self.source = Some(source);
            core.sub_state = 1;
        }

        if core.sub_state == 1 {
            let Some(source) = self.source.clone() else {
                return Err(EngineError::missing_input(&guid, "Input"));
            };
            let value = match ctx.pull(&source)? {
                Pulled::Pending => return Ok(false),
                Pulled::Missing => return Err(EngineError::missing_input(&guid, "Input")),
                Pulled::Ready(value) => value,
            };
            match value {
                PortValue::Float(v) => {
                    let mut lease = ctx.request_buffer(shape)?;
                    lease.data_mut().fill(v as f32);
                    let buffer = ctx.publish_buffer(lease)?;
                    core.set_output("Height", PortValue::Buffer(buffer));
                    return Ok(true);
                }
                PortValue::Buffer(buffer) if buffer.shape() == shape => {
                    core.set_output("Height", PortValue::Buffer(buffer));
                    return Ok(true);
                }
                PortValue::Buffer(buffer) => {
                    self.job
                        .start(ctx, shape, move |lease| kernels::resample(&buffer, lease))?;
                    core.sub_state = 2;
                }
                other => {
                    return Err(EngineError::invalid_field(
                        &guid,
                        "Input",
                        format!("expected a float or a grid, got a {}", other.type_name()),
                    ))
                }
            }
        }

        match self.job.poll(ctx, "Output")? {
            Some(buffer) => {
                core.set_output("Height", PortValue::Buffer(buffer));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn reset(&mut self) {
        self.source = None;
        self.job.reset();
    }
}
