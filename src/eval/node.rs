// eval/node.rs — node kinds, pooled instances and the per-node state machine
//
// A `NodeKind` describes one operation (ports, how to build its processor,
// optional amplification). A `NodeInstance` is the mutable, pooled copy a
// branch evaluates: shared `NodeCore` bookkeeping plus the kind's own
// `NodeProcessor` state.
//
// Evaluation is a resumable state machine:
//
//   Idle → SettingInputValues → Processing → Done
//
// `step` returns `Ok(true)` only once the instance is `Done`. Returning
// `Ok(false)` leaves every finished sub-step in place, so the next call
// resumes where this one stopped. `sub_state` is the processor's own resume
// point inside `Processing`.

use crate::error::{EngineError, Result};
use crate::eval::amplify::AmplifyScope;
use crate::eval::branch::{Branch, BranchHandle, MeshSettings, Pulled, TerrainConfig};
use crate::eval::graph::{NodeDefinition, NodeGuid};
use crate::eval::jobs::{schedule, JobHandle};
use crate::eval::ports::{PortData, PortSpec, Resolve};
use crate::eval::store::KeyedStore;
use crate::eval::value::{BufferLease, GridShape, PortValue, SharedBuffer};
use crate::eval::{macros, nodes, sampling};
use log::{trace, warn};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    SettingInputValues,
    Processing,
    Done,
}

// ── Kinds ───────────────────────────────────────────────────────────

pub trait NodeKind: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn inputs(&self) -> &'static [PortSpec];

    /// The first output is the default source of an edge without a handle.
    fn outputs(&self) -> &'static [PortSpec];

    fn create(&self, def: &NodeDefinition) -> Box<dyn NodeProcessor>;

    /// Kinds that rewrite the graph around themselves before evaluation.
    fn is_amplifier(&self) -> bool {
        false
    }

    fn amplify(&self, _def: &NodeDefinition, _scope: &mut AmplifyScope<'_>) -> Result<()> {
        Ok(())
    }
}

pub trait NodeProcessor: Send {
    /// Run (or resume) the node's own work. Inputs declared `Eager` are
    /// already in `core`. Return `Ok(false)` to yield.
    fn process(&mut self, core: &mut NodeCore, ctx: &mut NodeContext<'_>) -> Result<bool>;

    /// Drop per-evaluation state. Branches the processor derived and kept
    /// open are closed here.
    fn reset(&mut self) {}
}

// ── Core ────────────────────────────────────────────────────────────

pub struct NodeCore {
    definition: Arc<NodeDefinition>,
    kind: Arc<dyn NodeKind>,
    pub state: NodeState,
    pub sub_state: u32,
    inputs: SmallVec<[(Arc<str>, PortValue); 4]>,
    outputs: SmallVec<[(Arc<str>, Option<u32>, PortValue); 2]>,
}

impl NodeCore {
    fn new(definition: Arc<NodeDefinition>, kind: Arc<dyn NodeKind>) -> Self {
        NodeCore {
            definition,
            kind,
            state: NodeState::Idle,
            sub_state: 0,
            inputs: SmallVec::new(),
            outputs: SmallVec::new(),
        }
    }

    pub fn definition(&self) -> &Arc<NodeDefinition> {
        &self.definition
    }

    pub fn guid(&self) -> &NodeGuid {
        self.definition.guid()
    }

    pub fn kind(&self) -> &Arc<dyn NodeKind> {
        &self.kind
    }

    pub fn input(&self, name: &str) -> Option<&PortValue> {
        self.inputs
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, v)| v)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.input(name).is_some()
    }

    pub fn set_input(&mut self, name: &str, value: PortValue) {
        match self.inputs.iter_mut().find(|(n, _)| &**n == name) {
            Some(slot) => slot.1 = value,
            None => self.inputs.push((name.into(), value)),
        }
    }

    pub fn output(&self, name: &str, list_index: Option<u32>) -> Option<&PortValue> {
        self.outputs
            .iter()
            .find(|(n, i, _)| &**n == name && *i == list_index)
            .map(|(_, _, v)| v)
    }

    pub fn set_output(&mut self, name: &str, value: PortValue) {
        self.set_list_output(name, None, value);
    }

    pub fn set_list_output(&mut self, name: &str, list_index: Option<u32>, value: PortValue) {
        match self
            .outputs
            .iter_mut()
            .find(|(n, i, _)| &**n == name && *i == list_index)
        {
            Some(slot) => slot.2 = value,
            None => self.outputs.push((name.into(), list_index, value)),
        }
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn clear_outputs(&mut self) {
        self.outputs.clear();
    }

    fn reset(&mut self) {
        self.state = NodeState::Idle;
        self.sub_state = 0;
        self.inputs.clear();
        self.outputs.clear();
    }
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCore")
            .field("guid", self.guid())
            .field("kind", &self.kind.type_name())
            .field("state", &self.state)
            .field("sub_state", &self.sub_state)
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

// ── Instance ────────────────────────────────────────────────────────

pub struct NodeInstance {
    core: NodeCore,
    processor: Box<dyn NodeProcessor>,
}

impl fmt::Debug for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.core.fmt(f)
    }
}

impl NodeInstance {
    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    pub fn state(&self) -> NodeState {
        self.core.state
    }

    /// Back to `Idle`/0 with no inputs, outputs or processor state.
    pub fn reset_state(&mut self) {
        self.processor.reset();
        self.core.reset();
    }

    /// Point a pooled instance at the definition it is handed out for. The
    /// processor is rebuilt when the definition itself changed.
    pub(crate) fn rebind(&mut self, definition: Arc<NodeDefinition>) {
        if !Arc::ptr_eq(&self.core.definition, &definition) {
            self.processor = self.core.kind.create(&definition);
            self.core.definition = definition;
        }
    }

    /// Give up on this evaluation: `Done` with no outputs.
    pub(crate) fn degrade(&mut self) {
        self.processor.reset();
        self.core.clear_outputs();
        self.core.state = NodeState::Done;
    }

    /// Drive the state machine as far as it goes without waiting.
    pub(crate) fn step(&mut self, branch: &mut Branch) -> Result<bool> {
        loop {
            match self.core.state {
                NodeState::Idle => {
                    self.core.state = NodeState::SettingInputValues;
                }
                NodeState::SettingInputValues => {
                    if !resolve_inputs(&mut self.core, branch)? {
                        return Ok(false);
                    }
                    self.core.state = NodeState::Processing;
                    self.core.sub_state = 0;
                }
                NodeState::Processing => {
                    let mut ctx = NodeContext { branch: &mut *branch };
                    if !self.processor.process(&mut self.core, &mut ctx)? {
                        return Ok(false);
                    }
                    self.core.state = NodeState::Done;
                }
                NodeState::Done => return Ok(true),
            }
            trace!("{} → {:?}", self.core.guid(), self.core.state);
        }
    }
}

/// Pull every eager input through `branch`. All upstream nodes are advanced
/// on every call, even after one of them yielded.
fn resolve_inputs(core: &mut NodeCore, branch: &mut Branch) -> Result<bool> {
    let graph = branch.graph().clone();
    let guid = core.guid().clone();
    let kind = core.kind.clone();
    let mut all_ready = true;

    for spec in kind.inputs().iter().filter(|s| s.resolve == Resolve::Eager) {
        let edges = graph.sources_for_field(&guid, spec.name);
        if edges.is_empty() {
            if spec.required {
                return Err(EngineError::missing_input(&guid, spec.name));
            }
            continue;
        }

        let mut pulled = Vec::with_capacity(edges.len());
        for edge in &edges {
            match branch.pull(&edge.output)? {
                Pulled::Pending => all_ready = false,
                Pulled::Ready(value) => pulled.push(value),
                Pulled::Missing => {
                    if spec.required && !spec.list {
                        return Err(EngineError::missing_input(&guid, spec.name));
                    }
                    warn!("{guid}.{}: {} produced no value", spec.name, edge.output);
                }
            }
        }
        if !all_ready {
            continue;
        }

        if spec.list {
            core.set_input(spec.name, PortValue::List(pulled));
        } else if let Some(value) = pulled.into_iter().next() {
            core.set_input(spec.name, value);
        }
    }
    Ok(all_ready)
}

// ── Context ─────────────────────────────────────────────────────────

/// What a processor may touch while it runs: its own branch, plus the
/// tree-wide state that branch shares.
pub struct NodeContext<'a> {
    pub(crate) branch: &'a mut Branch,
}

impl<'a> NodeContext<'a> {
    pub fn branch(&mut self) -> &mut Branch {
        self.branch
    }

    pub fn mesh(&self) -> MeshSettings {
        self.branch.mesh()
    }

    pub fn terrain(&self) -> TerrainConfig {
        self.branch.terrain()
    }

    /// Height-map shape for this branch's resolution.
    pub fn grid_shape(&self, channels: u8) -> GridShape {
        GridShape::for_resolution(self.branch.mesh().resolution, channels)
    }

    pub fn global_store(&self) -> &Arc<KeyedStore> {
        self.branch.global_store()
    }

    pub fn memo(&self) -> Result<&KeyedStore> {
        self.branch.memo()
    }

    pub fn schedule<T, F>(&self, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        schedule(self.branch.engine().jobs().as_ref(), f)
    }

    pub fn forced_or_finished<T: Send + 'static>(&self, job: &JobHandle<T>) -> bool {
        self.branch.token().forced_or_finished(job)
    }

    pub fn request_buffer(&mut self, shape: GridShape) -> Result<BufferLease> {
        self.branch.request_buffer(shape)
    }

    pub fn publish_buffer(&mut self, lease: BufferLease) -> Result<SharedBuffer> {
        self.branch.publish_buffer(lease)
    }

    /// The output port feeding scalar input `field` of `node`.
    pub fn source_of(&self, node: &NodeGuid, field: &str) -> Option<PortData> {
        self.branch
            .graph()
            .source_of(&PortData::new(node.clone(), field))
            .cloned()
    }

    pub fn pull(&mut self, output: &PortData) -> Result<Pulled> {
        self.branch.pull(output)
    }

    pub fn derive_with_resolution(
        &mut self,
        resolution: u32,
        starting_nodes: Option<Vec<NodeGuid>>,
    ) -> Result<BranchHandle> {
        self.branch.derive_with_resolution(resolution, starting_nodes)
    }

    pub fn derive_with_terrain(
        &mut self,
        terrain: TerrainConfig,
        starting_nodes: Option<Vec<NodeGuid>>,
    ) -> Result<BranchHandle> {
        self.branch.derive_with_terrain(terrain, starting_nodes)
    }

    pub fn derive_with(
        &mut self,
        mesh: MeshSettings,
        terrain: TerrainConfig,
        starting_nodes: Option<Vec<NodeGuid>>,
    ) -> Result<BranchHandle> {
        self.branch.derive_with(mesh, terrain, starting_nodes)
    }
}

// ── Registry ────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct NodeRegistry {
    kinds: FxHashMap<&'static str, Arc<dyn NodeKind>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every kind shipped by the crate.
    pub fn with_builtin_kinds() -> Self {
        let mut registry = NodeRegistry::new();
        nodes::register(&mut registry);
        sampling::register(&mut registry);
        macros::register(&mut registry);
        registry
    }

    /// Add a kind. A kind with the same name is replaced.
    pub fn register(&mut self, kind: Arc<dyn NodeKind>) {
        self.kinds.insert(kind.type_name(), kind);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn NodeKind>> {
        self.kinds
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNodeKind(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    pub fn kind_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.kinds.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// A fresh, idle instance of `def`.
    pub fn instantiate(&self, def: Arc<NodeDefinition>) -> Result<NodeInstance> {
        let kind = self.get(def.kind())?;
        let processor = kind.create(&def);
        Ok(NodeInstance {
            core: NodeCore::new(def, kind),
            processor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_instance(kind: &str) -> NodeInstance {
        let registry = NodeRegistry::with_builtin_kinds();
        let def = NodeDefinition::new("n", kind).with_field("Value", json!(3.0));
        registry.instantiate(Arc::new(def)).unwrap()
    }

    #[test]
    fn builtin_kinds_are_registered() {
        let registry = NodeRegistry::with_builtin_kinds();
        for name in [
            "Constant",
            "Position",
            "CoordinateX",
            "CoordinateZ",
            "Noise",
            "Combine",
            "Output",
            "Resample",
            "Normals",
            "LodChain",
            "Octaves",
            "Subgraph",
        ] {
            assert!(registry.contains(name), "{name} missing");
        }
    }

    #[test]
    fn unknown_kind_is_not_fatal() {
        let registry = NodeRegistry::with_builtin_kinds();
        let err = registry
            .instantiate(Arc::new(NodeDefinition::new("x", "Nope")))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::UnknownNodeKind(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn outputs_are_keyed_by_name_and_index() {
        let mut instance = make_instance("Constant");
        let core = instance.core_mut();
        core.set_list_output("Levels", Some(0), PortValue::Float(1.0));
        core.set_list_output("Levels", Some(1), PortValue::Float(2.0));
        core.set_output("Value", PortValue::Float(3.0));
        core.set_output("Value", PortValue::Float(4.0));

        assert_eq!(core.output_count(), 3);
        assert_eq!(core.output("Levels", Some(1)).and_then(PortValue::as_f64), Some(2.0));
        assert_eq!(core.output("Value", None).and_then(PortValue::as_f64), Some(4.0));
        assert!(core.output("Levels", None).is_none());
    }

    #[test]
    fn reset_state_returns_to_idle() {
        let mut instance = make_instance("Constant");
        instance.core_mut().state = NodeState::Processing;
        instance.core_mut().sub_state = 2;
        instance.core_mut().set_input("Input", PortValue::Float(1.0));
        instance.core_mut().set_output("Value", PortValue::Float(1.0));

        instance.reset_state();
        assert_eq!(instance.state(), NodeState::Idle);
        assert_eq!(instance.core().sub_state, 0);
        assert!(!instance.core().has_input("Input"));
        assert_eq!(instance.core().output_count(), 0);
    }

    #[test]
    fn degrade_finishes_without_outputs() {
        let mut instance = make_instance("Constant");
        instance.core_mut().set_output("Value", PortValue::Float(1.0));
        instance.degrade();
        assert_eq!(instance.state(), NodeState::Done);
        assert_eq!(instance.core().output_count(), 0);
    }

    #[test]
    fn rebind_to_new_definition_swaps_fields() {
        let registry = NodeRegistry::with_builtin_kinds();
        let first = Arc::new(NodeDefinition::new("c", "Constant").with_field("Value", json!(1.0)));
        let second = Arc::new(NodeDefinition::new("c", "Constant").with_field("Value", json!(2.0)));
        let mut instance = registry.instantiate(first).unwrap();
        instance.rebind(second.clone());
        assert!(Arc::ptr_eq(instance.core().definition(), &second));
    }
}
