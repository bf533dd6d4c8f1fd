// eval/branch.rs — one evaluation context of a tree
//
// A branch evaluates the tree's graph for one set of parameters: mesh
// resolution plus terrain placement. It lazily creates one writable node
// instance per definition, owns the buffers those nodes publish, and keeps a
// memo table for per-branch lookups.
//
// Branches are cheap: the bulky storage (instance map, buffer list, memo,
// visiting set) comes from an engine pool and goes back on close. Deriving a
// branch at another resolution or tile shares the tree's graph, global store
// and completion token with its parent but nothing else.

use crate::error::{EngineError, Result};
use crate::eval::engine::Engine;
use crate::eval::graph::{Graph, NodeGuid};
use crate::eval::node::{NodeInstance, NodeState};
use crate::eval::pool::Poolable;
use crate::eval::ports::PortData;
use crate::eval::store::KeyedStore;
use crate::eval::token::CompletionToken;
use crate::eval::tree::TreeShared;
use crate::eval::value::{BufferLease, FromPortValue, GridShape, PortValue, SharedBuffer};
use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type SharedNode = Arc<Mutex<NodeInstance>>;
pub type BranchHandle = Arc<Mutex<Branch>>;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Parameters ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshSettings {
    /// Cells per tile edge; grids carry `resolution + 1` samples per edge.
    pub resolution: u32,
}

impl MeshSettings {
    pub fn new(resolution: u32) -> Self {
        MeshSettings { resolution }
    }

    pub fn with_resolution(self, resolution: u32) -> Self {
        MeshSettings { resolution }
    }
}

impl Default for MeshSettings {
    fn default() -> Self {
        MeshSettings { resolution: 32 }
    }
}

/// Where in the world a branch samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerrainConfig {
    pub world_offset: [f64; 3],
    pub tile: [i32; 2],
    pub tile_size: f64,
    pub up: [f32; 3],
    pub lod: u32,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        TerrainConfig {
            world_offset: [0.0; 3],
            tile: [0, 0],
            tile_size: 64.0,
            up: [0.0, 1.0, 0.0],
            lod: 0,
        }
    }
}

impl TerrainConfig {
    pub fn at_offset(self, x: f64, y: f64, z: f64) -> Self {
        TerrainConfig {
            world_offset: [x, y, z],
            ..self
        }
    }

    pub fn with_tile_size(self, tile_size: f64) -> Self {
        TerrainConfig { tile_size, ..self }
    }

    pub fn with_lod(self, lod: u32) -> Self {
        TerrainConfig { lod, ..self }
    }

    /// The tile `dx`, `dz` steps away.
    pub fn neighbor(self, dx: i32, dz: i32) -> Self {
        TerrainConfig {
            tile: [self.tile[0] + dx, self.tile[1] + dz],
            ..self
        }
    }

    /// World X/Z of the tile's first sample.
    pub fn origin_xz(&self) -> [f64; 2] {
        [
            self.world_offset[0] + self.tile[0] as f64 * self.tile_size,
            self.world_offset[2] + self.tile[1] as f64 * self.tile_size,
        ]
    }
}

/// Result of pulling an output port.
#[derive(Debug, Clone)]
pub enum Pulled {
    /// The producer yielded; pull again later.
    Pending,
    Ready(PortValue),
    /// The producer finished without a value on that port.
    Missing,
}

// ── Storage ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct BranchStorage {
    nodes: FxHashMap<NodeGuid, SharedNode>,
    requested: Vec<SharedBuffer>,
    memo: KeyedStore,
    visiting: FxHashSet<NodeGuid>,
}

impl Poolable for BranchStorage {
    fn reset(&mut self) {
        self.nodes.clear();
        self.requested.clear();
        self.memo.clear();
        self.visiting.clear();
    }
}

// ── Branch ──────────────────────────────────────────────────────────

pub struct Branch {
    shared: Arc<TreeShared>,
    index: usize,
    parent: Option<usize>,
    mesh: MeshSettings,
    terrain: TerrainConfig,
    starting_nodes: Arc<[NodeGuid]>,
    /// `None` once closed.
    storage: Option<BranchStorage>,
}

impl Branch {
    /// A branch with pooled storage. Not yet registered with the tree and no
    /// initializer has run.
    pub(crate) fn open(
        shared: Arc<TreeShared>,
        parent: Option<usize>,
        mesh: MeshSettings,
        terrain: TerrainConfig,
        starting_nodes: Arc<[NodeGuid]>,
    ) -> Branch {
        let index = shared.next_branch_index();
        let storage = shared.engine.branch_pool().take();
        debug!(
            "branch {index} opened (parent {parent:?}, res {}, tile {:?}, lod {})",
            mesh.resolution, terrain.tile, terrain.lod
        );
        Branch {
            shared,
            index,
            parent,
            mesh,
            terrain,
            starting_nodes,
            storage: Some(storage),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn is_trunk(&self) -> bool {
        self.parent.is_none()
    }

    pub fn mesh(&self) -> MeshSettings {
        self.mesh
    }

    pub fn terrain(&self) -> TerrainConfig {
        self.terrain
    }

    pub fn starting_nodes(&self) -> &[NodeGuid] {
        &self.starting_nodes
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.shared.graph
    }

    pub fn engine(&self) -> &Engine {
        &self.shared.engine
    }

    pub fn global_store(&self) -> &Arc<KeyedStore> {
        &self.shared.store
    }

    pub fn token(&self) -> &Arc<CompletionToken> {
        &self.shared.token
    }

    pub fn is_closed(&self) -> bool {
        self.storage.is_none()
    }

    fn storage(&self) -> Result<&BranchStorage> {
        self.storage
            .as_ref()
            .ok_or(EngineError::BranchClosed(self.index))
    }

    fn storage_mut(&mut self) -> Result<&mut BranchStorage> {
        self.storage
            .as_mut()
            .ok_or(EngineError::BranchClosed(self.index))
    }

    /// Per-branch memo table.
    pub fn memo(&self) -> Result<&KeyedStore> {
        Ok(&self.storage()?.memo)
    }

    /// Number of node instances this branch has created so far.
    pub fn instance_count(&self) -> usize {
        self.storage.as_ref().map_or(0, |s| s.nodes.len())
    }

    // ── Nodes ───────────────────────────────────────────────────────

    /// The branch's writable instance of `guid`, created from the node pool
    /// on first request. Repeated calls return the same instance.
    pub fn get_writeable_node(&mut self, guid: &NodeGuid) -> Result<SharedNode> {
        if let Some(node) = self.storage()?.nodes.get(guid) {
            return Ok(node.clone());
        }
        let def = self
            .shared
            .graph
            .node(guid)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNode(guid.to_string()))?;
        let engine = self.shared.engine.clone();
        let instance = engine.node_pool().take(&def, engine.registry())?;
        let node = Arc::new(Mutex::new(instance));
        self.storage_mut()?.nodes.insert(guid.clone(), node.clone());
        Ok(node)
    }

    /// Advance `guid` in this branch. `Ok(true)` once it is `Done`.
    ///
    /// Non-fatal errors stop at the node: it is logged and finishes with no
    /// outputs. A node reached again while it is being resolved reports a
    /// cycle to its consumer instead of being locked twice.
    pub fn process_node(&mut self, guid: &NodeGuid) -> Result<bool> {
        if !self.storage_mut()?.visiting.insert(guid.clone()) {
            return Err(EngineError::Cycle(guid.to_string()));
        }
        let result = self.process_visiting(guid);
        if let Some(storage) = self.storage.as_mut() {
            storage.visiting.remove(guid);
        }
        result
    }

    fn process_visiting(&mut self, guid: &NodeGuid) -> Result<bool> {
        let node = self.get_writeable_node(guid)?;
        let mut instance = lock(&node);
        match instance.step(self) {
            Ok(done) => Ok(done),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(
                    "branch {}: node {guid} ({}) degraded: {e}",
                    self.index,
                    instance.core().kind().type_name()
                );
                instance.degrade();
                Ok(true)
            }
        }
    }

    /// Process every starting node. All of them are advanced on each call.
    pub fn process_branch(&mut self) -> Result<bool> {
        let starting = self.starting_nodes.clone();
        let mut done = true;
        for guid in starting.iter() {
            match self.process_node(guid) {
                Ok(finished) => done &= finished,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("branch {}: starting node {guid} skipped: {e}", self.index),
            }
        }
        Ok(done)
    }

    /// Process the producer of `output` and read the port.
    pub fn pull(&mut self, output: &PortData) -> Result<Pulled> {
        if !self.process_node(&output.node)? {
            return Ok(Pulled::Pending);
        }
        let node = self.get_writeable_node(&output.node)?;
        let instance = lock(&node);
        Ok(match instance.core().output(&output.field, output.list_index) {
            Some(value) => Pulled::Ready(value.clone()),
            None => Pulled::Missing,
        })
    }

    /// A finished node's output, converted to `T`. `None` if the node has
    /// not been created here, is not `Done`, or has no such value.
    pub fn try_get_output<T: FromPortValue>(
        &self,
        guid: &NodeGuid,
        field: &str,
        list_index: Option<u32>,
    ) -> Option<T> {
        let node = self.storage.as_ref()?.nodes.get(guid)?.clone();
        let instance = lock(&node);
        if instance.state() != NodeState::Done {
            return None;
        }
        instance
            .core()
            .output(field, list_index)
            .and_then(T::from_port_value)
    }

    // ── Buffers ─────────────────────────────────────────────────────

    pub fn request_buffer(&mut self, shape: GridShape) -> Result<BufferLease> {
        self.storage()?;
        Ok(self.shared.engine.buffer_pool().lease(shape))
    }

    /// Freeze a filled lease and keep it alive until the branch closes.
    pub fn publish_buffer(&mut self, lease: BufferLease) -> Result<SharedBuffer> {
        let buffer = Arc::new(lease.freeze()?);
        self.storage_mut()?.requested.push(buffer.clone());
        Ok(buffer)
    }

    // ── Derivation ──────────────────────────────────────────────────

    /// Open a branch of the same tree with other parameters. `None` for
    /// `starting_nodes` keeps this branch's. The new branch is registered
    /// with the tree; its creator is expected to close it.
    pub fn derive_with(
        &mut self,
        mesh: MeshSettings,
        terrain: TerrainConfig,
        starting_nodes: Option<Vec<NodeGuid>>,
    ) -> Result<BranchHandle> {
        self.storage()?;
        self.shared.ensure_open()?;
        let starting = match starting_nodes {
            Some(nodes) => nodes.into(),
            None => self.starting_nodes.clone(),
        };
        let mut branch = Branch::open(self.shared.clone(), Some(self.index), mesh, terrain, starting);
        let extensions = self.shared.extensions.clone();
        for init in extensions.initializers() {
            if let Err(e) = init.initialize_branch(&mut branch, Some(&*self)) {
                if let Err(close) = branch.close() {
                    warn!("closing branch {} after a failed initializer: {close}", branch.index());
                }
                return Err(e);
            }
        }
        let handle = Arc::new(Mutex::new(branch));
        self.shared.register(handle.clone());
        Ok(handle)
    }

    pub fn derive_with_resolution(
        &mut self,
        resolution: u32,
        starting_nodes: Option<Vec<NodeGuid>>,
    ) -> Result<BranchHandle> {
        let mesh = self.mesh.with_resolution(resolution);
        self.derive_with(mesh, self.terrain, starting_nodes)
    }

    pub fn derive_with_terrain(
        &mut self,
        terrain: TerrainConfig,
        starting_nodes: Option<Vec<NodeGuid>>,
    ) -> Result<BranchHandle> {
        self.derive_with(self.mesh, terrain, starting_nodes)
    }

    // ── Close ───────────────────────────────────────────────────────

    /// Release everything the branch holds. Close hooks run first and still
    /// see finished outputs. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.storage.is_none() {
            return Ok(());
        }
        let extensions = self.shared.extensions.clone();
        for hook in extensions.closers() {
            hook.close_branch(&*self);
        }

        let Some(mut storage) = self.storage.take() else {
            return Ok(());
        };
        let engine = &self.shared.engine;

        let mut returned = 0usize;
        for (guid, node) in storage.nodes.drain() {
            match Arc::try_unwrap(node) {
                Ok(mutex) => {
                    let instance = mutex.into_inner().unwrap_or_else(PoisonError::into_inner);
                    engine.node_pool().give(instance);
                    returned += 1;
                }
                Err(_) => warn!(
                    "branch {}: instance of {guid} still shared at close; not pooled",
                    self.index
                ),
            }
        }

        let mut recycled = 0usize;
        for buffer in storage.requested.drain(..) {
            if engine.buffer_pool().recycle(buffer) {
                recycled += 1;
            }
        }

        engine.branch_pool().give(storage);
        debug!(
            "branch {} closed ({returned} instances pooled, {recycled} buffers recycled)",
            self.index
        );
        Ok(())
    }
}

/// Close a branch behind its handle.
pub fn close_branch(handle: &BranchHandle) -> Result<()> {
    lock(handle).close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::eval::graph::NodeDefinition;
    use crate::eval::jobs::InlineJobs;
    use crate::eval::node::NodeRegistry;
    use crate::eval::ports::PortData;
    use crate::eval::tree::{Tree, TreeRequest};
    use serde_json::json;

    fn engine() -> Engine {
        Engine::with_parts(
            EngineConfig::default(),
            NodeRegistry::with_builtin_kinds(),
            Arc::new(InlineJobs),
        )
    }

    fn constant_graph() -> Arc<Graph> {
        let mut graph = Graph::new();
        graph
            .add_node(NodeDefinition::new("c", "Constant").with_field("Value", json!(5.0)))
            .unwrap();
        graph.add_node(NodeDefinition::new("o", "Output")).unwrap();
        graph
            .connect(
                PortData::new("c".into(), "Value"),
                PortData::new("o".into(), "Input"),
            )
            .unwrap();
        Arc::new(graph)
    }

    fn tree(engine: &Engine, resolution: u32) -> Tree {
        engine
            .new_tree(TreeRequest::new(constant_graph()).with_resolution(resolution))
            .unwrap()
    }

    #[test]
    fn writeable_node_is_memoized_per_branch() {
        let engine = engine();
        let tree = tree(&engine, 4);
        let trunk = tree.trunk();
        let mut trunk = lock(&trunk);
        let a = trunk.get_writeable_node(&"c".into()).unwrap();
        let b = trunk.get_writeable_node(&"c".into()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let derived = trunk.derive_with_resolution(8, None).unwrap();
        let c = lock(&derived).get_writeable_node(&"c".into()).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn unknown_node_is_reported() {
        let engine = engine();
        let tree = tree(&engine, 4);
        let trunk = tree.trunk();
        let err = lock(&trunk)
            .get_writeable_node(&"missing".into())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownNode(_)));
    }

    #[test]
    fn pull_reads_finished_output() {
        let engine = engine();
        let tree = tree(&engine, 4);
        let trunk = tree.trunk();
        let mut trunk = lock(&trunk);
        match trunk.pull(&PortData::new("c".into(), "Value")).unwrap() {
            Pulled::Ready(PortValue::Float(v)) => assert_eq!(v, 5.0),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            trunk.pull(&PortData::new("c".into(), "Nope")).unwrap(),
            Pulled::Missing
        ));
    }

    #[test]
    fn derived_branch_keeps_parent_and_parameters() {
        let engine = engine();
        let tree = tree(&engine, 4);
        let trunk = tree.trunk();
        let mut trunk = lock(&trunk);
        let terrain = trunk.terrain().neighbor(1, 0);
        let derived = trunk.derive_with_terrain(terrain, None).unwrap();
        let derived = lock(&derived);
        assert_eq!(derived.parent(), Some(trunk.index()));
        assert_eq!(derived.terrain().tile, [1, 0]);
        assert_eq!(derived.mesh(), trunk.mesh());
        assert_eq!(derived.starting_nodes(), trunk.starting_nodes());
        assert!(derived.index() > trunk.index());
    }

    #[test]
    fn use_after_close_is_fatal() {
        let engine = engine();
        let tree = tree(&engine, 4);
        let trunk = tree.trunk();
        let mut trunk = lock(&trunk);
        let derived = trunk.derive_with_resolution(2, None).unwrap();
        let mut derived = lock(&derived);
        derived.process_branch().unwrap();
        derived.close().unwrap();
        derived.close().unwrap();

        let err = derived.process_node(&"o".into()).unwrap_err();
        assert!(matches!(err, EngineError::BranchClosed(_)));
        assert!(err.is_fatal());
        assert!(derived
            .try_get_output::<SharedBuffer>(&"o".into(), "Height", None)
            .is_none());
    }

    #[test]
    fn close_returns_instances_to_pool() {
        let engine = engine();
        let tree = tree(&engine, 4);
        let trunk = tree.trunk();
        let mut trunk = lock(&trunk);
        trunk.process_branch().unwrap();
        assert_eq!(trunk.instance_count(), 2);
        trunk.close().unwrap();
        assert_eq!(engine.node_pool().pooled(&"c".into()), 1);
        assert_eq!(engine.node_pool().pooled(&"o".into()), 1);
    }

    #[test]
    fn terrain_origin_includes_tile() {
        let t = TerrainConfig::default()
            .with_tile_size(10.0)
            .at_offset(100.0, 0.0, 5.0)
            .neighbor(2, -1);
        assert_eq!(t.origin_xz(), [120.0, -5.0]);
    }
}
