// eval/tree.rs — one evaluation request
//
// A tree ties a graph, a set of starting nodes and a base placement to the
// engine. It owns the trunk branch, every branch derived from it, the global
// store they share and the completion token that switches their jobs from
// polling to blocking.
//
// `close_tree` (or dropping the tree) closes every branch still open, newest
// first, and hands the branch list back to the engine's pool.

use crate::error::{EngineError, Result};
use crate::eval::branch::{lock, Branch, BranchHandle, MeshSettings, TerrainConfig};
use crate::eval::engine::Engine;
use crate::eval::extensions::BranchExtensions;
use crate::eval::graph::{Graph, NodeGuid};
use crate::eval::store::{KeyedStore, StoreKey};
use crate::eval::token::CompletionToken;
use crate::eval::value::FromPortValue;
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Everything `Engine::new_tree` needs.
pub struct TreeRequest {
    pub graph: Arc<Graph>,
    /// Global store to share. A fresh one is created when `None`.
    pub store: Option<Arc<KeyedStore>>,
    pub mesh: MeshSettings,
    pub terrain: TerrainConfig,
    /// Explicit starting nodes. `None` picks the graph's output nodes.
    pub starting_nodes: Option<Vec<NodeGuid>>,
    pub extensions: BranchExtensions,
}

impl TreeRequest {
    pub fn new(graph: Arc<Graph>) -> Self {
        TreeRequest {
            graph,
            store: None,
            mesh: MeshSettings::default(),
            terrain: TerrainConfig::default(),
            starting_nodes: None,
            extensions: BranchExtensions::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<KeyedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_resolution(mut self, resolution: u32) -> Self {
        self.mesh = self.mesh.with_resolution(resolution);
        self
    }

    pub fn with_terrain(mut self, terrain: TerrainConfig) -> Self {
        self.terrain = terrain;
        self
    }

    pub fn with_offset(mut self, x: f64, z: f64) -> Self {
        self.terrain = self.terrain.at_offset(x, self.terrain.world_offset[1], z);
        self
    }

    pub fn with_starting_nodes(mut self, nodes: Vec<NodeGuid>) -> Self {
        self.starting_nodes = Some(nodes);
        self
    }

    pub fn with_extensions(mut self, extensions: BranchExtensions) -> Self {
        self.extensions = extensions;
        self
    }
}

// ── Shared tree state ───────────────────────────────────────────────

/// State every branch of one tree points at.
pub struct TreeShared {
    pub(crate) engine: Engine,
    pub(crate) graph: Arc<Graph>,
    pub(crate) store: Arc<KeyedStore>,
    pub(crate) token: Arc<CompletionToken>,
    pub(crate) extensions: BranchExtensions,
    next_index: AtomicUsize,
    branches: Mutex<Vec<BranchHandle>>,
    closed: AtomicBool,
}

impl TreeShared {
    pub(crate) fn next_branch_index(&self) -> usize {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::TreeClosed);
        }
        Ok(())
    }

    pub(crate) fn register(&self, branch: BranchHandle) {
        lock(&self.branches).push(branch);
    }
}

// ── Tree ────────────────────────────────────────────────────────────

pub struct Tree {
    shared: Arc<TreeShared>,
    trunk: BranchHandle,
}

impl Tree {
    pub(crate) fn new(engine: Engine, request: TreeRequest) -> Result<Tree> {
        let TreeRequest {
            graph,
            store,
            mesh,
            terrain,
            starting_nodes,
            extensions,
        } = request;

        if engine.config().reject_cycles {
            graph.topological_order()?;
        }

        let starting = starting_nodes.unwrap_or_else(|| graph.output_nodes());
        if let Some(missing) = starting.iter().find(|g| !graph.contains(g)) {
            return Err(EngineError::UnknownNode(missing.to_string()));
        }

        let store = store.unwrap_or_default();
        let token = Arc::new(CompletionToken::new());
        store.insert_shared(StoreKey::of::<CompletionToken>(), token.clone());

        let branches = engine.branch_list_pool().take();
        let shared = Arc::new(TreeShared {
            engine,
            graph,
            store,
            token,
            extensions,
            next_index: AtomicUsize::new(0),
            branches: Mutex::new(branches),
            closed: AtomicBool::new(false),
        });

        let mut trunk = Branch::open(shared.clone(), None, mesh, terrain, starting.into());
        for init in shared.extensions.initializers() {
            if let Err(e) = init.initialize_branch(&mut trunk, None) {
                if let Err(close) = trunk.close() {
                    warn!("closing trunk after a failed initializer: {close}");
                }
                shared.closed.store(true, Ordering::Release);
                let list = std::mem::take(&mut *lock(&shared.branches));
                shared.engine.branch_list_pool().give(list);
                return Err(e);
            }
        }
        let trunk = Arc::new(Mutex::new(trunk));
        shared.register(trunk.clone());
        debug!(
            "tree opened: {} nodes, {} starting",
            shared.graph.node_count(),
            lock(&trunk).starting_nodes().len()
        );

        Ok(Tree { shared, trunk })
    }

    /// Process the trunk's starting nodes. `Ok(true)` once everything is
    /// done; `Ok(false)` means jobs are still running and the caller should
    /// come back (or complete the token).
    pub fn process_tree(&self) -> Result<bool> {
        self.shared.ensure_open()?;
        lock(&self.trunk).process_branch()
    }

    /// Complete the token and process until done.
    pub fn process_blocking(&self) -> Result<()> {
        self.shared.token.complete();
        while !self.process_tree()? {}
        Ok(())
    }

    pub fn token(&self) -> &Arc<CompletionToken> {
        &self.shared.token
    }

    pub fn trunk(&self) -> BranchHandle {
        self.trunk.clone()
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.shared.graph
    }

    pub fn global_store(&self) -> &Arc<KeyedStore> {
        &self.shared.store
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Branches registered and not yet released by `close_tree`, trunk
    /// included.
    pub fn branch_count(&self) -> usize {
        lock(&self.shared.branches).len()
    }

    pub fn open_branch_count(&self) -> usize {
        // A processing branch may be deriving, which takes the list lock
        // while it holds its own. Never hold both here.
        let branches: Vec<BranchHandle> = lock(&self.shared.branches).clone();
        branches.iter().filter(|b| !lock(b).is_closed()).count()
    }

    /// Output of `guid` in the trunk.
    pub fn try_get_output<T: FromPortValue>(
        &self,
        guid: &NodeGuid,
        field: &str,
        list_index: Option<u32>,
    ) -> Option<T> {
        lock(&self.trunk).try_get_output(guid, field, list_index)
    }

    /// Close every branch, newest first. Failures are logged; closing runs to
    /// the end and a second call does nothing.
    pub fn close_tree(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut branches = std::mem::take(&mut *lock(&self.shared.branches));
        let count = branches.len();
        for branch in branches.drain(..).rev() {
            let mut branch = lock(&branch);
            if let Err(e) = branch.close() {
                error!("closing branch {} failed: {e}", branch.index());
            }
        }
        self.shared.engine.branch_list_pool().give(branches);
        debug!("tree closed ({count} branches)");
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        self.close_tree();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::eval::extensions::InitializeBranch;
    use crate::eval::graph::NodeDefinition;
    use crate::eval::jobs::{DeferredJobs, InlineJobs};
    use crate::eval::node::NodeRegistry;
    use crate::eval::ports::PortData;
    use crate::eval::value::SharedBuffer;
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn engine_with(jobs: Arc<dyn crate::eval::jobs::JobSystem>) -> Engine {
        Engine::with_parts(EngineConfig::default(), NodeRegistry::with_builtin_kinds(), jobs)
    }

    fn noise_graph() -> Arc<Graph> {
        let mut graph = Graph::new();
        graph
            .add_node(NodeDefinition::new("n", "Noise").with_field("Frequency", json!(0.05)))
            .unwrap();
        graph.add_node(NodeDefinition::new("o", "Output")).unwrap();
        graph
            .connect(
                PortData::new("n".into(), "Value"),
                PortData::new("o".into(), "Input"),
            )
            .unwrap();
        Arc::new(graph)
    }

    #[test]
    fn cyclic_graph_rejected_at_construction() {
        let engine = engine_with(Arc::new(InlineJobs));
        let mut graph = Graph::new();
        graph.add_node(NodeDefinition::new("a", "Combine")).unwrap();
        graph.add_node(NodeDefinition::new("b", "Combine")).unwrap();
        graph
            .connect(
                PortData::new("a".into(), "Value"),
                PortData::list_item("b".into(), "Inputs", 0),
            )
            .unwrap();
        graph
            .connect(
                PortData::new("b".into(), "Value"),
                PortData::list_item("a".into(), "Inputs", 0),
            )
            .unwrap();
        let err = engine
            .new_tree(TreeRequest::new(Arc::new(graph)).with_starting_nodes(vec!["a".into()]))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Cycle(_)));
    }

    #[test]
    fn unknown_starting_node_rejected() {
        let engine = engine_with(Arc::new(InlineJobs));
        let err = engine
            .new_tree(TreeRequest::new(noise_graph()).with_starting_nodes(vec!["zz".into()]))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::UnknownNode(_)));
    }

    #[test]
    fn deferred_jobs_yield_until_token_completes() {
        let jobs = Arc::new(DeferredJobs::new());
        let engine = engine_with(jobs.clone());
        let tree = engine
            .new_tree(TreeRequest::new(noise_graph()).with_resolution(4))
            .unwrap();

        assert!(!tree.process_tree().unwrap());
        assert!(!tree.process_tree().unwrap());
        assert!(tree
            .try_get_output::<SharedBuffer>(&"o".into(), "Height", None)
            .is_none());

        tree.token().complete();
        assert!(tree.process_tree().unwrap());
        let height: SharedBuffer = tree
            .try_get_output(&"o".into(), "Height", None)
            .unwrap();
        assert_eq!(height.shape().cells(), 25);
    }

    #[test]
    fn pumping_jobs_finishes_without_forcing() {
        let jobs = Arc::new(DeferredJobs::new());
        let engine = engine_with(jobs.clone());
        let tree = engine
            .new_tree(TreeRequest::new(noise_graph()).with_resolution(4))
            .unwrap();
        let mut rounds = 0;
        while !tree.process_tree().unwrap() {
            jobs.run_pending();
            rounds += 1;
            assert!(rounds < 10);
        }
        assert!(!tree.token().is_complete());
    }

    #[test]
    fn token_is_in_global_store() {
        let engine = engine_with(Arc::new(InlineJobs));
        let tree = engine.new_tree(TreeRequest::new(noise_graph())).unwrap();
        let stored = tree
            .global_store()
            .get_typed::<CompletionToken>()
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&stored, tree.token()));
    }

    #[test]
    fn close_tree_is_idempotent_and_final() {
        let engine = engine_with(Arc::new(InlineJobs));
        let tree = engine
            .new_tree(TreeRequest::new(noise_graph()).with_resolution(2))
            .unwrap();
        tree.process_tree().unwrap();
        {
            let trunk = tree.trunk();
            let mut trunk = lock(&trunk);
            trunk.derive_with_resolution(4, None).unwrap();
        }
        assert_eq!(tree.branch_count(), 2);
        assert_eq!(tree.open_branch_count(), 2);

        tree.close_tree();
        tree.close_tree();
        assert!(tree.is_closed());
        assert_eq!(tree.branch_count(), 0);
        assert!(lock(&tree.trunk()).is_closed());
        assert!(matches!(tree.process_tree(), Err(EngineError::TreeClosed)));
    }

    #[test]
    fn shared_store_outlives_tree() {
        let engine = engine_with(Arc::new(InlineJobs));
        let store = Arc::new(KeyedStore::new());
        {
            let tree = engine
                .new_tree(TreeRequest::new(noise_graph()).with_store(store.clone()))
                .unwrap();
            tree.global_store().insert("seen", 1u8);
        }
        assert!(store.contains("seen"));
    }

    /// Refuses every branch, or only derived ones.
    struct Refuse {
        derived_only: bool,
    }

    impl InitializeBranch for Refuse {
        fn initialize_branch(&self, _branch: &mut Branch, previous: Option<&Branch>) -> Result<()> {
            if self.derived_only && previous.is_none() {
                return Ok(());
            }
            Err(EngineError::Asset("refused".into()))
        }
    }

    #[test]
    fn failed_trunk_initializer_returns_the_branch_list() {
        let engine = engine_with(Arc::new(InlineJobs));
        let refuse = Arc::new(Refuse { derived_only: false });
        let err = engine
            .new_tree(
                TreeRequest::new(noise_graph())
                    .with_extensions(BranchExtensions::new().with_initializer(refuse)),
            )
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Asset(_)));
        assert_eq!(engine.branch_list_pool().available(), 1);
    }

    #[test]
    fn failed_derived_initializer_is_not_registered() {
        let engine = engine_with(Arc::new(InlineJobs));
        let refuse = Arc::new(Refuse { derived_only: true });
        let tree = engine
            .new_tree(
                TreeRequest::new(noise_graph())
                    .with_extensions(BranchExtensions::new().with_initializer(refuse)),
            )
            .unwrap();
        let trunk = tree.trunk();
        assert!(lock(&trunk).derive_with_resolution(4, None).is_err());
        assert_eq!(tree.branch_count(), 1);
    }

    #[test]
    fn counting_open_branches_while_a_branch_derives() {
        let engine = engine_with(Arc::new(InlineJobs));
        let tree = Arc::new(
            engine
                .new_tree(TreeRequest::new(noise_graph()).with_resolution(2))
                .unwrap(),
        );
        let trunk = tree.trunk();
        let mut held = lock(&trunk);

        let counter = {
            let tree = tree.clone();
            thread::spawn(move || tree.open_branch_count())
        };
        // let the counter block on the trunk
        thread::sleep(Duration::from_millis(50));
        held.derive_with_resolution(4, None).unwrap();
        drop(held);

        let seen = counter.join().unwrap();
        assert!((1..=2).contains(&seen));
        assert_eq!(tree.open_branch_count(), 2);
    }
}
