// eval/extensions.rs — branch lifecycle hooks
//
// Extensions are registered explicitly per tree. Initializers run when a
// branch opens (`previous` is the branch it was derived from, `None` for the
// trunk); close hooks run when it closes, before its outputs are released.
//
// Two extensions ship with the crate:
//   BranchLedger   — counts opens and closes, records parentage
//   HeightmapCache — LRU of finished `Output` height maps across trees

use crate::config::EngineConfig;
use crate::error::Result;
use crate::eval::branch::Branch;
use crate::eval::graph::NodeGuid;
use crate::eval::nodes::height_memo_key;
use crate::eval::store::StoreKey;
use crate::eval::value::SharedBuffer;
use log::trace;
use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub trait InitializeBranch: Send + Sync {
    fn initialize_branch(&self, branch: &mut Branch, previous: Option<&Branch>) -> Result<()>;
}

pub trait CloseBranch: Send + Sync {
    fn close_branch(&self, branch: &Branch);
}

#[derive(Clone, Default)]
pub struct BranchExtensions {
    initializers: Vec<Arc<dyn InitializeBranch>>,
    closers: Vec<Arc<dyn CloseBranch>>,
}

impl BranchExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initializer(mut self, init: Arc<dyn InitializeBranch>) -> Self {
        self.initializers.push(init);
        self
    }

    pub fn with_closer(mut self, hook: Arc<dyn CloseBranch>) -> Self {
        self.closers.push(hook);
        self
    }

    /// Register an extension for both hooks.
    pub fn with<T>(self, ext: Arc<T>) -> Self
    where
        T: InitializeBranch + CloseBranch + 'static,
    {
        self.with_initializer(ext.clone()).with_closer(ext)
    }

    pub fn initializers(&self) -> &[Arc<dyn InitializeBranch>] {
        &self.initializers
    }

    pub fn closers(&self) -> &[Arc<dyn CloseBranch>] {
        &self.closers
    }

    pub fn is_empty(&self) -> bool {
        self.initializers.is_empty() && self.closers.is_empty()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Ledger ──────────────────────────────────────────────────────────

/// Branch bookkeeping for leak checks.
#[derive(Default)]
pub struct BranchLedger {
    opened: AtomicUsize,
    closed: AtomicUsize,
    parents: Mutex<Vec<(usize, Option<usize>)>>,
}

impl BranchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Branches opened and not yet closed.
    pub fn open(&self) -> usize {
        self.opened() - self.closed()
    }

    /// `(branch, derived from)` in opening order.
    pub fn parents(&self) -> Vec<(usize, Option<usize>)> {
        lock(&self.parents).clone()
    }
}

impl InitializeBranch for BranchLedger {
    fn initialize_branch(&self, branch: &mut Branch, previous: Option<&Branch>) -> Result<()> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        lock(&self.parents).push((branch.index(), previous.map(Branch::index)));
        Ok(())
    }
}

impl CloseBranch for BranchLedger {
    fn close_branch(&self, _branch: &Branch) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Height-map cache ────────────────────────────────────────────────

/// Finished `Output` height maps keyed by graph, node and placement.
///
/// On open, a branch's memo is seeded with any cached map for its starting
/// `Output` nodes so they finish without recomputing. On close, the branch's
/// finished maps are stored. Entries are `Arc`s: a hit is a reference-count
/// bump.
pub struct HeightmapCache {
    entries: Mutex<LruCache<u64, SharedBuffer>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl HeightmapCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        HeightmapCache {
            entries: Mutex::new(LruCache::new(cap)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Cache sized by `config.height_cache_capacity`.
    pub fn from_config(config: &EngineConfig) -> Self {
        HeightmapCache::new(config.height_cache_capacity)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    fn key(branch: &Branch, node: &NodeGuid) -> u64 {
        let mut hasher = DefaultHasher::new();
        branch.graph().fingerprint().hash(&mut hasher);
        node.hash(&mut hasher);
        let terrain = branch.terrain();
        terrain.tile.hash(&mut hasher);
        for v in terrain.world_offset {
            v.to_bits().hash(&mut hasher);
        }
        terrain.tile_size.to_bits().hash(&mut hasher);
        branch.mesh().resolution.hash(&mut hasher);
        hasher.finish()
    }

    fn output_nodes(branch: &Branch) -> impl Iterator<Item = &NodeGuid> {
        branch.starting_nodes().iter().filter(move |guid| {
            branch
                .graph()
                .node(guid)
                .is_some_and(|d| d.kind() == "Output")
        })
    }
}

impl InitializeBranch for HeightmapCache {
    fn initialize_branch(&self, branch: &mut Branch, _previous: Option<&Branch>) -> Result<()> {
        let branch: &Branch = branch;
        let found: Vec<(NodeGuid, SharedBuffer)> = {
            let mut entries = lock(&self.entries);
            Self::output_nodes(branch)
                .filter_map(|guid| {
                    let cached = entries.get(&Self::key(branch, guid)).cloned();
                    match cached {
                        Some(buf) => {
                            self.hits.fetch_add(1, Ordering::Relaxed);
                            Some((guid.clone(), buf))
                        }
                        None => {
                            self.misses.fetch_add(1, Ordering::Relaxed);
                            None
                        }
                    }
                })
                .collect()
        };
        let memo = branch.memo()?;
        for (guid, buf) in found {
            trace!("height cache hit for {guid} in branch {}", branch.index());
            memo.insert_shared(StoreKey::named(&height_memo_key(&guid)), buf);
        }
        Ok(())
    }
}

impl CloseBranch for HeightmapCache {
    fn close_branch(&self, branch: &Branch) {
        let finished: Vec<(u64, SharedBuffer)> = Self::output_nodes(branch)
            .filter_map(|guid| {
                branch
                    .try_get_output::<SharedBuffer>(guid, "Height", None)
                    .map(|buf| (Self::key(branch, guid), buf))
            })
            .collect();
        let mut entries = lock(&self.entries);
        for (key, buf) in finished {
            entries.put(key, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::branch::lock as lock_branch;
    use crate::eval::engine::Engine;
    use crate::eval::graph::{Graph, NodeDefinition};
    use crate::eval::jobs::InlineJobs;
    use crate::eval::node::NodeRegistry;
    use crate::eval::ports::PortData;
    use crate::eval::tree::TreeRequest;
    use serde_json::json;

    fn engine() -> Engine {
        Engine::with_parts(
            EngineConfig::default(),
            NodeRegistry::with_builtin_kinds(),
            Arc::new(InlineJobs),
        )
    }

    fn noise_graph() -> Arc<Graph> {
        let mut graph = Graph::new();
        graph
            .add_node(NodeDefinition::new("n", "Noise").with_field("Seed", json!(3)))
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
    fn ledger_tracks_derivations() {
        let engine = engine();
        let ledger = Arc::new(BranchLedger::new());
        let tree = engine
            .new_tree(
                TreeRequest::new(noise_graph())
                    .with_resolution(2)
                    .with_extensions(BranchExtensions::new().with(ledger.clone())),
            )
            .unwrap();
        {
            let trunk = tree.trunk();
            let mut trunk = lock_branch(&trunk);
            let child = trunk.derive_with_resolution(4, None).unwrap();
            lock_branch(&child).close().unwrap();
        }
        assert_eq!(ledger.opened(), 2);
        assert_eq!(ledger.closed(), 1);
        assert_eq!(ledger.parents(), vec![(0, None), (1, Some(0))]);

        tree.close_tree();
        assert_eq!(ledger.open(), 0);
    }

    #[test]
    fn heightmap_cache_serves_second_tree() {
        let engine = engine();
        let cache = Arc::new(HeightmapCache::new(8));
        let graph = noise_graph();
        let request = || {
            TreeRequest::new(graph.clone())
                .with_resolution(4)
                .with_extensions(BranchExtensions::new().with(cache.clone()))
        };

        let first = engine.new_tree(request()).unwrap();
        first.process_blocking().unwrap();
        let a: SharedBuffer = first.try_get_output(&"o".into(), "Height", None).unwrap();
        first.close_tree();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.misses(), 1);

        let second = engine.new_tree(request()).unwrap();
        second.process_blocking().unwrap();
        let b: SharedBuffer = second.try_get_output(&"o".into(), "Height", None).unwrap();
        assert_eq!(cache.hits(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        // the noise node was never needed
        assert_eq!(lock_branch(&second.trunk()).instance_count(), 1);
    }

    #[test]
    fn heightmap_cache_keys_on_placement() {
        let engine = engine();
        let cache = Arc::new(HeightmapCache::new(8));
        let graph = noise_graph();
        for x in [0.0, 100.0] {
            let tree = engine
                .new_tree(
                    TreeRequest::new(graph.clone())
                        .with_resolution(2)
                        .with_offset(x, 0.0)
                        .with_extensions(BranchExtensions::new().with(cache.clone())),
                )
                .unwrap();
            tree.process_blocking().unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.hits(), 0);
    }
}
