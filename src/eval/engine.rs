// eval/engine.rs — long-lived owner of pools, kinds and the job substrate
//
// One engine serves any number of trees, sequentially or concurrently. It is
// a cheap `Clone` handle; every tree and branch keeps one.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::eval::amplify::amplify_graph;
use crate::eval::branch::{BranchHandle, BranchStorage};
use crate::eval::graph::{Graph, GraphLibrary};
use crate::eval::jobs::{JobSystem, RayonJobs};
use crate::eval::node::NodeRegistry;
use crate::eval::pool::{BufferPool, NodePool, ObjectPool};
use crate::eval::tree::{Tree, TreeRequest};
use log::debug;
use std::sync::Arc;

/// Idle branch storages and branch lists kept for reuse.
const STORAGE_POOL_CAPACITY: usize = 64;

struct EngineInner {
    config: EngineConfig,
    registry: NodeRegistry,
    nodes: NodePool,
    buffers: BufferPool,
    branches: ObjectPool<BranchStorage>,
    branch_lists: ObjectPool<Vec<BranchHandle>>,
    jobs: Arc<dyn JobSystem>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Engine with the built-in node kinds and a rayon job pool sized by
    /// `config.worker_threads`.
    pub fn new(config: EngineConfig) -> Result<Engine> {
        let jobs = RayonJobs::new(config.worker_threads)?;
        debug!("engine started with {} job threads", jobs.threads());
        Ok(Engine::with_parts(
            config,
            NodeRegistry::with_builtin_kinds(),
            Arc::new(jobs),
        ))
    }

    pub fn with_parts(
        config: EngineConfig,
        registry: NodeRegistry,
        jobs: Arc<dyn JobSystem>,
    ) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                nodes: NodePool::new(config.max_pooled_per_node),
                buffers: BufferPool::new(config.max_pooled_buffers_per_shape),
                branches: ObjectPool::new(STORAGE_POOL_CAPACITY),
                branch_lists: ObjectPool::new(STORAGE_POOL_CAPACITY),
                config,
                registry,
                jobs,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn jobs(&self) -> &Arc<dyn JobSystem> {
        &self.inner.jobs
    }

    pub fn node_pool(&self) -> &NodePool {
        &self.inner.nodes
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.inner.buffers
    }

    pub(crate) fn branch_pool(&self) -> &ObjectPool<BranchStorage> {
        &self.inner.branches
    }

    pub(crate) fn branch_list_pool(&self) -> &ObjectPool<Vec<BranchHandle>> {
        &self.inner.branch_lists
    }

    /// A request for `graph` using the configured tile size.
    pub fn request(&self, graph: Arc<Graph>) -> TreeRequest {
        let mut request = TreeRequest::new(graph);
        request.terrain = request.terrain.with_tile_size(self.inner.config.default_tile_size);
        request
    }

    pub fn new_tree(&self, request: TreeRequest) -> Result<Tree> {
        Tree::new(self.clone(), request)
    }

    /// Parse a graph asset and expand its amplifier nodes.
    pub fn load_graph(&self, json: &str, library: Option<&dyn GraphLibrary>) -> Result<Graph> {
        let mut graph = Graph::from_json(json, &self.inner.registry)?;
        self.prepare_graph(&mut graph, library)?;
        Ok(graph)
    }

    /// Expand every amplifier in `graph` until nothing is left to expand.
    /// Returns how many nodes were amplified.
    pub fn prepare_graph(
        &self,
        graph: &mut Graph,
        library: Option<&dyn GraphLibrary>,
    ) -> Result<usize> {
        amplify_graph(
            graph,
            &self.inner.registry,
            library,
            &[],
            self.inner.config.max_amplify_passes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::branch::lock;
    use crate::eval::jobs::InlineJobs;

    #[test]
    fn engine_new_uses_configured_threads() {
        let config = EngineConfig {
            worker_threads: 2,
            ..EngineConfig::default()
        };
        let engine = Engine::new(config).unwrap();
        assert_eq!(engine.config().worker_threads, 2);
    }

    #[test]
    fn request_uses_default_tile_size() {
        let config = EngineConfig {
            default_tile_size: 32.0,
            ..EngineConfig::default()
        };
        let engine = Engine::with_parts(config, NodeRegistry::new(), Arc::new(InlineJobs));
        let request = engine.request(Arc::new(Graph::new()));
        assert_eq!(request.terrain.tile_size, 32.0);
    }

    #[test]
    fn branch_storage_is_recycled_across_trees() {
        let engine = Engine::with_parts(
            EngineConfig::default(),
            NodeRegistry::with_builtin_kinds(),
            Arc::new(InlineJobs),
        );
        let graph = Arc::new(Graph::new());
        {
            let tree = engine.new_tree(TreeRequest::new(graph.clone())).unwrap();
            let trunk = tree.trunk();
            assert!(!lock(&trunk).is_closed());
        }
        assert_eq!(engine.branch_pool().available(), 1);
        assert_eq!(engine.branch_list_pool().available(), 1);

        let _tree = engine.new_tree(TreeRequest::new(graph)).unwrap();
        assert_eq!(engine.branch_pool().available(), 0);
    }
}
