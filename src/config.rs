// config.rs — engine configuration
//
// Every field has a default, so a partial JSON document (or none at all) is a
// valid configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Worker threads for the rayon job substrate. 0 = rayon's default.
    pub worker_threads: usize,
    /// Upper bound on idle instances kept per node id.
    pub max_pooled_per_node: usize,
    /// Upper bound on idle buffers kept per buffer shape.
    pub max_pooled_buffers_per_shape: usize,
    /// Run the topological pre-pass at tree construction and refuse cyclic
    /// graphs. When false, cycles are only caught by the visiting set during
    /// evaluation and the offending node degrades.
    pub reject_cycles: bool,
    /// Fixed-point iteration limit for `amplify_graph`.
    pub max_amplify_passes: usize,
    /// Entries kept by `HeightmapCache`.
    pub height_cache_capacity: usize,
    /// World units covered by one tile edge.
    pub default_tile_size: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_threads: 0,
            max_pooled_per_node: 16,
            max_pooled_buffers_per_shape: 32,
            reject_cycles: true,
            max_amplify_passes: 8,
            height_cache_capacity: 64,
            default_tile_size: 64.0,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
