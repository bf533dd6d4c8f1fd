// eval/mod.rs — branch-based graph evaluation
//
// An `Engine` owns the pools, the node registry and the job substrate. Each
// `Tree` evaluates one graph for one caller; its `Branch`es hold the node
// instances and buffers for one set of evaluation parameters.

pub mod amplify;
pub mod branch;
pub mod engine;
pub mod extensions;
pub mod graph;
pub mod jobs;
pub mod kernels;
pub mod macros;
pub mod node;
pub mod nodes;
pub mod pool;
pub mod ports;
pub mod sampling;
pub mod store;
pub mod token;
pub mod tree;
pub mod value;
