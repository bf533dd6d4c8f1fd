pub mod config;
pub mod error;
pub mod eval;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use eval::engine::Engine;
pub use eval::graph::{Graph, GraphLibrary, NodeDefinition, NodeGuid};
pub use eval::tree::{Tree, TreeRequest};
