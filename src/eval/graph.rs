// eval/graph.rs — node definitions, edges and the graph asset format
//
// Parses the flat { nodes, edges } asset format into an indexed graph of
// immutable `NodeDefinition`s. Definitions are shared (`Arc`) by every branch
// that evaluates the graph; only cloning/amplification mutates a graph, and
// always before it is handed to a tree.
//
// Connectivity is stored input-port → output-port: an input port has at most
// one feeding connection, so connecting an already-fed input replaces the old
// edge (last writer wins).

use crate::error::{EngineError, Result};
use crate::eval::node::NodeRegistry;
use crate::eval::ports::{parse_handle, EdgeConnection, PortData};
use log::warn;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

// ── Node identity ───────────────────────────────────────────────────

/// Identifies whoever requested a clone. Must be unique per concurrent
/// amplification of the same origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequesterId(pub u64);

/// Structured node id: the authored id plus the chain of requesters that
/// cloned it. A clone of `a` for requester 7 is `a+7`; cloning that for
/// requester 2 gives `a+7+2`. Unlike string concatenation, `("a1", [2])` and
/// `("a", [12])` can never collide.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeGuid {
    base: Arc<str>,
    lineage: SmallVec<[u64; 2]>,
}

impl NodeGuid {
    pub fn new(base: impl Into<Arc<str>>) -> Self {
        NodeGuid {
            base: base.into(),
            lineage: SmallVec::new(),
        }
    }

    /// Id of the `part` an amplifier injects on behalf of this node. Stable
    /// across loads, so repeated expansions hit the same pooled instances.
    pub fn derived(&self, part: &str) -> Self {
        let name = format!("{self}/{part}");
        NodeGuid::new(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string())
    }

    /// The id this node gets when cloned on behalf of `requester`.
    pub fn cloned_for(&self, requester: RequesterId) -> Self {
        let mut lineage = self.lineage.clone();
        lineage.push(requester.0);
        NodeGuid {
            base: self.base.clone(),
            lineage,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn lineage(&self) -> &[u64] {
        &self.lineage
    }

    pub fn is_clone(&self) -> bool {
        !self.lineage.is_empty()
    }
}

impl fmt::Display for NodeGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)?;
        for r in &self.lineage {
            write!(f, "+{r}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeGuid({self})")
    }
}

impl From<&str> for NodeGuid {
    fn from(s: &str) -> Self {
        NodeGuid::new(s)
    }
}

// ── Node definition ─────────────────────────────────────────────────

/// Immutable description of one procedural operation.
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    guid: NodeGuid,
    kind: Arc<str>,
    /// Authoring position. Editorial only; never read by evaluation.
    position: [f32; 2],
    fields: HashMap<String, Value>,
    is_output: bool,
    amplified: bool,
}

impl NodeDefinition {
    pub fn new(guid: impl Into<NodeGuid>, kind: &str) -> Self {
        NodeDefinition {
            guid: guid.into(),
            kind: kind.into(),
            position: [0.0, 0.0],
            fields: HashMap::new(),
            is_output: false,
            amplified: false,
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = [x, y];
        self
    }

    pub fn as_output(mut self) -> Self {
        self.is_output = true;
        self
    }

    pub fn guid(&self) -> &NodeGuid {
        &self.guid
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn position(&self) -> [f32; 2] {
        self.position
    }

    pub fn fields(&self) -> &HashMap<String, Value> {
        &self.fields
    }

    pub fn set_field(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn is_output(&self) -> bool {
        self.is_output
    }

    pub fn is_amplified(&self) -> bool {
        self.amplified
    }

    pub(crate) fn mark_amplified(&mut self) {
        self.amplified = true;
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn field_f64(&self, key: &str, default: f64) -> f64 {
        self.fields.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub fn field_u32(&self, key: &str, default: u32) -> u32 {
        self.fields
            .get(key)
            .and_then(|v| v.as_f64())
            .map(|v| v.max(0.0) as u32)
            .unwrap_or(default)
    }

    pub fn field_i64(&self, key: &str, default: i64) -> i64 {
        self.fields
            .get(key)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or(default)
    }

    pub fn field_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.fields.get(key).and_then(|v| v.as_str()).unwrap_or(default)
    }

    /// Copy of this definition under the id it gets for `requester`.
    /// Amplifiers in the copy must expand again, so the flag is cleared.
    pub fn clone_for(&self, requester: RequesterId) -> Self {
        NodeDefinition {
            guid: self.guid.cloned_for(requester),
            amplified: false,
            ..self.clone()
        }
    }
}

// ── Asset format ────────────────────────────────────────────────────

/// A node as stored in a graph asset.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetNode {
    pub id: String,
    #[serde(default)]
    pub position: Option<AssetPosition>,
    pub data: AssetNodeData,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AssetPosition {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetNodeData {
    /// Node kind, e.g. "Constant", "Noise", "Output".
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub fields: HashMap<String, Value>,
    /// User-designated output node flag.
    #[serde(rename = "_outputNode", default)]
    pub is_output: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetEdge {
    pub source: String,
    #[serde(rename = "sourceHandle", default)]
    pub source_handle: Option<String>,
    pub target: String,
    #[serde(rename = "targetHandle", default)]
    pub target_handle: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphAsset {
    pub nodes: Vec<AssetNode>,
    #[serde(default)]
    pub edges: Vec<AssetEdge>,
}

/// Supplies immutable graphs by name. The engine never mutates a graph it
/// gets from a library; embedding clones it first.
pub trait GraphLibrary: Send + Sync {
    fn graph(&self, name: &str) -> Option<Arc<Graph>>;
}

impl GraphLibrary for HashMap<String, Arc<Graph>> {
    fn graph(&self, name: &str) -> Option<Arc<Graph>> {
        self.get(name).cloned()
    }
}

// ── Graph ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Graph {
    nodes: FxHashMap<NodeGuid, Arc<NodeDefinition>>,
    /// Insertion order, for deterministic iteration.
    order: Vec<NodeGuid>,
    /// input port → feeding output port.
    feeds: FxHashMap<PortData, PortData>,
    /// Connected input ports per node.
    inputs_by_node: FxHashMap<NodeGuid, SmallVec<[PortData; 4]>>,
    fingerprint: OnceLock<u64>,
}

impl Clone for Graph {
    fn clone(&self) -> Self {
        Graph {
            nodes: self.nodes.clone(),
            order: self.order.clone(),
            feeds: self.feeds.clone(),
            inputs_by_node: self.inputs_by_node.clone(),
            fingerprint: OnceLock::new(),
        }
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the graph.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    pub fn edge_count(&self) -> usize {
        self.feeds.len()
    }

    pub fn node(&self, guid: &NodeGuid) -> Option<&Arc<NodeDefinition>> {
        self.nodes.get(guid)
    }

    pub fn contains(&self, guid: &NodeGuid) -> bool {
        self.nodes.contains_key(guid)
    }

    /// Mutable access for re-parameterizing a node. Copies the definition if
    /// a tree still shares it.
    pub fn node_mut(&mut self, guid: &NodeGuid) -> Option<&mut NodeDefinition> {
        self.fingerprint = OnceLock::new();
        self.nodes.get_mut(guid).map(Arc::make_mut)
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> &[NodeGuid] {
        &self.order
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NodeDefinition>> {
        self.order.iter().filter_map(move |g| self.nodes.get(g))
    }

    /// Insert a definition. Ids must be unique: a collision is reported
    /// rather than silently replacing the existing node.
    pub fn add_node(&mut self, def: NodeDefinition) -> Result<NodeGuid> {
        let guid = def.guid.clone();
        if self.nodes.contains_key(&guid) {
            return Err(EngineError::GuidCollision(guid.to_string()));
        }
        self.fingerprint = OnceLock::new();
        self.order.push(guid.clone());
        self.nodes.insert(guid.clone(), Arc::new(def));
        Ok(guid)
    }

    /// Connect `output` to `input`. Returns the output port that previously
    /// fed `input`, if any; that edge is removed.
    pub fn connect(&mut self, output: PortData, input: PortData) -> Result<Option<PortData>> {
        if !self.nodes.contains_key(&output.node) {
            return Err(EngineError::UnknownNode(output.node.to_string()));
        }
        if !self.nodes.contains_key(&input.node) {
            return Err(EngineError::UnknownNode(input.node.to_string()));
        }
        self.fingerprint = OnceLock::new();
        let previous = self.feeds.insert(input.clone(), output);
        if previous.is_none() {
            self.inputs_by_node
                .entry(input.node.clone())
                .or_default()
                .push(input);
        }
        Ok(previous)
    }

    pub fn disconnect(&mut self, input: &PortData) -> Option<PortData> {
        let removed = self.feeds.remove(input)?;
        self.fingerprint = OnceLock::new();
        if let Some(ports) = self.inputs_by_node.get_mut(&input.node) {
            ports.retain(|p| p != input);
        }
        Some(removed)
    }

    /// The output port feeding `input`, if connected.
    pub fn source_of(&self, input: &PortData) -> Option<&PortData> {
        self.feeds.get(input)
    }

    /// All connected inputs of `node` with their feeding output port.
    pub fn incoming(&self, node: &NodeGuid) -> impl Iterator<Item = (&PortData, &PortData)> {
        self.inputs_by_node
            .get(node)
            .into_iter()
            .flat_map(|ports| ports.iter())
            .filter_map(move |input| self.feeds.get(input).map(|output| (input, output)))
    }

    /// Connections into the input field `field` of `node`, sorted by list
    /// index (scalar ports sort first).
    pub fn sources_for_field(&self, node: &NodeGuid, field: &str) -> Vec<EdgeConnection> {
        let mut edges: Vec<EdgeConnection> = self
            .incoming(node)
            .filter(|(input, _)| &*input.field == field)
            .map(|(input, output)| EdgeConnection::new(output.clone(), input.clone()))
            .collect();
        edges.sort_unstable_by_key(|e| e.input.list_index);
        edges
    }

    /// Every edge, in deterministic order.
    pub fn edges(&self) -> Vec<EdgeConnection> {
        let mut edges: Vec<EdgeConnection> = self
            .feeds
            .iter()
            .map(|(input, output)| EdgeConnection::new(output.clone(), input.clone()))
            .collect();
        edges.sort();
        edges
    }

    pub fn has_outgoing(&self, node: &NodeGuid) -> bool {
        self.feeds.values().any(|output| &output.node == node)
    }

    // ── Starting nodes ──────────────────────────────────────────────

    /// Determine which nodes start evaluation.
    ///
    /// Strategy:
    ///   1. nodes flagged `_outputNode`
    ///   2. nodes of kind `Output`
    ///   3. terminal nodes (no outgoing edges)
    pub fn output_nodes(&self) -> Vec<NodeGuid> {
        let flagged: Vec<NodeGuid> = self
            .nodes()
            .filter(|d| d.is_output())
            .map(|d| d.guid().clone())
            .collect();
        if !flagged.is_empty() {
            return flagged;
        }

        let outputs: Vec<NodeGuid> = self
            .nodes()
            .filter(|d| d.kind() == "Output")
            .map(|d| d.guid().clone())
            .collect();
        if !outputs.is_empty() {
            return outputs;
        }

        let sources: FxHashSet<&NodeGuid> = self.feeds.values().map(|o| &o.node).collect();
        self.order
            .iter()
            .filter(|g| !sources.contains(g))
            .cloned()
            .collect()
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Kahn's algorithm over the dependency direction (output → input).
    /// Returns producers before consumers, or the first node found on a
    /// cycle.
    pub fn topological_order(&self) -> Result<Vec<NodeGuid>> {
        let mut in_degree: FxHashMap<&NodeGuid, usize> =
            self.order.iter().map(|g| (g, 0)).collect();
        let mut consumers: FxHashMap<&NodeGuid, Vec<&NodeGuid>> = FxHashMap::default();

        for (input, output) in &self.feeds {
            *in_degree.entry(&input.node).or_insert(0) += 1;
            consumers.entry(&output.node).or_default().push(&input.node);
        }

        let mut ready: VecDeque<&NodeGuid> = self
            .order
            .iter()
            .filter(|g| in_degree.get(g).copied() == Some(0))
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(guid) = ready.pop_front() {
            sorted.push(guid.clone());
            if let Some(next) = consumers.get(guid) {
                for consumer in next {
                    if let Some(d) = in_degree.get_mut(consumer) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push_back(*consumer);
                        }
                    }
                }
            }
        }

        if sorted.len() != self.order.len() {
            let stuck = self
                .order
                .iter()
                .find(|g| in_degree.get(g).copied().unwrap_or(0) > 0)
                .map(|g| g.to_string())
                .unwrap_or_default();
            return Err(EngineError::Cycle(stuck));
        }
        Ok(sorted)
    }

    // ── Fingerprint ─────────────────────────────────────────────────

    /// Deterministic hash of the graph structure. Same nodes, fields and
    /// edges give the same value regardless of insertion order.
    pub fn fingerprint(&self) -> u64 {
        *self.fingerprint.get_or_init(|| self.compute_fingerprint())
    }

    fn compute_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();

        let mut sorted: Vec<&NodeGuid> = self.order.iter().collect();
        sorted.sort();
        sorted.len().hash(&mut hasher);
        for guid in sorted {
            let Some(def) = self.nodes.get(guid) else {
                continue;
            };
            guid.hash(&mut hasher);
            def.kind().hash(&mut hasher);
            def.is_output().hash(&mut hasher);

            // Fields in sorted key order
            let mut keys: Vec<&String> = def.fields().keys().collect();
            keys.sort();
            keys.len().hash(&mut hasher);
            for key in keys {
                key.hash(&mut hasher);
                let canonical = serde_json::to_string(&def.fields()[key]).unwrap_or_default();
                canonical.hash(&mut hasher);
            }
        }

        let edges = self.edges();
        edges.len().hash(&mut hasher);
        for edge in &edges {
            edge.hash(&mut hasher);
        }

        hasher.finish()
    }

    // ── Construction from assets ────────────────────────────────────

    pub fn from_json(json: &str, registry: &NodeRegistry) -> Result<Self> {
        let asset: GraphAsset = serde_json::from_str(json)?;
        Self::from_asset(asset, registry)
    }

    /// Build a graph from an asset. Unknown kinds are kept (they degrade at
    /// evaluation) but an edge from such a node needs an explicit
    /// `sourceHandle`.
    pub fn from_asset(asset: GraphAsset, registry: &NodeRegistry) -> Result<Self> {
        let mut graph = Graph::new();

        for node in asset.nodes {
            let mut def = NodeDefinition::new(NodeGuid::new(node.id), &node.data.kind);
            if let Some(p) = node.position {
                def.position = [p.x, p.y];
            }
            def.fields = node.data.fields;
            def.is_output = node.data.is_output;
            graph.add_node(def)?;
        }

        for edge in asset.edges {
            let source = NodeGuid::new(edge.source.as_str());
            let target = NodeGuid::new(edge.target.as_str());

            let source_kind = graph
                .node(&source)
                .map(|d| d.kind().to_string())
                .ok_or_else(|| EngineError::Asset(format!("edge from unknown node '{source}'")))?;

            let source_handle = match edge.source_handle {
                Some(h) => h,
                None => match registry.get(&source_kind) {
                    Ok(kind) => kind
                        .outputs()
                        .first()
                        .map(|p| p.name.to_string())
                        .ok_or_else(|| {
                            EngineError::Asset(format!("node '{source}' has no outputs"))
                        })?,
                    Err(_) => {
                        warn!("edge {source} → {target}: unknown kind '{source_kind}' and no sourceHandle; assuming 'Value'");
                        "Value".to_string()
                    }
                },
            };
            let target_handle = edge.target_handle.unwrap_or_else(|| "Input".into());

            let output = parse_handle(source, &source_handle);
            let input = parse_handle(target, &target_handle);
            if let Some(replaced) = graph.connect(output, input.clone())? {
                warn!("input {input} connected twice; dropping edge from {replaced}");
            }
        }

        Ok(graph)
    }
}
