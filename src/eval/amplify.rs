// eval/amplify.rs — subgraph cloning and amplifier expansion
//
// Cloning copies node definitions under `origin + requester` ids and rewires
// the edges between the copies, so the clone evaluates independently of its
// origin. Amplifier kinds use it (and plain node injection) to rewrite the
// graph around themselves before any tree sees it.
//
// Expansion runs in passes: the first pass visits the seed nodes, each later
// pass visits what the previous one added. Clones of amplifiers come out
// not-yet-amplified, so nested macros expand on the following pass.

use crate::error::{EngineError, Result};
use crate::eval::graph::{Graph, GraphLibrary, NodeDefinition, NodeGuid, RequesterId};
use crate::eval::node::NodeRegistry;
use crate::eval::ports::{EdgeConnection, PortData};
use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Requester id an amplifier node uses for the clones it makes.
pub fn requester_for(guid: &NodeGuid) -> RequesterId {
    let mut hasher = DefaultHasher::new();
    guid.hash(&mut hasher);
    RequesterId(hasher.finish())
}

// ── Cloning ─────────────────────────────────────────────────────────

/// Result of a clone: origin id → clone id, and the edges created between
/// clones.
#[derive(Debug, Default)]
pub struct ClonedSubgraph {
    pub mapping: FxHashMap<NodeGuid, NodeGuid>,
    pub edges: Vec<EdgeConnection>,
}

impl ClonedSubgraph {
    pub fn clone_of(&self, origin: &NodeGuid) -> Option<&NodeGuid> {
        self.mapping.get(origin)
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

/// Everything upstream of `node.input_field` (every list item included),
/// breadth-first, plus the edges among those nodes.
pub fn collect_all_nodes(
    graph: &Graph,
    node: &NodeGuid,
    input_field: &str,
) -> (Vec<NodeGuid>, Vec<EdgeConnection>) {
    let mut seen: FxHashSet<NodeGuid> = FxHashSet::default();
    let mut order = Vec::new();
    let mut queue: VecDeque<NodeGuid> = graph
        .sources_for_field(node, input_field)
        .into_iter()
        .map(|e| e.output.node)
        .collect();

    while let Some(guid) = queue.pop_front() {
        if !seen.insert(guid.clone()) {
            continue;
        }
        for (_, output) in graph.incoming(&guid) {
            if !seen.contains(&output.node) {
                queue.push_back(output.node.clone());
            }
        }
        order.push(guid);
    }

    let mut edges: Vec<EdgeConnection> = order
        .iter()
        .flat_map(|guid| graph.incoming(guid))
        .filter(|(_, output)| seen.contains(&output.node))
        .map(|(input, output)| EdgeConnection::new(output.clone(), input.clone()))
        .collect();
    edges.sort();
    (order, edges)
}

/// Clone `nodes` of `base` into `target` for `requester` and recreate
/// `edges` between the clones. Ids already present in `target` are
/// rejected.
pub fn copy_subgraph(
    target: &mut Graph,
    base: &Graph,
    nodes: &[NodeGuid],
    edges: &[EdgeConnection],
    requester: RequesterId,
) -> Result<ClonedSubgraph> {
    let defs: Vec<Arc<NodeDefinition>> = nodes
        .iter()
        .map(|g| base.node(g).cloned().ok_or_else(|| EngineError::UnknownNode(g.to_string())))
        .collect::<Result<_>>()?;
    copy_definitions(target, &defs, edges, requester)
}

fn copy_definitions(
    target: &mut Graph,
    defs: &[Arc<NodeDefinition>],
    edges: &[EdgeConnection],
    requester: RequesterId,
) -> Result<ClonedSubgraph> {
    let mut cloned = ClonedSubgraph::default();
    for def in defs {
        let copy = target.add_node(def.clone_for(requester))?;
        cloned.mapping.insert(def.guid().clone(), copy);
    }
    for edge in edges {
        let (Some(from), Some(to)) = (
            cloned.clone_of(&edge.output.node).cloned(),
            cloned.clone_of(&edge.input.node).cloned(),
        ) else {
            continue;
        };
        let output = edge.output.on_node(from);
        let input = edge.input.on_node(to);
        target.connect(output.clone(), input.clone())?;
        cloned.edges.push(EdgeConnection::new(output, input));
    }
    Ok(cloned)
}

/// Clone the subtree feeding `consumer.from_field` and connect the clones of
/// its direct feeders into `consumer.to_field` (same list slots). An existing
/// connection on the target port is replaced.
pub fn copy_connections_to_input(
    graph: &mut Graph,
    consumer: &NodeGuid,
    from_field: &str,
    to_field: &str,
    requester: RequesterId,
) -> Result<ClonedSubgraph> {
    let (nodes, edges) = collect_all_nodes(graph, consumer, from_field);
    let feeders = graph.sources_for_field(consumer, from_field);
    let defs: Vec<Arc<NodeDefinition>> = nodes
        .iter()
        .filter_map(|g| graph.node(g).cloned())
        .collect();

    let mut cloned = copy_definitions(graph, &defs, &edges, requester)?;
    for feeder in feeders {
        let Some(copy) = cloned.clone_of(&feeder.output.node).cloned() else {
            continue;
        };
        let output = feeder.output.on_node(copy);
        let input = feeder.input.with_field(to_field);
        graph.connect(output.clone(), input.clone())?;
        cloned.edges.push(EdgeConnection::new(output, input));
    }
    Ok(cloned)
}

/// Clone every node and edge of `base` into `target`.
pub fn copy_full_graph(target: &mut Graph, base: &Graph, requester: RequesterId) -> Result<ClonedSubgraph> {
    let defs: Vec<Arc<NodeDefinition>> = base.nodes().cloned().collect();
    copy_definitions(target, &defs, &base.edges(), requester)
}

// ── Amplification ───────────────────────────────────────────────────

/// What an amplifier may do to the graph it sits in. Every node it adds is
/// visited on the next pass.
pub struct AmplifyScope<'a> {
    graph: &'a mut Graph,
    registry: &'a NodeRegistry,
    library: Option<&'a dyn GraphLibrary>,
    added: Vec<NodeGuid>,
}

impl<'a> AmplifyScope<'a> {
    pub fn new(
        graph: &'a mut Graph,
        registry: &'a NodeRegistry,
        library: Option<&'a dyn GraphLibrary>,
    ) -> Self {
        AmplifyScope {
            graph,
            registry,
            library,
            added: Vec::new(),
        }
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn registry(&self) -> &NodeRegistry {
        self.registry
    }

    pub fn library(&self) -> Option<&'a dyn GraphLibrary> {
        self.library
    }

    /// Nodes added so far.
    pub fn added(&self) -> &[NodeGuid] {
        &self.added
    }

    pub fn add_node(&mut self, def: NodeDefinition) -> Result<NodeGuid> {
        let guid = self.graph.add_node(def)?;
        self.added.push(guid.clone());
        Ok(guid)
    }

    pub fn connect(&mut self, output: PortData, input: PortData) -> Result<Option<PortData>> {
        self.graph.connect(output, input)
    }

    /// Name of the port an edge from `guid` reads when none is given.
    pub fn default_output(&self, guid: &NodeGuid) -> Result<&'static str> {
        let def = self
            .graph
            .node(guid)
            .ok_or_else(|| EngineError::UnknownNode(guid.to_string()))?;
        let kind = self.registry.get(def.kind())?;
        kind.outputs()
            .first()
            .map(|p| p.name)
            .ok_or_else(|| EngineError::invalid_field(guid, "outputs", "kind declares no outputs"))
    }

    pub fn copy_connections_to_input(
        &mut self,
        consumer: &NodeGuid,
        from_field: &str,
        to_field: &str,
        requester: RequesterId,
    ) -> Result<ClonedSubgraph> {
        let cloned = copy_connections_to_input(self.graph, consumer, from_field, to_field, requester)?;
        self.added.extend(cloned.mapping.values().cloned());
        Ok(cloned)
    }

    pub fn copy_subgraph(
        &mut self,
        base: &Graph,
        nodes: &[NodeGuid],
        edges: &[EdgeConnection],
        requester: RequesterId,
    ) -> Result<ClonedSubgraph> {
        let cloned = copy_subgraph(self.graph, base, nodes, edges, requester)?;
        self.added.extend(cloned.mapping.values().cloned());
        Ok(cloned)
    }

    pub fn copy_full_graph(&mut self, base: &Graph, requester: RequesterId) -> Result<ClonedSubgraph> {
        let cloned = copy_full_graph(self.graph, base, requester)?;
        self.added.extend(cloned.mapping.values().cloned());
        Ok(cloned)
    }
}

/// Expand amplifier nodes until no pass adds anything new. An empty `seeds`
/// visits the whole graph first. Returns the number of nodes amplified.
///
/// A node is marked amplified before it expands, so a failing amplifier is
/// not retried. Non-fatal failures are logged and leave the node as it is.
pub fn amplify_graph(
    graph: &mut Graph,
    registry: &NodeRegistry,
    library: Option<&dyn GraphLibrary>,
    seeds: &[NodeGuid],
    max_passes: usize,
) -> Result<usize> {
    let mut frontier: Vec<NodeGuid> = if seeds.is_empty() {
        graph.node_ids().to_vec()
    } else {
        seeds.to_vec()
    };
    let mut amplified = 0usize;
    let mut passes = 0usize;

    while !frontier.is_empty() {
        if passes == max_passes {
            warn!(
                "amplification stopped after {passes} passes; {} nodes left unexpanded",
                frontier.len()
            );
            break;
        }
        passes += 1;

        let mut scope = AmplifyScope::new(graph, registry, library);
        for guid in frontier {
            let Some(def) = scope.graph.node(&guid).cloned() else {
                continue;
            };
            if def.is_amplified() {
                continue;
            }
            let kind = match registry.get(def.kind()) {
                Ok(kind) => kind,
                Err(e) => {
                    warn!("{guid}: {e}");
                    continue;
                }
            };
            if !kind.is_amplifier() {
                continue;
            }
            if let Some(node) = scope.graph.node_mut(&guid) {
                node.mark_amplified();
            }
            match kind.amplify(&def, &mut scope) {
                Ok(()) => amplified += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("{guid}: amplification failed: {e}"),
            }
        }
        frontier = scope.added;
    }

    if amplified > 0 {
        debug!("amplified {amplified} nodes in {passes} passes");
    }
    Ok(amplified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_node(id: &str, kind: &str) -> NodeDefinition {
        NodeDefinition::new(id, kind)
    }

    fn wire(graph: &mut Graph, from: &str, out_field: &str, to: PortData) {
        graph.connect(PortData::new(from.into(), out_field), to).unwrap();
    }

    /// a → s.Inputs[0], b → s.Inputs[1], s → o.Input
    fn sum_graph() -> Graph {
        let mut graph = Graph::new();
        graph
            .add_node(make_node("a", "Constant").with_field("Value", json!(1.0)))
            .unwrap();
        graph
            .add_node(make_node("b", "Constant").with_field("Value", json!(2.0)))
            .unwrap();
        graph.add_node(make_node("s", "Combine")).unwrap();
        graph.add_node(make_node("o", "Output")).unwrap();
        wire(&mut graph, "a", "Value", PortData::list_item("s".into(), "Inputs", 0));
        wire(&mut graph, "b", "Value", PortData::list_item("s".into(), "Inputs", 1));
        wire(&mut graph, "s", "Value", PortData::new("o".into(), "Input"));
        graph
    }

    #[test]
    fn collects_upstream_closure_and_internal_edges() {
        let graph = sum_graph();
        let (nodes, edges) = collect_all_nodes(&graph, &"o".into(), "Input");
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0], NodeGuid::from("s"));
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.input.node == NodeGuid::from("s")));
    }

    #[test]
    fn clones_are_isolated_from_origin_and_each_other() {
        let mut graph = sum_graph();
        let o: NodeGuid = "o".into();
        let first = copy_connections_to_input(&mut graph, &o, "Input", "Alt", RequesterId(1)).unwrap();
        let second = copy_connections_to_input(&mut graph, &o, "Input", "Other", RequesterId(2)).unwrap();
        assert_eq!(graph.node_count(), 4 + 3 + 3);

        let a1 = first.clone_of(&"a".into()).unwrap().clone();
        let a2 = second.clone_of(&"a".into()).unwrap().clone();
        assert_ne!(a1, a2);
        assert_eq!(a1.lineage(), &[1]);

        graph.node_mut(&a1).unwrap().set_field("Value", json!(9.0));
        assert_eq!(graph.node(&"a".into()).unwrap().field_f64("Value", 0.0), 1.0);
        assert_eq!(graph.node(&a2).unwrap().field_f64("Value", 0.0), 1.0);

        // clones feed each other, never the origin
        let s1 = first.clone_of(&"s".into()).unwrap();
        let fed = graph.sources_for_field(s1, "Inputs");
        assert_eq!(fed.len(), 2);
        assert!(fed.iter().all(|e| e.output.node.is_clone()));
        assert_eq!(
            graph.source_of(&PortData::new(o.clone(), "Alt")).map(|p| p.node.clone()),
            Some(s1.clone())
        );
        // the original wiring is untouched
        assert_eq!(
            graph.source_of(&PortData::new(o, "Input")).map(|p| p.node.clone()),
            Some(NodeGuid::from("s"))
        );
    }

    #[test]
    fn same_requester_twice_collides() {
        let mut graph = sum_graph();
        let o: NodeGuid = "o".into();
        copy_connections_to_input(&mut graph, &o, "Input", "Alt", RequesterId(5)).unwrap();
        let err = copy_connections_to_input(&mut graph, &o, "Input", "Alt", RequesterId(5)).unwrap_err();
        assert!(matches!(err, EngineError::GuidCollision(_)));
    }

    #[test]
    fn full_copy_keeps_edges_between_clones() {
        let base = sum_graph();
        let mut target = Graph::new();
        let cloned = copy_full_graph(&mut target, &base, RequesterId(3)).unwrap();
        assert_eq!(cloned.len(), 4);
        assert_eq!(target.edge_count(), 3);
        assert_eq!(cloned.edges.len(), 3);
        assert!(target.nodes().all(|d| d.guid().lineage() == [3]));
    }

    #[test]
    fn octaves_expand_once() {
        let registry = NodeRegistry::with_builtin_kinds();
        let mut graph = Graph::new();
        graph
            .add_node(make_node("oct", "Octaves").with_field("Octaves", json!(3)))
            .unwrap();
        let n = amplify_graph(&mut graph, &registry, None, &[], 8).unwrap();
        assert_eq!(n, 1);
        // 3 noise + 1 combine
        assert_eq!(graph.node_count(), 5);
        assert!(graph.node(&"oct".into()).unwrap().is_amplified());

        let again = amplify_graph(&mut graph, &registry, None, &[], 8).unwrap();
        assert_eq!(again, 0);
        assert_eq!(graph.node_count(), 5);
    }

    #[test]
    fn pass_limit_stops_expansion() {
        let registry = NodeRegistry::with_builtin_kinds();
        let mut graph = Graph::new();
        graph.add_node(make_node("oct", "Octaves")).unwrap();
        let n = amplify_graph(&mut graph, &registry, None, &[], 0).unwrap();
        assert_eq!(n, 0);
        assert_eq!(graph.node_count(), 1);
    }
}
