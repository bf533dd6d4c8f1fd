// eval/macros.rs — amplifier node kinds
//
// Macros expand into ordinary nodes before evaluation and then simply
// forward what the expansion produced on `Input` to `Value`.
//
//   Octaves  — N Noise nodes summed by a Combine, frequency × lacunarity and
//              amplitude × gain per octave
//   Subgraph — a named graph from the library, cloned in place

use crate::error::{EngineError, Result};
use crate::eval::amplify::{collect_all_nodes, requester_for, AmplifyScope};
use crate::eval::graph::NodeDefinition;
use crate::eval::node::{NodeContext, NodeCore, NodeKind, NodeProcessor, NodeRegistry};
use crate::eval::ports::{PortData, PortSpec};
use log::debug;
use serde_json::json;
use std::sync::Arc;

pub(crate) fn register(registry: &mut NodeRegistry) {
    registry.register(Arc::new(OctavesKind));
    registry.register(Arc::new(SubgraphKind));
}

const INPUT: &[PortSpec] = &[PortSpec::single("Input")];
const VALUE: &[PortSpec] = &[PortSpec::single("Value")];

struct Forward;

impl NodeProcessor for Forward {
    fn process(&mut self, core: &mut NodeCore, _ctx: &mut NodeContext<'_>) -> Result<bool> {
        if let Some(value) = core.input("Input").cloned() {
            core.set_output("Value", value);
        }
        Ok(true)
    }
}

// ── Octaves ─────────────────────────────────────────────────────────

struct OctavesKind;

impl NodeKind for OctavesKind {
    fn type_name(&self) -> &'static str {
        "Octaves"
    }

    fn inputs(&self) -> &'static [PortSpec] {
        INPUT
    }

    fn outputs(&self) -> &'static [PortSpec] {
        VALUE
    }

    fn create(&self, _def: &NodeDefinition) -> Box<dyn NodeProcessor> {
        Box::new(Forward)
    }

    fn is_amplifier(&self) -> bool {
        true
    }

    fn amplify(&self, def: &NodeDefinition, scope: &mut AmplifyScope<'_>) -> Result<()> {
        let octaves = def.field_u32("Octaves", 4);
        if octaves == 0 {
            return Err(EngineError::invalid_field(def.guid(), "Octaves", "must be at least 1"));
        }
        let mut frequency = def.field_f64("Frequency", 0.01);
        let mut amplitude = def.field_f64("Amplitude", 1.0);
        let seed = def.field_i64("Seed", 0);
        let lacunarity = def.field_f64("Lacunarity", 2.0);
        let gain = def.field_f64("Gain", 0.5);

        let sum = scope.add_node(
            NodeDefinition::new(def.guid().derived("sum"), "Combine")
                .with_field("Operation", json!("Sum")),
        )?;
        for i in 0..octaves {
            let noise = scope.add_node(
                NodeDefinition::new(def.guid().derived(&format!("octave/{i}")), "Noise")
                    .with_field("Frequency", json!(frequency))
                    .with_field("Amplitude", json!(amplitude))
                    .with_field("Seed", json!(seed + i as i64)),
            )?;
            scope.connect(
                PortData::new(noise, "Value"),
                PortData::list_item(sum.clone(), "Inputs", i),
            )?;
            frequency *= lacunarity;
            amplitude *= gain;
        }
        scope.connect(
            PortData::new(sum, "Value"),
            PortData::new(def.guid().clone(), "Input"),
        )?;
        debug!("{}: expanded into {octaves} octaves", def.guid());
        Ok(())
    }
}

// ── Subgraph ────────────────────────────────────────────────────────

struct SubgraphKind;

impl NodeKind for SubgraphKind {
    fn type_name(&self) -> &'static str {
        "Subgraph"
    }

    fn inputs(&self) -> &'static [PortSpec] {
        INPUT
    }

    fn outputs(&self) -> &'static [PortSpec] {
        VALUE
    }

    fn create(&self, _def: &NodeDefinition) -> Box<dyn NodeProcessor> {
        Box::new(Forward)
    }

    fn is_amplifier(&self) -> bool {
        true
    }

    /// Embeds the library graph named by `Graph`. When the embedded graph
    /// ends in an `Output` node, only what feeds that node is cloned, so the
    /// host graph does not gain a second `Output`.
    fn amplify(&self, def: &NodeDefinition, scope: &mut AmplifyScope<'_>) -> Result<()> {
        let name = def.field_str("Graph", "");
        let library = scope
            .library()
            .ok_or_else(|| EngineError::Asset(format!("{}: no graph library to resolve '{name}'", def.guid())))?;
        let base = library
            .graph(name)
            .ok_or_else(|| EngineError::Asset(format!("{}: unknown graph '{name}'", def.guid())))?;
        let root = base
            .output_nodes()
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Asset(format!("graph '{name}' is empty")))?;
        let requester = requester_for(def.guid());

        let is_output = base.node(&root).is_some_and(|d| d.kind() == "Output");
        let feeder = if is_output {
            let source = base
                .source_of(&PortData::new(root.clone(), "Input"))
                .cloned()
                .ok_or_else(|| EngineError::missing_input(&root, "Input"))?;
            let (nodes, edges) = collect_all_nodes(&base, &root, "Input");
            let cloned = scope.copy_subgraph(&base, &nodes, &edges, requester)?;
            cloned
                .clone_of(&source.node)
                .map(|copy| source.on_node(copy.clone()))
        } else {
            let cloned = scope.copy_full_graph(&base, requester)?;
            match cloned.clone_of(&root) {
                Some(copy) => Some(PortData::new(copy.clone(), scope.default_output(copy)?)),
                None => None,
            }
        };

        let Some(output) = feeder else {
            return Err(EngineError::Asset(format!("graph '{name}' has nothing to embed")));
        };
        scope.connect(output, PortData::new(def.guid().clone(), "Input"))?;
        debug!("{}: embedded graph '{name}'", def.guid());
        Ok(())
    }
}
