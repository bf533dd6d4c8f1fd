// eval/ports.rs — port addressing and edge connections
//
// A `PortData` addresses one slot on one node: a scalar port ("Input"), an
// item of a list port ("Inputs[2]") or the append slot of a list port
// ("Inputs[]"). Equality and hashing are structural over all five fields, so
// two addresses that differ only in a flag are different ports.

use crate::eval::graph::NodeGuid;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortData {
    pub node: NodeGuid,
    pub field: Arc<str>,
    pub list_index: Option<u32>,
    pub is_rearrangable_list_item: bool,
    pub is_list_append_slot: bool,
}

impl PortData {
    /// A scalar port.
    pub fn new(node: NodeGuid, field: &str) -> Self {
        PortData {
            node,
            field: field.into(),
            list_index: None,
            is_rearrangable_list_item: false,
            is_list_append_slot: false,
        }
    }

    /// An item of a list port.
    pub fn list_item(node: NodeGuid, field: &str, index: u32) -> Self {
        PortData {
            node,
            field: field.into(),
            list_index: Some(index),
            is_rearrangable_list_item: true,
            is_list_append_slot: false,
        }
    }

    /// The "add another connection" slot of a list port.
    pub fn append_slot(node: NodeGuid, field: &str) -> Self {
        PortData {
            node,
            field: field.into(),
            list_index: None,
            is_rearrangable_list_item: false,
            is_list_append_slot: true,
        }
    }

    /// Same field and flags on another node. Used when rewiring clones.
    pub fn on_node(&self, node: NodeGuid) -> Self {
        PortData {
            node,
            ..self.clone()
        }
    }

    /// Same node and list slot, different field name.
    pub fn with_field(&self, field: &str) -> Self {
        PortData {
            field: field.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for PortData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.field)?;
        match (self.list_index, self.is_list_append_slot) {
            (Some(i), _) => write!(f, "[{i}]"),
            (None, true) => f.write_str("[]"),
            (None, false) => Ok(()),
        }
    }
}

impl fmt::Debug for PortData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PortData({self})")
    }
}

/// An ordered (output → input) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeConnection {
    pub output: PortData,
    pub input: PortData,
}

impl EdgeConnection {
    pub fn new(output: PortData, input: PortData) -> Self {
        EdgeConnection { output, input }
    }
}

// ── Declared ports ──────────────────────────────────────────────────

/// How the engine resolves an input before the node's own processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    /// Pulled in the node's own branch during `SettingInputValues`.
    Eager,
    /// Left to the node, which pulls it itself (typically in a derived
    /// branch at another resolution or tile).
    Deferred,
}

/// Declaration of one port on a node kind.
#[derive(Debug, Clone, Copy)]
pub struct PortSpec {
    pub name: &'static str,
    pub list: bool,
    pub required: bool,
    pub resolve: Resolve,
}

impl PortSpec {
    pub const fn single(name: &'static str) -> Self {
        PortSpec {
            name,
            list: false,
            required: true,
            resolve: Resolve::Eager,
        }
    }

    pub const fn list(name: &'static str) -> Self {
        PortSpec {
            list: true,
            required: false,
            ..PortSpec::single(name)
        }
    }

    pub const fn deferred(name: &'static str) -> Self {
        PortSpec {
            resolve: Resolve::Deferred,
            ..PortSpec::single(name)
        }
    }
}

// ── Handle parsing ──────────────────────────────────────────────────

/// Parse an asset handle into a port on `node`:
/// - `"Input"`     → scalar port
/// - `"Inputs[3]"` → list item 3
/// - `"Inputs[]"`  → append slot
///
/// Anything with malformed brackets is treated as a scalar port name.
pub fn parse_handle(node: NodeGuid, handle: &str) -> PortData {
    if let Some(open) = handle.find('[') {
        if let Some(inner) = handle[open + 1..].strip_suffix(']') {
            let field = &handle[..open];
            if inner.is_empty() {
                return PortData::append_slot(node, field);
            }
            if let Ok(idx) = inner.parse::<u32>() {
                return PortData::list_item(node, field, idx);
            }
        }
    }
    PortData::new(node, handle)
}
