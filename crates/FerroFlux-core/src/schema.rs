//! The wire-format graph description: nodes, connections, and the
//! canonicalization used to derive cache keys.
//!
//! Every port instance carries a globally unique port ID (§3); connections
//! reference ports by ID rather than by `(node, port name)` pairs, and a
//! node's `inputs` map mixes two distinct things — option assignments and
//! input-port declarations — disambiguated at compile time against the
//! node's block template (§4.3 step 2).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in a node's `inputs`/`outputs` map: the port's wire-unique ID,
/// plus (for `inputs` only) an optional literal value — present when the
/// key names an option rather than a port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// One node in a schema: an instance of a registered block template. Each
/// key in `inputs` is either an option name (disambiguated by the Compiler
/// against the template) or a declared input port name; each key in
/// `outputs` is a declared output port name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, PortRef>,
    #[serde(default)]
    pub outputs: BTreeMap<String, PortRef>,
}

/// One directed edge, referencing both endpoints by port ID rather than by
/// node/port name (§6: `{id, from: portID, to: portID}`). Schemas may
/// declare more than one connection into the same input port (§3 multi-edge
/// note); the compiler keeps all of them rather than silently collapsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub id: String,
    pub from: String,
    pub to: String,
}

/// The full wire shape submitted to `EngineManager::acquire`/`acquire_sync`
/// and to `Compiler::compile` directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub nodes: Vec<NodeSpec>,
    pub connections: Vec<ConnectionSpec>,
}

impl Schema {
    /// Serializes to JSON with object keys sorted lexicographically at
    /// every level, so two schemas differing only in field order hash to
    /// the same cache key (§6 "Determinism").
    pub fn canonical_json(&self) -> String {
        let value = serde_json::to_value(self).expect("Schema serializes infallibly");
        canonicalize(&value).to_string()
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            serde_json::to_value(sorted).expect("sorted map serializes infallibly")
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_is_order_independent() {
        let a = Schema {
            nodes: vec![NodeSpec {
                id: "n1".into(),
                block_type: "add".into(),
                title: None,
                inputs: BTreeMap::from([
                    ("b".to_string(), PortRef { id: "p-b".into(), value: Some(Value::from(2)) }),
                    ("a".to_string(), PortRef { id: "p-a".into(), value: Some(Value::from(1)) }),
                ]),
                outputs: BTreeMap::new(),
            }],
            connections: vec![],
        };
        let b = Schema {
            nodes: vec![NodeSpec {
                id: "n1".into(),
                block_type: "add".into(),
                title: None,
                inputs: BTreeMap::from([
                    ("a".to_string(), PortRef { id: "p-a".into(), value: Some(Value::from(1)) }),
                    ("b".to_string(), PortRef { id: "p-b".into(), value: Some(Value::from(2)) }),
                ]),
                outputs: BTreeMap::new(),
            }],
            connections: vec![],
        };
        assert_eq!(a.canonical_json(), b.canonical_json());
    }
}
