//! The block library: a name-keyed set of registered templates, used both
//! as the process-wide built-in set and as a per-business override set
//! (§3, §6 "registered per business").

use std::collections::HashMap;

use serde_json::Value;

use crate::block::{BlockConfig, BlockTemplate, OptionValue};

/// Holds templates by name. Construction-time only: once built, a registry
/// is read by many concurrent compiles and never mutated (§3 I4 — template
/// immutability extends to the set of registered templates during a run).
#[derive(Default)]
pub struct BlockRegistry {
    templates: HashMap<String, BlockTemplate>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        BlockRegistry::default()
    }

    pub fn register(&mut self, template: BlockTemplate) {
        self.templates.insert(template.name().to_string(), template);
    }

    pub fn get(&self, name: &str) -> Option<&BlockTemplate> {
        self.templates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Full export of every registered block's config, the shape the
    /// external editor consumes (§4.1, §9 "external editor" boundary —
    /// the crate only produces this data, it does not render it).
    pub fn export_all(&self) -> Vec<BlockConfig> {
        let mut configs: Vec<_> = self.templates.values().map(|t| t.export_config()).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Converts a JSON option override from a schema node into a typed
/// [`OptionValue`]. Unrepresentable shapes (arrays, objects) are dropped
/// silently — the compiler does not fail compilation over a malformed
/// option override, matching its stance on unknown blocks/dangling
/// connections (§7).
pub fn option_value_from_json(value: &Value) -> Option<OptionValue> {
    match value {
        Value::Bool(b) => Some(OptionValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(OptionValue::Int(i))
            } else {
                n.as_f64().map(OptionValue::Float)
            }
        }
        Value::String(s) => Some(OptionValue::Text(s.clone())),
        Value::Null => Some(OptionValue::Null),
        Value::Array(_) | Value::Object(_) => None,
    }
}
