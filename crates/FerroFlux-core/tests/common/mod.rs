//! Shared test blocks for the end-to-end scenarios in §8 of the spec this
//! crate implements: a handful of tiny, deterministic blocks wired together
//! through real `Schema`/`Compiler`/`Executor` plumbing rather than mocks.
//!
//! Each test binary only draws on a subset of these, so the rest are
//! legitimately unused from that binary's point of view.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use ferroflux_core::{
    BlockRegistry, BlockSpecBuilder, BlockTemplate, ComputeFailure, ConnectionSpec, GenericInstance,
    NodeSpec, PortRef, Signal,
};

/// `Const`: no inputs, option `value` (clamped `Integer`), output `O` is
/// that value as a scalar.
pub fn const_block() -> BlockTemplate {
    let spec = BlockSpecBuilder::new("Const")
        .add_output("O")
        .add_integer_option("value", 0, Some(i64::MIN), Some(i64::MAX))
        .build();
    GenericInstance::template(spec, || {
        |io: &mut ferroflux_core::GenericInstanceIo, _ctx: &ferroflux_core::ComputeContext| {
            let value = io.option("value").and_then(|v| v.as_f64()).unwrap_or(0.0);
            io.set_output("O", Signal::scalar(value));
            Ok(())
        }
    })
}

/// `AddOne`: input `I`, output `O = I + 1`.
pub fn add_one_block() -> BlockTemplate {
    let spec = BlockSpecBuilder::new("AddOne").add_input("I").add_output("O").build();
    GenericInstance::template(spec, || {
        |io: &mut ferroflux_core::GenericInstanceIo, _ctx: &ferroflux_core::ComputeContext| {
            let v = io.input("I").and_then(Signal::as_scalar).ok_or_else(|| {
                ComputeFailure::msg("AddOne requires input I")
            })?;
            io.set_output("O", Signal::scalar(v + 1.0));
            Ok(())
        }
    })
}

/// `Pair`: inputs `A`, `B`, output `O = A + B`. Used for the multi-edge
/// scenario, where both connections target this block's two inputs.
pub fn pair_block() -> BlockTemplate {
    let spec = BlockSpecBuilder::new("Pair").add_input("A").add_input("B").add_output("O").build();
    GenericInstance::template(spec, || {
        |io: &mut ferroflux_core::GenericInstanceIo, _ctx: &ferroflux_core::ComputeContext| {
            let a = io.input("A").and_then(Signal::as_scalar).unwrap_or(0.0);
            let b = io.input("B").and_then(Signal::as_scalar).unwrap_or(0.0);
            io.set_output("O", Signal::scalar(a + b));
            Ok(())
        }
    })
}

/// `Source`: no inputs, constant series output `O`.
pub fn source_block(values: Vec<f64>) -> BlockTemplate {
    let spec = BlockSpecBuilder::new("Source").add_output("O").build();
    GenericInstance::template(spec, move || {
        let values = values.clone();
        move |io: &mut ferroflux_core::GenericInstanceIo, _ctx: &ferroflux_core::ComputeContext| {
            io.set_output("O", Signal::series(values.clone(), vec![0.0; values.len()]));
            Ok(())
        }
    })
}

/// `Scale`: input `I`, option `k`, output `O` is `I` scaled element-wise by
/// `k`.
pub fn scale_block() -> BlockTemplate {
    let spec = BlockSpecBuilder::new("Scale")
        .add_input("I")
        .add_output("O")
        .add_number_option("k", 1.0, None, None)
        .build();
    GenericInstance::template(spec, || {
        |io: &mut ferroflux_core::GenericInstanceIo, _ctx: &ferroflux_core::ComputeContext| {
            let k = io.option("k").and_then(|v| v.as_f64()).unwrap_or(1.0);
            let (x, _) = io.input("I").and_then(Signal::as_series).unwrap_or_default();
            let scaled: Vec<f64> = x.iter().map(|v| v * k).collect();
            io.set_output("O", Signal::series(scaled.clone(), vec![0.0; scaled.len()]));
            Ok(())
        }
    })
}

/// `Zip`: inputs `A`, `B`, output `O` is the JSON array of `[a, b]` pairs.
pub fn zip_block() -> BlockTemplate {
    let spec = BlockSpecBuilder::new("Zip").add_input("A").add_input("B").add_output("O").build();
    GenericInstance::template(spec, || {
        |io: &mut ferroflux_core::GenericInstanceIo, _ctx: &ferroflux_core::ComputeContext| {
            let (a, _) = io.input("A").and_then(Signal::as_series).unwrap_or_default();
            let (b, _) = io.input("B").and_then(Signal::as_series).unwrap_or_default();
            let pairs: Vec<_> = a.iter().zip(b.iter()).map(|(x, y)| serde_json::json!([x, y])).collect();
            io.set_output("O", Signal::new("pairs", serde_json::Value::Array(pairs)));
            Ok(())
        }
    })
}

/// `Collect`: input `I`, records every value it observes into a shared
/// collector rather than an output port — the sink pattern §5 describes as
/// the only legitimate form of cross-node shared mutable state.
pub fn collect_block(sink: Arc<Mutex<Vec<Signal>>>) -> BlockTemplate {
    let spec = BlockSpecBuilder::new("Collect").add_input("I").build();
    GenericInstance::template(spec, move || {
        let sink = sink.clone();
        move |io: &mut ferroflux_core::GenericInstanceIo, _ctx: &ferroflux_core::ComputeContext| {
            if let Some(v) = io.input("I") {
                sink.lock().unwrap().push(v.clone());
            }
            Ok(())
        }
    })
}

pub fn registry_with(templates: Vec<BlockTemplate>) -> BlockRegistry {
    let mut registry = BlockRegistry::new();
    for t in templates {
        registry.register(t);
    }
    registry
}

/// The declared input/output port names for each block used across the
/// test suite, so `node`/`node_with` can mint port IDs without every call
/// site having to spell out its own block's ports.
fn ports_for(block_type: &str) -> (&'static [&'static str], &'static [&'static str]) {
    match block_type {
        "Const" => (&[], &["O"]),
        "AddOne" => (&["I"], &["O"]),
        "Pair" => (&["A", "B"], &["O"]),
        "Source" => (&[], &["O"]),
        "Scale" => (&["I"], &["O"]),
        "Zip" => (&["A", "B"], &["O"]),
        "Collect" => (&["I"], &[]),
        "Counted" => (&[], &["O"]),
        _ => (&[], &[]),
    }
}

/// Mints a port ID for `node`'s `port`, globally unique by construction
/// since it's namespaced by the owning node's own id.
fn port_id(node: &str, port: &str) -> String {
    format!("{node}:{port}")
}

/// Builds a node with no option overrides, declaring the ports its block
/// type is known to have (§3, §4.3 step 2).
pub fn node(id: &str, block_type: &str) -> NodeSpec {
    node_with(id, block_type, &[])
}

/// Builds a node with option overrides mixed into its `inputs` map
/// alongside its declared input ports, exactly as the wire format does —
/// the Compiler tells them apart by checking the block template's option
/// names.
pub fn node_with(id: &str, block_type: &str, options: &[(&str, serde_json::Value)]) -> NodeSpec {
    let (inputs, outputs) = ports_for(block_type);
    let mut input_map: BTreeMap<String, PortRef> = inputs
        .iter()
        .map(|p| (p.to_string(), PortRef { id: port_id(id, p), value: None }))
        .collect();
    for (key, value) in options {
        input_map.insert(key.to_string(), PortRef { id: port_id(id, &format!("opt:{key}")), value: Some(value.clone()) });
    }
    NodeSpec {
        id: id.into(),
        block_type: block_type.into(),
        title: None,
        inputs: input_map,
        outputs: outputs
            .iter()
            .map(|p| (p.to_string(), PortRef { id: port_id(id, p), value: None }))
            .collect(),
    }
}

/// Builds a connection referencing both endpoints by the port IDs
/// `node`/`node_with` minted for them.
pub fn conn(id: &str, from_node: &str, from_port: &str, to_node: &str, to_port: &str) -> ConnectionSpec {
    ConnectionSpec { id: id.into(), from: port_id(from_node, from_port), to: port_id(to_node, to_port) }
}
