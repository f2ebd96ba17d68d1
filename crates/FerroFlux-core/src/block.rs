//! The block abstraction: templates, instances, ports, and options.
//!
//! A template is a factory (`spawn() -> Instance`), not a value an instance
//! is cloned from — an instance owns its port/option state by value, so
//! there is nothing to deep-copy and no closures to fight the borrow checker
//! over (see DESIGN.md, "Deep copy of templates").

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ComputeFailure;

/// The value carried on a port at runtime. Kept as a thin, typed wrapper
/// around `serde_json::Value` rather than a bare `Value` so built-in blocks
/// get a checked path for the common `{x, y}` series shape while custom
/// blocks can still stash arbitrary `data`/`meta`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Signal {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Signal { kind: kind.into(), data, meta: None }
    }

    /// A `{x: [...], y: [...]}` series, the shape used throughout §8's
    /// worked examples.
    pub fn series(x: Vec<f64>, y: Vec<f64>) -> Self {
        Signal::new("series", serde_json::json!({ "x": x, "y": y }))
    }

    pub fn as_series(&self) -> Option<(Vec<f64>, Vec<f64>)> {
        let x = self.data.get("x")?.as_array()?;
        let y = self.data.get("y")?.as_array()?;
        let to_f64 = |v: &Value| v.as_f64();
        Some((
            x.iter().filter_map(to_f64).collect(),
            y.iter().filter_map(to_f64).collect(),
        ))
    }

    pub fn scalar(value: f64) -> Self {
        Signal::new("scalar", serde_json::json!(value))
    }

    pub fn as_scalar(&self) -> Option<f64> {
        self.data.as_f64()
    }
}

/// The kind of an option descriptor; drives clamping and export shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionKind {
    Button,
    Checkbox,
    Integer,
    Number,
    Slider,
    Select,
    Text,
    TextInput,
    TextareaInput,
}

/// A concrete option value. `Null` is only used for `Button` (which carries
/// no value).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

impl OptionValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OptionValue::Int(i) => Some(*i as f64),
            OptionValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// The static, template-level description of one option. Shared (not
/// cloned per-instance) via `Arc` inside [`BlockSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionDescriptor {
    pub name: String,
    pub kind: OptionKind,
    pub default: OptionValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<String>>,
}

impl OptionDescriptor {
    /// Clamps `value` to `[min, max]` when both the descriptor and the
    /// value are numeric (§3, §8 P10). Non-numeric values pass through.
    pub fn clamp(&self, value: OptionValue) -> OptionValue {
        let Some(v) = value.as_f64() else { return value };
        let mut v = v;
        if let Some(min) = self.min {
            v = v.max(min);
        }
        if let Some(max) = self.max {
            v = v.min(max);
        }
        match value {
            OptionValue::Int(_) => OptionValue::Int(v as i64),
            _ => OptionValue::Float(v),
        }
    }
}

/// The export shape for the external editor (§4.1 "export_config").
#[derive(Debug, Clone, Serialize)]
pub struct BlockConfig {
    pub name: String,
    pub inputs: Vec<PortDescriptor>,
    pub outputs: Vec<PortDescriptor>,
    pub options: Vec<OptionExport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortDescriptor {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionExport {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: OptionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<OptionValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "properties")]
    pub properties: Option<OptionProperties>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionProperties {
    pub items: Vec<String>,
}

/// The static shape of a block: its declared ports and options. Built once
/// via [`BlockSpecBuilder`] and shared by every instance spawned from the
/// same template.
#[derive(Debug, Clone)]
pub struct BlockSpec {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub options: Vec<OptionDescriptor>,
}

impl BlockSpec {
    pub fn option(&self, name: &str) -> Option<&OptionDescriptor> {
        self.options.iter().find(|o| o.name == name)
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.option(name).is_some()
    }

    pub fn export_config(&self) -> BlockConfig {
        BlockConfig {
            name: self.name.clone(),
            inputs: self.inputs.iter().map(|n| PortDescriptor { name: n.clone() }).collect(),
            outputs: self.outputs.iter().map(|n| PortDescriptor { name: n.clone() }).collect(),
            options: self.options.iter().map(export_option).collect(),
        }
    }
}

fn export_option(opt: &OptionDescriptor) -> OptionExport {
    let value = if opt.kind == OptionKind::Button { None } else { Some(opt.default.clone()) };
    let items = if opt.kind == OptionKind::Select { opt.items.clone() } else { None };
    let properties = items.clone().map(|items| OptionProperties { items });
    let (min, max) = match opt.kind {
        OptionKind::Integer | OptionKind::Number | OptionKind::Slider => (opt.min, opt.max),
        _ => (None, None),
    };
    OptionExport { name: opt.name.clone(), kind: opt.kind, value, items, properties, min, max }
}

/// Declares a block's ports and options at template-construction time.
/// Mirrors the Python `Block.add_*` methods one-for-one.
#[derive(Default)]
pub struct BlockSpecBuilder {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    options: Vec<OptionDescriptor>,
}

impl BlockSpecBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        BlockSpecBuilder { name: name.into(), ..Default::default() }
    }

    pub fn add_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn add_output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn add_button_option(mut self, name: impl Into<String>) -> Self {
        self.options.push(OptionDescriptor {
            name: name.into(),
            kind: OptionKind::Button,
            default: OptionValue::Null,
            min: None,
            max: None,
            items: None,
        });
        self
    }

    pub fn add_checkbox_option(mut self, name: impl Into<String>, default: bool) -> Self {
        self.options.push(OptionDescriptor {
            name: name.into(),
            kind: OptionKind::Checkbox,
            default: OptionValue::Bool(default),
            min: None,
            max: None,
            items: None,
        });
        self
    }

    pub fn add_integer_option(
        mut self,
        name: impl Into<String>,
        default: i64,
        min: Option<i64>,
        max: Option<i64>,
    ) -> Self {
        self.options.push(OptionDescriptor {
            name: name.into(),
            kind: OptionKind::Integer,
            default: OptionValue::Int(default),
            min: min.map(|v| v as f64),
            max: max.map(|v| v as f64),
            items: None,
        });
        self
    }

    pub fn add_number_option(
        mut self,
        name: impl Into<String>,
        default: f64,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Self {
        self.options.push(OptionDescriptor {
            name: name.into(),
            kind: OptionKind::Number,
            default: OptionValue::Float(default),
            min,
            max,
            items: None,
        });
        self
    }

    pub fn add_slider_option(
        mut self,
        name: impl Into<String>,
        default: f64,
        min: f64,
        max: f64,
    ) -> Self {
        self.options.push(OptionDescriptor {
            name: name.into(),
            kind: OptionKind::Slider,
            default: OptionValue::Float(default),
            min: Some(min),
            max: Some(max),
            items: None,
        });
        self
    }

    pub fn add_select_option(
        mut self,
        name: impl Into<String>,
        items: Vec<String>,
        default: Option<String>,
    ) -> Self {
        let value = default.or_else(|| items.first().cloned()).unwrap_or_default();
        self.options.push(OptionDescriptor {
            name: name.into(),
            kind: OptionKind::Select,
            default: OptionValue::Text(value),
            min: None,
            max: None,
            items: Some(items),
        });
        self
    }

    pub fn add_text_option(mut self, name: impl Into<String>, default: impl Into<String>) -> Self {
        self.options.push(OptionDescriptor {
            name: name.into(),
            kind: OptionKind::Text,
            default: OptionValue::Text(default.into()),
            min: None,
            max: None,
            items: None,
        });
        self
    }

    pub fn add_text_input_option(
        mut self,
        name: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        self.options.push(OptionDescriptor {
            name: name.into(),
            kind: OptionKind::TextInput,
            default: OptionValue::Text(default.into()),
            min: None,
            max: None,
            items: None,
        });
        self
    }

    pub fn add_textarea_input_option(
        mut self,
        name: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        self.options.push(OptionDescriptor {
            name: name.into(),
            kind: OptionKind::TextareaInput,
            default: OptionValue::Text(default.into()),
            min: None,
            max: None,
            items: None,
        });
        self
    }

    pub fn build(self) -> BlockSpec {
        BlockSpec {
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            options: self.options,
        }
    }
}

/// Context handed to a block's compute call. Carries nothing the block
/// needs to mutate; it is read-only identification plus plumbing for
/// cancellation-aware blocks (§5, §9 Open Questions: `async_run` needs
/// explicit context/cancellation, not an omission).
#[derive(Debug, Clone)]
pub struct ComputeContext {
    pub instance_id: String,
    pub execution_id: uuid::Uuid,
    pub cancellation: tokio_util::sync::CancellationToken,
}

type AsyncComputeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), ComputeFailure>> + Send + 'a>>;

/// A live, per-run copy of a block's state: its own input/output port
/// buffers and its own option values (overlaid from the schema at compile
/// time). Produced only by [`BlockTemplate::spawn`].
pub trait BlockInstance: Send + 'static {
    fn instance_id(&self) -> &str;
    fn set_instance_id(&mut self, id: String);

    fn get_interface(&self, name: &str) -> Option<&Signal>;
    fn set_interface(&mut self, name: &str, value: Signal);

    /// Reads the current value of an output port. Called by the executor to
    /// carry out a transfer; distinct from [`BlockInstance::get_interface`],
    /// which reads an *input* port from the block's own perspective.
    fn get_output(&self, name: &str) -> Option<&Signal>;

    /// Writes a transferred value onto an input port. Called by the
    /// executor, never by the block itself.
    fn set_input(&mut self, name: &str, value: Signal);

    fn get_option(&self, name: &str) -> Option<&OptionValue>;
    fn set_option(&mut self, name: &str, value: OptionValue);

    fn on_compute(&mut self, ctx: &ComputeContext) -> Result<(), ComputeFailure>;

    /// Default: a synchronous passthrough. Blocks doing genuine I/O should
    /// override this and also override [`BlockInstance::is_native_async`].
    /// The executor decides *how* to invoke this method (offloaded to the
    /// blocking-worker pool, or run inline) based on that flag — see
    /// `executor.rs` and DESIGN.md.
    fn async_on_compute<'a>(&'a mut self, ctx: &'a ComputeContext) -> AsyncComputeFuture<'a> {
        Box::pin(async move { self.on_compute(ctx) })
    }

    /// Clears input/output port buffers; leaves options and wiring intact
    /// (§3 Lifecycle, §8 P5).
    fn reset(&mut self);

    /// Whether `async_on_compute` already performs real non-blocking async
    /// I/O and should run inline on the cooperative scheduler rather than
    /// be shuttled to the blocking-worker pool. Default: `false`.
    fn is_native_async(&self) -> bool {
        false
    }
}

/// A named prototype: declared ports/options plus a factory producing
/// independent instances. Read-only once registered (§3 I4).
pub struct BlockTemplate {
    spec: BlockSpec,
    factory: Box<dyn Fn(&BlockSpec) -> Box<dyn BlockInstance> + Send + Sync>,
}

impl BlockTemplate {
    pub fn new(
        spec: BlockSpec,
        factory: impl Fn(&BlockSpec) -> Box<dyn BlockInstance> + Send + Sync + 'static,
    ) -> Self {
        BlockTemplate { spec, factory: Box::new(factory) }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    pub fn export_config(&self) -> BlockConfig {
        self.spec.export_config()
    }

    /// Produces a fresh, independent instance with options overlaid from
    /// the spec's defaults. Callers overlay schema-provided values via
    /// `set_option` afterwards (done by the compiler).
    pub fn spawn(&self) -> Box<dyn BlockInstance> {
        (self.factory)(&self.spec)
    }
}

/// A generic instance storage backing most simple blocks: a
/// `HashMap`-based port/option store plus a user compute closure. Blocks
/// with no special state can use this instead of writing a bespoke
/// `BlockInstance` impl.
pub struct GenericInstance {
    instance_id: String,
    spec: BlockSpec,
    inputs: HashMap<String, Option<Signal>>,
    outputs: HashMap<String, Option<Signal>>,
    options: HashMap<String, OptionValue>,
    compute: Box<dyn FnMut(&mut GenericInstanceIo, &ComputeContext) -> Result<(), ComputeFailure> + Send>,
}

/// The narrow view of a [`GenericInstance`] exposed to its compute closure;
/// keeps the closure's signature from needing to see the whole instance.
pub struct GenericInstanceIo<'a> {
    pub inputs: &'a HashMap<String, Option<Signal>>,
    pub outputs: &'a mut HashMap<String, Option<Signal>>,
    pub options: &'a HashMap<String, OptionValue>,
}

impl<'a> GenericInstanceIo<'a> {
    pub fn input(&self, name: &str) -> Option<&Signal> {
        self.inputs.get(name).and_then(|v| v.as_ref())
    }

    pub fn set_output(&mut self, name: &str, value: Signal) {
        self.outputs.insert(name.to_string(), Some(value));
    }

    pub fn option(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }
}

impl GenericInstance {
    pub fn new(
        spec: BlockSpec,
        compute: impl FnMut(&mut GenericInstanceIo, &ComputeContext) -> Result<(), ComputeFailure>
            + Send
            + 'static,
    ) -> Self {
        let inputs = spec.inputs.iter().map(|n| (n.clone(), None)).collect();
        let outputs = spec.outputs.iter().map(|n| (n.clone(), None)).collect();
        let options = spec.options.iter().map(|o| (o.name.clone(), o.default.clone())).collect();
        GenericInstance {
            instance_id: String::new(),
            spec,
            inputs,
            outputs,
            options,
            compute: Box::new(compute),
        }
    }

    /// Builds a [`BlockTemplate`] whose factory spawns fresh `GenericInstance`s,
    /// calling `make_compute` once per spawn to produce an independent
    /// compute closure (so per-instance captured state, if any, is never
    /// shared across instances).
    pub fn template<F, C>(spec: BlockSpec, make_compute: F) -> BlockTemplate
    where
        F: Fn() -> C + Send + Sync + 'static,
        C: FnMut(&mut GenericInstanceIo, &ComputeContext) -> Result<(), ComputeFailure>
            + Send
            + 'static,
    {
        BlockTemplate::new(spec, move |spec| {
            Box::new(GenericInstance::new(spec.clone(), make_compute()))
        })
    }
}

impl BlockInstance for GenericInstance {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn set_instance_id(&mut self, id: String) {
        self.instance_id = id;
    }

    fn get_interface(&self, name: &str) -> Option<&Signal> {
        self.inputs.get(name).and_then(|v| v.as_ref())
    }

    fn set_interface(&mut self, name: &str, value: Signal) {
        self.outputs.insert(name.to_string(), Some(value));
    }

    fn get_output(&self, name: &str) -> Option<&Signal> {
        self.outputs.get(name).and_then(|v| v.as_ref())
    }

    fn set_input(&mut self, name: &str, value: Signal) {
        self.inputs.insert(name.to_string(), Some(value));
    }

    fn get_option(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }

    fn set_option(&mut self, name: &str, value: OptionValue) {
        let clamped = match self.spec.option(name) {
            Some(desc) => desc.clamp(value),
            None => value,
        };
        self.options.insert(name.to_string(), clamped);
    }

    fn on_compute(&mut self, ctx: &ComputeContext) -> Result<(), ComputeFailure> {
        let mut io = GenericInstanceIo {
            inputs: &self.inputs,
            outputs: &mut self.outputs,
            options: &self.options,
        };
        (self.compute)(&mut io, ctx)
    }

    fn reset(&mut self) {
        for v in self.inputs.values_mut() {
            *v = None;
        }
        for v in self.outputs.values_mut() {
            *v = None;
        }
    }
}

/// Writes a transferred value onto a destination port. A thin wrapper so
/// call sites in the compiler/executor read as an action rather than a
/// trait-method poke.
pub fn transfer_value(dst: &mut dyn BlockInstance, dst_port: &str, value: Signal) {
    dst.set_input(dst_port, value);
}

struct NoopInstance;

impl BlockInstance for NoopInstance {
    fn instance_id(&self) -> &str {
        ""
    }
    fn set_instance_id(&mut self, _id: String) {}
    fn get_interface(&self, _name: &str) -> Option<&Signal> {
        None
    }
    fn set_interface(&mut self, _name: &str, _value: Signal) {}
    fn get_output(&self, _name: &str) -> Option<&Signal> {
        None
    }
    fn set_input(&mut self, _name: &str, _value: Signal) {}
    fn get_option(&self, _name: &str) -> Option<&OptionValue> {
        None
    }
    fn set_option(&mut self, _name: &str, _value: OptionValue) {}
    fn on_compute(&mut self, _ctx: &ComputeContext) -> Result<(), ComputeFailure> {
        Ok(())
    }
    fn reset(&mut self) {}
}

/// A placeholder used only to fill a slot while its real instance has been
/// temporarily moved out for the duration of an offloaded compute call; it
/// is never itself computed.
pub fn noop_instance() -> Box<dyn BlockInstance> {
    Box::new(NoopInstance)
}
