//! Node lifecycle: declaration, unit construction, binding, disposal
//!
//! Every remote-declared audio node is a tagged [`NodeKind`] plus the shared
//! lifecycle state in [`Node`]. Kind-specific behavior (engine class, method
//! surface, asynchronous construction) hangs off the tag; the lifecycle
//! operations are free functions over the store because binding and disposal
//! walk sub-entities.

use serde_json::Value;
use tracing::debug;

use crate::backend::{AudioBackend, ParamHandle, UnitHandle, UnitSpec};
use crate::error::{Result, SyncError};
use crate::model::{ModelStore, UpdateBuffer};
use crate::protocol::{Edge, EntityId};

/// Where one connectable side of a node lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRef {
    /// Not connectable on this side.
    None,
    /// Delegated to another synchronized entity (sub-node or parameter).
    Entity(EntityId),
    /// The node's own live unit.
    Unit(UnitHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalConfig {
    /// Unit kind tag of the carried value ("number", "frequency", ...).
    pub units: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            units: "number".to_string(),
        }
    }
}

/// Declared node kinds, one tag per engine class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Oscillator,
    Gain,
    Volume,
    Filter,
    /// Built asynchronously: the engine generates its impulse response
    /// before the unit becomes usable.
    Reverb,
    Synth,
    Meter,
    Destination,
    /// Scalar signal; connections into it target its value parameter.
    Signal(SignalConfig),
    /// Declared kinds with no engine counterpart.
    Internal { class: String },
}

impl NodeKind {
    /// Map a declared kind string. Unrecognized kinds become [`Internal`]
    /// and fail at unit-construction time, not at declaration time.
    ///
    /// [`Internal`]: NodeKind::Internal
    pub fn from_decl(kind: &str) -> NodeKind {
        match kind {
            "Oscillator" => NodeKind::Oscillator,
            "Gain" => NodeKind::Gain,
            "Volume" => NodeKind::Volume,
            "Filter" => NodeKind::Filter,
            "Reverb" => NodeKind::Reverb,
            "Synth" => NodeKind::Synth,
            "Meter" => NodeKind::Meter,
            "Destination" => NodeKind::Destination,
            "Signal" => NodeKind::Signal(SignalConfig::default()),
            other => NodeKind::Internal {
                class: other.to_string(),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NodeKind::Oscillator => "Oscillator",
            NodeKind::Gain => "Gain",
            NodeKind::Volume => "Volume",
            NodeKind::Filter => "Filter",
            NodeKind::Reverb => "Reverb",
            NodeKind::Synth => "Synth",
            NodeKind::Meter => "Meter",
            NodeKind::Destination => "Destination",
            NodeKind::Signal(_) => "Signal",
            NodeKind::Internal { class } => class,
        }
    }

    /// Engine class to construct, or `None` for kinds without a unit.
    pub fn engine_class(&self) -> Option<&str> {
        match self {
            NodeKind::Internal { .. } => None,
            other => Some(other.name()),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, NodeKind::Reverb)
    }

    /// Methods a trigger or scheduled step may invoke on this kind.
    pub fn allowed_methods(&self) -> &'static [&'static str] {
        match self {
            NodeKind::Synth => &["triggerAttack", "triggerRelease", "triggerAttackRelease"],
            NodeKind::Oscillator => &["start", "stop"],
            _ => &[],
        }
    }
}

/// Lifecycle state of one declared node.
pub struct Node {
    pub id: EntityId,
    pub kind: NodeKind,
    /// Construction options forwarded to the engine (and re-used by
    /// [`replace_unit`]).
    pub options: Value,
    /// Whether this node owns its unit. Sub-nodes borrow a slice of the
    /// parent's unit and never dispose it themselves.
    pub creates_unit: bool,
    pub unit: Option<UnitHandle>,
    pub input: PortRef,
    pub output: PortRef,
    pub disposed: bool,
    /// Set while an asynchronous build is in flight. Edges touching the
    /// node queue in `pending_edges` until the engine reports readiness.
    pub under_construction: bool,
    pub pending_edges: Vec<Edge>,
    /// Parameter entities bound through this node's unit, keyed by the
    /// dotted engine path ("frequency", "oscillator.frequency").
    pub sub_params: Vec<(EntityId, String)>,
    /// Sub-node entities bound to named roles of this node's unit.
    pub sub_nodes: Vec<(EntityId, String)>,
}

impl Node {
    pub fn new(id: EntityId, kind: NodeKind, options: Value) -> Self {
        let creates_unit = kind.engine_class().is_some();
        Node {
            id,
            kind,
            options,
            creates_unit,
            unit: None,
            input: PortRef::None,
            output: PortRef::None,
            disposed: false,
            under_construction: false,
            pending_edges: Vec::new(),
            sub_params: Vec::new(),
            sub_nodes: Vec::new(),
        }
    }

    /// Validate a method name against this kind's surface.
    pub fn check_method(&self, method: &str) -> Result<()> {
        if self.kind.allowed_methods().contains(&method) {
            Ok(())
        } else {
            Err(SyncError::MethodNotAllowed {
                kind: self.kind.name().to_string(),
                method: method.to_string(),
            })
        }
    }

    pub fn live_unit(&self) -> Result<UnitHandle> {
        self.unit
            .ok_or_else(|| SyncError::Config(format!("node {} has no live unit", self.id)))
    }
}

/// Walk a dotted parameter path ("output.volume") through sub-units.
fn resolve_param_path(
    backend: &dyn AudioBackend,
    unit: UnitHandle,
    path: &str,
) -> Option<ParamHandle> {
    let mut current = unit;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            return backend.unit_param(current, segment);
        }
        current = backend.unit_sub(current, segment)?;
    }
    None
}

/// Construct the engine unit for a declared node. Asynchronous kinds come
/// back under construction; everything else is bound immediately.
pub fn instantiate(
    store: &mut ModelStore,
    backend: &mut dyn AudioBackend,
    id: &EntityId,
) -> Result<()> {
    let (class, options, is_async) = {
        let node = store.node(id)?;
        let class = node
            .kind
            .engine_class()
            .ok_or_else(|| SyncError::NotImplemented(node.kind.name().to_string()))?;
        (class.to_string(), node.options.clone(), node.kind.is_async())
    };

    let spec = UnitSpec::new(class, options);
    let unit = if is_async {
        backend.create_unit_async(&spec)?
    } else {
        backend.create_unit(&spec)?
    };

    let pending = is_async && !backend.unit_ready(unit);
    {
        let node = store.node_mut(id)?;
        node.unit = Some(unit);
        node.under_construction = pending;
    }
    if pending {
        debug!(node = %id, "unit under construction");
        return Ok(());
    }
    bind_unit(store, backend, id)
}

/// Wire a node's parameter bridges and sub-nodes to its live unit and clear
/// the under-construction flag. Re-run after a unit swap.
pub fn bind_unit(
    store: &mut ModelStore,
    backend: &mut dyn AudioBackend,
    id: &EntityId,
) -> Result<()> {
    let (unit, sub_params, sub_nodes) = {
        let node = store.node_mut(id)?;
        let unit = node.live_unit()?;
        node.under_construction = false;
        (unit, node.sub_params.clone(), node.sub_nodes.clone())
    };

    for (param_id, path) in sub_params {
        let handle = resolve_param_path(backend, unit, &path).ok_or_else(|| {
            SyncError::Config(format!("unit has no parameter at path: {}", path))
        })?;
        store.param_mut(&param_id)?.bind(backend, handle)?;
    }

    for (sub_id, role) in sub_nodes {
        let sub_unit = backend
            .unit_sub(unit, &role)
            .ok_or_else(|| SyncError::Config(format!("unit has no sub-component: {}", role)))?;
        store.node_mut(&sub_id)?.unit = Some(sub_unit);
        bind_unit(store, backend, &sub_id)?;
    }
    Ok(())
}

/// Swap a node's live unit for a freshly built one. The previous unit is
/// disposed; parameter bridges re-bind and push their declared values into
/// the replacement.
pub fn replace_unit(
    store: &mut ModelStore,
    backend: &mut dyn AudioBackend,
    id: &EntityId,
) -> Result<()> {
    let (class, options) = {
        let node = store.node(id)?;
        let class = node
            .kind
            .engine_class()
            .ok_or_else(|| SyncError::NotImplemented(node.kind.name().to_string()))?;
        (class.to_string(), node.options.clone())
    };

    let unit = backend.create_unit(&UnitSpec::new(class, options))?;
    let previous = {
        let node = store.node_mut(id)?;
        let previous = node.unit.replace(unit);
        node.under_construction = false;
        previous
    };
    if let Some(old) = previous {
        debug!(node = %id, "disposing replaced unit");
        backend.dispose_unit(old);
    }
    bind_unit(store, backend, id)
}

/// Dispose a node: its unit (when owned), its parameter bridges, its
/// sub-nodes and its delegated input/output entities, pushing one
/// `disposed` update per entity. Idempotent.
pub fn dispose_node(
    store: &mut ModelStore,
    backend: &mut dyn AudioBackend,
    updates: &mut UpdateBuffer,
    id: &EntityId,
) {
    let (unit, sub_params, sub_nodes, ports) = {
        let node = match store.nodes.get_mut(id) {
            Some(n) if !n.disposed => n,
            _ => return,
        };
        node.disposed = true;
        let unit = if node.creates_unit { node.unit } else { None };
        let mut ports = Vec::new();
        if let PortRef::Entity(port) = &node.input {
            ports.push(port.clone());
        }
        if let PortRef::Entity(port) = &node.output {
            ports.push(port.clone());
        }
        (unit, node.sub_params.clone(), node.sub_nodes.clone(), ports)
    };
    updates.push(id, "disposed", Value::Bool(true));

    if let Some(unit) = unit {
        backend.dispose_unit(unit);
    }
    for (param_id, _) in sub_params {
        if let Some(param) = store.params.get_mut(&param_id) {
            param.dispose(updates);
        }
    }
    for (sub_id, _) in sub_nodes {
        dispose_node(store, backend, updates, &sub_id);
    }
    for port_id in ports {
        if let Some(param) = store.params.get_mut(&port_id) {
            param.dispose(updates);
        } else {
            dispose_node(store, backend, updates, &port_id);
        }
    }
}

/// Forward a declared attribute change to the live unit as a construction
/// option ("type", "rolloff", ...). Engine validation failures propagate.
pub fn apply_attr(
    store: &mut ModelStore,
    backend: &mut dyn AudioBackend,
    id: &EntityId,
    attr: &str,
    value: &Value,
) -> Result<()> {
    let unit = store.node(id)?.live_unit()?;
    backend.set_unit_option(unit, attr, value)
}
