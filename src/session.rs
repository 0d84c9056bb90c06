//! Session: message dispatch over one engine context
//!
//! A session owns every piece of synchronized state for one engine: the
//! entity store, the connection graph, the transport bridge, event-like
//! entities and observers. There is no process-global state; two sessions
//! over two backends are fully independent.
//!
//! Inbound [`ClientMessage`]s mutate the session; outbound effects
//! accumulate as [`StateUpdate`]s until [`Session::take_updates`] drains
//! them for the host transport.
//!
//! Node declaration conventions: attributes with a leading underscore wire
//! entities together (`_params` maps engine parameter paths to declared
//! parameter ids, `_subs` maps sub-component roles to declared node ids,
//! `_input`/`_output` delegate a connectable side, `_create_node: false`
//! marks a node whose unit is a slice of its parent's). Everything else is
//! forwarded to the engine as construction options.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::backend::SharedBackend;
use crate::error::{Result, SyncError};
use crate::events::{EventBody, EventControls, EventEntity};
use crate::expr::EvalCtx;
use crate::graph::ConnectionGraph;
use crate::model::{ModelStore, SharedStore, SharedUpdates, UpdateBuffer};
use crate::node::{
    self, dispose_node, instantiate, Node, NodeKind, PortRef, SignalConfig,
};
use crate::observe::{ObserveTarget, Observer};
use crate::param::{ParamBridge, ParamConfig};
use crate::protocol::{
    ClientMessage, CommandPayload, EntityId, StateUpdate, StepDescriptor, TimeValue,
    TriggerPayload,
};
use crate::transport::{compile_steps, fire_steps, CompiledArg, Transport};

const EVENT_KINDS: &[&str] = &["Event", "Loop", "Part", "Sequence", "Pattern"];

/// One synchronized engine context.
pub struct Session {
    backend: SharedBackend,
    store: SharedStore,
    updates: SharedUpdates,
    graph: ConnectionGraph,
    transport: Transport,
    events: HashMap<EntityId, EventEntity>,
    observers: HashMap<EntityId, Observer>,
}

impl Session {
    pub fn new(backend: SharedBackend) -> Self {
        let store = ModelStore::shared();
        let updates = UpdateBuffer::shared();
        let transport = Transport::new(
            EntityId::new("transport"),
            backend.clone(),
            store.clone(),
            updates.clone(),
        );
        Session {
            backend,
            store,
            updates,
            graph: ConnectionGraph::new(),
            transport,
            events: HashMap::new(),
            observers: HashMap::new(),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Drain the accumulated outbound attribute pushes.
    pub fn take_updates(&mut self) -> Vec<StateUpdate> {
        self.updates.borrow_mut().take()
    }

    /// Route one inbound message.
    pub fn dispatch(&mut self, msg: ClientMessage) -> Result<()> {
        match msg {
            ClientMessage::Create { id, kind, attrs } => self.create(id, &kind, attrs),
            ClientMessage::Set { id, attr, value } => self.set(&id, &attr, &value),
            ClientMessage::Command { id, payload } => self.command(&id, payload),
            ClientMessage::Dispose { id } => self.dispose(&id),
            ClientMessage::Connections { edges } => {
                let mut store = self.store.borrow_mut();
                let mut backend = self.backend.borrow_mut();
                let mut updates = self.updates.borrow_mut();
                self.graph
                    .reconcile(&mut store, &mut *backend, &mut updates, edges)
            }
        }
    }

    /// Finish asynchronous unit builds: bind parameters, apply queued edges.
    /// Call once per event-loop turn.
    pub fn process_ready_units(&mut self) -> Result<()> {
        let ready = self.backend.borrow_mut().take_ready_units();
        for unit in ready {
            let id = {
                let store = self.store.borrow();
                store.node_by_unit(unit)
            };
            let id = match id {
                Some(id) => id,
                None => continue,
            };
            debug!(node = %id, "unit construction finished");
            let mut store = self.store.borrow_mut();
            let mut backend = self.backend.borrow_mut();
            let mut updates = self.updates.borrow_mut();
            node::bind_unit(&mut store, &mut *backend, &id)?;
            self.graph
                .flush_pending(&mut store, &mut *backend, &mut updates, &id)?;
        }
        Ok(())
    }

    // --- create ---

    fn create(&mut self, id: EntityId, kind: &str, attrs: HashMap<String, Value>) -> Result<()> {
        info!(id = %id, kind, "create entity");
        if self.store.borrow().contains(&id) || self.events.contains_key(&id) {
            return Err(SyncError::Config(format!("duplicate entity id: {}", id)));
        }
        match kind {
            "Param" => {
                let config = ParamConfig::from_attrs(&attrs);
                self.store
                    .borrow_mut()
                    .params
                    .insert(id.clone(), ParamBridge::new(id.clone(), config));
                self.transport.resolve_declared(&id)
            }
            "Transport" => self.adopt_transport(id, &attrs),
            "ScheduleObserver" => {
                let target = match attrs.get("observed_entity").and_then(Value::as_str) {
                    None | Some("transport") => ObserveTarget::Transport,
                    Some(entity) => ObserveTarget::Entity(EntityId::new(entity)),
                };
                let trait_name = attrs
                    .get("observed_trait")
                    .and_then(Value::as_str)
                    .unwrap_or("value")
                    .to_string();
                let observer = Observer::new(
                    id.clone(),
                    target,
                    trait_name,
                    self.backend.clone(),
                    self.store.clone(),
                    self.updates.clone(),
                );
                self.observers.insert(id, observer);
                Ok(())
            }
            kind if EVENT_KINDS.contains(&kind) => {
                let body = EventBody::from_decl(kind, &attrs)?;
                let mut controls = EventControls::default();
                if let Some(m) = attrs.get("mute").and_then(Value::as_bool) {
                    controls.mute = m;
                }
                if let Some(p) = attrs.get("probability").and_then(Value::as_f64) {
                    controls.probability = p;
                }
                if let Some(h) = attrs.get("humanize").and_then(Value::as_f64) {
                    controls.humanize = h;
                }
                if let Some(r) = attrs.get("playback_rate").and_then(Value::as_f64) {
                    controls.playback_rate = r;
                }
                let entity = EventEntity::new(
                    id.clone(),
                    body,
                    controls,
                    self.backend.clone(),
                    self.store.clone(),
                );
                // parts and sequences declare their note count up front
                if let Some(len) = entity.length() {
                    self.updates.borrow_mut().push(&id, "length", Value::from(len));
                }
                self.events.insert(id, entity);
                Ok(())
            }
            node_kind => self.create_node(id, node_kind, &attrs),
        }
    }

    fn adopt_transport(&mut self, id: EntityId, attrs: &HashMap<String, Value>) -> Result<()> {
        self.transport.id = id;
        if let Some(bpm_id) = attrs.get("_bpm").and_then(Value::as_str) {
            let bpm_id = EntityId::new(bpm_id);
            let mut store = self.store.borrow_mut();
            let mut backend = self.backend.borrow_mut();
            let tempo = backend.tempo_param();
            store.param_mut(&bpm_id)?.bind(&mut *backend, tempo)?;
        }
        for key in ["time_signature", "loop", "loop_start", "loop_end", "swing", "swing_subdivision"] {
            if let Some(value) = attrs.get(key) {
                self.transport.set_attr(key, value)?;
            }
        }
        Ok(())
    }

    fn create_node(&mut self, id: EntityId, kind: &str, attrs: &HashMap<String, Value>) -> Result<()> {
        let kind = match NodeKind::from_decl(kind) {
            NodeKind::Signal(_) => {
                let units = attrs
                    .get("units")
                    .and_then(Value::as_str)
                    .unwrap_or("number")
                    .to_string();
                NodeKind::Signal(SignalConfig { units })
            }
            other => other,
        };

        let mut options = Map::new();
        for (key, value) in attrs {
            if !key.starts_with('_') && key != "units" {
                options.insert(key.clone(), value.clone());
            }
        }
        let mut node = Node::new(id.clone(), kind, Value::Object(options));

        if let Some(Value::Object(map)) = attrs.get("_params") {
            for (path, value) in map {
                if let Some(param_id) = value.as_str() {
                    node.sub_params.push((EntityId::new(param_id), path.clone()));
                }
            }
        }
        if let Some(Value::Object(map)) = attrs.get("_subs") {
            for (role, value) in map {
                if let Some(sub_id) = value.as_str() {
                    node.sub_nodes.push((EntityId::new(sub_id), role.clone()));
                }
            }
        }
        if let Some(input) = attrs.get("_input").and_then(Value::as_str) {
            node.input = PortRef::Entity(EntityId::new(input));
        }
        if let Some(output) = attrs.get("_output").and_then(Value::as_str) {
            node.output = PortRef::Entity(EntityId::new(output));
        }
        if attrs.get("_create_node").and_then(Value::as_bool) == Some(false) {
            node.creates_unit = false;
        }
        // a signal's input side is its value parameter
        if matches!(node.kind, NodeKind::Signal(_)) && node.input == PortRef::None {
            if let Some((param_id, _)) = node.sub_params.iter().find(|(_, p)| p == "value") {
                node.input = PortRef::Entity(param_id.clone());
            }
        }

        let creates_unit = node.creates_unit;
        self.store.borrow_mut().nodes.insert(id.clone(), node);
        if creates_unit {
            let mut store = self.store.borrow_mut();
            let mut backend = self.backend.borrow_mut();
            instantiate(&mut store, &mut *backend, &id)?;
        }
        self.transport.resolve_declared(&id)
    }

    // --- set ---

    fn set(&mut self, id: &EntityId, attr: &str, value: &Value) -> Result<()> {
        if *id == self.transport.id {
            return self.transport.set_attr(attr, value);
        }
        if let Some(event) = self.events.get_mut(id) {
            let mut updates = self.updates.borrow_mut();
            return event.set_attr(attr, value, &mut updates);
        }

        let is_param = self.store.borrow().params.contains_key(id);
        if is_param {
            let mut store = self.store.borrow_mut();
            let mut backend = self.backend.borrow_mut();
            let param = store.param_mut(id)?;
            return match attr {
                "value" => {
                    let v = value
                        .as_f64()
                        .ok_or_else(|| SyncError::Config("value must be a number".to_string()))?;
                    param.set_value(&mut *backend, v)
                }
                "min_value" => {
                    param.min_value = value.as_f64();
                    Ok(())
                }
                "max_value" => {
                    param.max_value = value.as_f64();
                    Ok(())
                }
                "convert" => {
                    param.convert = value.as_bool().unwrap_or(true);
                    Ok(())
                }
                other => Err(SyncError::Config(format!(
                    "parameter has no attribute: {}",
                    other
                ))),
            };
        }

        let mut store = self.store.borrow_mut();
        let mut backend = self.backend.borrow_mut();
        node::apply_attr(&mut store, &mut *backend, id, attr, value)
    }

    // --- commands ---

    fn command(&mut self, id: &EntityId, payload: CommandPayload) -> Result<()> {
        match payload {
            CommandPayload::Trigger(trigger) => self.trigger(id, &trigger),
            CommandPayload::Schedule(payload) => self.transport.schedule(payload),
            CommandPayload::ScheduleClear { id: event_id } => self.transport.clear(event_id),
            CommandPayload::ScheduleCancel { time } => self.transport.cancel(&time),
            CommandPayload::SetCallback { items } => self
                .event_mut(id)?
                .set_callback(&items),
            CommandPayload::Play(trigger) => self.play(id, &trigger),
            CommandPayload::NoteAdd { arg } => {
                let mut updates = self.updates.borrow_mut();
                self.events
                    .get_mut(id)
                    .ok_or_else(|| SyncError::UnknownEntity(id.clone()))?
                    .note_add(&arg, &mut updates)
            }
            CommandPayload::NoteAt { time, value } => {
                let mut updates = self.updates.borrow_mut();
                self.events
                    .get_mut(id)
                    .ok_or_else(|| SyncError::UnknownEntity(id.clone()))?
                    .note_at(&time, &value, &mut updates)
            }
            CommandPayload::NoteRemove { time, value } => {
                let mut updates = self.updates.borrow_mut();
                self.events
                    .get_mut(id)
                    .ok_or_else(|| SyncError::UnknownEntity(id.clone()))?
                    .note_remove(time.as_ref(), value.as_ref(), &mut updates)
            }
            CommandPayload::NoteClear => {
                let mut updates = self.updates.borrow_mut();
                self.events
                    .get_mut(id)
                    .ok_or_else(|| SyncError::UnknownEntity(id.clone()))?
                    .note_clear(&mut updates)
            }
            CommandPayload::ObserveRepeat {
                update_interval,
                transport,
            } => {
                let interval = self.transport.resolve(&update_interval)?;
                let sig = self.transport.time_signature;
                self.observers
                    .get_mut(id)
                    .ok_or_else(|| SyncError::UnknownEntity(id.clone()))?
                    .observe(interval, sig, transport)
            }
            CommandPayload::ObserveCancel => {
                self.observers
                    .get_mut(id)
                    .ok_or_else(|| SyncError::UnknownEntity(id.clone()))?
                    .cancel();
                Ok(())
            }
            CommandPayload::Sync { ratio } => self.sync_to_tempo(id, ratio),
            CommandPayload::Unsync => self.unsync(id),
            CommandPayload::Replace => {
                let mut store = self.store.borrow_mut();
                let mut backend = self.backend.borrow_mut();
                node::replace_unit(&mut store, &mut *backend, id)?;
                self.graph.reapply_node(&mut store, &mut *backend, id)
            }
        }
    }

    fn event_mut(&mut self, id: &EntityId) -> Result<&mut EventEntity> {
        self.events
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownEntity(id.clone()))
    }

    /// Immediate method invocation, validated like a scheduled step.
    /// Parameter targets go through their bridge's automation surface.
    fn trigger(&mut self, id: &EntityId, payload: &TriggerPayload) -> Result<()> {
        let item = StepDescriptor {
            callee: id.clone(),
            method: payload.method.clone(),
            args: payload.args.clone(),
            arg_keys: payload.arg_keys.clone(),
        };
        let steps = {
            let store = self.store.borrow();
            compile_steps(&store, std::slice::from_ref(&item))?
        };
        let now = self.backend.borrow().transport_seconds();

        let is_param = self.store.borrow().params.contains_key(id);
        if is_param {
            let bpm = {
                let backend = self.backend.borrow();
                let tempo = backend.tempo_param();
                backend.param_value(tempo)?
            };
            let ctx = EvalCtx {
                time: now,
                value: None,
                bpm,
                beats_per_measure: self.transport.time_signature,
            };
            let args: Vec<Value> = steps[0]
                .args
                .iter()
                .map(|a| match a {
                    CompiledArg::Literal(v) => v.clone(),
                    CompiledArg::Expr(e) => e.eval(&ctx),
                })
                .collect();
            let mut store = self.store.borrow_mut();
            let mut backend = self.backend.borrow_mut();
            return store
                .param_mut(id)?
                .automate(&mut *backend, &payload.method, &args);
        }

        fire_steps(
            &self.backend,
            &self.store,
            &steps,
            now,
            None,
            self.transport.time_signature,
        )
    }

    /// Start or stop an event-like entity and push its new play state.
    fn play(&mut self, id: &EntityId, payload: &TriggerPayload) -> Result<()> {
        let at: Option<TimeValue> = payload
            .args
            .get("time")
            .and_then(|a| serde_json::from_value(a.value.clone()).ok());
        let event = self
            .events
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownEntity(id.clone()))?;
        match payload.method.as_str() {
            "start" => event.start(at.as_ref())?,
            "stop" => event.stop(),
            other => {
                return Err(SyncError::MethodNotAllowed {
                    kind: "Event".to_string(),
                    method: other.to_string(),
                })
            }
        }
        let state = event.state().as_str().to_string();
        self.updates
            .borrow_mut()
            .push(id, "state", Value::String(state));
        Ok(())
    }

    fn tempo_target(&self, id: &EntityId) -> Result<EntityId> {
        let store = self.store.borrow();
        if store.params.contains_key(id) {
            return Ok(id.clone());
        }
        store
            .destination_param(id)
            .ok_or_else(|| SyncError::UnsupportedTrait {
                target: id.to_string(),
                operation: "sync".to_string(),
            })
    }

    /// Bind a signal's value to the transport tempo at a fixed ratio. The
    /// declared value resets to zero: the live value now derives from the
    /// tempo, not from the declaration.
    fn sync_to_tempo(&mut self, id: &EntityId, ratio: f64) -> Result<()> {
        let param_id = self.tempo_target(id)?;
        let mut store = self.store.borrow_mut();
        let mut backend = self.backend.borrow_mut();
        let param = store.param_mut(&param_id)?;
        let handle = param.handle.ok_or_else(|| {
            SyncError::Config(format!("parameter {} has no live endpoint", param_id))
        })?;
        backend.sync_param_to_tempo(handle, ratio)?;
        param.value = 0.0;
        self.updates
            .borrow_mut()
            .push(&param_id, "value", Value::from(0.0));
        Ok(())
    }

    fn unsync(&mut self, id: &EntityId) -> Result<()> {
        let param_id = self.tempo_target(id)?;
        let store = self.store.borrow();
        let handle = store.param_handle(&param_id).ok_or_else(|| {
            SyncError::Config(format!("parameter {} has no live endpoint", param_id))
        })?;
        self.backend.borrow_mut().unsync_param(handle)
    }

    // --- dispose ---

    fn dispose(&mut self, id: &EntityId) -> Result<()> {
        info!(id = %id, "dispose entity");
        if let Some(mut event) = self.events.remove(id) {
            event.stop();
            self.updates.borrow_mut().push(id, "disposed", Value::Bool(true));
            return Ok(());
        }
        if let Some(mut observer) = self.observers.remove(id) {
            observer.cancel();
            self.updates.borrow_mut().push(id, "disposed", Value::Bool(true));
            return Ok(());
        }

        let is_node = self.store.borrow().nodes.contains_key(id);
        let mut store = self.store.borrow_mut();
        let mut updates = self.updates.borrow_mut();
        if is_node {
            let mut backend = self.backend.borrow_mut();
            dispose_node(&mut store, &mut *backend, &mut updates, id);
            return Ok(());
        }
        if let Ok(param) = store.param_mut(id) {
            param.dispose(&mut updates);
            return Ok(());
        }
        // disposing twice (or an unknown id) is a no-op
        Ok(())
    }
}
