//! Transport bridge and timeline scheduling
//!
//! The transport mirrors the engine clock and owns the mapping from
//! externally allocated event ids to engine registrations. Scheduled
//! callbacks arrive as data ([`StepDescriptor`] lists); they are validated
//! and compiled at registration time and replayed against the live entities
//! at fire time, so a unit swap between the two is picked up transparently.
//!
//! A registration naming a callee that has not been declared yet parks in
//! the [`NodeResolver`] under the missing id. Declaring the entity replays
//! the registration; clearing the event id first cancels it before it can
//! ever reach the engine.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, error};

use crate::backend::{
    AudioBackend, EngineCallback, EventHandle, ParamHandle, SharedBackend, UnitHandle,
};
use crate::error::{Result, SyncError};
use crate::expr::{parse_expr, resolve_time, EvalCtx, Expr, PPQ};
use crate::model::{CancelToken, ModelStore, NodeResolver, SharedStore, SharedUpdates};
use crate::param::{json_f64, PARAM_METHODS};
use crate::protocol::{EntityId, SchedulePayload, ScheduleOp, StepDescriptor, TimeValue};

/// Playback state of the transport (and of event-like entities).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Started,
    Stopped,
    Paused,
}

impl PlayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayState::Started => "started",
            PlayState::Stopped => "stopped",
            PlayState::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(PlayState::Started),
            "stopped" => Ok(PlayState::Stopped),
            "paused" => Ok(PlayState::Paused),
            other => Err(SyncError::Config(format!("unknown play state: {}", other))),
        }
    }
}

/// One compiled callback argument.
#[derive(Debug, Clone)]
pub enum CompiledArg {
    Literal(Value),
    Expr(Expr),
}

/// One compiled callback step: callee resolved by id at fire time.
#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub callee: EntityId,
    pub method: String,
    pub args: Vec<CompiledArg>,
}

enum FireTarget {
    Unit(UnitHandle),
    Param(ParamHandle),
}

/// Compile and validate a declared step list against the current store.
/// Callees must exist; methods must be on the callee's surface; expression
/// arguments must parse.
pub fn compile_steps(store: &ModelStore, items: &[StepDescriptor]) -> Result<Vec<CompiledStep>> {
    let mut steps = Vec::with_capacity(items.len());
    for item in items {
        if let Ok(node) = store.node(&item.callee) {
            node.check_method(&item.method)?;
        } else if store.param(&item.callee).is_ok() {
            if !PARAM_METHODS.contains(&item.method.as_str()) {
                return Err(SyncError::MethodNotAllowed {
                    kind: "Param".to_string(),
                    method: item.method.clone(),
                });
            }
        } else {
            return Err(SyncError::UnknownEntity(item.callee.clone()));
        }

        let mut args = Vec::with_capacity(item.arg_keys.len());
        for key in &item.arg_keys {
            let arg = item
                .args
                .get(key)
                .ok_or_else(|| SyncError::Config(format!("missing argument: {}", key)))?;
            if arg.eval {
                let source = arg.value.as_str().ok_or_else(|| {
                    SyncError::InvalidExpr(format!("non-string expression for {}", key))
                })?;
                args.push(CompiledArg::Expr(parse_expr(source)?));
            } else {
                args.push(CompiledArg::Literal(arg.value.clone()));
            }
        }
        steps.push(CompiledStep {
            callee: item.callee.clone(),
            method: item.method.clone(),
            args,
        });
    }
    Ok(steps)
}

/// First step callee missing from the store, if any.
pub fn first_missing_callee(store: &ModelStore, items: &[StepDescriptor]) -> Option<EntityId> {
    items
        .iter()
        .map(|item| &item.callee)
        .find(|callee| !store.contains(callee))
        .cloned()
}

/// Execute compiled steps at fire time. Expressions see the fire-time clock
/// and tempo; disposed callees are skipped.
pub(crate) fn fire_steps(
    backend: &SharedBackend,
    store: &SharedStore,
    steps: &[CompiledStep],
    time: f64,
    value: Option<&Value>,
    beats_per_measure: u32,
) -> Result<()> {
    let bpm = {
        let b = backend.borrow();
        let tempo = b.tempo_param();
        b.param_value(tempo)?
    };
    let ctx = EvalCtx {
        time,
        value,
        bpm,
        beats_per_measure,
    };

    // Resolve targets first so the store borrow is released before the
    // engine calls run.
    let mut plan: Vec<(FireTarget, &str, Vec<Value>)> = Vec::with_capacity(steps.len());
    {
        let store = store.borrow();
        for step in steps {
            if store.entity_disposed(&step.callee) {
                debug!(callee = %step.callee, "skipping step on disposed callee");
                continue;
            }
            let target = if let Ok(node) = store.node(&step.callee) {
                FireTarget::Unit(node.live_unit()?)
            } else {
                let param = store.param(&step.callee)?;
                FireTarget::Param(param.handle.ok_or_else(|| {
                    SyncError::Config(format!("parameter {} has no live endpoint", step.callee))
                })?)
            };
            let args = step
                .args
                .iter()
                .map(|a| match a {
                    CompiledArg::Literal(v) => v.clone(),
                    CompiledArg::Expr(e) => e.eval(&ctx),
                })
                .collect();
            plan.push((target, &step.method, args));
        }
    }

    let mut backend = backend.borrow_mut();
    for (target, method, args) in plan {
        match target {
            FireTarget::Unit(unit) => backend.invoke(unit, method, &args)?,
            FireTarget::Param(param) => backend.automate_param(param, method, &args)?,
        }
    }
    Ok(())
}

enum Registration {
    /// Live in the engine timeline.
    Engine(EventHandle),
    /// Parked in the resolver, waiting for a callee declaration.
    Pending(CancelToken),
}

/// The transport bridge.
pub struct Transport {
    pub id: EntityId,
    backend: SharedBackend,
    store: SharedStore,
    updates: SharedUpdates,
    state: PlayState,
    /// Beats per measure, used for every musical-time resolution.
    pub time_signature: u32,
    pub loop_enabled: bool,
    pub loop_start: f64,
    pub loop_end: f64,
    pub swing: f64,
    pub swing_subdivision: String,
    registrations: HashMap<u64, Registration>,
    resolver: NodeResolver,
}

impl Transport {
    pub fn new(
        id: EntityId,
        backend: SharedBackend,
        store: SharedStore,
        updates: SharedUpdates,
    ) -> Self {
        Transport {
            id,
            backend,
            store,
            updates,
            state: PlayState::Stopped,
            time_signature: 4,
            loop_enabled: false,
            loop_start: 0.0,
            loop_end: 0.0,
            swing: 0.0,
            swing_subdivision: "8n".to_string(),
            registrations: HashMap::new(),
            resolver: NodeResolver::new(),
        }
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn bpm(&self) -> f64 {
        let backend = self.backend.borrow();
        let tempo = backend.tempo_param();
        backend.param_value(tempo).unwrap_or(120.0)
    }

    /// Resolve a wire-level time against the current tempo.
    pub fn resolve(&self, time: &TimeValue) -> Result<f64> {
        resolve_time(time, self.bpm(), self.time_signature)
    }

    pub fn set_state(&mut self, state: PlayState) {
        if state == self.state {
            return;
        }
        debug!(from = self.state.as_str(), to = state.as_str(), "transport state change");
        self.state = state;
        {
            let mut backend = self.backend.borrow_mut();
            match state {
                PlayState::Started => backend.transport_start(),
                PlayState::Stopped => backend.transport_stop(),
                PlayState::Paused => backend.transport_pause(),
            }
        }
        self.push_clock();
    }

    /// Re-read the engine clock and push every observable back out, so the
    /// remote side never drifts from the authoritative position.
    fn push_clock(&self) {
        let mut updates = self.updates.borrow_mut();
        updates.push(&self.id, "state", Value::String(self.state.as_str().to_string()));
        updates.push(&self.id, "seconds", json_f64(self.seconds()));
        updates.push(&self.id, "position", Value::String(self.position()));
        updates.push(&self.id, "ticks", json_f64(self.ticks()));
        updates.push(&self.id, "progress", json_f64(self.progress()));
    }

    pub fn seconds(&self) -> f64 {
        self.backend.borrow().transport_seconds()
    }

    pub fn ticks(&self) -> f64 {
        self.seconds() * self.bpm() / 60.0 * PPQ
    }

    /// Transport position in bars:beats:sixteenths notation.
    pub fn position(&self) -> String {
        let total_beats = self.seconds() * self.bpm() / 60.0;
        let sig = self.time_signature as f64;
        let bars = (total_beats / sig).floor();
        let beats = (total_beats - bars * sig).floor();
        let sixteenths = (total_beats - bars * sig - beats) * 4.0;
        if (sixteenths - sixteenths.round()).abs() < 1e-9 {
            format!("{}:{}:{}", bars as u64, beats as u64, sixteenths.round() as u64)
        } else {
            format!("{}:{}:{:.4}", bars as u64, beats as u64, sixteenths)
        }
    }

    /// Loop progress in [0, 1); zero while looping is off.
    pub fn progress(&self) -> f64 {
        if !self.loop_enabled || self.loop_end <= self.loop_start {
            return 0.0;
        }
        let span = self.loop_end - self.loop_start;
        ((self.seconds() - self.loop_start) / span).clamp(0.0, 1.0)
    }

    /// Observable trait read-back by name.
    pub fn read_back(&self, attr: &str) -> Result<Value> {
        match attr {
            "seconds" => Ok(json_f64(self.seconds())),
            "position" => Ok(Value::String(self.position())),
            "ticks" => Ok(json_f64(self.ticks())),
            "progress" => Ok(json_f64(self.progress())),
            "state" => Ok(Value::String(self.state.as_str().to_string())),
            other => Err(SyncError::Config(format!(
                "transport has no observable trait: {}",
                other
            ))),
        }
    }

    /// Route a declared attribute change.
    pub fn set_attr(&mut self, attr: &str, value: &Value) -> Result<()> {
        match attr {
            "state" => {
                let s = value
                    .as_str()
                    .ok_or_else(|| SyncError::Config("state must be a string".to_string()))?;
                self.set_state(PlayState::from_str(s)?);
                Ok(())
            }
            "seconds" => {
                let s = value
                    .as_f64()
                    .ok_or_else(|| SyncError::Config("seconds must be a number".to_string()))?;
                self.backend.borrow_mut().set_transport_seconds(s);
                self.push_clock();
                Ok(())
            }
            "position" => {
                let t: TimeValue = serde_json::from_value(value.clone())
                    .map_err(|e| SyncError::Config(e.to_string()))?;
                let s = self.resolve(&t)?;
                self.backend.borrow_mut().set_transport_seconds(s);
                self.push_clock();
                Ok(())
            }
            "ticks" => {
                let ticks = value
                    .as_f64()
                    .ok_or_else(|| SyncError::Config("ticks must be a number".to_string()))?;
                let s = ticks * 60.0 / (self.bpm() * PPQ);
                self.backend.borrow_mut().set_transport_seconds(s);
                self.push_clock();
                Ok(())
            }
            "loop" => {
                self.loop_enabled = value.as_bool().unwrap_or(false);
                Ok(())
            }
            "loop_start" => {
                let t: TimeValue = serde_json::from_value(value.clone())
                    .map_err(|e| SyncError::Config(e.to_string()))?;
                self.loop_start = self.resolve(&t)?;
                Ok(())
            }
            "loop_end" => {
                let t: TimeValue = serde_json::from_value(value.clone())
                    .map_err(|e| SyncError::Config(e.to_string()))?;
                self.loop_end = self.resolve(&t)?;
                Ok(())
            }
            "swing" => {
                self.swing = value.as_f64().unwrap_or(0.0);
                Ok(())
            }
            "swing_subdivision" => {
                self.swing_subdivision = value.as_str().unwrap_or("8n").to_string();
                Ok(())
            }
            "time_signature" => {
                self.time_signature = value.as_u64().unwrap_or(4) as u32;
                Ok(())
            }
            other => Err(SyncError::Config(format!(
                "transport has no attribute: {}",
                other
            ))),
        }
    }

    /// Register a scheduled callback under its external id. If a step
    /// callee is not declared yet, the registration parks in the resolver
    /// and resolves when [`Transport::resolve_declared`] sees the id.
    pub fn schedule(&mut self, payload: SchedulePayload) -> Result<()> {
        // Re-registering an id supersedes the previous registration.
        match self.registrations.remove(&payload.id) {
            Some(Registration::Engine(handle)) => self.backend.borrow_mut().clear_event(handle),
            Some(Registration::Pending(token)) => token.cancel(),
            None => {}
        }

        let missing = {
            let store = self.store.borrow();
            first_missing_callee(&store, &payload.items)
        };
        if let Some(missing) = missing {
            debug!(event = payload.id, callee = %missing, "deferring registration");
            let token = CancelToken::new();
            self.registrations
                .insert(payload.id, Registration::Pending(token.clone()));
            self.resolver.defer(missing, token, payload);
            return Ok(());
        }

        let steps = {
            let store = self.store.borrow();
            compile_steps(&store, &payload.items)?
        };

        let backend = self.backend.clone();
        let store = self.store.clone();
        let sig = self.time_signature;
        let event_id = payload.id;
        let callback: EngineCallback = Box::new(move |time| {
            if let Err(e) = fire_steps(&backend, &store, &steps, time, None, sig) {
                error!(event = event_id, error = %e, "scheduled callback failed");
            }
        });

        let handle = {
            let mut backend = self.backend.borrow_mut();
            match payload.op {
                ScheduleOp::Plain => {
                    let time = payload.time.unwrap_or_default();
                    let t = resolve_time(&time, self.bpm_of(&*backend), sig)?;
                    backend.schedule(t, callback)
                }
                ScheduleOp::Once => {
                    let time = payload.time.unwrap_or_default();
                    let t = resolve_time(&time, self.bpm_of(&*backend), sig)?;
                    backend.schedule_once(t, callback)
                }
                ScheduleOp::Repeat => {
                    let bpm = self.bpm_of(&*backend);
                    let interval = payload
                        .interval
                        .as_ref()
                        .ok_or_else(|| SyncError::Config("repeat needs an interval".to_string()))?;
                    let interval = resolve_time(interval, bpm, sig)?;
                    let start = match &payload.start_time {
                        Some(t) => resolve_time(t, bpm, sig)?,
                        None => 0.0,
                    };
                    let duration = match &payload.duration {
                        Some(t) => Some(resolve_time(t, bpm, sig)?),
                        None => None,
                    };
                    backend.schedule_repeat(interval, start, duration, callback)
                }
            }
        };
        self.registrations
            .insert(payload.id, Registration::Engine(handle));
        Ok(())
    }

    // bpm read usable while the backend is already borrowed
    fn bpm_of(&self, backend: &dyn AudioBackend) -> f64 {
        let tempo = backend.tempo_param();
        backend.param_value(tempo).unwrap_or(120.0)
    }

    /// Replay registrations that were parked on a freshly declared entity.
    pub fn resolve_declared(&mut self, id: &EntityId) -> Result<()> {
        for registration in self.resolver.take_for(id) {
            self.schedule(registration.payload)?;
        }
        Ok(())
    }

    /// Remove one registration by its external id. Clearing an id that was
    /// never registered (or already cleared) is an error.
    pub fn clear(&mut self, id: u64) -> Result<()> {
        match self.registrations.remove(&id) {
            Some(Registration::Engine(handle)) => {
                self.backend.borrow_mut().clear_event(handle);
                Ok(())
            }
            Some(Registration::Pending(token)) => {
                token.cancel();
                Ok(())
            }
            None => Err(SyncError::UnknownEvent(id)),
        }
    }

    /// Drop every registration scheduled at or after `time`.
    pub fn cancel(&mut self, time: &TimeValue) -> Result<()> {
        let t = self.resolve(time)?;
        self.backend.borrow_mut().cancel_after(t);
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.resolver.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UpdateBuffer;
    use crate::node::{instantiate, Node, NodeKind};
    use crate::offline::OfflineBackend;
    use crate::protocol::ArgDescriptor;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    struct Fixture {
        raw: Rc<RefCell<OfflineBackend>>,
        backend: SharedBackend,
        store: SharedStore,
        updates: SharedUpdates,
        transport: Transport,
    }

    impl Fixture {
        fn new() -> Self {
            let raw = OfflineBackend::shared();
            let backend: SharedBackend = raw.clone();
            let store = ModelStore::shared();
            let updates = UpdateBuffer::shared();
            let transport = Transport::new(
                EntityId::new("transport"),
                backend.clone(),
                store.clone(),
                updates.clone(),
            );
            Fixture {
                raw,
                backend,
                store,
                updates,
                transport,
            }
        }

        fn add_oscillator(&mut self, id: &str) {
            let id = EntityId::new(id);
            let mut store = self.store.borrow_mut();
            store
                .nodes
                .insert(id.clone(), Node::new(id.clone(), NodeKind::Oscillator, Value::Null));
            let mut backend = self.backend.borrow_mut();
            instantiate(&mut store, &mut *backend, &id).unwrap();
        }

        fn start_step(&self, callee: &str) -> StepDescriptor {
            StepDescriptor {
                callee: EntityId::new(callee),
                method: "start".to_string(),
                args: HashMap::from([("time".to_string(), ArgDescriptor::expr("time"))]),
                arg_keys: vec!["time".to_string()],
            }
        }

        fn invocation_times(&self) -> Vec<f64> {
            self.raw
                .borrow()
                .invocations()
                .iter()
                .map(|i| i.at)
                .collect()
        }
    }

    fn repeat_payload(id: u64, items: Vec<StepDescriptor>, interval: &str) -> SchedulePayload {
        SchedulePayload {
            op: ScheduleOp::Repeat,
            id,
            items,
            time: None,
            interval: Some(TimeValue::Notation(interval.to_string())),
            start_time: Some(TimeValue::Seconds(0.0)),
            duration: None,
        }
    }

    #[test]
    fn test_repeat_registration_fires_on_musical_cadence() {
        let mut fx = Fixture::new();
        fx.add_oscillator("osc");
        let step = fx.start_step("osc");
        fx.transport.schedule(repeat_payload(1, vec![step], "4n")).unwrap();

        fx.transport.set_state(PlayState::Started);
        OfflineBackend::advance(&fx.raw, 2.0);
        // quarter notes at the default 120 bpm
        assert_eq!(fx.invocation_times(), vec![0.0, 0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_fire_time_expression_sees_clock() {
        let mut fx = Fixture::new();
        fx.add_oscillator("osc");
        let step = fx.start_step("osc");
        fx.transport
            .schedule(SchedulePayload {
                op: ScheduleOp::Once,
                id: 1,
                items: vec![step],
                time: Some(TimeValue::Seconds(1.5)),
                interval: None,
                start_time: None,
                duration: None,
            })
            .unwrap();

        fx.transport.set_state(PlayState::Started);
        OfflineBackend::advance(&fx.raw, 2.0);
        let raw = fx.raw.borrow();
        let inv = &raw.invocations()[0];
        assert_eq!(inv.args[0], json!(1.5));
    }

    #[test]
    fn test_registration_defers_until_callee_declared() {
        let mut fx = Fixture::new();
        let step = fx.start_step("late-osc");
        fx.transport.schedule(repeat_payload(7, vec![step], "4n")).unwrap();
        assert_eq!(fx.transport.pending_count(), 1);
        assert_eq!(fx.raw.borrow().event_count(), 0);

        fx.add_oscillator("late-osc");
        fx.transport.resolve_declared(&EntityId::new("late-osc")).unwrap();
        assert_eq!(fx.transport.pending_count(), 0);
        assert_eq!(fx.raw.borrow().event_count(), 1);

        fx.transport.set_state(PlayState::Started);
        OfflineBackend::advance(&fx.raw, 1.0);
        assert!(!fx.invocation_times().is_empty());
    }

    #[test]
    fn test_clear_before_resolution_cancels_for_good() {
        let mut fx = Fixture::new();
        let step = fx.start_step("late-osc");
        fx.transport.schedule(repeat_payload(7, vec![step], "4n")).unwrap();

        fx.transport.clear(7).unwrap();
        fx.add_oscillator("late-osc");
        fx.transport.resolve_declared(&EntityId::new("late-osc")).unwrap();
        assert_eq!(fx.raw.borrow().event_count(), 0);

        fx.transport.set_state(PlayState::Started);
        OfflineBackend::advance(&fx.raw, 2.0);
        assert!(fx.invocation_times().is_empty());
    }

    #[test]
    fn test_clear_unknown_id_is_an_error() {
        let mut fx = Fixture::new();
        assert!(matches!(fx.transport.clear(99), Err(SyncError::UnknownEvent(99))));
        // clearing twice errors the second time
        fx.add_oscillator("osc");
        let step = fx.start_step("osc");
        fx.transport.schedule(repeat_payload(1, vec![step], "4n")).unwrap();
        fx.transport.clear(1).unwrap();
        assert!(fx.transport.clear(1).is_err());
    }

    #[test]
    fn test_event_ids_are_isolated() {
        let mut fx = Fixture::new();
        fx.add_oscillator("osc");
        let a = fx.start_step("osc");
        let b = fx.start_step("osc");
        fx.transport.schedule(repeat_payload(1, vec![a], "4n")).unwrap();
        fx.transport.schedule(repeat_payload(2, vec![b], "4n")).unwrap();

        fx.transport.clear(1).unwrap();
        assert_eq!(fx.raw.borrow().event_count(), 1);

        fx.transport.set_state(PlayState::Started);
        OfflineBackend::advance(&fx.raw, 1.0);
        assert_eq!(fx.invocation_times(), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_method_outside_surface_rejected() {
        let mut fx = Fixture::new();
        fx.add_oscillator("osc");
        let mut step = fx.start_step("osc");
        step.method = "dispose".to_string();
        assert!(matches!(
            fx.transport.schedule(repeat_payload(1, vec![step], "4n")),
            Err(SyncError::MethodNotAllowed { .. })
        ));
    }

    #[test]
    fn test_transitions_push_clock_observables() {
        let mut fx = Fixture::new();
        fx.transport.set_state(PlayState::Started);
        let pushed = fx.updates.borrow_mut().take();
        for attr in ["state", "seconds", "position", "ticks", "progress"] {
            assert!(pushed.iter().any(|u| u.attr == attr), "missing {}", attr);
        }
        assert!(pushed
            .iter()
            .any(|u| u.attr == "state" && u.value == json!("started")));

        // repeating the current state is not a transition
        fx.transport.set_state(PlayState::Started);
        assert!(fx.updates.borrow().is_empty());
    }

    #[test]
    fn test_seconds_mutation_pushes_clock_readback() {
        let mut fx = Fixture::new();
        fx.transport.set_attr("seconds", &json!(1.5)).unwrap();
        let pushed = fx.updates.borrow_mut().take();
        assert!(pushed
            .iter()
            .any(|u| u.attr == "seconds" && u.value == json!(1.5)));
        // 120 bpm, 4/4: 3 beats in
        assert!(pushed
            .iter()
            .any(|u| u.attr == "position" && u.value == json!("0:3:0")));
    }

    #[test]
    fn test_position_and_ticks_read_back() {
        let fx = Fixture::new();
        fx.backend.borrow_mut().set_transport_seconds(3.0);
        // 120 bpm, 4/4: 6 beats in
        assert_eq!(fx.transport.position(), "1:2:0");
        assert_eq!(fx.transport.ticks(), 6.0 * PPQ);
        assert_eq!(fx.transport.read_back("seconds").unwrap(), json!(3.0));
        assert_eq!(fx.transport.read_back("state").unwrap(), json!("stopped"));
        assert!(fx.transport.read_back("bogus").is_err());
    }

    #[test]
    fn test_cancel_after_time() {
        let mut fx = Fixture::new();
        fx.add_oscillator("osc");
        let step = fx.start_step("osc");
        fx.transport
            .schedule(SchedulePayload {
                op: ScheduleOp::Plain,
                id: 1,
                items: vec![step],
                time: Some(TimeValue::Seconds(2.0)),
                interval: None,
                start_time: None,
                duration: None,
            })
            .unwrap();
        fx.transport.cancel(&TimeValue::Seconds(1.0)).unwrap();
        fx.transport.set_state(PlayState::Started);
        OfflineBackend::advance(&fx.raw, 3.0);
        assert!(fx.invocation_times().is_empty());
    }
}
