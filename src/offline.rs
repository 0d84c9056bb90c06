//! Deterministic in-memory audio backend
//!
//! Reference implementation of [`AudioBackend`] with a manually advanced
//! clock. No audio is produced; units, parameters, connections and timeline
//! registrations are plain bookkeeping, which makes every property of the
//! synchronization layer observable from tests.
//!
//! The timeline only runs while the transport is started. Callbacks are
//! taken out of the store before they are invoked, so fire-time code may
//! re-enter the backend (schedule, clear, parameter reads) freely.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;
use tracing::debug;

use crate::backend::{
    AudioBackend, EngineCallback, EventHandle, ParamHandle, PortHandle, UnitHandle, UnitSpec,
};
use crate::error::{Result, SyncError};

const EPS: f64 = 1e-9;

/// Per-class layout: parameter endpoints (name, default, automatable).
fn class_params(class: &str) -> &'static [(&'static str, f64, bool)] {
    match class {
        "Oscillator" => &[("frequency", 440.0, true), ("detune", 0.0, true)],
        "Gain" => &[("gain", 1.0, true)],
        "Volume" => &[("volume", 0.0, true)],
        "Filter" => &[("frequency", 350.0, true), ("Q", 1.0, true), ("gain", 0.0, true)],
        "Reverb" => &[("wet", 1.0, true)],
        "ConstantSource" => &[("value", 0.0, true)],
        "Signal" => &[("value", 0.0, true)],
        // Meters only support immediate reads, no automation lookup.
        "Meter" => &[("level", f64::NEG_INFINITY, false)],
        _ => &[],
    }
}

/// Per-class named sub-components (role, class).
fn class_subs(class: &str) -> &'static [(&'static str, &'static str)] {
    match class {
        "Destination" => &[("input", "Gain"), ("output", "Volume")],
        "Synth" => &[("oscillator", "Oscillator"), ("output", "Volume")],
        "Signal" => &[("output", "ConstantSource")],
        _ => &[],
    }
}

fn valid_option(class: &str, name: &str, value: &Value) -> bool {
    let allowed: &[&str] = match (class, name) {
        ("Oscillator", "type") => &["sine", "square", "sawtooth", "triangle"],
        ("Filter", "type") => &["lowpass", "highpass", "bandpass", "notch", "allpass", "peaking"],
        _ => return true,
    };
    value.as_str().map(|s| allowed.contains(&s)).unwrap_or(false)
}

#[derive(Debug)]
struct OfflineUnit {
    class: String,
    options: HashMap<String, Value>,
    params: HashMap<String, ParamHandle>,
    subs: HashMap<String, UnitHandle>,
    disposed: bool,
    started: bool,
    ready: bool,
}

#[derive(Debug)]
struct OfflineParam {
    value: f64,
    overridden: bool,
    automatable: bool,
    tempo_ratio: Option<f64>,
    /// Automation points recorded from scheduled parameter methods.
    points: Vec<(f64, f64)>,
}

/// One recorded `invoke` call, kept for test assertions.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub unit: UnitHandle,
    pub method: String,
    pub args: Vec<Value>,
    pub at: f64,
}

enum Cadence {
    /// Fires each time the timeline passes `time`; re-armed on transport stop.
    Plain { time: f64, fired: bool },
    /// Fires once, then the registration is removed.
    Once { time: f64 },
    Repeat {
        interval: f64,
        start_time: f64,
        duration: Option<f64>,
        next: f64,
    },
}

struct TimelineEvent {
    cadence: Cadence,
    callback: Rc<RefCell<EngineCallback>>,
}

impl TimelineEvent {
    fn due(&self, target: f64) -> Option<f64> {
        match &self.cadence {
            Cadence::Plain { time, fired } if !fired && *time <= target + EPS => Some(*time),
            Cadence::Once { time } if *time <= target + EPS => Some(*time),
            Cadence::Repeat {
                interval: _,
                start_time,
                duration,
                next,
            } => {
                let end = duration.map(|d| start_time + d);
                if *next <= target + EPS && end.map(|e| *next <= e + EPS).unwrap_or(true) {
                    Some(*next)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn start_time(&self) -> f64 {
        match &self.cadence {
            Cadence::Plain { time, .. } | Cadence::Once { time } => *time,
            Cadence::Repeat { start_time, .. } => *start_time,
        }
    }
}

/// Deterministic engine with a manually advanced transport clock.
pub struct OfflineBackend {
    units: HashMap<u64, OfflineUnit>,
    params: HashMap<u64, OfflineParam>,
    connections: Vec<(UnitHandle, u32, PortHandle, u32)>,
    ready_queue: Vec<UnitHandle>,
    timeline: HashMap<u64, TimelineEvent>,
    tempo: ParamHandle,
    transport_running: bool,
    seconds: f64,
    next_unit: u64,
    next_param: u64,
    next_event: u64,
    /// Counters for reconciliation tests.
    pub connect_ops: usize,
    pub disconnect_ops: usize,
    invocations: Vec<Invocation>,
}

impl OfflineBackend {
    pub fn new() -> Self {
        let mut backend = OfflineBackend {
            units: HashMap::new(),
            params: HashMap::new(),
            connections: Vec::new(),
            ready_queue: Vec::new(),
            timeline: HashMap::new(),
            tempo: ParamHandle(0),
            transport_running: false,
            seconds: 0.0,
            next_unit: 1,
            next_param: 1,
            next_event: 1,
            connect_ops: 0,
            disconnect_ops: 0,
            invocations: Vec::new(),
        };
        backend.tempo = backend.alloc_param(120.0, true);
        backend
    }

    /// Shared handle as used by the session and tests.
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new()))
    }

    fn alloc_param(&mut self, value: f64, automatable: bool) -> ParamHandle {
        let handle = ParamHandle(self.next_param);
        self.next_param += 1;
        self.params.insert(
            handle.0,
            OfflineParam {
                value,
                overridden: false,
                automatable,
                tempo_ratio: None,
                points: Vec::new(),
            },
        );
        handle
    }

    fn build_unit(&mut self, spec: &UnitSpec, ready: bool) -> UnitHandle {
        let handle = UnitHandle(self.next_unit);
        self.next_unit += 1;

        let mut params = HashMap::new();
        for (name, default, automatable) in class_params(&spec.class) {
            let p = self.alloc_param(*default, *automatable);
            params.insert(name.to_string(), p);
        }

        let mut subs = HashMap::new();
        for (role, sub_class) in class_subs(&spec.class) {
            let sub = self.build_unit(&UnitSpec::new(*sub_class, Value::Null), true);
            subs.insert(role.to_string(), sub);
        }

        let options = match &spec.options {
            Value::Object(map) => map.clone().into_iter().collect(),
            _ => HashMap::new(),
        };

        self.units.insert(
            handle.0,
            OfflineUnit {
                class: spec.class.clone(),
                options,
                params,
                subs,
                disposed: false,
                started: false,
                ready,
            },
        );
        handle
    }

    fn unit(&self, handle: UnitHandle) -> Result<&OfflineUnit> {
        self.units
            .get(&handle.0)
            .ok_or_else(|| SyncError::Backend(format!("no such unit: {:?}", handle)))
    }

    fn param(&self, handle: ParamHandle) -> Result<&OfflineParam> {
        self.params
            .get(&handle.0)
            .ok_or_else(|| SyncError::Backend(format!("no such param: {:?}", handle)))
    }

    /// Finish an asynchronous build (test-side knob standing in for the
    /// engine's own completion callback).
    pub fn complete_build(&mut self, unit: UnitHandle) {
        if let Some(u) = self.units.get_mut(&unit.0) {
            if !u.ready {
                u.ready = true;
                self.ready_queue.push(unit);
            }
        }
    }

    pub fn unit_class(&self, unit: UnitHandle) -> Option<&str> {
        self.units.get(&unit.0).map(|u| u.class.as_str())
    }

    /// First live unit of a class, for test assertions.
    pub fn find_unit(&self, class: &str) -> Option<UnitHandle> {
        let mut ids: Vec<u64> = self
            .units
            .iter()
            .filter(|(_, u)| u.class == class && !u.disposed)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.first().map(|id| UnitHandle(*id))
    }

    pub fn unit_option(&self, unit: UnitHandle, name: &str) -> Option<&Value> {
        self.units.get(&unit.0).and_then(|u| u.options.get(name))
    }

    pub fn connections(&self) -> &[(UnitHandle, u32, PortHandle, u32)] {
        &self.connections
    }

    pub fn invocations(&self) -> &[Invocation] {
        &self.invocations
    }

    /// Force a raw engine value (e.g. -inf dB on a meter) for tests.
    pub fn force_param_value(&mut self, param: ParamHandle, value: f64) {
        if let Some(p) = self.params.get_mut(&param.0) {
            p.value = value;
        }
    }

    pub fn event_count(&self) -> usize {
        self.timeline.len()
    }

    fn pop_due(&mut self, target: f64) -> Option<(f64, Rc<RefCell<EngineCallback>>)> {
        // Earliest due event; ties break on registration order.
        let mut best: Option<(u64, f64)> = None;
        for (id, event) in &self.timeline {
            if let Some(at) = event.due(target) {
                match best {
                    Some((bid, bt)) if (bt, bid) <= (at, *id) => {}
                    _ => best = Some((*id, at)),
                }
            }
        }
        let (id, at) = best?;

        let event = self.timeline.get_mut(&id).expect("due event exists");
        let callback = event.callback.clone();
        let mut remove = false;
        match &mut event.cadence {
            Cadence::Plain { fired, .. } => *fired = true,
            Cadence::Once { .. } => remove = true,
            Cadence::Repeat { interval, next, .. } => *next += *interval,
        }
        if remove {
            self.timeline.remove(&id);
        }

        // Fire-time code observes the fire time as the current clock.
        self.seconds = at;
        Some((at, callback))
    }

    /// Advance the transport clock, firing every due registration in time
    /// order. Does nothing while the transport is stopped or paused.
    pub fn advance(this: &Rc<RefCell<Self>>, dt: f64) {
        let target = {
            let backend = this.borrow();
            if !backend.transport_running {
                return;
            }
            backend.seconds + dt
        };
        loop {
            let due = this.borrow_mut().pop_due(target);
            match due {
                Some((at, callback)) => (callback.borrow_mut())(at),
                None => break,
            }
        }
        this.borrow_mut().seconds = target;
    }

    fn reset_timeline(&mut self) {
        for event in self.timeline.values_mut() {
            match &mut event.cadence {
                Cadence::Plain { fired, .. } => *fired = false,
                Cadence::Once { .. } => {}
                Cadence::Repeat {
                    start_time, next, ..
                } => *next = *start_time,
            }
        }
    }

    fn register(&mut self, cadence: Cadence, callback: EngineCallback) -> EventHandle {
        let handle = EventHandle(self.next_event);
        self.next_event += 1;
        self.timeline.insert(
            handle.0,
            TimelineEvent {
                cadence,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        handle
    }

    fn refresh_tempo_followers(&mut self) {
        let bpm = self.params[&self.tempo.0].value;
        let followers: Vec<(u64, f64)> = self
            .params
            .iter()
            .filter_map(|(id, p)| p.tempo_ratio.map(|r| (*id, r)))
            .collect();
        for (id, ratio) in followers {
            if let Some(p) = self.params.get_mut(&id) {
                p.value = bpm * ratio;
            }
        }
    }
}

impl Default for OfflineBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for OfflineBackend {
    fn create_unit(&mut self, spec: &UnitSpec) -> Result<UnitHandle> {
        debug!(class = %spec.class, "create unit");
        Ok(self.build_unit(spec, true))
    }

    fn create_unit_async(&mut self, spec: &UnitSpec) -> Result<UnitHandle> {
        debug!(class = %spec.class, "begin async unit build");
        Ok(self.build_unit(spec, false))
    }

    fn unit_ready(&self, unit: UnitHandle) -> bool {
        self.units.get(&unit.0).map(|u| u.ready).unwrap_or(false)
    }

    fn take_ready_units(&mut self) -> Vec<UnitHandle> {
        std::mem::take(&mut self.ready_queue)
    }

    fn unit_sub(&self, unit: UnitHandle, role: &str) -> Option<UnitHandle> {
        self.units.get(&unit.0).and_then(|u| u.subs.get(role)).copied()
    }

    fn unit_param(&self, unit: UnitHandle, name: &str) -> Option<ParamHandle> {
        self.units
            .get(&unit.0)
            .and_then(|u| u.params.get(name))
            .copied()
    }

    fn set_unit_option(&mut self, unit: UnitHandle, name: &str, value: &Value) -> Result<()> {
        let class = self.unit(unit)?.class.clone();
        if !valid_option(&class, name, value) {
            return Err(SyncError::Backend(format!(
                "invalid value for {}.{}: {}",
                class, name, value
            )));
        }
        if let Some(u) = self.units.get_mut(&unit.0) {
            u.options.insert(name.to_string(), value.clone());
        }
        Ok(())
    }

    fn invoke(&mut self, unit: UnitHandle, method: &str, args: &[Value]) -> Result<()> {
        let at = self.seconds;
        {
            let u = self.unit(unit)?;
            if u.disposed {
                return Err(SyncError::Backend(format!(
                    "invoke on disposed unit: {:?}",
                    unit
                )));
            }
        }
        if let Some(u) = self.units.get_mut(&unit.0) {
            match method {
                "start" => u.started = true,
                "stop" => u.started = false,
                _ => {}
            }
        }
        self.invocations.push(Invocation {
            unit,
            method: method.to_string(),
            args: args.to_vec(),
            at,
        });
        Ok(())
    }

    fn dispose_unit(&mut self, unit: UnitHandle) {
        let subs: Vec<UnitHandle> = match self.units.get_mut(&unit.0) {
            Some(u) if !u.disposed => {
                u.disposed = true;
                u.started = false;
                u.subs.values().copied().collect()
            }
            _ => return,
        };
        // Disposal severs every connection touching the unit.
        self.connections
            .retain(|(src, _, dst, _)| *src != unit && *dst != PortHandle::Unit(unit));
        for sub in subs {
            self.dispose_unit(sub);
        }
    }

    fn unit_disposed(&self, unit: UnitHandle) -> bool {
        self.units.get(&unit.0).map(|u| u.disposed).unwrap_or(true)
    }

    fn unit_state(&self, unit: UnitHandle) -> &'static str {
        match self.units.get(&unit.0) {
            Some(u) if u.started => "started",
            _ => "stopped",
        }
    }

    fn connect(
        &mut self,
        src: UnitHandle,
        output: u32,
        dst: PortHandle,
        input: u32,
    ) -> Result<()> {
        self.connect_ops += 1;
        let entry = (src, output, dst, input);
        if !self.connections.contains(&entry) {
            self.connections.push(entry);
        }
        if let PortHandle::Param(p) = dst {
            if let Some(param) = self.params.get_mut(&p.0) {
                param.overridden = true;
            }
        }
        Ok(())
    }

    fn disconnect(
        &mut self,
        src: UnitHandle,
        output: u32,
        dst: PortHandle,
        input: u32,
    ) -> Result<()> {
        self.disconnect_ops += 1;
        let entry = (src, output, dst, input);
        let before = self.connections.len();
        self.connections.retain(|c| *c != entry);
        if self.connections.len() == before {
            return Err(SyncError::Backend("no such connection".to_string()));
        }
        // Note: `overridden` stays latched after disconnect.
        Ok(())
    }

    fn set_param(&mut self, param: ParamHandle, value: f64) -> Result<()> {
        match self.params.get_mut(&param.0) {
            Some(p) => {
                p.value = value;
                if param == self.tempo {
                    self.refresh_tempo_followers();
                }
                Ok(())
            }
            None => Err(SyncError::Backend(format!("no such param: {:?}", param))),
        }
    }

    fn param_value(&self, param: ParamHandle) -> Result<f64> {
        Ok(self.param(param)?.value)
    }

    fn param_value_at(&self, param: ParamHandle, time: f64) -> Result<f64> {
        let p = self.param(param)?;
        if !p.automatable {
            return Err(SyncError::UnsupportedTrait {
                target: format!("{:?}", param),
                operation: "getValueAtTime".to_string(),
            });
        }
        let scheduled = p
            .points
            .iter()
            .filter(|(at, _)| *at <= time + EPS)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, v)| *v);
        Ok(scheduled.unwrap_or(p.value))
    }

    fn param_overridden(&self, param: ParamHandle) -> bool {
        self.params
            .get(&param.0)
            .map(|p| p.overridden)
            .unwrap_or(false)
    }

    fn automate_param(&mut self, param: ParamHandle, method: &str, args: &[Value]) -> Result<()> {
        let automatable = self.param(param)?.automatable;
        if !automatable {
            return Err(SyncError::UnsupportedTrait {
                target: format!("{:?}", param),
                operation: method.to_string(),
            });
        }
        // All supported automation methods carry (value, time).
        let value = args.first().and_then(Value::as_f64);
        let time = args.get(1).and_then(Value::as_f64);
        if let (Some(value), Some(time)) = (value, time) {
            if let Some(p) = self.params.get_mut(&param.0) {
                p.points.push((time, value));
            }
        }
        Ok(())
    }

    fn transport_start(&mut self) {
        self.transport_running = true;
    }

    fn transport_stop(&mut self) {
        self.transport_running = false;
        self.seconds = 0.0;
        self.reset_timeline();
    }

    fn transport_pause(&mut self) {
        self.transport_running = false;
    }

    fn transport_running(&self) -> bool {
        self.transport_running
    }

    fn transport_seconds(&self) -> f64 {
        self.seconds
    }

    fn set_transport_seconds(&mut self, seconds: f64) {
        self.seconds = seconds;
    }

    fn tempo_param(&self) -> ParamHandle {
        self.tempo
    }

    fn sync_param_to_tempo(&mut self, param: ParamHandle, ratio: f64) -> Result<()> {
        let bpm = self.params[&self.tempo.0].value;
        match self.params.get_mut(&param.0) {
            Some(p) => {
                p.tempo_ratio = Some(ratio);
                p.value = bpm * ratio;
                Ok(())
            }
            None => Err(SyncError::Backend(format!("no such param: {:?}", param))),
        }
    }

    fn unsync_param(&mut self, param: ParamHandle) -> Result<()> {
        match self.params.get_mut(&param.0) {
            Some(p) => {
                p.tempo_ratio = None;
                Ok(())
            }
            None => Err(SyncError::Backend(format!("no such param: {:?}", param))),
        }
    }

    fn schedule(&mut self, time: f64, callback: EngineCallback) -> EventHandle {
        self.register(Cadence::Plain { time, fired: false }, callback)
    }

    fn schedule_repeat(
        &mut self,
        interval: f64,
        start_time: f64,
        duration: Option<f64>,
        callback: EngineCallback,
    ) -> EventHandle {
        self.register(
            Cadence::Repeat {
                interval,
                start_time,
                duration,
                next: start_time,
            },
            callback,
        )
    }

    fn schedule_once(&mut self, time: f64, callback: EngineCallback) -> EventHandle {
        self.register(Cadence::Once { time }, callback)
    }

    fn clear_event(&mut self, event: EventHandle) {
        self.timeline.remove(&event.0);
    }

    fn cancel_after(&mut self, time: f64) {
        self.timeline
            .retain(|_, event| event.start_time() < time - EPS);
    }
}
