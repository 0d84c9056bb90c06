//! Event-like entities on the transport timeline
//!
//! Five flavors share one chassis: a single event, a loop, a part (notes at
//! explicit times), a sequence (nested subdivisions) and a pattern (cycling
//! values). The fire-time callback is declared as data and compiled once;
//! per-fire controls (mute, probability, humanize, playback rate) live in a
//! shared cell so attribute changes apply to registrations already in the
//! engine timeline.

use std::cell::RefCell;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::{debug, error};

use crate::backend::{EngineCallback, EventHandle, SharedBackend};
use crate::error::{Result, SyncError};
use crate::expr::resolve_time;
use crate::model::{SharedStore, UpdateBuffer};
use crate::protocol::{EntityId, StepDescriptor, TimeValue};
use crate::transport::{compile_steps, fire_steps, CompiledStep, PlayState};

/// Per-fire controls, shared with live registrations.
#[derive(Debug, Clone)]
pub struct EventControls {
    pub mute: bool,
    pub probability: f64,
    /// Random fire-time jitter, in seconds, applied symmetrically.
    pub humanize: f64,
    pub playback_rate: f64,
}

impl Default for EventControls {
    fn default() -> Self {
        EventControls {
            mute: false,
            probability: 1.0,
            humanize: 0.0,
            playback_rate: 1.0,
        }
    }
}

/// Value cycling order of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternOrder {
    Up,
    Down,
    UpDown,
    DownUp,
    Random,
    RandomOnce,
    RandomWalk,
}

impl PatternOrder {
    pub fn from_decl(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(PatternOrder::Up),
            "down" => Ok(PatternOrder::Down),
            "upDown" => Ok(PatternOrder::UpDown),
            "downUp" => Ok(PatternOrder::DownUp),
            "random" => Ok(PatternOrder::Random),
            "randomOnce" => Ok(PatternOrder::RandomOnce),
            "randomWalk" => Ok(PatternOrder::RandomWalk),
            other => Err(SyncError::Config(format!("unknown pattern order: {}", other))),
        }
    }
}

/// Index progression through a pattern's values.
pub struct PatternCursor {
    order: PatternOrder,
    len: usize,
    index: usize,
    ascending: bool,
    shuffled: Vec<usize>,
    started: bool,
}

impl PatternCursor {
    fn new(order: PatternOrder, len: usize) -> Self {
        PatternCursor {
            order,
            len,
            index: 0,
            ascending: !matches!(order, PatternOrder::Down | PatternOrder::DownUp),
            shuffled: Vec::new(),
            started: false,
        }
    }

    fn next(&mut self, rng: &mut StdRng) -> usize {
        let len = self.len;
        if len <= 1 {
            return 0;
        }
        if !self.started {
            self.started = true;
            self.index = match self.order {
                PatternOrder::Down | PatternOrder::DownUp => len - 1,
                PatternOrder::Random => rng.gen_range(0..len),
                PatternOrder::RandomOnce => {
                    self.shuffled = (0..len).collect();
                    self.shuffled.shuffle(rng);
                    self.shuffled[0]
                }
                PatternOrder::RandomWalk => rng.gen_range(0..len),
                _ => 0,
            };
            if self.order == PatternOrder::RandomOnce {
                self.index = 0;
                return self.shuffled[0];
            }
            return self.index;
        }
        match self.order {
            PatternOrder::Up => {
                self.index = (self.index + 1) % len;
                self.index
            }
            PatternOrder::Down => {
                self.index = if self.index == 0 { len - 1 } else { self.index - 1 };
                self.index
            }
            PatternOrder::UpDown | PatternOrder::DownUp => {
                if self.ascending {
                    if self.index + 1 >= len {
                        self.ascending = false;
                        self.index -= 1;
                    } else {
                        self.index += 1;
                    }
                } else if self.index == 0 {
                    self.ascending = true;
                    self.index = 1;
                } else {
                    self.index -= 1;
                }
                self.index
            }
            PatternOrder::Random => {
                self.index = rng.gen_range(0..len);
                self.index
            }
            PatternOrder::RandomOnce => {
                self.index = (self.index + 1) % len;
                self.shuffled[self.index]
            }
            PatternOrder::RandomWalk => {
                let step: i64 = if rng.gen::<bool>() { 1 } else { -1 };
                let next = self.index as i64 + step;
                self.index = next.rem_euclid(len as i64) as usize;
                self.index
            }
        }
    }
}

/// A note inside a part.
#[derive(Debug, Clone)]
pub struct PartNote {
    pub time: TimeValue,
    pub value: Value,
    handle: Option<EventHandle>,
}

/// Kind-specific shape of an event-like entity.
pub enum EventBody {
    Single {
        time: TimeValue,
        value: Option<Value>,
    },
    Loop {
        interval: TimeValue,
        iterations: Option<u64>,
    },
    Part {
        notes: Vec<PartNote>,
    },
    Sequence {
        /// Nested arrays of values; `null` entries are rests.
        events: Value,
        subdivision: TimeValue,
    },
    Pattern {
        values: Vec<Value>,
        interval: TimeValue,
        cursor: Rc<RefCell<PatternCursor>>,
    },
}

fn attr_time(attrs: &std::collections::HashMap<String, Value>, key: &str) -> Option<TimeValue> {
    attrs
        .get(key)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

impl EventBody {
    /// Build from a declared kind plus initial attributes.
    pub fn from_decl(kind: &str, attrs: &std::collections::HashMap<String, Value>) -> Result<Self> {
        match kind {
            "Event" => Ok(EventBody::Single {
                time: attr_time(attrs, "time").unwrap_or_default(),
                value: attrs.get("value").cloned(),
            }),
            "Loop" => Ok(EventBody::Loop {
                interval: attr_time(attrs, "interval")
                    .unwrap_or(TimeValue::Notation("8n".to_string())),
                iterations: attrs.get("iterations").and_then(Value::as_u64),
            }),
            "Part" => {
                let mut notes = Vec::new();
                if let Some(Value::Array(items)) = attrs.get("events") {
                    for item in items {
                        notes.push(parse_note(item)?);
                    }
                }
                Ok(EventBody::Part { notes })
            }
            "Sequence" => Ok(EventBody::Sequence {
                events: attrs.get("events").cloned().unwrap_or(Value::Array(vec![])),
                subdivision: attr_time(attrs, "subdivision")
                    .unwrap_or(TimeValue::Notation("8n".to_string())),
            }),
            "Pattern" => {
                let values = match attrs.get("values") {
                    Some(Value::Array(v)) => v.clone(),
                    _ => Vec::new(),
                };
                let order = match attrs.get("pattern").and_then(Value::as_str) {
                    Some(s) => PatternOrder::from_decl(s)?,
                    None => PatternOrder::Up,
                };
                let cursor = Rc::new(RefCell::new(PatternCursor::new(order, values.len())));
                Ok(EventBody::Pattern {
                    values,
                    interval: attr_time(attrs, "interval")
                        .unwrap_or(TimeValue::Notation("8n".to_string())),
                    cursor,
                })
            }
            other => Err(SyncError::Config(format!("unknown event kind: {}", other))),
        }
    }
}

fn parse_note(item: &Value) -> Result<PartNote> {
    let time = item
        .get("time")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .ok_or_else(|| SyncError::Config(format!("part note needs a time: {}", item)))?;
    Ok(PartNote {
        time,
        value: item.clone(),
        handle: None,
    })
}

enum ValueSource {
    Fixed(Option<Value>),
    Pattern {
        values: Vec<Value>,
        cursor: Rc<RefCell<PatternCursor>>,
    },
}

fn build_callback(
    id: EntityId,
    backend: SharedBackend,
    store: SharedStore,
    steps: Rc<RefCell<Vec<CompiledStep>>>,
    source: ValueSource,
    controls: Rc<RefCell<EventControls>>,
    rng: Rc<RefCell<StdRng>>,
    beats_per_measure: u32,
) -> EngineCallback {
    Box::new(move |time| {
        let (mute, probability, humanize) = {
            let c = controls.borrow();
            (c.mute, c.probability, c.humanize)
        };
        if mute {
            return;
        }
        if probability < 1.0 && rng.borrow_mut().gen::<f64>() >= probability {
            debug!(event = %id, "fire skipped by probability");
            return;
        }
        let fire_time = if humanize > 0.0 {
            time + rng.borrow_mut().gen_range(-humanize..=humanize)
        } else {
            time
        };
        let value = match &source {
            ValueSource::Fixed(v) => v.clone(),
            ValueSource::Pattern { values, cursor } => {
                if values.is_empty() {
                    return;
                }
                let index = cursor.borrow_mut().next(&mut rng.borrow_mut());
                values.get(index).cloned()
            }
        };
        let steps = steps.borrow();
        if let Err(e) = fire_steps(
            &backend,
            &store,
            &steps,
            fire_time,
            value.as_ref(),
            beats_per_measure,
        ) {
            error!(event = %id, error = %e, "event callback failed");
        }
    })
}

/// One event-like entity and its engine registrations.
pub struct EventEntity {
    pub id: EntityId,
    backend: SharedBackend,
    store: SharedStore,
    steps: Rc<RefCell<Vec<CompiledStep>>>,
    pub controls: Rc<RefCell<EventControls>>,
    rng: Rc<RefCell<StdRng>>,
    pub body: EventBody,
    state: PlayState,
    started_at: f64,
    handles: Vec<EventHandle>,
    time_signature: u32,
}

impl EventEntity {
    pub fn new(
        id: EntityId,
        body: EventBody,
        controls: EventControls,
        backend: SharedBackend,
        store: SharedStore,
    ) -> Self {
        EventEntity {
            id,
            backend,
            store,
            steps: Rc::new(RefCell::new(Vec::new())),
            controls: Rc::new(RefCell::new(controls)),
            rng: Rc::new(RefCell::new(StdRng::from_entropy())),
            body,
            state: PlayState::Stopped,
            started_at: 0.0,
            handles: Vec::new(),
            time_signature: 4,
        }
    }

    #[cfg(test)]
    fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Rc::new(RefCell::new(StdRng::seed_from_u64(seed)));
        self
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    fn bpm(&self) -> f64 {
        let backend = self.backend.borrow();
        let tempo = backend.tempo_param();
        backend.param_value(tempo).unwrap_or(120.0)
    }

    fn seconds_of(&self, time: &TimeValue) -> Result<f64> {
        resolve_time(time, self.bpm(), self.time_signature)
    }

    /// Replace the fire-time callback. Registrations already in the engine
    /// pick up the new steps on their next fire.
    pub fn set_callback(&mut self, items: &[StepDescriptor]) -> Result<()> {
        let compiled = {
            let store = self.store.borrow();
            compile_steps(&store, items)?
        };
        *self.steps.borrow_mut() = compiled;
        Ok(())
    }

    fn callback(&self, source: ValueSource) -> EngineCallback {
        build_callback(
            self.id.clone(),
            self.backend.clone(),
            self.store.clone(),
            self.steps.clone(),
            source,
            self.controls.clone(),
            self.rng.clone(),
            self.time_signature,
        )
    }

    /// Register on the transport timeline at `at` (default: timeline zero).
    pub fn start(&mut self, at: Option<&TimeValue>) -> Result<()> {
        if self.state == PlayState::Started {
            return Ok(());
        }
        let base = match at {
            Some(t) => self.seconds_of(t)?,
            None => 0.0,
        };
        self.started_at = base;
        let rate = self.controls.borrow().playback_rate.max(1e-6);
        let bpm = self.bpm();
        let sig = self.time_signature;

        // Registration plan, built without holding a borrow of the body.
        enum Reg {
            Once(f64, ValueSource),
            /// Plain registrations re-arm on transport stop; part notes
            /// remember their index for incremental removal.
            Plain(f64, ValueSource, Option<usize>),
            Repeat {
                interval: f64,
                start: f64,
                duration: Option<f64>,
                source: ValueSource,
            },
        }

        let mut plan: Vec<Reg> = Vec::new();
        match &self.body {
            EventBody::Single { time, value } => {
                let t = resolve_time(time, bpm, sig)?;
                plan.push(Reg::Once(base + t, ValueSource::Fixed(value.clone())));
            }
            EventBody::Loop { interval, iterations } => {
                let i = resolve_time(interval, bpm, sig)? / rate;
                plan.push(Reg::Repeat {
                    interval: i,
                    start: base,
                    duration: iterations.map(|n| (n.saturating_sub(1)) as f64 * i),
                    source: ValueSource::Fixed(None),
                });
            }
            EventBody::Part { notes } => {
                for (index, note) in notes.iter().enumerate() {
                    let t = resolve_time(&note.time, bpm, sig)?;
                    plan.push(Reg::Plain(
                        base + t,
                        ValueSource::Fixed(Some(note.value.clone())),
                        Some(index),
                    ));
                }
            }
            EventBody::Sequence { events, subdivision } => {
                let sub = resolve_time(subdivision, bpm, sig)? / rate;
                if let Value::Array(items) = events {
                    if !items.is_empty() {
                        let span = items.len() as f64 * sub;
                        for (offset, value) in flatten_sequence(events, 0.0, span) {
                            plan.push(Reg::Repeat {
                                interval: span,
                                start: base + offset,
                                duration: None,
                                source: ValueSource::Fixed(Some(value)),
                            });
                        }
                    }
                }
            }
            EventBody::Pattern { values, interval, cursor } => {
                let i = resolve_time(interval, bpm, sig)? / rate;
                plan.push(Reg::Repeat {
                    interval: i,
                    start: base,
                    duration: None,
                    source: ValueSource::Pattern {
                        values: values.clone(),
                        cursor: cursor.clone(),
                    },
                });
            }
        }

        for reg in plan {
            let handle = match reg {
                Reg::Once(t, source) => {
                    let cb = self.callback(source);
                    self.backend.borrow_mut().schedule_once(t, cb)
                }
                Reg::Plain(t, source, note_index) => {
                    let cb = self.callback(source);
                    let handle = self.backend.borrow_mut().schedule(t, cb);
                    if let (Some(i), EventBody::Part { notes }) = (note_index, &mut self.body) {
                        notes[i].handle = Some(handle);
                    }
                    handle
                }
                Reg::Repeat {
                    interval,
                    start,
                    duration,
                    source,
                } => {
                    let cb = self.callback(source);
                    self.backend
                        .borrow_mut()
                        .schedule_repeat(interval, start, duration, cb)
                }
            };
            self.handles.push(handle);
        }
        self.state = PlayState::Started;
        Ok(())
    }

    /// Remove every engine registration.
    pub fn stop(&mut self) {
        let mut backend = self.backend.borrow_mut();
        for handle in self.handles.drain(..) {
            backend.clear_event(handle);
        }
        if let EventBody::Part { notes } = &mut self.body {
            for note in notes {
                note.handle = None;
            }
        }
        self.state = PlayState::Stopped;
    }

    /// Externally visible event count, for parts and sequences.
    pub fn length(&self) -> Option<usize> {
        match &self.body {
            EventBody::Part { notes } => Some(notes.len()),
            EventBody::Sequence { events, .. } => match events {
                Value::Array(items) => Some(items.len()),
                _ => Some(0),
            },
            _ => None,
        }
    }

    fn push_length(&self, updates: &mut UpdateBuffer) {
        if let Some(len) = self.length() {
            updates.push(&self.id, "length", Value::from(len));
        }
    }

    /// Add a note to a part; live parts register it immediately.
    pub fn note_add(&mut self, item: &Value, updates: &mut UpdateBuffer) -> Result<()> {
        let note = parse_note(item)?;
        if !matches!(self.body, EventBody::Part { .. }) {
            return Err(SyncError::UnsupportedTrait {
                target: self.id.to_string(),
                operation: "add".to_string(),
            });
        }
        let live = self.state == PlayState::Started;
        let handle = if live {
            let t = self.seconds_of(&note.time)?;
            let cb = self.callback(ValueSource::Fixed(Some(note.value.clone())));
            let handle = self.backend.borrow_mut().schedule(self.started_at + t, cb);
            self.handles.push(handle);
            Some(handle)
        } else {
            None
        };
        if let EventBody::Part { notes } = &mut self.body {
            notes.push(PartNote { handle, ..note });
        }
        self.push_length(updates);
        Ok(())
    }

    /// Add or replace the note at `time`.
    pub fn note_at(
        &mut self,
        time: &TimeValue,
        value: &Value,
        updates: &mut UpdateBuffer,
    ) -> Result<()> {
        self.note_remove(Some(time), None, updates)?;
        let mut item = value.clone();
        if let Value::Object(map) = &mut item {
            map.insert("time".to_string(), serde_json::to_value(time).unwrap_or(Value::Null));
        }
        self.note_add(&item, updates)
    }

    /// Remove notes matching the given time and/or value.
    pub fn note_remove(
        &mut self,
        time: Option<&TimeValue>,
        value: Option<&Value>,
        updates: &mut UpdateBuffer,
    ) -> Result<()> {
        let target = match time {
            Some(t) => Some(self.seconds_of(t)?),
            None => None,
        };
        let bpm = self.bpm();
        let sig = self.time_signature;
        let mut dropped = Vec::new();
        if let EventBody::Part { notes } = &mut self.body {
            notes.retain(|note| {
                let time_match = match target {
                    Some(t) => resolve_time(&note.time, bpm, sig)
                        .map(|nt| (nt - t).abs() < 1e-9)
                        .unwrap_or(false),
                    None => true,
                };
                let value_match = match value {
                    Some(v) => note.value.get("value") == Some(v) || note.value == *v,
                    None => true,
                };
                if time_match && value_match {
                    if let Some(h) = note.handle {
                        dropped.push(h);
                    }
                    false
                } else {
                    true
                }
            });
        }
        let mut backend = self.backend.borrow_mut();
        for handle in &dropped {
            backend.clear_event(*handle);
        }
        drop(backend);
        self.handles.retain(|h| !dropped.contains(h));
        self.push_length(updates);
        Ok(())
    }

    /// Remove every note from a part.
    pub fn note_clear(&mut self, updates: &mut UpdateBuffer) -> Result<()> {
        let mut dropped = Vec::new();
        if let EventBody::Part { notes } = &mut self.body {
            for note in notes.drain(..) {
                if let Some(h) = note.handle {
                    dropped.push(h);
                }
            }
        }
        let mut backend = self.backend.borrow_mut();
        for handle in &dropped {
            backend.clear_event(*handle);
        }
        drop(backend);
        self.handles.retain(|h| !dropped.contains(h));
        self.push_length(updates);
        Ok(())
    }

    /// Route a declared attribute change into the shared controls or, for
    /// `events`, into the contained note grid.
    pub fn set_attr(&mut self, attr: &str, value: &Value, updates: &mut UpdateBuffer) -> Result<()> {
        if attr == "events" {
            return self.replace_events(value, updates);
        }
        let mut controls = self.controls.borrow_mut();
        match attr {
            "mute" => controls.mute = value.as_bool().unwrap_or(false),
            "probability" => controls.probability = value.as_f64().unwrap_or(1.0),
            "humanize" => controls.humanize = value.as_f64().unwrap_or(0.0),
            "playback_rate" => controls.playback_rate = value.as_f64().unwrap_or(1.0),
            other => {
                return Err(SyncError::Config(format!(
                    "event has no attribute: {}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Wholesale replacement of a part's or sequence's declared events.
    /// Live entities re-register on the new contents.
    fn replace_events(&mut self, value: &Value, updates: &mut UpdateBuffer) -> Result<()> {
        match &mut self.body {
            EventBody::Part { notes } => {
                let mut next = Vec::new();
                if let Value::Array(items) = value {
                    for item in items {
                        next.push(parse_note(item)?);
                    }
                }
                *notes = next;
            }
            EventBody::Sequence { events, .. } => {
                *events = value.clone();
            }
            _ => {
                return Err(SyncError::UnsupportedTrait {
                    target: self.id.to_string(),
                    operation: "events".to_string(),
                })
            }
        }
        if self.state == PlayState::Started {
            let at = self.started_at;
            self.stop();
            self.start(Some(&TimeValue::Seconds(at)))?;
        }
        self.push_length(updates);
        Ok(())
    }
}

/// Flatten nested sequence arrays: each nesting level splits its parent
/// slot evenly; `null` entries are rests.
fn flatten_sequence(events: &Value, offset: f64, slot: f64) -> Vec<(f64, Value)> {
    match events {
        Value::Array(items) if !items.is_empty() => {
            let child_slot = slot / items.len() as f64;
            items
                .iter()
                .enumerate()
                .flat_map(|(i, item)| {
                    let at = offset + i as f64 * child_slot;
                    match item {
                        Value::Array(_) => flatten_sequence(item, at, child_slot),
                        Value::Null => Vec::new(),
                        other => vec![(at, other.clone())],
                    }
                })
                .collect()
        }
        _ => Vec::new(),
    }
}
