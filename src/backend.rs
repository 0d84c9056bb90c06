//! Audio engine capability surface
//!
//! The DSP engine is an external collaborator. This trait is the full set of
//! capabilities the synchronization layer relies on: unit construction,
//! topology edits, parameter access, method invocation by name, disposal,
//! and the transport timeline. `crate::offline::OfflineBackend` is the
//! deterministic reference implementation used by the test suite.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use crate::error::Result;

/// Backend handle as shared by the session, components and fire-time
/// callbacks (single-threaded, event-loop driven).
pub type SharedBackend = Rc<RefCell<dyn AudioBackend>>;

/// Handle to a live processing unit inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitHandle(pub u64);

/// Handle to one controllable scalar endpoint of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamHandle(pub u64);

/// Engine-internal handle of a timeline registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// A connectable endpoint: a unit input or a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortHandle {
    Unit(UnitHandle),
    Param(ParamHandle),
}

/// Engine-level construction request: a unit class plus its options.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub class: String,
    pub options: Value,
}

impl UnitSpec {
    pub fn new(class: impl Into<String>, options: Value) -> Self {
        UnitSpec {
            class: class.into(),
            options,
        }
    }
}

/// Callback registered on the engine transport. The engine passes the
/// fire-time clock value (transport seconds).
pub type EngineCallback = Box<dyn FnMut(f64)>;

/// Finite stand-in for negative infinity at read-back boundaries.
///
/// Some engines report a fully attenuated signal as -Infinity dB; the remote
/// side's numeric encoding cannot represent infinities, so every read that
/// crosses the process boundary goes through [`finite_read`].
pub const NEG_INFINITY_SENTINEL: f64 = -1e20;

/// Translate an engine read into a remote-representable number.
pub fn finite_read(value: f64) -> f64 {
    if value == f64::NEG_INFINITY || value < NEG_INFINITY_SENTINEL {
        NEG_INFINITY_SENTINEL
    } else {
        value
    }
}

/// Everything the synchronization layer may ask of the audio engine.
pub trait AudioBackend {
    // --- units ---

    /// Construct a live unit from a configuration spec.
    fn create_unit(&mut self, spec: &UnitSpec) -> Result<UnitHandle>;

    /// Begin an asynchronous build (e.g. impulse-response generation). The
    /// handle is valid immediately but the unit is unusable until it shows
    /// up in [`AudioBackend::take_ready_units`].
    fn create_unit_async(&mut self, spec: &UnitSpec) -> Result<UnitHandle>;

    /// Whether an asynchronously built unit has finished building.
    fn unit_ready(&self, unit: UnitHandle) -> bool;

    /// Drain the set of units whose asynchronous build completed since the
    /// last call.
    fn take_ready_units(&mut self) -> Vec<UnitHandle>;

    /// Named sub-component of a unit (e.g. the "input" gain stage of a
    /// composite unit, or an oscillator nested inside a synthesizer).
    fn unit_sub(&self, unit: UnitHandle, role: &str) -> Option<UnitHandle>;

    /// Named parameter endpoint of a unit.
    fn unit_param(&self, unit: UnitHandle, name: &str) -> Option<ParamHandle>;

    /// Set a construction-time option on a live unit (e.g. filter type).
    /// The engine validates the value; invalid options are an error.
    fn set_unit_option(&mut self, unit: UnitHandle, name: &str, value: &Value) -> Result<()>;

    /// Invoke a method on a live unit ("start", "triggerAttackRelease", ...).
    fn invoke(&mut self, unit: UnitHandle, method: &str, args: &[Value]) -> Result<()>;

    /// Dispose a unit. Idempotent: disposing twice is a no-op.
    fn dispose_unit(&mut self, unit: UnitHandle);

    /// Whether the engine already disposed this unit (possibly by cascade).
    fn unit_disposed(&self, unit: UnitHandle) -> bool;

    /// Playback state of a source-like unit ("started" or "stopped").
    fn unit_state(&self, unit: UnitHandle) -> &'static str;

    // --- topology ---

    fn connect(&mut self, src: UnitHandle, output: u32, dst: PortHandle, input: u32)
        -> Result<()>;

    fn disconnect(
        &mut self,
        src: UnitHandle,
        output: u32,
        dst: PortHandle,
        input: u32,
    ) -> Result<()>;

    // --- parameters ---

    fn set_param(&mut self, param: ParamHandle, value: f64) -> Result<()>;

    /// Immediate value read.
    fn param_value(&self, param: ParamHandle) -> Result<f64>;

    /// Automation-aware point-in-time read. Errors with an unsupported-trait
    /// failure on parameters that only support immediate reads.
    fn param_value_at(&self, param: ParamHandle, time: f64) -> Result<f64>;

    /// Whether an external signal has been connected into this parameter.
    fn param_overridden(&self, param: ParamHandle) -> bool;

    /// Schedule an automation method on a parameter ("setValueAtTime", ...).
    fn automate_param(&mut self, param: ParamHandle, method: &str, args: &[Value]) -> Result<()>;

    // --- transport ---

    fn transport_start(&mut self);
    fn transport_stop(&mut self);
    fn transport_pause(&mut self);

    /// Whether the transport timeline is currently running.
    fn transport_running(&self) -> bool;

    /// Authoritative transport clock, in seconds on the transport timeline.
    fn transport_seconds(&self) -> f64;
    fn set_transport_seconds(&mut self, seconds: f64);

    /// The tempo parameter is live like any other parameter.
    fn tempo_param(&self) -> ParamHandle;

    /// Bind a parameter to follow the tempo at a fixed ratio.
    fn sync_param_to_tempo(&mut self, param: ParamHandle, ratio: f64) -> Result<()>;
    fn unsync_param(&mut self, param: ParamHandle) -> Result<()>;

    /// One-shot registration at an absolute transport time.
    fn schedule(&mut self, time: f64, callback: EngineCallback) -> EventHandle;

    /// Repeating registration: fires at `interval` cadence from `start_time`,
    /// inclusive of the final fire at `start_time + duration` when bounded.
    fn schedule_repeat(
        &mut self,
        interval: f64,
        start_time: f64,
        duration: Option<f64>,
        callback: EngineCallback,
    ) -> EventHandle;

    /// One-shot registration removed automatically after firing.
    fn schedule_once(&mut self, time: f64, callback: EngineCallback) -> EventHandle;

    /// Remove one registration. Unknown handles are ignored (the engine may
    /// have dropped the event already via `cancel_after` or auto-removal).
    fn clear_event(&mut self, event: EventHandle);

    /// Remove all registrations scheduled at or after `time`.
    fn cancel_after(&mut self, time: f64);
}
