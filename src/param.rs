//! Parameter/signal bridge
//!
//! Keeps one declared scalar endpoint in lockstep with its live engine
//! parameter. The declared value is authoritative until an external signal
//! is connected into the parameter; from then on the parameter is
//! `overridden` and the declared value is re-read from the engine instead.

use serde_json::Value;
use tracing::debug;

use crate::backend::{finite_read, AudioBackend, ParamHandle};
use crate::error::{Result, SyncError};
use crate::model::UpdateBuffer;
use crate::protocol::EntityId;

/// Automation methods a scheduled step may invoke on a parameter.
pub const PARAM_METHODS: &[&str] = &[
    "setValueAtTime",
    "linearRampToValueAtTime",
    "exponentialRampToValueAtTime",
    "rampTo",
    "cancelScheduledValues",
];

/// Declared configuration of a parameter entity.
#[derive(Debug, Clone)]
pub struct ParamConfig {
    pub value: f64,
    /// Unit kind tag: "number", "frequency", "decibels", "time", ...
    pub units: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub convert: bool,
}

impl Default for ParamConfig {
    fn default() -> Self {
        ParamConfig {
            value: 0.0,
            units: "number".to_string(),
            min_value: None,
            max_value: None,
            convert: true,
        }
    }
}

impl ParamConfig {
    /// Read the declared attributes, falling back to defaults per field.
    pub fn from_attrs(attrs: &std::collections::HashMap<String, Value>) -> Self {
        let mut config = ParamConfig::default();
        if let Some(v) = attrs.get("value").and_then(Value::as_f64) {
            config.value = v;
        }
        if let Some(u) = attrs.get("units").and_then(Value::as_str) {
            config.units = u.to_string();
        }
        config.min_value = attrs.get("min_value").and_then(Value::as_f64);
        config.max_value = attrs.get("max_value").and_then(Value::as_f64);
        if let Some(c) = attrs.get("convert").and_then(Value::as_bool) {
            config.convert = c;
        }
        config
    }
}

/// One synchronized scalar endpoint. Owned by exactly one node; referenced
/// by the connection graph when used as an edge destination.
pub struct ParamBridge {
    pub id: EntityId,
    pub value: f64,
    pub units: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub convert: bool,
    pub overridden: bool,
    pub handle: Option<ParamHandle>,
    pub disposed: bool,
}

impl ParamBridge {
    pub fn new(id: EntityId, config: ParamConfig) -> Self {
        ParamBridge {
            id,
            value: config.value,
            units: config.units,
            min_value: config.min_value,
            max_value: config.max_value,
            convert: config.convert,
            overridden: false,
            handle: None,
            disposed: false,
        }
    }

    fn live(&self) -> Result<ParamHandle> {
        self.handle.ok_or_else(|| {
            SyncError::Config(format!("parameter {} has no live endpoint", self.id))
        })
    }

    /// Attach the live engine endpoint and push the declared value into it.
    /// Re-run whenever the owning unit is swapped out.
    pub fn bind(&mut self, backend: &mut dyn AudioBackend, handle: ParamHandle) -> Result<()> {
        self.handle = Some(handle);
        if !self.overridden {
            backend.set_param(handle, self.value)?;
        }
        Ok(())
    }

    /// Push a declared value into the live parameter. Range enforcement is
    /// the engine's job; the bridge forwards as-is.
    pub fn set_value(&mut self, backend: &mut dyn AudioBackend, value: f64) -> Result<()> {
        self.value = value;
        backend.set_param(self.live()?, value)
    }

    /// Immediate read-back, translated to a remote-representable number.
    pub fn value(&self, backend: &dyn AudioBackend) -> Result<f64> {
        Ok(finite_read(backend.param_value(self.live()?)?))
    }

    /// Automation-aware point read. Fails with an unsupported-trait error
    /// on parameter kinds that only support immediate reads.
    pub fn value_at_time(&self, backend: &dyn AudioBackend, time: f64) -> Result<f64> {
        let raw = backend.param_value_at(self.live()?, time);
        match raw {
            Ok(v) => Ok(finite_read(v)),
            Err(SyncError::UnsupportedTrait { .. }) => Err(SyncError::UnsupportedTrait {
                target: self.id.to_string(),
                operation: "getValueAtTime".to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Invoke an allow-listed automation method on the live parameter.
    pub fn automate(
        &mut self,
        backend: &mut dyn AudioBackend,
        method: &str,
        args: &[Value],
    ) -> Result<()> {
        if !PARAM_METHODS.contains(&method) {
            return Err(SyncError::MethodNotAllowed {
                kind: "Param".to_string(),
                method: method.to_string(),
            });
        }
        backend.automate_param(self.live()?, method, args)
    }

    /// Called by the connection graph right after this parameter became the
    /// destination of a connection update, once topology has converged. An
    /// incoming signal makes the engine ignore the static value, so the
    /// declared value is reset to the live read-back.
    pub fn on_connected_as_input_destination(
        &mut self,
        backend: &dyn AudioBackend,
        updates: &mut UpdateBuffer,
    ) -> Result<()> {
        let handle = match self.handle {
            Some(h) => h,
            None => return Ok(()),
        };
        if backend.param_overridden(handle) {
            self.overridden = true;
            self.value = finite_read(backend.param_value(handle)?);
            debug!(param = %self.id, value = self.value, "parameter overridden by incoming signal");
            updates.push(&self.id, "overridden", Value::Bool(true));
            updates.push(&self.id, "value", json_f64(self.value));
        }
        Ok(())
    }

    pub fn dispose(&mut self, updates: &mut UpdateBuffer) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.handle = None;
        updates.push(&self.id, "disposed", Value::Bool(true));
    }
}

pub(crate) fn json_f64(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
