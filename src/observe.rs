//! Periodic trait observation
//!
//! The remote side cannot poll engine-side state across the process
//! boundary, so it declares observers: each one reads a single trait of a
//! single entity at a fixed cadence and pushes the value into the update
//! buffer. Reads go through [`finite_read`] so infinities never cross the
//! boundary.

use serde_json::Value;
use tracing::error;

use crate::backend::{finite_read, AudioBackend, EventHandle, SharedBackend};
use crate::error::{Result, SyncError};
use crate::expr::PPQ;
use crate::model::{ModelStore, SharedStore, SharedUpdates};
use crate::param::json_f64;
use crate::protocol::EntityId;

/// What an observer points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveTarget {
    Transport,
    Entity(EntityId),
}

/// Read one observable trait of an entity. With `at`, parameter reads are
/// automation-aware point queries against the transport-synchronized fire
/// time instead of immediate reads.
pub fn read_entity_trait(
    store: &ModelStore,
    backend: &dyn AudioBackend,
    id: &EntityId,
    trait_name: &str,
    at: Option<f64>,
) -> Result<Value> {
    let read_param = |param: &crate::param::ParamBridge| match at {
        Some(time) => param.value_at_time(backend, time),
        None => param.value(backend),
    };
    if let Ok(param) = store.param(id) {
        return Ok(json_f64(read_param(param)?));
    }
    let node = store.node(id)?;
    match trait_name {
        "state" => Ok(Value::String(
            backend.unit_state(node.live_unit()?).to_string(),
        )),
        name => {
            // parameter endpoint whose engine path ends on the trait name
            let param_id = node
                .sub_params
                .iter()
                .find(|(_, path)| path.rsplit('.').next() == Some(name))
                .map(|(id, _)| id.clone())
                .ok_or_else(|| SyncError::UnsupportedTrait {
                    target: id.to_string(),
                    operation: format!("observe {}", name),
                })?;
            Ok(json_f64(read_param(store.param(&param_id)?)?))
        }
    }
}

/// Read one observable transport trait straight off the backend clock.
pub fn read_transport_trait(
    backend: &dyn AudioBackend,
    trait_name: &str,
    beats_per_measure: u32,
) -> Result<Value> {
    let bpm = finite_read(backend.param_value(backend.tempo_param())?);
    let seconds = backend.transport_seconds();
    match trait_name {
        "seconds" => Ok(json_f64(seconds)),
        "ticks" => Ok(json_f64(seconds * bpm / 60.0 * PPQ)),
        "position" => {
            let total_beats = seconds * bpm / 60.0;
            let sig = beats_per_measure as f64;
            let bars = (total_beats / sig).floor();
            let beats = (total_beats - bars * sig).floor();
            let sixteenths = (total_beats - bars * sig - beats) * 4.0;
            Ok(Value::String(format!(
                "{}:{}:{}",
                bars as u64,
                beats as u64,
                sixteenths.round() as u64
            )))
        }
        "state" => Ok(Value::String(
            if backend.transport_running() {
                "started"
            } else {
                "stopped"
            }
            .to_string(),
        )),
        other => Err(SyncError::UnsupportedTrait {
            target: "transport".to_string(),
            operation: format!("observe {}", other),
        }),
    }
}

/// One declared observer: target entity, trait name, cadence registration.
pub struct Observer {
    pub id: EntityId,
    pub target: ObserveTarget,
    pub trait_name: String,
    backend: SharedBackend,
    store: SharedStore,
    updates: SharedUpdates,
    handle: Option<EventHandle>,
}

impl Observer {
    pub fn new(
        id: EntityId,
        target: ObserveTarget,
        trait_name: String,
        backend: SharedBackend,
        store: SharedStore,
        updates: SharedUpdates,
    ) -> Self {
        Observer {
            id,
            target,
            trait_name,
            backend,
            store,
            updates,
            handle: None,
        }
    }

    /// Begin pushing the observed trait every `update_interval` seconds on
    /// the transport timeline. Re-observing replaces the previous cadence.
    /// With `transport_sync`, parameter targets are read at the fire time so
    /// scheduled automation shows up in the pushed values.
    pub fn observe(
        &mut self,
        update_interval: f64,
        beats_per_measure: u32,
        transport_sync: bool,
    ) -> Result<()> {
        self.cancel();

        let backend = self.backend.clone();
        let store = self.store.clone();
        let updates = self.updates.clone();
        let observer_id = self.id.clone();
        let target = self.target.clone();
        let trait_name = self.trait_name.clone();

        let callback = Box::new(move |time: f64| {
            let read = {
                let backend = backend.borrow();
                match &target {
                    ObserveTarget::Transport => {
                        read_transport_trait(&*backend, &trait_name, beats_per_measure)
                    }
                    ObserveTarget::Entity(id) => {
                        let store = store.borrow();
                        read_entity_trait(
                            &store,
                            &*backend,
                            id,
                            &trait_name,
                            transport_sync.then_some(time),
                        )
                    }
                }
            };
            match read {
                Ok(value) => updates
                    .borrow_mut()
                    .push(&observer_id, trait_name.clone(), value),
                Err(e) => error!(observer = %observer_id, error = %e, "observation failed"),
            }
        });

        let handle = self
            .backend
            .borrow_mut()
            .schedule_repeat(update_interval, 0.0, None, callback);
        self.handle = Some(handle);
        Ok(())
    }

    /// Stop pushing. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.backend.borrow_mut().clear_event(handle);
        }
    }
}
