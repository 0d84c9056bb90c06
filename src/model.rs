//! Entity registry, outbound update buffer and async node resolution
//!
//! Every synchronized entity lives in the [`ModelStore`]; attribute pushes
//! the remote side must observe accumulate in the [`UpdateBuffer`] until the
//! host transport drains them. Scheduler registrations whose target node has
//! not been declared yet park in the [`NodeResolver`] as explicit pending
//! continuations; declaring the node flushes them, cancelling an event id
//! drops them before they can ever register.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use crate::backend::{ParamHandle, PortHandle, UnitHandle};
use crate::error::{Result, SyncError};
use crate::node::{Node, NodeKind, PortRef};
use crate::param::ParamBridge;
use crate::protocol::{EntityId, SchedulePayload, StateUpdate};

pub type SharedStore = Rc<RefCell<ModelStore>>;
pub type SharedUpdates = Rc<RefCell<UpdateBuffer>>;

/// Accumulates outbound attribute pushes until the host drains them.
#[derive(Debug, Default)]
pub struct UpdateBuffer {
    updates: Vec<StateUpdate>,
}

impl UpdateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedUpdates {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn push(&mut self, target: &EntityId, attr: impl Into<String>, value: Value) {
        self.updates.push(StateUpdate::new(target, attr, value));
    }

    pub fn take(&mut self) -> Vec<StateUpdate> {
        std::mem::take(&mut self.updates)
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// All declared nodes and parameters, keyed by remote-visible id.
#[derive(Default)]
pub struct ModelStore {
    pub nodes: HashMap<EntityId, Node>,
    pub params: HashMap<EntityId, ParamBridge>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.nodes.contains_key(id) || self.params.contains_key(id)
    }

    pub fn node(&self, id: &EntityId) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| SyncError::UnknownEntity(id.clone()))
    }

    pub fn node_mut(&mut self, id: &EntityId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownEntity(id.clone()))
    }

    pub fn param(&self, id: &EntityId) -> Result<&ParamBridge> {
        self.params
            .get(id)
            .ok_or_else(|| SyncError::UnknownEntity(id.clone()))
    }

    pub fn param_mut(&mut self, id: &EntityId) -> Result<&mut ParamBridge> {
        self.params
            .get_mut(id)
            .ok_or_else(|| SyncError::UnknownEntity(id.clone()))
    }

    /// Whether the entity is gone or marked disposed. Unknown ids count as
    /// disposed: disposal-triggered teardown may race the declared edge set.
    pub fn entity_disposed(&self, id: &EntityId) -> bool {
        if let Some(node) = self.nodes.get(id) {
            return node.disposed;
        }
        if let Some(param) = self.params.get(id) {
            return param.disposed;
        }
        true
    }

    /// The live unit acting as the output side of a connection source.
    pub fn source_unit(&self, id: &EntityId) -> Option<UnitHandle> {
        self.nodes.get(id).and_then(|n| n.unit)
    }

    /// The live endpoint acting as the input side of a connection
    /// destination: a unit input, or a parameter for signal-like targets.
    pub fn dest_port(&self, id: &EntityId) -> Option<PortHandle> {
        if let Some(param) = self.params.get(id) {
            return param.handle.map(PortHandle::Param);
        }
        let node = self.nodes.get(id)?;
        if let PortRef::Entity(input_id) = &node.input {
            if let Some(param) = self.params.get(input_id) {
                if matches!(node.kind, NodeKind::Signal(_)) {
                    return param.handle.map(PortHandle::Param);
                }
            }
        }
        node.unit.map(PortHandle::Unit)
    }

    /// The parameter entity whose override state a new incoming connection
    /// affects, if the destination has one.
    pub fn destination_param(&self, id: &EntityId) -> Option<EntityId> {
        if self.params.contains_key(id) {
            return Some(id.clone());
        }
        let node = self.nodes.get(id)?;
        if !matches!(node.kind, NodeKind::Signal(_)) {
            return None;
        }
        match &node.input {
            PortRef::Entity(input_id) if self.params.contains_key(input_id) => {
                Some(input_id.clone())
            }
            _ => None,
        }
    }

    /// If either endpoint of a prospective connection is still under
    /// asynchronous construction, the node id the edge must wait on.
    pub fn construction_blocker(&self, src: &EntityId, dst: &EntityId) -> Option<EntityId> {
        for id in [src, dst] {
            if let Some(node) = self.nodes.get(id) {
                if node.under_construction {
                    return Some(id.clone());
                }
            }
        }
        None
    }

    /// Reverse lookup used when an asynchronous unit build completes.
    pub fn node_by_unit(&self, unit: UnitHandle) -> Option<EntityId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.unit == Some(unit))
            .map(|(id, _)| id.clone())
    }

    /// Engine handle of a parameter entity, if declared and bound.
    pub fn param_handle(&self, id: &EntityId) -> Option<ParamHandle> {
        self.params.get(id).and_then(|p| p.handle)
    }
}

/// Cooperative cancellation flag shared between the id-mapping table and a
/// parked registration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Rc<Cell<bool>>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

/// A scheduler registration waiting for its target node to be declared.
pub struct PendingRegistration {
    pub token: CancelToken,
    pub payload: SchedulePayload,
}

/// Pending-continuation table for remote-declared node resolution.
#[derive(Default)]
pub struct NodeResolver {
    pending: HashMap<EntityId, Vec<PendingRegistration>>,
}

impl NodeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a registration until `missing` is declared.
    pub fn defer(&mut self, missing: EntityId, token: CancelToken, payload: SchedulePayload) {
        self.pending.entry(missing).or_default().push(PendingRegistration { token, payload });
    }

    /// Take every registration waiting on `id`. Cancelled entries are
    /// dropped here and never see registration.
    pub fn take_for(&mut self, id: &EntityId) -> Vec<PendingRegistration> {
        self.pending
            .remove(id)
            .unwrap_or_default()
            .into_iter()
            .filter(|r| !r.token.is_cancelled())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}
