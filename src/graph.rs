//! Connection graph reconciliation
//!
//! The remote side declares the complete connection set on every change;
//! this module diffs the declaration against the applied topology and
//! issues only the connect/disconnect operations for edges that actually
//! changed. Edges touching a node still under asynchronous construction
//! queue on that node and apply when its unit becomes ready.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};

use crate::backend::AudioBackend;
use crate::error::{Result, SyncError};
use crate::model::{ModelStore, UpdateBuffer};
use crate::protocol::{Edge, EntityId};

/// Declared vs. applied topology.
#[derive(Default)]
pub struct ConnectionGraph {
    /// The full set most recently declared by the remote side.
    declared: HashSet<Edge>,
    /// Edges actually connected inside the engine.
    applied: HashSet<Edge>,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declared(&self) -> &HashSet<Edge> {
        &self.declared
    }

    pub fn is_applied(&self, edge: &Edge) -> bool {
        self.applied.contains(edge)
    }

    /// Replace the declared set, converging the engine topology onto it.
    /// Every destination touched by an added or removed edge is notified
    /// exactly once, after all topology operations have been issued.
    pub fn reconcile(
        &mut self,
        store: &mut ModelStore,
        backend: &mut dyn AudioBackend,
        updates: &mut UpdateBuffer,
        edges: Vec<Edge>,
    ) -> Result<()> {
        let target: HashSet<Edge> = edges.into_iter().collect();

        let removed: Vec<Edge> = self.declared.difference(&target).cloned().collect();
        let added: Vec<Edge> = target.difference(&self.declared).cloned().collect();
        debug!(added = added.len(), removed = removed.len(), "reconciling connections");

        let mut touched = BTreeSet::new();
        for edge in &removed {
            // Edges that never reached the engine did not touch their
            // destination; disposed destinations have nothing to re-read.
            let was_applied = self.applied.contains(edge);
            self.remove_edge(store, backend, edge)?;
            if was_applied && !store.entity_disposed(&edge.dst) {
                touched.insert(edge.dst.clone());
            }
        }

        for edge in added {
            if let Some(blocker) = store.construction_blocker(&edge.src, &edge.dst) {
                warn!(src = %edge.src, dst = %edge.dst, waiting_on = %blocker,
                    "queueing edge behind unit construction");
                store.node_mut(&blocker)?.pending_edges.push(edge);
                continue;
            }
            self.apply_edge(store, backend, &edge)?;
            touched.insert(edge.dst.clone());
        }

        self.declared = target;
        notify_destinations(store, backend, updates, touched)
    }

    /// Apply the edges that were queued behind `node`'s construction. Edges
    /// no longer in the declared set are dropped; edges whose other endpoint
    /// is still under construction re-queue there.
    pub fn flush_pending(
        &mut self,
        store: &mut ModelStore,
        backend: &mut dyn AudioBackend,
        updates: &mut UpdateBuffer,
        node: &EntityId,
    ) -> Result<()> {
        let queued = std::mem::take(&mut store.node_mut(node)?.pending_edges);

        let mut touched = BTreeSet::new();
        for edge in queued {
            if !self.declared.contains(&edge) {
                continue;
            }
            if let Some(blocker) = store.construction_blocker(&edge.src, &edge.dst) {
                store.node_mut(&blocker)?.pending_edges.push(edge);
                continue;
            }
            self.apply_edge(store, backend, &edge)?;
            touched.insert(edge.dst.clone());
        }
        notify_destinations(store, backend, updates, touched)
    }

    /// Re-issue every applied edge touching `node`, after its unit was
    /// swapped. The engine severed the old unit's connections on disposal.
    pub fn reapply_node(
        &mut self,
        store: &mut ModelStore,
        backend: &mut dyn AudioBackend,
        node: &EntityId,
    ) -> Result<()> {
        let edges: Vec<Edge> = self
            .applied
            .iter()
            .filter(|e| e.src == *node || e.dst == *node)
            .cloned()
            .collect();
        for edge in edges {
            self.apply_edge(store, backend, &edge)?;
        }
        Ok(())
    }

    fn apply_edge(
        &mut self,
        store: &ModelStore,
        backend: &mut dyn AudioBackend,
        edge: &Edge,
    ) -> Result<()> {
        let src = store
            .source_unit(&edge.src)
            .ok_or_else(|| SyncError::UnknownEntity(edge.src.clone()))?;
        let dst = store
            .dest_port(&edge.dst)
            .ok_or_else(|| SyncError::UnknownEntity(edge.dst.clone()))?;
        backend.connect(src, edge.output, dst, edge.input)?;
        self.applied.insert(edge.clone());
        Ok(())
    }

    fn remove_edge(
        &mut self,
        store: &ModelStore,
        backend: &mut dyn AudioBackend,
        edge: &Edge,
    ) -> Result<()> {
        // Pending edges disappear with the declaration; nothing to undo.
        if !self.applied.remove(edge) {
            return Ok(());
        }
        // Disposal already severed the engine-side connection.
        if store.entity_disposed(&edge.src) || store.entity_disposed(&edge.dst) {
            debug!(src = %edge.src, dst = %edge.dst, "skipping disconnect of disposed endpoint");
            return Ok(());
        }
        let src = store
            .source_unit(&edge.src)
            .ok_or_else(|| SyncError::UnknownEntity(edge.src.clone()))?;
        let dst = store
            .dest_port(&edge.dst)
            .ok_or_else(|| SyncError::UnknownEntity(edge.dst.clone()))?;
        backend.disconnect(src, edge.output, dst, edge.input)
    }
}

/// Tell each destination parameter it gained an incoming signal. Runs once
/// per destination after topology has converged.
fn notify_destinations(
    store: &mut ModelStore,
    backend: &dyn AudioBackend,
    updates: &mut UpdateBuffer,
    destinations: BTreeSet<EntityId>,
) -> Result<()> {
    for dst in destinations {
        if let Some(param_id) = store.destination_param(&dst) {
            store
                .param_mut(&param_id)?
                .on_connected_as_input_destination(backend, updates)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{bind_unit, dispose_node, instantiate, Node, NodeKind, PortRef};
    use crate::offline::OfflineBackend;
    use crate::param::{ParamBridge, ParamConfig};
    use serde_json::Value;

    struct Fixture {
        store: ModelStore,
        backend: OfflineBackend,
        updates: UpdateBuffer,
        graph: ConnectionGraph,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                store: ModelStore::new(),
                backend: OfflineBackend::new(),
                updates: UpdateBuffer::new(),
                graph: ConnectionGraph::new(),
            }
        }

        fn add(&mut self, id: &str, kind: NodeKind) {
            let id = EntityId::new(id);
            self.store
                .nodes
                .insert(id.clone(), Node::new(id.clone(), kind, Value::Null));
            instantiate(&mut self.store, &mut self.backend, &id).unwrap();
        }

        /// A Gain node whose `gain` parameter is a declared entity.
        fn add_gain(&mut self, id: &str, param: &str) {
            let node_id = EntityId::new(id);
            let param_id = EntityId::new(param);
            self.store.params.insert(
                param_id.clone(),
                ParamBridge::new(
                    param_id.clone(),
                    ParamConfig {
                        value: 1.0,
                        ..ParamConfig::default()
                    },
                ),
            );
            let mut node = Node::new(node_id.clone(), NodeKind::Gain, Value::Null);
            node.sub_params = vec![(param_id, "gain".to_string())];
            self.store.nodes.insert(node_id.clone(), node);
            instantiate(&mut self.store, &mut self.backend, &node_id).unwrap();
        }

        fn reconcile(&mut self, edges: &[&str]) {
            let edges = edges.iter().map(|e| Edge::from(*e)).collect();
            self.graph
                .reconcile(&mut self.store, &mut self.backend, &mut self.updates, edges)
                .unwrap();
        }
    }

    #[test]
    fn test_reconcile_issues_only_the_diff() {
        let mut fx = Fixture::new();
        fx.add("osc", NodeKind::Oscillator);
        fx.add("gain", NodeKind::Gain);
        fx.add("dest", NodeKind::Destination);

        fx.reconcile(&["osc->gain", "gain->dest"]);
        assert_eq!(fx.backend.connect_ops, 2);

        // unchanged edges are not re-issued
        fx.reconcile(&["osc->gain", "gain->dest"]);
        assert_eq!(fx.backend.connect_ops, 2);
        assert_eq!(fx.backend.disconnect_ops, 0);

        fx.reconcile(&["gain->dest"]);
        assert_eq!(fx.backend.connect_ops, 2);
        assert_eq!(fx.backend.disconnect_ops, 1);
    }

    #[test]
    fn test_full_replacement_converges_to_declared_set() {
        let mut fx = Fixture::new();
        fx.add("a", NodeKind::Oscillator);
        fx.add("b", NodeKind::Gain);
        fx.add("c", NodeKind::Gain);

        fx.reconcile(&["a->b"]);
        fx.reconcile(&["a->c"]);
        let conns = fx.backend.connections();
        assert_eq!(conns.len(), 1);
        assert_eq!(fx.backend.disconnect_ops, 1);
    }

    #[test]
    fn test_disconnect_skips_disposed_endpoints() {
        let mut fx = Fixture::new();
        fx.add("osc", NodeKind::Oscillator);
        fx.add("gain", NodeKind::Gain);
        fx.reconcile(&["osc->gain"]);

        dispose_node(
            &mut fx.store,
            &mut fx.backend,
            &mut fx.updates,
            &EntityId::new("gain"),
        );
        let before = fx.backend.disconnect_ops;
        fx.reconcile(&[]);
        assert_eq!(fx.backend.disconnect_ops, before);
    }

    #[test]
    fn test_pending_wiring_flushes_on_ready() {
        let mut fx = Fixture::new();
        fx.add("osc", NodeKind::Oscillator);
        fx.add("verb", NodeKind::Reverb);
        assert!(fx.store.node(&EntityId::new("verb")).unwrap().under_construction);

        fx.reconcile(&["osc->verb"]);
        assert_eq!(fx.backend.connect_ops, 0, "edge waits for construction");

        let verb = EntityId::new("verb");
        let unit = fx.store.node(&verb).unwrap().unit.unwrap();
        fx.backend.complete_build(unit);
        bind_unit(&mut fx.store, &mut fx.backend, &verb).unwrap();
        fx.graph
            .flush_pending(&mut fx.store, &mut fx.backend, &mut fx.updates, &verb)
            .unwrap();
        assert_eq!(fx.backend.connect_ops, 1);
        assert_eq!(fx.backend.connections().len(), 1);
    }

    #[test]
    fn test_queued_edge_dropped_if_undeclared_before_ready() {
        let mut fx = Fixture::new();
        fx.add("osc", NodeKind::Oscillator);
        fx.add("verb", NodeKind::Reverb);
        fx.reconcile(&["osc->verb"]);
        fx.reconcile(&[]);

        let verb = EntityId::new("verb");
        let unit = fx.store.node(&verb).unwrap().unit.unwrap();
        fx.backend.complete_build(unit);
        bind_unit(&mut fx.store, &mut fx.backend, &verb).unwrap();
        fx.graph
            .flush_pending(&mut fx.store, &mut fx.backend, &mut fx.updates, &verb)
            .unwrap();
        assert_eq!(fx.backend.connect_ops, 0);
    }

    #[test]
    fn test_destination_param_notified_once_after_convergence() {
        let mut fx = Fixture::new();
        fx.add("lfo", NodeKind::Oscillator);
        fx.add_gain("gain", "gain-amount");

        fx.reconcile(&["lfo->gain-amount"]);

        let param = fx.store.param(&EntityId::new("gain-amount")).unwrap();
        assert!(param.overridden);
        let pushed = fx.updates.take();
        let overridden_pushes = pushed
            .iter()
            .filter(|u| u.attr == "overridden")
            .count();
        assert_eq!(overridden_pushes, 1);
    }

    #[test]
    fn test_removed_edge_destination_renotified() {
        let mut fx = Fixture::new();
        fx.add("lfo", NodeKind::Oscillator);
        fx.add_gain("gain", "gain-amount");

        fx.reconcile(&["lfo->gain-amount"]);
        fx.updates.take();

        // removal re-notifies the destination so it re-reads the live
        // override state after topology has converged
        fx.reconcile(&[]);
        let pushed = fx.updates.take();
        assert!(pushed
            .iter()
            .any(|u| u.target == EntityId::new("gain-amount") && u.attr == "overridden"));
        // the engine keeps the flag latched after disconnect
        assert!(!pushed
            .iter()
            .any(|u| u.attr == "overridden" && u.value == Value::Bool(false)));
        assert!(fx.store.param(&EntityId::new("gain-amount")).unwrap().overridden);
    }

    #[test]
    fn test_signal_destination_routes_to_value_param() {
        let mut fx = Fixture::new();
        fx.add("lfo", NodeKind::Oscillator);

        // Signal node whose input delegates to its value parameter
        let sig_id = EntityId::new("sig");
        let val_id = EntityId::new("sig-value");
        fx.store.params.insert(
            val_id.clone(),
            ParamBridge::new(val_id.clone(), ParamConfig::default()),
        );
        let mut node = Node::new(
            sig_id.clone(),
            NodeKind::Signal(Default::default()),
            Value::Null,
        );
        node.sub_params = vec![(val_id.clone(), "value".to_string())];
        node.input = PortRef::Entity(val_id.clone());
        fx.store.nodes.insert(sig_id.clone(), node);
        instantiate(&mut fx.store, &mut fx.backend, &sig_id).unwrap();

        fx.reconcile(&["lfo->sig"]);
        assert!(fx.store.param(&val_id).unwrap().overridden);
    }

    #[test]
    fn test_reapply_after_unit_swap() {
        let mut fx = Fixture::new();
        fx.add("osc", NodeKind::Oscillator);
        fx.add("gain", NodeKind::Gain);
        fx.reconcile(&["osc->gain"]);

        let osc = EntityId::new("osc");
        crate::node::replace_unit(&mut fx.store, &mut fx.backend, &osc).unwrap();
        assert!(fx.backend.connections().is_empty());

        fx.graph
            .reapply_node(&mut fx.store, &mut fx.backend, &osc)
            .unwrap();
        assert_eq!(fx.backend.connections().len(), 1);
    }
}
