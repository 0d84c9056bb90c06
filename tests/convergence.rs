//! End-to-end topology convergence through the wire protocol.

use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;

use tonelink::backend::{AudioBackend, NEG_INFINITY_SENTINEL};
use tonelink::offline::OfflineBackend;
use tonelink::protocol::{ClientMessage, EntityId};
use tonelink::session::Session;

fn session() -> (Rc<RefCell<OfflineBackend>>, Session) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let raw = OfflineBackend::shared();
    let session = Session::new(raw.clone());
    (raw, session)
}

fn send(session: &mut Session, msg: Value) {
    let msg: ClientMessage = serde_json::from_value(msg).expect("valid wire message");
    session.dispatch(msg).expect("message accepted");
}

fn connections(session: &mut Session, edges: &[(&str, &str)]) {
    let edges: Vec<Value> = edges
        .iter()
        .map(|(src, dst)| json!({"src": src, "dst": dst}))
        .collect();
    send(session, json!({"msg": "connections", "edges": edges}));
}

fn declare_chain(session: &mut Session) {
    send(
        session,
        json!({"msg": "create", "id": "osc-freq", "kind": "Param",
               "attrs": {"value": 440.0, "units": "frequency"}}),
    );
    send(
        session,
        json!({"msg": "create", "id": "osc", "kind": "Oscillator",
               "attrs": {"type": "sine", "_params": {"frequency": "osc-freq"}}}),
    );
    send(
        session,
        json!({"msg": "create", "id": "filter", "kind": "Filter",
               "attrs": {"type": "lowpass"}}),
    );
    send(
        session,
        json!({"msg": "create", "id": "main", "kind": "Destination", "attrs": {}}),
    );
}

#[test]
fn chain_declaration_converges_in_minimal_operations() {
    let (raw, mut session) = session();
    declare_chain(&mut session);

    connections(&mut session, &[("osc", "filter"), ("filter", "main")]);
    assert_eq!(raw.borrow().connect_ops, 2);
    assert_eq!(raw.borrow().connections().len(), 2);

    // identical declaration: nothing to do
    connections(&mut session, &[("osc", "filter"), ("filter", "main")]);
    assert_eq!(raw.borrow().connect_ops, 2);
    assert_eq!(raw.borrow().disconnect_ops, 0);

    // rerouting swaps exactly one edge
    connections(&mut session, &[("osc", "main"), ("filter", "main")]);
    assert_eq!(raw.borrow().connect_ops, 3);
    assert_eq!(raw.borrow().disconnect_ops, 1);
}

#[test]
fn dispose_then_reconcile_skips_engine_disconnect() {
    let (raw, mut session) = session();
    declare_chain(&mut session);
    connections(&mut session, &[("osc", "filter")]);

    send(&mut session, json!({"msg": "dispose", "id": "filter"}));
    assert!(raw.borrow().connections().is_empty());

    let before = raw.borrow().disconnect_ops;
    connections(&mut session, &[]);
    assert_eq!(raw.borrow().disconnect_ops, before);
}

#[test]
fn parameter_override_round_trip() {
    let (_raw, mut session) = session();
    send(
        &mut session,
        json!({"msg": "create", "id": "lfo", "kind": "Oscillator", "attrs": {}}),
    );
    send(
        &mut session,
        json!({"msg": "create", "id": "amount", "kind": "Param", "attrs": {"value": 0.8}}),
    );
    send(
        &mut session,
        json!({"msg": "create", "id": "gain", "kind": "Gain",
               "attrs": {"_params": {"gain": "amount"}}}),
    );
    session.take_updates();

    connections(&mut session, &[("lfo", "amount")]);
    let updates = session.take_updates();
    let overridden: Vec<_> = updates
        .iter()
        .filter(|u| u.target == EntityId::new("amount") && u.attr == "overridden")
        .collect();
    assert_eq!(overridden.len(), 1);
    assert_eq!(overridden[0].value, json!(true));
    assert!(updates
        .iter()
        .any(|u| u.target == EntityId::new("amount") && u.attr == "value"));

    // removal notifies the destination again; the flag stays latched
    connections(&mut session, &[]);
    let updates = session.take_updates();
    assert!(updates
        .iter()
        .any(|u| u.target == EntityId::new("amount")
            && u.attr == "overridden"
            && u.value == json!(true)));
    assert!(!updates
        .iter()
        .any(|u| u.attr == "overridden" && u.value == json!(false)));
}

#[test]
fn async_unit_queues_edges_until_ready() {
    let (raw, mut session) = session();
    declare_chain(&mut session);
    send(
        &mut session,
        json!({"msg": "create", "id": "verb-wet", "kind": "Param", "attrs": {"value": 0.4}}),
    );
    send(
        &mut session,
        json!({"msg": "create", "id": "verb", "kind": "Reverb",
               "attrs": {"decay": 3.0, "_params": {"wet": "verb-wet"}}}),
    );

    connections(&mut session, &[("osc", "verb"), ("verb", "main")]);
    assert_eq!(raw.borrow().connections().len(), 0);

    let unit = raw.borrow().find_unit("Reverb").expect("reverb unit exists");
    raw.borrow_mut().complete_build(unit);
    session.process_ready_units().unwrap();

    assert_eq!(raw.borrow().connections().len(), 2);
    // the wet parameter bound and received its declared value
    let wet = raw.borrow().unit_param(unit, "wet").unwrap();
    assert_eq!(raw.borrow().param_value(wet).unwrap(), 0.4);
}

#[test]
fn meter_reads_stay_finite() {
    let (raw, mut session) = session();
    send(
        &mut session,
        json!({"msg": "create", "id": "level", "kind": "Param", "attrs": {"value": 0.0}}),
    );
    send(
        &mut session,
        json!({"msg": "create", "id": "meter", "kind": "Meter",
               "attrs": {"_params": {"level": "level"}}}),
    );
    send(
        &mut session,
        json!({"msg": "create", "id": "obs", "kind": "ScheduleObserver",
               "attrs": {"observed_entity": "meter", "observed_trait": "level"}}),
    );
    session.take_updates();

    // a silent meter reports negative infinity inside the engine
    let meter = raw.borrow().find_unit("Meter").unwrap();
    let level = raw.borrow().unit_param(meter, "level").unwrap();
    raw.borrow_mut().force_param_value(level, f64::NEG_INFINITY);

    send(
        &mut session,
        json!({"msg": "command", "id": "obs",
               "payload": {"event": "observe_repeat", "update_interval": 1.0}}),
    );
    raw.borrow_mut().transport_start();
    OfflineBackend::advance(&raw, 2.0);

    let updates = session.take_updates();
    let levels: Vec<_> = updates.iter().filter(|u| u.attr == "level").collect();
    assert_eq!(levels.len(), 3);
    for update in levels {
        assert_eq!(update.value, json!(NEG_INFINITY_SENTINEL));
    }
}

#[test]
fn replace_swaps_unit_and_restores_topology() {
    let (raw, mut session) = session();
    send(
        &mut session,
        json!({"msg": "create", "id": "freq", "kind": "Param", "attrs": {"value": 220.0}}),
    );
    send(
        &mut session,
        json!({"msg": "create", "id": "synth", "kind": "Synth",
               "attrs": {"_params": {"oscillator.frequency": "freq"}}}),
    );
    send(
        &mut session,
        json!({"msg": "create", "id": "main", "kind": "Destination", "attrs": {}}),
    );
    connections(&mut session, &[("synth", "main")]);
    assert_eq!(raw.borrow().connections().len(), 1);

    let old = raw.borrow().find_unit("Synth").unwrap();
    send(
        &mut session,
        json!({"msg": "command", "id": "synth", "payload": {"event": "replace"}}),
    );

    assert!(raw.borrow().unit_disposed(old));
    assert_eq!(raw.borrow().connections().len(), 1);

    // the declared frequency survives into the replacement unit
    let synth = raw.borrow().find_unit("Synth").unwrap();
    assert_ne!(synth, old);
    let osc = raw.borrow().unit_sub(synth, "oscillator").unwrap();
    let freq = raw.borrow().unit_param(osc, "frequency").unwrap();
    assert_eq!(raw.borrow().param_value(freq).unwrap(), 220.0);
}
