//! Transport scheduling through the wire protocol.

use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;

use tonelink::backend::AudioBackend;
use tonelink::error::SyncError;
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

fn try_send(session: &mut Session, msg: Value) -> Result<(), SyncError> {
    let msg: ClientMessage = serde_json::from_value(msg).expect("valid wire message");
    session.dispatch(msg)
}

fn declare_synth(session: &mut Session, id: &str) {
    send(
        session,
        json!({"msg": "create", "id": format!("{id}-freq"), "kind": "Param",
               "attrs": {"value": 440.0}}),
    );
    send(
        session,
        json!({"msg": "create", "id": id, "kind": "Synth",
               "attrs": {"_params": {"oscillator.frequency": format!("{id}-freq")}}}),
    );
}

fn schedule_repeat(session: &mut Session, event_id: u64, callee: &str, interval: &str, duration: Option<&str>) {
    send(
        session,
        json!({"msg": "command", "id": "transport", "payload": {
            "event": "schedule",
            "op": "repeat",
            "id": event_id,
            "interval": interval,
            "start_time": 0.0,
            "duration": duration,
            "items": [{
                "callee": callee,
                "method": "triggerAttackRelease",
                "args": {
                    "note": {"value": "C4", "eval": false},
                    "duration": {"value": "8n", "eval": false},
                    "time": {"value": "time", "eval": true},
                },
                "arg_keys": ["note", "duration", "time"],
            }],
        }}),
    );
}

fn start(session: &mut Session) {
    send(
        session,
        json!({"msg": "set", "id": "transport", "attr": "state", "value": "started"}),
    );
}

fn fire_times(raw: &Rc<RefCell<OfflineBackend>>) -> Vec<f64> {
    raw.borrow().invocations().iter().map(|i| i.at).collect()
}

#[test]
fn quarter_note_cadence_over_two_measures() {
    let (raw, mut session) = session();
    declare_synth(&mut session, "synth");
    schedule_repeat(&mut session, 1, "synth", "4n", Some("2m"));

    start(&mut session);
    OfflineBackend::advance(&raw, 10.0);

    // 120 bpm, 4/4: quarter notes for two measures, end inclusive
    let expected: Vec<f64> = (0..9).map(|i| i as f64 * 0.5).collect();
    assert_eq!(fire_times(&raw), expected);

    // fire-time expression passed the clock through
    let raw_ref = raw.borrow();
    let first = &raw_ref.invocations()[0];
    assert_eq!(first.args, vec![json!("C4"), json!("8n"), json!(0.0)]);
}

#[test]
fn clear_removes_one_registration_and_unknown_ids_error() {
    let (raw, mut session) = session();
    declare_synth(&mut session, "synth");
    schedule_repeat(&mut session, 1, "synth", "4n", None);
    schedule_repeat(&mut session, 2, "synth", "4n", None);

    send(
        &mut session,
        json!({"msg": "command", "id": "transport",
               "payload": {"event": "schedule_clear", "id": 1}}),
    );
    assert_eq!(raw.borrow().event_count(), 1);

    let err = try_send(
        &mut session,
        json!({"msg": "command", "id": "transport",
               "payload": {"event": "schedule_clear", "id": 1}}),
    );
    assert!(matches!(err, Err(SyncError::UnknownEvent(1))));

    start(&mut session);
    OfflineBackend::advance(&raw, 1.0);
    assert_eq!(fire_times(&raw), vec![0.0, 0.5, 1.0]);
}

#[test]
fn registration_waits_for_late_declaration() {
    let (raw, mut session) = session();
    schedule_repeat(&mut session, 9, "late", "4n", None);
    assert_eq!(raw.borrow().event_count(), 0);

    declare_synth(&mut session, "late");
    assert_eq!(raw.borrow().event_count(), 1);

    start(&mut session);
    OfflineBackend::advance(&raw, 1.0);
    assert_eq!(fire_times(&raw).len(), 3);
}

#[test]
fn clear_before_declaration_cancels_silently() {
    let (raw, mut session) = session();
    schedule_repeat(&mut session, 9, "late", "4n", None);
    send(
        &mut session,
        json!({"msg": "command", "id": "transport",
               "payload": {"event": "schedule_clear", "id": 9}}),
    );

    declare_synth(&mut session, "late");
    assert_eq!(raw.borrow().event_count(), 0);

    start(&mut session);
    OfflineBackend::advance(&raw, 2.0);
    assert!(fire_times(&raw).is_empty());
}

#[test]
fn cancel_drops_registrations_at_or_after_time() {
    let (raw, mut session) = session();
    declare_synth(&mut session, "synth");
    send(
        &mut session,
        json!({"msg": "command", "id": "transport", "payload": {
            "event": "schedule",
            "op": "once",
            "id": 1,
            "time": 0.5,
            "items": [{
                "callee": "synth",
                "method": "triggerAttack",
                "args": {"note": {"value": "C4", "eval": false}},
                "arg_keys": ["note"],
            }],
        }}),
    );
    send(
        &mut session,
        json!({"msg": "command", "id": "transport", "payload": {
            "event": "schedule",
            "op": "once",
            "id": 2,
            "time": 3.0,
            "items": [{
                "callee": "synth",
                "method": "triggerRelease",
                "args": {},
                "arg_keys": [],
            }],
        }}),
    );

    send(
        &mut session,
        json!({"msg": "command", "id": "transport",
               "payload": {"event": "schedule_cancel", "time": 1.0}}),
    );
    start(&mut session);
    OfflineBackend::advance(&raw, 5.0);
    assert_eq!(fire_times(&raw), vec![0.5]);
}

#[test]
fn part_note_edits_keep_length_consistent() {
    let (raw, mut session) = session();
    declare_synth(&mut session, "synth");
    send(
        &mut session,
        json!({"msg": "create", "id": "part", "kind": "Part", "attrs": {"events": []}}),
    );
    send(
        &mut session,
        json!({"msg": "command", "id": "part", "payload": {
            "event": "set_callback",
            "items": [{
                "callee": "synth",
                "method": "triggerAttackRelease",
                "args": {
                    "note": {"value": "value.note", "eval": true},
                    "duration": {"value": "8n", "eval": false},
                    "time": {"value": "time", "eval": true},
                },
                "arg_keys": ["note", "duration", "time"],
            }],
        }}),
    );
    send(
        &mut session,
        json!({"msg": "command", "id": "part", "payload": {
            "event": "play", "method": "start",
            "args": {"time": {"value": 0.0, "eval": false}}, "arg_keys": ["time"],
        }}),
    );
    session.take_updates();

    send(
        &mut session,
        json!({"msg": "command", "id": "part", "payload": {
            "event": "note_add", "arg": {"time": 0.0, "note": "C4"}}}),
    );
    send(
        &mut session,
        json!({"msg": "command", "id": "part", "payload": {
            "event": "note_at", "time": 0.5, "value": {"note": "E4"}}}),
    );
    send(
        &mut session,
        json!({"msg": "command", "id": "part", "payload": {
            "event": "note_remove", "time": 0.0}}),
    );

    let lengths: Vec<Value> = session
        .take_updates()
        .into_iter()
        .filter(|u| u.target == EntityId::new("part") && u.attr == "length")
        .map(|u| u.value)
        .collect();
    // add, replace-at (remove + add), remove
    assert_eq!(lengths.last(), Some(&json!(1)));

    start(&mut session);
    OfflineBackend::advance(&raw, 1.0);
    let notes: Vec<Value> = raw
        .borrow()
        .invocations()
        .iter()
        .map(|i| i.args[0].clone())
        .collect();
    assert_eq!(notes, vec![json!("E4")]);
}

#[test]
fn play_command_pushes_state() {
    let (raw, mut session) = session();
    declare_synth(&mut session, "synth");
    send(
        &mut session,
        json!({"msg": "create", "id": "loop", "kind": "Loop",
               "attrs": {"interval": 0.5}}),
    );
    send(
        &mut session,
        json!({"msg": "command", "id": "loop", "payload": {
            "event": "set_callback",
            "items": [{
                "callee": "synth",
                "method": "triggerAttack",
                "args": {"time": {"value": "time", "eval": true}},
                "arg_keys": ["time"],
            }],
        }}),
    );
    session.take_updates();

    send(
        &mut session,
        json!({"msg": "command", "id": "loop", "payload": {
            "event": "play", "method": "start", "args": {}, "arg_keys": [],
        }}),
    );
    let updates = session.take_updates();
    assert!(updates
        .iter()
        .any(|u| u.target == EntityId::new("loop")
            && u.attr == "state"
            && u.value == json!("started")));

    start(&mut session);
    OfflineBackend::advance(&raw, 1.0);
    assert_eq!(fire_times(&raw), vec![0.0, 0.5, 1.0]);

    send(
        &mut session,
        json!({"msg": "command", "id": "loop", "payload": {
            "event": "play", "method": "stop", "args": {}, "arg_keys": [],
        }}),
    );
    OfflineBackend::advance(&raw, 2.0);
    assert_eq!(fire_times(&raw).len(), 3);
}

#[test]
fn transport_position_observer_pushes_musical_time() {
    let (raw, mut session) = session();
    send(
        &mut session,
        json!({"msg": "create", "id": "obs", "kind": "ScheduleObserver",
               "attrs": {"observed_trait": "position"}}),
    );
    send(
        &mut session,
        json!({"msg": "command", "id": "obs",
               "payload": {"event": "observe_repeat", "update_interval": "4n", "transport": true}}),
    );

    start(&mut session);
    OfflineBackend::advance(&raw, 1.0);
    let positions: Vec<Value> = session
        .take_updates()
        .into_iter()
        .filter(|u| u.target == EntityId::new("obs") && u.attr == "position")
        .map(|u| u.value)
        .collect();
    assert_eq!(
        positions,
        vec![json!("0:0:0"), json!("0:1:0"), json!("0:2:0")]
    );
}

#[test]
fn stop_rewinds_and_rearms_plain_registrations() {
    let (raw, mut session) = session();
    declare_synth(&mut session, "synth");
    send(
        &mut session,
        json!({"msg": "command", "id": "transport", "payload": {
            "event": "schedule",
            "op": "plain",
            "id": 1,
            "time": 0.25,
            "items": [{
                "callee": "synth",
                "method": "triggerAttack",
                "args": {"note": {"value": "A4", "eval": false}},
                "arg_keys": ["note"],
            }],
        }}),
    );

    start(&mut session);
    OfflineBackend::advance(&raw, 1.0);
    assert_eq!(fire_times(&raw).len(), 1);

    send(
        &mut session,
        json!({"msg": "set", "id": "transport", "attr": "state", "value": "stopped"}),
    );
    assert_eq!(raw.borrow().transport_seconds(), 0.0);

    start(&mut session);
    OfflineBackend::advance(&raw, 1.0);
    assert_eq!(fire_times(&raw).len(), 2);
}
