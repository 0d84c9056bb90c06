//! Wire-level message types for the cross-process protocol
//!
//! The remote declarer sends entity creation, attribute updates, command
//! messages and full connection-set replacements; the engine side answers
//! with attribute pushes (`StateUpdate`). The transport that carries these
//! messages is a black box; only the shapes are defined here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Remote-visible identifier of a synchronized entity.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_string())
    }
}

/// A declared connection edge. Identity is the full tuple; channel indices
/// default to the first output/input when omitted on the wire.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub src: EntityId,
    pub dst: EntityId,
    #[serde(default)]
    pub output: u32,
    #[serde(default)]
    pub input: u32,
}

impl Edge {
    pub fn new(src: impl Into<EntityId>, dst: impl Into<EntityId>) -> Self {
        Edge {
            src: src.into(),
            dst: dst.into(),
            output: 0,
            input: 0,
        }
    }
}

impl From<&str> for Edge {
    /// Shorthand "src->dst" used in tests.
    fn from(s: &str) -> Self {
        let (src, dst) = s.split_once("->").expect("edge shorthand is 'src->dst'");
        Edge::new(src.trim(), dst.trim())
    }
}

/// A point in time: either plain seconds or musical notation resolved
/// against the transport tempo ("4n", "8t", "2m", "0:2:0").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TimeValue {
    Seconds(f64),
    Notation(String),
}

impl Default for TimeValue {
    fn default() -> Self {
        TimeValue::Seconds(0.0)
    }
}

/// One callback argument: a literal forwarded as-is, or an expression
/// evaluated against the fire-time clock value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgDescriptor {
    pub value: Value,
    #[serde(default)]
    pub eval: bool,
}

impl ArgDescriptor {
    pub fn literal(value: Value) -> Self {
        ArgDescriptor { value, eval: false }
    }

    pub fn expr(source: impl Into<String>) -> Self {
        ArgDescriptor {
            value: Value::String(source.into()),
            eval: true,
        }
    }
}

/// One step of a serialized callback: invoke `method` on the entity
/// `callee`, passing the arguments named by `arg_keys` in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub callee: EntityId,
    pub method: String,
    pub args: HashMap<String, ArgDescriptor>,
    pub arg_keys: Vec<String>,
}

/// Scheduling flavor of a transport registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOp {
    /// Fires once at `time`, stays in the id table until cleared.
    Plain,
    /// Fires at `interval` cadence from `start_time` for `duration`.
    Repeat,
    /// Fires once at `time`, auto-removed after firing.
    Once,
}

/// Payload of a transport `schedule` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulePayload {
    pub op: ScheduleOp,
    /// Externally-visible event id, allocated by the declaring side.
    pub id: u64,
    pub items: Vec<StepDescriptor>,
    #[serde(default)]
    pub time: Option<TimeValue>,
    #[serde(default)]
    pub interval: Option<TimeValue>,
    #[serde(default)]
    pub start_time: Option<TimeValue>,
    #[serde(default)]
    pub duration: Option<TimeValue>,
}

/// Payload of a direct (non-scheduled) method invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub method: String,
    pub args: HashMap<String, ArgDescriptor>,
    pub arg_keys: Vec<String>,
}

/// Commands addressed to one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CommandPayload {
    /// Invoke a method on the target's live unit right away.
    Trigger(TriggerPayload),
    /// Register a callback on the transport timeline.
    Schedule(SchedulePayload),
    /// Remove one scheduled event by its externally-visible id.
    ScheduleClear { id: u64 },
    /// Remove all scheduled events at or after `time`.
    ScheduleCancel { time: TimeValue },
    /// Replace the fire-time callback of an event-like entity.
    SetCallback { items: Vec<StepDescriptor> },
    /// Start/stop an event-like entity on the transport timeline.
    Play(TriggerPayload),
    /// Add a note to a part.
    NoteAdd { arg: Value },
    /// Add or replace the note at a given time in a part.
    NoteAt { time: TimeValue, value: Value },
    /// Remove notes from a part, by time and/or by value.
    NoteRemove {
        #[serde(default)]
        time: Option<TimeValue>,
        #[serde(default)]
        value: Option<Value>,
    },
    /// Remove every note from a part.
    NoteClear,
    /// Periodically push an observed trait back to the declarer.
    ObserveRepeat {
        update_interval: TimeValue,
        #[serde(default)]
        transport: bool,
    },
    /// Stop pushing the observed trait.
    ObserveCancel,
    /// Bind a signal's value to the transport tempo at a fixed ratio.
    Sync { ratio: f64 },
    /// Release a tempo binding.
    Unsync,
    /// Swap the live unit of an instrument-like node in place.
    Replace,
}

/// Inbound messages from the declaring side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Declare a new entity of a named kind with initial attributes.
    Create {
        id: EntityId,
        kind: String,
        #[serde(default)]
        attrs: HashMap<String, Value>,
    },
    /// Mutate one attribute of an existing entity.
    Set {
        id: EntityId,
        attr: String,
        value: Value,
    },
    /// Entity-scoped command.
    Command { id: EntityId, payload: CommandPayload },
    /// Dispose an entity, cascading through its sub-nodes.
    Dispose { id: EntityId },
    /// Full replacement of the declared connection set.
    Connections { edges: Vec<Edge> },
}

/// Outbound attribute push: local state the remote side must observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub target: EntityId,
    pub attr: String,
    pub value: Value,
}

impl StateUpdate {
    pub fn new(target: &EntityId, attr: impl Into<String>, value: Value) -> Self {
        StateUpdate {
            target: target.clone(),
            attr: attr.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edge_defaults_to_first_channels() {
        let edge: Edge = serde_json::from_value(json!({"src": "a", "dst": "b"})).unwrap();
        assert_eq!(edge.output, 0);
        assert_eq!(edge.input, 0);
    }

    #[test]
    fn test_edge_identity_includes_channels() {
        let mut a: Edge = Edge::new("osc", "gain");
        let b = Edge::new("osc", "gain");
        assert_eq!(a, b);
        a.output = 1;
        assert_ne!(a, b);
    }

    #[test]
    fn test_time_value_accepts_seconds_and_notation() {
        let t: TimeValue = serde_json::from_value(json!(1.5)).unwrap();
        assert_eq!(t, TimeValue::Seconds(1.5));
        let t: TimeValue = serde_json::from_value(json!("4n")).unwrap();
        assert_eq!(t, TimeValue::Notation("4n".to_string()));
    }

    #[test]
    fn test_schedule_payload_round_trip() {
        let msg = ClientMessage::Command {
            id: EntityId::new("transport"),
            payload: CommandPayload::Schedule(SchedulePayload {
                op: ScheduleOp::Repeat,
                id: 3,
                items: vec![StepDescriptor {
                    callee: EntityId::new("synth-1"),
                    method: "triggerAttackRelease".to_string(),
                    args: HashMap::from([
                        ("note".to_string(), ArgDescriptor::literal(json!("C4"))),
                        ("time".to_string(), ArgDescriptor::expr("time")),
                    ]),
                    arg_keys: vec!["note".to_string(), "time".to_string()],
                }],
                time: None,
                interval: Some(TimeValue::Notation("4n".to_string())),
                start_time: Some(TimeValue::Seconds(0.0)),
                duration: None,
            }),
        };

        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: ClientMessage = serde_json::from_str(&encoded).unwrap();
        match decoded {
            ClientMessage::Command {
                payload: CommandPayload::Schedule(p),
                ..
            } => {
                assert_eq!(p.op, ScheduleOp::Repeat);
                assert_eq!(p.id, 3);
                assert_eq!(p.items.len(), 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
