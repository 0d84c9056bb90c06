//! # Tonelink - Remote Audio Graph Synchronization
//!
//! Tonelink keeps a remotely declared audio graph in lockstep with a live
//! audio engine across a process boundary. The remote side declares nodes,
//! parameters, connections, transport schedules and observers as plain
//! messages; this crate applies them to an engine behind the
//! [`backend::AudioBackend`] trait and pushes observable state back.
//!
//! ## Core Features
//!
//! - **Declarative topology**: the full connection set is declared on every
//!   change and reconciled into minimal engine operations
//! - **Parameter bridging**: declared scalar values stay authoritative until
//!   an audio signal overrides them
//! - **Transport scheduling**: callbacks are declared as data, validated
//!   against per-kind method surfaces and compiled once
//! - **Musical time**: `4n`, `8t`, `1m` and `bars:beats:sixteenths` notation
//!   resolved against the live tempo
//! - **Event entities**: loops, parts, sequences and value patterns with
//!   humanize/probability/mute controls
//! - **Deterministic testing**: [`offline::OfflineBackend`] is a manual-clock
//!   engine that makes every timing property observable
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::HashMap;
//! use serde_json::json;
//! use tonelink::offline::OfflineBackend;
//! use tonelink::protocol::{ClientMessage, Edge, EntityId};
//! use tonelink::session::Session;
//!
//! let backend = OfflineBackend::shared();
//! let mut session = Session::new(backend.clone());
//!
//! // declare a frequency parameter and the oscillator that owns it
//! session.dispatch(ClientMessage::Create {
//!     id: EntityId::new("osc-freq"),
//!     kind: "Param".to_string(),
//!     attrs: serde_json::from_value(json!({"value": 440.0})).unwrap(),
//! }).unwrap();
//! session.dispatch(ClientMessage::Create {
//!     id: EntityId::new("osc"),
//!     kind: "Oscillator".to_string(),
//!     attrs: serde_json::from_value(json!({
//!         "type": "sine",
//!         "_params": {"frequency": "osc-freq"},
//!     })).unwrap(),
//! }).unwrap();
//! session.dispatch(ClientMessage::Create {
//!     id: EntityId::new("main"),
//!     kind: "Destination".to_string(),
//!     attrs: HashMap::new(),
//! }).unwrap();
//!
//! // wire the oscillator to the destination
//! session.dispatch(ClientMessage::Connections {
//!     edges: vec![Edge::new("osc", "main")],
//! }).unwrap();
//!
//! assert_eq!(backend.borrow().connections().len(), 1);
//! ```

pub mod backend;
pub mod error;
pub mod events;
pub mod expr;
pub mod graph;
pub mod model;
pub mod node;
pub mod observe;
pub mod offline;
pub mod param;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{Result, SyncError};
pub use session::Session;
