//! Error taxonomy for the synchronization layer
//!
//! Configuration errors and stale references are programming errors on the
//! declaring side and surface as `Err`; disposal races and unresolved
//! scheduling targets are soft failures handled at the call site.

use crate::protocol::EntityId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid declared configuration (bad kind, bad reference, bad payload).
    #[error("configuration error: {0}")]
    Config(String),

    /// A serialized command named a method outside the target kind's allow-list.
    #[error("method '{method}' is not allowed for node kind '{kind}'")]
    MethodNotAllowed { kind: String, method: String },

    /// A message referenced an entity id that was never declared.
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),

    /// `clear` referenced an event id absent from the id-mapping table.
    #[error("scheduled event id not found: {0}")]
    UnknownEvent(u64),

    /// An accessor was invoked on an entity kind that does not support it,
    /// e.g. an automation-aware value query on an immediate-read parameter.
    #[error("'{operation}' is not supported by {target}")]
    UnsupportedTrait { target: String, operation: String },

    /// A node that only addresses an internal of another live unit was asked
    /// to construct its own unit.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The audio backend rejected an operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// Unparseable musical time notation.
    #[error("invalid time value: {0}")]
    InvalidTime(String),

    /// Unparseable callback argument expression.
    #[error("invalid argument expression: {0}")]
    InvalidExpr(String),
}
