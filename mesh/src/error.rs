//! Mesh error types.
//!
//! Defines error variants for cluster coordination, ref-id allocation, root locks,
//! the node transport and the control/data channel multiplexer.

use thiserror::Error;

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Multiplexer error: {0}")]
    Multiplex(#[from] MultiplexError),

    #[error("Property error: {0}")]
    Property(#[from] PropertyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Node has not joined the cluster")]
    NotJoined,

    #[error("Node already joined the cluster as {0}")]
    AlreadyJoined(String),

    #[error("Failed to register node name: {0}")]
    Registration(String),

    #[error("Failed to bootstrap ref counter: {0}")]
    CounterBootstrap(String),

    #[error("Ref counter could not be set to {target} after {attempts} attempts")]
    CounterTimeout { target: i64, attempts: u32 },

    #[error("Root lock {id} was acquired by another coordinator")]
    ForeignLock { id: i32 },

    #[error("Operation attempted after initialization: {0}")]
    AfterInitialization(&'static str),

    #[error("Mesh is shutting down")]
    ShuttingDown,
}

/// Errors surfaced by a [`crate::coordination::CoordinationClient`].
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Connection blip to the backing store; safe to retry.
    #[error("Transient coordination failure: {0}")]
    Transient(String),

    #[error("Path not found: {0}")]
    NoNode(String),

    #[error("Lock {0} is not held by this holder")]
    LockNotHeld(String),

    #[error("Coordination session closed")]
    SessionClosed,

    #[error("Counter {0} would overflow")]
    CounterOverflow(String),
}

impl CoordinationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinationError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No receiver registered")]
    NoReceiver,

    #[error("Receiver must be set during initialization")]
    ReceiverAfterStart,

    #[error("Unknown node for connection from {0}")]
    UnknownPeer(String),

    #[error("Node {0} is not the master of its group")]
    NotMaster(String),

    #[error("Node {0} already connected")]
    DuplicateConnection(i16),

    #[error("Node {node} has no published {property} property")]
    MissingAddress { node: String, property: &'static str },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Frame codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MultiplexError {
    #[error("Failed getting state from application: {0}")]
    StateProduce(String),

    #[error("Failed applying transferred state: {0}")]
    StateApply(String),

    #[error("Invalid control header: {0}")]
    Header(String),

    #[error("Group channel send failed: {0}")]
    Send(String),
}

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("Property {0} was not declared")]
    Undeclared(&'static str),

    #[error("Property {0} was already declared with a different shape")]
    Redeclared(&'static str),

    #[error("Property {key} expects a {expected:?} value")]
    KindMismatch {
        key: &'static str,
        expected: crate::properties::PropertyKind,
    },

    #[error("Property {0} is immutable and already set")]
    Immutable(&'static str),
}
