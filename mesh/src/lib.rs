//! Grid Mesh: Membership and Transport for an In-Memory Data Grid
//!
//! This crate keeps the nodes of a data grid aware of each other:
//! - Unique node registration and per-slot master/slave role events
//! - Cluster-wide ref-id range allocation from a distributed counter
//! - Cluster-wide root locks
//! - TCP connectivity between node-group masters and the grid server, and
//!   between slaves and their group master
//! - Control/data demultiplexing of the group-communication channel

pub mod allocator;
pub mod cluster;
pub mod config;
pub mod context;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod multiplex;
pub mod properties;
pub mod retry;
pub mod roles;
pub mod root_lock;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use allocator::{RefAllocation, RefAllocationsListener};
pub use cluster::ClusterCoordinator;
pub use config::{ClusterConfig, MeshConfig, RetryConfig, TransportConfig, INITIAL_REF_ID};
pub use context::MeshContext;
pub use coordination::{CoordinationClient, MemoryCoordinator};
pub use error::{MeshError, MeshResult};
pub use properties::{NodeInfo, PropertyKey, PropertyKind, PropertyValue};
pub use roles::{NodeChangeListener, RoleEvent, RoleSlot};
pub use root_lock::RootLock;
pub use transport::{Message, MessageReceiver, NodeServer, ServerClient, SlaveClient};
