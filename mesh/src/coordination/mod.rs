//! Coordination-service seam
//!
//! The cluster layer only relies on the observed contract of a distributed
//! coordination tree: ephemeral sequential registration, a distributed atomic
//! long, a per-path mutex and role (master) bindings. [`CoordinationClient`]
//! captures that contract; [`MemoryCoordinator`] is the in-process
//! implementation used for single-process grids and tests.

mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::{MemoryCoordinator, MemorySession};

use crate::{error::CoordinationError, properties::NodeInfo, roles::RoleSlot};

pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Result of an operation on a distributed atomic long.
///
/// `succeeded == false` is not an error: the store answered but the operation
/// did not apply (e.g. compare-and-set against a stale expected value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicOutcome {
    pub succeeded: bool,
    pub pre_value: i64,
    pub post_value: i64,
}

impl AtomicOutcome {
    pub fn applied(pre_value: i64, post_value: i64) -> Self {
        Self {
            succeeded: true,
            pre_value,
            post_value,
        }
    }

    pub fn rejected(current: i64) -> Self {
        Self {
            succeeded: false,
            pre_value: current,
            post_value: current,
        }
    }
}

/// Master binding change for one role slot as observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleChange {
    pub slot: RoleSlot,
    pub master: Option<NodeInfo>,
}

#[async_trait]
pub trait CoordinationClient: Send + Sync + std::fmt::Debug {
    /// Identifier of this client's session with the store.
    fn session_id(&self) -> &str;

    /// Create a persistent path (and its parents) if missing.
    async fn ensure_path(&self, path: &str) -> CoordinationResult<()>;

    /// Create an ephemeral sequential node under `prefix` and return its full path.
    async fn create_ephemeral_sequential(&self, prefix: &str) -> CoordinationResult<String>;

    /// Delete a node. Deleting a registration also withdraws the node info
    /// published under its name, as the info lives in the registration's data.
    async fn delete(&self, path: &str) -> CoordinationResult<()>;

    /// Publish (or republish) the node's info, owned by this session.
    async fn publish_node(&self, info: &NodeInfo) -> CoordinationResult<()>;

    /// Look up a published node by name.
    async fn node(&self, name: &str) -> CoordinationResult<Option<NodeInfo>>;

    async fn counter_get(&self, path: &str) -> CoordinationResult<AtomicOutcome>;

    async fn counter_add(&self, path: &str, delta: i64) -> CoordinationResult<AtomicOutcome>;

    async fn counter_increment(&self, path: &str) -> CoordinationResult<AtomicOutcome> {
        self.counter_add(path, 1).await
    }

    async fn counter_compare_and_set(
        &self,
        path: &str,
        expected: i64,
        new_value: i64,
    ) -> CoordinationResult<AtomicOutcome>;

    /// Wait until the mutex at `path` is granted to `holder`.
    async fn lock_acquire(&self, path: &str, holder: &str) -> CoordinationResult<()>;

    /// Release the mutex at `path`. Fails with `LockNotHeld` if `holder` does not hold it.
    async fn lock_release(&self, path: &str, holder: &str) -> CoordinationResult<()>;

    /// Bind (or unbind with `None`) the master of a role slot.
    async fn set_role_master(
        &self,
        slot: RoleSlot,
        master: Option<NodeInfo>,
    ) -> CoordinationResult<()>;

    /// Stream of role binding changes. The current bindings are delivered first.
    fn subscribe_roles(&self) -> mpsc::UnboundedReceiver<RoleChange>;

    /// End the session. Ephemeral state owned by it disappears.
    async fn close(&self);
}
