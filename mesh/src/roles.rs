//! Role slots and membership events
//!
//! A role slot is bound to at most one master node at a time. Every binding
//! change observed for a slot maps to exactly one [`RoleEvent`]:
//! - unbound -> bound: `Added`
//! - bound(A) -> bound(B): `Switched`
//! - bound -> unbound: `Removed`
//!
//! Events for one slot are dispatched synchronously, in order, under the slot's
//! dispatch lock. Different slots dispatch independently.

use std::{collections::HashMap, sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::{metrics::MeshMetrics, properties::NodeInfo};

/// Logical role identified by the node group id it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoleSlot(pub i16);

impl RoleSlot {
    /// The data-grid server role.
    pub const SERVER: RoleSlot = RoleSlot(0);

    pub fn id(&self) -> i16 {
        self.0
    }
}

impl std::fmt::Display for RoleSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == RoleSlot::SERVER {
            write!(f, "SERVER")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleEvent {
    Added(NodeInfo),
    Switched { old: NodeInfo, new: NodeInfo },
    Removed(NodeInfo),
}

impl RoleEvent {
    fn kind(&self) -> &'static str {
        match self {
            RoleEvent::Added(_) => "added",
            RoleEvent::Switched { .. } => "switched",
            RoleEvent::Removed(_) => "removed",
        }
    }
}

/// Receives master changes for the slots it is registered on.
pub trait NodeChangeListener: Send + Sync {
    fn node_added(&self, slot: RoleSlot, node: &NodeInfo);

    fn node_switched(&self, slot: RoleSlot, old: Option<&NodeInfo>, new: &NodeInfo);

    fn node_removed(&self, slot: RoleSlot, node: &NodeInfo);
}

#[derive(Default)]
struct SlotListeners {
    dispatch: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn NodeChangeListener>>>,
}

/// Current master of every slot plus the listeners registered per slot.
#[derive(Default)]
pub struct RoleTable {
    slots: DashMap<RoleSlot, Arc<SlotListeners>>,
    /// Listeners notified for every slot
    any_slot: RwLock<Vec<Arc<dyn NodeChangeListener>>>,
    masters: RwLock<HashMap<RoleSlot, NodeInfo>>,
    /// Woken after every applied binding, once its listeners ran
    changed: Notify,
}

impl std::fmt::Debug for RoleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleTable")
            .field("masters", &*self.masters.read())
            .finish()
    }
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, slot: RoleSlot) -> Arc<SlotListeners> {
        self.slots.entry(slot).or_default().value().clone()
    }

    pub fn add_listener(&self, slot: RoleSlot, listener: Arc<dyn NodeChangeListener>) {
        self.slot(slot).listeners.write().push(listener);
    }

    pub fn remove_listener(&self, slot: RoleSlot, listener: &Arc<dyn NodeChangeListener>) {
        if let Some(entry) = self.slots.get(&slot) {
            entry
                .listeners
                .write()
                .retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    /// Register a listener for changes on any slot. It is dispatched after the
    /// slot's own listeners, under the same per-slot ordering.
    pub fn add_any_slot_listener(&self, listener: Arc<dyn NodeChangeListener>) {
        self.any_slot.write().push(listener);
    }

    pub fn remove_any_slot_listener(&self, listener: &Arc<dyn NodeChangeListener>) {
        self.any_slot
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn master(&self, slot: RoleSlot) -> Option<NodeInfo> {
        self.masters.read().get(&slot).cloned()
    }

    /// Wait until `name` is the master of `slot`. Returns `false` if that does
    /// not happen within `timeout`.
    pub async fn wait_for_master(&self, slot: RoleSlot, name: &str, timeout: Duration) -> bool {
        let bound = async {
            loop {
                let changed = self.changed.notified();
                if self.master(slot).is_some_and(|m| m.name == name) {
                    return;
                }
                changed.await;
            }
        };
        tokio::time::timeout(timeout, bound).await.is_ok()
    }

    /// Record the new master of `slot` and dispatch the resulting event, if any.
    /// Rebinding the node that already holds the slot only refreshes its info.
    pub fn apply(&self, slot: RoleSlot, master: Option<NodeInfo>) -> Option<RoleEvent> {
        let entry = self.slot(slot);
        let _serial = entry.dispatch.lock();

        let event = {
            let mut masters = self.masters.write();
            let previous = masters.get(&slot).cloned();
            match (previous, master) {
                (None, None) => None,
                (None, Some(new)) => {
                    masters.insert(slot, new.clone());
                    Some(RoleEvent::Added(new))
                }
                (Some(old), None) => {
                    masters.remove(&slot);
                    Some(RoleEvent::Removed(old))
                }
                (Some(old), Some(new)) if old.name == new.name => {
                    masters.insert(slot, new);
                    None
                }
                (Some(old), Some(new)) => {
                    masters.insert(slot, new.clone());
                    Some(RoleEvent::Switched { old, new })
                }
            }
        };

        let Some(event) = event else {
            debug!(%slot, "Role binding refreshed without master change");
            self.changed.notify_waiters();
            return None;
        };

        info!(%slot, kind = event.kind(), "Role slot changed");
        MeshMetrics::record_role_event(event.kind());

        let mut listeners = entry.listeners.read().clone();
        listeners.extend(self.any_slot.read().iter().cloned());
        for listener in &listeners {
            match &event {
                RoleEvent::Added(node) => listener.node_added(slot, node),
                RoleEvent::Switched { old, new } => listener.node_switched(slot, Some(old), new),
                RoleEvent::Removed(node) => listener.node_removed(slot, node),
            }
        }
        // Waiters wake once listeners have reacted to the change
        self.changed.notify_waiters();
        Some(event)
    }
}
