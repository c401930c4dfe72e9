use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::{AtomicOutcome, CoordinationClient, CoordinationResult, RoleChange};
use crate::{error::CoordinationError, properties::NodeInfo, roles::RoleSlot};

// ============================================================================
// Shared tree - one per simulated coordination ensemble
// ============================================================================

#[derive(Debug, Default)]
struct TreeState {
    paths: BTreeSet<String>,
    sequences: HashMap<String, u64>,
    /// ephemeral path -> owning session
    ephemerals: HashMap<String, String>,
    /// node name -> (info, owning session)
    nodes: HashMap<String, (NodeInfo, String)>,
    counters: HashMap<String, i64>,
    roles: BTreeMap<RoleSlot, (NodeInfo, String)>,
    subscribers: Vec<mpsc::UnboundedSender<RoleChange>>,
}

impl TreeState {
    fn broadcast(&mut self, change: RoleChange) {
        self.subscribers
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

#[derive(Debug, Default)]
struct LockCell {
    holder: Mutex<Option<String>>,
    released: Notify,
}

/// In-process coordination ensemble. Each simulated process opens its own
/// [`MemorySession`]; closing a session expires its ephemeral state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    tree: Arc<Mutex<TreeState>>,
    locks: Arc<DashMap<String, Arc<LockCell>>>,
    transient_failures: Arc<AtomicU32>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Arc<MemorySession> {
        Arc::new(MemorySession {
            id: uuid::Uuid::new_v4().to_string(),
            ensemble: self.clone(),
            closed: AtomicBool::new(false),
            held_locks: Mutex::new(HashSet::new()),
        })
    }

    /// Make the next `count` counter operations fail with a transient error.
    pub fn inject_transient_failures(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Current value of a counter cell, `None` if it was never written.
    pub fn counter_value(&self, path: &str) -> Option<i64> {
        self.tree.lock().counters.get(path).copied()
    }

    /// Drop a counter cell, as if it had never been written.
    pub fn reset_counter(&self, path: &str) {
        self.tree.lock().counters.remove(path);
    }

    pub fn path_exists(&self, path: &str) -> bool {
        let tree = self.tree.lock();
        tree.paths.contains(path) || tree.ephemerals.contains_key(path)
    }

    pub fn lock_holder(&self, path: &str) -> Option<String> {
        self.locks
            .get(path)
            .and_then(|cell| cell.holder.lock().clone())
    }

    fn take_transient_failure(&self) -> CoordinationResult<()> {
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CoordinationError::Transient(
                "injected connection loss".to_string(),
            ));
        }
        Ok(())
    }

    fn lock_cell(&self, path: &str) -> Arc<LockCell> {
        self.locks
            .entry(path.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn release_lock(&self, path: &str, holder: &str) -> CoordinationResult<()> {
        let cell = self
            .locks
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoordinationError::LockNotHeld(path.to_string()))?;
        {
            let mut current = cell.holder.lock();
            if current.as_deref() != Some(holder) {
                return Err(CoordinationError::LockNotHeld(path.to_string()));
            }
            *current = None;
        }
        cell.released.notify_waiters();
        Ok(())
    }
}

fn parent_paths(path: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        result.push(current.clone());
    }
    result
}

// ============================================================================
// Session - one per simulated process
// ============================================================================

#[derive(Debug)]
pub struct MemorySession {
    id: String,
    ensemble: MemoryCoordinator,
    closed: AtomicBool,
    held_locks: Mutex<HashSet<(String, String)>>,
}

impl MemorySession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> CoordinationResult<()> {
        if self.is_closed() {
            return Err(CoordinationError::SessionClosed);
        }
        Ok(())
    }

    fn check_counter_op(&self) -> CoordinationResult<()> {
        self.check_open()?;
        self.ensemble.take_transient_failure()
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn ensure_path(&self, path: &str) -> CoordinationResult<()> {
        self.check_open()?;
        let mut tree = self.ensemble.tree.lock();
        for p in parent_paths(path) {
            tree.paths.insert(p);
        }
        Ok(())
    }

    async fn create_ephemeral_sequential(&self, prefix: &str) -> CoordinationResult<String> {
        self.check_open()?;
        let parent = prefix
            .rsplit_once('/')
            .map(|(parent, _)| parent.to_string())
            .unwrap_or_default();
        let mut tree = self.ensemble.tree.lock();
        for p in parent_paths(&parent) {
            tree.paths.insert(p);
        }
        let seq = tree.sequences.entry(parent).or_insert(0);
        let path = format!("{prefix}{:010}", *seq);
        *seq += 1;
        tree.ephemerals.insert(path.clone(), self.id.clone());
        debug!(session = %self.id, "Created ephemeral node {}", path);
        Ok(path)
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.check_open()?;
        let mut tree = self.ensemble.tree.lock();
        if tree.ephemerals.remove(path).is_some() {
            let name = path.rsplit('/').next().unwrap_or(path);
            if tree.nodes.get(name).is_some_and(|(_, owner)| *owner == self.id) {
                tree.nodes.remove(name);
            }
            Ok(())
        } else if tree.paths.remove(path) {
            Ok(())
        } else {
            Err(CoordinationError::NoNode(path.to_string()))
        }
    }

    async fn publish_node(&self, info: &NodeInfo) -> CoordinationResult<()> {
        self.check_open()?;
        let mut tree = self.ensemble.tree.lock();
        tree.nodes
            .insert(info.name.clone(), (info.clone(), self.id.clone()));

        // Refresh role bindings held by the same node so readers see the new properties
        let rebound: Vec<RoleSlot> = tree
            .roles
            .iter()
            .filter(|(_, (master, _))| master.name == info.name)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in rebound {
            if let Some(binding) = tree.roles.get_mut(&slot) {
                binding.0 = info.clone();
            }
            tree.broadcast(RoleChange {
                slot,
                master: Some(info.clone()),
            });
        }
        Ok(())
    }

    async fn node(&self, name: &str) -> CoordinationResult<Option<NodeInfo>> {
        self.check_open()?;
        Ok(self
            .ensemble
            .tree
            .lock()
            .nodes
            .get(name)
            .map(|(info, _)| info.clone()))
    }

    async fn counter_get(&self, path: &str) -> CoordinationResult<AtomicOutcome> {
        self.check_counter_op()?;
        let value = self
            .ensemble
            .tree
            .lock()
            .counters
            .get(path)
            .copied()
            .unwrap_or(0);
        Ok(AtomicOutcome::applied(value, value))
    }

    async fn counter_add(&self, path: &str, delta: i64) -> CoordinationResult<AtomicOutcome> {
        self.check_counter_op()?;
        let mut tree = self.ensemble.tree.lock();
        let cell = tree.counters.entry(path.to_string()).or_insert(0);
        let pre = *cell;
        *cell = pre
            .checked_add(delta)
            .ok_or_else(|| CoordinationError::CounterOverflow(path.to_string()))?;
        Ok(AtomicOutcome::applied(pre, *cell))
    }

    async fn counter_compare_and_set(
        &self,
        path: &str,
        expected: i64,
        new_value: i64,
    ) -> CoordinationResult<AtomicOutcome> {
        self.check_counter_op()?;
        let mut tree = self.ensemble.tree.lock();
        match tree.counters.get_mut(path) {
            // A cell that was never written cannot be compared against.
            None => Ok(AtomicOutcome::rejected(0)),
            Some(cell) if *cell == expected => {
                let pre = *cell;
                *cell = new_value;
                Ok(AtomicOutcome::applied(pre, new_value))
            }
            Some(cell) => Ok(AtomicOutcome::rejected(*cell)),
        }
    }

    async fn lock_acquire(&self, path: &str, holder: &str) -> CoordinationResult<()> {
        let cell = self.ensemble.lock_cell(path);
        loop {
            self.check_open()?;
            let released = cell.released.notified();
            {
                let mut current = cell.holder.lock();
                if current.is_none() {
                    *current = Some(holder.to_string());
                    self.held_locks
                        .lock()
                        .insert((path.to_string(), holder.to_string()));
                    return Ok(());
                }
            }
            released.await;
        }
    }

    async fn lock_release(&self, path: &str, holder: &str) -> CoordinationResult<()> {
        self.check_open()?;
        self.ensemble.release_lock(path, holder)?;
        self.held_locks
            .lock()
            .remove(&(path.to_string(), holder.to_string()));
        Ok(())
    }

    async fn set_role_master(
        &self,
        slot: RoleSlot,
        master: Option<NodeInfo>,
    ) -> CoordinationResult<()> {
        self.check_open()?;
        let mut tree = self.ensemble.tree.lock();
        match &master {
            Some(info) => {
                tree.roles.insert(slot, (info.clone(), self.id.clone()));
            }
            None => {
                tree.roles.remove(&slot);
            }
        }
        tree.broadcast(RoleChange { slot, master });
        Ok(())
    }

    fn subscribe_roles(&self) -> mpsc::UnboundedReceiver<RoleChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tree = self.ensemble.tree.lock();
        for (slot, (master, _)) in &tree.roles {
            let _ = tx.send(RoleChange {
                slot: *slot,
                master: Some(master.clone()),
            });
        }
        tree.subscribers.push(tx);
        rx
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(session = %self.id, "Closing coordination session");

        let held: Vec<(String, String)> = self.held_locks.lock().drain().collect();
        for (path, holder) in held {
            let _ = self.ensemble.release_lock(&path, &holder);
        }

        let mut tree = self.ensemble.tree.lock();
        let id = self.id.clone();
        tree.ephemerals.retain(|_, owner| *owner != id);
        tree.nodes.retain(|_, (_, owner)| *owner != id);
        let expired: Vec<RoleSlot> = tree
            .roles
            .iter()
            .filter(|(_, (_, owner))| *owner == id)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in expired {
            tree.roles.remove(&slot);
            tree.broadcast(RoleChange { slot, master: None });
        }
    }
}
