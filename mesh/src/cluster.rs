//! Cluster coordinator
//!
//! Composes the node property store, role table, ref-id allocator and root
//! locker over one coordination session. A process creates one
//! [`ClusterCoordinator`], declares its properties, then calls [`join`].
//!
//! [`join`]: ClusterCoordinator::join

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    allocator::{RefAllocationsListener, RefAllocator},
    config::ClusterConfig,
    context::MeshContext,
    coordination::{CoordinationClient, RoleChange},
    error::{MeshError, MeshResult},
    properties::{NodeInfo, NodeProperties, PropertyKey, PropertyKind, PropertyValue, IP_ADDRESS},
    retry::RetryPolicy,
    roles::{NodeChangeListener, RoleSlot, RoleTable},
    root_lock::{RootLock, RootLocker},
};

pub struct ClusterCoordinator {
    ctx: Arc<MeshContext>,
    config: ClusterConfig,
    client: Arc<dyn CoordinationClient>,
    properties: NodeProperties,
    roles: Arc<RoleTable>,
    allocator: RefAllocator,
    locker: RootLocker,
    retry: RetryPolicy,
    name: RwLock<Option<String>>,
    join_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("node_id", &self.config.node_id)
            .field("name", &*self.name.read())
            .field("session", &self.client.session_id())
            .finish()
    }
}

impl ClusterCoordinator {
    /// Validate `config` and declare the node's address property. Nothing is
    /// written to the coordination store until [`join`](Self::join).
    pub fn new(
        ctx: Arc<MeshContext>,
        config: ClusterConfig,
        client: Arc<dyn CoordinationClient>,
    ) -> MeshResult<Arc<Self>> {
        config.validate().map_err(MeshError::Config)?;

        let properties = NodeProperties::new();
        properties.add_node_property(IP_ADDRESS, true, true, PropertyKind::IpAddr)?;
        let ip = config
            .host_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        properties.set_node_property(IP_ADDRESS, PropertyValue::IpAddr(ip))?;

        Ok(Arc::new(Self {
            allocator: RefAllocator::new(&ctx, &config, client.clone()),
            locker: RootLocker::new(&config, client.clone()),
            retry: RetryPolicy::from_config(&config.retry),
            cancel: ctx.shutdown_token(),
            ctx,
            config,
            client,
            properties,
            roles: Arc::new(RoleTable::new()),
            name: RwLock::new(None),
            join_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Register this process under a unique sequential name, publish its
    /// properties, bootstrap the ref counter and start following role
    /// changes. Returns the assigned name.
    pub async fn join(&self) -> MeshResult<String> {
        let _joining = self.join_lock.lock().await;
        if let Some(name) = self.name.read().clone() {
            return Err(MeshError::AlreadyJoined(name));
        }

        let names_path = self.config.node_names_path();
        self.retry
            .run("node names path", || self.client.ensure_path(&names_path))
            .await
            .map_err(|e| MeshError::Registration(e.to_string()))?;

        let prefix = format!("{names_path}/node-");
        let path = self
            .retry
            .run("node name registration", || {
                self.client.create_ephemeral_sequential(&prefix)
            })
            .await
            .map_err(|e| MeshError::Registration(e.to_string()))?;
        let name = path
            .rsplit('/')
            .next()
            .unwrap_or(path.as_str())
            .to_string();
        *self.name.write() = Some(name.clone());

        let info = self.node_info(&name);
        if let Err(e) = self.client.publish_node(&info).await {
            self.abandon_registration(&path).await;
            return Err(MeshError::Registration(e.to_string()));
        }

        if let Err(e) = self.allocator.bootstrap(&self.ctx).await {
            self.abandon_registration(&path).await;
            return Err(e);
        }

        let changes = self.client.subscribe_roles();
        self.ctx.spawn(
            "role_dispatcher",
            dispatch_role_changes(self.roles.clone(), changes, self.cancel.clone()),
        );

        info!("Node name is {}, id is {}", name, self.config.node_id);
        Ok(name)
    }

    /// Undo a half-finished join so a retry starts from a clean registration.
    async fn abandon_registration(&self, path: &str) {
        self.name.write().take();
        if let Err(e) = self.client.delete(path).await {
            warn!("Failed removing registration {}: {}", path, e);
        }
    }

    fn node_info(&self, name: &str) -> NodeInfo {
        NodeInfo {
            node_id: self.config.node_id,
            name: name.to_string(),
            properties: self.properties.visible(),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<MeshContext> {
        &self.ctx
    }

    pub fn my_node_id(&self) -> i16 {
        self.config.node_id
    }

    pub fn my_name(&self) -> Option<String> {
        self.name.read().clone()
    }

    pub fn is_joined(&self) -> bool {
        self.name.read().is_some()
    }

    /// This node's published view, once joined.
    pub fn my_node_info(&self) -> Option<NodeInfo> {
        self.my_name().map(|name| self.node_info(&name))
    }

    /// The node's own role slot, identified by its node group id.
    pub fn my_slot(&self) -> RoleSlot {
        RoleSlot(self.config.node_id)
    }

    /// Whether this process currently holds the master binding of its own slot.
    pub fn is_master(&self) -> bool {
        let Some(name) = self.my_name() else {
            return false;
        };
        self.roles
            .master(self.my_slot())
            .is_some_and(|master| master.name == name)
    }

    pub fn master(&self, slot: RoleSlot) -> Option<NodeInfo> {
        self.roles.master(slot)
    }

    /// Wait until this member's role table shows `name` as master of `slot`.
    pub async fn wait_for_master(&self, slot: RoleSlot, name: &str, timeout: Duration) -> bool {
        self.roles.wait_for_master(slot, name, timeout).await
    }

    /// Look up a published member by name.
    pub async fn node(&self, name: &str) -> MeshResult<Option<NodeInfo>> {
        Ok(self.client.node(name).await?)
    }

    // ------------------------------------------------------------------
    // Role bindings
    // ------------------------------------------------------------------

    /// Bind this node as master of `slot`. The local role table observes the
    /// change through the same subscription as every other member.
    pub async fn claim_master(&self, slot: RoleSlot) -> MeshResult<()> {
        let info = self.my_node_info().ok_or(MeshError::NotJoined)?;
        info!(%slot, name = %info.name, "Claiming master role");
        self.client.set_role_master(slot, Some(info)).await?;
        Ok(())
    }

    /// Unbind `slot` if this node is its master.
    pub async fn release_master(&self, slot: RoleSlot) -> MeshResult<()> {
        let name = self.my_name().ok_or(MeshError::NotJoined)?;
        match self.roles.master(slot) {
            Some(master) if master.name == name => {
                info!(%slot, "Releasing master role");
                self.client.set_role_master(slot, None).await?;
            }
            _ => debug!(%slot, "Not master of slot, nothing to release"),
        }
        Ok(())
    }

    pub fn add_node_change_listener(&self, slot: RoleSlot, listener: Arc<dyn NodeChangeListener>) {
        self.roles.add_listener(slot, listener);
    }

    pub fn remove_node_change_listener(
        &self,
        slot: RoleSlot,
        listener: &Arc<dyn NodeChangeListener>,
    ) {
        self.roles.remove_listener(slot, listener);
    }

    pub fn add_any_node_change_listener(&self, listener: Arc<dyn NodeChangeListener>) {
        self.roles.add_any_slot_listener(listener);
    }

    pub fn remove_any_node_change_listener(&self, listener: &Arc<dyn NodeChangeListener>) {
        self.roles.remove_any_slot_listener(listener);
    }

    // ------------------------------------------------------------------
    // Node properties
    // ------------------------------------------------------------------

    pub fn add_node_property(
        &self,
        key: PropertyKey,
        visible: bool,
        mutable: bool,
        kind: PropertyKind,
    ) -> MeshResult<()> {
        Ok(self
            .properties
            .add_node_property(key, visible, mutable, kind)?)
    }

    /// Set a declared property. Once joined, a change to a visible property is
    /// republished so peers observe it.
    pub async fn set_node_property(&self, key: PropertyKey, value: PropertyValue) -> MeshResult<()> {
        let changed = self.properties.set_node_property(key, value)?;
        if !changed {
            return Ok(());
        }
        if let Some(info) = self.my_node_info() {
            debug!(property = %key, "Republishing node properties");
            self.client.publish_node(&info).await?;
        }
        Ok(())
    }

    pub fn get_node_property(&self, key: PropertyKey) -> Option<PropertyValue> {
        self.properties.get_node_property(key)
    }

    // ------------------------------------------------------------------
    // Ref ids
    // ------------------------------------------------------------------

    pub fn allocate_refs(&self, count: u32) -> MeshResult<()> {
        self.allocator.allocate_refs(count)
    }

    pub async fn set_counter(&self, initial: i64) -> MeshResult<bool> {
        self.allocator.set_counter(initial).await
    }

    pub fn add_ref_allocations_listener(&self, listener: Arc<dyn RefAllocationsListener>) {
        self.allocator.add_listener(listener);
    }

    pub fn remove_ref_allocations_listener(&self, listener: &Arc<dyn RefAllocationsListener>) {
        self.allocator.remove_listener(listener);
    }

    pub fn is_counter_ready(&self) -> bool {
        self.allocator.is_ready()
    }

    pub async fn wait_counter_ready(&self) -> MeshResult<()> {
        self.allocator.wait_counter_ready().await
    }

    // ------------------------------------------------------------------
    // Root locks
    // ------------------------------------------------------------------

    pub async fn lock_root(&self, id: i32) -> MeshResult<RootLock> {
        self.locker.lock_root(id).await
    }

    pub async fn unlock_root(&self, lock: RootLock) -> MeshResult<()> {
        self.locker.unlock_root(lock).await
    }

    /// Abandon queued allocations, stop following role changes and end the
    /// coordination session. Peers observe this node's bindings disappear.
    pub async fn shutdown(&self) {
        info!(node_id = self.config.node_id, "Shutting down cluster coordinator");
        self.allocator.shutdown();
        self.cancel.cancel();
        let timeout = self.config.session_timeout();
        if tokio::time::timeout(timeout, self.client.close()).await.is_err() {
            warn!("Coordination session did not close within {:?}", timeout);
        }
    }
}

async fn dispatch_role_changes(
    roles: Arc<RoleTable>,
    mut changes: mpsc::UnboundedReceiver<RoleChange>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            change = changes.recv() => {
                let Some(RoleChange { slot, master }) = change else {
                    warn!("Role change subscription closed");
                    break;
                };
                roles.apply(slot, master);
            }
        }
    }
    debug!("Role dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        coordination::MemoryCoordinator,
        properties::IP_SERVER_PORT,
        tests::test_utils::{fast_cluster_config, wait_until},
    };

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl NodeChangeListener for Events {
        fn node_added(&self, _slot: RoleSlot, node: &NodeInfo) {
            self.0.lock().push(format!("added {}", node.name));
        }

        fn node_switched(&self, _slot: RoleSlot, old: Option<&NodeInfo>, new: &NodeInfo) {
            let old = old.map(|n| n.name.clone()).unwrap_or_default();
            self.0.lock().push(format!("switched {} {}", old, new.name));
        }

        fn node_removed(&self, _slot: RoleSlot, node: &NodeInfo) {
            self.0.lock().push(format!("removed {}", node.name));
        }
    }

    async fn coordinator(
        ctx: &Arc<MeshContext>,
        ensemble: &MemoryCoordinator,
        node_id: i16,
    ) -> Arc<ClusterCoordinator> {
        ClusterCoordinator::new(ctx.clone(), fast_cluster_config(node_id), ensemble.session()).unwrap()
    }

    #[tokio::test]
    async fn test_join_assigns_sequential_names() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let a = coordinator(&ctx, &ensemble, 1).await;
        let b = coordinator(&ctx, &ensemble, 2).await;

        assert_eq!(a.join().await.unwrap(), "node-0000000000");
        assert_eq!(b.join().await.unwrap(), "node-0000000001");
        assert!(ensemble.path_exists("/grid/node_names/node-0000000000"));

        let seen = b.node("node-0000000000").await.unwrap().unwrap();
        assert_eq!(seen.node_id, 1);
        assert_eq!(seen.ip_address(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        assert!(matches!(a.join().await, Err(MeshError::AlreadyJoined(_))));
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failed_join_withdraws_registration() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let mut config = fast_cluster_config(1);
        config.retry.max_retries = 1;
        let a = ClusterCoordinator::new(ctx.clone(), config, ensemble.session()).unwrap();

        ensemble.inject_transient_failures(10);
        assert!(matches!(a.join().await, Err(MeshError::CounterBootstrap(_))));
        assert!(!ensemble.path_exists("/grid/node_names/node-0000000000"));
        assert_eq!(a.node("node-0000000000").await.unwrap(), None);
        assert_eq!(a.my_name(), None);

        ensemble.inject_transient_failures(0);
        let name = a.join().await.unwrap();
        assert_eq!(name, "node-0000000001");
        assert!(ensemble.path_exists("/grid/node_names/node-0000000001"));
        assert!(a.node(&name).await.unwrap().is_some());
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_operations_before_join() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let a = coordinator(&ctx, &ensemble, 1).await;

        assert!(!a.is_master());
        assert_eq!(a.my_node_info(), None);
        assert!(matches!(a.allocate_refs(5), Err(MeshError::NotJoined)));
        assert!(matches!(
            a.claim_master(RoleSlot::SERVER).await,
            Err(MeshError::NotJoined)
        ));
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let mut config = fast_cluster_config(1);
        config.connect_string.clear();
        assert!(matches!(
            ClusterCoordinator::new(ctx, config, ensemble.session()),
            Err(MeshError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_master_bindings_reach_every_member() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let a = coordinator(&ctx, &ensemble, 3).await;
        let b = coordinator(&ctx, &ensemble, 3).await;
        a.join().await.unwrap();
        b.join().await.unwrap();

        let events = Arc::new(Events::default());
        b.add_node_change_listener(RoleSlot(3), events.clone());

        a.claim_master(RoleSlot(3)).await.unwrap();
        wait_until(|| a.is_master()).await;
        wait_until(|| b.master(RoleSlot(3)).is_some()).await;
        assert!(!b.is_master());

        b.claim_master(RoleSlot(3)).await.unwrap();
        wait_until(|| b.is_master()).await;
        wait_until(|| !a.is_master()).await;

        b.release_master(RoleSlot(3)).await.unwrap();
        wait_until(|| b.master(RoleSlot(3)).is_none()).await;

        assert_eq!(
            *events.0.lock(),
            vec![
                "added node-0000000000",
                "switched node-0000000000 node-0000000001",
                "removed node-0000000001",
            ]
        );
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_visible_property_change_is_republished() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let a = coordinator(&ctx, &ensemble, 0).await;
        let b = coordinator(&ctx, &ensemble, 1).await;
        a.add_node_property(IP_SERVER_PORT, true, true, PropertyKind::Port)
            .unwrap();
        let name = a.join().await.unwrap();
        b.join().await.unwrap();
        a.claim_master(RoleSlot::SERVER).await.unwrap();
        wait_until(|| b.master(RoleSlot::SERVER).is_some()).await;

        a.set_node_property(IP_SERVER_PORT, PropertyValue::Port(7051))
            .await
            .unwrap();

        let published = b.node(&name).await.unwrap().unwrap();
        assert_eq!(published.port(IP_SERVER_PORT), Some(7051));
        wait_until(|| {
            b.master(RoleSlot::SERVER)
                .and_then(|m| m.port(IP_SERVER_PORT))
                == Some(7051)
        })
        .await;
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_expires_membership() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let a = coordinator(&ctx, &ensemble, 0).await;
        let b = coordinator(&ctx, &ensemble, 1).await;
        let name = a.join().await.unwrap();
        b.join().await.unwrap();

        let events = Arc::new(Events::default());
        b.add_any_node_change_listener(events.clone());

        a.claim_master(RoleSlot::SERVER).await.unwrap();
        wait_until(|| b.master(RoleSlot::SERVER).is_some()).await;

        a.shutdown().await;
        wait_until(|| b.master(RoleSlot::SERVER).is_none()).await;

        assert_eq!(b.node(&name).await.unwrap(), None);
        assert!(matches!(a.allocate_refs(1), Err(MeshError::ShuttingDown)));
        assert_eq!(
            *events.0.lock(),
            vec!["added node-0000000000", "removed node-0000000000"]
        );
        ctx.stop(Duration::from_secs(1)).await;
    }
}
