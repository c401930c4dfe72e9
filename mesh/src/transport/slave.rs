//! Slave role of the node transport.
//!
//! A node that is not master of its group keeps one connection to the group's
//! current master, on the port the master publishes as `ip_slave_port`. The
//! client follows every master change of its own slot and shuts down for good
//! once this process becomes the master itself.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    link::{LinkRole, PeerLink},
    message::{Message, MessageReceiver},
};
use crate::{
    cluster::ClusterCoordinator,
    config::TransportConfig,
    error::MeshResult,
    properties::{NodeInfo, PropertyKind, IP_SLAVE_PORT},
    roles::{NodeChangeListener, RoleSlot},
};

pub struct SlaveClient {
    link: Arc<PeerLink>,
    listener: Mutex<Option<Arc<dyn NodeChangeListener>>>,
}

impl std::fmt::Debug for SlaveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveClient").field("link", &self.link).finish()
    }
}

impl SlaveClient {
    /// Declare `ip_slave_port` and start listening on this node's own slot.
    pub fn new(cluster: Arc<ClusterCoordinator>, config: TransportConfig) -> MeshResult<Arc<Self>> {
        cluster.add_node_property(IP_SLAVE_PORT, true, false, PropertyKind::Port)?;
        let client = Arc::new(Self {
            link: PeerLink::new(cluster.clone(), config, LinkRole::Master)?,
            listener: Mutex::new(None),
        });

        let listener: Arc<dyn NodeChangeListener> = Arc::new(MasterSlotListener {
            client: Arc::downgrade(&client),
        });
        cluster.add_node_change_listener(cluster.my_slot(), listener.clone());
        *client.listener.lock() = Some(listener);
        Ok(client)
    }

    /// Register the inbound message sink. Only allowed before `start`.
    pub fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) -> MeshResult<()> {
        self.link.set_receiver(receiver)
    }

    /// Begin following the group master. A process that starts as master has
    /// no use for the client and shuts it down.
    pub fn start(&self, master: bool) -> MeshResult<()> {
        self.link.mark_started("slave client already started")?;
        if master {
            info!("Master node. Shutting down slave client.");
            self.shutdown();
            return Ok(());
        }
        match self.link.cluster().master(self.link.cluster().my_slot()) {
            Some(master) if !self.is_me(&master) => {
                info!("Came online and master {} found. Connecting.", master.name);
                self.link.reconnect(master);
            }
            Some(_) => debug!("Bound as master of own group, not connecting to myself"),
            None => debug!("No group master bound yet"),
        }
        Ok(())
    }

    /// This process was promoted to master of its group.
    pub fn switch_to_master(&self) {
        info!("Switched to master. Shutting down slave client.");
        self.shutdown();
    }

    fn is_me(&self, node: &NodeInfo) -> bool {
        self.link.cluster().my_name().as_deref() == Some(node.name.as_str())
    }

    fn new_master(&self, node: &NodeInfo) {
        if self.link.is_shut_down() {
            return;
        }
        if self.is_me(node) {
            if self.link.is_started() {
                self.switch_to_master();
            } else {
                debug!("New master is this node, not connecting to myself");
            }
            return;
        }
        if self.link.is_started() {
            info!("New master {}. Reconnecting.", node.name);
            self.link.reconnect(node.clone());
        }
    }

    fn master_removed(&self, node: &NodeInfo) {
        if self.link.is_started() && !self.link.is_shut_down() {
            info!("Master {} removed. Disconnecting.", node.name);
            self.link.disconnect();
        }
    }

    pub fn peer_name(&self) -> Option<String> {
        self.link.peer_name()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Number of connections established so far.
    pub fn connect_count(&self) -> u64 {
        self.link.connect_count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.link.is_shut_down()
    }

    /// Send to the group master. Messages are dropped while not connected.
    pub fn send(&self, message: Message) {
        self.link.send(message)
    }

    /// Stop following the group master and drop the slot listener.
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            let cluster = self.link.cluster();
            cluster.remove_node_change_listener(cluster.my_slot(), &listener);
        }
        self.link.shutdown();
    }
}

struct MasterSlotListener {
    client: Weak<SlaveClient>,
}

impl NodeChangeListener for MasterSlotListener {
    fn node_added(&self, _slot: RoleSlot, node: &NodeInfo) {
        if let Some(client) = self.client.upgrade() {
            client.new_master(node);
        }
    }

    fn node_switched(&self, _slot: RoleSlot, _old: Option<&NodeInfo>, new: &NodeInfo) {
        if let Some(client) = self.client.upgrade() {
            client.new_master(new);
        }
    }

    fn node_removed(&self, _slot: RoleSlot, node: &NodeInfo) {
        if let Some(client) = self.client.upgrade() {
            client.master_removed(node);
        }
    }
}
