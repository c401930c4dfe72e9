//! Client role of the node transport.
//!
//! While this process is master of its node group it keeps one connection to
//! the current master of the `SERVER` slot. Losing the group slot drops that
//! connection; only the group's current master talks to the server.

use std::sync::{Arc, Weak};

use tracing::{debug, info};

use super::{
    link::{LinkRole, PeerLink},
    message::{Message, MessageReceiver},
};
use crate::{
    cluster::ClusterCoordinator,
    config::TransportConfig,
    error::MeshResult,
    properties::NodeInfo,
    roles::{NodeChangeListener, RoleSlot},
};

pub struct ServerClient {
    link: Arc<PeerLink>,
}

impl std::fmt::Debug for ServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerClient").field("link", &self.link).finish()
    }
}

impl ServerClient {
    pub fn new(cluster: Arc<ClusterCoordinator>, config: TransportConfig) -> MeshResult<Arc<Self>> {
        let client = Arc::new(Self {
            link: PeerLink::new(cluster.clone(), config, LinkRole::Server)?,
        });

        cluster.add_node_change_listener(
            RoleSlot::SERVER,
            Arc::new(ServerSlotListener {
                client: Arc::downgrade(&client),
            }),
        );
        if cluster.my_slot() != RoleSlot::SERVER {
            cluster.add_node_change_listener(
                cluster.my_slot(),
                Arc::new(PromotionListener {
                    client: Arc::downgrade(&client),
                }),
            );
        }
        Ok(client)
    }

    /// Register the inbound message sink. Only allowed before `start`.
    pub fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) -> MeshResult<()> {
        self.link.set_receiver(receiver)
    }

    /// Begin following the server. When `master` is set and a server is
    /// already bound, connect right away.
    pub fn start(&self, master: bool) -> MeshResult<()> {
        self.link.mark_started("server client already started")?;
        if master {
            if let Some(server) = self.link.cluster().master(RoleSlot::SERVER) {
                info!("Came online and server found. Connecting.");
                self.link.reconnect(server);
            }
        }
        Ok(())
    }

    /// This process was promoted to master of its group.
    pub fn switch_to_master(&self) {
        if !self.link.is_started() {
            return;
        }
        match self.link.cluster().master(RoleSlot::SERVER) {
            Some(server) => {
                info!("Switched to master. Connecting to server {}", server.name);
                self.link.reconnect(server);
            }
            None => debug!("Switched to master with no server bound"),
        }
    }

    /// This process lost the master binding of its group.
    fn switch_to_slave(&self) {
        if self.link.peer_name().is_some() {
            info!("No longer master of group. Disconnecting from server.");
        }
        self.link.disconnect();
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

    /// Send to the server. Messages are dropped while not connected.
    pub fn send(&self, message: Message) {
        self.link.send(message)
    }

    pub fn shutdown(&self) {
        info!("Shutting down server client");
        self.link.shutdown();
    }
}

/// Follows the `SERVER` slot while this process is master of its group.
struct ServerSlotListener {
    client: Weak<ServerClient>,
}

impl ServerSlotListener {
    fn active_client(&self) -> Option<Arc<ServerClient>> {
        let client = self.client.upgrade()?;
        (client.link.is_started() && client.link.cluster().is_master()).then_some(client)
    }
}

impl NodeChangeListener for ServerSlotListener {
    fn node_added(&self, _slot: RoleSlot, node: &NodeInfo) {
        if let Some(client) = self.active_client() {
            info!("Server added! Connecting.");
            client.link.reconnect(node.clone());
        }
    }

    fn node_switched(&self, _slot: RoleSlot, _old: Option<&NodeInfo>, new: &NodeInfo) {
        if let Some(client) = self.active_client() {
            info!("Server switched! Reconnecting.");
            client.link.reconnect(new.clone());
        }
    }

    fn node_removed(&self, _slot: RoleSlot, _node: &NodeInfo) {
        if let Some(client) = self.active_client() {
            info!("Server removed! Disconnecting.");
            client.link.disconnect();
        }
    }
}

/// Connects to the server when this process takes over its own group slot and
/// disconnects when it loses it.
struct PromotionListener {
    client: Weak<ServerClient>,
}

impl PromotionListener {
    fn is_me(client: &ServerClient, node: &NodeInfo) -> bool {
        client.link.cluster().my_name().as_deref() == Some(node.name.as_str())
    }
}

impl NodeChangeListener for PromotionListener {
    fn node_added(&self, _slot: RoleSlot, node: &NodeInfo) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        if Self::is_me(&client, node) {
            client.switch_to_master();
        }
    }

    fn node_switched(&self, _slot: RoleSlot, old: Option<&NodeInfo>, new: &NodeInfo) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        if Self::is_me(&client, new) {
            client.switch_to_master();
        } else if old.is_some_and(|old| Self::is_me(&client, old)) {
            client.switch_to_slave();
        }
    }

    fn node_removed(&self, _slot: RoleSlot, node: &NodeInfo) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        if Self::is_me(&client, node) {
            client.switch_to_slave();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        context::MeshContext,
        coordination::MemoryCoordinator,
        error::{MeshError, TransportError},
        tests::test_utils::{fast_cluster_config, joined_member, loopback_transport, wait_until},
        transport::server::NodeServer,
    };

    #[derive(Default)]
    struct Inbox(Mutex<Vec<Message>>);

    impl MessageReceiver for Inbox {
        fn receive(&self, message: Message) {
            self.0.lock().push(message);
        }
    }

    #[tokio::test]
    async fn test_start_requires_receiver() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let cluster = joined_member(&ctx, &ensemble, fast_cluster_config(1)).await;
        let client = ServerClient::new(cluster, loopback_transport()).unwrap();

        assert!(matches!(
            client.start(true),
            Err(MeshError::Transport(TransportError::NoReceiver))
        ));
        client.set_receiver(Arc::new(Inbox::default())).unwrap();
        client.start(true).unwrap();
        assert!(matches!(
            client.set_receiver(Arc::new(Inbox::default())),
            Err(MeshError::Transport(TransportError::ReceiverAfterStart))
        ));
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_connects_after_promotion_and_exchanges_messages() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();

        let server_node = joined_member(&ctx, &ensemble, fast_cluster_config(0)).await;
        let server = NodeServer::new(server_node.clone(), loopback_transport()).unwrap();
        let server_inbox = Arc::new(Inbox::default());
        server.set_receiver(server_inbox.clone()).unwrap();
        server.start().await.unwrap();
        server_node.claim_master(RoleSlot::SERVER).await.unwrap();

        let member = joined_member(&ctx, &ensemble, fast_cluster_config(1)).await;
        let client = ServerClient::new(member.clone(), loopback_transport()).unwrap();
        let client_inbox = Arc::new(Inbox::default());
        client.set_receiver(client_inbox.clone()).unwrap();
        wait_until(|| member.master(RoleSlot::SERVER).is_some()).await;
        client.start(member.is_master()).unwrap();
        assert!(!client.is_connected());

        // Not master of its group yet, so nothing happens until promotion
        member.claim_master(member.my_slot()).await.unwrap();
        wait_until(|| client.is_connected()).await;
        wait_until(|| server.registry().contains(1)).await;
        assert_eq!(client.peer_name(), server_node.my_name());

        client.send(Message::request(0, b"ping".to_vec()));
        wait_until(|| !server_inbox.0.lock().is_empty()).await;
        let ping = server_inbox.0.lock()[0].clone();
        assert_eq!(ping.node, 1);
        assert_eq!(ping.payload, b"ping");

        server.send(Message::response_to(&ping, b"pong".to_vec()));
        wait_until(|| !client_inbox.0.lock().is_empty()).await;
        let pong = client_inbox.0.lock()[0].clone();
        assert!(pong.response);
        assert_eq!(pong.message_id, ping.message_id);
        assert_eq!(pong.node, 0);
        assert_eq!(client.connect_count(), 1);
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_demoted_master_disconnects_and_stays_down() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();

        let server_node = joined_member(&ctx, &ensemble, fast_cluster_config(0)).await;
        let server = NodeServer::new(server_node.clone(), loopback_transport()).unwrap();
        server.set_receiver(Arc::new(Inbox::default())).unwrap();
        server.start().await.unwrap();
        server_node.claim_master(RoleSlot::SERVER).await.unwrap();

        let member = joined_member(&ctx, &ensemble, fast_cluster_config(1)).await;
        let client = ServerClient::new(member.clone(), loopback_transport()).unwrap();
        client.set_receiver(Arc::new(Inbox::default())).unwrap();
        member.claim_master(member.my_slot()).await.unwrap();
        wait_until(|| member.is_master() && member.master(RoleSlot::SERVER).is_some()).await;
        client.start(true).unwrap();
        wait_until(|| client.is_connected() && server.registry().contains(1)).await;

        let rival = joined_member(&ctx, &ensemble, fast_cluster_config(1)).await;
        rival.claim_master(RoleSlot(1)).await.unwrap();
        wait_until(|| !member.is_master()).await;
        wait_until(|| !client.is_connected()).await;
        assert_eq!(client.peer_name(), None);

        // Several reconnect intervals pass without another dial
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.connect_count(), 1);
        assert!(!server.registry().contains(1));
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_send_without_connection_is_dropped() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let member = joined_member(&ctx, &ensemble, fast_cluster_config(1)).await;
        let client = ServerClient::new(member, loopback_transport()).unwrap();
        client.set_receiver(Arc::new(Inbox::default())).unwrap();
        client.start(false).unwrap();

        client.send(Message::request(0, b"lost".to_vec()));
        assert!(!client.is_connected());
        assert_eq!(client.connect_count(), 0);
        ctx.stop(Duration::from_secs(1)).await;
    }
}
