//! Server role of the node transport.
//!
//! Accepts connections from the masters of every node group. Each connection
//! opens with a `Hello` naming the connecting node; the name must resolve to a
//! published member carrying the same node id that currently holds its
//! group's role slot. The registry then maps the node id to the connection
//! until either side closes it or the node's role slot changes hands.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    connection::{Connection, FrameReader},
    message::{Frame, Message, MessageReceiver},
    registry::ChannelRegistry,
};
use crate::{
    cluster::ClusterCoordinator,
    config::TransportConfig,
    error::{MeshError, MeshResult, TransportError},
    metrics::MeshMetrics,
    properties::{NodeInfo, PropertyKind, PropertyValue, IP_SERVER_PORT},
    roles::{NodeChangeListener, RoleSlot},
};

pub struct NodeServer {
    cluster: Arc<ClusterCoordinator>,
    config: TransportConfig,
    receiver: RwLock<Option<Arc<dyn MessageReceiver>>>,
    started: AtomicBool,
    registry: Arc<ChannelRegistry>,
    /// Last issued message id. Held while enqueueing so ids reach each
    /// connection in issue order.
    last_message_id: Mutex<i64>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for NodeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServer")
            .field("listening", &self.registry.listening())
            .field("connections", &self.registry.len())
            .finish()
    }
}

impl NodeServer {
    pub fn new(cluster: Arc<ClusterCoordinator>, config: TransportConfig) -> MeshResult<Arc<Self>> {
        config.validate().map_err(MeshError::Config)?;
        cluster.add_node_property(IP_SERVER_PORT, true, true, PropertyKind::Port)?;

        let server = Arc::new(Self {
            cancel: cluster.context().shutdown_token(),
            cluster: cluster.clone(),
            config,
            receiver: RwLock::new(None),
            started: AtomicBool::new(false),
            registry: Arc::new(ChannelRegistry::new()),
            last_message_id: Mutex::new(0),
        });
        cluster.add_any_node_change_listener(Arc::new(PeerSlotListener {
            registry: Arc::downgrade(&server.registry),
        }));
        Ok(server)
    }

    /// Register the inbound message sink. Only allowed before `start`.
    pub fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) -> MeshResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(TransportError::ReceiverAfterStart.into());
        }
        *self.receiver.write() = Some(receiver);
        Ok(())
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.registry.listening()
    }

    /// Bind the listening socket, publish its port and start accepting.
    pub async fn start(self: &Arc<Self>) -> MeshResult<SocketAddr> {
        if self.receiver.read().is_none() {
            return Err(TransportError::NoReceiver.into());
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return self
                .registry
                .listening()
                .ok_or(MeshError::AfterInitialization("node server already started"));
        }

        let bind = SocketAddr::new(self.config.bind_address, self.config.server_port);
        let listener = TcpListener::bind(bind).await.map_err(TransportError::from)?;
        let local = listener.local_addr().map_err(TransportError::from)?;
        self.registry.set_listening(local);
        self.cluster
            .set_node_property(IP_SERVER_PORT, PropertyValue::Port(local.port()))
            .await?;

        info!(%local, "Node server listening");
        self.cluster
            .context()
            .spawn("node_server_accept", self.clone().accept_loop(listener));
        Ok(local)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        self.cluster.context().spawn("node_server_connection", async move {
                            if let Err(e) = server.serve_connection(stream, addr).await {
                                warn!(%addr, "Connection rejected: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed accepting connection: {}", e),
                },
            }
        }
        info!("Node server stopped accepting");
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> MeshResult<()> {
        let (connection, mut reader) = Connection::open(
            self.cluster.context(),
            stream,
            self.config.max_frame_bytes,
            &self.cancel,
        )?;
        let node_id = match self.admit(&connection, &mut reader, addr).await {
            Ok(node_id) => node_id,
            Err(e) => {
                connection.close();
                return Err(e);
            }
        };
        info!(node_id, %addr, "Node connected");

        let receiver = self.receiver.read().clone();
        loop {
            tokio::select! {
                biased;
                _ = connection.closed_token().cancelled() => break,
                frame = reader.next() => match frame {
                    Some(Ok(Frame::Message(mut message))) => {
                        message.node = node_id;
                        debug!(node_id, message_id = message.message_id, "Received message");
                        if let Some(receiver) = &receiver {
                            receiver.receive(message);
                        }
                    }
                    Some(Ok(Frame::Hello { .. })) => {
                        warn!(node_id, "Ignoring repeated hello");
                    }
                    Some(Err(e)) => {
                        warn!(node_id, "Dropping connection after read error: {}", e);
                        break;
                    }
                    None => break,
                },
            }
        }

        self.registry.remove_connection(connection.id());
        connection.close();
        info!(node_id, %addr, "Node disconnected");
        Ok(())
    }

    /// Wait for the peer's hello and register the connection under its node id.
    async fn admit(
        &self,
        connection: &Arc<Connection>,
        reader: &mut FrameReader,
        addr: SocketAddr,
    ) -> MeshResult<i16> {
        let first = tokio::time::timeout(self.config.handshake_timeout(), reader.next())
            .await
            .map_err(|_| {
                MeshMetrics::record_connection_rejected("handshake");
                TransportError::Handshake(format!("no hello from {addr}"))
            })?;
        let (node_id, name) = match first {
            Some(Ok(Frame::Hello { node_id, name })) => (node_id, name),
            Some(Ok(Frame::Message(_))) => {
                MeshMetrics::record_connection_rejected("handshake");
                return Err(TransportError::Handshake("message before hello".to_string()).into());
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(
                    TransportError::Handshake("closed before hello".to_string()).into(),
                )
            }
        };

        let known = self
            .cluster
            .node(&name)
            .await?
            .filter(|info| info.node_id == node_id);
        if known.is_none() {
            warn!("Received connection from an unknown node {} at {}", name, addr);
            MeshMetrics::record_connection_rejected("unknown_peer");
            return Err(TransportError::UnknownPeer(format!("{name} at {addr}")).into());
        }

        // The binding may still be on its way to this member's role table
        let slot = RoleSlot(node_id);
        if !self
            .cluster
            .wait_for_master(slot, &name, self.config.handshake_timeout())
            .await
        {
            warn!(%slot, "Received connection from {} at {}, which is not the group master", name, addr);
            MeshMetrics::record_connection_rejected("not_master");
            return Err(TransportError::NotMaster(name).into());
        }

        if let Err(e) = self.registry.admit(node_id, connection.clone()) {
            warn!(
                "Received connection from address {} of node {}, but this node is already connected",
                addr, node_id
            );
            MeshMetrics::record_connection_rejected("duplicate");
            return Err(e.into());
        }
        Ok(node_id)
    }

    /// Send to the connection of `message.node`. Non-response messages get the
    /// next sequence id; id assignment and enqueue happen under one lock.
    /// Messages for nodes without a connection are dropped.
    pub fn send(&self, mut message: Message) {
        let mut last_id = self.last_message_id.lock();
        if !message.response {
            *last_id += 1;
            message.message_id = *last_id;
        }
        debug!(node = message.node, message_id = message.message_id, "Send");
        let node = message.node;
        let Some(connection) = self.registry.get(node) else {
            warn!("No open channel found for node {}", node);
            MeshMetrics::record_send_dropped();
            return;
        };
        if !connection.send(Frame::Message(message)) {
            warn!("Channel for node {} is closed", node);
            MeshMetrics::record_send_dropped();
        }
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        info!("Shutting down node server");
        self.cancel.cancel();
        self.registry.clear();
    }
}

/// Closes the connection of a node whose role slot switched or emptied.
struct PeerSlotListener {
    registry: Weak<ChannelRegistry>,
}

impl PeerSlotListener {
    fn close(&self, slot: RoleSlot, node: &NodeInfo, why: &str) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if registry.contains(node.node_id) {
            info!(%slot, "Closing channel for {} node {}", why, node.node_id);
            registry.close_node(node.node_id);
        }
    }
}

impl NodeChangeListener for PeerSlotListener {
    fn node_added(&self, _slot: RoleSlot, _node: &NodeInfo) {}

    fn node_switched(&self, slot: RoleSlot, old: Option<&NodeInfo>, new: &NodeInfo) {
        self.close(slot, old.unwrap_or(new), "switched");
    }

    fn node_removed(&self, slot: RoleSlot, node: &NodeInfo) {
        self.close(slot, node, "removed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::SinkExt;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::{
        context::MeshContext,
        coordination::{CoordinationClient, MemoryCoordinator},
        tests::test_utils::{fast_cluster_config, joined_member, loopback_transport, wait_until},
        transport::codec::FrameCodec,
    };

    #[derive(Default)]
    struct Inbox(Mutex<Vec<Message>>);

    impl MessageReceiver for Inbox {
        fn receive(&self, message: Message) {
            self.0.lock().push(message);
        }
    }

    async fn raw_peer(addr: SocketAddr, node_id: i16, name: &str) -> Framed<TcpStream, FrameCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new(1024 * 1024));
        framed
            .send(Frame::Hello {
                node_id,
                name: name.to_string(),
            })
            .await
            .unwrap();
        framed
    }

    async fn started_server(
        ctx: &Arc<MeshContext>,
        ensemble: &MemoryCoordinator,
    ) -> (Arc<NodeServer>, Arc<Inbox>, SocketAddr) {
        let cluster = joined_member(ctx, ensemble, fast_cluster_config(0)).await;
        let server = NodeServer::new(cluster, loopback_transport()).unwrap();
        let inbox = Arc::new(Inbox::default());
        server.set_receiver(inbox.clone()).unwrap();
        let addr = server.start().await.unwrap();
        (server, inbox, addr)
    }

    #[tokio::test]
    async fn test_start_requires_receiver() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let cluster = joined_member(&ctx, &ensemble, fast_cluster_config(0)).await;
        let server = NodeServer::new(cluster, loopback_transport()).unwrap();
        assert!(matches!(
            server.start().await,
            Err(MeshError::Transport(TransportError::NoReceiver))
        ));

        server.set_receiver(Arc::new(Inbox::default())).unwrap();
        server.start().await.unwrap();
        assert!(matches!(
            server.set_receiver(Arc::new(Inbox::default())),
            Err(MeshError::Transport(TransportError::ReceiverAfterStart))
        ));
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_bound_port_is_published() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let (server, _inbox, addr) = started_server(&ctx, &ensemble).await;

        let name = server.cluster.my_name().unwrap();
        let published = ensemble.session().node(&name).await.unwrap().unwrap();
        assert_eq!(published.port(IP_SERVER_PORT), Some(addr.port()));
        assert_eq!(server.local_addr(), Some(addr));
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unknown_peer_is_rejected() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let (server, _inbox, addr) = started_server(&ctx, &ensemble).await;

        let mut stranger = raw_peer(addr, 9, "node-9999999999").await;
        let closed = tokio::time::timeout(Duration::from_secs(2), stranger.next())
            .await
            .expect("server kept unknown connection open");
        assert!(closed.is_none() || closed.is_some_and(|f| f.is_err()));
        assert!(server.registry().is_empty());
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_peer_that_is_not_group_master_is_rejected() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let (server, _inbox, addr) = started_server(&ctx, &ensemble).await;
        let master = joined_member(&ctx, &ensemble, fast_cluster_config(6)).await;
        let slave = joined_member(&ctx, &ensemble, fast_cluster_config(6)).await;
        master.claim_master(RoleSlot(6)).await.unwrap();
        wait_until(|| server.cluster.master(RoleSlot(6)).is_some()).await;

        let mut framed = raw_peer(addr, 6, &slave.my_name().unwrap()).await;
        let closed = tokio::time::timeout(Duration::from_secs(3), framed.next())
            .await
            .expect("server kept a slave connection open");
        assert!(closed.is_none() || closed.is_some_and(|f| f.is_err()));
        assert!(server.registry().is_empty());

        // The slot's master is admitted
        let _master_link = raw_peer(addr, 6, &master.my_name().unwrap()).await;
        wait_until(|| server.registry().contains(6)).await;
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_messages_are_tagged_with_peer_and_ids_increase() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let (server, inbox, addr) = started_server(&ctx, &ensemble).await;
        let peer = joined_member(&ctx, &ensemble, fast_cluster_config(4)).await;
        peer.claim_master(RoleSlot(4)).await.unwrap();

        let mut framed = raw_peer(addr, 4, &peer.my_name().unwrap()).await;
        wait_until(|| server.registry().contains(4)).await;

        framed
            .send(Frame::Message(Message::request(0, b"hi".to_vec())))
            .await
            .unwrap();
        wait_until(|| !inbox.0.lock().is_empty()).await;
        assert_eq!(inbox.0.lock()[0].node, 4);

        server.send(Message::request(4, b"one".to_vec()));
        server.send(Message::request(4, b"two".to_vec()));
        let first = framed.next().await.unwrap().unwrap();
        let second = framed.next().await.unwrap().unwrap();
        let (Frame::Message(first), Frame::Message(second)) = (first, second) else {
            panic!("expected two messages");
        };
        assert_eq!(first.payload, b"one");
        assert!(first.message_id < second.message_id);

        // Responses keep the id they answer
        let reply = Message::response_to(&first, b"ack".to_vec());
        server.send(reply.clone());
        assert_eq!(framed.next().await.unwrap().unwrap(), Frame::Message(reply));

        // Unroutable sends are dropped
        server.send(Message::request(7, b"nobody".to_vec()));
        ctx.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_slot_change_closes_peer_connection() {
        let ctx = MeshContext::new().unwrap();
        let ensemble = MemoryCoordinator::new();
        let (server, _inbox, addr) = started_server(&ctx, &ensemble).await;
        let peer = joined_member(&ctx, &ensemble, fast_cluster_config(2)).await;
        peer.claim_master(RoleSlot(2)).await.unwrap();
        wait_until(|| peer.is_master() && server.cluster.master(RoleSlot(2)).is_some()).await;

        let mut framed = raw_peer(addr, 2, &peer.my_name().unwrap()).await;
        wait_until(|| server.registry().contains(2)).await;

        peer.release_master(RoleSlot(2)).await.unwrap();
        wait_until(|| !server.registry().contains(2)).await;
        let closed = tokio::time::timeout(Duration::from_secs(2), framed.next())
            .await
            .expect("connection not closed");
        assert!(closed.is_none() || closed.is_some_and(|f| f.is_err()));
        ctx.stop(Duration::from_secs(1)).await;
    }
}
