//! Outbound link to the current master of another role slot.
//!
//! Both client roles of the fabric follow one peer at a time: a group master
//! follows the `SERVER` slot and a slave follows the master of its own group.
//! Every retarget bumps a generation counter; connection attempts belonging to
//! an older generation give up on their own instead of being cancelled.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    connection::{Connection, FrameReader},
    message::{Frame, Message, MessageReceiver},
};
use crate::{
    cluster::ClusterCoordinator,
    config::TransportConfig,
    error::{MeshError, MeshResult, TransportError},
    metrics::MeshMetrics,
    properties::{NodeInfo, PropertyKey, IP_ADDRESS, IP_SERVER_PORT, IP_SLAVE_PORT},
    retry::FixedBackoff,
};

/// Which peer a [`PeerLink`] follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkRole {
    /// A group master following the server
    Server,
    /// A slave following the master of its own group
    Master,
}

impl LinkRole {
    fn port(self) -> PropertyKey {
        match self {
            LinkRole::Server => IP_SERVER_PORT,
            LinkRole::Master => IP_SLAVE_PORT,
        }
    }

    fn peer(self) -> &'static str {
        match self {
            LinkRole::Server => "server",
            LinkRole::Master => "master",
        }
    }

    /// Whether this process's current role still calls for the link.
    fn wanted(self, cluster: &ClusterCoordinator) -> bool {
        match self {
            LinkRole::Server => cluster.is_master(),
            LinkRole::Master => !cluster.is_master(),
        }
    }
}

#[derive(Debug, Default)]
struct LinkState {
    /// Name of the peer this link follows
    peer_name: Option<String>,
    generation: u64,
    connection: Option<Arc<Connection>>,
    last_message_id: i64,
}

pub(crate) struct PeerLink {
    cluster: Arc<ClusterCoordinator>,
    config: TransportConfig,
    role: LinkRole,
    receiver: RwLock<Option<Arc<dyn MessageReceiver>>>,
    started: AtomicBool,
    state: Mutex<LinkState>,
    connects: AtomicU64,
    cancel: CancellationToken,
    this: Weak<PeerLink>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PeerLink")
            .field("role", &self.role)
            .field("peer", &state.peer_name)
            .field("generation", &state.generation)
            .field("connected", &state.connection.is_some())
            .finish()
    }
}

impl PeerLink {
    pub(crate) fn new(
        cluster: Arc<ClusterCoordinator>,
        config: TransportConfig,
        role: LinkRole,
    ) -> MeshResult<Arc<Self>> {
        config.validate().map_err(MeshError::Config)?;
        Ok(Arc::new_cyclic(|this| Self {
            cancel: cluster.context().shutdown_token(),
            cluster,
            config,
            role,
            receiver: RwLock::new(None),
            started: AtomicBool::new(false),
            state: Mutex::new(LinkState::default()),
            connects: AtomicU64::new(0),
            this: this.clone(),
        }))
    }

    pub(crate) fn cluster(&self) -> &Arc<ClusterCoordinator> {
        &self.cluster
    }

    /// Register the inbound message sink. Only allowed before `start`.
    pub(crate) fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) -> MeshResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(TransportError::ReceiverAfterStart.into());
        }
        *self.receiver.write() = Some(receiver);
        Ok(())
    }

    /// Flip to started. Fails without a receiver or on a second call.
    pub(crate) fn mark_started(&self, what: &'static str) -> MeshResult<()> {
        if self.receiver.read().is_none() {
            return Err(TransportError::NoReceiver.into());
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(MeshError::AfterInitialization(what));
        }
        Ok(())
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn peer_name(&self) -> Option<String> {
        self.state.lock().peer_name.clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state
            .lock()
            .connection
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }

    pub(crate) fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Send to the peer. Non-response messages are stamped with the next
    /// sequence id under the same lock that enqueues them.
    pub(crate) fn send(&self, mut message: Message) {
        let mut state = self.state.lock();
        if !message.response {
            state.last_message_id += 1;
            message.message_id = state.last_message_id;
        }
        let Some(connection) = state.connection.as_ref() else {
            warn!(
                "Not connected to {}, dropping message {}",
                self.role.peer(),
                message.message_id
            );
            MeshMetrics::record_send_dropped();
            return;
        };
        debug!(message_id = message.message_id, "Send");
        if !connection.send(Frame::Message(message)) {
            warn!("Connection to {} closed, message dropped", self.role.peer());
            MeshMetrics::record_send_dropped();
        }
    }

    /// Drop the current connection (if any) and follow `target` instead.
    pub(crate) fn reconnect(&self, target: NodeInfo) {
        if self.cancel.is_cancelled() {
            return;
        }
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            if let Some(old) = state.connection.take() {
                old.close();
            }
            state.peer_name = Some(target.name.clone());
            state.generation
        };
        self.spawn_connect(generation, target, false);
    }

    /// Stop following any peer. Pending attempts become stale.
    pub(crate) fn disconnect(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.peer_name = None;
        if let Some(old) = state.connection.take() {
            old.close();
        }
    }

    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
        self.disconnect();
    }

    fn spawn_connect(&self, generation: u64, target: NodeInfo, after_loss: bool) {
        let Some(link) = self.this.upgrade() else {
            return;
        };
        self.cluster
            .context()
            .spawn("peer_link_connect", link.connect(generation, target, after_loss));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// After a lost connection the first attempt waits one interval, so a
    /// role change that caused the loss is observed before redialing.
    async fn connect(self: Arc<Self>, generation: u64, target: NodeInfo, after_loss: bool) {
        let mut backoff = FixedBackoff::unbounded(self.config.reconnect_interval());
        if after_loss {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = backoff.next_attempt() => {}
            }
        }
        loop {
            if self.cancel.is_cancelled() || !self.is_current(generation) {
                debug!(peer = %target.name, "Connection attempt superseded");
                return;
            }
            if !self.role.wanted(&self.cluster) {
                info!(peer = %target.name, "Role changed, no longer connecting to {}", self.role.peer());
                return;
            }
            match self.try_connect(generation, &target).await {
                Ok(_) => return,
                Err(e) => warn!(peer = %target.name, "Failed connecting to {}: {}", self.role.peer(), e),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = backoff.next_attempt() => {}
            }
        }
    }

    /// Returns `Ok(false)` if the attempt connected but was superseded meanwhile.
    async fn try_connect(&self, generation: u64, target: &NodeInfo) -> MeshResult<bool> {
        let info = self
            .cluster
            .node(&target.name)
            .await?
            .unwrap_or_else(|| target.clone());
        let port_key = self.role.port();
        let ip = info.ip_address().ok_or(TransportError::MissingAddress {
            node: info.name.clone(),
            property: IP_ADDRESS.name(),
        })?;
        let port = info.port(port_key).ok_or(TransportError::MissingAddress {
            node: info.name.clone(),
            property: port_key.name(),
        })?;
        let addr = SocketAddr::new(ip, port);
        let name = self.cluster.my_name().ok_or(MeshError::NotJoined)?;

        let stream = tokio::time::timeout(
            self.cluster.config().connection_timeout(),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| TransportError::Handshake(format!("connect to {addr} timed out")))?
        .map_err(TransportError::from)?;
        let (connection, reader) =
            Connection::open(self.cluster.context(), stream, self.config.max_frame_bytes, &self.cancel)?;

        {
            let mut state = self.state.lock();
            if state.generation != generation {
                connection.close();
                return Ok(false);
            }
            connection.send(Frame::Hello {
                node_id: self.cluster.my_node_id(),
                name,
            });
            if let Some(old) = state.connection.replace(connection.clone()) {
                old.close();
            }
        }
        self.connects.fetch_add(1, Ordering::Relaxed);
        info!(peer = %info.name, %addr, "Connected to {}", self.role.peer());

        if let Some(link) = self.this.upgrade() {
            self.cluster.context().spawn(
                "peer_link_reader",
                link.read_loop(generation, connection, reader, info),
            );
        }
        Ok(true)
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        connection: Arc<Connection>,
        mut reader: FrameReader,
        peer: NodeInfo,
    ) {
        let receiver = self.receiver.read().clone();
        loop {
            tokio::select! {
                biased;
                _ = connection.closed_token().cancelled() => break,
                frame = reader.next() => match frame {
                    Some(Ok(Frame::Message(mut message))) => {
                        message.node = peer.node_id;
                        debug!(message_id = message.message_id, "Received message");
                        if let Some(receiver) = &receiver {
                            receiver.receive(message);
                        }
                    }
                    Some(Ok(Frame::Hello { .. })) => warn!("Ignoring hello from {}", self.role.peer()),
                    Some(Err(e)) => {
                        warn!("Dropping {} connection after read error: {}", self.role.peer(), e);
                        break;
                    }
                    None => break,
                },
            }
        }
        connection.close();

        let lost = {
            let mut state = self.state.lock();
            let ours = state
                .connection
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &connection));
            if ours {
                state.connection = None;
            }
            ours && state.generation == generation
        };
        if !lost || self.cancel.is_cancelled() {
            return;
        }
        if self.role.wanted(&self.cluster) {
            warn!("Lost connection to {} {}, reconnecting", self.role.peer(), peer.name);
            self.spawn_connect(generation, peer, true);
        } else {
            info!("Connection to {} {} closed after a role change", self.role.peer(), peer.name);
        }
    }
}
