//! Node id <-> connection registry of the server role.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tracing::info;

use super::connection::Connection;
use crate::{error::TransportError, metrics::MeshMetrics};

#[derive(Debug, Default)]
struct RegistryState {
    listening: Option<SocketAddr>,
    by_node: HashMap<i16, Arc<Connection>>,
    by_connection: HashMap<u64, i16>,
}

/// At most one connection per node id. Both directions of the mapping change
/// together under one lock, so concurrent accept and close paths never see a
/// half-updated entry.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    state: Mutex<RegistryState>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listening(&self, addr: SocketAddr) {
        self.state.lock().listening = Some(addr);
    }

    /// Address of the listening socket, if bound.
    pub fn listening(&self) -> Option<SocketAddr> {
        self.state.lock().listening
    }

    /// Register `connection` for `node_id`. A node that is already connected
    /// keeps its existing connection and the new one is refused.
    pub(crate) fn admit(
        &self,
        node_id: i16,
        connection: Arc<Connection>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.by_node.contains_key(&node_id) {
            return Err(TransportError::DuplicateConnection(node_id));
        }
        state.by_connection.insert(connection.id(), node_id);
        state.by_node.insert(node_id, connection);
        MeshMetrics::set_registered_connections(state.by_node.len());
        Ok(())
    }

    /// Drop the entry owned by `connection_id`. Returns the node it served.
    pub(crate) fn remove_connection(&self, connection_id: u64) -> Option<i16> {
        let mut state = self.state.lock();
        let node_id = state.by_connection.remove(&connection_id)?;
        state.by_node.remove(&node_id);
        MeshMetrics::set_registered_connections(state.by_node.len());
        Some(node_id)
    }

    pub(crate) fn get(&self, node_id: i16) -> Option<Arc<Connection>> {
        self.state.lock().by_node.get(&node_id).cloned()
    }

    pub fn contains(&self, node_id: i16) -> bool {
        self.state.lock().by_node.contains_key(&node_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget the connection of `node_id`.
    pub fn close_node(&self, node_id: i16) -> bool {
        let connection = {
            let mut state = self.state.lock();
            let Some(connection) = state.by_node.remove(&node_id) else {
                return false;
            };
            state.by_connection.remove(&connection.id());
            MeshMetrics::set_registered_connections(state.by_node.len());
            connection
        };
        info!(node_id, peer = %connection.peer(), "Closing connection");
        connection.close();
        true
    }

    /// Close every connection and forget the listening entry.
    pub fn clear(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut state = self.state.lock();
            state.listening = None;
            state.by_connection.clear();
            MeshMetrics::set_registered_connections(0);
            state.by_node.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            connection.close();
        }
    }
}
