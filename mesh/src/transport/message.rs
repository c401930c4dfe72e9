use serde::{Deserialize, Serialize};

/// Unit of node-to-node traffic. The payload is opaque to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Destination node id when sending; the sender's node id once received.
    pub node: i16,
    pub response: bool,
    /// Sequence id stamped by the sender on non-response messages. Responses
    /// carry the id of the request they answer.
    pub message_id: i64,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn request(node: i16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            node,
            response: false,
            message_id: 0,
            payload: payload.into(),
        }
    }

    pub fn response_to(request: &Message, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            node: request.node,
            response: true,
            message_id: request.message_id,
            payload: payload.into(),
        }
    }
}

/// Everything written on a node connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every connection, identifying the connecting node.
    Hello { node_id: i16, name: String },
    Message(Message),
}

/// Sink for inbound messages, registered once before the transport starts.
pub trait MessageReceiver: Send + Sync {
    fn receive(&self, message: Message);
}
