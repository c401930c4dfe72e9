//! Adapter from a byte-level group stack to [`GroupChannel`].
//!
//! The stack below moves opaque bodies. On the way down the plane of each
//! [`GroupMessage`] is written as the header block; on the way up the header
//! block decides the plane again.

use std::sync::Arc;

use bytes::Bytes;

use super::{
    channel::{BoxError, ChannelEvent, GroupChannel},
    envelope::{GroupMessage, MemberAddress},
};
use crate::error::MultiplexError;

/// A group stack that carries opaque message bodies.
pub trait RawGroupChannel: Send + Sync {
    fn local_address(&self) -> Option<MemberAddress>;

    /// Send `body` to `dest`, or to the whole group when `dest` is `None`.
    fn send_raw(&self, dest: Option<&MemberAddress>, body: Bytes) -> Result<(), BoxError>;

    fn discard_own_messages(&self) -> bool;

    fn set_discard_own_messages(&self, discard: bool);
}

pub struct WireChannel {
    raw: Arc<dyn RawGroupChannel>,
}

impl std::fmt::Debug for WireChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireChannel")
            .field("local", &self.raw.local_address())
            .finish()
    }
}

impl WireChannel {
    pub fn new(raw: Arc<dyn RawGroupChannel>) -> Self {
        Self { raw }
    }

    /// Turn a body received from the stack into an event for
    /// [`ControlChannel::up`](super::ControlChannel::up).
    pub fn message_event(
        src: Option<MemberAddress>,
        dest: Option<MemberAddress>,
        body: Bytes,
    ) -> Result<ChannelEvent, MultiplexError> {
        GroupMessage::decode_body(src, dest, body).map(ChannelEvent::Message)
    }
}

impl GroupChannel for WireChannel {
    fn local_address(&self) -> Option<MemberAddress> {
        self.raw.local_address()
    }

    fn send(&self, message: GroupMessage) -> Result<(), MultiplexError> {
        self.raw
            .send_raw(message.dest.as_ref(), message.encode_body())
            .map_err(|e| MultiplexError::Send(e.to_string()))
    }

    fn discard_own_messages(&self) -> bool {
        self.raw.discard_own_messages()
    }

    fn set_discard_own_messages(&self, discard: bool) {
        self.raw.set_discard_own_messages(discard);
    }
}
