//! Group message envelope and its wire header block.
//!
//! The header block is a `u16` count followed by `(id: u16, len: u16, body)`
//! entries. A control-plane message carries exactly one marker header with id
//! [`CONTROL_HEADER_ID`] and an empty body; its presence is the only thing that
//! distinguishes control from data traffic. Headers with other ids belong to
//! other protocol layers and are skipped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::MultiplexError;

/// Reserved header id of the control-plane marker.
pub const CONTROL_HEADER_ID: u16 = 1199;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Plane {
    Control,
    Data,
}

impl Plane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plane::Control => "control",
            Plane::Data => "data",
        }
    }
}

/// Address of a group member as assigned by the group channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberAddress(pub String);

impl std::fmt::Display for MemberAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberAddress {
    fn from(value: &str) -> Self {
        MemberAddress(value.to_string())
    }
}

/// Group membership view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupView {
    pub view_id: u64,
    pub members: Vec<MemberAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    pub src: Option<MemberAddress>,
    /// `None` addresses the whole group
    pub dest: Option<MemberAddress>,
    pub plane: Plane,
    pub payload: Bytes,
}

impl GroupMessage {
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            src: None,
            dest: None,
            plane: Plane::Data,
            payload: payload.into(),
        }
    }

    pub fn to(mut self, dest: MemberAddress) -> Self {
        self.dest = Some(dest);
        self
    }

    pub fn from_member(mut self, src: MemberAddress) -> Self {
        self.src = Some(src);
        self
    }

    pub fn is_control(&self) -> bool {
        self.plane == Plane::Control
    }

    /// Header block followed by the payload.
    pub fn encode_body(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.payload.len());
        match self.plane {
            Plane::Control => {
                buf.put_u16(1);
                buf.put_u16(CONTROL_HEADER_ID);
                buf.put_u16(0);
            }
            Plane::Data => buf.put_u16(0),
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a body produced by [`encode_body`](Self::encode_body) or by a
    /// peer stack that adds its own headers.
    pub fn decode_body(
        src: Option<MemberAddress>,
        dest: Option<MemberAddress>,
        mut body: Bytes,
    ) -> Result<Self, MultiplexError> {
        let truncated = || MultiplexError::Header("truncated header block".to_string());
        if body.remaining() < 2 {
            return Err(truncated());
        }
        let count = body.get_u16();
        let mut plane = Plane::Data;
        for _ in 0..count {
            if body.remaining() < 4 {
                return Err(truncated());
            }
            let id = body.get_u16();
            let len = body.get_u16() as usize;
            if body.remaining() < len {
                return Err(truncated());
            }
            if id == CONTROL_HEADER_ID {
                if len != 0 {
                    return Err(MultiplexError::Header(format!(
                        "control marker must be empty, got {len} bytes"
                    )));
                }
                plane = Plane::Control;
            }
            body.advance(len);
        }
        Ok(Self {
            src,
            dest,
            plane,
            payload: body,
        })
    }
}
