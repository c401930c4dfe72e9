//! Control/data channel multiplexer
//!
//! One group-communication channel carries both the grid's control traffic
//! and its data traffic. [`ControlChannel`] splits them into two receivers by
//! the presence of the control marker header. [`WireChannel`] carries the
//! planes over a stack that only moves bytes.

mod channel;
mod envelope;
mod wire;

pub use channel::{BoxError, ChannelEvent, ChannelReceiver, ControlChannel, GroupChannel, UpReply};
pub use envelope::{GroupMessage, GroupView, MemberAddress, Plane, CONTROL_HEADER_ID};
pub use wire::{RawGroupChannel, WireChannel};
