//! Node communication fabric
//!
//! Point-to-point TCP between the masters of node groups and the data-grid
//! server. [`NodeServer`] is the server role and [`ServerClient`] the client
//! role. [`SlaveClient`] links a slave to the master of its own group. All of
//! them react to role-slot events from the [`ClusterCoordinator`] to connect,
//! reconnect or drop connections as the topology changes.
//!
//! [`ClusterCoordinator`]: crate::cluster::ClusterCoordinator

mod client;
mod codec;
mod connection;
mod link;
mod message;
mod registry;
mod server;
mod slave;

pub use client::ServerClient;
pub use codec::FrameCodec;
pub use message::{Frame, Message, MessageReceiver};
pub use registry::ChannelRegistry;
pub use server::NodeServer;
pub use slave::SlaveClient;
