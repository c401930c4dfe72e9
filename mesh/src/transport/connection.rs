use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::SinkExt;
use tokio::{
    net::{tcp::OwnedReadHalf, TcpStream},
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::debug;

use super::{codec::FrameCodec, message::Frame};
use crate::{context::MeshContext, error::TransportError};

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Write side of an open node connection. Frames are queued to a writer task,
/// so `send` never waits on the socket.
#[derive(Debug)]
pub(crate) struct Connection {
    id: u64,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
}

impl Connection {
    /// Split `stream`, start its writer task and hand back the read half.
    pub(crate) fn open(
        ctx: &MeshContext,
        stream: TcpStream,
        max_frame_bytes: usize,
        parent: &CancellationToken,
    ) -> Result<(Arc<Connection>, FrameReader), TransportError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, FrameCodec::new(max_frame_bytes));
        let mut writer = FramedWrite::new(write_half, FrameCodec::new(max_frame_bytes));

        let (outbound, mut queue) = mpsc::unbounded_channel::<Frame>();
        let closed = parent.child_token();
        let connection = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            outbound,
            closed: closed.clone(),
        });

        ctx.spawn("connection_writer", async move {
            loop {
                tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    frame = queue.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = writer.send(frame).await {
                            debug!(%peer, "Write failed: {}", e);
                            break;
                        }
                    }
                }
            }
            closed.cancel();
            let _ = writer.close().await;
        });

        Ok((connection, reader))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a frame. Returns `false` if the connection is already closed.
    pub(crate) fn send(&self, frame: Frame) -> bool {
        !self.closed.is_cancelled() && self.outbound.send(frame).is_ok()
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }
}
