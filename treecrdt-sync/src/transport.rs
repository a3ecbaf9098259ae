//! Transport abstraction and an in-memory duplex pair.
//!
//! The peer only ever holds a `send` half; incoming messages are pumped into
//! [`crate::peer::SyncPeer::handle_message`] by whatever owns the receive
//! side (a websocket task, a broadcast channel, or the in-memory pump below).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::messages::SyncMessage;
use crate::peer::SyncPeer;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier of the remote peer on this link. Used to key
    /// capability state and subscriptions.
    fn peer_id(&self) -> &str;

    async fn send(&self, msg: SyncMessage) -> Result<(), SyncError>;
}

/// One direction of an in-memory link: encodes messages and queues the bytes
/// for the opposite side's pump.
pub struct MemoryTransport {
    peer: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn peer_id(&self) -> &str {
        &self.peer
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), SyncError> {
        let bytes = msg.encode()?;
        self.tx
            .send(bytes)
            .map_err(|_| SyncError::Transport("peer hung up".into()))
    }
}

/// Build both directions of a link between peers named `a` and `b`.
///
/// Returns `((a_to_b, a_out_rx), (b_to_a, b_out_rx))`: the first transport is
/// held by peer `a` (it names remote peer `b`), and `a_out_rx` yields the
/// bytes peer `a` sent, to be pumped into peer `b`.
pub fn memory_link(
    a: &str,
    b: &str,
) -> (
    (Arc<MemoryTransport>, mpsc::UnboundedReceiver<Vec<u8>>),
    (Arc<MemoryTransport>, mpsc::UnboundedReceiver<Vec<u8>>),
) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a_to_b = Arc::new(MemoryTransport {
        peer: b.to_string(),
        tx: a_tx,
    });
    let b_to_a = Arc::new(MemoryTransport {
        peer: a.to_string(),
        tx: b_tx,
    });
    ((a_to_b, a_rx), (b_to_a, b_rx))
}

/// Deliver a link direction into a peer: decode each frame and hand it to the
/// peer together with the reply transport.
pub fn spawn_pump(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    peer: Arc<SyncPeer>,
    reply: Arc<MemoryTransport>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let msg = match SyncMessage::decode(&bytes) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::warn!(error = %err, "dropping undecodable frame");
                    continue;
                }
            };
            let reply: Arc<dyn Transport> = reply.clone();
            if let Err(err) = peer.handle_message(&reply, msg).await {
                tracing::warn!(error = %err, "message handling failed");
            }
        }
    })
}
