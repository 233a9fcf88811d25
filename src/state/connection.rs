//! Outbound side of a client connection, as seen by its session.

use crate::error::DeliveryError;
use crate::state::uid::ConnectionId;
use replicad_proto::DownstreamMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Where a session sends its downstream messages.
///
/// `send` must never block: it is called from the object manager loop.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;
    fn send(&self, message: DownstreamMessage) -> Result<(), DeliveryError>;
    /// Asks the network side to close the connection.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Connection backed by a bounded channel drained by a writer task.
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::Sender<DownstreamMessage>,
    closed: CancellationToken,
}

impl ChannelConnection {
    pub fn new(
        id: ConnectionId,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<DownstreamMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Arc::new(Self {
            id,
            tx,
            closed: CancellationToken::new(),
        });
        (conn, rx)
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn cancelled(&self) {
        self.closed.cancelled().await;
    }

    /// Token cancelled on close, for use in `select!`.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: DownstreamMessage) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_is_reported() {
        let (conn, _rx) = ChannelConnection::new(1, 1);
        assert!(conn.send(DownstreamMessage::UnsubscribeResponse { oid: 1 }).is_ok());
        assert_eq!(
            conn.send(DownstreamMessage::UnsubscribeResponse { oid: 2 }),
            Err(DeliveryError::QueueFull)
        );
    }

    #[test]
    fn closed_connection_refuses_messages() {
        let (conn, _rx) = ChannelConnection::new(1, 4);
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(
            conn.send(DownstreamMessage::UnsubscribeResponse { oid: 1 }),
            Err(DeliveryError::Closed)
        );
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_closed() {
        let (conn, rx) = ChannelConnection::new(7, 4);
        drop(rx);
        assert!(conn.is_closed());
        assert_eq!(conn.id(), 7);
    }
}
