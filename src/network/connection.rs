//! ClientConnection - Handles an individual client connection.
//!
//! Each connection runs in its own Tokio task:
//!
//! ```text
//! Phase 1: Handshake (Authenticate within the timeout)
//!    ↓
//! Phase 2: Session attached
//!    ┌──────────────────────────────────────────────┐
//!    │  reader loop ──▶ Session::handle_message     │
//!    │                                              │
//!    │  Session ──▶ outbound queue ──▶ writer task  │
//!    └──────────────────────────────────────────────┘
//! ```
//!
//! Closing from the server side (logoff, session end, resume elsewhere)
//! cancels the connection's token, which stops both halves.

use crate::error::SessionError;
use crate::network::auth::{AuthVerdict, Authenticator};
use crate::state::{ChannelConnection, ClientManager, Connection, ConnectionId};
use crate::telemetry::spans;
use futures_util::{SinkExt, StreamExt};
use replicad_proto::{AuthResponse, DownstreamMessage, ServerCodec, UpstreamMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{Instrument, debug, info, warn};

/// Per-connection settings taken from the config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionSettings {
    pub handshake_timeout: Duration,
    pub max_frame: usize,
    pub outbound_queue: usize,
}

/// A client connection handler.
pub struct ClientConnection {
    id: ConnectionId,
    addr: SocketAddr,
    stream: TcpStream,
    clients: Arc<ClientManager>,
    authenticator: Arc<dyn Authenticator>,
    settings: ConnectionSettings,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ClientConnection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        addr: SocketAddr,
        clients: Arc<ClientManager>,
        authenticator: Arc<dyn Authenticator>,
        settings: ConnectionSettings,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            addr,
            stream,
            clients,
            authenticator,
            settings,
            shutdown_rx,
        }
    }

    /// Runs the handshake, then pumps messages until either side closes.
    pub async fn run(self) -> Result<(), SessionError> {
        let span = spans::connection(self.id, &self.addr);
        self.serve().instrument(span).await
    }

    async fn serve(self) -> Result<(), SessionError> {
        let Self {
            id,
            addr: _,
            stream,
            clients,
            authenticator,
            settings,
            mut shutdown_rx,
        } = self;

        let framed = Framed::new(stream, ServerCodec::with_max_frame(settings.max_frame));
        let (mut sink, mut frames) = framed.split();

        // Phase 1: handshake
        let request = match tokio::time::timeout(settings.handshake_timeout, frames.next()).await {
            Err(_) => return Err(SessionError::HandshakeTimeout),
            Ok(None) => return Err(SessionError::ClosedDuringHandshake),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(UpstreamMessage::Authenticate(request)))) => request,
            Ok(Some(Ok(other))) => return Err(SessionError::NotAuthenticated(other.name())),
        };
        if let AuthVerdict::Reject { reason } = authenticator.authenticate(&request).await {
            let _ = sink
                .send(DownstreamMessage::Auth(AuthResponse::Rejected {
                    reason: reason.clone(),
                }))
                .await;
            return Err(SessionError::Rejected(reason));
        }
        sink.send(DownstreamMessage::Auth(AuthResponse::Accepted))
            .await?;
        info!(username = %request.username, "Client authenticated");

        // Phase 2: session attached
        let (conn, mut outbound) = ChannelConnection::new(id, settings.outbound_queue);
        let closed = conn.close_token();
        let session_span = spans::session(&request.username, id);
        let session = clients.connection_established(
            &request.username,
            request.boot_groups,
            conn.clone() as Arc<dyn Connection>,
        );

        let writer_closed = closed.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outbound.recv() => match message {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                debug!(error = %e, "Write failed");
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = writer_closed.cancelled() => break,
                }
            }
            // Deliver whatever was queued before the close.
            while let Ok(message) = outbound.try_recv() {
                if sink.feed(message).await.is_err() {
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let result = async {
            loop {
                tokio::select! {
                    frame = frames.next() => match frame {
                        Some(Ok(message)) => session.handle_message(message),
                        Some(Err(e)) => break Err(SessionError::from(e)),
                        None => break Ok(()),
                    },
                    _ = closed.cancelled() => {
                        debug!("Connection closed by server");
                        break Ok(());
                    }
                    _ = shutdown_rx.recv() => break Ok(()),
                }
            }
        }
        .instrument(session_span)
        .await;

        conn.close();
        clients.connection_closed(id);
        if let Err(e) = writer.await {
            warn!(error = %e, "Writer task failed");
        }
        result
    }
}
