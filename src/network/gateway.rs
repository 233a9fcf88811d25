//! Gateway - TCP listener that accepts incoming connections.
//!
//! The Gateway binds a socket and spawns a [`ClientConnection`] task for
//! each incoming client until shutdown is signalled.

use crate::config::{ListenConfig, SessionConfig};
use crate::network::auth::Authenticator;
use crate::network::connection::{ClientConnection, ConnectionSettings};
use crate::state::{ClientManager, ConnectionIdGenerator};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, instrument};

/// The Gateway accepts incoming TCP connections and spawns handlers.
pub struct Gateway {
    listener: TcpListener,
    clients: Arc<ClientManager>,
    authenticator: Arc<dyn Authenticator>,
    settings: ConnectionSettings,
    ids: ConnectionIdGenerator,
    shutdown_tx: broadcast::Sender<()>,
}

impl Gateway {
    /// Bind the gateway to the configured address.
    pub async fn bind(
        listen: &ListenConfig,
        session: &SessionConfig,
        clients: Arc<ClientManager>,
        authenticator: Arc<dyn Authenticator>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen.address).await?;
        info!(address = %listener.local_addr()?, "Listener bound");
        Ok(Self {
            listener,
            clients,
            authenticator,
            settings: ConnectionSettings {
                handshake_timeout: listen.handshake_timeout(),
                max_frame: listen.max_frame,
                outbound_queue: session.outbound_queue,
            },
            ids: ConnectionIdGenerator::new(),
            shutdown_tx,
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the gateway, accepting connections until shutdown.
    #[instrument(skip(self), name = "gateway")]
    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let id = self.ids.next();
                        info!(%addr, connection = id, "Connection accepted");
                        if let Err(e) = stream.set_nodelay(true) {
                            error!(%addr, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let connection = ClientConnection::new(
                            id,
                            stream,
                            addr,
                            Arc::clone(&self.clients),
                            Arc::clone(&self.authenticator),
                            self.settings,
                            self.shutdown_tx.subscribe(),
                        );
                        tokio::spawn(async move {
                            if let Err(e) = connection.run().await {
                                info!(connection = id, %addr, code = e.error_code(), error = %e, "Connection ended with error");
                            }
                            info!(connection = id, %addr, "Connection closed");
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("Gateway stopping");
                    break;
                }
            }
        }
        Ok(())
    }
}
