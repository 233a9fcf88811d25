//! Test client.
//!
//! Speaks the framed wire protocol and offers helpers to wait for specific
//! downstream messages.

use futures_util::{SinkExt, StreamExt};
use replicad_proto::{
    AuthRequest, AuthResponse, BootstrapData, ClientCodec, DEvent, DownstreamMessage, EventKind,
    ObjectSnapshot, Oid, UpstreamMessage, Value,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// A test client.
#[allow(dead_code)]
pub struct TestClient {
    framed: Framed<TcpStream, ClientCodec>,
    pub bootstrap: BootstrapData,
}

#[allow(dead_code)]
impl TestClient {
    /// Connect, authenticate and wait for the bootstrap and the client's
    /// own object.
    pub async fn connect(addr: SocketAddr, username: &str) -> anyhow::Result<Self> {
        Self::connect_with(addr, username, "", Vec::new()).await
    }

    pub async fn connect_with(
        addr: SocketAddr,
        username: &str,
        password: &str,
        boot_groups: Vec<String>,
    ) -> anyhow::Result<Self> {
        let mut framed = Self::handshake(addr, username, password, boot_groups).await?;
        match recv_from(&mut framed).await? {
            DownstreamMessage::Auth(AuthResponse::Accepted) => {}
            other => anyhow::bail!("authentication failed: {other:?}"),
        }
        let bootstrap = loop {
            if let DownstreamMessage::Bootstrap(data) = recv_from(&mut framed).await? {
                break data;
            }
        };
        let mut client = Self { framed, bootstrap };
        let own = client.bootstrap.client_oid;
        client.expect_object(own).await?;
        Ok(client)
    }

    /// Connect to a session that already exists. Only the bootstrap is
    /// awaited; the client object was delivered on the first connection.
    pub async fn reconnect(addr: SocketAddr, username: &str) -> anyhow::Result<Self> {
        let mut framed = Self::handshake(addr, username, "", Vec::new()).await?;
        match recv_from(&mut framed).await? {
            DownstreamMessage::Auth(AuthResponse::Accepted) => {}
            other => anyhow::bail!("authentication failed: {other:?}"),
        }
        let bootstrap = loop {
            if let DownstreamMessage::Bootstrap(data) = recv_from(&mut framed).await? {
                break data;
            }
        };
        Ok(Self { framed, bootstrap })
    }

    /// Connect and authenticate, returning the server's verdict without
    /// waiting for a bootstrap.
    pub async fn try_auth(addr: SocketAddr, username: &str, password: &str) -> anyhow::Result<AuthResponse> {
        let mut framed = Self::handshake(addr, username, password, Vec::new()).await?;
        match recv_from(&mut framed).await? {
            DownstreamMessage::Auth(response) => Ok(response),
            other => anyhow::bail!("expected auth response, got {other:?}"),
        }
    }

    async fn handshake(
        addr: SocketAddr,
        username: &str,
        password: &str,
        boot_groups: Vec<String>,
    ) -> anyhow::Result<Framed<TcpStream, ClientCodec>> {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, ClientCodec::new());
        framed
            .send(UpstreamMessage::Authenticate(AuthRequest {
                username: username.to_string(),
                password: password.to_string(),
                boot_groups,
            }))
            .await?;
        Ok(framed)
    }

    pub fn client_oid(&self) -> Oid {
        self.bootstrap.client_oid
    }

    pub async fn send(&mut self, message: UpstreamMessage) -> anyhow::Result<()> {
        self.framed.send(message).await?;
        Ok(())
    }

    /// Receive a single message from the server.
    pub async fn recv(&mut self) -> anyhow::Result<DownstreamMessage> {
        recv_from(&mut self.framed).await
    }

    /// Receive with a custom timeout.
    pub async fn recv_timeout(&mut self, dur: Duration) -> anyhow::Result<DownstreamMessage> {
        match timeout(dur, self.framed.next()).await? {
            Some(message) => Ok(message?),
            None => anyhow::bail!("connection closed"),
        }
    }

    /// Receive messages until one matches, returning it and skipping the rest.
    pub async fn recv_until<T>(
        &mut self,
        mut pick: impl FnMut(DownstreamMessage) -> Option<T>,
    ) -> anyhow::Result<T> {
        loop {
            if let Some(found) = pick(self.recv().await?) {
                return Ok(found);
            }
        }
    }

    /// Whether the server closed the connection within `dur`.
    pub async fn closed_within(&mut self, dur: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Waits for the snapshot of `oid`.
    pub async fn expect_object(&mut self, oid: Oid) -> anyhow::Result<ObjectSnapshot> {
        self.recv_until(|message| match message {
            DownstreamMessage::ObjectResponse { object } if object.oid == oid => Some(object),
            _ => None,
        })
        .await
    }

    /// Subscribes and waits for either the snapshot or a failure message.
    pub async fn subscribe(&mut self, oid: Oid) -> anyhow::Result<Result<ObjectSnapshot, String>> {
        self.send(UpstreamMessage::Subscribe { oid }).await?;
        self.recv_until(|message| match message {
            DownstreamMessage::ObjectResponse { object } if object.oid == oid => Some(Ok(object)),
            DownstreamMessage::FailureResponse { oid: failed, message } if failed == oid => {
                Some(Err(message))
            }
            _ => None,
        })
        .await
    }

    pub async fn forward(&mut self, event: DEvent) -> anyhow::Result<()> {
        self.send(UpstreamMessage::ForwardEvent { event }).await
    }

    /// Next event notification for `oid`.
    pub async fn next_event(&mut self, oid: Oid) -> anyhow::Result<DEvent> {
        self.recv_until(|message| match message {
            DownstreamMessage::EventNotification { event } if event.target == oid => Some(event),
            _ => None,
        })
        .await
    }

    /// Sends an invocation request to the invocation object.
    pub async fn invoke(
        &mut self,
        module: &str,
        method: u32,
        request_id: u32,
        args: Vec<Value>,
    ) -> anyhow::Result<()> {
        let target = self.bootstrap.invocation_oid;
        self.forward(DEvent::invocation_request(
            target,
            module,
            method,
            Some(request_id),
            args,
        ))
        .await
    }

    /// Waits for the response to `request_id`, returning its name and args.
    pub async fn response(&mut self, request_id: u32) -> anyhow::Result<(String, Vec<Value>)> {
        self.recv_until(|message| match message {
            DownstreamMessage::EventNotification { event } => match event.kind {
                EventKind::InvocationResponse {
                    request_id: id,
                    name,
                    args,
                } if id == request_id => Some((name, args)),
                _ => None,
            },
            _ => None,
        })
        .await
    }

    pub async fn logoff(mut self) -> anyhow::Result<()> {
        self.send(UpstreamMessage::Logoff).await
    }

    /// Drops the TCP connection without logging off.
    pub fn disconnect(self) {
        drop(self.framed);
    }
}

async fn recv_from(framed: &mut Framed<TcpStream, ClientCodec>) -> anyhow::Result<DownstreamMessage> {
    match timeout(Duration::from_secs(5), framed.next()).await? {
        Some(message) => Ok(message?),
        None => anyhow::bail!("connection closed"),
    }
}
