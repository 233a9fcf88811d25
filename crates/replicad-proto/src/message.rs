//! Messages exchanged between a client connection and the server.

use crate::event::DEvent;
use crate::object::ObjectSnapshot;
use crate::Oid;
use serde::{Deserialize, Serialize};

/// Credentials presented as the first message on a new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Service groups whose invocation modules the client wants listed
    /// in its bootstrap.
    #[serde(default)]
    pub boot_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuthResponse {
    Accepted,
    Rejected { reason: String },
}

/// Sent once a session is ready, and again after every resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapData {
    pub connection_id: u64,
    pub client_oid: Oid,
    pub invocation_oid: Oid,
    pub services: Vec<String>,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpstreamMessage {
    Authenticate(AuthRequest),
    Subscribe { oid: Oid },
    Unsubscribe { oid: Oid },
    ForwardEvent { event: DEvent },
    Ping { client_stamp: i64 },
    Logoff,
}

impl UpstreamMessage {
    /// Static label for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "authenticate",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::ForwardEvent { .. } => "forward_event",
            Self::Ping { .. } => "ping",
            Self::Logoff => "logoff",
        }
    }
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownstreamMessage {
    Auth(AuthResponse),
    Bootstrap(BootstrapData),
    ObjectResponse { object: ObjectSnapshot },
    FailureResponse { oid: Oid, message: String },
    UnsubscribeResponse { oid: Oid },
    EventNotification { event: DEvent },
    Pong { client_stamp: i64, server_stamp: i64 },
}

impl DownstreamMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Bootstrap(_) => "bootstrap",
            Self::ObjectResponse { .. } => "object_response",
            Self::FailureResponse { .. } => "failure_response",
            Self::UnsubscribeResponse { .. } => "unsubscribe_response",
            Self::EventNotification { .. } => "event_notification",
            Self::Pong { .. } => "pong",
        }
    }
}
