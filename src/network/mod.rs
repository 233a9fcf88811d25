//! Network module.
//!
//! Contains the Gateway (TCP listener), the per-connection handler and the
//! authenticators used during the handshake.

pub mod auth;
mod connection;
mod gateway;

pub use auth::{AuthVerdict, Authenticator, OpenAuthenticator, StaticAuthenticator};
pub use connection::ClientConnection;
pub use gateway::Gateway;
