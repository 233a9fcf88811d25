//! Integration test common infrastructure.
//!
//! Provides an in-process server bound to an ephemeral port and a test
//! client speaking the framed wire protocol.

pub mod client;
pub mod server;

#[allow(unused_imports)]
pub use client::TestClient;
#[allow(unused_imports)]
pub use server::TestServer;
