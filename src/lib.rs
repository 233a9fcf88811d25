//! replicad - server-authoritative object replication daemon.
//!
//! The server owns every distributed object. Clients subscribe to objects,
//! receive their snapshots and event streams, and ask the server to change
//! them by forwarding events or invoking provider methods. All object state
//! lives on a single object manager loop; blocking work runs on the invoker
//! pool and reports back to that loop.

pub mod config;
pub mod error;
pub mod http;
pub mod invocation;
pub mod invoker;
pub mod metrics;
pub mod network;
pub mod server;
pub mod state;
pub mod telemetry;

pub use crate::config::Config;
pub use crate::invocation::{InvocationManager, Provider, Reply};
pub use crate::invoker::{Invoker, InvokerUnit};
pub use crate::server::Server;
pub use crate::state::{ClientManager, DObjectManager, OmgrHandle, ShutdownManager};
