//! Server state: the object manager, sessions and their managers.
//!
//! Everything that touches a `DObject` runs on the object manager loop
//! (`omgr`); the rest of this module hands work to it through
//! [`OmgrHandle`].

pub mod access;
pub mod client_object;
pub mod compound;
pub mod connection;
pub mod graph;
pub mod listener;
pub mod managers;
pub mod observer;
pub mod omgr;
pub mod resolver;
pub mod session;
pub mod subscriber;
mod uid;

pub use access::{AccessController, OccupantsOnly, PrivateOwner, PublicRead, ServerOnly};
pub use compound::CompoundEvent;
pub use connection::{ChannelConnection, Connection};
pub use listener::Listener;
pub use managers::client::ClientManager;
pub use managers::lifecycle::{Constraint, ShutdownManager, Shutdowner};
pub use managers::reboot::{Broadcaster, PendingShutdownObserver, RebootManager};
pub use observer::ClientObserver;
pub use omgr::{DObjectManager, Interval, ObjectView, OmgrHandle, Stats};
pub use resolver::{ClientResolutionListener, ClientResolver, DefaultResolver};
pub use session::{Session, SessionDeps};
pub use subscriber::{ChannelSubscriber, Notification, Subscriber};
pub use uid::{ConnectionId, ConnectionIdGenerator};
