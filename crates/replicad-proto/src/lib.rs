//! # replicad-proto
//!
//! The shared object and event model for replicad: distributed objects,
//! the events that mutate them, and the messages exchanged between a
//! server and its clients.
//!
//! ## Features
//!
//! - Schema-described objects ([`ObjectClass`], [`DObject`]) holding
//!   [`Value`] attributes
//! - Keyed sets ([`DSet`]) and duplicate-free oid lists ([`OidList`])
//! - Events ([`DEvent`]) that validate before they mutate
//! - Upstream/downstream wire messages and a length-delimited MessagePack
//!   codec (with the `tokio` feature)
//!
//! ## Quick Start
//!
//! ```rust
//! use replicad_proto::{DEvent, DObject, FieldKind, ObjectClass, Value};
//!
//! let room = ObjectClass::builder("Room")
//!     .field("name", FieldKind::Str)
//!     .field("occupants", FieldKind::Oids)
//!     .build();
//!
//! let mut obj = DObject::new(5, room);
//! let mut event = DEvent::attribute_changed(5, "name", "lobby");
//! assert!(obj.apply(&mut event).unwrap());
//! assert_eq!(obj.get("name"), Some(&Value::from("lobby")));
//! ```

#![deny(clippy::all)]

#[cfg(feature = "tokio")]
pub mod codec;
pub mod dset;
pub mod error;
pub mod event;
pub mod message;
pub mod object;
pub mod oid_list;
pub mod value;

#[cfg(feature = "tokio")]
pub use self::codec::{ClientCodec, MessageCodec, ServerCodec, MAX_FRAME_LENGTH};
pub use self::dset::{DSet, Entry, Key, Keyed};
pub use self::error::{ObjectAccessError, ProtoError};
pub use self::event::{DEvent, EventKind};
pub use self::message::{
    AuthRequest, AuthResponse, BootstrapData, DownstreamMessage, UpstreamMessage,
};
pub use self::object::{DObject, FieldKind, ObjectClass, ObjectSnapshot};
pub use self::oid_list::OidList;
pub use self::value::Value;

/// Identity of a distributed object.
pub type Oid = i32;

/// Source oid stamped on server-originated events.
pub const SERVER_OID: Oid = -1;

/// Oid of the placeholder object every manager keeps registered.
pub const DUMMY_OID: Oid = 0;

/// Failure code sent to clients in place of unexpected server errors.
pub const E_INTERNAL_ERROR: &str = "m.internal_error";
