//! Domain managers for server state.
//!
//! Each manager owns one concern: sessions and client objects
//! (`client`), ordered shutdown (`lifecycle`) and planned reboots
//! (`reboot`).

pub mod client;
pub mod lifecycle;
pub mod reboot;
