//! The in-memory topology: connections, users, rooms, grants, and the
//! modifier-state table, with the locking discipline that keeps them
//! consistent under parallel socket traffic.

pub mod models;
pub mod store;

pub use models::{ConnectionEntry, Grant, RoomEntry, UserEntry};
pub use store::{ModifierValue, TopologyError, TopologyStore};
