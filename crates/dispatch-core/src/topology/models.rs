//! Entities of the topology graph.
//!
//! Entities reference each other by id rather than by handle, and all
//! navigation goes through the [`TopologyStore`](super::TopologyStore); this
//! keeps the connection/user/room/grant graph free of reference cycles while
//! preserving its invariants.

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use uuid::Uuid;

use crate::permissions::Permission;
use crate::transport::TransportHandle;

/// One open socket as the topology sees it.
#[derive(Clone)]
pub struct ConnectionEntry {
    pub id: Uuid,
    pub remote_addr: String,
    pub created_at: SystemTime,
    /// Owning user, `None` until the connection is associated.
    pub user_id: Option<String>,
    /// Handle used by actions to push bytes to this socket.
    pub transport: TransportHandle,
}

/// One authenticated identity, aggregating all of its open sockets.
#[derive(Clone)]
pub struct UserEntry {
    pub id: String,
    /// Ids of all active connections for this user.
    pub connections: HashSet<Uuid>,
    /// This user's room permissions, keyed by room id.
    pub grants: HashMap<String, Grant>,
    pub global_permissions: Permission,
}

/// A communication channel; exists only while it has members.
#[derive(Debug, Clone)]
pub struct RoomEntry {
    pub id: String,
    /// Ids of all member users.
    pub members: HashSet<String>,
}

/// The edge between a user and a room, carrying the room-scoped permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub user_id: String,
    pub room_id: String,
    pub permissions: Permission,
}
