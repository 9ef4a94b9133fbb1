//! The in-memory topology store.
//!
//! Single authority over connections, users, rooms, and grants, plus the
//! modifier-state table used by stateful pipeline modifiers. All operations
//! are synchronous and never block on I/O.
//!
//! Concurrency discipline: three reader-writer locks guard connections,
//! users, and rooms. Operations touching more than one domain acquire locks
//! in the fixed order connections -> users -> rooms. Read paths that would
//! need an earlier lock while holding a later one instead snapshot the ids
//! they need and re-acquire, so locks are never nested against the order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::permissions::Permission;
use crate::transport::TransportHandle;

use super::models::{ConnectionEntry, Grant, RoomEntry, UserEntry};

/// Errors surfaced by topology operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("connection {0} is already registered")]
    ConnectionExists(Uuid),

    #[error("unknown connection {0}")]
    UnknownConnection(Uuid),

    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("unknown room '{0}'")]
    UnknownRoom(String),

    #[error("user '{0}' is not a member of room '{1}'")]
    NotAMember(String, String),
}

/// State kept by a stateful modifier for one (modifier, user, event) triple.
///
/// The value is shared so the owning modifier can mutate it in place without
/// disturbing the entry's expiry timer.
pub type ModifierValue = Arc<Mutex<serde_json::Value>>;

struct ModifierEntry {
    value: ModifierValue,
    expiry: Option<JoinHandle<()>>,
}

type ModifierKey = (String, String, String);

/// The canonical in-memory graph of connections, users, rooms, and grants.
pub struct TopologyStore {
    conns: RwLock<HashMap<Uuid, ConnectionEntry>>,
    users: RwLock<HashMap<String, UserEntry>>,
    rooms: RwLock<HashMap<String, RoomEntry>>,
    modifier_state: Mutex<HashMap<ModifierKey, ModifierEntry>>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            modifier_state: Mutex::new(HashMap::new()),
        }
    }

    // --- Connection lifecycle ---

    /// Creates a connection entry for `transport`. Fails if the transport's
    /// id is already present.
    pub fn register_connection(
        &self,
        transport: TransportHandle,
        remote_addr: &str,
    ) -> Result<ConnectionEntry, TopologyError> {
        let mut conns = self.conns.write();
        let id = transport.id();
        if conns.contains_key(&id) {
            return Err(TopologyError::ConnectionExists(id));
        }
        let entry = ConnectionEntry {
            id,
            remote_addr: remote_addr.to_string(),
            created_at: SystemTime::now(),
            user_id: None,
            transport,
        };
        conns.insert(id, entry.clone());
        debug!(conn_id = %id, "connection registered");
        Ok(entry)
    }

    /// Removes a connection and unlinks it from its user, if associated.
    /// Idempotent: unknown ids succeed.
    pub fn deregister_connection(&self, conn_id: Uuid) {
        let mut conns = self.conns.write();
        let Some(conn) = conns.remove(&conn_id) else {
            return;
        };
        if let Some(user_id) = conn.user_id {
            let mut users = self.users.write();
            if let Some(user) = users.get_mut(&user_id) {
                user.connections.remove(&conn_id);
                debug!(conn_id = %conn_id, user_id = %user_id, "detached connection from user");
            }
        }
        debug!(conn_id = %conn_id, "connection deregistered");
    }

    pub fn get_connection(&self, conn_id: Uuid) -> Option<ConnectionEntry> {
        self.conns.read().get(&conn_id).cloned()
    }

    /// Returns the user's connection with the earliest creation timestamp.
    /// Ties break on the lower connection id, keeping the choice
    /// deterministic within a run.
    pub fn find_oldest_user_connection(&self, user_id: &str) -> Option<ConnectionEntry> {
        let conn_ids: Vec<Uuid> = {
            let users = self.users.read();
            let user = users.get(user_id)?;
            user.connections.iter().copied().collect()
        };

        let conns = self.conns.read();
        conn_ids
            .into_iter()
            .filter_map(|id| conns.get(&id))
            .min_by_key(|conn| (conn.created_at, conn.id))
            .cloned()
    }

    // --- User management ---

    /// Finds or creates the user, overwrites its global permissions, and
    /// links the connection both ways. Fails on unknown connection ids.
    pub fn associate_user(
        &self,
        conn_id: Uuid,
        user_id: &str,
        global_permissions: Permission,
    ) -> Result<UserEntry, TopologyError> {
        let mut conns = self.conns.write();
        let mut users = self.users.write();

        let conn = conns
            .get_mut(&conn_id)
            .ok_or(TopologyError::UnknownConnection(conn_id))?;

        let user = users.entry(user_id.to_string()).or_insert_with(|| {
            debug!(user_id = %user_id, "created new user");
            UserEntry {
                id: user_id.to_string(),
                connections: Default::default(),
                grants: Default::default(),
                global_permissions: Permission::NONE,
            }
        });

        user.global_permissions = global_permissions;
        user.connections.insert(conn_id);
        conn.user_id = Some(user_id.to_string());

        debug!(conn_id = %conn_id, user_id = %user_id, "associated connection with user");
        Ok(user.clone())
    }

    pub fn find_user(&self, user_id: &str) -> Option<UserEntry> {
        self.users.read().get(user_id).cloned()
    }

    /// All live transports of a user's connections.
    pub fn get_user_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<TransportHandle>, TopologyError> {
        let conn_ids: Vec<Uuid> = {
            let users = self.users.read();
            let user = users
                .get(user_id)
                .ok_or_else(|| TopologyError::UnknownUser(user_id.to_string()))?;
            user.connections.iter().copied().collect()
        };

        let conns = self.conns.read();
        Ok(conn_ids
            .into_iter()
            .filter_map(|id| conns.get(&id))
            .map(|conn| conn.transport.clone())
            .collect())
    }

    /// Number of open connections for a user; unknown users have zero.
    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.users
            .read()
            .get(user_id)
            .map(|user| user.connections.len())
            .unwrap_or(0)
    }

    pub fn all_users(&self) -> Vec<UserEntry> {
        self.users.read().values().cloned().collect()
    }

    // --- Room and membership management ---

    /// Adds a user to a room, creating the room on first join. Idempotent:
    /// an existing grant is returned unchanged. Fails on unknown users.
    pub fn join(&self, user_id: &str, room_id: &str) -> Result<Grant, TopologyError> {
        let mut users = self.users.write();
        let mut rooms = self.rooms.write();

        let user = users
            .get_mut(user_id)
            .ok_or_else(|| TopologyError::UnknownUser(user_id.to_string()))?;

        if let Some(grant) = user.grants.get(room_id) {
            return Ok(grant.clone());
        }

        let room = rooms.entry(room_id.to_string()).or_insert_with(|| RoomEntry {
            id: room_id.to_string(),
            members: Default::default(),
        });

        // New joins start with no permissions; they must be granted explicitly.
        let grant = Grant {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            permissions: Permission::NONE,
        };
        user.grants.insert(room_id.to_string(), grant.clone());
        room.members.insert(user_id.to_string());

        debug!(user_id = %user_id, room_id = %room_id, "user joined room");
        Ok(grant)
    }

    /// Removes the grant and membership. Unknown users or rooms are no-op
    /// successes; a room emptied by the leave is dropped from the index.
    pub fn leave(&self, user_id: &str, room_id: &str) {
        let mut users = self.users.write();
        let mut rooms = self.rooms.write();

        if let Some(user) = users.get_mut(user_id) {
            user.grants.remove(room_id);
        }
        if let Some(room) = rooms.get_mut(room_id) {
            room.members.remove(user_id);
            if room.members.is_empty() {
                rooms.remove(room_id);
                debug!(room_id = %room_id, "removed empty room");
            }
        }
        debug!(user_id = %user_id, room_id = %room_id, "user left room");
    }

    /// Snapshot of a room's members.
    pub fn room_members(&self, room_id: &str) -> Result<Vec<UserEntry>, TopologyError> {
        let member_ids: Vec<String> = {
            let rooms = self.rooms.read();
            let room = rooms
                .get(room_id)
                .ok_or_else(|| TopologyError::UnknownRoom(room_id.to_string()))?;
            room.members.iter().cloned().collect()
        };

        let users = self.users.read();
        Ok(member_ids
            .into_iter()
            .filter_map(|id| users.get(&id))
            .cloned()
            .collect())
    }

    pub fn find_room(&self, room_id: &str) -> Option<RoomEntry> {
        self.rooms.read().get(room_id).cloned()
    }

    // --- Permission management ---

    pub fn get_grant(&self, user_id: &str, room_id: &str) -> Option<Grant> {
        self.users
            .read()
            .get(user_id)
            .and_then(|user| user.grants.get(room_id))
            .cloned()
    }

    /// Replaces a grant's bitmap. Fails when the user is not a member.
    pub fn set_permissions(
        &self,
        user_id: &str,
        room_id: &str,
        permissions: Permission,
    ) -> Result<(), TopologyError> {
        let mut users = self.users.write();
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| TopologyError::UnknownUser(user_id.to_string()))?;
        let grant = user
            .grants
            .get_mut(room_id)
            .ok_or_else(|| TopologyError::NotAMember(user_id.to_string(), room_id.to_string()))?;
        grant.permissions = permissions;
        Ok(())
    }

    /// Applies `(perms | add) & !remove` to a grant's bitmap.
    pub fn update_permissions(
        &self,
        user_id: &str,
        room_id: &str,
        add: Permission,
        remove: Permission,
    ) -> Result<(), TopologyError> {
        let mut users = self.users.write();
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| TopologyError::UnknownUser(user_id.to_string()))?;
        let grant = user
            .grants
            .get_mut(room_id)
            .ok_or_else(|| TopologyError::NotAMember(user_id.to_string(), room_id.to_string()))?;
        grant.permissions = (grant.permissions | add) & !remove;
        Ok(())
    }

    // --- Modifier state ---

    pub fn get_modifier_state(
        &self,
        modifier: &str,
        user_id: &str,
        event: &str,
    ) -> Option<ModifierValue> {
        self.modifier_state
            .lock()
            .get(&key(modifier, user_id, event))
            .map(|entry| entry.value.clone())
    }

    /// Stores `value` under the (modifier, user, event) triple, replacing any
    /// existing entry and cancelling its timer first. When `ttl` is given,
    /// the store schedules the entry's auto-removal after that duration.
    pub fn set_modifier_state(
        self: &Arc<Self>,
        modifier: &str,
        user_id: &str,
        event: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> ModifierValue {
        let value = Arc::new(Mutex::new(value));
        let expiry = ttl.map(|ttl| {
            let store = Arc::downgrade(self);
            let entry_key = key(modifier, user_id, event);
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(store) = store.upgrade() {
                    debug!(
                        modifier = %entry_key.0,
                        user_id = %entry_key.1,
                        event = %entry_key.2,
                        "auto-removing expired modifier state"
                    );
                    store.remove_modifier_entry(&entry_key);
                }
            })
        });

        let mut table = self.modifier_state.lock();
        if let Some(previous) = table.insert(
            key(modifier, user_id, event),
            ModifierEntry {
                value: value.clone(),
                expiry,
            },
        ) {
            if let Some(timer) = previous.expiry {
                timer.abort();
            }
        }
        value
    }

    /// Removes the entry and cancels its timer, if any.
    pub fn delete_modifier_state(&self, modifier: &str, user_id: &str, event: &str) {
        self.remove_modifier_entry(&key(modifier, user_id, event));
    }

    fn remove_modifier_entry(&self, entry_key: &ModifierKey) {
        let removed = self.modifier_state.lock().remove(entry_key);
        if let Some(entry) = removed {
            if let Some(timer) = entry.expiry {
                timer.abort();
            }
        }
    }
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(modifier: &str, user_id: &str, event: &str) -> ModifierKey {
    (
        modifier.to_string(),
        user_id.to_string(),
        event.to_string(),
    )
}
