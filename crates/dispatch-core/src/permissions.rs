//! Permission bitmaps and the name-to-bit registry.
//!
//! A deployment may define at most 64 named permissions. The `read` and
//! `write` names are reserved built-ins on bits 0 and 1; configured names
//! are allocated the remaining bits in registration order starting at bit 2.

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A set of capabilities encoded as a 64-bit flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(u64);

impl Permission {
    /// The empty permission set.
    pub const NONE: Permission = Permission(0);

    /// Built-in read permission (bit 0).
    pub const READ: Permission = Permission(1 << 0);

    /// Built-in write permission (bit 1).
    pub const WRITE: Permission = Permission(1 << 1);

    /// Constructs a permission set from raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Permission(bits)
    }

    /// Returns the raw bit representation.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns true when every bit in `flags` is set in `self`.
    pub fn has(self, flags: Permission) -> bool {
        self.0 & flags.0 == flags.0
    }

    /// Returns true when no bits are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Permission {
    type Output = Permission;

    fn bitor(self, rhs: Permission) -> Permission {
        Permission(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Permission) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permission {
    type Output = Permission;

    fn bitand(self, rhs: Permission) -> Permission {
        Permission(self.0 & rhs.0)
    }
}

impl Not for Permission {
    type Output = Permission;

    fn not(self) -> Permission {
        Permission(!self.0)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Errors surfaced by the permission registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PermissionError {
    /// A configured name collides with a reserved built-in.
    #[error("'{0}' is reserved for a built-in permission")]
    Reserved(String),

    /// The same name was registered twice.
    #[error("permission '{0}' is already registered")]
    Duplicate(String),

    /// All 64 bits are allocated.
    #[error("cannot register permission '{0}': maximum of 64 permissions reached")]
    Exhausted(String),

    /// A name was compiled that is not in the registry.
    #[error("permission '{0}' is not registered")]
    Unknown(String),
}

struct RegistryInner {
    names: HashMap<String, Permission>,
    next_bit: u32,
}

/// Name-to-bit registry for permissions.
///
/// Seeded with the reserved built-ins; additional names are allocated bits
/// deterministically in registration order. Registration after startup is
/// permitted, but bit indices past 63 fail.
pub struct PermissionRegistry {
    inner: RwLock<RegistryInner>,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        let mut names = HashMap::new();
        names.insert("read".to_string(), Permission::READ);
        names.insert("write".to_string(), Permission::WRITE);
        Self {
            inner: RwLock::new(RegistryInner { names, next_bit: 2 }),
        }
    }

    /// Allocates the next free bit for `name`.
    pub fn register(&self, name: &str) -> Result<Permission, PermissionError> {
        let mut inner = self.inner.write();
        if name == "read" || name == "write" {
            return Err(PermissionError::Reserved(name.to_string()));
        }
        if inner.names.contains_key(name) {
            return Err(PermissionError::Duplicate(name.to_string()));
        }
        if inner.next_bit >= 64 {
            return Err(PermissionError::Exhausted(name.to_string()));
        }
        let value = Permission(1 << inner.next_bit);
        inner.next_bit += 1;
        inner.names.insert(name.to_string(), value);
        Ok(value)
    }

    /// Looks up a single registered name.
    pub fn get(&self, name: &str) -> Option<Permission> {
        self.inner.read().names.get(name).copied()
    }

    /// Translates a list of names into a combined bitmap.
    ///
    /// Fails on the first unregistered name.
    pub fn compile(&self, names: &[String]) -> Result<Permission, PermissionError> {
        let inner = self.inner.read();
        let mut bitmap = Permission::NONE;
        for name in names {
            let value = inner
                .names
                .get(name)
                .copied()
                .ok_or_else(|| PermissionError::Unknown(name.clone()))?;
            bitmap |= value;
        }
        Ok(bitmap)
    }

    /// Number of registered names, built-ins included.
    pub fn count(&self) -> usize {
        self.inner.read().names.len()
    }
}

impl Default for PermissionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
