//! The central registry of executable pipeline components.
//!
//! Three name-keyed tables — actions, modifiers, and context-variable
//! resolvers — populated once at startup and read by the compiler. After
//! compilation, pipelines hold the function handles directly, so the hot
//! path never touches these tables.

mod actions;
mod modifiers;
mod resolvers;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

use crate::pipeline::{ActionFn, ModifierFn, ResolverFn};

/// Duplicate registration is a configuration fault and fails startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("action '{0}' is already registered")]
    DuplicateAction(String),

    #[error("modifier '{0}' is already registered")]
    DuplicateModifier(String),

    #[error("context variable '{0}' is already registered")]
    DuplicateResolver(String),
}

/// Options for registering the built-in component set.
pub struct CoreOptions {
    /// Secret used by the `secure` modifier to verify payload tokens.
    pub jwt_secret: String,
}

/// Name-to-function tables for actions, modifiers, and resolvers.
pub struct Registry {
    actions: RwLock<HashMap<String, ActionFn>>,
    modifiers: RwLock<HashMap<String, ModifierFn>>,
    resolvers: RwLock<HashMap<String, ResolverFn>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
            modifiers: RwLock::new(HashMap::new()),
            resolvers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the built-in actions, modifiers, and resolvers.
    pub fn register_core(&self, options: CoreOptions) -> Result<(), RegistryError> {
        self.register_resolver("user.id", resolvers::user_id())?;
        self.register_resolver("conn.id", resolvers::conn_id())?;
        self.register_resolver("target.id", resolvers::target_id())?;
        info!(count = self.resolvers.read().len(), "registered core context variables");

        self.register_action("_log", Arc::new(actions::log))?;
        self.register_action("_join", Arc::new(actions::join_room))?;
        self.register_action("_leave", Arc::new(actions::leave_room))?;
        self.register_action("_notify_origin", Arc::new(actions::notify_origin))?;
        self.register_action("_notify_room", Arc::new(actions::notify_room))?;
        info!(count = self.actions.read().len(), "registered core actions");

        self.register_modifier("secure", modifiers::secure(options.jwt_secret))?;
        self.register_modifier("rate_limit", modifiers::rate_limit())?;
        info!(count = self.modifiers.read().len(), "registered core modifiers");

        Ok(())
    }

    pub fn register_action(&self, name: &str, function: ActionFn) -> Result<(), RegistryError> {
        let mut actions = self.actions.write();
        if actions.contains_key(name) {
            return Err(RegistryError::DuplicateAction(name.to_string()));
        }
        actions.insert(name.to_string(), function);
        Ok(())
    }

    pub fn register_modifier(&self, name: &str, function: ModifierFn) -> Result<(), RegistryError> {
        let mut modifiers = self.modifiers.write();
        if modifiers.contains_key(name) {
            return Err(RegistryError::DuplicateModifier(name.to_string()));
        }
        modifiers.insert(name.to_string(), function);
        Ok(())
    }

    pub fn register_resolver(&self, name: &str, function: ResolverFn) -> Result<(), RegistryError> {
        let mut resolvers = self.resolvers.write();
        if resolvers.contains_key(name) {
            return Err(RegistryError::DuplicateResolver(name.to_string()));
        }
        resolvers.insert(name.to_string(), function);
        Ok(())
    }

    pub fn action(&self, name: &str) -> Option<ActionFn> {
        self.actions.read().get(name).cloned()
    }

    pub fn modifier(&self, name: &str) -> Option<ModifierFn> {
        self.modifiers.read().get(name).cloned()
    }

    pub fn resolver(&self, name: &str) -> Option<ResolverFn> {
        self.resolvers.read().get(name).cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
