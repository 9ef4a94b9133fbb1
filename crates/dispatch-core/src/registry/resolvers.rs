//! Built-in context-variable resolvers.

use std::sync::Arc;

use crate::pipeline::ResolverFn;

/// `{$user.id}`: the origin user's id.
pub(super) fn user_id() -> ResolverFn {
    Arc::new(|cargo| Ok(cargo.user.id.clone()))
}

/// `{$conn.id}`: the origin connection's id.
pub(super) fn conn_id() -> ResolverFn {
    Arc::new(|cargo| Ok(cargo.connection.id.to_string()))
}

/// `{$target.id}`: the message's raw target id.
pub(super) fn target_id() -> ResolverFn {
    Arc::new(|cargo| Ok(cargo.target_id.clone()))
}
