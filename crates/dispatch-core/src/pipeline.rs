//! Pipeline building blocks shared by the registry, the compiler, and the
//! event router: the per-message [`Cargo`] context, step function types, and
//! the immutable [`CompiledPipeline`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::value::RawValue;
use thiserror::Error;

use crate::auth::{AuthError, TokenClaims};
use crate::topology::{ConnectionEntry, RoomEntry, TopologyError, TopologyStore, UserEntry};

/// The object a message is addressed to, resolved when the Cargo is built.
///
/// A missing target is not an error by itself; actions that do not need it
/// (such as notifying the origin) still run.
pub enum Target {
    User(UserEntry),
    Room(RoomEntry),
    None,
}

/// Per-message context threaded through every step of a pipeline.
pub struct Cargo {
    pub event_name: String,
    /// Origin user snapshot.
    pub user: UserEntry,
    /// Origin connection snapshot, including its transport handle.
    pub connection: ConnectionEntry,
    pub topology: Arc<TopologyStore>,
    /// Raw payload bytes exactly as the client sent them.
    pub payload: Box<RawValue>,
    /// The frame's target id, unparsed (`room-id` or `user:<user-id>`).
    pub target_id: String,
    pub target: Target,
    /// Claims stashed by the `secure` modifier for later steps.
    pub token_claims: Mutex<Option<TokenClaims>>,
}

impl Cargo {
    /// The raw payload as a UTF-8 string.
    pub fn payload_str(&self) -> &str {
        self.payload.get()
    }
}

/// Errors raised by pipeline steps and parameter resolution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A step received the wrong number of parameters.
    #[error("'{step}' requires {expected} parameter(s), got {got}")]
    Arity {
        step: &'static str,
        expected: usize,
        got: usize,
    },

    /// A `{.payload.<path>}` template named a path the payload lacks.
    #[error("path '{0}' not found in payload")]
    PayloadPath(String),

    /// A `{$var}` resolver is not registered.
    #[error("unrecognized context variable '{0}'")]
    UnknownVariable(String),

    /// The payload is not valid JSON where a step required it to be.
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The `secure` modifier found no usable token.
    #[error("request payload missing required 'token' field")]
    MissingToken,

    /// Token verification failed.
    #[error("token validation failed: {0}")]
    Token(#[from] AuthError),

    /// A `rate_limit` spec string could not be parsed.
    #[error("invalid rate limit spec '{0}'")]
    RateSpec(String),

    /// The rate limit for this (user, event) window is exhausted.
    #[error("rate limit for event '{0}' exceeded")]
    RateLimited(String),

    /// A topology operation failed inside a step.
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// A validating step; an error halts the pipeline before any action runs.
pub type ModifierFn = Arc<dyn Fn(&Cargo, &[String]) -> Result<(), PipelineError> + Send + Sync>;

/// An effect step; an error halts the remaining actions but earlier side
/// effects stand.
pub type ActionFn = Arc<dyn Fn(&Cargo, &[String]) -> Result<(), PipelineError> + Send + Sync>;

/// Resolves one `{$name}` context variable against the Cargo.
pub type ResolverFn = Arc<dyn Fn(&Cargo) -> Result<String, PipelineError> + Send + Sync>;

/// One compiled modifier step: resolved function plus raw parameter templates.
#[derive(Clone)]
pub struct ModifierStep {
    pub name: String,
    pub function: ModifierFn,
    pub params: Vec<String>,
}

/// One compiled action step.
#[derive(Clone)]
pub struct ActionStep {
    pub name: String,
    pub function: ActionFn,
    pub params: Vec<String>,
}

/// The ordered modifier and action chains bound to one event name.
/// Immutable after compilation.
pub struct CompiledPipeline {
    pub modifiers: Vec<ModifierStep>,
    pub actions: Vec<ActionStep>,
}
