//! # dispatch-core
//!
//! Engine library for the dispatch server. The server shell crate wires
//! these pieces together; everything here is transport- and
//! configuration-format agnostic:
//!
//! * **Transport** — one WebSocket connection: reader/writer pumps, bounded
//!   send buffer, single-fire close latch.
//! * **Topology** — the authoritative in-memory graph of connections, users,
//!   rooms, and grants, plus the modifier-state table.
//! * **Permissions** — 64-bit capability bitmaps and the name registry.
//! * **Pipeline** — the per-message Cargo context and compiled step chains.
//! * **Registry** — name-to-function tables for actions, modifiers, and
//!   context-variable resolvers, with the built-in core set.
//! * **Compiler** — turns declarative event configuration into immutable
//!   pipelines.
//! * **Auth** — HMAC-SHA256 token verification shared by the upgrade path
//!   and the `secure` modifier.

pub mod auth;
pub mod compiler;
pub mod permissions;
pub mod pipeline;
pub mod registry;
pub mod topology;
pub mod transport;

pub use auth::{AuthError, TokenClaims};
pub use compiler::{compile, CompileError, EventConfig, StepConfig};
pub use permissions::{Permission, PermissionError, PermissionRegistry};
pub use pipeline::{Cargo, CompiledPipeline, PipelineError, Target};
pub use registry::{CoreOptions, Registry, RegistryError};
pub use topology::{TopologyError, TopologyStore};
pub use transport::{
    CloseReason, Connection, TransportConfig, TransportHandle, WaitGroup, WaitPermit,
};
