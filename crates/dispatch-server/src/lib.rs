//! # dispatch-server
//!
//! The server shell around [`dispatch_core`]: configuration loading, logging
//! setup, the event router, the WebSocket accept path with upgrade-time
//! admission, and graceful shutdown sequencing.
//!
//! ## Message flow
//!
//! 1. A client upgrades over HTTP with an HMAC-signed token; admission
//!    verifies it, compiles its permission names, and enforces the per-user
//!    connection limit.
//! 2. The accepted socket is registered in the topology and associated with
//!    its user.
//! 3. Each inbound frame `{target, event, payload}` is dispatched by the
//!    [`router::EventRouter`] through the event's compiled modifier and
//!    action chains.
//! 4. Actions fan notifications out to the sockets of the targeted users.

pub mod config;
pub mod error;
pub mod logging;
pub mod router;
pub mod server;
pub mod shutdown;

pub use config::{Args, Settings};
pub use error::ServerError;
pub use router::EventRouter;
pub use server::{App, ShutdownHandle};
