//! Logging system setup.
//!
//! Structured logging via the tracing crate. The `--debug` flag raises the
//! default level; `RUST_LOG` overrides everything.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Args;

/// Initialize the global tracing subscriber.
pub fn setup_logging(args: &Args) -> Result<()> {
    let level = if args.debug { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    Ok(())
}
