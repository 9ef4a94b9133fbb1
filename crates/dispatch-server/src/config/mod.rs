//! Configuration loading: file, environment overrides, CLI flags.

pub mod args;
pub mod settings;

pub use args::Args;
pub use settings::{
    normalize_address, parse_duration, ConnectionLimitSettings, LimitMode, Settings,
};

use tracing::{info, warn};

use crate::error::ServerError;

/// Loads configuration with the precedence file < environment < flags.
///
/// A missing file is not an error; defaults apply. A present-but-invalid
/// file is fatal.
pub async fn load(args: &Args) -> Result<Settings, ServerError> {
    let mut settings = if args.config.exists() {
        let raw = tokio::fs::read_to_string(&args.config)
            .await
            .map_err(|err| {
                ServerError::Config(format!("failed to read {}: {err}", args.config.display()))
            })?;
        let settings: Settings = toml::from_str(&raw).map_err(|err| {
            ServerError::Config(format!("failed to parse {}: {err}", args.config.display()))
        })?;
        info!(path = %args.config.display(), "configuration loaded");
        settings
    } else {
        warn!(path = %args.config.display(), "config file not found, relying on defaults and env vars");
        Settings::default()
    };

    apply_env_overrides(&mut settings);

    if let Some(listen) = &args.listen {
        settings.server.address = listen.clone();
    }

    // Surface malformed durations at startup rather than at first accept.
    settings
        .transport
        .read_timeout()
        .map_err(ServerError::Config)?;

    Ok(settings)
}

/// Applies `GODISPATCH_`-prefixed environment variables over file values.
/// Dots in configuration key paths map to underscores.
fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(address) = std::env::var("GODISPATCH_SERVER_ADDRESS") {
        settings.server.address = address;
    }
    if let Ok(secret) = std::env::var("GODISPATCH_SERVER_AUTH_JWTSECRET") {
        settings.server.auth.jwt_secret = secret;
    }
    if let Ok(timeout) = std::env::var("GODISPATCH_TRANSPORT_READTIMEOUT") {
        settings.transport.read_timeout = timeout;
    }
    if let Ok(max) = std::env::var("GODISPATCH_SERVER_CONNECTIONLIMIT_MAXPERUSER") {
        match max.parse() {
            Ok(max) => settings.server.connection_limit.max_per_user = max,
            Err(_) => warn!(value = %max, "ignoring invalid GODISPATCH_SERVER_CONNECTIONLIMIT_MAXPERUSER"),
        }
    }
    if let Ok(mode) = std::env::var("GODISPATCH_SERVER_CONNECTIONLIMIT_MODE") {
        match mode.as_str() {
            "reject" => settings.server.connection_limit.mode = LimitMode::Reject,
            "cycle" => settings.server.connection_limit.mode = LimitMode::Cycle,
            _ => warn!(value = %mode, "ignoring invalid GODISPATCH_SERVER_CONNECTIONLIMIT_MODE"),
        }
    }
}
