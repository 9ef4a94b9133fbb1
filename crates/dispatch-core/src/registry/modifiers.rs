//! Built-in pipeline modifiers.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::auth;
use crate::pipeline::{Cargo, ModifierFn, PipelineError};

/// `secure`: requires a valid HMAC-signed token in the payload's `token`
/// field and stashes its claims on the Cargo for later steps. Takes no
/// parameters.
pub(super) fn secure(jwt_secret: String) -> ModifierFn {
    Arc::new(move |cargo: &Cargo, params: &[String]| {
        if !params.is_empty() {
            return Err(PipelineError::Arity {
                step: "secure",
                expected: 0,
                got: params.len(),
            });
        }

        let payload: serde_json::Value = serde_json::from_str(cargo.payload_str())?;
        let token = payload
            .get("token")
            .and_then(|value| value.as_str())
            .filter(|token| !token.is_empty())
            .ok_or(PipelineError::MissingToken)?;

        let claims = auth::verify(token, jwt_secret.as_bytes())?;
        debug!(user_id = %cargo.user.id, sub = %claims.sub, "secure modifier check passed");
        *cargo.token_claims.lock() = Some(claims);
        Ok(())
    })
}

/// `rate_limit(spec)`: fixed-window counter per (user, event).
///
/// `spec` is `N/unit` with unit `s`, `m`, or `h`. The first invocation in a
/// window creates a counter with value 1 whose state auto-expires after one
/// unit; invocations past `N` halt the pipeline until the window resets.
pub(super) fn rate_limit() -> ModifierFn {
    Arc::new(|cargo: &Cargo, params: &[String]| {
        if params.len() != 1 {
            return Err(PipelineError::Arity {
                step: "rate_limit",
                expected: 1,
                got: params.len(),
            });
        }
        let (limit, window) = parse_rate_spec(&params[0])?;

        let user_id = &cargo.user.id;
        let event = &cargo.event_name;
        match cargo
            .topology
            .get_modifier_state("rate_limit", user_id, event)
        {
            None => {
                cargo.topology.set_modifier_state(
                    "rate_limit",
                    user_id,
                    event,
                    serde_json::json!(1),
                    Some(window),
                );
                Ok(())
            }
            Some(state) => {
                let mut count = state.lock();
                let current = count.as_u64().unwrap_or(0);
                if current < limit {
                    *count = serde_json::json!(current + 1);
                    Ok(())
                } else {
                    Err(PipelineError::RateLimited(event.clone()))
                }
            }
        }
    })
}

fn parse_rate_spec(spec: &str) -> Result<(u64, Duration), PipelineError> {
    let (count, unit) = spec
        .split_once('/')
        .ok_or_else(|| PipelineError::RateSpec(spec.to_string()))?;
    let limit: u64 = count
        .parse()
        .map_err(|_| PipelineError::RateSpec(spec.to_string()))?;
    let window = match unit.to_ascii_lowercase().as_str() {
        "s" => Duration::from_secs(1),
        "m" => Duration::from_secs(60),
        "h" => Duration::from_secs(60 * 60),
        _ => return Err(PipelineError::RateSpec(spec.to_string())),
    };
    Ok((limit, window))
}
