//! Built-in pipeline actions.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::value::RawValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipeline::{Cargo, PipelineError};
use crate::topology::TopologyError;
use crate::transport::TransportHandle;

/// The frame pushed to client sockets by the notify actions.
#[derive(Serialize)]
struct Notification<'a> {
    event: &'a str,
    payload: &'a RawValue,
}

fn expect_params(step: &'static str, expected: usize, params: &[String]) -> Result<(), PipelineError> {
    if params.len() != expected {
        return Err(PipelineError::Arity {
            step,
            expected,
            got: params.len(),
        });
    }
    Ok(())
}

/// `_log(message)`: emits a structured log line bound to the origin user.
pub(super) fn log(cargo: &Cargo, params: &[String]) -> Result<(), PipelineError> {
    expect_params("_log", 1, params)?;
    info!(user_id = %cargo.user.id, event = %cargo.event_name, "{}", params[0]);
    Ok(())
}

/// `_join(userId, roomId)`: adds the user to the room.
pub(super) fn join_room(cargo: &Cargo, params: &[String]) -> Result<(), PipelineError> {
    expect_params("_join", 2, params)?;
    let (user_id, room_id) = (&params[0], &params[1]);
    cargo.topology.join(user_id, room_id)?;
    info!(user_id = %user_id, room_id = %room_id, "user joined room");
    Ok(())
}

/// `_leave(userId, roomId)`: removes the user from the room.
pub(super) fn leave_room(cargo: &Cargo, params: &[String]) -> Result<(), PipelineError> {
    expect_params("_leave", 2, params)?;
    let (user_id, room_id) = (&params[0], &params[1]);
    cargo.topology.leave(user_id, room_id);
    info!(user_id = %user_id, room_id = %room_id, "user left room");
    Ok(())
}

/// `_notify_origin(eventName, payload)`: fans out to every socket of the
/// origin user.
pub(super) fn notify_origin(cargo: &Cargo, params: &[String]) -> Result<(), PipelineError> {
    expect_params("_notify_origin", 2, params)?;
    let target = format!("user:{}", cargo.user.id);
    notify(cargo, &target, &params[0], &params[1])
}

/// `_notify_room(eventName, payload)`: fans out to the message's target —
/// a room's members, or a single user when the target id carries the
/// `user:` prefix.
pub(super) fn notify_room(cargo: &Cargo, params: &[String]) -> Result<(), PipelineError> {
    expect_params("_notify_room", 2, params)?;
    notify(cargo, &cargo.target_id, &params[0], &params[1])
}

/// Serialises the notification once and pushes the bytes to every resolved
/// target socket.
fn notify(
    cargo: &Cargo,
    target_id: &str,
    event_name: &str,
    payload: &str,
) -> Result<(), PipelineError> {
    let payload = RawValue::from_string(payload.to_string())?;
    let bytes = serde_json::to_vec(&Notification {
        event: event_name,
        payload: &payload,
    })?;

    let targets = match connections_for_target(cargo, target_id) {
        Ok(targets) => targets,
        Err(err) => {
            // Usually just a target nobody currently occupies.
            debug!(target_id = %target_id, %err, "could not resolve notification target");
            return Ok(());
        }
    };

    for transport in &targets {
        transport.send(bytes.clone());
    }
    debug!(target_id = %target_id, connections = targets.len(), "notified target");
    Ok(())
}

/// Resolves a target id to the deduplicated set of live transports.
///
/// Per-member lookup failures are skipped so one stale membership never
/// aborts a whole fan-out.
fn connections_for_target(
    cargo: &Cargo,
    target_id: &str,
) -> Result<Vec<TransportHandle>, TopologyError> {
    if let Some(user_id) = target_id.strip_prefix("user:") {
        return cargo.topology.get_user_connections(user_id);
    }

    let members = cargo.topology.room_members(target_id)?;
    let mut seen: HashMap<Uuid, TransportHandle> = HashMap::new();
    for member in members {
        match cargo.topology.get_user_connections(&member.id) {
            Ok(transports) => {
                for transport in transports {
                    seen.insert(transport.id(), transport);
                }
            }
            Err(err) => {
                warn!(room_id = %target_id, user_id = %member.id, %err,
                    "skipping room member without connection state");
            }
        }
    }
    Ok(seen.into_values().collect())
}
