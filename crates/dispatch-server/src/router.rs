//! The event router: the per-message hot path.
//!
//! Each inbound frame is parsed, matched to its compiled pipeline, wrapped
//! in a Cargo, and run through the modifier chain then the action chain.
//! Errors here never produce a response to the peer; malformed frames and
//! vetoed pipelines are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use dispatch_core::pipeline::{Cargo, PipelineError, Target};
use dispatch_core::{CompiledPipeline, Registry, TopologyStore};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// The frame clients send: a routing target, an event name, and an
/// arbitrary JSON payload kept raw until a template asks for it.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    target: String,
    event: String,
    #[serde(default = "null_payload")]
    payload: Box<RawValue>,
}

fn null_payload() -> Box<RawValue> {
    RawValue::from_string("null".to_string()).expect("null is valid JSON")
}

/// Matches both placeholder forms: `{.payload...}` and `{$variable}`.
static TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\$|\.)([A-Za-z0-9_.-]+)\}").expect("valid template pattern"));

/// Routes inbound messages through their compiled pipelines.
pub struct EventRouter {
    topology: Arc<TopologyStore>,
    registry: Arc<Registry>,
    pipelines: HashMap<String, Arc<CompiledPipeline>>,
}

impl EventRouter {
    pub fn new(
        topology: Arc<TopologyStore>,
        registry: Arc<Registry>,
        pipelines: HashMap<String, Arc<CompiledPipeline>>,
    ) -> Self {
        Self {
            topology,
            registry,
            pipelines,
        }
    }

    /// Handles one raw frame from `conn_id`.
    ///
    /// Runs synchronously on the connection's reader task, so messages from
    /// a single socket are processed in arrival order. All failure paths
    /// log and return; the socket stays up.
    pub fn handle_message(&self, conn_id: Uuid, raw: &[u8]) {
        let frame: ClientFrame = match serde_json::from_slice(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conn_id = %conn_id, %err, "failed to parse client frame");
                return;
            }
        };

        if frame.target.is_empty() {
            warn!(conn_id = %conn_id, "client frame missing required 'target' field");
            return;
        }

        let Some(pipeline) = self.pipelines.get(&frame.event) else {
            warn!(conn_id = %conn_id, event = %frame.event, "received unknown event");
            return;
        };

        let Some(connection) = self.topology.get_connection(conn_id) else {
            error!(conn_id = %conn_id, "state for originating connection not found");
            return;
        };
        let user = match connection
            .user_id
            .as_deref()
            .and_then(|user_id| self.topology.find_user(user_id))
        {
            Some(user) => user,
            None => {
                error!(conn_id = %conn_id, "originating connection has no associated user");
                return;
            }
        };

        let target = if let Some(user_id) = frame.target.strip_prefix("user:") {
            match self.topology.find_user(user_id) {
                Some(user) => Target::User(user),
                None => Target::None,
            }
        } else {
            match self.topology.find_room(&frame.target) {
                Some(room) => Target::Room(room),
                None => Target::None,
            }
        };

        let cargo = Cargo {
            event_name: frame.event.clone(),
            user,
            connection,
            topology: self.topology.clone(),
            payload: frame.payload,
            target_id: frame.target,
            target,
            token_claims: Mutex::new(None),
        };

        debug!(event = %cargo.event_name, user_id = %cargo.user.id, "executing modifier chain");
        for step in &pipeline.modifiers {
            let params = match self.resolve_params(&cargo, &step.params) {
                Ok(params) => params,
                Err(err) => {
                    error!(event = %cargo.event_name, modifier = %step.name, %err,
                        "failed to resolve modifier params, pipeline halted");
                    return;
                }
            };
            if let Err(err) = (step.function)(&cargo, &params) {
                warn!(event = %cargo.event_name, user_id = %cargo.user.id, modifier = %step.name,
                    %err, "modifier check failed, pipeline halted");
                return;
            }
        }

        debug!(event = %cargo.event_name, user_id = %cargo.user.id, "executing action chain");
        for step in &pipeline.actions {
            let params = match self.resolve_params(&cargo, &step.params) {
                Ok(params) => params,
                Err(err) => {
                    error!(event = %cargo.event_name, action = %step.name, %err,
                        "failed to resolve action params, pipeline halted");
                    return;
                }
            };
            if let Err(err) = (step.function)(&cargo, &params) {
                error!(event = %cargo.event_name, action = %step.name, %err,
                    "action execution failed, pipeline halted");
                return;
            }
        }
    }

    /// Resolves a step's raw parameter templates against the Cargo.
    ///
    /// Placeholders are replaced in place; surrounding text is preserved;
    /// templates with no placeholder pass through verbatim.
    fn resolve_params(
        &self,
        cargo: &Cargo,
        templates: &[String],
    ) -> Result<Vec<String>, PipelineError> {
        let mut payload_cache: Option<serde_json::Value> = None;

        templates
            .iter()
            .map(|template| self.resolve_template(cargo, template, &mut payload_cache))
            .collect()
    }

    fn resolve_template(
        &self,
        cargo: &Cargo,
        template: &str,
        payload_cache: &mut Option<serde_json::Value>,
    ) -> Result<String, PipelineError> {
        let mut resolved = String::with_capacity(template.len());
        let mut last_end = 0;

        for capture in TEMPLATE.captures_iter(template) {
            let matched = capture.get(0).expect("capture 0 always present");
            resolved.push_str(&template[last_end..matched.start()]);
            last_end = matched.end();

            let prefix = &capture[1];
            let path = &capture[2];
            let replacement = match prefix {
                "." => self.resolve_payload_path(cargo, path, payload_cache)?,
                _ => self.resolve_variable(cargo, path)?,
            };
            resolved.push_str(&replacement);
        }
        resolved.push_str(&template[last_end..]);
        Ok(resolved)
    }

    /// `{.payload}` yields the raw payload bytes; `{.payload.<path>}`
    /// descends the parsed payload dot by dot.
    fn resolve_payload_path(
        &self,
        cargo: &Cargo,
        path: &str,
        payload_cache: &mut Option<serde_json::Value>,
    ) -> Result<String, PipelineError> {
        if path == "payload" {
            return Ok(cargo.payload_str().to_string());
        }
        let Some(sub_path) = path.strip_prefix("payload.") else {
            return Err(PipelineError::UnknownVariable(format!(".{path}")));
        };

        if payload_cache.is_none() {
            *payload_cache = Some(serde_json::from_str(cargo.payload_str())?);
        }
        let mut value = payload_cache.as_ref().expect("cache filled above");

        for segment in sub_path.split('.') {
            let next = match value {
                serde_json::Value::Object(map) => map.get(segment),
                serde_json::Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get(index)),
                _ => None,
            };
            value = next.ok_or_else(|| PipelineError::PayloadPath(sub_path.to_string()))?;
        }

        Ok(match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// `{$token.<claim>}` reads the claims stashed by the `secure` modifier
    /// (empty string when absent); any other `{$name}` goes through the
    /// resolver registry.
    fn resolve_variable(&self, cargo: &Cargo, name: &str) -> Result<String, PipelineError> {
        if let Some(claim) = name.strip_prefix("token.") {
            let claims = cargo.token_claims.lock();
            return Ok(claims
                .as_ref()
                .and_then(|claims| claims.get(claim))
                .unwrap_or_default());
        }

        let resolver = self
            .registry
            .resolver(name)
            .ok_or_else(|| PipelineError::UnknownVariable(name.to_string()))?;
        resolver(cargo)
    }
}
