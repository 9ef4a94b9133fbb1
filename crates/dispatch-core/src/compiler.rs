//! Compiles declarative event configuration into executable pipelines.
//!
//! Compilation resolves every step name against the registry, validates the
//! `{$variable}` placeholders inside parameter templates, and produces the
//! immutable event-to-pipeline map the router dispatches against. All
//! failures here are startup failures.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{ActionStep, CompiledPipeline, ModifierStep};
use crate::registry::Registry;

/// Declarative configuration for one event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub modifiers: Vec<StepConfig>,
    #[serde(default)]
    pub actions: Vec<StepConfig>,
}

/// One configured step: a registered name plus raw parameter templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
}

/// Fatal configuration faults detected at compile time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("unknown modifier '{name}' in event '{event}'")]
    UnknownModifier { event: String, name: String },

    #[error("unknown action '{name}' in event '{event}'")]
    UnknownAction { event: String, name: String },

    #[error("invalid context variable '{{${variable}}}' in event '{event}'")]
    UnknownVariable { event: String, variable: String },
}

static CONTEXT_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\$([A-Za-z0-9_.-]+)\}").expect("valid context variable pattern"));

/// Compiles every configured event into a [`CompiledPipeline`].
///
/// Pure with respect to its inputs: compiling identical configuration
/// against an identical registry yields structurally equal pipelines.
pub fn compile(
    events: &HashMap<String, EventConfig>,
    registry: &Registry,
) -> Result<HashMap<String, Arc<CompiledPipeline>>, CompileError> {
    let mut pipelines = HashMap::with_capacity(events.len());

    for (event_name, event) in events {
        let mut modifiers = Vec::with_capacity(event.modifiers.len());
        for step in &event.modifiers {
            let function =
                registry
                    .modifier(&step.name)
                    .ok_or_else(|| CompileError::UnknownModifier {
                        event: event_name.clone(),
                        name: step.name.clone(),
                    })?;
            validate_params(event_name, &step.params, registry)?;
            modifiers.push(ModifierStep {
                name: step.name.clone(),
                function,
                params: step.params.clone(),
            });
        }

        let mut actions = Vec::with_capacity(event.actions.len());
        for step in &event.actions {
            let function =
                registry
                    .action(&step.name)
                    .ok_or_else(|| CompileError::UnknownAction {
                        event: event_name.clone(),
                        name: step.name.clone(),
                    })?;
            validate_params(event_name, &step.params, registry)?;
            actions.push(ActionStep {
                name: step.name.clone(),
                function,
                params: step.params.clone(),
            });
        }

        pipelines.insert(
            event_name.clone(),
            Arc::new(CompiledPipeline { modifiers, actions }),
        );
    }

    Ok(pipelines)
}

/// Rejects parameter templates referencing unregistered context variables.
///
/// `token.`-prefixed variables are exempt: claim keys are dynamic and only
/// checked at resolve time.
fn validate_params(
    event_name: &str,
    params: &[String],
    registry: &Registry,
) -> Result<(), CompileError> {
    for param in params {
        for capture in CONTEXT_VAR.captures_iter(param) {
            let variable = &capture[1];
            if variable.starts_with("token.") {
                continue;
            }
            if registry.resolver(variable).is_none() {
                return Err(CompileError::UnknownVariable {
                    event: event_name.to_string(),
                    variable: variable.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CoreOptions;

    fn core_registry() -> Registry {
        let registry = Registry::new();
        registry
            .register_core(CoreOptions {
                jwt_secret: "test-secret".to_string(),
            })
            .unwrap();
        registry
    }

    fn step(name: &str, params: &[&str]) -> StepConfig {
        StepConfig {
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn single_event(event: EventConfig) -> HashMap<String, EventConfig> {
        HashMap::from([("msg".to_string(), event)])
    }

    #[test]
    fn test_compile_resolves_steps_in_order() {
        let registry = core_registry();
        let events = single_event(EventConfig {
            modifiers: vec![step("rate_limit", &["3/s"]), step("secure", &[])],
            actions: vec![
                step("_join", &["{$user.id}", "{$target.id}"]),
                step("_notify_room", &["message", "{.payload}"]),
            ],
        });

        let pipelines = compile(&events, &registry).unwrap();
        let pipeline = &pipelines["msg"];
        assert_eq!(pipeline.modifiers.len(), 2);
        assert_eq!(pipeline.modifiers[0].name, "rate_limit");
        assert_eq!(pipeline.modifiers[1].name, "secure");
        assert_eq!(pipeline.actions.len(), 2);
        assert_eq!(pipeline.actions[0].name, "_join");
        assert_eq!(pipeline.actions[1].params, vec!["message", "{.payload}"]);
    }

    #[test]
    fn test_unknown_action_fails() {
        let registry = core_registry();
        let events = single_event(EventConfig {
            modifiers: vec![],
            actions: vec![step("_teleport", &[])],
        });
        assert!(matches!(
            compile(&events, &registry),
            Err(CompileError::UnknownAction { event, name }) if event == "msg" && name == "_teleport"
        ));
    }

    #[test]
    fn test_unknown_modifier_fails() {
        let registry = core_registry();
        let events = single_event(EventConfig {
            modifiers: vec![step("captcha", &[])],
            actions: vec![],
        });
        assert!(matches!(
            compile(&events, &registry),
            Err(CompileError::UnknownModifier { name, .. }) if name == "captcha"
        ));
    }

    #[test]
    fn test_unknown_context_variable_fails() {
        let registry = core_registry();
        let events = single_event(EventConfig {
            modifiers: vec![],
            actions: vec![step("_log", &["hello {$session.id}"])],
        });
        assert!(matches!(
            compile(&events, &registry),
            Err(CompileError::UnknownVariable { variable, .. }) if variable == "session.id"
        ));
    }

    #[test]
    fn test_token_claims_are_exempt_from_validation() {
        let registry = core_registry();
        let events = single_event(EventConfig {
            modifiers: vec![step("secure", &[])],
            actions: vec![step("_log", &["issued to {$token.sub}"])],
        });
        assert!(compile(&events, &registry).is_ok());
    }

    #[test]
    fn test_compile_is_deterministic() {
        let registry = core_registry();
        let events = single_event(EventConfig {
            modifiers: vec![step("rate_limit", &["2/m"])],
            actions: vec![step("_notify_room", &["message", "{.payload}"])],
        });

        let first = compile(&events, &registry).unwrap();
        let second = compile(&events, &registry).unwrap();
        assert_eq!(first.len(), second.len());
        for (event, pipeline) in &first {
            let other = &second[event];
            let names =
                |p: &CompiledPipeline| -> (Vec<String>, Vec<String>, Vec<Vec<String>>) {
                    (
                        p.modifiers.iter().map(|s| s.name.clone()).collect(),
                        p.actions.iter().map(|s| s.name.clone()).collect(),
                        p.actions.iter().map(|s| s.params.clone()).collect(),
                    )
                };
            assert_eq!(names(pipeline), names(other));
        }
    }
}
