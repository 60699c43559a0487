//! Step registry: step-name → executable definition, pipeline-type → template.
//!
//! The registry is a pure lookup table. It is built once at startup and
//! shared read-only between the orchestrator and every worker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::database::models::make_step_key;
use crate::{Error, Result};

/// Data a step contributes to the execution (shallow-merged on completion).
pub type StepOutput = Map<String, Value>;

/// Request to create a step, either from a template or spawned at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Registered step name.
    pub step_name: String,
    /// Resource the step is parameterised by (file name, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    /// Step keys in addition to the definition's static dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub params: Value,
}

impl StepDescriptor {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            parameter: None,
            depends_on: Vec::new(),
            params: Value::Null,
        }
    }

    pub fn with_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.parameter = Some(parameter.into());
        self
    }

    pub fn with_depends_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Key this descriptor resolves to inside an execution.
    pub fn step_key(&self) -> String {
        make_step_key(&self.step_name, self.parameter.as_deref())
    }
}

/// Capability handed to a running step for adding work to its execution.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Persist a new pending step and re-evaluate the execution.
    ///
    /// Returns the key of the (possibly pre-existing) step.
    async fn spawn(&self, descriptor: StepDescriptor) -> Result<String>;
}

/// Everything a step body gets to see.
#[derive(Clone)]
pub struct StepContext {
    pub execution_id: String,
    pub step_key: String,
    pub step_name: String,
    /// Params fixed when the step was created.
    pub params: Value,
    /// Snapshot of the execution data taken when the step was queued.
    pub input: Map<String, Value>,
    pub attempt: i64,
    spawner: Arc<dyn Spawner>,
}

impl StepContext {
    pub fn new(
        execution_id: impl Into<String>,
        step_key: impl Into<String>,
        step_name: impl Into<String>,
        params: Value,
        input: Map<String, Value>,
        attempt: i64,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            step_key: step_key.into(),
            step_name: step_name.into(),
            params,
            input,
            attempt,
            spawner,
        }
    }

    /// Add a step to this execution while the current step is still running.
    pub async fn spawn(&self, descriptor: StepDescriptor) -> Result<String> {
        self.spawner.spawn(descriptor).await
    }

    /// Look up a value in the step params first, then in the input snapshot.
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        self.params.get(key).or_else(|| self.input.get(key))
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("execution_id", &self.execution_id)
            .field("step_key", &self.step_key)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// An opaque unit of work.
///
/// An `Err` fails the step and, with it, the execution; its message is
/// surfaced verbatim. Handlers are never retried automatically.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutput>;
}

/// Adapter turning an async closure into a [`StepHandler`].
pub struct FnStep<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StepOutput>> + Send,
{
    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutput> {
        (self.0)(ctx.clone()).await
    }
}

/// Wrap an async closure as a step handler.
pub fn step_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<StepOutput>> + Send + 'static,
{
    Arc::new(FnStep(f))
}

/// A registered step type.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    /// Step keys every instance waits for.
    pub depends_on: Vec<String>,
    pub handler: Arc<dyn StepHandler>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            handler,
        }
    }

    pub fn with_depends_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = keys.into_iter().map(Into::into).collect();
        self
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Initial step set of a pipeline type.
#[derive(Debug, Clone)]
pub struct PipelineTemplate {
    pub pipeline_type: String,
    pub steps: Vec<StepDescriptor>,
}

impl PipelineTemplate {
    pub fn new(pipeline_type: impl Into<String>, steps: Vec<StepDescriptor>) -> Self {
        Self {
            pipeline_type: pipeline_type.into(),
            steps,
        }
    }
}

/// A descriptor resolved against its definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStep {
    pub step_name: String,
    pub step_key: String,
    pub depends_on: Vec<String>,
    pub params: Value,
}

/// Lookup table of step definitions and pipeline templates.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: HashMap<String, StepDefinition>,
    templates: HashMap<String, PipelineTemplate>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `demo` and `media_import` pipelines.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::pipeline::steps::register_builtins(&mut registry);
        registry
    }

    /// Register (or replace) a step definition.
    pub fn register_step(&mut self, definition: StepDefinition) -> &mut Self {
        self.steps.insert(definition.name.clone(), definition);
        self
    }

    /// Register (or replace) a pipeline template.
    pub fn register_template(&mut self, template: PipelineTemplate) -> &mut Self {
        self.templates
            .insert(template.pipeline_type.clone(), template);
        self
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.get(name)
    }

    pub fn template(&self, pipeline_type: &str) -> Option<&PipelineTemplate> {
        self.templates.get(pipeline_type)
    }

    /// Registered pipeline types, sorted.
    pub fn pipeline_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.templates.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Resolve a descriptor: static dependencies first, then the extra ones,
    /// without duplicates.
    pub fn resolve(&self, descriptor: &StepDescriptor) -> Result<ResolvedStep> {
        let definition = self.step(&descriptor.step_name).ok_or_else(|| {
            Error::validation(format!("Unknown step '{}'", descriptor.step_name))
        })?;

        let step_key = descriptor.step_key();
        let mut depends_on: Vec<String> = Vec::new();
        for key in definition.depends_on.iter().chain(&descriptor.depends_on) {
            if key == &step_key {
                return Err(Error::validation(format!(
                    "Step '{}' cannot depend on itself",
                    step_key
                )));
            }
            if !depends_on.contains(key) {
                depends_on.push(key.clone());
            }
        }

        Ok(ResolvedStep {
            step_name: definition.name.clone(),
            step_key,
            depends_on,
            params: descriptor.params.clone(),
        })
    }

    /// Resolve every step of a template, rejecting duplicate keys.
    pub fn resolve_template(&self, pipeline_type: &str) -> Result<Vec<ResolvedStep>> {
        let template = self.template(pipeline_type).ok_or_else(|| {
            Error::validation(format!("Unknown pipeline type '{}'", pipeline_type))
        })?;

        let mut resolved: Vec<ResolvedStep> = Vec::with_capacity(template.steps.len());
        for descriptor in &template.steps {
            let step = self.resolve(descriptor)?;
            if resolved.iter().any(|s| s.step_key == step.step_key) {
                return Err(Error::validation(format!(
                    "Pipeline '{}' declares step '{}' twice",
                    pipeline_type, step.step_key
                )));
            }
            resolved.push(step);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Arc<dyn StepHandler> {
        step_fn(|_ctx| async { Ok(StepOutput::new()) })
    }

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry
            .register_step(StepDefinition::new("copy", noop()))
            .register_step(StepDefinition::new("probe", noop()).with_depends_on(["copy"]))
            .register_template(PipelineTemplate::new(
                "ingest",
                vec![
                    StepDescriptor::new("copy"),
                    StepDescriptor::new("probe").with_parameter("a.mp4"),
                ],
            ));
        registry
    }

    #[test]
    fn test_resolve_merges_dependencies() {
        let registry = registry();
        let resolved = registry
            .resolve(
                &StepDescriptor::new("probe")
                    .with_parameter("clip.mp4")
                    .with_depends_on(["copy", "scan"])
                    .with_params(json!({"path": "/media/clip.mp4"})),
            )
            .unwrap();

        assert_eq!(resolved.step_key, "probe:clip.mp4");
        assert_eq!(resolved.depends_on, vec!["copy", "scan"]);
        assert_eq!(resolved.params["path"], "/media/clip.mp4");
    }

    #[test]
    fn test_unknown_names_are_validation_errors() {
        let registry = registry();
        assert!(matches!(
            registry.resolve(&StepDescriptor::new("nope")),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            registry.resolve_template("nope"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let registry = registry();
        let descriptor = StepDescriptor::new("copy").with_depends_on(["copy"]);
        assert!(registry.resolve(&descriptor).is_err());
    }

    #[test]
    fn test_resolve_template_in_order() {
        let registry = registry();
        let steps = registry.resolve_template("ingest").unwrap();
        let keys: Vec<_> = steps.iter().map(|s| s.step_key.as_str()).collect();
        assert_eq!(keys, vec!["copy", "probe:a.mp4"]);
        assert_eq!(registry.pipeline_types(), vec!["ingest"]);
    }
}
