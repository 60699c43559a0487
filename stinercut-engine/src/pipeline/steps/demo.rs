//! The `demo` pipeline: `scan` → `finish`.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::pipeline::registry::{
    PipelineTemplate, StepContext, StepDefinition, StepDescriptor, StepHandler, StepOutput,
    StepRegistry,
};

pub const PIPELINE_TYPE: &str = "demo";
pub const SCAN: &str = "scan";
pub const FINISH: &str = "finish";

const DEFAULT_FILE_COUNT: u64 = 3;

/// Reports a file count, taken from the `files` trigger param.
pub struct ScanStep;

#[async_trait]
impl StepHandler for ScanStep {
    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutput> {
        let files = match ctx.lookup("files") {
            None | Some(Value::Null) => DEFAULT_FILE_COUNT,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| anyhow::anyhow!("'files' must be a non-negative integer, got {value}"))?,
        };

        let mut output = StepOutput::new();
        output.insert("files".to_string(), json!(files));
        Ok(output)
    }
}

pub struct FinishStep;

#[async_trait]
impl StepHandler for FinishStep {
    async fn run(&self, _ctx: &StepContext) -> anyhow::Result<StepOutput> {
        let mut output = StepOutput::new();
        output.insert("finished".to_string(), Value::Bool(true));
        Ok(output)
    }
}

pub fn register(registry: &mut StepRegistry) {
    registry
        .register_step(StepDefinition::new(SCAN, Arc::new(ScanStep)))
        .register_step(StepDefinition::new(FINISH, Arc::new(FinishStep)).with_depends_on([SCAN]))
        .register_template(PipelineTemplate::new(
            PIPELINE_TYPE,
            vec![StepDescriptor::new(SCAN), StepDescriptor::new(FINISH)],
        ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::registry::Spawner;
    use serde_json::Map;

    struct NoSpawn;

    #[async_trait]
    impl Spawner for NoSpawn {
        async fn spawn(&self, _descriptor: StepDescriptor) -> crate::Result<String> {
            Err(crate::Error::Other("spawning not expected".to_string()))
        }
    }

    fn ctx(input: Value) -> StepContext {
        StepContext::new(
            "exec",
            SCAN,
            SCAN,
            Value::Null,
            input.as_object().cloned().unwrap_or_else(Map::new),
            1,
            Arc::new(NoSpawn),
        )
    }

    #[tokio::test]
    async fn test_scan_defaults_to_three() {
        let output = ScanStep.run(&ctx(json!({}))).await.unwrap();
        assert_eq!(output["files"], 3);
    }

    #[tokio::test]
    async fn test_scan_uses_trigger_param() {
        let output = ScanStep.run(&ctx(json!({"files": 12}))).await.unwrap();
        assert_eq!(output["files"], 12);
    }

    #[tokio::test]
    async fn test_scan_rejects_garbage() {
        let err = ScanStep.run(&ctx(json!({"files": "many"}))).await.unwrap_err();
        assert!(err.to_string().contains("'files'"));
    }

    #[test]
    fn test_template_shape() {
        let mut registry = StepRegistry::new();
        register(&mut registry);
        let steps = registry.resolve_template(PIPELINE_TYPE).unwrap();
        assert_eq!(steps[0].step_key, SCAN);
        assert!(steps[0].depends_on.is_empty());
        assert_eq!(steps[1].step_key, FINISH);
        assert_eq!(steps[1].depends_on, vec![SCAN]);
    }
}
