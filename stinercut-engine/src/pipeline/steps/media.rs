//! The `media_import` pipeline.
//!
//! `scan_media` walks the imported folder and spawns one `probe_file:<name>`
//! step per video plus a `summarize_import` step that fans in on all of them.
//! The file count is only known once the scan has run, which is why the graph
//! grows at runtime.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::pipeline::registry::{
    PipelineTemplate, StepContext, StepDefinition, StepDescriptor, StepHandler, StepOutput,
    StepRegistry,
};

pub const PIPELINE_TYPE: &str = "media_import";
pub const SCAN_MEDIA: &str = "scan_media";
pub const PROBE_FILE: &str = "probe_file";
pub const SUMMARIZE_IMPORT: &str = "summarize_import";

/// Camera video and low-res proxy files, matched case-insensitively.
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "lrv"];

fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| MEDIA_EXTENSIONS.iter().any(|m| ext.eq_ignore_ascii_case(m)))
}

/// Media files under `root`, recursively, sorted by path. Hidden entries are skipped.
async fn collect_media_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("cannot read directory {}", dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && is_media_file(&path) {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Lists the media files of `folder_path` and spawns the per-file work.
pub struct ScanMediaStep;

#[async_trait]
impl StepHandler for ScanMediaStep {
    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutput> {
        let folder = ctx
            .lookup("folder_path")
            .and_then(Value::as_str)
            .context("missing 'folder_path'")?;
        let root = PathBuf::from(folder);

        let files = collect_media_files(&root).await?;
        debug!(
            execution_id = %ctx.execution_id,
            folder = %root.display(),
            count = files.len(),
            "Scanned media folder"
        );

        let mut probe_keys = Vec::with_capacity(files.len());
        let mut names = Vec::with_capacity(files.len());
        for path in &files {
            // Relative path keeps keys unique across camera sub-folders.
            let relative = path
                .strip_prefix(&root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            let key = ctx
                .spawn(
                    StepDescriptor::new(PROBE_FILE)
                        .with_parameter(relative.clone())
                        .with_params(json!({ "path": path.to_string_lossy() })),
                )
                .await?;
            probe_keys.push(key);
            names.push(relative);
        }

        ctx.spawn(StepDescriptor::new(SUMMARIZE_IMPORT).with_depends_on(probe_keys))
            .await?;

        let mut output = StepOutput::new();
        output.insert("media_files".to_string(), json!(names));
        Ok(output)
    }
}

/// Records the size of one file under its step key.
pub struct ProbeFileStep;

#[async_trait]
impl StepHandler for ProbeFileStep {
    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutput> {
        let path = ctx
            .params
            .get("path")
            .and_then(Value::as_str)
            .context("missing 'path' param")?;

        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot stat {}", path))?;

        let mut output = StepOutput::new();
        output.insert(
            ctx.step_key.clone(),
            json!({ "path": path, "size_bytes": metadata.len() }),
        );
        Ok(output)
    }
}

/// Totals what the probes recorded.
pub struct SummarizeImportStep;

#[async_trait]
impl StepHandler for SummarizeImportStep {
    async fn run(&self, ctx: &StepContext) -> anyhow::Result<StepOutput> {
        let prefix = format!("{}:", PROBE_FILE);
        let mut files = 0u64;
        let mut total_bytes = 0u64;

        for (key, value) in &ctx.input {
            if !key.starts_with(&prefix) {
                continue;
            }
            files += 1;
            total_bytes += value.get("size_bytes").and_then(Value::as_u64).unwrap_or(0);
        }

        let mut output = StepOutput::new();
        output.insert(
            "import_summary".to_string(),
            json!({ "files": files, "total_bytes": total_bytes }),
        );
        Ok(output)
    }
}

pub fn register(registry: &mut StepRegistry) {
    registry
        .register_step(StepDefinition::new(SCAN_MEDIA, Arc::new(ScanMediaStep)))
        .register_step(StepDefinition::new(PROBE_FILE, Arc::new(ProbeFileStep)))
        .register_step(StepDefinition::new(
            SUMMARIZE_IMPORT,
            Arc::new(SummarizeImportStep),
        ))
        .register_template(PipelineTemplate::new(
            PIPELINE_TYPE,
            vec![StepDescriptor::new(SCAN_MEDIA)],
        ));
}
