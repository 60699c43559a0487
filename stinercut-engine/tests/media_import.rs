mod common;

use serde_json::{Map, json};
use tempfile::TempDir;

use common::Engine;
use stinercut_engine::database::models::{ExecutionStatus, StepStatus};
use stinercut_engine::pipeline::StepRegistry;
use stinercut_engine::pipeline::steps::media;

fn card_with_clips() -> TempDir {
    let dir = TempDir::new().unwrap();
    let dcim = dir.path().join("DCIM").join("100GOPRO");
    std::fs::create_dir_all(&dcim).unwrap();
    std::fs::write(dcim.join("GX010001.MP4"), vec![0u8; 1024]).unwrap();
    std::fs::write(dcim.join("GL010001.LRV"), vec![0u8; 256]).unwrap();
    std::fs::write(dcim.join("GX010001.THM"), vec![0u8; 16]).unwrap();
    std::fs::write(dir.path().join("MISC.txt"), b"notes").unwrap();
    dir
}

#[tokio::test]
async fn media_import_probes_every_clip_and_summarizes() {
    let card = card_with_clips();
    let engine = Engine::new(StepRegistry::with_builtins()).await;

    let mut params = Map::new();
    params.insert(
        "folder_path".to_string(),
        json!(card.path().to_string_lossy()),
    );
    let outcome = engine
        .orchestrator
        .start("card-serial-1234", media::PIPELINE_TYPE, params)
        .await
        .unwrap();

    let outcomes = engine.drain().await;
    assert_eq!(outcomes.len(), 4);
    assert_eq!(engine.status(&outcome.execution_id).await, ExecutionStatus::Completed);

    let detail = engine
        .orchestrator
        .get_execution(&outcome.execution_id)
        .await
        .unwrap();
    let keys: Vec<_> = detail.steps.iter().map(|s| s.step_key.as_str()).collect();
    assert_eq!(
        keys,
        vec![
            "scan_media",
            "probe_file:DCIM/100GOPRO/GL010001.LRV",
            "probe_file:DCIM/100GOPRO/GX010001.MP4",
            "summarize_import",
        ]
    );
    assert!(
        detail
            .steps
            .iter()
            .all(|s| s.get_status() == Some(StepStatus::Completed))
    );
    assert_eq!(detail.stats.percent_complete(), 100.0);

    let summarize = &detail.steps[3];
    assert_eq!(summarize.spawned_by.as_deref(), Some("scan_media"));
    assert_eq!(summarize.get_depends_on(), vec![keys[1], keys[2]]);

    let data = detail.execution.get_execution_data();
    assert_eq!(
        data["import_summary"],
        json!({"files": 2, "total_bytes": 1280})
    );
    assert_eq!(
        data["media_files"],
        json!(["DCIM/100GOPRO/GL010001.LRV", "DCIM/100GOPRO/GX010001.MP4"])
    );
    assert_eq!(
        data["probe_file:DCIM/100GOPRO/GX010001.MP4"]["size_bytes"],
        1024
    );
}

#[tokio::test]
async fn empty_card_still_completes() {
    let card = TempDir::new().unwrap();
    let engine = Engine::new(StepRegistry::with_builtins()).await;

    let mut params = Map::new();
    params.insert(
        "folder_path".to_string(),
        json!(card.path().to_string_lossy()),
    );
    let outcome = engine
        .orchestrator
        .start("empty-card", media::PIPELINE_TYPE, params)
        .await
        .unwrap();

    engine.drain().await;
    assert_eq!(engine.status(&outcome.execution_id).await, ExecutionStatus::Completed);
    let data = engine
        .repository()
        .get_execution(&outcome.execution_id)
        .await
        .unwrap()
        .get_execution_data();
    assert_eq!(data["import_summary"], json!({"files": 0, "total_bytes": 0}));
}

#[tokio::test]
async fn missing_folder_fails_the_import() {
    let engine = Engine::new(StepRegistry::with_builtins()).await;

    let mut params = Map::new();
    params.insert("folder_path".to_string(), json!("/no/such/card"));
    let outcome = engine
        .orchestrator
        .start("ghost-card", media::PIPELINE_TYPE, params)
        .await
        .unwrap();

    engine.drain().await;
    assert_eq!(engine.status(&outcome.execution_id).await, ExecutionStatus::Failed);
    let scan = engine.step(&outcome.execution_id, "scan_media").await;
    assert!(
        scan.error_message
            .unwrap()
            .contains("cannot read directory /no/such/card")
    );
}
