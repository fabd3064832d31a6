//! Integration tests for dependency-aware pipelines

use anyhow::{anyhow, Result};
use benchflow::config::PipelineConfig;
use benchflow::pipeline::{
    FnStage, PipelineContext, PipelineManager, PipelineStage, PipelineStatus, StageStatus,
};
use benchflow::OrchestrationError;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn config() -> PipelineConfig {
    PipelineConfig {
        max_retries: 1,
        retry_delay: Duration::from_millis(1),
        ..PipelineConfig::default()
    }
}

fn stage(stage: FnStage) -> Arc<dyn PipelineStage> {
    Arc::new(stage)
}

#[tokio::test]
async fn test_diamond_pipeline_passes_outputs_between_waves() -> Result<()> {
    let manager = PipelineManager::new(config())?;
    let pipeline = manager.create_pipeline(
        "diamond",
        vec![
            stage(FnStage::new("fetch", |ctx: PipelineContext| async move {
                let size = ctx.input("size").and_then(Value::as_u64).unwrap_or(0);
                Ok(json!(size))
            })),
            stage(
                FnStage::new("left", |ctx: PipelineContext| async move {
                    let fetched = ctx.stage_output("fetch").await.and_then(|v| v.as_u64());
                    Ok(json!(fetched.map(|n| n * 2)))
                })
                .depends_on(["fetch"]),
            ),
            stage(
                FnStage::new("right", |ctx: PipelineContext| async move {
                    let fetched = ctx.stage_output("fetch").await.and_then(|v| v.as_u64());
                    Ok(json!(fetched.map(|n| n + 1)))
                })
                .depends_on(["fetch"]),
            ),
            stage(
                FnStage::new("merge", |ctx: PipelineContext| async move {
                    let left = ctx.stage_output("left").await.and_then(|v| v.as_u64());
                    let right = ctx.stage_output("right").await.and_then(|v| v.as_u64());
                    match (left, right) {
                        (Some(l), Some(r)) => Ok(json!(l + r)),
                        _ => Err(anyhow!("missing upstream output")),
                    }
                })
                .depends_on(["left", "right"]),
            ),
        ],
    )?;
    assert_eq!(pipeline.waves().len(), 3);

    let result = manager
        .execute(&pipeline, PipelineContext::new().with_input("size", json!(10)))
        .await;
    assert_eq!(result.status, PipelineStatus::Completed);
    assert_eq!(result.total_waves, 3);
    assert_eq!(result.waves_executed, 3);
    assert_eq!(result.execution("merge").and_then(|e| e.result.clone()), Some(json!(31)));
    assert_eq!(result.execution("left").map(|e| e.wave), result.execution("right").map(|e| e.wave));
    Ok(())
}

#[tokio::test]
async fn test_failed_wave_skips_later_waves() -> Result<()> {
    let manager = PipelineManager::new(config())?;
    let pipeline = manager.create_pipeline(
        "broken",
        vec![
            stage(FnStage::new("setup", |_ctx: PipelineContext| async move {
                Err::<Value, _>(anyhow!("disk full"))
            })),
            stage(
                FnStage::new("run", |_ctx: PipelineContext| async move { Ok(json!(null)) })
                    .depends_on(["setup"]),
            ),
        ],
    )?;

    let result = manager.execute(&pipeline, PipelineContext::new()).await;
    assert_eq!(result.status, PipelineStatus::Failed);
    let setup = result.execution("setup").expect("setup recorded");
    assert_eq!(setup.status, StageStatus::Failed);
    assert_eq!(setup.attempts, 2);
    assert_eq!(result.execution("run").map(|e| e.status), Some(StageStatus::Skipped));
    assert!(result.error.as_deref().is_some_and(|e| e.contains("disk full")));
    Ok(())
}

#[test]
fn test_cycles_are_rejected_before_execution() {
    let manager = PipelineManager::new(config()).unwrap();
    let err = manager
        .create_pipeline(
            "cyclic",
            vec![
                stage(
                    FnStage::new("a", |_ctx: PipelineContext| async move { Ok(json!(null)) })
                        .depends_on(["b"]),
                ),
                stage(
                    FnStage::new("b", |_ctx: PipelineContext| async move { Ok(json!(null)) })
                        .depends_on(["a"]),
                ),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidDependencyGraph { .. }));
}
