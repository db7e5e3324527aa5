//! End-to-end pipeline scenarios driven through the job engine and advancer.

#![cfg(feature = "sqlite")]

mod common;

use async_trait::async_trait;
use common::*;
use forkflow::{
    step, Definition, PipelineStatus, Step, StepContext, StepError, StepStatus, Store, StoreError,
};
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn chain_feeds_each_output_forward() {
    let graph = Definition::new()
        .start(step::<Double>())
        .unwrap()
        .chain(step::<AddTen>())
        .unwrap()
        .complete()
        .unwrap();
    let orch = orchestrator(registry().pipeline("arith", graph), test_settings(0)).await;

    let id = orch.trigger("arith", &5).await.unwrap();
    assert_eq!(status(&orch, id).await, PipelineStatus::Pending);

    drain(&orch, "arith").await;

    assert_eq!(status(&orch, id).await, PipelineStatus::Completed);
    assert_eq!(last_output(&orch, id).await, json!(20));

    let steps = orch.store().steps(id).await.unwrap();
    let nodes: Vec<&str> = steps.iter().map(|s| s.node_id.as_str()).collect();
    assert_eq!(nodes, vec!["Double.0", "AddTen.1"]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
}

#[tokio::test]
async fn divide_then_combine_joins_in_branch_order() {
    let graph = Definition::new()
        .start(step::<Upper>())
        .unwrap()
        .divide(&[step::<Reverse>(), step::<Upper>()])
        .unwrap()
        .combine(step::<Join>())
        .unwrap()
        .complete()
        .unwrap();
    let orch = orchestrator(registry().pipeline("text", graph), test_settings(0)).await;

    let id = orch.trigger("text", &"abc").await.unwrap();
    drain(&orch, "text").await;

    assert_eq!(status(&orch, id).await, PipelineStatus::Completed);
    assert_eq!(last_output(&orch, id).await, json!("CBA|ABC"));

    let steps = orch.store().steps(id).await.unwrap();
    let joins = steps.iter().filter(|s| s.node_id.as_str() == "Join.2").count();
    assert_eq!(joins, 1);
}

#[tokio::test]
async fn combine_waits_for_longer_branch() {
    let graph = Definition::new()
        .start(step::<Double>())
        .unwrap()
        .divide_with(&[step::<AddTen>(), step::<Double>()], |branches| {
            branches.chain(0, step::<Double>())?;
            Ok(())
        })
        .unwrap()
        .combine(step::<Sum>())
        .unwrap()
        .complete()
        .unwrap();
    let orch = orchestrator(registry().pipeline("branches", graph), test_settings(0)).await;

    let id = orch.trigger("branches", &1).await.unwrap();
    drain(&orch, "branches").await;

    // 1*2 = 2; branch 0: (2+10)*2 = 24; branch 1: 2*2 = 4
    assert_eq!(status(&orch, id).await, PipelineStatus::Completed);
    assert_eq!(last_output(&orch, id).await, json!(28));
}

#[tokio::test]
async fn expand_then_collapse_gathers_every_instance() {
    let graph = Definition::new()
        .start(step::<Numbers>())
        .unwrap()
        .expand(step::<Square>())
        .unwrap()
        .collapse(step::<Sum>())
        .unwrap()
        .complete()
        .unwrap();
    let orch = orchestrator(registry().pipeline("squares", graph), test_settings(0)).await;

    let id = orch.trigger("squares", &4).await.unwrap();
    drain(&orch, "squares").await;

    assert_eq!(status(&orch, id).await, PipelineStatus::Completed);
    assert_eq!(last_output(&orch, id).await, json!(30));

    let steps = orch.store().steps(id).await.unwrap();
    let squares: Vec<serde_json::Value> = steps
        .iter()
        .filter(|s| s.step_type == "Square")
        .map(|s| s.input.clone())
        .collect();
    assert_eq!(squares, vec![json!(1), json!(2), json!(3), json!(4)]);
}

#[tokio::test]
async fn empty_expand_completes_without_collapse() {
    let graph = Definition::new()
        .start(step::<Numbers>())
        .unwrap()
        .expand(step::<Square>())
        .unwrap()
        .collapse(step::<Sum>())
        .unwrap()
        .complete()
        .unwrap();
    let orch = orchestrator(registry().pipeline("squares", graph), test_settings(0)).await;

    let id = orch.trigger("squares", &0).await.unwrap();
    drain(&orch, "squares").await;

    assert_eq!(status(&orch, id).await, PipelineStatus::Completed);
    assert_eq!(orch.store().steps(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn combine_aligns_expanded_branches_by_position() {
    let graph = Definition::new()
        .start(step::<Numbers>())
        .unwrap()
        .expand(step::<Square>())
        .unwrap()
        .divide(&[step::<Double>(), step::<AddTen>()])
        .unwrap()
        .combine(step::<Sum>())
        .unwrap()
        .complete()
        .unwrap();
    let orch = orchestrator(registry().pipeline("aligned", graph), test_settings(0)).await;

    let id = orch.trigger("aligned", &2).await.unwrap();
    drain(&orch, "aligned").await;

    assert_eq!(status(&orch, id).await, PipelineStatus::Completed);
    let sums: Vec<serde_json::Value> = orch
        .store()
        .steps(id)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.step_type == "Sum")
        .filter_map(|s| s.output)
        .collect();
    // squares 1 and 4: [2, 11] and [8, 14]
    assert_eq!(sums, vec![json!(13), json!(22)]);
}

#[tokio::test]
async fn permanent_failure_halts_and_notifies_once() {
    let log = HaltLog::default();
    let graph = Definition::new()
        .start(step::<Double>())
        .unwrap()
        .chain(step::<Broken>())
        .unwrap()
        .on_halt(step::<HaltLog>())
        .unwrap()
        .complete()
        .unwrap();
    let orch = orchestrator(
        registry().step(log.clone()).pipeline("fragile", graph),
        test_settings(3),
    )
    .await;

    let id = orch.trigger("fragile", &1).await.unwrap();
    drain(&orch, "fragile").await;

    assert_eq!(status(&orch, id).await, PipelineStatus::Halted);

    let notices = log.received();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].pipeline_id, id);
    assert_eq!(notices[0].step_type, "Broken");
    assert_eq!(notices[0].error_type, "permanent");
    assert_eq!(notices[0].error_message, "bad record");

    let steps = orch.store().steps(id).await.unwrap();
    let broken = steps.iter().find(|s| s.step_type == "Broken").unwrap();
    assert_eq!(broken.status, StepStatus::Failed);
    // permanent errors are not retried
    assert_eq!(orch.store().executions(broken.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_notify_halt_handler_once() {
    let flaky = Flaky::default();
    let log = HaltLog::default();
    let graph = Definition::new()
        .start(step::<Flaky>())
        .unwrap()
        .on_halt(step::<HaltLog>())
        .unwrap()
        .complete()
        .unwrap();
    let orch = orchestrator(
        registry()
            .step(flaky.clone())
            .step(log.clone())
            .pipeline("flaky", graph),
        test_settings(2),
    )
    .await;

    let id = orch.trigger("flaky", &json!(null)).await.unwrap();
    drain(&orch, "flaky").await;

    assert_eq!(status(&orch, id).await, PipelineStatus::Halted);
    assert_eq!(flaky.attempts.load(std::sync::atomic::Ordering::SeqCst), 3);

    // retries that were scheduled never reached the handler
    let notices = log.received();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].pipeline_id, id);
    assert_eq!(notices[0].step_type, "Flaky");
    assert_eq!(notices[0].error_type, "retryable");
    assert_eq!(notices[0].error_message, "upstream unavailable (attempt 3)");
}

#[tokio::test]
async fn expand_of_scalar_output_halts() {
    let log = HaltLog::default();
    let graph = Definition::new()
        .start(step::<Double>())
        .unwrap()
        .expand(step::<Square>())
        .unwrap()
        .on_halt(step::<HaltLog>())
        .unwrap()
        .complete()
        .unwrap();
    let orch = orchestrator(
        registry().step(log.clone()).pipeline("scalar", graph),
        test_settings(0),
    )
    .await;

    let id = orch.trigger("scalar", &3).await.unwrap();
    drain(&orch, "scalar").await;

    assert_eq!(status(&orch, id).await, PipelineStatus::Halted);
    assert_eq!(orch.store().steps(id).await.unwrap().len(), 1);

    let notices = log.received();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].error_type, "not_a_sequence");
    assert_eq!(notices[0].step_type, "Square");
}

#[tokio::test]
async fn expand_beyond_max_depth_halts_without_spawning() {
    let graph = Definition::new()
        .start(step::<Numbers>())
        .unwrap()
        .expand(step::<Square>())
        .unwrap()
        .complete()
        .unwrap();
    let mut settings = test_settings(0);
    settings.defaults.max_depth = 2;
    let orch = orchestrator(registry().pipeline("bounded", graph), settings).await;

    let within = orch.trigger("bounded", &2).await.unwrap();
    let beyond = orch.trigger("bounded", &3).await.unwrap();
    drain(&orch, "bounded").await;

    assert_eq!(status(&orch, within).await, PipelineStatus::Completed);
    assert_eq!(status(&orch, beyond).await, PipelineStatus::Halted);

    let steps = orch.store().steps(beyond).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Completed);
}

struct Stash;

#[async_trait]
impl Step for Stash {
    const NAME: &'static str = "Stash";
    type Input = i64;
    type Output = i64;

    async fn execute(&self, n: i64, ctx: &StepContext) -> Result<i64, StepError> {
        ctx.set("original", &n).await.map_err(StepError::permanent)?;
        match ctx.set("original", &(n + 1)).await {
            Err(StoreError::TupleExists { .. }) => {}
            other => {
                return Err(StepError::permanent(anyhow::anyhow!(
                    "second set should be rejected, got {other:?}"
                )))
            }
        }
        Ok(n * 100)
    }
}

struct Recall;

#[async_trait]
impl Step for Recall {
    const NAME: &'static str = "Recall";
    type Input = i64;
    type Output = Vec<i64>;

    async fn execute(&self, n: i64, ctx: &StepContext) -> Result<Vec<i64>, StepError> {
        let original: Option<i64> = ctx.get("original").await.map_err(StepError::permanent)?;
        ctx.overwrite("original", &0).await.map_err(StepError::permanent)?;
        Ok(vec![original.unwrap_or(-1), n])
    }
}

#[tokio::test]
async fn steps_share_pipeline_context() {
    let graph = Definition::new()
        .start(step::<Stash>())
        .unwrap()
        .chain(step::<Recall>())
        .unwrap()
        .complete()
        .unwrap();
    let orch = orchestrator(
        registry().step(Stash).step(Recall).pipeline("context", graph),
        test_settings(0),
    )
    .await;

    let id = orch.trigger("context", &7).await.unwrap();
    drain(&orch, "context").await;

    assert_eq!(status(&orch, id).await, PipelineStatus::Completed);
    assert_eq!(last_output(&orch, id).await, json!([7, 700]));
    assert_eq!(
        orch.store().get_tuple(id, "original").await.unwrap(),
        Some(json!(0))
    );
}
