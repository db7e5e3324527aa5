//! Runner lifecycle and process supervision.

#![cfg(feature = "sqlite")]

mod common;

use async_trait::async_trait;
use common::*;
use forkflow::{
    step, Definition, PipelineStatus, ProcessIdentity, Runner, StepStatus, Store, Worker,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn runners_drive_pipeline_to_completion() {
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

    let jobs = orch.job_runner("squares").unwrap().start();
    let advancer = orch.advancer_runner().start();

    let id = orch.trigger("squares", &3).await.unwrap();
    let finished = wait_for_status(&orch, id, PipelineStatus::Completed).await;

    jobs.shutdown().await.unwrap();
    advancer.shutdown().await.unwrap();

    assert_eq!(finished, PipelineStatus::Completed);
    assert_eq!(last_output(&orch, id).await, json!(14));
}

#[tokio::test]
async fn runner_heartbeat_lives_while_running() {
    let orch = orchestrator(registry(), test_settings(0)).await;
    let handle = orch.advancer_runner().start();

    let mut beat = None;
    for _ in 0..100 {
        beat = orch.store().heartbeat(orch.identity()).await.unwrap();
        if beat.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(beat.is_some());

    handle.shutdown().await.unwrap();
    assert_eq!(orch.store().heartbeat(orch.identity()).await.unwrap(), None);
}

#[tokio::test]
async fn aborted_job_claim_is_released_on_shutdown() {
    let graph = Definition::new().start(step::<Slow>()).unwrap().complete().unwrap();
    let mut settings = test_settings(0);
    settings.defaults.graceful_shutdown_timeout_ms = 100;
    let orch = orchestrator(registry().pipeline("slow", graph), settings).await;

    let id = orch.trigger("slow", &json!(null)).await.unwrap();
    let handle = orch.job_runner("slow").unwrap().start();
    assert_eq!(
        wait_for_status(&orch, id, PipelineStatus::InProgress).await,
        PipelineStatus::InProgress
    );

    handle.shutdown().await.unwrap();

    let step = orch.store().steps(id).await.unwrap().remove(0);
    assert_eq!(step.status, StepStatus::Pending);
    let other = ProcessIdentity::new(7, "other-machine");
    assert!(orch.store().claim_job("slow", &other).await.unwrap().is_some());
}

#[derive(Clone, Default)]
struct Counting {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for Counting {
    fn label(&self) -> String {
        "counting".to_string()
    }

    async fn work_once(&self) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }
}

#[tokio::test]
async fn idle_workers_poll_until_stopped() {
    let store = memory_store().await;
    let counting = Counting::default();
    let runner = Runner::builder("counting", store, ProcessIdentity::new(1, "test-machine"))
        .workers(counting.clone(), 3)
        .poll_interval(Duration::from_millis(10))
        .build();
    assert_eq!(runner.worker_count(), 3);
    assert_eq!(runner.label(), "counting");

    let handle = runner.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await.unwrap();

    let calls = counting.calls.load(Ordering::SeqCst);
    assert!(calls >= 3, "expected every worker to poll, got {calls}");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counting.calls.load(Ordering::SeqCst), calls);
}

#[cfg(unix)]
mod supervision {
    use super::*;
    use pretty_assertions::assert_eq;
    use forkflow::settings::SupervisorSettings;
    use forkflow::{Settings, Supervisor, UnitSpec, UnitState};

    fn supervisor_settings(heartbeat_timeout_ms: u64) -> Arc<Settings> {
        let mut settings = test_settings(0);
        settings.supervisor = SupervisorSettings {
            polling_interval_ms: 20,
            heartbeat_timeout_ms,
            shutdown_timeout_ms: 300,
        };
        Arc::new(settings)
    }

    // `sh -c SCRIPT sh <unit args...>` ignores the unit arguments
    fn shell(store: Arc<dyn Store>, settings: Arc<Settings>, script: &str) -> Supervisor {
        Supervisor::new("sh", store, settings, "test-machine")
            .arg("-c")
            .arg(script)
            .arg("sh")
            .unit(UnitSpec::Jobs { kind: "slow".into() })
    }

    #[tokio::test]
    async fn silent_unit_is_restarted_and_its_claims_released() {
        let graph = Definition::new().start(step::<Slow>()).unwrap().complete().unwrap();
        let orch = orchestrator(registry().pipeline("slow", graph), test_settings(0)).await;
        let id = orch.trigger("slow", &json!(null)).await.unwrap();

        let mut supervisor = shell(orch.store().clone(), supervisor_settings(300), "sleep 30");
        supervisor.start_all().await.unwrap();

        let first = supervisor.status().remove(0);
        assert_eq!(first.state, UnitState::Starting);
        let pid = first.pid.expect("spawned");

        // the unit claimed a job before going silent
        let identity = ProcessIdentity::new(pid, "test-machine");
        orch.store().claim_job("slow", &identity).await.unwrap().expect("claim");

        assert_eq!(supervisor.check().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(supervisor.check().await.unwrap(), 1);

        let restarted = supervisor.status().remove(0);
        assert_eq!(restarted.restarts, 1);
        assert_eq!(restarted.state, UnitState::Starting);
        assert_ne!(restarted.pid, Some(pid));

        let step = orch.store().steps(id).await.unwrap().remove(0);
        assert_eq!(step.status, StepStatus::Pending);

        supervisor.stop_all().await;
        assert_eq!(supervisor.status()[0].state, UnitState::Stopped);
    }

    #[tokio::test]
    async fn beating_unit_is_running() {
        let store = memory_store().await;
        let mut supervisor = shell(store.clone(), supervisor_settings(5_000), "sleep 30");
        supervisor.start_all().await.unwrap();

        let pid = supervisor.status()[0].pid.expect("spawned");
        store
            .beat(&ProcessIdentity::new(pid, "test-machine"))
            .await
            .unwrap();

        assert_eq!(supervisor.check().await.unwrap(), 0);
        assert_eq!(supervisor.status()[0].state, UnitState::Running);

        // ignores stdin, so it is killed after the timeout
        supervisor.stop_all().await;
        assert_eq!(supervisor.status()[0].state, UnitState::Stopped);
    }

    #[tokio::test]
    async fn closing_stdin_stops_unit() {
        let store = memory_store().await;
        let mut supervisor = shell(store, supervisor_settings(5_000), "cat > /dev/null");
        supervisor.start_all().await.unwrap();

        let started = tokio::time::Instant::now();
        supervisor.stop_all().await;

        assert_eq!(supervisor.status()[0].state, UnitState::Stopped);
        assert!(started.elapsed() < Duration::from_millis(300));
    }
}
