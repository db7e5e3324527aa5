//! Shared steps and helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use forkflow::{
    HaltNotice, Orchestrator, PipelineId, PipelineStatus, Registry, RegistryBuilder, Settings,
    SqliteStore, Step, StepContext, StepError, Store,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub async fn memory_store() -> Arc<SqliteStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    let store = SqliteStore::new(pool);
    store
        .run_migrations()
        .await
        .expect("Failed to run migrations");
    Arc::new(store)
}

/// Settings with immediate retries and short runner intervals.
pub fn test_settings(max_retry: u32) -> Settings {
    let mut settings = Settings::default();
    settings.machine_id = Some("test-machine".to_string());
    settings.defaults.max_retry = max_retry;
    settings.defaults.retry_delay_ms = 0;
    settings.defaults.polling_interval_ms = 10;
    settings.defaults.heartbeat_interval_ms = 50;
    settings.defaults.graceful_shutdown_timeout_ms = 500;
    settings.advancer.polling_interval_ms = 10;
    settings.advancer.heartbeat_interval_ms = 50;
    settings.advancer.graceful_shutdown_timeout_ms = 500;
    settings
}

pub async fn orchestrator(registry: RegistryBuilder, settings: Settings) -> Orchestrator {
    let store = memory_store().await;
    let registry = registry.build().expect("registry should build");
    Orchestrator::new(store, registry, settings)
}

/// Alternate job and advancer passes until neither finds work.
pub async fn drain(orchestrator: &Orchestrator, kind: &str) {
    let worker = orchestrator.job_worker(kind).expect("known kind");
    let advancer = orchestrator.advancer();
    for _ in 0..1_000 {
        let worked = worker.work_once().await.expect("job pass");
        let advanced = advancer.advance_next().await.expect("advance pass");
        if !worked && !advanced {
            return;
        }
    }
    panic!("pipeline did not settle");
}

pub async fn status(orchestrator: &Orchestrator, id: PipelineId) -> PipelineStatus {
    orchestrator
        .store()
        .pipeline(id)
        .await
        .expect("pipeline lookup")
        .expect("pipeline exists")
        .status
}

pub async fn wait_for_status(
    orchestrator: &Orchestrator,
    id: PipelineId,
    expected: PipelineStatus,
) -> PipelineStatus {
    for _ in 0..500 {
        let current = status(orchestrator, id).await;
        if current == expected {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    status(orchestrator, id).await
}

/// Output of the terminal step of a pipeline.
pub async fn last_output(orchestrator: &Orchestrator, id: PipelineId) -> serde_json::Value {
    let steps = orchestrator.store().steps(id).await.expect("steps");
    steps
        .last()
        .and_then(|s| s.output.clone())
        .expect("terminal step has output")
}

// Emits 1..=n
pub struct Numbers;

#[async_trait]
impl Step for Numbers {
    const NAME: &'static str = "Numbers";
    type Input = u32;
    type Output = Vec<i64>;

    async fn execute(&self, n: u32, _ctx: &StepContext) -> Result<Vec<i64>, StepError> {
        Ok((1..=i64::from(n)).collect())
    }
}

pub struct Square;

#[async_trait]
impl Step for Square {
    const NAME: &'static str = "Square";
    type Input = i64;
    type Output = i64;

    async fn execute(&self, n: i64, _ctx: &StepContext) -> Result<i64, StepError> {
        Ok(n * n)
    }
}

pub struct Sum;

#[async_trait]
impl Step for Sum {
    const NAME: &'static str = "Sum";
    type Input = Vec<i64>;
    type Output = i64;

    async fn execute(&self, values: Vec<i64>, _ctx: &StepContext) -> Result<i64, StepError> {
        Ok(values.iter().sum())
    }
}

pub struct Double;

#[async_trait]
impl Step for Double {
    const NAME: &'static str = "Double";
    type Input = i64;
    type Output = i64;

    async fn execute(&self, n: i64, _ctx: &StepContext) -> Result<i64, StepError> {
        Ok(n * 2)
    }
}

pub struct AddTen;

#[async_trait]
impl Step for AddTen {
    const NAME: &'static str = "AddTen";
    type Input = i64;
    type Output = i64;

    async fn execute(&self, n: i64, _ctx: &StepContext) -> Result<i64, StepError> {
        Ok(n + 10)
    }
}

pub struct Upper;

#[async_trait]
impl Step for Upper {
    const NAME: &'static str = "Upper";
    type Input = String;
    type Output = String;

    async fn execute(&self, s: String, _ctx: &StepContext) -> Result<String, StepError> {
        Ok(s.to_uppercase())
    }
}

pub struct Reverse;

#[async_trait]
impl Step for Reverse {
    const NAME: &'static str = "Reverse";
    type Input = String;
    type Output = String;

    async fn execute(&self, s: String, _ctx: &StepContext) -> Result<String, StepError> {
        Ok(s.chars().rev().collect())
    }
}

pub struct Join;

#[async_trait]
impl Step for Join {
    const NAME: &'static str = "Join";
    type Input = Vec<String>;
    type Output = String;

    async fn execute(&self, parts: Vec<String>, _ctx: &StepContext) -> Result<String, StepError> {
        Ok(parts.join("|"))
    }
}

/// Fails with a retryable error and counts its attempts.
#[derive(Clone, Default)]
pub struct Flaky {
    pub attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Step for Flaky {
    const NAME: &'static str = "Flaky";
    type Input = serde_json::Value;
    type Output = ();

    async fn execute(&self, _input: serde_json::Value, _ctx: &StepContext) -> Result<(), StepError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Err(StepError::retryable(anyhow::anyhow!(
            "upstream unavailable (attempt {attempt})"
        )))
    }
}

pub struct Broken;

#[async_trait]
impl Step for Broken {
    const NAME: &'static str = "Broken";
    type Input = serde_json::Value;
    type Output = ();

    async fn execute(&self, _input: serde_json::Value, _ctx: &StepContext) -> Result<(), StepError> {
        Err(StepError::permanent(anyhow::anyhow!("bad record")))
    }
}

pub struct Panics;

#[async_trait]
impl Step for Panics {
    const NAME: &'static str = "Panics";
    type Input = serde_json::Value;
    type Output = ();

    async fn execute(&self, _input: serde_json::Value, _ctx: &StepContext) -> Result<(), StepError> {
        panic!("step blew up");
    }
}

/// Sleeps long enough to outlive a short shutdown timeout.
pub struct Slow;

#[async_trait]
impl Step for Slow {
    const NAME: &'static str = "Slow";
    type Input = serde_json::Value;
    type Output = ();

    async fn execute(&self, _input: serde_json::Value, _ctx: &StepContext) -> Result<(), StepError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

/// Halt handler collecting every notice it receives.
#[derive(Clone, Default)]
pub struct HaltLog {
    pub notices: Arc<Mutex<Vec<HaltNotice>>>,
}

impl HaltLog {
    pub fn received(&self) -> Vec<HaltNotice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Step for HaltLog {
    const NAME: &'static str = "HaltLog";
    type Input = HaltNotice;
    type Output = ();

    async fn execute(&self, notice: HaltNotice, _ctx: &StepContext) -> Result<(), StepError> {
        self.notices.lock().unwrap().push(notice);
        Ok(())
    }
}

pub fn registry() -> RegistryBuilder {
    Registry::builder()
        .step(Numbers)
        .step(Square)
        .step(Sum)
        .step(Double)
        .step(AddTen)
        .step(Upper)
        .step(Reverse)
        .step(Join)
        .step(Broken)
        .step(Panics)
        .step(Slow)
}
