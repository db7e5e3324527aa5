//! Runtime configuration.
//!
//! Settings deserialize from any serde format and can be overlaid from
//! environment variables:
//! - `FORKFLOW_DATABASE_URL`: store connection string
//! - `FORKFLOW_MACHINE_ID`: machine identifier used in heartbeats (default: hostname)
//! - `FORKFLOW_ADVANCER_THREADS`: advancer workers per runner (default: 1)
//! - `FORKFLOW_ADVANCER_POLL_INTERVAL_MS`: advancer idle sleep (default: 500)
//! - `FORKFLOW_JOB_THREADS`: job workers per pipeline kind (default: 2)
//! - `FORKFLOW_JOB_POLL_INTERVAL_MS`: job worker idle sleep (default: 1000)
//! - `FORKFLOW_MAX_RETRY`: global retry budget (default: 0)
//! - `FORKFLOW_RETRY_DELAY_MS`: delay before a retry becomes eligible (default: 5000)
//! - `FORKFLOW_MAX_DEPTH`: global fan-out limit, `-1` for unlimited (default: -1)
//! - `FORKFLOW_HEARTBEAT_TIMEOUT_MS`: staleness after which a unit is presumed dead (default: 30000)

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: String, value: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,
    pub machine_id: Option<String>,
    pub advancer: AdvancerSettings,
    pub supervisor: SupervisorSettings,
    /// Applies to every pipeline kind unless overridden.
    pub defaults: PipelineSettings,
    /// Overrides per pipeline kind.
    pub pipelines: HashMap<String, PipelineOverrides>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://forkflow.db?mode=rwc".to_string(),
            machine_id: None,
            advancer: AdvancerSettings::default(),
            supervisor: SupervisorSettings::default(),
            defaults: PipelineSettings::default(),
            pipelines: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdvancerSettings {
    pub threads: usize,
    pub polling_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub graceful_shutdown_timeout_ms: u64,
    /// Age after which an advancing claim is considered abandoned.
    pub claim_lease_ms: u64,
}

impl Default for AdvancerSettings {
    fn default() -> Self {
        Self {
            threads: 1,
            polling_interval_ms: 500,
            heartbeat_interval_ms: 5_000,
            graceful_shutdown_timeout_ms: 10_000,
            claim_lease_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub polling_interval_ms: u64,
    /// No heartbeat within this window means the unit is presumed dead.
    pub heartbeat_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            polling_interval_ms: 1_000,
            heartbeat_timeout_ms: 30_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub threads: usize,
    pub polling_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub graceful_shutdown_timeout_ms: u64,
    pub max_retry: u32,
    pub retry_delay_ms: u64,
    /// When set, retry delays double from `retry_delay_ms` up to this cap.
    pub retry_backoff_max_ms: Option<u64>,
    /// `-1` means unlimited.
    pub max_depth: i64,
    pub steps: HashMap<String, StepOverrides>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            threads: 2,
            polling_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            graceful_shutdown_timeout_ms: 10_000,
            max_retry: 0,
            retry_delay_ms: 5_000,
            retry_backoff_max_ms: None,
            max_depth: -1,
            steps: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineOverrides {
    pub threads: Option<usize>,
    pub polling_interval_ms: Option<u64>,
    pub graceful_shutdown_timeout_ms: Option<u64>,
    pub max_retry: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub max_depth: Option<i64>,
    pub steps: HashMap<String, StepOverrides>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StepOverrides {
    pub max_retry: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub max_depth: Option<i64>,
}

impl Settings {
    /// Defaults overlaid with `FORKFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::default().overlay(|var| std::env::var(var).ok())
    }

    /// Overlay values produced by `lookup` (keyed by environment variable name).
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("FORKFLOW_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(machine) = lookup("FORKFLOW_MACHINE_ID") {
            self.machine_id = Some(machine);
        }
        if let Some(v) = parse_var(&lookup, "FORKFLOW_ADVANCER_THREADS")? {
            self.advancer.threads = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKFLOW_ADVANCER_POLL_INTERVAL_MS")? {
            self.advancer.polling_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKFLOW_JOB_THREADS")? {
            self.defaults.threads = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKFLOW_JOB_POLL_INTERVAL_MS")? {
            self.defaults.polling_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKFLOW_MAX_RETRY")? {
            self.defaults.max_retry = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKFLOW_RETRY_DELAY_MS")? {
            self.defaults.retry_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKFLOW_MAX_DEPTH")? {
            self.defaults.max_depth = v;
        }
        if let Some(v) = parse_var(&lookup, "FORKFLOW_HEARTBEAT_TIMEOUT_MS")? {
            self.supervisor.heartbeat_timeout_ms = v;
        }
        Ok(self)
    }

    /// Configured machine id, else the host name.
    pub fn machine_id(&self) -> String {
        self.machine_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    fn overrides(&self, kind: &str) -> Option<&PipelineOverrides> {
        self.pipelines.get(kind)
    }

    /// Most specific override of a per-step limit: the pipeline's step
    /// entry, the pipeline itself, then the global step entry.
    fn step_override<T>(
        &self,
        kind: &str,
        step_type: &str,
        step: impl Fn(&StepOverrides) -> Option<T>,
        pipeline: impl Fn(&PipelineOverrides) -> Option<T>,
    ) -> Option<T> {
        let overrides = self.overrides(kind);
        overrides
            .and_then(|p| p.steps.get(step_type))
            .and_then(&step)
            .or_else(|| overrides.and_then(&pipeline))
            .or_else(|| self.defaults.steps.get(step_type).and_then(&step))
    }

    pub fn job_threads(&self, kind: &str) -> usize {
        self.overrides(kind)
            .and_then(|p| p.threads)
            .unwrap_or(self.defaults.threads)
            .max(1)
    }

    pub fn job_polling_interval(&self, kind: &str) -> Duration {
        Duration::from_millis(
            self.overrides(kind)
                .and_then(|p| p.polling_interval_ms)
                .unwrap_or(self.defaults.polling_interval_ms),
        )
    }

    pub fn job_shutdown_timeout(&self, kind: &str) -> Duration {
        Duration::from_millis(
            self.overrides(kind)
                .and_then(|p| p.graceful_shutdown_timeout_ms)
                .unwrap_or(self.defaults.graceful_shutdown_timeout_ms),
        )
    }

    pub fn job_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.defaults.heartbeat_interval_ms)
    }

    /// Maximum retries for a step: pipeline step override, pipeline, global
    /// step override, then global default.
    pub fn max_retry(&self, kind: &str, step_type: &str) -> u32 {
        self.step_override(kind, step_type, |s| s.max_retry, |p| p.max_retry)
            .unwrap_or(self.defaults.max_retry)
    }

    pub fn retry_delay(&self, kind: &str, step_type: &str) -> Duration {
        Duration::from_millis(
            self.step_override(kind, step_type, |s| s.retry_delay_ms, |p| p.retry_delay_ms)
                .unwrap_or(self.defaults.retry_delay_ms),
        )
    }

    /// Retry policy for a step of a pipeline kind.
    pub fn retry_policy(&self, kind: &str, step_type: &str) -> RetryPolicy {
        let max_retries = self.max_retry(kind, step_type);
        if max_retries == 0 {
            return RetryPolicy::None;
        }
        let delay = self.retry_delay(kind, step_type);
        match self.defaults.retry_backoff_max_ms {
            Some(cap) => RetryPolicy::Exponential {
                max_retries,
                initial_delay: delay,
                max_delay: Duration::from_millis(cap),
            },
            None => RetryPolicy::fixed(max_retries, delay),
        }
    }

    /// Fan-out limit for a target step type; `None` means unlimited.
    pub fn max_depth(&self, kind: &str, step_type: &str) -> Option<usize> {
        let depth = self
            .step_override(kind, step_type, |s| s.max_depth, |p| p.max_depth)
            .unwrap_or(self.defaults.max_depth);
        usize::try_from(depth).ok()
    }

    pub fn advancer_polling_interval(&self) -> Duration {
        Duration::from_millis(self.advancer.polling_interval_ms)
    }

    pub fn advancer_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.advancer.graceful_shutdown_timeout_ms)
    }

    pub fn advancer_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.advancer.heartbeat_interval_ms)
    }

    pub fn advancer_claim_lease(&self) -> Duration {
        Duration::from_millis(self.advancer.claim_lease_ms)
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SettingsError::InvalidValue {
                var: var.to_string(),
                value,
            }),
    }
}
