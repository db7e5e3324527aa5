//! Job engine: claims eligible work, runs the step, records the outcome.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::graph::Graph;
use crate::registry::{invoke, Fault, Registry};
use crate::settings::Settings;
use crate::step::{HaltNotice, StepContext};
use crate::store::{ClaimedJob, FailureDisposition, JobFailure, ProcessIdentity, Store, StoreError};

/// Error type for job engine operations.
///
/// Step failures never surface here; they are recorded as results.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Retrying { eligible_at: DateTime<Utc> },
    Halted,
}

/// Claims and executes jobs of one pipeline kind.
#[derive(Clone)]
pub struct JobWorker {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    settings: Arc<Settings>,
    kind: String,
    identity: ProcessIdentity,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<Registry>,
        settings: Arc<Settings>,
        kind: impl Into<String>,
        identity: ProcessIdentity,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            kind: kind.into(),
            identity,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// Claim the oldest eligible job of this worker's kind.
    ///
    /// Losing a claim race yields `Ok(None)`, same as having no work.
    pub async fn claim(&self) -> Result<Option<ClaimedJob>, EngineError> {
        Ok(self.store.claim_job(&self.kind, &self.identity).await?)
    }

    /// Execute a claimed job and persist its outcome.
    pub async fn execute(&self, job: ClaimedJob) -> Result<JobOutcome, EngineError> {
        debug!(
            pipeline_id = %job.pipeline_id,
            step_id = %job.step_id,
            step_type = %job.step_type,
            retry = job.retry_count,
            "executing job"
        );

        let ctx = StepContext::new(job.pipeline_id, Some(job.step_id), self.store.clone());
        let result = match self.registry.step(&job.step_type) {
            Some(step) => invoke(step.as_ref(), job.input.clone(), &ctx).await,
            None => Err(Fault {
                retryable: false,
                failure: JobFailure {
                    error_type: "unregistered_step".to_string(),
                    error_message: format!("no step registered as '{}'", job.step_type),
                    error_trace: None,
                },
            }),
        };

        match result {
            Ok(output) => {
                self.store.record_success(&job, &output).await?;
                info!(
                    pipeline_id = %job.pipeline_id,
                    step_id = %job.step_id,
                    step_type = %job.step_type,
                    "job succeeded"
                );
                Ok(JobOutcome::Succeeded)
            }
            Err(fault) => self.fail(job, fault).await,
        }
    }

    async fn fail(&self, job: ClaimedJob, fault: Fault) -> Result<JobOutcome, EngineError> {
        let policy = self.settings.retry_policy(&job.kind, &job.step_type);
        let retry_at = fault
            .retryable
            .then(|| policy.eligible_at(job.retry_count + 1, Utc::now()))
            .flatten();

        let disposition = match retry_at {
            Some(eligible_at) => FailureDisposition::Retry { eligible_at },
            None => FailureDisposition::Halt,
        };

        self.store
            .record_failure(&job, &fault.failure, &disposition)
            .await?;

        match disposition {
            FailureDisposition::Retry { eligible_at } => {
                warn!(
                    pipeline_id = %job.pipeline_id,
                    step_id = %job.step_id,
                    step_type = %job.step_type,
                    retry = job.retry_count + 1,
                    max_retries = policy.max_retries(),
                    eligible_at = %eligible_at,
                    error = %fault.failure.error_message,
                    "job failed, retry scheduled"
                );
                Ok(JobOutcome::Retrying { eligible_at })
            }
            FailureDisposition::Halt => {
                error!(
                    pipeline_id = %job.pipeline_id,
                    step_id = %job.step_id,
                    step_type = %job.step_type,
                    error_type = %fault.failure.error_type,
                    error = %fault.failure.error_message,
                    "job failed, pipeline halted"
                );
                self.run_halt_handler(&job, fault.failure).await;
                Ok(JobOutcome::Halted)
            }
        }
    }

    /// Invoke the halt handler recorded in the pipeline's persisted graph.
    async fn run_halt_handler(&self, job: &ClaimedJob, failure: JobFailure) {
        let handler = match self.store.pipeline(job.pipeline_id).await {
            Ok(Some(pipeline)) => match Graph::from_json(&pipeline.definition) {
                Ok(graph) => graph.on_halt,
                Err(e) => {
                    error!(pipeline_id = %job.pipeline_id, error = %e, "unreadable pipeline definition");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(pipeline_id = %job.pipeline_id, error = %e, "failed to load halted pipeline");
                None
            }
        };
        let Some(handler) = handler else {
            return;
        };

        let notice = HaltNotice {
            pipeline_id: job.pipeline_id,
            kind: job.kind.clone(),
            step_type: job.step_type.clone(),
            error_type: failure.error_type,
            error_message: failure.error_message,
            error_trace: failure.error_trace,
        };
        self.registry
            .notify_halt(self.store.clone(), &handler, notice)
            .await;
    }

    /// Claim and execute at most one job. Returns whether a job was found.
    pub async fn work_once(&self) -> Result<bool, EngineError> {
        match self.claim().await? {
            Some(job) => {
                self.execute(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
