//! Persistent entities and the storage trait every worker coordinates through.

mod records;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use records::{
    AvailabilityId, ClaimedJob, ExecutionId, ExecutionRecord, FailureDisposition, JobFailure,
    JobId, NewPipeline, PipelineFilter, PipelineId, PipelineRecord, PipelineStatus,
    ProcessIdentity, ResultRecord, ResultType, StepId, StepRecord, StepStatus,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::advancer::AdvancePlan;

/// Error type for store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("context key '{key}' is already set for pipeline {pipeline}")]
    TupleExists { pipeline: PipelineId, key: String },

    #[error("pipeline {pipeline} is no longer claimed by this advancer pass")]
    ClaimLost { pipeline: PipelineId },

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Storage backend shared by every runner process.
///
/// Each method is one atomic transition: implementations must apply all of
/// its row changes in a single transaction, and claims must be conditional
/// single-row updates whose loss is reported as `Ok(None)`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a pipeline with its start step, job, execution and availability.
    async fn trigger(&self, pipeline: NewPipeline) -> Result<PipelineId, StoreError>;

    /// Claim the oldest eligible availability of a pipeline kind.
    async fn claim_job(
        &self,
        kind: &str,
        claimant: &ProcessIdentity,
    ) -> Result<Option<ClaimedJob>, StoreError>;

    /// Store the job's output and hand its step to the advancer.
    async fn record_success(
        &self,
        job: &ClaimedJob,
        output: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Record a failed attempt and either schedule a retry or halt.
    async fn record_failure(
        &self,
        job: &ClaimedJob,
        failure: &JobFailure,
        disposition: &FailureDisposition,
    ) -> Result<(), StoreError>;

    /// Claim the least recently advanced pipeline that is ready to advance.
    ///
    /// Claims older than `lease` are considered abandoned and may be taken over.
    async fn claim_pipeline(&self, lease: Duration) -> Result<Option<PipelineRecord>, StoreError>;

    /// Apply one advancer pass over a pipeline returned by `claim_pipeline`.
    ///
    /// Fails with [`StoreError::ClaimLost`] and changes nothing when the claim
    /// was taken over or a step in `plan.completed` is no longer advancing.
    async fn apply_advance(
        &self,
        pipeline: &PipelineRecord,
        plan: &AdvancePlan,
    ) -> Result<(), StoreError>;

    /// Drop the advancing claim and bump `last_advanced_at`.
    async fn release_pipeline(&self, pipeline: PipelineId) -> Result<(), StoreError>;

    async fn get_tuple(
        &self,
        pipeline: PipelineId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Set a context value; without `overwrite` an existing key is an error.
    async fn set_tuple(
        &self,
        pipeline: PipelineId,
        key: &str,
        value: serde_json::Value,
        overwrite: bool,
    ) -> Result<(), StoreError>;

    /// Create or refresh the heartbeat of a process.
    async fn beat(&self, process: &ProcessIdentity) -> Result<(), StoreError>;

    async fn heartbeat(
        &self,
        process: &ProcessIdentity,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn remove_heartbeat(&self, process: &ProcessIdentity) -> Result<(), StoreError>;

    /// Make unfinished availabilities claimed by `process` eligible again.
    async fn release_claims(&self, process: &ProcessIdentity) -> Result<usize, StoreError>;

    async fn pipeline(&self, id: PipelineId) -> Result<Option<PipelineRecord>, StoreError>;

    /// Steps of a pipeline joined with their jobs, in creation order.
    async fn steps(&self, pipeline: PipelineId) -> Result<Vec<StepRecord>, StoreError>;

    /// Executions of a step's job, oldest first.
    async fn executions(&self, step: StepId) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Results of a step's executions, oldest first.
    async fn results(&self, step: StepId) -> Result<Vec<ResultRecord>, StoreError>;

    /// Read-only listing, newest first.
    async fn list_pipelines(
        &self,
        filter: &PipelineFilter,
    ) -> Result<Vec<PipelineRecord>, StoreError>;
}
