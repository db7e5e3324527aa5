//! User step logic: the `Step` trait, its errors and its pipeline context.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::store::{PipelineId, StepId, Store, StoreError};

/// Failure reported by a step.
///
/// Only `Retryable` failures consume the retry budget. A `Permanent` failure
/// halts the pipeline on the spot.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl StepError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Recorded as the result's `error_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Retryable(_) => "retryable",
            Self::Permanent(_) => "permanent",
        }
    }

    pub fn cause(&self) -> &anyhow::Error {
        match self {
            Self::Retryable(e) | Self::Permanent(e) => e,
        }
    }
}

/// A unit of user logic bound to one node type of a pipeline graph.
///
/// `NAME` is the step-type identifier used in node ids and in the registry,
/// so it must be unique per registry and must not contain `.` or whitespace.
#[async_trait]
pub trait Step: Send + Sync + 'static {
    /// Step-type identifier.
    const NAME: &'static str;

    /// The input this step is triggered with.
    type Input: DeserializeOwned + Send;

    /// The output handed to successor steps.
    type Output: Serialize + Send;

    /// Execute the step with the given input.
    async fn execute(&self, input: Self::Input, ctx: &StepContext)
        -> Result<Self::Output, StepError>;
}

/// Input handed to a pipeline's halt handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltNotice {
    pub pipeline_id: PipelineId,
    pub kind: String,
    pub step_type: String,
    pub error_type: String,
    pub error_message: String,
    pub error_trace: Option<String>,
}

/// Handle given to a running step: identity plus the pipeline-scoped
/// key/value context.
#[derive(Clone)]
pub struct StepContext {
    pipeline_id: PipelineId,
    step_id: Option<StepId>,
    store: Arc<dyn Store>,
}

impl StepContext {
    pub fn new(pipeline_id: PipelineId, step_id: Option<StepId>, store: Arc<dyn Store>) -> Self {
        Self {
            pipeline_id,
            step_id,
            store,
        }
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// `None` when running as a halt handler.
    pub fn step_id(&self) -> Option<StepId> {
        self.step_id
    }

    /// Read a context value set earlier in this pipeline.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get_tuple(self.pipeline_id, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Set a context value once; fails with [`StoreError::TupleExists`] if
    /// the key is already present.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.store
            .set_tuple(self.pipeline_id, key, value, false)
            .await
    }

    /// Set a context value, replacing any previous one.
    pub async fn overwrite<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.store.set_tuple(self.pipeline_id, key, value, true).await
    }
}
