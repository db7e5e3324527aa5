use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::graph::{NodeId, Transition};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Unique identifier for a pipeline.
    PipelineId
);
record_id!(
    /// Unique identifier for a step.
    StepId
);
record_id!(JobId);
record_id!(ExecutionId);
record_id!(AvailabilityId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    InProgress,
    Halted,
    Completed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Halted => "halted",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "halted" => Some(Self::Halted),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    /// Job succeeded; waiting to be folded into the graph by the advancer.
    Advancing,
    Failed,
    Completed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Advancing => "advancing",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "advancing" => Some(Self::Advancing),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Still owned by the job engine.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Success,
    Failure,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

/// Liveness identity of one OS process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub machine_id: String,
}

impl ProcessIdentity {
    pub fn new(pid: u32, machine_id: impl Into<String>) -> Self {
        Self {
            pid,
            machine_id: machine_id.into(),
        }
    }

    /// Identity of the calling process.
    pub fn current(machine_id: impl Into<String>) -> Self {
        Self::new(std::process::id(), machine_id)
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.machine_id, self.pid)
    }
}

/// A pipeline row.
#[derive(Debug, Clone)]
pub struct PipelineRecord {
    pub id: PipelineId,
    pub kind: String,
    pub status: PipelineStatus,
    /// Serialized [`Graph`](crate::Graph).
    pub definition: String,
    pub definition_hash: String,
    pub triggered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_advanced_at: Option<DateTime<Utc>>,
    pub claimed_for_advancing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A step row joined with its (1:1) job.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: StepId,
    pub pipeline_id: PipelineId,
    pub node_id: NodeId,
    pub step_type: String,
    pub status: StepStatus,
    pub transition: Transition,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub job_id: JobId,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub owner: Option<ProcessIdentity>,
}

#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub execution_id: ExecutionId,
    pub result_type: ResultType,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
}

/// Everything needed to create a pipeline and its start step.
#[derive(Debug, Clone)]
pub struct NewPipeline {
    pub kind: String,
    pub definition: String,
    pub definition_hash: String,
    pub start_node: NodeId,
    pub start_step_type: String,
    pub input: serde_json::Value,
}

/// A claimed unit of work.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub availability_id: AvailabilityId,
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub step_id: StepId,
    pub pipeline_id: PipelineId,
    pub kind: String,
    pub step_type: String,
    pub input: serde_json::Value,
    pub retry_count: u32,
}

/// Failure details recorded on a `failure` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub error_type: String,
    pub error_message: String,
    pub error_trace: Option<String>,
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Create the next execution, eligible from `eligible_at`.
    Retry { eligible_at: DateTime<Utc> },
    /// Fail the step and halt the pipeline.
    Halt,
}

/// Filter for [`Store::list_pipelines`](super::Store::list_pipelines).
#[derive(Debug, Clone)]
pub struct PipelineFilter {
    pub kind: Option<String>,
    pub status: Option<PipelineStatus>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for PipelineFilter {
    fn default() -> Self {
        Self {
            kind: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}
