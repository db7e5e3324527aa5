//! # Forkflow
//!
//! Durable graph pipelines coordinated through a shared SQL store.
//!
//! A pipeline is a graph of steps declared with a small fluent DSL. Steps can
//! run in sequence, fan out to fixed siblings or to one instance per element
//! of a previous output, and join back together. Every transition is persisted,
//! so any number of processes can cooperate on the same pipelines and a
//! crashed process loses nothing but the attempt it was running.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use forkflow::{step, Definition, Orchestrator, Registry, Settings, SqliteStore};
//!
//! let graph = Definition::new()
//!     .start(step::<FetchFeed>())?
//!     .expand(step::<FetchArticle>())?
//!     .collapse(step::<BuildDigest>())?
//!     .on_halt(step::<AlertOps>())?
//!     .complete()?;
//!
//! let registry = Registry::builder()
//!     .step(FetchFeed)
//!     .step(FetchArticle)
//!     .step(BuildDigest)
//!     .step(AlertOps)
//!     .pipeline("digest", graph)
//!     .build()?;
//!
//! let store = SqliteStore::from_url("sqlite://forkflow.db?mode=rwc").await?;
//! let orchestrator = Orchestrator::new(Arc::new(store), registry, Settings::default());
//! orchestrator.trigger("digest", &feed_url).await?;
//! ```
//!
//! ## Moving parts
//!
//! - **Job workers** claim eligible attempts of one pipeline kind, run the
//!   step, and either hand the step to the advancer, schedule a retry, or
//!   halt the pipeline.
//! - **Advancers** claim pipelines whose finished steps are waiting and create
//!   the next steps from the graph.
//! - **Runners** host pools of either worker, with heartbeats and graceful
//!   shutdown; the **supervisor** restarts runner processes whose heartbeat
//!   goes stale.
//!
//! Steps run at least once. Make them idempotent.
//!
//! ## Feature Flags
//!
//! - `sqlite` (default) - SQLite-backed [`Store`]

pub mod advancer;
pub mod definition;
pub mod engine;
pub mod graph;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod settings;
pub mod step;
pub mod store;
pub mod supervisor;
pub mod unit;

pub use advancer::{plan_advance, AdvanceError, AdvancePlan, Advancer, NewStep, PlanOutcome};
pub use definition::{step, BranchId, Branches, Definition, DefinitionError, StepType};
pub use engine::{EngineError, JobOutcome, JobWorker};
pub use graph::{Graph, GraphDefect, Node, NodeId, Transition};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use registry::{PipelineKind, Registry, RegistryBuilder};
pub use retry::RetryPolicy;
pub use runner::{Runner, RunnerBuilder, RunnerError, RunnerHandle, Worker};
pub use settings::{Settings, SettingsError};
pub use step::{HaltNotice, Step, StepContext, StepError};
pub use store::{
    PipelineFilter, PipelineId, PipelineRecord, PipelineStatus, ProcessIdentity, StepId,
    StepRecord, StepStatus, Store, StoreError,
};
pub use supervisor::{Supervisor, SupervisorError, UnitSpec, UnitState};
pub use unit::{run_unit, UnitArgs, UnitError, UnitRole};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
