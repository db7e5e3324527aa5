//! Entry point wiring the store, registry and settings together.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::advancer::Advancer;
use crate::definition::DefinitionError;
use crate::engine::JobWorker;
use crate::graph::GraphDefect;
use crate::registry::Registry;
use crate::runner::Runner;
use crate::settings::Settings;
use crate::store::{NewPipeline, PipelineId, ProcessIdentity, Store, StoreError};
use crate::supervisor::{Supervisor, UnitSpec};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("unknown pipeline kind '{0}'")]
    UnknownKind(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to serialize pipeline input: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Shared handle to one deployment: store, registered pipelines and settings.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    settings: Arc<Settings>,
    identity: ProcessIdentity,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, registry: Registry, settings: Settings) -> Self {
        let identity = ProcessIdentity::current(settings.machine_id());
        Self {
            store,
            registry: Arc::new(registry),
            settings: Arc::new(settings),
            identity,
        }
    }

    /// Override the process identity used for claims and heartbeats.
    pub fn with_identity(mut self, identity: ProcessIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// Start a pipeline of `kind` with `input` as the start step's argument.
    pub async fn trigger<T: Serialize>(
        &self,
        kind: &str,
        input: &T,
    ) -> Result<PipelineId, OrchestratorError> {
        let pipeline = self
            .registry
            .pipeline(kind)
            .ok_or_else(|| OrchestratorError::UnknownKind(kind.to_string()))?;
        let (start_node, start) = pipeline
            .graph
            .start()
            .ok_or(DefinitionError::Malformed(GraphDefect::StartCount(0)))?;

        let id = self
            .store
            .trigger(NewPipeline {
                kind: pipeline.name.clone(),
                definition: pipeline.definition.clone(),
                definition_hash: pipeline.hash.clone(),
                start_node: start_node.clone(),
                start_step_type: start.step_type.clone(),
                input: serde_json::to_value(input)?,
            })
            .await?;

        info!(pipeline_id = %id, kind, "pipeline triggered");
        Ok(id)
    }

    pub fn job_worker(&self, kind: &str) -> Result<JobWorker, OrchestratorError> {
        if self.registry.pipeline(kind).is_none() {
            return Err(OrchestratorError::UnknownKind(kind.to_string()));
        }
        Ok(JobWorker::new(
            self.store.clone(),
            self.registry.clone(),
            self.settings.clone(),
            kind,
            self.identity.clone(),
        ))
    }

    pub fn advancer(&self) -> Advancer {
        Advancer::new(self.store.clone(), self.registry.clone(), self.settings.clone())
    }

    /// Runner hosting the configured number of job workers for `kind`.
    pub fn job_runner(&self, kind: &str) -> Result<Runner, OrchestratorError> {
        let worker = self.job_worker(kind)?;
        Ok(Runner::builder(format!("jobs:{kind}"), self.store.clone(), self.identity.clone())
            .workers(worker, self.settings.job_threads(kind))
            .poll_interval(self.settings.job_polling_interval(kind))
            .heartbeat_interval(self.settings.job_heartbeat_interval())
            .shutdown_timeout(self.settings.job_shutdown_timeout(kind))
            .build())
    }

    /// Runner hosting the configured number of advancer workers.
    pub fn advancer_runner(&self) -> Runner {
        Runner::builder("advancer", self.store.clone(), self.identity.clone())
            .workers(self.advancer(), self.settings.advancer.threads.max(1))
            .poll_interval(self.settings.advancer_polling_interval())
            .heartbeat_interval(self.settings.advancer_heartbeat_interval())
            .shutdown_timeout(self.settings.advancer_shutdown_timeout())
            .build()
    }

    /// Supervisor managing one advancer unit and one job unit per kind,
    /// each spawned as `program <unit args>`.
    pub fn supervisor(&self, program: impl Into<PathBuf>) -> Supervisor {
        let mut supervisor = Supervisor::new(
            program,
            self.store.clone(),
            self.settings.clone(),
            self.identity.machine_id.clone(),
        )
        .unit(UnitSpec::Advancer);
        for kind in self.registry.kinds() {
            supervisor = supervisor.unit(UnitSpec::Jobs {
                kind: kind.to_string(),
            });
        }
        supervisor
    }
}
