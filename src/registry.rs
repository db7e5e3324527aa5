//! Type-erased step registry for runtime dispatch.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::definition::DefinitionError;
use crate::graph::Graph;
use crate::step::{HaltNotice, Step, StepContext, StepError};
use crate::store::{JobFailure, Store};

/// Type-erased step that can be stored in a registry.
#[async_trait]
pub trait ErasedStep: Send + Sync {
    /// Step-type identifier.
    fn name(&self) -> &'static str;

    /// Run the step with JSON input, returning JSON output.
    async fn run_erased(
        &self,
        input: serde_json::Value,
        ctx: &StepContext,
    ) -> Result<serde_json::Value, StepError>;
}

/// Wrapper that implements ErasedStep for a concrete Step.
struct StepWrapper<S>(S);

#[async_trait]
impl<S: Step> ErasedStep for StepWrapper<S> {
    fn name(&self) -> &'static str {
        S::NAME
    }

    async fn run_erased(
        &self,
        input: serde_json::Value,
        ctx: &StepContext,
    ) -> Result<serde_json::Value, StepError> {
        // Input that does not fit the step's type will not fit on retry either.
        let typed_input: S::Input = serde_json::from_value(input).map_err(|e| {
            StepError::permanent(anyhow::anyhow!("invalid input for {}: {e}", S::NAME))
        })?;

        let output = self.0.execute(typed_input, ctx).await?;

        serde_json::to_value(output).map_err(|e| {
            StepError::permanent(anyhow::anyhow!("unserializable output of {}: {e}", S::NAME))
        })
    }
}

/// A failed invocation, classified for the retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub retryable: bool,
    pub failure: JobFailure,
}

impl Fault {
    fn from_step_error(err: &StepError) -> Self {
        let source = err.cause();
        Self {
            retryable: err.is_retryable(),
            failure: JobFailure {
                error_type: err.kind().to_string(),
                error_message: source.to_string(),
                error_trace: Some(format!("{source:?}")),
            },
        }
    }

    fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "step panicked".to_string());
        Self {
            retryable: true,
            failure: JobFailure {
                error_type: "panic".to_string(),
                error_message: message,
                error_trace: None,
            },
        }
    }
}

/// Run a step, turning errors and panics into a [`Fault`].
pub async fn invoke(
    step: &dyn ErasedStep,
    input: serde_json::Value,
    ctx: &StepContext,
) -> Result<serde_json::Value, Fault> {
    match AssertUnwindSafe(step.run_erased(input, ctx))
        .catch_unwind()
        .await
    {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(Fault::from_step_error(&err)),
        Err(payload) => Err(Fault::from_panic(payload)),
    }
}

/// A registered pipeline kind and its compiled graph.
#[derive(Debug, Clone)]
pub struct PipelineKind {
    pub name: String,
    pub graph: Graph,
    /// Canonical JSON of `graph`, persisted on every triggered pipeline.
    pub definition: String,
    pub hash: String,
}

/// Builder collecting steps and pipeline kinds.
#[derive(Default)]
pub struct RegistryBuilder {
    steps: HashMap<&'static str, Arc<dyn ErasedStep>>,
    pipelines: Vec<(String, Graph)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step implementation under `S::NAME`.
    ///
    /// Registering the same name twice keeps the last one.
    pub fn step<S: Step>(mut self, step: S) -> Self {
        self.steps.insert(S::NAME, Arc::new(StepWrapper(step)));
        self
    }

    /// Register a pipeline kind.
    pub fn pipeline(mut self, kind: impl Into<String>, graph: Graph) -> Self {
        self.pipelines.push((kind.into(), graph));
        self
    }

    /// Validate every graph against the registered steps.
    pub fn build(self) -> Result<Registry, DefinitionError> {
        let mut pipelines = HashMap::new();
        for (name, graph) in self.pipelines {
            if pipelines.contains_key(&name) {
                return Err(DefinitionError::DuplicateKind(name));
            }
            graph.validate()?;

            let missing: Vec<String> = graph
                .step_types()
                .into_iter()
                .filter(|t| !self.steps.contains_key(t))
                .map(str::to_string)
                .collect();
            if !missing.is_empty() {
                return Err(DefinitionError::UnregisteredSteps {
                    kind: name,
                    steps: missing,
                });
            }

            let definition = graph
                .to_json()
                .map_err(|e| DefinitionError::Encoding(e.to_string()))?;
            let hash = crate::graph::hash_definition(&definition);
            pipelines.insert(
                name.clone(),
                PipelineKind {
                    name,
                    graph,
                    definition,
                    hash,
                },
            );
        }

        Ok(Registry {
            steps: self.steps,
            pipelines,
        })
    }
}

/// Lookup of step implementations and pipeline kinds.
pub struct Registry {
    steps: HashMap<&'static str, Arc<dyn ErasedStep>>,
    pipelines: HashMap<String, PipelineKind>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn step(&self, step_type: &str) -> Option<Arc<dyn ErasedStep>> {
        self.steps.get(step_type).cloned()
    }

    pub fn pipeline(&self, kind: &str) -> Option<&PipelineKind> {
        self.pipelines.get(kind)
    }

    /// Registered pipeline kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Run a pipeline's halt handler. Failures are logged, never retried.
    pub async fn notify_halt(&self, store: Arc<dyn Store>, handler: &str, notice: HaltNotice) {
        let Some(step) = self.step(handler) else {
            warn!(
                pipeline_id = %notice.pipeline_id,
                handler,
                "halt handler is not registered"
            );
            return;
        };

        let input = match serde_json::to_value(&notice) {
            Ok(input) => input,
            Err(e) => {
                error!(pipeline_id = %notice.pipeline_id, error = %e, "failed to encode halt notice");
                return;
            }
        };

        let ctx = StepContext::new(notice.pipeline_id, None, store);
        match invoke(step.as_ref(), input, &ctx).await {
            Ok(_) => info!(pipeline_id = %notice.pipeline_id, handler, "halt handler completed"),
            Err(fault) => error!(
                pipeline_id = %notice.pipeline_id,
                handler,
                error_type = %fault.failure.error_type,
                error = %fault.failure.error_message,
                "halt handler failed"
            ),
        }
    }
}
