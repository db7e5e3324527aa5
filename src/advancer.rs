//! Graph advancement.
//!
//! When a job succeeds its step becomes `advancing`. An advancer pass claims
//! one pipeline, folds its advancing steps into the graph, and commits the
//! result in a single store transaction:
//!
//! - `chain`: one successor step per advancing step, fed its output.
//! - `divide`: one step per sibling node, all fed the same output.
//! - `expand`: one step per element of the output sequence.
//! - `combine`: once every source group has settled, one step per aligned
//!   position across the groups, fed the outputs in branch order.
//! - `collapse`: once every expanded instance has settled, a single step fed
//!   all instance outputs in creation order.
//!
//! The pass itself ([`plan_advance`]) is pure; [`Advancer`] wraps it with the
//! claim/apply/release cycle.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::graph::{Graph, NodeId, Transition};
use crate::registry::Registry;
use crate::settings::Settings;
use crate::step::HaltNotice;
use crate::store::{PipelineId, PipelineRecord, StepId, StepRecord, StepStatus, Store, StoreError};

/// Error type for advancer passes.
#[derive(Error, Debug)]
pub enum AdvanceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("pipeline {pipeline} definition does not match its stored hash")]
    DefinitionMismatch { pipeline: PipelineId },

    #[error("pipeline {pipeline} definition is unreadable: {source}")]
    UnreadableDefinition {
        pipeline: PipelineId,
        #[source]
        source: serde_json::Error,
    },
}

/// A step to create during an advancer pass.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStep {
    pub node_id: NodeId,
    pub step_type: String,
    pub transition: Transition,
    pub input: Value,
}

/// Why an advancer pass halted its pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaltReason {
    /// Step type whose fan-out could not be honoured.
    pub step_type: String,
    pub error_type: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlanOutcome {
    #[default]
    Continue,
    Complete,
    Halt(HaltReason),
}

/// Everything one advancer pass changes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdvancePlan {
    /// Advancing steps to mark completed.
    pub completed: Vec<StepId>,
    pub spawn: Vec<NewStep>,
    pub outcome: PlanOutcome,
}

impl AdvancePlan {
    /// Nothing was advancing; the store must not be touched.
    pub fn is_noop(&self) -> bool {
        self.completed.is_empty() && self.spawn.is_empty() && self.outcome == PlanOutcome::Continue
    }
}

fn output_of(step: &StepRecord) -> Value {
    step.output.clone().unwrap_or(Value::Null)
}

fn spawn(node_id: &NodeId, step_type: &str, transition: Transition, input: Value) -> NewStep {
    NewStep {
        node_id: node_id.clone(),
        step_type: step_type.to_string(),
        transition,
        input,
    }
}

/// Compute one advancer pass over a pipeline's steps.
///
/// `max_depth` gives the fan-out limit of a target step type (`None` for
/// unlimited). Graph inconsistencies, such as a step on an unknown node,
/// are logged and skipped.
pub fn plan_advance<F>(graph: &Graph, steps: &[StepRecord], max_depth: F) -> AdvancePlan
where
    F: Fn(&str) -> Option<usize>,
{
    let advancing: Vec<&StepRecord> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Advancing)
        .collect();
    if advancing.is_empty() {
        return AdvancePlan::default();
    }

    let completed: Vec<StepId> = advancing.iter().map(|s| s.id).collect();
    let mut spawned = Vec::new();
    let mut joins: Vec<&NodeId> = Vec::new();
    let mut divided: HashMap<&NodeId, usize> = HashMap::new();

    for step in &advancing {
        let Some(node) = graph.node(&step.node_id) else {
            error!(step_id = %step.id, node = %step.node_id, "step refers to a node missing from the graph");
            continue;
        };

        for target in &node.to {
            let Some(next) = graph.node(target) else {
                error!(node = %step.node_id, target = %target, "edge targets a node missing from the graph");
                continue;
            };

            match next.transition {
                Transition::Chain => {
                    spawned.push(spawn(target, &next.step_type, Transition::Chain, output_of(step)));
                }
                Transition::Divide => {
                    let existing = steps.iter().filter(|s| &s.node_id == target).count();
                    let planned = divided.entry(target).or_insert(0);
                    if let Some(max) = max_depth(&next.step_type) {
                        if existing + *planned + 1 > max {
                            return halted(completed, &next.step_type, "max_depth_exceeded", format!(
                                "divide into {target} would exceed max depth {max}"
                            ));
                        }
                    }
                    *planned += 1;
                    spawned.push(spawn(target, &next.step_type, Transition::Divide, output_of(step)));
                }
                Transition::Expand => {
                    let Value::Array(items) = output_of(step) else {
                        return halted(completed, &next.step_type, "not_a_sequence", format!(
                            "output of {} feeding expand into {target} is not a sequence",
                            step.node_id
                        ));
                    };
                    if let Some(max) = max_depth(&next.step_type) {
                        if items.len() > max {
                            return halted(completed, &next.step_type, "max_depth_exceeded", format!(
                                "expand into {target} produced {} elements, max depth is {max}",
                                items.len()
                            ));
                        }
                    }
                    spawned.extend(
                        items
                            .into_iter()
                            .map(|item| spawn(target, &next.step_type, Transition::Expand, item)),
                    );
                }
                Transition::Combine | Transition::Collapse => {
                    if !joins.contains(&target) {
                        joins.push(target);
                    }
                }
                Transition::Start => {
                    error!(node = %step.node_id, target = %target, "edge leads back into the start node");
                }
            }
        }
    }

    for target in joins {
        if let Some(step) = plan_join(graph, steps, target) {
            spawned.extend(step);
        }
    }

    let in_flight = steps.iter().any(|s| s.status.is_in_flight());
    let outcome = if spawned.is_empty() && !in_flight {
        PlanOutcome::Complete
    } else {
        PlanOutcome::Continue
    };

    AdvancePlan {
        completed,
        spawn: spawned,
        outcome,
    }
}

fn halted(completed: Vec<StepId>, step_type: &str, error_type: &str, message: String) -> AdvancePlan {
    AdvancePlan {
        completed,
        spawn: Vec::new(),
        outcome: PlanOutcome::Halt(HaltReason {
            step_type: step_type.to_string(),
            error_type: error_type.to_string(),
            message,
        }),
    }
}

/// Join steps to create for a combine/collapse target, if its sources settled.
fn plan_join(graph: &Graph, steps: &[StepRecord], target: &NodeId) -> Option<Vec<NewStep>> {
    let node = graph.node(target)?;
    let settled = |s: &StepRecord| matches!(s.status, StepStatus::Advancing | StepStatus::Completed);

    let mut groups: Vec<Vec<&StepRecord>> = Vec::new();
    for source in graph.sources_of(target) {
        let group: Vec<&StepRecord> = steps.iter().filter(|s| &s.node_id == source).collect();
        if group.is_empty() || !group.iter().all(|s| settled(s)) {
            debug!(target = %target, source = %source, "join is waiting on its sources");
            return None;
        }
        groups.push(group);
    }
    if groups.is_empty() {
        return None;
    }

    let existing = steps.iter().filter(|s| &s.node_id == target).count();

    match node.transition {
        Transition::Combine => {
            let width = groups.iter().map(Vec::len).min().unwrap_or(0);
            Some(
                (existing..width)
                    .map(|position| {
                        let inputs = groups.iter().map(|g| output_of(g[position])).collect();
                        spawn(target, &node.step_type, Transition::Combine, Value::Array(inputs))
                    })
                    .collect(),
            )
        }
        Transition::Collapse => {
            if existing > 0 {
                return Some(Vec::new());
            }
            let mut instances: Vec<&StepRecord> = groups.into_iter().flatten().collect();
            instances.sort_by_key(|s| s.id);
            let inputs = instances.into_iter().map(output_of).collect();
            Some(vec![spawn(
                target,
                &node.step_type,
                Transition::Collapse,
                Value::Array(inputs),
            )])
        }
        other => {
            warn!(target = %target, transition = %other, "join planned for a non-join node");
            None
        }
    }
}

/// Claims pipelines with advancing steps and moves them forward.
#[derive(Clone)]
pub struct Advancer {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    settings: Arc<Settings>,
}

impl Advancer {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>, settings: Arc<Settings>) -> Self {
        Self {
            store,
            registry,
            settings,
        }
    }

    /// Claim and advance one pipeline.
    ///
    /// Returns `Ok(true)` if a pipeline was claimed. The claim is always
    /// released, even when the pass fails.
    pub async fn advance_next(&self) -> Result<bool, AdvanceError> {
        let lease = self.settings.advancer_claim_lease();
        let Some(pipeline) = self.store.claim_pipeline(lease).await? else {
            return Ok(false);
        };

        let result = self.advance(&pipeline).await;

        if let Err(e) = self.store.release_pipeline(pipeline.id).await {
            error!(pipeline_id = %pipeline.id, error = %e, "failed to release advancing claim");
        }

        result.map(|_| true)
    }

    /// Run one pass over an already-claimed pipeline.
    pub async fn advance(&self, pipeline: &PipelineRecord) -> Result<AdvancePlan, AdvanceError> {
        if crate::graph::hash_definition(&pipeline.definition) != pipeline.definition_hash {
            return Err(AdvanceError::DefinitionMismatch {
                pipeline: pipeline.id,
            });
        }
        let graph = Graph::from_json(&pipeline.definition).map_err(|source| {
            AdvanceError::UnreadableDefinition {
                pipeline: pipeline.id,
                source,
            }
        })?;

        let steps = self.store.steps(pipeline.id).await?;
        let plan = plan_advance(&graph, &steps, |step_type| {
            self.settings.max_depth(&pipeline.kind, step_type)
        });
        if plan.is_noop() {
            debug!(pipeline_id = %pipeline.id, "nothing to advance");
            return Ok(plan);
        }

        self.store.apply_advance(pipeline, &plan).await?;

        match &plan.outcome {
            PlanOutcome::Continue => debug!(
                pipeline_id = %pipeline.id,
                completed = plan.completed.len(),
                spawned = plan.spawn.len(),
                "pipeline advanced"
            ),
            PlanOutcome::Complete => info!(pipeline_id = %pipeline.id, kind = %pipeline.kind, "pipeline completed"),
            PlanOutcome::Halt(reason) => {
                warn!(
                    pipeline_id = %pipeline.id,
                    kind = %pipeline.kind,
                    error_type = %reason.error_type,
                    "pipeline halted: {}",
                    reason.message
                );
                if let Some(handler) = &graph.on_halt {
                    let notice = HaltNotice {
                        pipeline_id: pipeline.id,
                        kind: pipeline.kind.clone(),
                        step_type: reason.step_type.clone(),
                        error_type: reason.error_type.clone(),
                        error_message: reason.message.clone(),
                        error_trace: None,
                    };
                    self.registry
                        .notify_halt(self.store.clone(), handler, notice)
                        .await;
                }
            }
        }

        Ok(plan)
    }
}
