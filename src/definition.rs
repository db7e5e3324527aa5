//! Fluent builder compiling `start/chain/divide/combine/expand/collapse`
//! declarations into a [`Graph`].
//!
//! ```rust,ignore
//! use forkflow::{step, Definition};
//!
//! let graph = Definition::new()
//!     .start(step::<Fetch>())?
//!     .divide(&[step::<Resize>(), step::<Classify>()])?
//!     .combine(step::<Publish>())?
//!     .on_halt(step::<Alert>())?
//!     .complete()?;
//! ```
//!
//! Every node is named `"<StepType>.<stage>"` where the stage is the length of
//! the longest path from the start node, so a step type reused at different
//! depths yields distinct nodes while the same type declared twice at the same
//! depth collapses into one.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::graph::{Graph, GraphDefect, Node, NodeId, Transition};
use crate::step::Step;

/// Structural misuse of the definition builder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("start may only be called once")]
    AlreadyStarted,

    #[error("definition has not been started")]
    NotStarted,

    #[error("divide needs at least one target")]
    EmptyDivide,

    #[error("combine requires an open divide")]
    NoOpenDivide,

    #[error("collapse requires an open expand")]
    NoOpenExpand,

    #[error("ambiguous combine: the most recent open fan-out is an expand")]
    AmbiguousCombine,

    #[error("ambiguous collapse: the most recent open fan-out is a divide")]
    AmbiguousCollapse,

    #[error("invalid step argument(s): {}", .0.join(", "))]
    InvalidStep(Vec<String>),

    #[error("unknown branch index {0}")]
    UnknownBranch(usize),

    #[error("malformed graph: {0}")]
    Malformed(#[from] GraphDefect),

    #[error("pipeline '{kind}' references unregistered step(s): {}", .steps.join(", "))]
    UnregisteredSteps { kind: String, steps: Vec<String> },

    #[error("pipeline kind '{0}' registered twice")]
    DuplicateKind(String),

    #[error("failed to encode graph: {0}")]
    Encoding(String),
}

/// Reference to a step type used as a builder argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepType(String);

impl StepType {
    /// Descriptor for an implemented step.
    pub fn of<S: Step>() -> Self {
        Self(S::NAME.to_string())
    }

    /// Descriptor by identifier; validated when passed to a builder verb.
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.contains('.') && !self.0.chars().any(char::is_whitespace)
    }
}

/// Shorthand for [`StepType::of`].
pub fn step<S: Step>() -> StepType {
    StepType::of::<S>()
}

fn check_types<'a>(types: impl IntoIterator<Item = &'a StepType>) -> Result<(), DefinitionError> {
    let invalid: Vec<String> = types
        .into_iter()
        .filter(|t| !t.is_valid())
        .map(|t| format!("{:?}", t.0))
        .collect();
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(DefinitionError::InvalidStep(invalid))
    }
}

/// Index of a branch created by [`Definition::divide_with`].
pub type BranchId = usize;

/// An open fan-out. `origin` holds the nodes the enclosing divide's tips
/// point at while this fan-out is open; closing it moves them to the join.
#[derive(Debug, Clone)]
enum FanOut {
    Divide {
        origin: Vec<NodeId>,
        /// Tips of each divided branch, in listing order.
        tips: Vec<NodeId>,
    },
    Expand {
        origin: Vec<NodeId>,
    },
}

/// Pipeline definition under construction.
#[derive(Debug, Clone, Default)]
pub struct Definition {
    nodes: Vec<NodeId>,
    edges: BTreeMap<NodeId, Node>,
    on_halt: Option<String>,
    started: bool,
    current: Vec<NodeId>,
    open: Vec<FanOut>,
}

impl Definition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the entry step. Must be the first verb and used exactly once.
    pub fn start(mut self, step: StepType) -> Result<Self, DefinitionError> {
        check_types([&step])?;
        if self.started {
            return Err(DefinitionError::AlreadyStarted);
        }
        self.started = true;
        let id = self.attach(&[], step.name(), Transition::Start);
        self.current = vec![id];
        Ok(self)
    }

    /// Append a sequential step after every open node.
    pub fn chain(mut self, step: StepType) -> Result<Self, DefinitionError> {
        check_types([&step])?;
        self.require_started()?;
        let sources = std::mem::take(&mut self.current);
        let id = self.attach(&sources, step.name(), Transition::Chain);
        self.retarget_tips(&sources, &id);
        self.current = vec![id];
        Ok(self)
    }

    /// Fan out statically to one sibling per listed step type.
    pub fn divide(self, to: &[StepType]) -> Result<Self, DefinitionError> {
        self.divide_with(to, |_| Ok(()))
    }

    /// Like [`divide`](Self::divide), handing each new branch to `block` so it
    /// can be extended before the branches are combined.
    pub fn divide_with<F>(mut self, to: &[StepType], block: F) -> Result<Self, DefinitionError>
    where
        F: FnOnce(&mut Branches<'_>) -> Result<(), DefinitionError>,
    {
        check_types(to)?;
        self.require_started()?;
        if to.is_empty() {
            return Err(DefinitionError::EmptyDivide);
        }

        let sources = std::mem::take(&mut self.current);
        let stage = self.next_stage(&sources);
        let tips: Vec<NodeId> = to
            .iter()
            .map(|t| self.attach_at(&sources, t.name(), Transition::Divide, stage))
            .collect();

        let mut branches = Branches {
            definition: &mut self,
            tips,
        };
        block(&mut branches)?;
        let tips = branches.tips;

        self.current = dedup(&tips);
        self.open.push(FanOut::Divide {
            origin: sources,
            tips,
        });
        Ok(self)
    }

    /// Join every branch of the most recent divide into one step.
    pub fn combine(mut self, into: StepType) -> Result<Self, DefinitionError> {
        check_types([&into])?;
        self.require_started()?;
        let (origin, _) = self.close_divide()?;
        let sources = std::mem::take(&mut self.current);
        let id = self.attach(&sources, into.name(), Transition::Combine);
        self.retarget_tips(&origin, &id);
        self.current = vec![id];
        Ok(self)
    }

    /// Join only the listed branches of the most recent divide.
    pub fn combine_branches(
        mut self,
        branches: &[BranchId],
        into: StepType,
    ) -> Result<Self, DefinitionError> {
        check_types([&into])?;
        self.require_started()?;
        let (origin, tips) = self.close_divide()?;
        let mut sources = Vec::new();
        for &branch in branches {
            let tip = tips
                .get(branch)
                .ok_or(DefinitionError::UnknownBranch(branch))?;
            if !sources.contains(tip) {
                sources.push(tip.clone());
            }
        }
        let id = self.attach(&sources, into.name(), Transition::Combine);
        self.retarget_tips(&origin, &id);
        self.current = vec![id];
        Ok(self)
    }

    /// Fan out dynamically: one step per element of the predecessor's output.
    pub fn expand(mut self, to: StepType) -> Result<Self, DefinitionError> {
        check_types([&to])?;
        self.require_started()?;
        let sources = std::mem::take(&mut self.current);
        let id = self.attach(&sources, to.name(), Transition::Expand);
        self.retarget_tips(&sources, &id);
        self.open.push(FanOut::Expand {
            origin: vec![id.clone()],
        });
        self.current = vec![id];
        Ok(self)
    }

    /// Join every instance produced by the most recent expand.
    pub fn collapse(mut self, into: StepType) -> Result<Self, DefinitionError> {
        check_types([&into])?;
        self.require_started()?;
        let origin = match self.open.last() {
            None => return Err(DefinitionError::NoOpenExpand),
            Some(FanOut::Divide { .. }) => return Err(DefinitionError::AmbiguousCollapse),
            Some(FanOut::Expand { origin }) => origin.clone(),
        };
        self.open.pop();
        let sources = std::mem::take(&mut self.current);
        let id = self.attach(&sources, into.name(), Transition::Collapse);
        self.retarget_tips(&origin, &id);
        self.current = vec![id];
        Ok(self)
    }

    /// Register the step invoked when a pipeline of this graph halts.
    pub fn on_halt(mut self, handler: StepType) -> Result<Self, DefinitionError> {
        check_types([&handler])?;
        self.on_halt = Some(handler.0);
        Ok(self)
    }

    /// Finish the definition.
    pub fn complete(self) -> Result<Graph, DefinitionError> {
        self.require_started()?;
        let graph = Graph {
            nodes: self.nodes,
            edges: self.edges,
            on_halt: self.on_halt,
        };
        graph.validate()?;
        Ok(graph)
    }

    fn require_started(&self) -> Result<(), DefinitionError> {
        if self.started {
            Ok(())
        } else {
            Err(DefinitionError::NotStarted)
        }
    }

    /// Pop the innermost divide, returning its origin and branch tips.
    fn close_divide(&mut self) -> Result<(Vec<NodeId>, Vec<NodeId>), DefinitionError> {
        match self.open.last() {
            None => Err(DefinitionError::NoOpenDivide),
            Some(FanOut::Expand { .. }) => Err(DefinitionError::AmbiguousCombine),
            Some(FanOut::Divide { .. }) => match self.open.pop() {
                Some(FanOut::Divide { origin, tips }) => Ok((origin, tips)),
                _ => Err(DefinitionError::NoOpenDivide),
            },
        }
    }

    /// Keep the innermost open divide's branch tips in step with nodes added
    /// after them, including joins that close a nested fan-out.
    fn retarget_tips(&mut self, sources: &[NodeId], to: &NodeId) {
        if let Some(FanOut::Divide { tips, .. }) = self.open.last_mut() {
            for tip in tips.iter_mut() {
                if sources.contains(tip) {
                    *tip = to.clone();
                }
            }
        }
    }

    fn next_stage(&self, sources: &[NodeId]) -> usize {
        sources
            .iter()
            .map(|s| s.stage() + 1)
            .max()
            .unwrap_or(0)
    }

    fn attach(&mut self, sources: &[NodeId], step_type: &str, transition: Transition) -> NodeId {
        let stage = self.next_stage(sources);
        self.attach_at(sources, step_type, transition, stage)
    }

    fn attach_at(
        &mut self,
        sources: &[NodeId],
        step_type: &str,
        transition: Transition,
        stage: usize,
    ) -> NodeId {
        let id = NodeId::new(step_type, stage);
        if !self.edges.contains_key(&id) {
            self.edges.insert(
                id.clone(),
                Node {
                    to: Vec::new(),
                    transition,
                    step_type: step_type.to_string(),
                    from: Vec::new(),
                },
            );
            self.nodes.push(id.clone());
        }
        if matches!(transition, Transition::Combine | Transition::Collapse) {
            if let Some(node) = self.edges.get_mut(&id) {
                for source in sources {
                    if !node.from.contains(source) {
                        node.from.push(source.clone());
                    }
                }
            }
        }
        for source in sources {
            if let Some(node) = self.edges.get_mut(source) {
                if !node.to.contains(&id) {
                    node.to.push(id.clone());
                }
            }
        }
        id
    }
}

/// Per-branch sub-builders handed to a [`Definition::divide_with`] block.
pub struct Branches<'a> {
    definition: &'a mut Definition,
    tips: Vec<NodeId>,
}

impl Branches<'_> {
    pub fn len(&self) -> usize {
        self.tips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tips.is_empty()
    }

    /// Append a sequential step to one branch.
    pub fn chain(&mut self, branch: BranchId, step: StepType) -> Result<&mut Self, DefinitionError> {
        check_types([&step])?;
        let tip = self
            .tips
            .get(branch)
            .cloned()
            .ok_or(DefinitionError::UnknownBranch(branch))?;
        let id = self
            .definition
            .attach(std::slice::from_ref(&tip), step.name(), Transition::Chain);
        self.tips[branch] = id;
        Ok(self)
    }
}

fn dedup(ids: &[NodeId]) -> Vec<NodeId> {
    let mut out: Vec<NodeId> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}
