//! Validated step dependency graph with topological layering.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. All
//! structural problems (duplicates, unknown references, cycles) surface from
//! `Dag::build`, never at execution time. Layers group steps by dependency
//! depth; `ready_steps` answers which pending steps may be dispatched now.

use std::collections::{BTreeMap, HashMap, HashSet};

use dagent_types::workflow::{DependencyMode, StepDefinition, StepStatus, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::WorkflowError;
use super::expression::Template;
use super::state::StepStates;

/// Name used when a DAG is built without a workflow definition.
pub const DEFAULT_WORKFLOW_NAME: &str = "workflow";

// ---------------------------------------------------------------------------
// Dag
// ---------------------------------------------------------------------------

/// An acyclic set of steps whose dependencies all resolve.
#[derive(Debug, Clone)]
pub struct Dag {
    name: String,
    steps: Vec<StepDefinition>,
    index: HashMap<String, usize>,
    layers: Vec<Vec<usize>>,
    outputs: BTreeMap<String, String>,
}

impl Dag {
    /// Validate `steps` and build the graph.
    ///
    /// Rejects empty or duplicate names, zero timeouts, self-dependencies,
    /// unknown dependencies, cycles and two output fields sharing one alias.
    pub fn build(steps: Vec<StepDefinition>) -> Result<Self, WorkflowError> {
        let mut index: HashMap<String, usize> = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "step #{} has an empty name",
                    i + 1
                )));
            }
            if index.insert(step.name.clone(), i).is_some() {
                return Err(WorkflowError::DuplicateStep(step.name.clone()));
            }
        }

        for step in &steps {
            if step.timeout_ms == Some(0) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' has a zero timeout",
                    step.name
                )));
            }
            let mut aliases = HashSet::new();
            for alias in step.output_bindings.values() {
                if !aliases.insert(alias.as_str()) {
                    return Err(WorkflowError::ValidationError(format!(
                        "step '{}' binds more than one output to alias '{}'",
                        step.name, alias
                    )));
                }
            }
        }

        // Edge from dependency -> dependent
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..steps.len()).map(|i| graph.add_node(i)).collect();

        for (to, step) in steps.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &step.depends_on {
                if dep == &step.name {
                    return Err(WorkflowError::SelfDependency(step.name.clone()));
                }
                let from = *index.get(dep.as_str()).ok_or_else(|| WorkflowError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                })?;
                if seen.insert(from) {
                    graph.add_edge(nodes[from], nodes[to], ());
                }
            }
        }

        // Topological sort -- detects cycles
        let sorted = toposort(&graph, None).map_err(|cycle| {
            let step = &steps[graph[cycle.node_id()]].name;
            WorkflowError::CycleDetected(format!("cycle detected involving step '{step}'"))
        })?;

        // Depth: roots are 0, everything else is one past its deepest dependency
        let mut depths = vec![0usize; steps.len()];
        for node in sorted {
            let i = graph[node];
            depths[i] = steps[i]
                .depends_on
                .iter()
                .filter_map(|dep| index.get(dep.as_str()))
                .map(|&d| depths[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let layer_count = depths.iter().copied().max().map_or(0, |d| d + 1);
        let mut layers = vec![Vec::new(); layer_count];
        for (i, depth) in depths.iter().enumerate() {
            layers[*depth].push(i);
        }

        Ok(Self {
            name: DEFAULT_WORKFLOW_NAME.to_string(),
            steps,
            index,
            layers,
            outputs: BTreeMap::new(),
        })
    }

    /// Build from a workflow definition, carrying its name and declared outputs.
    pub fn from_definition(def: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        Self::build(def.steps.clone())?
            .named(def.name.clone())
            .with_outputs(def.outputs.clone())
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Declare workflow outputs: output name -> expression.
    ///
    /// Expressions are syntax-checked here; resolution happens after the run.
    pub fn with_outputs(mut self, outputs: BTreeMap<String, String>) -> Result<Self, WorkflowError> {
        for (name, expression) in &outputs {
            Template::parse(expression).map_err(|e| {
                WorkflowError::ExpressionError(format!("workflow output '{name}': {e}"))
            })?;
        }
        self.outputs = outputs;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    pub fn outputs(&self) -> &BTreeMap<String, String> {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps grouped by dependency depth; index 0 holds the entry points.
    ///
    /// Layers bound the available parallelism. They are not an execution
    /// order beyond "dependencies before dependents".
    pub fn layers(&self) -> Vec<Vec<&StepDefinition>> {
        self.layers
            .iter()
            .map(|layer| layer.iter().map(|&i| &self.steps[i]).collect())
            .collect()
    }

    /// Pending steps whose dependencies are all satisfied, in declaration order.
    ///
    /// A dependency is satisfied when it succeeded, or when it was skipped
    /// and the dependent opted into `DependencyMode::SucceededOrSkipped`.
    pub fn ready_steps(&self, states: &StepStates) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|step| states.status(&step.name) == Some(StepStatus::Pending))
            .filter(|step| {
                step.depends_on
                    .iter()
                    .all(|dep| dependency_satisfied(step.dependency_mode, states.status(dep)))
            })
            .map(|step| step.name.as_str())
            .collect()
    }

    /// Pending steps that can never become ready, with the dependency that
    /// blocks each one.
    ///
    /// Call repeatedly after marking the returned steps skipped to propagate
    /// through the whole sub-tree.
    pub fn blocked_steps(&self, states: &StepStates) -> Vec<(&str, &str)> {
        self.steps
            .iter()
            .filter(|step| states.status(&step.name) == Some(StepStatus::Pending))
            .filter_map(|step| {
                step.depends_on
                    .iter()
                    .find(|dep| dependency_blocks(step.dependency_mode, states.status(dep)))
                    .map(|dep| (step.name.as_str(), dep.as_str()))
            })
            .collect()
    }
}

fn dependency_satisfied(mode: DependencyMode, status: Option<StepStatus>) -> bool {
    match (mode, status) {
        (_, Some(StepStatus::Succeeded)) => true,
        (DependencyMode::SucceededOrSkipped, Some(StepStatus::Skipped)) => true,
        _ => false,
    }
}

fn dependency_blocks(mode: DependencyMode, status: Option<StepStatus>) -> bool {
    match status {
        Some(StepStatus::Failed | StepStatus::Cancelled) => true,
        Some(StepStatus::Skipped) => mode == DependencyMode::AllSucceeded,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
