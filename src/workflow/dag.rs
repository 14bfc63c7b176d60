//! Workflow Definition
//!
//! Stages and their dependency edges are declared once, up front. Building
//! rejects duplicate stage names, unknown endpoints, self-edges and cycles.

use std::collections::{BTreeMap, VecDeque};

use super::stage::SharedStage;
use crate::config::DependencyConfig;
use crate::types::{CassandraError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub upstream: String,
    /// A failed mandatory upstream prevents the stage from starting
    pub mandatory: bool,
}

pub(crate) struct StageNode {
    pub(crate) stage: SharedStage,
    pub(crate) deps: Vec<Dependency>,
}

impl StageNode {
    pub(crate) fn name(&self) -> &str {
        self.stage.name()
    }
}

/// Validated DAG, stages kept in declaration order
pub struct Workflow {
    pub(crate) nodes: Vec<StageNode>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let edges: Vec<String> = self
            .nodes
            .iter()
            .flat_map(|n| {
                n.deps.iter().map(move |d| {
                    format!(
                        "{} -> {}{}",
                        d.upstream,
                        n.name(),
                        if d.mandatory { "" } else { " (optional)" }
                    )
                })
            })
            .collect();
        f.debug_struct("Workflow")
            .field("stages", &self.stage_names())
            .field("edges", &edges)
            .finish()
    }
}

impl Workflow {
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::default()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name().to_string()).collect()
    }

    pub fn dependencies(&self, stage: &str) -> Option<&[Dependency]> {
        self.nodes
            .iter()
            .find(|n| n.name() == stage)
            .map(|n| n.deps.as_slice())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Default)]
pub struct WorkflowBuilder {
    stages: Vec<SharedStage>,
    /// (downstream, dependency) in declaration order
    edges: Vec<(String, Dependency)>,
}

impl WorkflowBuilder {
    pub fn stage(mut self, stage: SharedStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Declare `downstream` depends on `upstream`
    pub fn edge(mut self, upstream: &str, downstream: &str, mandatory: bool) -> Self {
        self.set_edge(upstream, downstream, mandatory);
        self
    }

    /// Apply configured overrides: flip an existing edge's flag or add a new edge
    pub fn overrides(mut self, deps: &[DependencyConfig]) -> Self {
        for dep in deps {
            self.set_edge(&dep.upstream, &dep.stage, dep.mandatory);
        }
        self
    }

    fn set_edge(&mut self, upstream: &str, downstream: &str, mandatory: bool) {
        if let Some((_, existing)) = self
            .edges
            .iter_mut()
            .find(|(down, d)| down == downstream && d.upstream == upstream)
        {
            existing.mandatory = mandatory;
            return;
        }
        self.edges.push((
            downstream.to_string(),
            Dependency {
                upstream: upstream.to_string(),
                mandatory,
            },
        ));
    }

    pub fn build(self) -> Result<Workflow> {
        let mut index: BTreeMap<String, usize> = BTreeMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if index.insert(stage.name().to_string(), i).is_some() {
                return Err(CassandraError::Workflow(format!(
                    "duplicate stage name '{}'",
                    stage.name()
                )));
            }
        }

        let mut deps: Vec<Vec<Dependency>> = vec![Vec::new(); self.stages.len()];
        for (downstream, dep) in self.edges {
            let Some(&down) = index.get(&downstream) else {
                return Err(CassandraError::Workflow(format!(
                    "dependency declared for unknown stage '{}'",
                    downstream
                )));
            };
            if !index.contains_key(&dep.upstream) {
                return Err(CassandraError::Workflow(format!(
                    "stage '{}' depends on unknown stage '{}'",
                    downstream, dep.upstream
                )));
            }
            if dep.upstream == downstream {
                return Err(CassandraError::Workflow(format!(
                    "stage '{}' depends on itself",
                    downstream
                )));
            }
            deps[down].push(dep);
        }

        detect_cycle(&self.stages, &deps, &index)?;

        Ok(Workflow {
            nodes: self
                .stages
                .into_iter()
                .zip(deps)
                .map(|(stage, deps)| StageNode { stage, deps })
                .collect(),
        })
    }
}

/// Kahn's algorithm; any stage left unvisited sits on a cycle
fn detect_cycle(
    stages: &[SharedStage],
    deps: &[Vec<Dependency>],
    index: &BTreeMap<String, usize>,
) -> Result<()> {
    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (down, node_deps) in deps.iter().enumerate() {
        for dep in node_deps {
            if let Some(&up) = index.get(&dep.upstream) {
                dependents[up].push(down);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;
    while let Some(i) = queue.pop_front() {
        visited += 1;
        for &down in &dependents[i] {
            in_degree[down] -= 1;
            if in_degree[down] == 0 {
                queue.push_back(down);
            }
        }
    }

    if visited == stages.len() {
        return Ok(());
    }
    let cyclic: Vec<&str> = (0..stages.len())
        .filter(|&i| in_degree[i] > 0)
        .map(|i| stages[i].name())
        .collect();
    Err(CassandraError::Workflow(format!(
        "dependency cycle among stages: {}",
        cyclic.join(", ")
    )))
}
