//! The concrete, ordered stage graph for one orchestrator invocation.

use crate::core::{StageDefinition, WorkflowMode};
use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// A stage plus its resolved successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    /// The stage definition.
    pub stage: StageDefinition,
    /// Resolved successor; `None` is the terminal sentinel.
    pub next: Option<String>,
}

impl GraphNode {
    /// The stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.stage.name
    }
}

/// An ordered, acyclic list of stages with `next` pointers rewired around
/// disabled stages. Rebuilt on every run and never persisted; only its
/// [`GraphSnapshot`] is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageGraph {
    mode: WorkflowMode,
    nodes: Vec<GraphNode>,
    disabled: Vec<String>,
}

impl StageGraph {
    pub(crate) fn new(mode: WorkflowMode, nodes: Vec<GraphNode>, disabled: Vec<String>) -> Self {
        Self {
            mode,
            nodes,
            disabled,
        }
    }

    /// The workflow mode the graph was built for.
    #[must_use]
    pub fn mode(&self) -> WorkflowMode {
        self.mode
    }

    /// Nodes in execution order.
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Number of scheduled stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no stage is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a scheduled stage.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Returns true if the stage is scheduled.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Scheduled stage names in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.stage.name.clone()).collect()
    }

    /// Stages of the workflow mode removed because their flag is off.
    #[must_use]
    pub fn disabled(&self) -> &[String] {
        &self.disabled
    }

    /// The head of the graph.
    #[must_use]
    pub fn first(&self) -> Option<&GraphNode> {
        self.nodes.first()
    }

    /// SHA-256 over the mode and the ordered `(name, next)` pairs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.mode.as_str().as_bytes());
        hasher.update(b"\n");
        for node in &self.nodes {
            hasher.update(node.name().as_bytes());
            hasher.update(b"->");
            hasher.update(node.next.as_deref().unwrap_or("").as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Snapshot stored in the manifest to detect graph changes on resume.
    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            fingerprint: self.fingerprint(),
            stages: self.names(),
        }
    }

    /// Checks that every name of an explicit stage selection is scheduled.
    ///
    /// # Errors
    ///
    /// Returns an error listing the names that are not in the graph.
    pub fn validate_selection(&self, selection: &[String]) -> Result<(), ConfigurationError> {
        let unknown: Vec<&str> = selection
            .iter()
            .map(String::as_str)
            .filter(|name| !self.contains(name))
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        Err(ConfigurationError::new(format!(
            "requested stages are not part of the {} graph: {}",
            self.mode,
            unknown.join(", ")
        ))
        .with_stages(unknown)
        .with_fix_hint("Run `mediaflow list-stages` and check the job's stage flags."))
    }

    /// Walks the `next` pointers from the head and checks they visit every
    /// node exactly once, in order, ending at the terminal sentinel.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let mut seen = HashSet::new();
        let mut cursor = self.first().map(GraphNode::name);
        let mut visited = Vec::new();
        while let Some(name) = cursor {
            if !seen.insert(name) {
                return false;
            }
            let Some(node) = self.get(name) else {
                return false;
            };
            visited.push(name);
            cursor = node.next.as_deref();
        }
        visited.len() == self.nodes.len()
            && visited.iter().zip(&self.nodes).all(|(v, n)| *v == n.name())
    }
}

/// The persisted identity of a graph variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// [`StageGraph::fingerprint`].
    pub fingerprint: String,
    /// Scheduled stage names in order.
    pub stages: Vec<String>,
}

impl GraphSnapshot {
    /// Length of the longest common stage-order prefix with another snapshot.
    #[must_use]
    pub fn common_prefix_len(&self, other: &Self) -> usize {
        self.stages
            .iter()
            .zip(&other.stages)
            .take_while(|(a, b)| a == b)
            .count()
    }
}
