/// Run completion report
///
/// Lists every node's terminal state in declaration order. Failed nodes carry
/// their error message verbatim; all failures are aggregated rather than
/// stopping at the first.

use crate::runtime::scheduler::{ExecutionState, FailureReason};
use crate::workflow::types::Graph;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Final state of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: String,
    pub state: ExecutionState,
    /// Flagged as terminal sink
    pub terminal: bool,
    /// Human-readable failure message (verbatim for invocation failures)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// Values produced on each output port
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
}

/// Outcome of one Run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    /// Look up one node's entry by id
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn state(&self, id: &str) -> Option<ExecutionState> {
        self.node(id).map(|node| node.state)
    }

    pub fn completed(&self) -> Vec<&NodeReport> {
        self.nodes
            .iter()
            .filter(|node| node.state == ExecutionState::Completed)
            .collect()
    }

    /// Every failed node, in declaration order
    pub fn failures(&self) -> Vec<&NodeReport> {
        self.nodes
            .iter()
            .filter(|node| node.state == ExecutionState::Failed)
            .collect()
    }

    /// Whether every node completed
    ///
    /// A failed optional branch still makes the run unsuccessful here; use
    /// [`RunReport::failed_reachable_from_entry`] for the CLI's exit policy.
    pub fn is_success(&self) -> bool {
        self.failures().is_empty()
    }

    /// Failed nodes reachable from any entry point of `graph`
    pub fn failed_reachable_from_entry(&self, graph: &Graph) -> Vec<&NodeReport> {
        let reachable: HashSet<String> = graph
            .entry_points()
            .iter()
            .flat_map(|entry| graph.reachable_from(&entry.id))
            .collect();
        self.failures()
            .into_iter()
            .filter(|node| reachable.contains(&node.id))
            .collect()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} report", self.run_id)?;
        for node in &self.nodes {
            match &node.error {
                Some(error) => writeln!(f, "  {}: {} ({})", node.id, node.state, error)?,
                None => writeln!(f, "  {}: {}", node.id, node.state)?,
            }
        }
        let failures = self.failures().len();
        if failures == 0 {
            write!(f, "All {} node(s) completed", self.nodes.len())
        } else {
            write!(f, "{} of {} node(s) failed", failures, self.nodes.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{GraphDefinition, Node};

    fn report(nodes: Vec<NodeReport>) -> RunReport {
        RunReport {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            nodes,
        }
    }

    fn node(id: &str, state: ExecutionState, error: Option<&str>) -> NodeReport {
        NodeReport {
            id: id.to_string(),
            state,
            terminal: false,
            error: error.map(str::to_string),
            reason: error.map(|message| FailureReason::Invocation {
                message: message.to_string(),
            }),
            outputs: BTreeMap::new(),
        }
    }

    #[test]
    fn display_lists_every_node_with_verbatim_errors() {
        let report = report(vec![
            node("A", ExecutionState::Completed, None),
            node("C", ExecutionState::Failed, Some("Kling API returned 429")),
        ]);

        let text = report.to_string();
        assert!(text.contains("  A: Completed\n"));
        assert!(text.contains("  C: Failed (Kling API returned 429)\n"));
        assert!(text.ends_with("1 of 2 node(s) failed"));
    }

    #[test]
    fn failures_outside_entry_reachability_are_excluded() {
        let graph = GraphDefinition::new()
            .node(Node::new("src").with_output("o"))
            .node(Node::new("sink").with_input("i"))
            .node(Node::new("loop-a").with_optional_input("i").with_output("o"))
            .edge("src/o", "sink/i")
            .build()
            .unwrap();

        let report = report(vec![
            node("src", ExecutionState::Completed, None),
            node("sink", ExecutionState::Failed, Some("boom")),
            node("ghost", ExecutionState::Failed, Some("never declared")),
        ]);

        let failed: Vec<&str> = report
            .failed_reachable_from_entry(&graph)
            .iter()
            .map(|node| node.id.as_str())
            .collect();
        assert_eq!(failed, vec!["sink"]);
    }
}
