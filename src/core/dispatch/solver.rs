// src/core/dispatch/solver.rs

//! Solver-node resolution: which node owns the data a distributed request
//! needs. Only the master resolves; workers forward first.

use crate::core::SentraError;
use crate::core::dispatch::{AgentDirectory, ApiRequest};
use serde_json::Value;
use std::collections::BTreeMap;

/// The routing decision for one distributed request.
#[derive(Debug, Clone, PartialEq)]
pub enum SolverTarget {
    /// One node answers; run there.
    Node(String),
    /// Fan out: node name → the agent ids that node owns (possibly empty,
    /// meaning "ask the node without an id restriction").
    Fanout(BTreeMap<String, Vec<String>>),
}

/// Resolves the solver target for `request`, consulting the agent registry
/// once. Agents absent from the registry are attributed to the master so the
/// local execution surfaces their per-agent errors.
pub async fn get_solver_node(
    request: &mut ApiRequest,
    directory: &dyn AgentDirectory,
    master_name: &str,
) -> Result<SolverTarget, SentraError> {
    if let Some(agent_id) = request.arguments.get("agent_id").cloned() {
        match agent_id {
            Value::Array(ids) => {
                let ids: Vec<String> = ids
                    .iter()
                    .map(value_to_id)
                    .collect::<Result<_, _>>()?;
                let records = directory.agents_overview(Some(&ids)).await?;

                let mut by_node: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for record in &records {
                    by_node
                        .entry(record.node_name.clone())
                        .or_default()
                        .push(record.id.clone());
                }

                // Ids nobody claims go to the master, which reports them.
                let unknown: Vec<String> = ids
                    .iter()
                    .filter(|id| !records.iter().any(|r| &r.id == *id))
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    by_node
                        .entry(master_name.to_string())
                        .or_default()
                        .extend(unknown);
                }

                Ok(SolverTarget::Fanout(by_node))
            }
            single => {
                let id = value_to_id(&single)?;
                let records = directory.agents_overview(Some(&[id])).await?;
                let node = records
                    .first()
                    .map(|r| r.node_name.clone())
                    .unwrap_or_default();
                if node.is_empty() || node == "unknown" {
                    return Err(SentraError::NoSolverNode);
                }
                Ok(SolverTarget::Node(node))
            }
        }
    } else if let Some(node_id) = request.arguments.remove("node_id") {
        let node = node_id
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SentraError::Internal("node_id must be a string".into()))?;
        Ok(SolverTarget::Node(node))
    } else {
        // No restriction: every node that reports agents takes part.
        let records = directory.agents_overview(None).await?;
        let mut by_node: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in records {
            by_node.entry(record.node_name).or_default();
        }
        if by_node.is_empty() {
            by_node.insert(master_name.to_string(), Vec::new());
        }
        Ok(SolverTarget::Fanout(by_node))
    }
}

fn value_to_id(value: &Value) -> Result<String, SentraError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(format!("{:03}", n.as_u64().unwrap_or_default())),
        other => Err(SentraError::Internal(format!(
            "agent_id entries must be strings or integers, got {other}"
        ))),
    }
}
