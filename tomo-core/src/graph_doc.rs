//! Minimal loader for the `{nodes, edges}` graph document (§6 of the wire
//! protocol). This is intentionally thin: it resolves a small built-in
//! plugin registry rather than discovering plugins on disk, so the daemon
//! and remote-node proxy are exercisable end-to-end without a full plugin
//! ecosystem.

use std::collections::HashMap;

use serde::Deserialize;

use crate::builtins::DummyTask;
use crate::error::{Error, Result};
use crate::graph::{NodeId, TaskGraph};
use crate::tasks::kernel_map::KernelMapTask;

#[derive(Debug, Deserialize)]
struct NodeDoc {
    name: String,
    plugin: String,
    #[serde(default)]
    properties: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EdgeDoc {
    from: String,
    to: String,
    port: usize,
}

#[derive(Debug, Deserialize)]
struct GraphDoc {
    nodes: Vec<NodeDoc>,
    edges: Vec<EdgeDoc>,
}

/// Parses `json` and builds a [`TaskGraph`] from it, resolving each node's
/// `plugin` name against the built-in task registry.
pub fn load(json: &[u8]) -> Result<TaskGraph> {
    let doc: GraphDoc = serde_json::from_slice(json).map_err(Error::from)?;

    let mut graph = TaskGraph::new();
    let mut by_name: HashMap<String, NodeId> = HashMap::new();

    for node_doc in &doc.nodes {
        let task = instantiate(&node_doc.name, &node_doc.plugin, &node_doc.properties)?;
        let id = graph.add_node(task);
        if by_name.insert(node_doc.name.clone(), id).is_some() {
            return Err(Error::GraphInvalid(format!("duplicate node name '{}'", node_doc.name)));
        }
    }

    for edge in &doc.edges {
        let src = *by_name
            .get(&edge.from)
            .ok_or_else(|| Error::GraphInvalid(format!("unknown node '{}'", edge.from)))?;
        let dst = *by_name
            .get(&edge.to)
            .ok_or_else(|| Error::GraphInvalid(format!("unknown node '{}'", edge.to)))?;
        graph.connect(src, dst, edge.port)?;
    }

    Ok(graph)
}

fn instantiate(
    name: &str,
    plugin: &str,
    properties: &HashMap<String, serde_json::Value>,
) -> Result<Box<dyn crate::task::Task>> {
    match plugin {
        "identity" | "dummy" => Ok(Box::new(DummyTask::new(name))),
        "kernel_map" => {
            let kernel_name = properties
                .get("kernel")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::GraphInvalid(format!("node '{name}' is missing a 'kernel' property"))
                })?;
            Ok(Box::new(KernelMapTask::new(name, kernel_name)))
        }
        other => Err(Error::GraphInvalid(format!("unknown plugin '{other}' for node '{name}'"))),
    }
}

/// Removes a dummy task found at a root, dropping it entirely so its
/// successor (if any) becomes the new root.
///
/// Per §4.4: dummy tasks are placeholders for graph serialisation, removed
/// at load time if present at a root.
pub fn strip_root_dummies(graph: &mut TaskGraph) {
    loop {
        let Some(dummy_root) =
            graph.roots().into_iter().find(|&id| graph.task(id).is_dummy())
        else {
            break;
        };
        graph.remove_node(dummy_root);
    }
}
