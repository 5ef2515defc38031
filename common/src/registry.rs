// Node lookup used to expand task targets

use crate::config::NodeConfig;
use crate::models::HostNode;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Source of cluster nodes; membership itself is managed elsewhere
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn get_node(&self, id: &str) -> Option<HostNode>;

    /// Nodes carrying every selector label, ordered by id
    async fn nodes_with_labels(&self, selector: &HashMap<String, String>) -> Vec<HostNode>;

    /// Record a condition reported by a check or install job
    async fn update_condition(&self, _node_id: &str, _condition_type: &str, _status: &str) {}
}

/// Registry over a fixed node list
pub struct StaticNodeRegistry {
    nodes: RwLock<Vec<HostNode>>,
}

impl StaticNodeRegistry {
    pub fn new(nodes: Vec<HostNode>) -> Self {
        let mut nodes = nodes;
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    pub fn from_config(nodes: &[NodeConfig]) -> Self {
        Self::new(
            nodes
                .iter()
                .map(|n| HostNode {
                    id: n.id.clone(),
                    labels: n.labels.clone(),
                    conditions: HashMap::new(),
                })
                .collect(),
        )
    }
}

#[async_trait]
impl NodeRegistry for StaticNodeRegistry {
    async fn get_node(&self, id: &str) -> Option<HostNode> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|n| n.id == id)
            .cloned()
    }

    async fn nodes_with_labels(&self, selector: &HashMap<String, String>) -> Vec<HostNode> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|n| n.matches_labels(selector))
            .cloned()
            .collect()
    }

    async fn update_condition(&self, node_id: &str, condition_type: &str, status: &str) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(node) = nodes.iter_mut().find(|n| n.id == node_id) {
            debug!(node_id, condition_type, status, "Node condition updated");
            node.conditions
                .insert(condition_type.to_string(), status.to_string());
        }
    }
}
