//! Node identity and liveness tracking.
//!
//! Nodes are upserted on registration, touched by heartbeats, and never
//! hard-deleted except through [`NodeRegistry::remove`], which refuses
//! while the node still holds an assigned job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::LivenessConfig;
use crate::error::{Result, YardError};
use crate::store::{Gateway, RemoveNode};

/// Hardware and platform description reported at registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpecs {
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub ram_usage: f64,
    #[serde(default, rename = "totalRAM_GB")]
    pub total_ram_gb: f64,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub processor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout_addr: Option<String>,
    /// Anything else the agent reported.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub specs: NodeSpecs,
    pub container_supported: bool,
    pub handshake_key: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    /// Placeholder record created when a heartbeat arrives for a node the
    /// store has never seen. Specs stay empty until the agent re-registers.
    pub fn anonymous(node_id: String, last_seen: DateTime<Utc>) -> Self {
        Self {
            node_id,
            specs: NodeSpecs::default(),
            container_supported: false,
            handshake_key: None,
            last_seen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Online,
    Warning,
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Warning => write!(f, "warning"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn Gateway>,
    liveness: LivenessConfig,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn Gateway>, liveness: LivenessConfig) -> Self {
        Self { store, liveness }
    }

    /// Upsert a node. Always succeeds; `last_seen` advances to now.
    pub fn register(
        &self,
        node_id: String,
        specs: NodeSpecs,
        container_supported: bool,
        handshake_key: Option<String>,
    ) {
        let node = Node {
            node_id: node_id.clone(),
            specs,
            container_supported,
            handshake_key,
            last_seen: Utc::now(),
        };
        self.store.upsert_node(node);
        tracing::info!(node_id = %node_id, "Node registered");
    }

    /// Advance `last_seen`. A heartbeat from an unknown node re-registers
    /// it with empty specs: an agent that outlives a backend wipe heals
    /// itself on the next beat.
    pub fn heartbeat(&self, node_id: &str) {
        let now = Utc::now();
        if !self.store.touch_node(node_id, now) {
            tracing::warn!(node_id, "Heartbeat from unknown node, re-registering");
            self.store
                .upsert_node(Node::anonymous(node_id.to_string(), now));
        }
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.store.get_node(node_id)
    }

    pub fn list(&self) -> Vec<Node> {
        self.store.list_nodes()
    }

    /// Derive a node's liveness status at `now`.
    pub fn status(&self, node: &Node, now: DateTime<Utc>) -> NodeStatus {
        let silent = now
            .signed_duration_since(node.last_seen)
            .to_std()
            .unwrap_or_default();
        if silent < self.liveness.online_window {
            NodeStatus::Online
        } else if silent < self.liveness.warning_window {
            NodeStatus::Warning
        } else {
            NodeStatus::Offline
        }
    }

    /// Administrative removal. Rejected while the node holds an assigned job.
    pub fn remove(&self, node_id: &str) -> Result<()> {
        match self.store.remove_idle_node(node_id) {
            RemoveNode::Removed => {
                tracing::info!(node_id, "Node removed");
                Ok(())
            }
            RemoveNode::HasAssignedJob => Err(YardError::NodeBusy(node_id.to_string())),
            RemoveNode::NotFound => Err(YardError::NodeNotFound(node_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Arc::new(MemoryStore::new()), LivenessConfig::default())
    }

    #[test]
    fn status_windows() {
        let reg = registry();
        reg.register("n1".to_string(), NodeSpecs::default(), true, None);
        let node = reg.get("n1").unwrap();

        let now = node.last_seen;
        assert_eq!(
            reg.status(&node, now + ChronoDuration::seconds(10)),
            NodeStatus::Online
        );
        assert_eq!(
            reg.status(&node, now + ChronoDuration::seconds(120)),
            NodeStatus::Warning
        );
        assert_eq!(
            reg.status(&node, now + ChronoDuration::seconds(600)),
            NodeStatus::Offline
        );
    }

    #[test]
    fn heartbeat_upserts_unknown_node() {
        let reg = registry();
        reg.heartbeat("ghost");
        let node = reg.get("ghost").unwrap();
        assert!(node.specs.os.is_empty());
        assert!(!node.container_supported);
    }

    #[test]
    fn last_seen_is_monotonic() {
        let reg = registry();
        reg.register("n1".to_string(), NodeSpecs::default(), true, None);
        let first = reg.get("n1").unwrap().last_seen;
        reg.heartbeat("n1");
        let second = reg.get("n1").unwrap().last_seen;
        assert!(second >= first);
    }
}
