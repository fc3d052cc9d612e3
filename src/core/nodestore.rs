// src/core/nodestore.rs

//! The node-store collaborator interface: how subscribed values reach the
//! information model, and where the RT fast path gets its external cells.

use crate::core::errors::PubSubError;
use crate::core::value::Variant;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of a node in the information model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A shared cell backing an externally stored node value. Readers cache the
/// cell during a hard freeze and write received samples straight into it.
pub type ExternalValueCell = Arc<RwLock<Variant>>;

/// How a node's value is stored.
#[derive(Debug, Clone)]
pub enum ValueBackend {
    /// Value lives inside the store; writes go through [`NodeStore::write_value`].
    Internal,
    /// Value lives in an application-owned cell shared with the stack.
    External(ExternalValueCell),
}

/// A resolved node. The cell inside an external backend stays valid for as
/// long as the binding (or a cached clone of the cell) is held.
#[derive(Debug, Clone)]
pub struct NodeBinding {
    pub node_id: NodeId,
    pub backend: ValueBackend,
}

/// Node-store contract consumed by the control plane.
pub trait NodeStore: Send + Sync {
    fn get(&self, node_id: &NodeId) -> Option<NodeBinding>;

    fn read_value(&self, node_id: &NodeId) -> Result<Variant, PubSubError>;

    fn write_value(&self, node_id: &NodeId, value: Variant) -> Result<(), PubSubError>;
}

#[derive(Debug, Clone)]
enum StoredNode {
    Internal(Variant),
    External(ExternalValueCell),
}

/// In-memory [`NodeStore`] for tests and self-contained deployments.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: DashMap<NodeId, StoredNode>,
}

impl MemoryNodeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node whose value is owned by the store.
    pub fn register_internal(&self, node_id: NodeId, initial: Variant) {
        self.nodes.insert(node_id, StoredNode::Internal(initial));
    }

    /// Registers a node backed by an external cell and returns the cell so
    /// the application can observe and update it directly.
    pub fn register_external(&self, node_id: NodeId, initial: Variant) -> ExternalValueCell {
        let cell: ExternalValueCell = Arc::new(RwLock::new(initial));
        self.nodes
            .insert(node_id, StoredNode::External(cell.clone()));
        cell
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, node_id: &NodeId) -> Option<NodeBinding> {
        self.nodes.get(node_id).map(|entry| NodeBinding {
            node_id: node_id.clone(),
            backend: match entry.value() {
                StoredNode::Internal(_) => ValueBackend::Internal,
                StoredNode::External(cell) => ValueBackend::External(cell.clone()),
            },
        })
    }

    fn read_value(&self, node_id: &NodeId) -> Result<Variant, PubSubError> {
        match self.nodes.get(node_id).map(|e| e.value().clone()) {
            Some(StoredNode::Internal(value)) => Ok(value),
            Some(StoredNode::External(cell)) => Ok(cell.read().clone()),
            None => Err(PubSubError::NotFound),
        }
    }

    fn write_value(&self, node_id: &NodeId, value: Variant) -> Result<(), PubSubError> {
        match self.nodes.get_mut(node_id) {
            Some(mut entry) => {
                match entry.value_mut() {
                    StoredNode::Internal(stored) => *stored = value,
                    StoredNode::External(cell) => *cell.write() = value,
                }
                Ok(())
            }
            None => Err(PubSubError::NotFound),
        }
    }
}
