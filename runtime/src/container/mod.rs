//! Runtime containers: node identity, node snapshots, and the three
//! subsystems that keep them in step with the live DOM.
//!
//! - [`discovery`] matches definitions against the page (read-only).
//! - [`registry`] keeps node ids stable across repeated passes.
//! - [`lifecycle`] decides when each node re-discovers itself.

pub mod discovery;
pub mod lifecycle;
pub mod registry;

use crate::clock::Millis;
use crate::ops::OperationKind;
use crate::page::Rect;
use chrono::{DateTime, Utc};
use lifecycle::LifecycleState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Stable identity of a logical container within one engine.
///
/// Allocated monotonically and never reused, even after retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Read-only view of one container node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerNode {
    pub node_id: NodeId,
    pub definition_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<NodeId>,
    pub exists: bool,
    pub visible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rect: Option<Rect>,
    pub child_node_ids: Vec<NodeId>,
    pub capabilities: BTreeSet<OperationKind>,
    pub lifecycle_state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_at: Option<Millis>,
}

impl ContainerNode {
    pub fn can(&self, operation: OperationKind) -> bool {
        self.capabilities.contains(&operation)
    }
}

/// Operations executable right now: the allowed set filtered by presence
/// and visibility. Always a subset of `allowed`.
pub fn compute_capabilities(
    allowed: &BTreeSet<OperationKind>,
    exists: bool,
    visible: bool,
) -> BTreeSet<OperationKind> {
    if !exists {
        return BTreeSet::new();
    }
    allowed
        .iter()
        .copied()
        .filter(|op| visible || !op.requires_visibility())
        .collect()
}

/// A consistent copy of the whole container tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub site: String,
    pub page_type: String,
    pub captured_at: DateTime<Utc>,
    pub root_node_ids: Vec<NodeId>,
    /// Depth-first, parents before children.
    pub nodes: Vec<ContainerNode>,
}

impl TreeSnapshot {
    pub fn node(&self, id: NodeId) -> Option<&ContainerNode> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    /// Nodes bound to a definition, in tree order.
    pub fn by_definition<'a>(
        &'a self,
        definition_id: &'a str,
    ) -> impl Iterator<Item = &'a ContainerNode> + 'a {
        self.nodes
            .iter()
            .filter(move |n| n.definition_id == definition_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
