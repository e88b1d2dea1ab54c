//! Focus manager and binding registry.
//!
//! Focus is the node that requests without an explicit target act on.
//! Bindings map a logical operation class (e.g. `"scroll-to-load"`) to a
//! concrete `(node, operation)` pair with a priority.

use crate::container::NodeId;
use crate::ops::OperationKind;
use serde::{Deserialize, Serialize};

/// A focus transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusChange {
    pub previous: Option<NodeId>,
    pub current: Option<NodeId>,
}

#[derive(Debug, Default)]
pub struct FocusManager {
    current: Option<NodeId>,
}

impl FocusManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<NodeId> {
        self.current
    }

    /// Move focus. Returns None when focus did not change.
    pub fn focus(&mut self, node: Option<NodeId>) -> Option<FocusChange> {
        if self.current == node {
            return None;
        }
        let previous = std::mem::replace(&mut self.current, node);
        Some(FocusChange {
            previous,
            current: node,
        })
    }

    /// Drop focus if it points at `node` (which is retiring).
    pub fn release(&mut self, node: NodeId) -> Option<FocusChange> {
        if self.current == Some(node) {
            self.focus(None)
        } else {
            None
        }
    }
}

/// A logical operation class bound to a concrete node and operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub class: String,
    pub node_id: NodeId,
    pub operation: OperationKind,
    /// Higher wins.
    pub priority: i32,
    /// Registration order, used to break priority ties.
    pub seq: u64,
}

#[derive(Debug, Default)]
pub struct BindingRegistry {
    bindings: Vec<Binding>,
    next_seq: u64,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding. Re-binding the same `(class, node, operation)` only
    /// updates its priority and keeps its registration order.
    pub fn bind(
        &mut self,
        class: impl Into<String>,
        node_id: NodeId,
        operation: OperationKind,
        priority: i32,
    ) -> Binding {
        let class = class.into();
        if let Some(existing) = self
            .bindings
            .iter_mut()
            .find(|b| b.class == class && b.node_id == node_id && b.operation == operation)
        {
            existing.priority = priority;
            return existing.clone();
        }
        let binding = Binding {
            class,
            node_id,
            operation,
            priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.bindings.push(binding.clone());
        binding
    }

    pub fn unbind(&mut self, class: &str, node_id: NodeId, operation: OperationKind) -> Option<Binding> {
        let index = self
            .bindings
            .iter()
            .position(|b| b.class == class && b.node_id == node_id && b.operation == operation)?;
        Some(self.bindings.remove(index))
    }

    /// Remove every binding that targets `node`.
    pub fn prune(&mut self, node: NodeId) -> Vec<Binding> {
        let (removed, kept) = std::mem::take(&mut self.bindings)
            .into_iter()
            .partition(|b| b.node_id == node);
        self.bindings = kept;
        removed
    }

    /// Best binding for `class` and `operation` whose node passes `eligible`:
    /// highest priority, ties to the earliest registration.
    pub fn resolve(
        &self,
        class: &str,
        operation: OperationKind,
        eligible: impl Fn(NodeId) -> bool,
    ) -> Option<&Binding> {
        self.bindings
            .iter()
            .filter(|b| b.class == class && b.operation == operation)
            .filter(|b| eligible(b.node_id))
            .min_by_key(|b| (std::cmp::Reverse(b.priority), b.seq))
    }

    pub fn all(&self) -> &[Binding] {
        &self.bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_changes_and_release() {
        let mut focus = FocusManager::new();
        let change = focus.focus(Some(NodeId(3))).unwrap();
        assert_eq!(change.previous, None);
        assert!(focus.focus(Some(NodeId(3))).is_none());

        assert!(focus.release(NodeId(9)).is_none());
        let released = focus.release(NodeId(3)).unwrap();
        assert_eq!(released.previous, Some(NodeId(3)));
        assert_eq!(focus.current(), None);
    }

    #[test]
    fn test_resolution_prefers_priority_then_registration() {
        let mut reg = BindingRegistry::new();
        reg.bind("scroll-to-load", NodeId(1), OperationKind::Scroll, 5);
        reg.bind("scroll-to-load", NodeId(2), OperationKind::Scroll, 10);
        reg.bind("scroll-to-load", NodeId(3), OperationKind::Scroll, 10);

        let all = |_: NodeId| true;
        let best = reg.resolve("scroll-to-load", OperationKind::Scroll, all).unwrap();
        assert_eq!(best.node_id, NodeId(2));

        // node 2 not stable: next best with equal priority
        let best = reg
            .resolve("scroll-to-load", OperationKind::Scroll, |n| n != NodeId(2))
            .unwrap();
        assert_eq!(best.node_id, NodeId(3));

        assert!(reg
            .resolve("scroll-to-load", OperationKind::Click, all)
            .is_none());
        assert!(reg.resolve("scroll-to-load", OperationKind::Scroll, |_| false).is_none());
    }

    #[test]
    fn test_rebind_updates_priority_only() {
        let mut reg = BindingRegistry::new();
        let first = reg.bind("open", NodeId(1), OperationKind::Click, 1);
        let again = reg.bind("open", NodeId(1), OperationKind::Click, 7);
        assert_eq!(again.seq, first.seq);
        assert_eq!(again.priority, 7);
        assert_eq!(reg.all().len(), 1);
    }

    #[test]
    fn test_prune_and_unbind() {
        let mut reg = BindingRegistry::new();
        reg.bind("open", NodeId(1), OperationKind::Click, 1);
        reg.bind("read", NodeId(1), OperationKind::Extract, 1);
        reg.bind("open", NodeId(2), OperationKind::Click, 1);

        assert_eq!(reg.prune(NodeId(1)).len(), 2);
        assert_eq!(reg.all().iter().filter(|b| b.class == "open").count(), 1);
        assert!(reg.unbind("open", NodeId(2), OperationKind::Click).is_some());
        assert!(reg.all().is_empty());
    }
}
