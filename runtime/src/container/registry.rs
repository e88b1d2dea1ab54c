//! Relationship registry: stable node identity across discovery passes.
//!
//! Nodes are grouped in slots keyed by `(definition id, parent node)`. Each
//! pass hands the registry the elements now matched for a slot, and the
//! registry decides which previous node id each element continues.

use super::NodeId;
use crate::definition::ContinuityPolicy;
use crate::page::ElementRef;
use std::collections::HashMap;

type SlotKey = (String, Option<NodeId>);

#[derive(Debug, Clone)]
struct SlotEntry {
    node_id: NodeId,
    element: Option<ElementRef>,
}

/// Outcome of reconciling one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// One id per input element, in input order.
    pub assigned: Vec<NodeId>,
    /// Ids allocated by this pass.
    pub created: Vec<NodeId>,
    /// Previous ids no element claimed. The caller retires them.
    pub orphaned: Vec<NodeId>,
}

/// Maps repeated discovery output onto node ids.
#[derive(Debug, Default)]
pub struct RelationshipRegistry {
    next_id: u64,
    slots: HashMap<SlotKey, Vec<SlotEntry>>,
    index: HashMap<NodeId, SlotKey>,
}

impl RelationshipRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    fn allocate(&mut self) -> NodeId {
        let id = NodeId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        id
    }

    /// Reconcile the elements matched for one slot against the previous pass.
    ///
    /// Claims go in three passes: identical element reference, then pairs
    /// where either side has no element, then (rotating continuity only)
    /// the remaining elements in order. Whatever is left gets a fresh id.
    pub fn reconcile(
        &mut self,
        definition_id: &str,
        parent: Option<NodeId>,
        continuity: ContinuityPolicy,
        elements: &[Option<ElementRef>],
    ) -> Reconciliation {
        let key: SlotKey = (definition_id.to_string(), parent);
        let previous = self.slots.remove(&key).unwrap_or_default();
        let mut claimed = vec![false; previous.len()];
        let mut assigned: Vec<Option<NodeId>> = vec![None; elements.len()];

        if continuity != ContinuityPolicy::Disabled {
            // identical element
            for (i, element) in elements.iter().enumerate() {
                let Some(element) = element else { continue };
                if let Some(j) = (0..previous.len())
                    .find(|&j| !claimed[j] && previous[j].element.as_ref() == Some(element))
                {
                    claimed[j] = true;
                    assigned[i] = Some(previous[j].node_id);
                }
            }

            // element absent on either side
            for (i, element) in elements.iter().enumerate() {
                if assigned[i].is_some() {
                    continue;
                }
                if let Some(j) = (0..previous.len()).find(|&j| {
                    !claimed[j] && (element.is_none() || previous[j].element.is_none())
                }) {
                    claimed[j] = true;
                    assigned[i] = Some(previous[j].node_id);
                }
            }

            if continuity == ContinuityPolicy::Rotating {
                let free: Vec<usize> = (0..previous.len()).filter(|&j| !claimed[j]).collect();
                let mut free = free.into_iter();
                for slot in assigned.iter_mut().filter(|a| a.is_none()) {
                    let Some(j) = free.next() else { break };
                    claimed[j] = true;
                    *slot = Some(previous[j].node_id);
                }
            }
        }

        let mut outcome = Reconciliation::default();
        let mut entries = Vec::with_capacity(elements.len());
        for (element, id) in elements.iter().zip(assigned) {
            let node_id = match id {
                Some(id) => id,
                None => {
                    let id = self.allocate();
                    outcome.created.push(id);
                    id
                }
            };
            outcome.assigned.push(node_id);
            entries.push(SlotEntry {
                node_id,
                element: element.clone(),
            });
            self.index.insert(node_id, key.clone());
        }

        for (entry, was_claimed) in previous.into_iter().zip(claimed) {
            if !was_claimed {
                self.index.remove(&entry.node_id);
                outcome.orphaned.push(entry.node_id);
            }
        }

        if !entries.is_empty() {
            self.slots.insert(key, entries);
        }
        outcome
    }

    /// Drop a node and every slot scoped under it.
    pub fn forget(&mut self, node: NodeId) {
        if let Some(key) = self.index.remove(&node) {
            if let Some(entries) = self.slots.get_mut(&key) {
                entries.retain(|e| e.node_id != node);
                if entries.is_empty() {
                    self.slots.remove(&key);
                }
            }
        }
        let children: Vec<SlotKey> = self
            .slots
            .keys()
            .filter(|(_, parent)| *parent == Some(node))
            .cloned()
            .collect();
        for key in children {
            if let Some(entries) = self.slots.remove(&key) {
                for entry in entries {
                    self.index.remove(&entry.node_id);
                }
            }
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.index.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
