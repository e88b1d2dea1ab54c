// Copyright 2026 Trellis Contributors
// SPDX-License-Identifier: Apache-2.0

//! Engine Event Bus: typed events from every component.
//!
//! The EventBus is a `tokio::sync::broadcast` channel that carries
//! [`EngineEvent`] values. Callers (session layers, UI highlighting, the
//! `watch` command) subscribe independently. When no subscribers exist,
//! events are silently dropped.

use crate::clock::Millis;
use crate::container::lifecycle::{LifecycleState, TriggerKind};
use crate::container::NodeId;
use crate::error::OperationError;
use crate::ops::{OperationKind, RequestId};
use crate::page::ElementRef;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Every event the engine emits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // ── Tree Events ───────────────────────
    /// A node id was allocated for a newly matched region.
    NodeDiscovered {
        node_id: NodeId,
        definition_id: String,
        parent_node_id: Option<NodeId>,
        exists: bool,
    },
    /// A node moved between lifecycle states.
    LifecycleChanged {
        node_id: NodeId,
        from: LifecycleState,
        to: LifecycleState,
    },
    /// A refresh pass settled.
    RefreshCompleted {
        node_id: NodeId,
        trigger: TriggerKind,
        coalesced: u32,
        latency_ms: u64,
        duration_ms: u64,
    },
    /// A refresh pass threw or timed out.
    RefreshFailed {
        node_id: NodeId,
        failures: u32,
        error: String,
        suspended: bool,
    },
    /// A node's region disappeared and the node was retired.
    NodeEvicted {
        node_id: NodeId,
        definition_id: String,
    },
    /// A single-container selector matched more than one element.
    MatchAmbiguous {
        definition_id: String,
        candidates: usize,
        strategy: String,
        chosen: ElementRef,
    },

    // ── Operation Events ──────────────────
    OperationStarted {
        request_id: RequestId,
        node_id: NodeId,
        operation: OperationKind,
        attempt: u32,
    },
    OperationCompleted {
        request_id: RequestId,
        node_id: NodeId,
        operation: OperationKind,
        success: bool,
        error: Option<OperationError>,
        execution_time_ms: u64,
        attempts_used: u32,
    },

    // ── Focus Events ──────────────────────
    FocusChanged {
        previous: Option<NodeId>,
        current: Option<NodeId>,
        at: Millis,
    },
    /// A binding was added, or removed (`node_id` is then the old target).
    BindingChanged {
        class: String,
        node_id: NodeId,
        operation: OperationKind,
        removed: bool,
    },
}

impl EngineEvent {
    /// Node the event is about, if any.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            EngineEvent::NodeDiscovered { node_id, .. }
            | EngineEvent::LifecycleChanged { node_id, .. }
            | EngineEvent::RefreshCompleted { node_id, .. }
            | EngineEvent::RefreshFailed { node_id, .. }
            | EngineEvent::NodeEvicted { node_id, .. }
            | EngineEvent::OperationStarted { node_id, .. }
            | EngineEvent::OperationCompleted { node_id, .. }
            | EngineEvent::BindingChanged { node_id, .. } => Some(*node_id),
            EngineEvent::FocusChanged { current, .. } => *current,
            EngineEvent::MatchAmbiguous { .. } => None,
        }
    }
}

/// The engine's event bus.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream. Events dropped while the reader lagged are skipped.
    pub fn stream(&self) -> impl Stream<Item = EngineEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe())
            .filter_map(|item| futures::future::ready(item.ok()))
    }
}
