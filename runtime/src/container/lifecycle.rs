//! Self-refresh lifecycle: one state machine per container node.
//!
//! ```text
//! uninitialized → discovering → stable → discovering → … → retiring → retired
//!                      └──(max_refresh_retries failures)──→ error
//! ```
//!
//! The machine is pure: every method takes the current logical time and the
//! node's [`RefreshPolicy`], and the engine acts on what it returns. Triggers
//! never start work directly. They arm (or re-arm) a debounce deadline, and
//! the engine asks [`RefreshLifecycle::is_due`] on each tick.

use super::NodeId;
use crate::clock::Millis;
use crate::definition::RefreshPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Discovering,
    Stable,
    Error,
    Retiring,
    Retired,
}

impl LifecycleState {
    /// Operations may only target nodes in these states.
    pub fn accepts_operations(self) -> bool {
        !matches!(self, LifecycleState::Error | LifecycleState::Retiring | LifecycleState::Retired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Discovering => "discovering",
            LifecycleState::Stable => "stable",
            LifecycleState::Error => "error",
            LifecycleState::Retiring => "retiring",
            LifecycleState::Retired => "retired",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger kinds, used by refresh policies to enable automatic triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Interval,
    Mutation,
    ParentRefreshed,
}

/// Why a refresh was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefreshTrigger {
    /// Requested by a caller. `origin` is absent for whole-tree passes.
    Manual { at: Millis, origin: Option<NodeId> },
    Interval { at: Millis, origin: NodeId },
    Mutation { at: Millis, origin: NodeId },
    ParentRefreshed { at: Millis, origin: NodeId },
}

impl RefreshTrigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            RefreshTrigger::Manual { .. } => TriggerKind::Manual,
            RefreshTrigger::Interval { .. } => TriggerKind::Interval,
            RefreshTrigger::Mutation { .. } => TriggerKind::Mutation,
            RefreshTrigger::ParentRefreshed { .. } => TriggerKind::ParentRefreshed,
        }
    }

    pub fn at(&self) -> Millis {
        match self {
            RefreshTrigger::Manual { at, .. }
            | RefreshTrigger::Interval { at, .. }
            | RefreshTrigger::Mutation { at, .. }
            | RefreshTrigger::ParentRefreshed { at, .. } => *at,
        }
    }

    pub fn origin(&self) -> Option<NodeId> {
        match self {
            RefreshTrigger::Manual { origin, .. } => *origin,
            RefreshTrigger::Interval { origin, .. }
            | RefreshTrigger::Mutation { origin, .. }
            | RefreshTrigger::ParentRefreshed { origin, .. } => Some(*origin),
        }
    }
}

/// A refresh waiting for its debounce window to elapse.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRefresh {
    /// Most recent trigger; earlier ones are coalesced into it.
    trigger: RefreshTrigger,
    first_at: Millis,
    due_at: Millis,
    coalesced: u32,
}

/// What happened to an incoming trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A refresh is now armed for `due_at`.
    Scheduled { due_at: Millis },
    /// Merged into an already-armed refresh whose deadline moved to `due_at`.
    Coalesced { due_at: Millis, coalesced: u32 },
    /// Ignored; the reason names the state or policy that refused it.
    Suppressed { reason: &'static str },
}

/// Handed to the engine when a due refresh starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedRefresh {
    pub trigger: RefreshTrigger,
    pub started_at: Millis,
    /// From the first coalesced trigger to the start of discovery.
    pub latency_ms: u64,
    pub coalesced: u32,
}

/// Handed to the engine when a refresh completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRefresh {
    pub duration_ms: u64,
    /// A trigger arrived while discovery ran and re-armed the node.
    pub rearmed: bool,
}

/// What a failed discovery led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Another attempt is armed.
    Retrying { due_at: Millis, failures: u32 },
    /// Retry budget exhausted; automatic triggers are suspended.
    Suspended { failures: u32 },
}

/// Per-node refresh state machine.
#[derive(Debug, Clone)]
pub struct RefreshLifecycle {
    state: LifecycleState,
    pending: Option<PendingRefresh>,
    running_since: Option<Millis>,
    consecutive_failures: u32,
    last_refresh_at: Option<Millis>,
}

impl Default for RefreshLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshLifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            pending: None,
            running_since: None,
            consecutive_failures: 0,
            last_refresh_at: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn last_refresh_at(&self) -> Option<Millis> {
        self.last_refresh_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Deadline of the armed refresh, if any.
    pub fn due_at(&self) -> Option<Millis> {
        self.pending.as_ref().map(|p| p.due_at)
    }

    /// First reference: the node's initial discovery is starting now.
    pub fn begin_initial(&mut self, now: Millis) -> bool {
        if self.state != LifecycleState::Uninitialized {
            return false;
        }
        self.state = LifecycleState::Discovering;
        self.running_since = Some(now);
        true
    }

    /// Feed a trigger into the machine.
    pub fn on_trigger(
        &mut self,
        trigger: RefreshTrigger,
        now: Millis,
        policy: &RefreshPolicy,
    ) -> TriggerOutcome {
        let kind = trigger.kind();
        match self.state {
            LifecycleState::Retiring | LifecycleState::Retired => {
                return TriggerOutcome::Suppressed { reason: "retired" };
            }
            LifecycleState::Error if kind != TriggerKind::Manual => {
                return TriggerOutcome::Suppressed {
                    reason: "suspended after repeated failures",
                };
            }
            _ => {}
        }
        if !policy.allows(kind) {
            return TriggerOutcome::Suppressed {
                reason: "trigger kind disabled by policy",
            };
        }

        if self.state == LifecycleState::Error {
            // Manual recovery starts with a clean failure budget.
            self.consecutive_failures = 0;
        }

        let due_at = now.saturating_add(policy.debounce_ms);
        self.state = LifecycleState::Discovering;
        match self.pending.as_mut() {
            Some(pending) => {
                pending.trigger = trigger;
                pending.due_at = due_at;
                pending.coalesced += 1;
                TriggerOutcome::Coalesced {
                    due_at,
                    coalesced: pending.coalesced,
                }
            }
            None => {
                self.pending = Some(PendingRefresh {
                    trigger,
                    first_at: now,
                    due_at,
                    coalesced: 0,
                });
                TriggerOutcome::Scheduled { due_at }
            }
        }
    }

    /// Whether an armed refresh may start now. Never true while one runs.
    pub fn is_due(&self, now: Millis) -> bool {
        self.running_since.is_none()
            && self.state == LifecycleState::Discovering
            && self.pending.as_ref().is_some_and(|p| p.due_at <= now)
    }

    /// Start the due refresh, consuming the armed trigger.
    pub fn start(&mut self, now: Millis) -> Option<StartedRefresh> {
        if !self.is_due(now) {
            return None;
        }
        let pending = self.pending.take()?;
        self.running_since = Some(now);
        Some(StartedRefresh {
            latency_ms: now.saturating_sub(pending.first_at),
            trigger: pending.trigger,
            started_at: now,
            coalesced: pending.coalesced,
        })
    }

    /// Discovery finished. Settles to `stable` unless re-armed meanwhile.
    pub fn complete(&mut self, now: Millis) -> CompletedRefresh {
        let started = self.running_since.take().unwrap_or(now);
        self.consecutive_failures = 0;
        self.last_refresh_at = Some(now);
        let rearmed = self.pending.is_some();
        if matches!(
            self.state,
            LifecycleState::Discovering | LifecycleState::Uninitialized | LifecycleState::Stable
        ) {
            self.state = if rearmed {
                LifecycleState::Discovering
            } else {
                LifecycleState::Stable
            };
        }
        CompletedRefresh {
            duration_ms: now.saturating_sub(started),
            rearmed,
        }
    }

    /// Discovery failed or timed out.
    pub fn fail(&mut self, now: Millis, policy: &RefreshPolicy) -> FailureOutcome {
        let started = self.running_since.take().unwrap_or(now);
        self.consecutive_failures += 1;
        let failures = self.consecutive_failures;

        if failures >= policy.max_refresh_retries {
            self.state = LifecycleState::Error;
            self.pending = None;
            return FailureOutcome::Suspended { failures };
        }

        let due_at = now.saturating_add(policy.retry_delay_ms);
        // Keep a trigger that arrived mid-run; otherwise retry with a
        // synthetic manual trigger dated at the original start.
        match self.pending.as_mut() {
            Some(pending) => pending.due_at = pending.due_at.max(due_at),
            None => {
                self.pending = Some(PendingRefresh {
                    trigger: RefreshTrigger::Manual {
                        at: started,
                        origin: None,
                    },
                    first_at: started,
                    due_at,
                    coalesced: 0,
                });
            }
        }
        self.state = LifecycleState::Discovering;
        FailureOutcome::Retrying { due_at, failures }
    }

    /// An ancestor's pass re-discovered this node, which satisfies any armed
    /// refresh. Returns false when the node is not eligible (suspended,
    /// retiring, or mid-run).
    pub fn covered_by_ancestor(&mut self, now: Millis) -> bool {
        match self.state {
            LifecycleState::Error | LifecycleState::Retiring | LifecycleState::Retired => false,
            _ if self.running_since.is_some() => false,
            _ => {
                self.pending = None;
                self.consecutive_failures = 0;
                self.last_refresh_at = Some(now);
                self.state = LifecycleState::Stable;
                true
            }
        }
    }

    /// Region gone: start retirement. Returns false if already retiring.
    pub fn begin_retire(&mut self) -> bool {
        if matches!(self.state, LifecycleState::Retiring | LifecycleState::Retired) {
            return false;
        }
        self.state = LifecycleState::Retiring;
        self.pending = None;
        self.running_since = None;
        true
    }

    /// Subscriptions released and descendants retired.
    pub fn finish_retire(&mut self) {
        self.state = LifecycleState::Retired;
    }
}
