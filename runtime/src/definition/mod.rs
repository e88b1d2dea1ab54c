//! Container definitions: the immutable, externally supplied description of
//! a container (selector, parent relation, allowed operations, refresh policy).

pub mod library;
pub mod resolver;

use crate::container::lifecycle::TriggerKind;
use crate::ops::{ExtractField, OperationKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How to pick one element when a single-container selector matches several.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disambiguation {
    /// First match in document order.
    #[default]
    First,
    /// Last match in document order.
    Last,
    /// Largest bounding-box area; ties go to the earliest in document order.
    LargestArea,
    /// A strategy registered on the engine under this name.
    Custom(String),
}

impl Disambiguation {
    /// Key into the engine's strategy table.
    pub fn strategy_name(&self) -> &str {
        match self {
            Disambiguation::First => "first",
            Disambiguation::Last => "last",
            Disambiguation::LargestArea => "largest_area",
            Disambiguation::Custom(name) => name,
        }
    }
}

/// When a re-discovered element may keep an existing node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityPolicy {
    /// Reuse only for the same element reference (or when either side has none).
    #[default]
    Strict,
    /// Any element satisfying the selector continues the previous node,
    /// e.g. list items whose backing element rotates.
    Rotating,
    /// Every pass allocates fresh node ids.
    Disabled,
}

/// When and how a container re-evaluates itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshPolicy {
    /// Period for interval triggers. Only used when `interval` is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// Automatic trigger kinds honoured for this container.
    /// Manual triggers are always honoured.
    #[serde(default = "default_triggers")]
    pub triggers: BTreeSet<TriggerKind>,
    /// Triggers closer together than this are coalesced.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Consecutive failed discoveries before the node enters `error`.
    #[serde(default = "default_max_refresh_retries")]
    pub max_refresh_retries: u32,
    /// Wait before retrying a failed discovery.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Overrides the engine-wide discovery deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_timeout_ms: Option<u64>,
}

fn default_triggers() -> BTreeSet<TriggerKind> {
    BTreeSet::from([TriggerKind::Mutation, TriggerKind::ParentRefreshed])
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_max_refresh_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            interval_ms: None,
            triggers: default_triggers(),
            debounce_ms: default_debounce_ms(),
            max_refresh_retries: default_max_refresh_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            discovery_timeout_ms: None,
        }
    }
}

impl RefreshPolicy {
    /// Whether a trigger of this kind may start a refresh.
    pub fn allows(&self, kind: TriggerKind) -> bool {
        kind == TriggerKind::Manual || self.triggers.contains(&kind)
    }

    /// Interval period, if interval triggers are enabled and configured.
    pub fn interval(&self) -> Option<u64> {
        if self.triggers.contains(&TriggerKind::Interval) {
            self.interval_ms.filter(|ms| *ms > 0)
        } else {
            None
        }
    }

    pub fn observes_mutations(&self) -> bool {
        self.triggers.contains(&TriggerKind::Mutation)
    }
}

/// Declarative description of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    /// Unique within a site page.
    pub id: String,
    /// CSS selector, evaluated inside the parent's bound element.
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub allowed_operations: BTreeSet<OperationKind>,
    #[serde(default)]
    pub refresh_policy: RefreshPolicy,
    /// List container: bind every match, one node per element.
    #[serde(default)]
    pub multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disambiguation: Option<Disambiguation>,
    #[serde(default)]
    pub continuity: ContinuityPolicy,
    /// Fields read by an `extract` operation that names none.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extract: Vec<ExtractField>,
}

impl ContainerDefinition {
    pub fn new(id: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            selector: selector.into(),
            parent_id: None,
            allowed_operations: BTreeSet::new(),
            refresh_policy: RefreshPolicy::default(),
            multiple: false,
            disambiguation: None,
            continuity: ContinuityPolicy::default(),
            extract: Vec::new(),
        }
    }

    pub fn child_of(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn allow(mut self, operations: impl IntoIterator<Item = OperationKind>) -> Self {
        self.allowed_operations.extend(operations);
        self
    }

    pub fn list(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn with_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    pub fn with_continuity(mut self, continuity: ContinuityPolicy) -> Self {
        self.continuity = continuity;
        self
    }

    pub fn with_disambiguation(mut self, rule: Disambiguation) -> Self {
        self.disambiguation = Some(rule);
        self
    }

    pub fn with_extract(mut self, fields: Vec<ExtractField>) -> Self {
        self.extract = fields;
        self
    }
}
