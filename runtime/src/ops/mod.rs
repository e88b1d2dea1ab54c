//! Operations that can be performed against containers.
//!
//! Parameters and outputs are closed tagged unions keyed by
//! [`OperationKind`], so a request can never carry a payload shape that the
//! executor does not understand.

pub mod executor;
pub mod scheduler;

use crate::container::NodeId;
use crate::error::OperationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::oneshot;
use uuid::Uuid;

/// The kinds of operation a container may allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Click,
    Type,
    Scroll,
    Extract,
    Hover,
    Focus,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::Click,
        OperationKind::Type,
        OperationKind::Scroll,
        OperationKind::Extract,
        OperationKind::Hover,
        OperationKind::Focus,
    ];

    /// Whether the operation needs a rendered, visible element.
    ///
    /// Extraction reads the DOM and works on hidden elements too.
    pub fn requires_visibility(self) -> bool {
        !matches!(self, OperationKind::Extract)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Click => "click",
            OperationKind::Type => "type",
            OperationKind::Scroll => "scroll",
            OperationKind::Extract => "extract",
            OperationKind::Hover => "hover",
            OperationKind::Focus => "focus",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown operation kind `{s}`"))
    }
}

/// Scroll direction for [`Operation::Scroll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Down,
    Up,
    ToEnd,
    ToStart,
}

/// One value to read during an [`Operation::Extract`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractField {
    /// Key in the extracted value map.
    pub name: String,
    /// Descendant selector; the container element itself when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Attribute to read; normalized text content when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl ExtractField {
    pub fn text(name: impl Into<String>, selector: Option<&str>) -> Self {
        Self {
            name: name.into(),
            selector: selector.map(str::to_string),
            attribute: None,
        }
    }

    pub fn attribute(name: impl Into<String>, selector: Option<&str>, attribute: &str) -> Self {
        Self {
            name: name.into(),
            selector: selector.map(str::to_string),
            attribute: Some(attribute.to_string()),
        }
    }
}

/// Operation parameters, one shape per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Click,
    Type {
        text: String,
        #[serde(default)]
        clear_first: bool,
    },
    Scroll {
        direction: ScrollDirection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        amount_px: Option<u32>,
    },
    Extract {
        #[serde(default)]
        fields: Vec<ExtractField>,
    },
    Hover,
    Focus,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Click => OperationKind::Click,
            Operation::Type { .. } => OperationKind::Type,
            Operation::Scroll { .. } => OperationKind::Scroll,
            Operation::Extract { .. } => OperationKind::Extract,
            Operation::Hover => OperationKind::Hover,
            Operation::Focus => OperationKind::Focus,
        }
    }
}

/// Operation output, one shape per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationOutput {
    Clicked,
    Typed { chars: usize },
    Scrolled { scroll_top: f64, at_end: bool },
    Extracted { values: BTreeMap<String, Option<String>> },
    Hovered,
    Focused,
}

/// Retry settings carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executor invocations allowed, including the first.
    pub max_attempts: u32,
    /// Overrides the engine's backoff base.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,
    /// Overrides the engine's backoff cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_cap_ms: Option<u64>,
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base_ms: None,
            backoff_cap_ms: None,
        }
    }

    pub fn once() -> Self {
        Self::attempts(1)
    }

    /// Delay before attempt number `attempts_used + 1`.
    pub fn backoff_ms(&self, attempts_used: u32, base_ms: u64, cap_ms: u64) -> u64 {
        let base = self.backoff_base_ms.unwrap_or(base_ms);
        let cap = self.backoff_cap_ms.unwrap_or(cap_ms);
        let exponent = attempts_used.saturating_sub(1).min(31);
        base.saturating_mul(1u64 << exponent).min(cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::attempts(3)
    }
}

/// Which container a request is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Target {
    /// An explicit node id.
    Node { node_id: NodeId },
    /// Whatever the focus manager currently points at.
    Focused,
    /// The best binding for a logical operation class.
    Binding { class: String },
}

/// A caller's request. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub target: Target,
    pub operation: Operation,
    /// Hard deadline per attempt; the engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl OperationRequest {
    pub fn new(target: Target, operation: Operation) -> Self {
        Self {
            target,
            operation,
            timeout_ms: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn on_node(node_id: NodeId, operation: Operation) -> Self {
        Self::new(Target::Node { node_id }, operation)
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Identifier assigned to an accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0.simple())
    }
}

/// Final outcome of a request. Produced exactly once per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub request_id: RequestId,
    pub node_id: NodeId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<OperationOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    pub execution_time_ms: u64,
    pub attempts_used: u32,
}

impl OperationResult {
    pub fn succeeded(
        request_id: RequestId,
        node_id: NodeId,
        data: OperationOutput,
        execution_time_ms: u64,
        attempts_used: u32,
    ) -> Self {
        Self {
            request_id,
            node_id,
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms,
            attempts_used,
        }
    }

    pub fn failed(
        request_id: RequestId,
        node_id: NodeId,
        error: OperationError,
        execution_time_ms: u64,
        attempts_used: u32,
    ) -> Self {
        Self {
            request_id,
            node_id,
            success: false,
            data: None,
            error: Some(error),
            execution_time_ms,
            attempts_used,
        }
    }
}

/// Handle returned by [`crate::engine::Engine::submit`].
#[derive(Debug)]
pub struct OperationTicket {
    pub request_id: RequestId,
    pub node_id: NodeId,
    receiver: oneshot::Receiver<OperationResult>,
}

impl OperationTicket {
    pub(crate) fn new(
        request_id: RequestId,
        node_id: NodeId,
        receiver: oneshot::Receiver<OperationResult>,
    ) -> Self {
        Self {
            request_id,
            node_id,
            receiver,
        }
    }

    /// Wait for the result. A dropped engine resolves as cancelled.
    pub async fn wait(self) -> OperationResult {
        let (request_id, node_id) = (self.request_id, self.node_id);
        self.receiver.await.unwrap_or_else(|_| {
            OperationResult::failed(request_id, node_id, OperationError::Cancelled, 0, 0)
        })
    }
}
