//! Error taxonomy for the container engine.
//!
//! Three families:
//! - [`DefinitionError`]: the definition library is malformed or does not
//!   cover the requested page.
//! - [`EngineError`]: failures surfaced by [`crate::engine::Engine`] calls.
//! - [`OperationError`]: the structured error carried inside an
//!   [`crate::ops::OperationResult`].

use crate::container::lifecycle::LifecycleState;
use crate::container::NodeId;
use crate::ops::OperationKind;
use serde::{Deserialize, Serialize};

/// Problems with container definitions or their resolution.
#[derive(thiserror::Error, Debug)]
pub enum DefinitionError {
    #[error("no site in the library covers host `{0}`")]
    UnknownSite(String),

    #[error("site `{site}` has no page matching `{path}`")]
    NoMatchingPage { site: String, path: String },

    #[error("invalid page url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("duplicate container id `{0}`")]
    DuplicateId(String),

    #[error("container `{id}` names unknown parent `{parent}`")]
    UnknownParent { id: String, parent: String },

    #[error("container `{0}` is its own ancestor")]
    ParentCycle(String),

    #[error("container `{id}`: {reason}")]
    InvalidDefinition { id: String, reason: String },

    #[error("invalid url pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by engine entry points.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("discovery of {scope} timed out after {timeout_ms}ms")]
    DiscoveryTimeout { scope: String, timeout_ms: u64 },

    #[error("discovery of {scope} failed: {message}")]
    DiscoveryFailure { scope: String, message: String },

    #[error("node {node} is unavailable ({state})")]
    TargetUnavailable { node: NodeId, state: LifecycleState },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("no binding available for `{class}` ({operation})")]
    NoBindingAvailable {
        class: String,
        operation: OperationKind,
    },

    #[error("no container is focused")]
    NoFocusedContainer,

    #[error("unknown disambiguation strategy `{0}`")]
    UnknownStrategy(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("page provider error: {0}")]
    Page(String),
}

/// Structured failure of a single operation request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum OperationError {
    #[error("`{operation}` is not a current capability of node {node}")]
    CapabilityMismatch {
        node: NodeId,
        operation: OperationKind,
    },

    #[error("node {node} is unavailable ({state})")]
    TargetUnavailable { node: NodeId, state: LifecycleState },

    #[error("operation timed out after {timeout_ms}ms")]
    OperationTimeout { timeout_ms: u64 },

    #[error("element changed underneath the operation: {message}")]
    DomMismatch { message: String },

    #[error("page provider failed: {message}")]
    ProviderFailure { message: String },

    #[error("no binding available for `{class}`")]
    NoBindingAvailable { class: String },

    #[error("request cancelled")]
    Cancelled,
}

impl OperationError {
    /// Whether the scheduler may re-enqueue the request.
    ///
    /// Only transient conditions qualify. Capability and binding errors
    /// indicate a logic or configuration mismatch and are surfaced at once.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperationError::OperationTimeout { .. } | OperationError::DomMismatch { .. }
        )
    }

    /// Short machine-readable code, matching the serialized tag.
    pub fn code(&self) -> &'static str {
        match self {
            OperationError::CapabilityMismatch { .. } => "capability_mismatch",
            OperationError::TargetUnavailable { .. } => "target_unavailable",
            OperationError::OperationTimeout { .. } => "operation_timeout",
            OperationError::DomMismatch { .. } => "dom_mismatch",
            OperationError::ProviderFailure { .. } => "provider_failure",
            OperationError::NoBindingAvailable { .. } => "no_binding_available",
            OperationError::Cancelled => "cancelled",
        }
    }
}

/// Result alias for engine entry points.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
