//! Operation executor: one attempt of one operation against one node.
//!
//! The capability check happens before the provider is touched. The provider
//! call runs in its own task under a hard deadline; when the deadline passes
//! the task is detached and its eventual result is dropped, since a provider
//! call cannot be assumed to cancel cleanly.

use super::{ExtractField, Operation, OperationKind, OperationOutput};
use crate::container::NodeId;
use crate::error::OperationError;
use crate::page::{ElementRef, PageError, PageProvider};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What the executor needs to know about the target at dispatch time.
#[derive(Debug, Clone)]
pub struct ExecutionTarget {
    pub node_id: NodeId,
    pub element: Option<ElementRef>,
    pub capabilities: BTreeSet<OperationKind>,
    /// Definition defaults for an `extract` that names no fields.
    pub default_fields: Vec<ExtractField>,
}

/// Runs single attempts through a page provider.
#[derive(Clone)]
pub struct OperationExecutor {
    provider: Arc<dyn PageProvider>,
}

impl OperationExecutor {
    pub fn new(provider: Arc<dyn PageProvider>) -> Self {
        Self { provider }
    }

    /// Execute one attempt. The returned future owns everything it needs.
    pub fn execute(
        &self,
        target: ExecutionTarget,
        operation: Operation,
        timeout_ms: u64,
    ) -> impl Future<Output = Result<OperationOutput, OperationError>> + Send + 'static {
        let provider = Arc::clone(&self.provider);
        async move {
            let kind = operation.kind();
            if !target.capabilities.contains(&kind) {
                return Err(OperationError::CapabilityMismatch {
                    node: target.node_id,
                    operation: kind,
                });
            }
            let Some(element) = target.element else {
                return Err(OperationError::CapabilityMismatch {
                    node: target.node_id,
                    operation: kind,
                });
            };
            let operation = with_default_fields(operation, &target.default_fields);

            let call = tokio::spawn(async move { provider.perform(&element, &operation).await });
            match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
                Ok(Ok(Ok(output))) => Ok(output),
                Ok(Ok(Err(error))) => Err(classify(error)),
                Ok(Err(join_error)) => Err(OperationError::ProviderFailure {
                    message: format!("provider task failed: {join_error}"),
                }),
                Err(_) => {
                    debug!(node = %target.node_id, operation = %kind, timeout_ms, "operation abandoned at deadline");
                    Err(OperationError::OperationTimeout { timeout_ms })
                }
            }
        }
    }
}

fn with_default_fields(operation: Operation, defaults: &[ExtractField]) -> Operation {
    match operation {
        Operation::Extract { fields } if fields.is_empty() => {
            let fields = if defaults.is_empty() {
                vec![ExtractField::text("text", None)]
            } else {
                defaults.to_vec()
            };
            Operation::Extract { fields }
        }
        other => other,
    }
}

/// Map a provider error onto the operation error taxonomy.
///
/// Detached or not-yet-interactable elements are DOM churn from a
/// re-render and may succeed on retry; everything else is a hard failure.
pub fn classify(error: anyhow::Error) -> OperationError {
    match error.downcast_ref::<PageError>() {
        Some(page_error) if page_error.is_transient() => OperationError::DomMismatch {
            message: page_error.to_string(),
        },
        _ => OperationError::ProviderFailure {
            message: format!("{error:#}"),
        },
    }
}
