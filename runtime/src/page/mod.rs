//! Page/DOM access abstraction.
//!
//! Defines the [`PageProvider`] trait the engine uses to query the DOM,
//! read element geometry, subscribe to mutations and issue input events.
//! Two providers ship with the crate: [`chromium::ChromiumPage`] (a live
//! headless browser via chromiumoxide) and [`snapshot::StaticPage`] (an
//! HTML snapshot, used offline and in tests).

pub mod chromium;
pub mod script;
pub mod snapshot;

use crate::ops::{Operation, OperationOutput};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, stable identity of a DOM element within one provider.
///
/// Two references compare equal exactly when they denote the same element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementRef(pub String);

impl ElementRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bounding box in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Geometry and computed style of an attached element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementState {
    pub rect: Rect,
    /// Computed `display` value.
    pub display: String,
    /// Computed `visibility` value.
    pub visibility: String,
}

impl ElementState {
    /// Visible means a non-empty box that is neither `display: none` nor
    /// `visibility: hidden|collapse`. DOM presence alone is not enough.
    pub fn is_visible(&self) -> bool {
        self.rect.area() > 0.0
            && self.display != "none"
            && self.visibility != "hidden"
            && self.visibility != "collapse"
    }
}

/// Handle to a mutation subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

/// What changed inside an observed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationKind {
    ChildList,
    Attributes,
    CharacterData,
}

/// One observed change, reported against its subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub subscription: SubscriptionId,
    pub kind: MutationKind,
}

/// Errors a provider can classify for the engine.
///
/// Providers return `anyhow::Error`; wrapping one of these lets the engine
/// distinguish transient DOM churn from hard failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    #[error("element {0} is no longer attached to the document")]
    Detached(ElementRef),

    #[error("element {0} cannot receive input: {1}")]
    NotInteractable(ElementRef, String),

    #[error("invalid selector `{0}`")]
    InvalidSelector(String),

    #[error("unknown subscription {0:?}")]
    UnknownSubscription(SubscriptionId),
}

impl PageError {
    /// Whether retrying after the next re-render may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PageError::Detached(_) | PageError::NotInteractable(..))
    }
}

/// DOM access supplied by the browser-automation host.
#[async_trait]
pub trait PageProvider: Send + Sync {
    /// All elements matching `selector`, in document order, searched inside
    /// `scope` (descendants only) or the whole document when `scope` is None.
    async fn query_all(&self, scope: Option<&ElementRef>, selector: &str) -> Result<Vec<ElementRef>>;

    /// Geometry and style of an element, or None once it is detached.
    async fn element_state(&self, element: &ElementRef) -> Result<Option<ElementState>>;

    /// Issue one operation against an element.
    async fn perform(&self, element: &ElementRef, operation: &Operation) -> Result<OperationOutput>;

    /// Start observing mutations inside an element's subtree.
    async fn observe(&self, element: &ElementRef) -> Result<SubscriptionId>;

    /// Stop observing. Unknown subscriptions are an error.
    async fn unobserve(&self, subscription: SubscriptionId) -> Result<()>;

    /// Drain the mutation records gathered since the last call.
    async fn take_mutations(&self) -> Result<Vec<MutationRecord>>;

    /// URL of the loaded document.
    async fn url(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(width: f64, height: f64, display: &str, visibility: &str) -> ElementState {
        ElementState {
            rect: Rect::new(0.0, 0.0, width, height),
            display: display.to_string(),
            visibility: visibility.to_string(),
        }
    }

    #[test]
    fn test_visibility_rule() {
        assert!(state(10.0, 10.0, "block", "visible").is_visible());
        assert!(!state(0.0, 10.0, "block", "visible").is_visible());
        assert!(!state(10.0, 10.0, "none", "visible").is_visible());
        assert!(!state(10.0, 10.0, "block", "hidden").is_visible());
        assert!(!state(10.0, 10.0, "block", "collapse").is_visible());
    }

    #[test]
    fn test_negative_extent_has_no_area() {
        assert_eq!(Rect::new(0.0, 0.0, -5.0, 10.0).area(), 0.0);
    }

    #[test]
    fn test_transient_errors() {
        assert!(PageError::Detached(ElementRef::new("3")).is_transient());
        assert!(!PageError::InvalidSelector("[".into()).is_transient());
    }
}
