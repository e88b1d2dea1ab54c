//! HTML-snapshot page provider backed by `scraper`.
//!
//! Holds the document as a string and re-parses it on every query, so the
//! page can be swapped with [`StaticPage::set_html`] to simulate re-renders.
//! Element references are derived from the markup itself (`data-key`, then
//! `id`, then the element-index path), which keeps them stable across
//! re-renders the same way a live DOM keeps node identity.
//!
//! Geometry comes from inline `left`/`top`/`width`/`height` pixel styles;
//! elements without them get a 100×20 box at the origin.

use super::{
    ElementRef, ElementState, MutationKind, MutationRecord, PageError, PageProvider, Rect,
    SubscriptionId,
};
use crate::ops::{ExtractField, Operation, OperationOutput, ScrollDirection};
use anyhow::Result;
use async_trait::async_trait;
use scraper::{ElementRef as HtmlElement, Html, Selector};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

const DEFAULT_WIDTH: f64 = 100.0;
const DEFAULT_HEIGHT: f64 = 20.0;

struct PageState {
    url: String,
    html: String,
    next_subscription: u64,
    subscriptions: HashMap<SubscriptionId, ElementRef>,
    mutations: Vec<MutationRecord>,
    scroll: HashMap<ElementRef, f64>,
    performed: Vec<(ElementRef, Operation)>,
}

/// A page loaded from an HTML string.
pub struct StaticPage {
    state: Mutex<PageState>,
}

impl StaticPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(PageState {
                url: url.into(),
                html: html.into(),
                next_subscription: 1,
                subscriptions: HashMap::new(),
                mutations: Vec::new(),
                scroll: HashMap::new(),
                performed: Vec::new(),
            }),
        }
    }

    /// Replace the document and report a child-list mutation to every live
    /// subscription.
    pub async fn set_html(&self, html: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.html = html.into();
        let mut subscriptions: Vec<SubscriptionId> = state.subscriptions.keys().copied().collect();
        subscriptions.sort();
        for subscription in subscriptions {
            push_once(&mut state.mutations, subscription, MutationKind::ChildList);
        }
    }

    /// Replace the document without reporting any mutation.
    pub async fn set_html_silent(&self, html: impl Into<String>) {
        self.state.lock().await.html = html.into();
    }

    /// Operations issued so far, in order.
    pub async fn performed(&self) -> Vec<(ElementRef, Operation)> {
        self.state.lock().await.performed.clone()
    }

    /// Number of live mutation subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }
}

fn push_once(mutations: &mut Vec<MutationRecord>, subscription: SubscriptionId, kind: MutationKind) {
    let record = MutationRecord { subscription, kind };
    if !mutations.contains(&record) {
        mutations.push(record);
    }
}

fn parse_selector(selector: &str) -> Result<Selector, PageError> {
    Selector::parse(selector).map_err(|_| PageError::InvalidSelector(selector.to_string()))
}

/// Stable reference for an element: `key:`, `id:` or `path:` form.
fn element_key(element: &HtmlElement<'_>) -> ElementRef {
    let value = element.value();
    if let Some(key) = value.attr("data-key") {
        return ElementRef(format!("key:{key}"));
    }
    if let Some(id) = value.id() {
        return ElementRef(format!("id:{id}"));
    }
    let mut path = Vec::new();
    let mut current = Some(**element);
    while let Some(node) = current {
        if !node.value().is_element() {
            break;
        }
        path.push(node.prev_siblings().filter(|n| n.value().is_element()).count());
        current = node.parent();
    }
    path.reverse();
    let path: Vec<String> = path.iter().map(usize::to_string).collect();
    ElementRef(format!("path:{}", path.join("/")))
}

fn find<'a>(html: &'a Html, element: &ElementRef) -> Option<HtmlElement<'a>> {
    html.tree
        .root()
        .descendants()
        .filter_map(HtmlElement::wrap)
        .find(|candidate| element_key(candidate) == *element)
}

/// Inline style declarations, lower-cased.
fn inline_style(element: &HtmlElement<'_>) -> HashMap<String, String> {
    element
        .value()
        .attr("style")
        .unwrap_or_default()
        .split(';')
        .filter_map(|decl| {
            let (prop, value) = decl.split_once(':')?;
            Some((prop.trim().to_ascii_lowercase(), value.trim().to_ascii_lowercase()))
        })
        .collect()
}

fn px(style: &HashMap<String, String>, prop: &str) -> Option<f64> {
    style
        .get(prop)
        .and_then(|v| v.strip_suffix("px").unwrap_or(v).trim().parse().ok())
}

fn ancestors_and_self<'a>(element: &HtmlElement<'a>) -> impl Iterator<Item = HtmlElement<'a>> {
    std::iter::once(*element).chain(element.ancestors().filter_map(HtmlElement::wrap))
}

fn state_of(element: &HtmlElement<'_>) -> ElementState {
    let own = inline_style(element);
    let rect = Rect::new(
        px(&own, "left").unwrap_or(0.0),
        px(&own, "top").unwrap_or(0.0),
        px(&own, "width").unwrap_or(DEFAULT_WIDTH),
        px(&own, "height").unwrap_or(DEFAULT_HEIGHT),
    );

    let hidden_by_ancestor = ancestors_and_self(element).any(|el| {
        el.value().attr("hidden").is_some()
            || inline_style(&el).get("display").map(String::as_str) == Some("none")
    });
    let display = if hidden_by_ancestor {
        "none".to_string()
    } else {
        own.get("display").cloned().unwrap_or_else(|| "block".to_string())
    };
    // visibility inherits from the nearest ancestor that sets it
    let visibility = ancestors_and_self(element)
        .find_map(|el| inline_style(&el).get("visibility").cloned())
        .unwrap_or_else(|| "visible".to_string());

    ElementState {
        rect,
        display,
        visibility,
    }
}

fn normalized_text(element: &HtmlElement<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract(element: &HtmlElement<'_>, fields: &[ExtractField]) -> Result<OperationOutput, PageError> {
    let mut values = BTreeMap::new();
    for field in fields {
        let target = match &field.selector {
            Some(selector) => element.select(&parse_selector(selector)?).next(),
            None => Some(*element),
        };
        let value = target.and_then(|el| match &field.attribute {
            Some(attribute) => el.value().attr(attribute).map(str::to_string),
            None => Some(normalized_text(&el)),
        });
        values.insert(field.name.clone(), value);
    }
    Ok(OperationOutput::Extracted { values })
}

#[async_trait]
impl PageProvider for StaticPage {
    async fn query_all(&self, scope: Option<&ElementRef>, selector: &str) -> Result<Vec<ElementRef>> {
        let state = self.state.lock().await;
        let html = Html::parse_document(&state.html);
        let selector_parsed = parse_selector(selector)?;
        let found = match scope {
            None => html.select(&selector_parsed).map(|el| element_key(&el)).collect(),
            Some(scope_ref) => {
                let scope_el = find(&html, scope_ref)
                    .ok_or_else(|| PageError::Detached(scope_ref.clone()))?;
                scope_el
                    .select(&selector_parsed)
                    .filter(|el| *el != scope_el)
                    .map(|el| element_key(&el))
                    .collect()
            }
        };
        Ok(found)
    }

    async fn element_state(&self, element: &ElementRef) -> Result<Option<ElementState>> {
        let state = self.state.lock().await;
        let html = Html::parse_document(&state.html);
        Ok(find(&html, element).map(|el| state_of(&el)))
    }

    async fn perform(&self, element: &ElementRef, operation: &Operation) -> Result<OperationOutput> {
        let mut state = self.state.lock().await;
        let html = Html::parse_document(&state.html);
        let el = find(&html, element).ok_or_else(|| PageError::Detached(element.clone()))?;
        let geometry = state_of(&el);
        if operation.kind().requires_visibility() && !geometry.is_visible() {
            return Err(PageError::NotInteractable(element.clone(), "element is not visible".into()).into());
        }

        let output = match operation {
            Operation::Click => OperationOutput::Clicked,
            Operation::Type { text, .. } => OperationOutput::Typed {
                chars: text.chars().count(),
            },
            Operation::Scroll {
                direction,
                amount_px,
            } => {
                let viewport = geometry.rect.height;
                let content = el
                    .value()
                    .attr("data-scroll-height")
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(viewport);
                let max_top = (content - viewport).max(0.0);
                let current = state.scroll.get(element).copied().unwrap_or(0.0);
                let step = amount_px.map(f64::from).unwrap_or(viewport);
                let next = match direction {
                    ScrollDirection::Down => current + step,
                    ScrollDirection::Up => current - step,
                    ScrollDirection::ToEnd => max_top,
                    ScrollDirection::ToStart => 0.0,
                }
                .clamp(0.0, max_top);
                state.scroll.insert(element.clone(), next);
                OperationOutput::Scrolled {
                    scroll_top: next,
                    at_end: next >= max_top,
                }
            }
            Operation::Extract { fields } => extract(&el, fields)?,
            Operation::Hover => OperationOutput::Hovered,
            Operation::Focus => OperationOutput::Focused,
        };
        state.performed.push((element.clone(), operation.clone()));
        Ok(output)
    }

    async fn observe(&self, element: &ElementRef) -> Result<SubscriptionId> {
        let mut state = self.state.lock().await;
        let attached = {
            let html = Html::parse_document(&state.html);
            find(&html, element).is_some()
        };
        if !attached {
            return Err(PageError::Detached(element.clone()).into());
        }
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;
        state.subscriptions.insert(id, element.clone());
        Ok(id)
    }

    async fn unobserve(&self, subscription: SubscriptionId) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.subscriptions.remove(&subscription).is_none() {
            return Err(PageError::UnknownSubscription(subscription).into());
        }
        state.mutations.retain(|m| m.subscription != subscription);
        Ok(())
    }

    async fn take_mutations(&self) -> Result<Vec<MutationRecord>> {
        Ok(std::mem::take(&mut self.state.lock().await.mutations))
    }

    async fn url(&self) -> Result<String> {
        Ok(self.state.lock().await.url.clone())
    }
}
