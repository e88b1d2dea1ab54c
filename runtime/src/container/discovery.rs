//! Container discovery: match definitions against the page.
//!
//! Discovery is read-only. It walks the definition tree top-down, searching
//! each child definition only inside the element bound to its parent, and
//! returns a tree of [`Match`]es. Turning matches into nodes (and keeping
//! node ids stable) is the registry's job.

use crate::definition::resolver::ResolvedDefinitions;
use crate::definition::{ContainerDefinition, Disambiguation};
use crate::error::{EngineError, EngineResult};
use crate::page::{ElementRef, ElementState, PageError, PageProvider};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One definition matched (or not) at one place in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub definition_id: String,
    /// None when a single container's selector matched nothing.
    pub element: Option<ElementRef>,
    pub state: Option<ElementState>,
    pub children: Vec<Match>,
}

impl Match {
    fn absent(definition_id: &str) -> Self {
        Self {
            definition_id: definition_id.to_string(),
            element: None,
            state: None,
            children: Vec::new(),
        }
    }

    pub fn exists(&self) -> bool {
        self.element.is_some() && self.state.is_some()
    }

    pub fn visible(&self) -> bool {
        self.state.as_ref().is_some_and(ElementState::is_visible)
    }
}

/// A single-container selector matched several elements and one was picked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmbiguousMatch {
    pub definition_id: String,
    pub candidates: usize,
    pub strategy: String,
    pub chosen: ElementRef,
}

/// An element competing for a single container.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub element: ElementRef,
    pub state: ElementState,
    /// Position in document order.
    pub index: usize,
}

/// Picks one candidate when a single container matches several elements.
pub trait MatchStrategy: Send + Sync {
    /// Index into `candidates` (never empty, in document order).
    fn choose(&self, candidates: &[Candidate]) -> usize;
}

struct FirstMatch;

impl MatchStrategy for FirstMatch {
    fn choose(&self, _candidates: &[Candidate]) -> usize {
        0
    }
}

struct LastMatch;

impl MatchStrategy for LastMatch {
    fn choose(&self, candidates: &[Candidate]) -> usize {
        candidates.len().saturating_sub(1)
    }
}

struct LargestArea;

impl MatchStrategy for LargestArea {
    fn choose(&self, candidates: &[Candidate]) -> usize {
        let mut best = 0;
        for (i, c) in candidates.iter().enumerate() {
            // strict comparison keeps the earliest on ties
            if c.state.rect.area() > candidates[best].state.rect.area() {
                best = i;
            }
        }
        best
    }
}

/// Named disambiguation strategies. Built-ins are always present.
#[derive(Clone)]
pub struct StrategyTable {
    strategies: HashMap<String, Arc<dyn MatchStrategy>>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyTable {
    pub fn new() -> Self {
        let mut strategies: HashMap<String, Arc<dyn MatchStrategy>> = HashMap::new();
        strategies.insert("first".into(), Arc::new(FirstMatch));
        strategies.insert("last".into(), Arc::new(LastMatch));
        strategies.insert("largest_area".into(), Arc::new(LargestArea));
        Self { strategies }
    }

    pub fn register(&mut self, name: impl Into<String>, strategy: Arc<dyn MatchStrategy>) {
        self.strategies.insert(name.into(), strategy);
    }

    pub fn get(&self, rule: &Disambiguation) -> EngineResult<&Arc<dyn MatchStrategy>> {
        self.strategies
            .get(rule.strategy_name())
            .ok_or_else(|| EngineError::UnknownStrategy(rule.strategy_name().to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }
}

/// Result of a full pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    pub roots: Vec<Match>,
    pub ambiguities: Vec<AmbiguousMatch>,
}

/// A discovery pass over one page with one definition set.
pub struct Discovery<'a> {
    page: &'a dyn PageProvider,
    definitions: &'a ResolvedDefinitions,
    strategies: &'a StrategyTable,
    default_rule: &'a Disambiguation,
}

impl<'a> Discovery<'a> {
    pub fn new(
        page: &'a dyn PageProvider,
        definitions: &'a ResolvedDefinitions,
        strategies: &'a StrategyTable,
        default_rule: &'a Disambiguation,
    ) -> Self {
        Self {
            page,
            definitions,
            strategies,
            default_rule,
        }
    }

    /// Match every top-level definition against the document, recursively.
    pub async fn discover_all(&self) -> EngineResult<DiscoveryOutcome> {
        let mut outcome = DiscoveryOutcome::default();
        for def in self.definitions.children_of(None) {
            let matches = self.discover_group(def, None, &mut outcome.ambiguities).await?;
            outcome.roots.extend(matches);
        }
        debug!(roots = outcome.roots.len(), "discovery pass complete");
        Ok(outcome)
    }

    /// Match one definition inside `scope` (the document when None),
    /// including its descendants.
    ///
    /// A list definition yields one match per element (possibly none); a
    /// single definition always yields exactly one match, absent or not.
    pub fn discover_group<'s>(
        &'s self,
        def: &'s ContainerDefinition,
        scope: Option<&'s ElementRef>,
        ambiguities: &'s mut Vec<AmbiguousMatch>,
    ) -> BoxFuture<'s, EngineResult<Vec<Match>>> {
        async move {
            let found = self.query(def, scope).await?;

            let mut candidates = Vec::with_capacity(found.len());
            for (index, element) in found.into_iter().enumerate() {
                // an element may detach between query and measurement
                if let Some(state) = self.state_of(def, &element).await? {
                    candidates.push(Candidate {
                        element,
                        state,
                        index,
                    });
                }
            }

            if def.multiple {
                let mut matches = Vec::with_capacity(candidates.len());
                for c in candidates {
                    matches.push(self.with_children(def, c.element, c.state, ambiguities).await?);
                }
                return Ok(matches);
            }

            let chosen = match candidates.len() {
                0 => return Ok(vec![Match::absent(&def.id)]),
                1 => candidates.swap_remove(0),
                n => {
                    let rule = def.disambiguation.as_ref().unwrap_or(self.default_rule);
                    let strategy = self.strategies.get(rule)?;
                    let pick = strategy.choose(&candidates).min(n - 1);
                    let chosen = candidates.swap_remove(pick);
                    if def.disambiguation.is_some() {
                        debug!(definition = %def.id, candidates = n, chosen = %chosen.element, "disambiguated");
                    } else {
                        warn!(
                            definition = %def.id,
                            candidates = n,
                            strategy = rule.strategy_name(),
                            chosen = %chosen.element,
                            "selector matched several elements without a disambiguation rule"
                        );
                        ambiguities.push(AmbiguousMatch {
                            definition_id: def.id.clone(),
                            candidates: n,
                            strategy: rule.strategy_name().to_string(),
                            chosen: chosen.element.clone(),
                        });
                    }
                    chosen
                }
            };
            let matched = self
                .with_children(def, chosen.element, chosen.state, ambiguities)
                .await?;
            Ok(vec![matched])
        }
        .boxed()
    }

    /// Re-evaluate an already bound list element and its subtree.
    ///
    /// The element must still satisfy the selector inside `scope`; a
    /// detached or no longer matching element comes back absent.
    pub async fn rediscover_element(
        &self,
        def: &ContainerDefinition,
        element: &ElementRef,
        scope: Option<&ElementRef>,
        ambiguities: &mut Vec<AmbiguousMatch>,
    ) -> EngineResult<Match> {
        if !self.query(def, scope).await?.contains(element) {
            return Ok(Match::absent(&def.id));
        }
        match self.state_of(def, element).await? {
            Some(state) => {
                self.with_children(def, element.clone(), state, ambiguities)
                    .await
            }
            None => Ok(Match::absent(&def.id)),
        }
    }

    /// Matches inside `scope`. A scope that detached matches nothing.
    async fn query(
        &self,
        def: &ContainerDefinition,
        scope: Option<&ElementRef>,
    ) -> EngineResult<Vec<ElementRef>> {
        match self.page.query_all(scope, &def.selector).await {
            Ok(found) => Ok(found),
            Err(e) if matches!(e.downcast_ref::<PageError>(), Some(PageError::Detached(_))) => {
                debug!(definition = %def.id, "scope detached during discovery");
                Ok(Vec::new())
            }
            Err(e) => Err(failure(def, e)),
        }
    }

    async fn state_of(
        &self,
        def: &ContainerDefinition,
        element: &ElementRef,
    ) -> EngineResult<Option<ElementState>> {
        self.page
            .element_state(element)
            .await
            .map_err(|e| failure(def, e))
    }

    async fn with_children(
        &self,
        def: &ContainerDefinition,
        element: ElementRef,
        state: ElementState,
        ambiguities: &mut Vec<AmbiguousMatch>,
    ) -> EngineResult<Match> {
        let mut children = Vec::new();
        for child in self.definitions.children_of(Some(def.id.as_str())) {
            let matches = self
                .discover_group(child, Some(&element), ambiguities)
                .await?;
            children.extend(matches);
        }
        Ok(Match {
            definition_id: def.id.clone(),
            element: Some(element),
            state: Some(state),
            children,
        })
    }
}

fn failure(def: &ContainerDefinition, error: anyhow::Error) -> EngineError {
    EngineError::DiscoveryFailure {
        scope: def.id.clone(),
        message: format!("{error:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OperationKind;
    use crate::page::snapshot::StaticPage;
    use crate::page::Rect;

    fn feed_definitions() -> ResolvedDefinitions {
        ResolvedDefinitions::from_definitions(&[
            ContainerDefinition::new("feed_list", "#feed").allow([OperationKind::Scroll]),
            ContainerDefinition::new("feed_item", ".item")
                .child_of("feed_list")
                .list()
                .allow([OperationKind::Click, OperationKind::Extract]),
            ContainerDefinition::new("item_title", "h2").child_of("feed_item"),
            ContainerDefinition::new("sidebar", "#sidebar"),
            ContainerDefinition::new("sidebar_ad", ".ad").child_of("sidebar"),
        ])
        .unwrap()
    }

    const FEED: &str = r#"
        <main id="feed">
          <div class="item" data-key="1"><h2>One</h2></div>
          <div class="item" data-key="2"><h2>Two</h2></div>
          <div class="item" data-key="3"><h2>Three</h2></div>
        </main>
        <div class="item" data-key="outside"><h2>Not in feed</h2></div>"#;

    async fn run(page: &StaticPage, defs: &ResolvedDefinitions) -> DiscoveryOutcome {
        let strategies = StrategyTable::new();
        let rule = Disambiguation::First;
        Discovery::new(page, defs, &strategies, &rule)
            .discover_all()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_children_are_scoped_to_parent_element() {
        let page = StaticPage::new("https://example.com/", FEED);
        let outcome = run(&page, &feed_definitions()).await;

        assert_eq!(outcome.roots.len(), 2);
        let feed = &outcome.roots[0];
        assert!(feed.exists());
        assert_eq!(feed.children.len(), 3, "the item outside #feed is not a child");
        for item in &feed.children {
            assert_eq!(item.definition_id, "feed_item");
            assert_eq!(item.children.len(), 1);
            assert!(item.children[0].exists());
        }
    }

    #[tokio::test]
    async fn test_absent_parent_has_no_children() {
        let page = StaticPage::new("https://example.com/", FEED);
        let outcome = run(&page, &feed_definitions()).await;
        let sidebar = &outcome.roots[1];
        assert_eq!(sidebar.definition_id, "sidebar");
        assert!(!sidebar.exists());
        assert!(sidebar.children.is_empty());
    }

    #[tokio::test]
    async fn test_empty_list_yields_no_matches() {
        let page = StaticPage::new("https://example.com/", r#"<main id="feed"></main>"#);
        let outcome = run(&page, &feed_definitions()).await;
        assert!(outcome.roots[0].exists());
        assert!(outcome.roots[0].children.is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_match_reported_only_without_rule() {
        let page = StaticPage::new(
            "https://example.com/",
            r#"<div class="panel" id="small" style="width: 10px; height: 10px"></div>
               <div class="panel" id="big" style="width: 300px; height: 300px"></div>
               <div class="panel" id="also-big" style="width: 300px; height: 300px"></div>"#,
        );
        let defs = ResolvedDefinitions::from_definitions(&[
            ContainerDefinition::new("panel", ".panel").with_disambiguation(Disambiguation::LargestArea),
            ContainerDefinition::new("any_panel", ".panel"),
        ])
        .unwrap();
        let outcome = run(&page, &defs).await;

        assert_eq!(outcome.roots[0].element, Some(ElementRef::new("id:big")));
        assert_eq!(outcome.roots[1].element, Some(ElementRef::new("id:small")));
        // only the rule-less definition is reported
        assert_eq!(outcome.ambiguities.len(), 1);
        assert_eq!(outcome.ambiguities[0].definition_id, "any_panel");
        assert_eq!(outcome.ambiguities[0].strategy, "first");
        assert_eq!(outcome.ambiguities[0].candidates, 3);
    }

    #[tokio::test]
    async fn test_custom_strategy_and_unknown_strategy() {
        struct Middle;
        impl MatchStrategy for Middle {
            fn choose(&self, candidates: &[Candidate]) -> usize {
                candidates.len() / 2
            }
        }

        let page = StaticPage::new(
            "https://example.com/",
            r#"<p id="a"></p><p id="b"></p><p id="c"></p>"#,
        );
        let defs = ResolvedDefinitions::from_definitions(&[ContainerDefinition::new("p", "p")
            .with_disambiguation(Disambiguation::Custom("middle".into()))])
        .unwrap();
        let rule = Disambiguation::First;

        let mut strategies = StrategyTable::new();
        let err = Discovery::new(&page, &defs, &strategies, &rule)
            .discover_all()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownStrategy(name) if name == "middle"));

        strategies.register("middle", Arc::new(Middle));
        let outcome = Discovery::new(&page, &defs, &strategies, &rule)
            .discover_all()
            .await
            .unwrap();
        assert_eq!(outcome.roots[0].element, Some(ElementRef::new("id:b")));
    }

    #[tokio::test]
    async fn test_rediscover_detached_element() {
        let page = StaticPage::new("https://example.com/", FEED);
        let defs = feed_definitions();
        let strategies = StrategyTable::new();
        let rule = Disambiguation::First;
        let discovery = Discovery::new(&page, &defs, &strategies, &rule);
        let item_def = defs.get("feed_item").unwrap();
        let mut ambiguities = Vec::new();

        let feed = ElementRef::new("id:feed");

        let item = discovery
            .rediscover_element(item_def, &ElementRef::new("key:2"), Some(&feed), &mut ambiguities)
            .await
            .unwrap();
        assert!(item.exists());
        assert_eq!(item.children.len(), 1);

        let gone = discovery
            .rediscover_element(item_def, &ElementRef::new("key:99"), Some(&feed), &mut ambiguities)
            .await
            .unwrap();
        assert!(!gone.exists());
        assert!(gone.children.is_empty());

        // present in the page, but no longer inside the parent's region
        let moved = discovery
            .rediscover_element(item_def, &ElementRef::new("key:outside"), Some(&feed), &mut ambiguities)
            .await
            .unwrap();
        assert!(!moved.exists());

        let orphaned_scope = discovery
            .rediscover_element(item_def, &ElementRef::new("key:2"), Some(&ElementRef::new("id:old")), &mut ambiguities)
            .await
            .unwrap();
        assert!(!orphaned_scope.exists());
    }

    #[tokio::test]
    async fn test_provider_errors_become_discovery_failures() {
        let page = StaticPage::new("https://example.com/", FEED);
        let defs = ResolvedDefinitions::from_definitions(&[ContainerDefinition::new("bad", "#feed")])
            .unwrap();
        let strategies = StrategyTable::new();
        let rule = Disambiguation::First;
        let discovery = Discovery::new(&page, &defs, &strategies, &rule);
        let mut bad = defs.get("bad").unwrap().clone();
        bad.selector = "div[".into();
        let mut ambiguities = Vec::new();
        let err = discovery
            .discover_group(&bad, None, &mut ambiguities)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DiscoveryFailure { scope, .. } if scope == "bad"));
    }

    #[test]
    fn test_largest_area_ties_keep_document_order() {
        let c = |i: usize, w: f64| Candidate {
            element: ElementRef::new(format!("e{i}")),
            state: ElementState {
                rect: Rect::new(0.0, 0.0, w, 10.0),
                display: "block".into(),
                visibility: "visible".into(),
            },
            index: i,
        };
        let candidates = vec![c(0, 5.0), c(1, 50.0), c(2, 50.0)];
        assert_eq!(LargestArea.choose(&candidates), 1);
        assert_eq!(LastMatch.choose(&candidates), 2);
        assert_eq!(FirstMatch.choose(&candidates), 0);
    }
}
