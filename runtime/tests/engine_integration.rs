//! Engine integration tests.
//!
//! Drives the public engine API against the `StaticPage` provider, wrapped in
//! a `ProbePage` that counts and optionally stalls or fails provider calls.

use assert_json_diff::assert_json_eq;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use trellis_runtime::clock::ManualClock;
use trellis_runtime::config::EngineConfig;
use trellis_runtime::container::lifecycle::{LifecycleState, TriggerKind};
use trellis_runtime::container::{NodeId, TreeSnapshot};
use trellis_runtime::definition::library::DefinitionLibrary;
use trellis_runtime::definition::resolver::{DefinitionResolver, ResolvedDefinitions};
use trellis_runtime::definition::{ContainerDefinition, RefreshPolicy};
use trellis_runtime::engine::Engine;
use trellis_runtime::error::{EngineError, OperationError};
use trellis_runtime::events::EngineEvent;
use trellis_runtime::ops::{
    ExtractField, Operation, OperationKind, OperationOutput, OperationRequest, RetryPolicy, Target,
};
use trellis_runtime::page::snapshot::StaticPage;
use trellis_runtime::page::{ElementRef, ElementState, MutationRecord, PageProvider, SubscriptionId};

// ── Probe provider ──

#[derive(Default)]
struct Probe {
    performs: AtomicUsize,
    stall: AtomicBool,
    fail_queries: AtomicBool,
    perform_delay_ms: AtomicUsize,
    active: Mutex<HashMap<ElementRef, usize>>,
    max_active_per_element: AtomicUsize,
    active_total: AtomicUsize,
    max_active_total: AtomicUsize,
}

struct ProbePage {
    inner: StaticPage,
    probe: Probe,
}

impl ProbePage {
    fn new(url: &str, html: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: StaticPage::new(url, html),
            probe: Probe::default(),
        })
    }

    fn performs(&self) -> usize {
        self.probe.performs.load(Ordering::SeqCst)
    }

    fn enter(&self, element: &ElementRef) {
        let mut active = self.probe.active.lock().unwrap();
        let count = active.entry(element.clone()).or_default();
        *count += 1;
        self.probe.max_active_per_element.fetch_max(*count, Ordering::SeqCst);
        let total = self.probe.active_total.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_active_total.fetch_max(total, Ordering::SeqCst);
    }

    fn leave(&self, element: &ElementRef) {
        let mut active = self.probe.active.lock().unwrap();
        if let Some(count) = active.get_mut(element) {
            *count -= 1;
        }
        self.probe.active_total.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PageProvider for ProbePage {
    async fn query_all(&self, scope: Option<&ElementRef>, selector: &str) -> anyhow::Result<Vec<ElementRef>> {
        if self.probe.fail_queries.load(Ordering::SeqCst) {
            anyhow::bail!("renderer crashed");
        }
        self.inner.query_all(scope, selector).await
    }

    async fn element_state(&self, element: &ElementRef) -> anyhow::Result<Option<ElementState>> {
        self.inner.element_state(element).await
    }

    async fn perform(&self, element: &ElementRef, operation: &Operation) -> anyhow::Result<OperationOutput> {
        self.probe.performs.fetch_add(1, Ordering::SeqCst);
        if self.probe.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.enter(element);
        let delay = self.probe.perform_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let out = self.inner.perform(element, operation).await;
        self.leave(element);
        out
    }

    async fn observe(&self, element: &ElementRef) -> anyhow::Result<SubscriptionId> {
        self.inner.observe(element).await
    }

    async fn unobserve(&self, subscription: SubscriptionId) -> anyhow::Result<()> {
        self.inner.unobserve(subscription).await
    }

    async fn take_mutations(&self) -> anyhow::Result<Vec<MutationRecord>> {
        self.inner.take_mutations().await
    }

    async fn url(&self) -> anyhow::Result<String> {
        self.inner.url().await
    }
}

// ── Fixtures ──

const URL: &str = "https://news.example.com/feed";

fn feed_html(keys: &[&str]) -> String {
    let items: String = keys
        .iter()
        .map(|k| format!(r#"<article class="post" data-key="{k}"><h2>Post {k}</h2><a href="/p/{k}">open</a></article>"#))
        .collect();
    format!(r#"<main id="feed">{items}</main><footer id="more"><button>Load more</button></footer>"#)
}

fn policy(debounce_ms: u64) -> RefreshPolicy {
    RefreshPolicy {
        debounce_ms,
        max_refresh_retries: 3,
        retry_delay_ms: 100,
        ..RefreshPolicy::default()
    }
}

fn definitions(debounce_ms: u64) -> ResolvedDefinitions {
    ResolvedDefinitions::from_definitions(&[
        ContainerDefinition::new("feed", "#feed")
            .allow([OperationKind::Scroll, OperationKind::Extract])
            .with_policy(policy(debounce_ms)),
        ContainerDefinition::new("post", ".post")
            .child_of("feed")
            .list()
            .allow([OperationKind::Click, OperationKind::Extract])
            .with_policy(policy(debounce_ms))
            .with_extract(vec![
                ExtractField::text("title", Some("h2")),
                ExtractField::attribute("link", Some("a"), "href"),
            ]),
        ContainerDefinition::new("load_more", "#more button").allow([OperationKind::Click]),
    ])
    .unwrap()
}

fn manual_engine(page: Arc<ProbePage>, debounce_ms: u64) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let engine = Engine::new(page, definitions(debounce_ms), EngineConfig::default())
        .unwrap()
        .with_clock(clock.clone());
    (engine, clock)
}

fn posts(snapshot: &TreeSnapshot) -> Vec<NodeId> {
    snapshot.by_definition("post").map(|n| n.node_id).collect()
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// ── Tree maintenance ──

#[tokio::test]
async fn test_removed_item_is_evicted_and_others_keep_ids() {
    let page = ProbePage::new(URL, &feed_html(&["a", "b", "c"]));
    let (mut engine, clock) = manual_engine(page.clone(), 0);
    let before = posts(&engine.discover().await.unwrap());
    assert_eq!(before.len(), 3);
    let mut events = engine.subscribe();

    page.inner.set_html(feed_html(&["a", "c"])).await;
    clock.advance(5);
    engine.tick().await.unwrap();

    let after = posts(&engine.snapshot());
    assert_eq!(after, vec![before[0], before[2]]);

    let evicted: Vec<NodeId> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::NodeEvicted { node_id, definition_id } if definition_id == "post" => Some(node_id),
            _ => None,
        })
        .collect();
    assert_eq!(evicted, vec![before[1]]);
}

#[tokio::test]
async fn test_discovery_is_idempotent_on_unchanged_page() {
    let page = ProbePage::new(URL, &feed_html(&["a", "b"]));
    let (mut engine, _clock) = manual_engine(page, 0);
    let first = engine.discover().await.unwrap();
    let second = engine.discover().await.unwrap();

    assert_eq!(first.root_node_ids, second.root_node_ids);
    assert_json_eq!(
        serde_json::to_value(&first.nodes).unwrap(),
        serde_json::to_value(&second.nodes).unwrap()
    );
}

#[tokio::test]
async fn test_mutation_triggers_coalesce_into_one_refresh() {
    let page = ProbePage::new(URL, &feed_html(&["a"]));
    let (mut engine, clock) = manual_engine(page.clone(), 250);
    let feed = engine.discover().await.unwrap().root_node_ids[0];
    let mut events = engine.subscribe();

    page.inner.set_html(feed_html(&["a", "b"])).await;
    engine.tick().await.unwrap();
    clock.advance(100);
    page.inner.set_html(feed_html(&["a", "b", "c"])).await;
    engine.tick().await.unwrap();

    clock.advance(200);
    assert!(engine.tick().await.unwrap().refreshed.is_empty(), "debounce re-armed at t=100");
    clock.advance(50);
    let report = engine.tick().await.unwrap();
    let items = posts(&engine.snapshot());
    assert_eq!(items.len(), 3);
    assert!(report.refreshed.contains(&feed));
    assert!(
        !report.refreshed.iter().any(|id| items.contains(id)),
        "posts are covered by the feed's pass"
    );

    let completed: Vec<EngineEvent> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::RefreshCompleted { node_id, .. } if *node_id == feed))
        .collect();
    assert_eq!(completed.len(), 1);
    let EngineEvent::RefreshCompleted { node_id, trigger, coalesced, latency_ms, .. } = &completed[0] else {
        unreachable!()
    };
    assert_eq!(*node_id, feed);
    assert_eq!(*trigger, TriggerKind::Mutation);
    assert_eq!(*coalesced, 1);
    assert_eq!(*latency_ms, 350);
}

#[tokio::test]
async fn test_repeated_refresh_failures_suspend_until_manual_trigger() {
    let page = ProbePage::new(URL, &feed_html(&["a"]));
    let (mut engine, clock) = manual_engine(page.clone(), 0);
    let feed = engine.discover().await.unwrap().root_node_ids[0];
    let mut events = engine.subscribe();

    page.probe.fail_queries.store(true, Ordering::SeqCst);
    engine.trigger(feed).unwrap();
    for _ in 0..3 {
        let report = engine.tick().await.unwrap();
        assert_eq!(report.failed, vec![feed]);
        clock.advance(100);
    }
    assert_eq!(engine.state_of(feed).unwrap(), LifecycleState::Error);
    let suspended = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::RefreshFailed { suspended: true, failures: 3, .. }))
        .count();
    assert_eq!(suspended, 1);

    // automatic triggers are ignored while suspended
    page.probe.fail_queries.store(false, Ordering::SeqCst);
    page.inner.set_html(feed_html(&["a", "b"])).await;
    let report = engine.tick().await.unwrap();
    assert!(!report.refreshed.contains(&feed));
    assert_eq!(engine.state_of(feed).unwrap(), LifecycleState::Error);
    assert_eq!(posts(&engine.snapshot()).len(), 1, "children stay frozen");

    // operations are refused at submit time
    let err = engine
        .submit(OperationRequest::on_node(feed, Operation::Extract { fields: vec![] }))
        .unwrap_err();
    assert!(matches!(err, EngineError::TargetUnavailable { state: LifecycleState::Error, .. }));

    // a manual trigger recovers
    engine.trigger(feed).unwrap();
    let report = engine.tick().await.unwrap();
    assert_eq!(report.refreshed, vec![feed]);
    assert_eq!(engine.state_of(feed).unwrap(), LifecycleState::Stable);
    assert_eq!(posts(&engine.snapshot()).len(), 2);
}

#[tokio::test]
async fn test_interval_refreshes_on_period_and_skips_error_nodes() {
    let page = ProbePage::new(URL, &feed_html(&["a"]));
    let clock = Arc::new(ManualClock::new(0));
    let ticking = RefreshPolicy {
        interval_ms: Some(1_000),
        triggers: BTreeSet::from([TriggerKind::Interval]),
        debounce_ms: 0,
        max_refresh_retries: 1,
        ..RefreshPolicy::default()
    };
    let defs = ResolvedDefinitions::from_definitions(&[
        ContainerDefinition::new("feed", "#feed").with_policy(ticking),
    ])
    .unwrap();
    let mut engine = Engine::new(page.clone(), defs, EngineConfig::default())
        .unwrap()
        .with_clock(clock.clone());
    let feed = engine.discover().await.unwrap().root_node_ids[0];
    assert_eq!(engine.next_refresh_at(), Some(1_000));

    clock.advance(999);
    assert!(engine.tick().await.unwrap().refreshed.is_empty());
    clock.advance(1);
    assert_eq!(engine.tick().await.unwrap().refreshed, vec![feed]);
    clock.advance(1_000);
    assert_eq!(engine.tick().await.unwrap().refreshed, vec![feed]);

    // one failure exhausts the budget and suspends the node
    page.probe.fail_queries.store(true, Ordering::SeqCst);
    clock.advance(1_000);
    assert_eq!(engine.tick().await.unwrap().failed, vec![feed]);
    assert_eq!(engine.state_of(feed).unwrap(), LifecycleState::Error);

    page.probe.fail_queries.store(false, Ordering::SeqCst);
    for _ in 0..2 {
        clock.advance(1_000);
        let report = engine.tick().await.unwrap();
        assert!(report.refreshed.is_empty() && report.failed.is_empty());
        assert_eq!(report.triggered, 0);
    }
    assert_eq!(engine.state_of(feed).unwrap(), LifecycleState::Error);
}

#[tokio::test]
async fn test_definitions_from_library_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("library.json");
    std::fs::write(
        &path,
        r##"{
          "sites": [{
            "site": "news",
            "hosts": ["example.com"],
            "pages": [{
              "page_type": "feed",
              "url_pattern": "^/feed",
              "containers": [
                { "id": "post", "selector": ".post", "parent_id": "feed", "multiple": true,
                  "allowed_operations": ["click"] },
                { "id": "feed", "selector": "#feed" }
              ]
            }]
          }]
        }"##,
    )
    .unwrap();

    let library = DefinitionLibrary::load(&path).unwrap();
    assert!(library.validate().is_empty());
    let resolver = DefinitionResolver::new(library).unwrap();
    let page = ProbePage::new(URL, &feed_html(&["a", "b"]));
    let mut engine = Engine::attach(page, &resolver, EngineConfig::default())
        .await
        .unwrap();

    let snapshot = engine.discover().await.unwrap();
    assert_eq!(snapshot.site, "news");
    assert_eq!(snapshot.page_type, "feed");
    assert_eq!(posts(&snapshot).len(), 2);
}

// ── Operations ──

#[tokio::test]
async fn test_capability_mismatch_never_reaches_provider() {
    let page = ProbePage::new(URL, &feed_html(&["a"]));
    let (mut engine, _clock) = manual_engine(page.clone(), 0);
    let feed = engine.discover().await.unwrap().root_node_ids[0];

    let ticket = engine
        .submit(OperationRequest::on_node(feed, Operation::Click).with_retry(RetryPolicy::attempts(5)))
        .unwrap();
    engine.run_operations().await;
    let result = ticket.wait().await;

    assert!(!result.success);
    assert_eq!(result.attempts_used, 0);
    assert_eq!(
        result.error,
        Some(OperationError::CapabilityMismatch {
            node: feed,
            operation: OperationKind::Click
        })
    );
    assert_eq!(page.performs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_consume_exactly_the_retry_budget() {
    let page = ProbePage::new(URL, &feed_html(&["a"]));
    let mut engine = Engine::new(page.clone(), definitions(0), EngineConfig::default()).unwrap();
    let post = posts(&engine.discover().await.unwrap())[0];
    page.probe.stall.store(true, Ordering::SeqCst);

    let ticket = engine
        .submit(
            OperationRequest::on_node(post, Operation::Click)
                .with_timeout(2_000)
                .with_retry(RetryPolicy::attempts(2)),
        )
        .unwrap();
    engine.run_operations().await;
    let result = ticket.wait().await;

    assert_eq!(result.error, Some(OperationError::OperationTimeout { timeout_ms: 2_000 }));
    assert_eq!(result.attempts_used, 2);
    assert_eq!(page.performs(), 2);
    // two deadlines plus one backoff step
    assert!(result.execution_time_ms >= 4_250);
}

#[tokio::test(start_paused = true)]
async fn test_one_operation_in_flight_per_node() {
    let page = ProbePage::new(URL, &feed_html(&["a", "b"]));
    page.probe.perform_delay_ms.store(10, Ordering::SeqCst);
    let mut engine = Engine::new(page.clone(), definitions(0), EngineConfig::default()).unwrap();
    let ids = posts(&engine.discover().await.unwrap());

    let mut tickets = Vec::new();
    for _ in 0..3 {
        for id in &ids {
            let request = OperationRequest::on_node(*id, Operation::Extract { fields: vec![] });
            tickets.push(engine.submit(request).unwrap());
        }
    }
    let results = engine.run_operations().await;
    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(page.probe.max_active_per_element.load(Ordering::SeqCst), 1);
    assert_eq!(page.probe.max_active_total.load(Ordering::SeqCst), 2);

    // per-node FIFO: results for one node complete in submission order
    for id in &ids {
        let submitted: Vec<_> = tickets.iter().filter(|t| t.node_id == *id).map(|t| t.request_id).collect();
        let completed: Vec<_> = results.iter().filter(|r| r.node_id == *id).map(|r| r.request_id).collect();
        assert_eq!(submitted, completed);
    }

    let OperationOutput::Extracted { values } = results[0].data.clone().unwrap() else {
        panic!("expected extracted output");
    };
    assert!(values.contains_key("title"));
    assert!(values.contains_key("link"));
}

#[tokio::test]
async fn test_request_for_node_retired_before_dispatch_fails_without_execution() {
    let page = ProbePage::new(URL, &feed_html(&["a", "b"]));
    let (mut engine, clock) = manual_engine(page.clone(), 0);
    let ids = posts(&engine.discover().await.unwrap());

    let ticket = engine
        .submit(OperationRequest::on_node(ids[1], Operation::Click))
        .unwrap();
    page.inner.set_html(feed_html(&["a"])).await;
    clock.advance(1);
    engine.tick().await.unwrap();

    engine.run_operations().await;
    let result = ticket.wait().await;
    assert_eq!(
        result.error,
        Some(OperationError::TargetUnavailable {
            node: ids[1],
            state: LifecycleState::Retired
        })
    );
    assert_eq!(page.performs(), 0);
}

// ── Focus & bindings ──

#[tokio::test]
async fn test_binding_falls_back_when_preferred_node_retires() {
    let page = ProbePage::new(URL, &feed_html(&["a", "b"]));
    let (mut engine, clock) = manual_engine(page.clone(), 0);
    let ids = posts(&engine.discover().await.unwrap());

    engine.bind("open-post", ids[0], OperationKind::Click, 1).unwrap();
    engine.bind("open-post", ids[1], OperationKind::Click, 10).unwrap();
    engine.focus(Some(ids[1])).unwrap();
    assert_eq!(engine.resolve_binding("open-post", OperationKind::Click).unwrap(), ids[1]);

    page.inner.set_html(feed_html(&["a"])).await;
    clock.advance(1);
    engine.tick().await.unwrap();

    assert_eq!(engine.focused(), None, "focus is released with its node");
    assert_eq!(engine.bindings().len(), 1);
    let ticket = engine
        .submit(OperationRequest::new(
            Target::Binding { class: "open-post".into() },
            Operation::Click,
        ))
        .unwrap();
    assert_eq!(ticket.node_id, ids[0]);

    let err = engine
        .submit(OperationRequest::new(
            Target::Binding { class: "open-post".into() },
            Operation::Extract { fields: vec![] },
        ))
        .unwrap_err();
    assert!(matches!(err, EngineError::NoBindingAvailable { .. }));
}

#[tokio::test]
async fn test_engines_are_independent() {
    let page_one = ProbePage::new(URL, &feed_html(&["a"]));
    let page_two = ProbePage::new(URL, &feed_html(&["x", "y"]));
    let (mut one, _) = manual_engine(page_one, 0);
    let (mut two, _) = manual_engine(page_two, 0);

    let first = one.discover().await.unwrap();
    let second = two.discover().await.unwrap();
    assert_eq!(posts(&first).len(), 1);
    assert_eq!(posts(&second).len(), 2);

    one.focus(Some(first.root_node_ids[0])).unwrap();
    assert_eq!(two.focused(), None);
}
