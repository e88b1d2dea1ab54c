//! The engine context: owns one page's container tree and everything that
//! acts on it.
//!
//! An [`Engine`] is a plain owned value driven through `&mut self`. Callers
//! decide when work happens:
//!
//! - [`Engine::discover`] runs a whole-tree pass,
//! - [`Engine::tick`] collects mutation and interval triggers and runs every
//!   refresh whose debounce window has elapsed (ancestors first),
//! - [`Engine::run_operations`] drains the operation queues.
//!
//! Node ids survive refreshes through the relationship registry. Retired ids
//! are remembered so late requests fail with `TargetUnavailable` instead of
//! `UnknownNode`.

use crate::clock::{Clock, Millis, SystemClock};
use crate::config::EngineConfig;
use crate::container::discovery::{AmbiguousMatch, Discovery, Match, MatchStrategy, StrategyTable};
use crate::container::lifecycle::{
    FailureOutcome, LifecycleState, RefreshLifecycle, RefreshTrigger, TriggerKind, TriggerOutcome,
};
use crate::container::registry::RelationshipRegistry;
use crate::container::{compute_capabilities, ContainerNode, NodeId, TreeSnapshot};
use crate::definition::resolver::{DefinitionResolver, PageIdentity, ResolvedDefinitions};
use crate::definition::{ContainerDefinition, RefreshPolicy};
use crate::error::{EngineError, EngineResult, OperationError};
use crate::events::{EngineEvent, EventBus};
use crate::focus::{Binding, BindingRegistry, FocusChange, FocusManager};
use crate::ops::executor::{ExecutionTarget, OperationExecutor};
use crate::ops::scheduler::{OperationScheduler, QueuedRequest, SchedulerStats};
use crate::ops::{
    OperationKind, OperationOutput, OperationRequest, OperationResult, OperationTicket, RequestId,
    Target,
};
use crate::page::{ElementRef, ElementState, PageProvider, SubscriptionId};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Live state behind one node id.
#[derive(Debug)]
struct NodeEntry {
    definition_id: String,
    parent: Option<NodeId>,
    element: Option<ElementRef>,
    state: Option<ElementState>,
    children: Vec<NodeId>,
    lifecycle: RefreshLifecycle,
    subscription: Option<SubscriptionId>,
    next_interval_at: Option<Millis>,
}

/// How an existing node is treated while a pass re-derives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Whole-tree manual pass: every node counts as refreshed, error nodes
    /// recover.
    Full,
    /// Refresh of one subtree: descendants follow their ParentRefreshed
    /// policy and error nodes stay frozen.
    Subtree,
}

/// Page work collected while the tree is rewired, applied afterwards.
#[derive(Debug, Default)]
struct Effects {
    observe: Vec<NodeId>,
    unobserve: Vec<SubscriptionId>,
    retiring: Vec<NodeId>,
}

/// What one call to [`Engine::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub mutations: usize,
    pub triggered: usize,
    pub refreshed: Vec<NodeId>,
    pub failed: Vec<NodeId>,
}

pub struct Engine {
    provider: Arc<dyn PageProvider>,
    definitions: ResolvedDefinitions,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    strategies: StrategyTable,
    registry: RelationshipRegistry,
    nodes: HashMap<NodeId, NodeEntry>,
    roots: Vec<NodeId>,
    /// Retired ids and the definition they were bound to.
    retired: HashMap<NodeId, String>,
    subscriptions: HashMap<SubscriptionId, NodeId>,
    scheduler: OperationScheduler,
    executor: OperationExecutor,
    focus: FocusManager,
    bindings: BindingRegistry,
    events: EventBus,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn PageProvider>,
        definitions: ResolvedDefinitions,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            executor: OperationExecutor::new(Arc::clone(&provider)),
            provider,
            definitions,
            clock: Arc::new(SystemClock::new()),
            strategies: StrategyTable::new(),
            registry: RelationshipRegistry::new(),
            nodes: HashMap::new(),
            roots: Vec::new(),
            retired: HashMap::new(),
            subscriptions: HashMap::new(),
            scheduler: OperationScheduler::new(config.max_in_flight),
            focus: FocusManager::new(),
            bindings: BindingRegistry::new(),
            events: EventBus::new(config.event_capacity),
            config,
        })
    }

    /// Resolve definitions for the provider's current URL and build an engine.
    pub async fn attach(
        provider: Arc<dyn PageProvider>,
        resolver: &DefinitionResolver,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let url = provider.url().await.map_err(page_error)?;
        let definitions = resolver.resolve(&PageIdentity::new(url))?;
        Self::new(provider, definitions, config)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a named disambiguation strategy for `Disambiguation::Custom`.
    pub fn with_strategy(mut self, name: impl Into<String>, strategy: Arc<dyn MatchStrategy>) -> Self {
        self.strategies.register(name, strategy);
        self
    }

    pub fn definitions(&self) -> &ResolvedDefinitions {
        &self.definitions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> impl futures::Stream<Item = EngineEvent> + Send + 'static {
        self.events.stream()
    }

    // ── Tree ──────────────────────────────────────────────

    /// Run a whole-tree discovery pass and return the resulting tree.
    ///
    /// The first call builds the tree. Later calls act as a manual refresh of
    /// every node: ids are kept where continuity allows, vanished regions
    /// retire, and nodes suspended in `error` recover.
    pub async fn discover(&mut self) -> EngineResult<TreeSnapshot> {
        let now = self.clock.now();
        let timeout_ms = self.config.discovery_timeout_ms;
        let provider = Arc::clone(&self.provider);
        let discovery = Discovery::new(
            provider.as_ref(),
            &self.definitions,
            &self.strategies,
            &self.config.default_disambiguation,
        );
        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), discovery.discover_all())
            .await
            .map_err(|_| EngineError::DiscoveryTimeout {
                scope: "page".to_string(),
                timeout_ms,
            })??;
        self.report_ambiguities(outcome.ambiguities);

        let top_level: Vec<String> = self
            .definitions
            .children_of(None)
            .map(|def| def.id.clone())
            .collect();
        let mut matches = outcome.roots;
        let mut effects = Effects::default();
        let mut roots = Vec::new();
        for def_id in top_level {
            let group = take_group(&mut matches, &def_id);
            roots.extend(self.apply_group(&def_id, None, group, now, Pass::Full, &mut effects));
        }
        self.roots = roots;
        self.settle(effects).await;

        info!(
            site = self.definitions.site(),
            page_type = self.definitions.page_type(),
            nodes = self.nodes.len(),
            "container tree discovered"
        );
        Ok(self.snapshot())
    }

    /// Consistent copy of the current tree, parents before children.
    pub fn snapshot(&self) -> TreeSnapshot {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            if let Some(node) = self.node(id) {
                stack.extend(node.child_node_ids.iter().rev().copied());
                nodes.push(node);
            }
        }
        TreeSnapshot {
            site: self.definitions.site().to_string(),
            page_type: self.definitions.page_type().to_string(),
            captured_at: chrono::Utc::now(),
            root_node_ids: self.roots.clone(),
            nodes,
        }
    }

    /// Read-only view of one live node.
    pub fn node(&self, id: NodeId) -> Option<ContainerNode> {
        let entry = self.nodes.get(&id)?;
        let def = self.definitions.get(&entry.definition_id)?;
        let exists = entry.element.is_some() && entry.state.is_some();
        let visible = entry.state.as_ref().is_some_and(ElementState::is_visible);
        Some(ContainerNode {
            node_id: id,
            definition_id: entry.definition_id.clone(),
            parent_node_id: entry.parent,
            exists,
            visible,
            rect: entry.state.as_ref().map(|s| s.rect),
            child_node_ids: entry.children.clone(),
            capabilities: compute_capabilities(&def.allowed_operations, exists, visible),
            lifecycle_state: entry.lifecycle.state(),
            last_refresh_at: entry.lifecycle.last_refresh_at(),
        })
    }

    /// Lifecycle state of a live or retired node.
    pub fn state_of(&self, id: NodeId) -> EngineResult<LifecycleState> {
        if let Some(entry) = self.nodes.get(&id) {
            return Ok(entry.lifecycle.state());
        }
        if self.retired.contains_key(&id) {
            return Ok(LifecycleState::Retired);
        }
        Err(EngineError::UnknownNode(id))
    }

    /// Request a refresh of one node. The refresh runs on a later tick once
    /// its debounce window has elapsed. Recovers nodes in `error`.
    pub fn trigger(&mut self, id: NodeId) -> EngineResult<TriggerOutcome> {
        self.require_live(id)?;
        let now = self.clock.now();
        let trigger = RefreshTrigger::Manual {
            at: now,
            origin: Some(id),
        };
        self.fire(id, trigger, now)
            .ok_or(EngineError::UnknownNode(id))
    }

    /// Collect triggers and run every refresh that is due.
    pub async fn tick(&mut self) -> EngineResult<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        let records = self.provider.take_mutations().await.map_err(page_error)?;
        report.mutations = records.len();
        for record in records {
            let Some(&id) = self.subscriptions.get(&record.subscription) else {
                continue;
            };
            let trigger = RefreshTrigger::Mutation { at: now, origin: id };
            if let Some(TriggerOutcome::Scheduled { .. } | TriggerOutcome::Coalesced { .. }) =
                self.fire(id, trigger, now)
            {
                report.triggered += 1;
            }
        }

        let interval_due: Vec<(NodeId, u64)> = self
            .nodes
            .iter()
            .filter(|(_, e)| e.next_interval_at.is_some_and(|at| at <= now))
            .filter_map(|(id, e)| {
                let period = self.definitions.get(&e.definition_id)?.refresh_policy.interval()?;
                Some((*id, period))
            })
            .collect();
        for (id, period) in interval_due {
            if let Some(entry) = self.nodes.get_mut(&id) {
                entry.next_interval_at = Some(now.saturating_add(period));
                if entry.lifecycle.state() != LifecycleState::Stable {
                    continue;
                }
            }
            let trigger = RefreshTrigger::Interval { at: now, origin: id };
            if let Some(TriggerOutcome::Scheduled { .. }) = self.fire(id, trigger, now) {
                report.triggered += 1;
            }
        }

        let mut due: Vec<(usize, NodeId)> = self
            .nodes
            .iter()
            .filter(|(_, e)| e.lifecycle.is_due(now))
            .map(|(id, _)| (self.depth(*id), *id))
            .collect();
        due.sort();
        for (_, id) in due {
            // an ancestor's pass may have covered or retired it meanwhile
            let still_due = self
                .nodes
                .get(&id)
                .is_some_and(|e| e.lifecycle.is_due(self.clock.now()));
            if !still_due {
                continue;
            }
            if self.refresh_node(id).await {
                report.refreshed.push(id);
            } else {
                report.failed.push(id);
            }
        }
        Ok(report)
    }

    /// Earliest armed refresh deadline, for callers that drive `tick` on a
    /// timer.
    pub fn next_refresh_at(&self) -> Option<Millis> {
        let armed = self.nodes.values().filter_map(|e| e.lifecycle.due_at());
        let intervals = self.nodes.values().filter_map(|e| e.next_interval_at);
        armed.chain(intervals).min()
    }

    fn fire(&mut self, id: NodeId, trigger: RefreshTrigger, now: Millis) -> Option<TriggerOutcome> {
        let policy = self.policy_of(id)?;
        let kind = trigger.kind();
        let outcome = self.with_lifecycle(id, |lc| lc.on_trigger(trigger, now, &policy))?;
        match &outcome {
            TriggerOutcome::Suppressed { reason } => {
                debug!(node = %id, trigger = ?kind, reason, "trigger suppressed");
            }
            TriggerOutcome::Coalesced { coalesced, .. } => {
                debug!(node = %id, trigger = ?kind, coalesced, "trigger coalesced");
            }
            TriggerOutcome::Scheduled { due_at } => {
                debug!(node = %id, trigger = ?kind, due_at, "refresh scheduled");
            }
        }
        Some(outcome)
    }

    /// Run one due refresh. Returns false when discovery failed.
    async fn refresh_node(&mut self, id: NodeId) -> bool {
        let started_at = self.clock.now();
        let Some(Some(started)) = self.with_lifecycle(id, |lc| lc.start(started_at)) else {
            return true;
        };
        let Some((def, parent, element)) = self.nodes.get(&id).and_then(|e| {
            let def = self.definitions.get(&e.definition_id)?.clone();
            Some((def, e.parent, e.element.clone()))
        }) else {
            return true;
        };
        let scope = parent.and_then(|p| self.nodes.get(&p)).and_then(|p| p.element.clone());
        let timeout_ms = def
            .refresh_policy
            .discovery_timeout_ms
            .unwrap_or(self.config.discovery_timeout_ms);
        debug!(node = %id, definition = %def.id, trigger = ?started.trigger.kind(), "refresh started");

        let provider = Arc::clone(&self.provider);
        let discovery = Discovery::new(
            provider.as_ref(),
            &self.definitions,
            &self.strategies,
            &self.config.default_disambiguation,
        );
        let pass = async {
            let mut ambiguities = Vec::new();
            let matches = match (def.multiple, element.as_ref()) {
                (true, Some(element)) => vec![
                    discovery
                        .rediscover_element(&def, element, scope.as_ref(), &mut ambiguities)
                        .await?,
                ],
                _ => {
                    discovery
                        .discover_group(&def, scope.as_ref(), &mut ambiguities)
                        .await?
                }
            };
            Ok::<_, EngineError>((matches, ambiguities))
        };
        let result = match tokio::time::timeout(Duration::from_millis(timeout_ms), pass).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::DiscoveryTimeout {
                scope: def.id.clone(),
                timeout_ms,
            }),
        };

        let now = self.clock.now();
        let (matches, ambiguities) = match result {
            Ok(found) => found,
            Err(error) => {
                self.refresh_failed(id, &def.refresh_policy, now, &error);
                return false;
            }
        };
        self.report_ambiguities(ambiguities);

        let mut effects = Effects::default();
        if def.multiple {
            match matches.into_iter().next() {
                Some(m) if m.exists() => {
                    self.apply_node(id, &def, parent, m, now, Pass::Subtree, &mut effects);
                }
                _ => {
                    debug!(node = %id, definition = %def.id, "list item left its region");
                    self.begin_retirement(id, &mut effects);
                    self.replace_child(parent, id, &[]);
                }
            }
        } else {
            let assigned = self.apply_group(&def.id, parent, matches, now, Pass::Subtree, &mut effects);
            self.replace_child(parent, id, &assigned);
        }

        if self
            .nodes
            .get(&id)
            .is_some_and(|e| e.lifecycle.state() == LifecycleState::Discovering)
        {
            if let Some(done) = self.with_lifecycle(id, |lc| lc.complete(now)) {
                debug!(node = %id, duration_ms = done.duration_ms, rearmed = done.rearmed, "refresh completed");
                self.events.emit(EngineEvent::RefreshCompleted {
                    node_id: id,
                    trigger: started.trigger.kind(),
                    coalesced: started.coalesced,
                    latency_ms: started.latency_ms,
                    duration_ms: done.duration_ms,
                });
            }
        }
        self.settle(effects).await;
        true
    }

    fn refresh_failed(&mut self, id: NodeId, policy: &RefreshPolicy, now: Millis, error: &EngineError) {
        let Some(outcome) = self.with_lifecycle(id, |lc| lc.fail(now, policy)) else {
            return;
        };
        let (failures, suspended) = match outcome {
            FailureOutcome::Retrying { due_at, failures } => {
                warn!(node = %id, failures, due_at, error = %error, "refresh failed, retry scheduled");
                (failures, false)
            }
            FailureOutcome::Suspended { failures } => {
                warn!(node = %id, failures, error = %error, "refresh failed repeatedly, node suspended");
                (failures, true)
            }
        };
        self.events.emit(EngineEvent::RefreshFailed {
            node_id: id,
            failures,
            error: error.to_string(),
            suspended,
        });
    }

    /// Reconcile one definition's slot under `parent` against fresh matches
    /// and apply each match. Returns the slot's node ids in match order.
    fn apply_group(
        &mut self,
        definition_id: &str,
        parent: Option<NodeId>,
        matches: Vec<Match>,
        now: Millis,
        pass: Pass,
        effects: &mut Effects,
    ) -> Vec<NodeId> {
        let Some(def) = self.definitions.get(definition_id).cloned() else {
            return Vec::new();
        };
        let elements: Vec<Option<ElementRef>> = matches.iter().map(|m| m.element.clone()).collect();
        let reconciliation = self
            .registry
            .reconcile(&def.id, parent, def.continuity, &elements);
        for orphan in &reconciliation.orphaned {
            self.begin_retirement(*orphan, effects);
        }
        for (m, id) in matches.into_iter().zip(&reconciliation.assigned) {
            self.apply_node(*id, &def, parent, m, now, pass, effects);
        }
        reconciliation.assigned
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_node(
        &mut self,
        id: NodeId,
        def: &ContainerDefinition,
        parent: Option<NodeId>,
        m: Match,
        now: Millis,
        pass: Pass,
        effects: &mut Effects,
    ) {
        let policy = &def.refresh_policy;
        let is_new = !self.nodes.contains_key(&id);
        if is_new {
            self.nodes.insert(
                id,
                NodeEntry {
                    definition_id: def.id.clone(),
                    parent,
                    element: None,
                    state: None,
                    children: Vec::new(),
                    lifecycle: RefreshLifecycle::new(),
                    subscription: None,
                    next_interval_at: policy.interval().map(|ms| now.saturating_add(ms)),
                },
            );
            self.events.emit(EngineEvent::NodeDiscovered {
                node_id: id,
                definition_id: def.id.clone(),
                parent_node_id: parent,
                exists: m.exists(),
            });
            self.with_lifecycle(id, |lc| lc.begin_initial(now));
        } else if pass == Pass::Full
            && self.nodes.get(&id).is_some_and(|e| e.lifecycle.state() == LifecycleState::Error)
        {
            info!(node = %id, "whole-tree pass recovers suspended node");
            let trigger = RefreshTrigger::Manual { at: now, origin: None };
            self.with_lifecycle(id, |lc| lc.on_trigger(trigger, now, policy));
        }

        let Some(entry) = self.nodes.get_mut(&id) else {
            return;
        };
        entry.parent = parent;
        if entry.element != m.element {
            if let Some(subscription) = entry.subscription.take() {
                self.subscriptions.remove(&subscription);
                effects.unobserve.push(subscription);
            }
            entry.element = m.element.clone();
        }
        entry.state = m.state.clone();
        if entry.element.is_some() && entry.subscription.is_none() && policy.observes_mutations() {
            effects.observe.push(id);
        }
        let frozen = entry.lifecycle.state() == LifecycleState::Error;

        if !frozen {
            let child_defs: Vec<String> = self
                .definitions
                .children_of(Some(def.id.as_str()))
                .map(|d| d.id.clone())
                .collect();
            let mut matches = m.children;
            let mut children = Vec::new();
            for child_def in child_defs {
                let group = take_group(&mut matches, &child_def);
                children.extend(self.apply_group(&child_def, Some(id), group, now, pass, effects));
            }
            if let Some(entry) = self.nodes.get_mut(&id) {
                entry.children = children;
            }
        }

        if is_new {
            self.with_lifecycle(id, |lc| lc.complete(now));
        } else if pass == Pass::Full || policy.allows(TriggerKind::ParentRefreshed) {
            self.with_lifecycle(id, |lc| lc.covered_by_ancestor(now));
        }
    }

    /// Start retiring a node and its descendants. Page-side cleanup and the
    /// final transition happen in [`Engine::settle`].
    fn begin_retirement(&mut self, id: NodeId, effects: &mut Effects) {
        if self.with_lifecycle(id, |lc| lc.begin_retire()) != Some(true) {
            return;
        }
        let children = self
            .nodes
            .get(&id)
            .map(|e| e.children.clone())
            .unwrap_or_default();
        for child in children {
            self.begin_retirement(child, effects);
        }
        if let Some(subscription) = self.nodes.get_mut(&id).and_then(|e| e.subscription.take()) {
            self.subscriptions.remove(&subscription);
            effects.unobserve.push(subscription);
        }
        if let Some(change) = self.focus.release(id) {
            self.focus_changed(change);
        }
        for binding in self.bindings.prune(id) {
            self.binding_changed(&binding, true);
        }
        self.registry.forget(id);
        effects.retiring.push(id);
    }

    /// Apply collected page work: release subscriptions, finish retirements,
    /// then observe newly bound elements.
    async fn settle(&mut self, effects: Effects) {
        for subscription in effects.unobserve {
            if let Err(e) = self.provider.unobserve(subscription).await {
                debug!(subscription = subscription.0, error = %format!("{e:#}"), "unobserve failed");
            }
        }
        for id in effects.retiring {
            self.with_lifecycle(id, |lc| lc.finish_retire());
            if let Some(entry) = self.nodes.remove(&id) {
                info!(node = %id, definition = %entry.definition_id, "node retired");
                self.events.emit(EngineEvent::NodeEvicted {
                    node_id: id,
                    definition_id: entry.definition_id.clone(),
                });
                self.retired.insert(id, entry.definition_id);
            }
            self.roots.retain(|r| *r != id);
        }
        for id in effects.observe {
            let Some(element) = self
                .nodes
                .get(&id)
                .filter(|e| e.subscription.is_none())
                .and_then(|e| e.element.clone())
            else {
                continue;
            };
            match self.provider.observe(&element).await {
                Ok(subscription) => {
                    self.subscriptions.insert(subscription, id);
                    if let Some(entry) = self.nodes.get_mut(&id) {
                        entry.subscription = Some(subscription);
                    }
                }
                Err(e) => {
                    debug!(node = %id, element = %element, error = %format!("{e:#}"), "observe failed");
                }
            }
        }
    }

    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: &[NodeId]) {
        let siblings = match parent {
            Some(p) => match self.nodes.get_mut(&p) {
                Some(entry) => &mut entry.children,
                None => return,
            },
            None => &mut self.roots,
        };
        if let Some(index) = siblings.iter().position(|c| *c == old) {
            siblings.splice(index..=index, new.iter().copied());
        }
    }

    fn with_lifecycle<R>(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut RefreshLifecycle) -> R,
    ) -> Option<R> {
        let entry = self.nodes.get_mut(&id)?;
        let from = entry.lifecycle.state();
        let out = f(&mut entry.lifecycle);
        let to = entry.lifecycle.state();
        if from != to {
            debug!(node = %id, %from, %to, "lifecycle transition");
            self.events.emit(EngineEvent::LifecycleChanged { node_id: id, from, to });
        }
        Some(out)
    }

    fn policy_of(&self, id: NodeId) -> Option<RefreshPolicy> {
        let entry = self.nodes.get(&id)?;
        Some(self.definitions.get(&entry.definition_id)?.refresh_policy.clone())
    }

    fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = self.nodes.get(&id).and_then(|e| e.parent);
        while let Some(parent) = current {
            depth += 1;
            current = self.nodes.get(&parent).and_then(|e| e.parent);
        }
        depth
    }

    fn report_ambiguities(&self, ambiguities: Vec<AmbiguousMatch>) {
        for a in ambiguities {
            self.events.emit(EngineEvent::MatchAmbiguous {
                definition_id: a.definition_id,
                candidates: a.candidates,
                strategy: a.strategy,
                chosen: a.chosen,
            });
        }
    }

    // ── Focus & bindings ──────────────────────────────────

    pub fn focused(&self) -> Option<NodeId> {
        self.focus.current()
    }

    /// Move focus to a live node, or clear it with None.
    pub fn focus(&mut self, node: Option<NodeId>) -> EngineResult<()> {
        if let Some(id) = node {
            self.require_live(id)?;
        }
        if let Some(change) = self.focus.focus(node) {
            self.focus_changed(change);
        }
        Ok(())
    }

    pub fn bind(
        &mut self,
        class: impl Into<String>,
        node: NodeId,
        operation: OperationKind,
        priority: i32,
    ) -> EngineResult<Binding> {
        self.require_live(node)?;
        let binding = self.bindings.bind(class, node, operation, priority);
        self.binding_changed(&binding, false);
        Ok(binding)
    }

    pub fn unbind(&mut self, class: &str, node: NodeId, operation: OperationKind) -> Option<Binding> {
        let binding = self.bindings.unbind(class, node, operation)?;
        self.binding_changed(&binding, true);
        Some(binding)
    }

    pub fn bindings(&self) -> &[Binding] {
        self.bindings.all()
    }

    /// Node the best eligible binding for `class` points at. Eligible
    /// nodes are stable and present on the page.
    pub fn resolve_binding(&self, class: &str, operation: OperationKind) -> EngineResult<NodeId> {
        self.bindings
            .resolve(class, operation, |id| {
                self.nodes.get(&id).is_some_and(|e| {
                    e.lifecycle.state() == LifecycleState::Stable && e.element.is_some()
                })
            })
            .map(|b| b.node_id)
            .ok_or_else(|| EngineError::NoBindingAvailable {
                class: class.to_string(),
                operation,
            })
    }

    fn require_live(&self, id: NodeId) -> EngineResult<()> {
        match self.state_of(id)? {
            LifecycleState::Retiring | LifecycleState::Retired => Err(EngineError::TargetUnavailable {
                node: id,
                state: LifecycleState::Retired,
            }),
            _ => Ok(()),
        }
    }

    fn focus_changed(&self, change: FocusChange) {
        debug!(previous = ?change.previous, current = ?change.current, "focus changed");
        self.events.emit(EngineEvent::FocusChanged {
            previous: change.previous,
            current: change.current,
            at: self.clock.now(),
        });
    }

    fn binding_changed(&self, binding: &Binding, removed: bool) {
        self.events.emit(EngineEvent::BindingChanged {
            class: binding.class.clone(),
            node_id: binding.node_id,
            operation: binding.operation,
            removed,
        });
    }

    // ── Operations ────────────────────────────────────────

    /// Accept a request into its node's queue.
    ///
    /// The target is resolved now (focus and bindings are read at submit
    /// time); the node's state is checked again when the request is
    /// dispatched.
    pub fn submit(&mut self, request: OperationRequest) -> EngineResult<OperationTicket> {
        let kind = request.operation.kind();
        let node_id = match &request.target {
            Target::Node { node_id } => *node_id,
            Target::Focused => self.focus.current().ok_or(EngineError::NoFocusedContainer)?,
            Target::Binding { class } => self.resolve_binding(class, kind)?,
        };
        let state = self.state_of(node_id)?;
        if !state.accepts_operations() {
            return Err(EngineError::TargetUnavailable {
                node: node_id,
                state,
            });
        }

        let (reply, receiver) = oneshot::channel();
        let request_id = RequestId::new();
        let now = self.clock.now();
        debug!(request = %request_id, node = %node_id, operation = %kind, "operation queued");
        self.scheduler
            .enqueue(QueuedRequest::new(request_id, node_id, request, now, reply));
        Ok(OperationTicket::new(request_id, node_id, receiver))
    }

    /// Cancel a request that has not started its current attempt.
    pub fn cancel(&mut self, request_id: RequestId) -> bool {
        let Some(mut queued) = self.scheduler.cancel(request_id) else {
            return false;
        };
        let result = OperationResult::failed(
            request_id,
            queued.node_id,
            OperationError::Cancelled,
            self.clock.now().saturating_sub(queued.submitted_at),
            queued.attempts_used,
        );
        self.complete_request(&mut queued, result);
        true
    }

    pub fn operation_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Drive queued requests until every queue is empty, retries included.
    /// Returns the final results in completion order.
    pub async fn run_operations(&mut self) -> Vec<OperationResult> {
        let mut completed = Vec::new();
        let mut running = FuturesUnordered::new();
        loop {
            let now = self.clock.now();
            while let Some(mut queued) = self.scheduler.next_ready(now) {
                let target = match self.dispatch_target(&queued) {
                    Ok(target) => target,
                    Err(error) => {
                        self.scheduler.finish(queued.node_id);
                        let result = OperationResult::failed(
                            queued.request_id,
                            queued.node_id,
                            error,
                            now.saturating_sub(queued.submitted_at),
                            queued.attempts_used,
                        );
                        self.complete_request(&mut queued, result.clone());
                        completed.push(result);
                        continue;
                    }
                };
                queued.attempts_used += 1;
                let operation = queued.request.operation.clone();
                let timeout_ms = queued
                    .request
                    .timeout_ms
                    .unwrap_or(self.config.default_operation_timeout_ms);
                self.events.emit(EngineEvent::OperationStarted {
                    request_id: queued.request_id,
                    node_id: queued.node_id,
                    operation: operation.kind(),
                    attempt: queued.attempts_used,
                });
                let attempt = self.executor.execute(target, operation, timeout_ms);
                running.push(async move {
                    let outcome = attempt.await;
                    (queued, outcome)
                });
            }

            let wakeup = self.scheduler.next_wakeup().filter(|at| *at > now);
            if running.is_empty() {
                match wakeup {
                    Some(at) => {
                        self.clock.sleep(at - now).await;
                        continue;
                    }
                    None => break,
                }
            }

            let clock = Arc::clone(&self.clock);
            let settled = match wakeup {
                Some(at) => tokio::select! {
                    biased;
                    done = running.next() => done,
                    _ = clock.sleep(at - now) => None,
                },
                None => running.next().await,
            };
            if let Some((queued, outcome)) = settled {
                if let Some(result) = self.settle_attempt(queued, outcome) {
                    completed.push(result);
                }
            }
        }
        completed
    }

    /// Dispatch-time view of the target. `Err` fails the request without
    /// starting an attempt.
    fn dispatch_target(&self, queued: &QueuedRequest) -> Result<ExecutionTarget, OperationError> {
        let id = queued.node_id;
        let Some(entry) = self.nodes.get(&id) else {
            return Err(OperationError::TargetUnavailable {
                node: id,
                state: LifecycleState::Retired,
            });
        };
        let state = entry.lifecycle.state();
        if !state.accepts_operations() {
            return Err(OperationError::TargetUnavailable { node: id, state });
        }
        let (capabilities, default_fields) = match (self.node(id), self.definitions.get(&entry.definition_id)) {
            (Some(node), Some(def)) => (node.capabilities, def.extract.clone()),
            _ => Default::default(),
        };
        let kind = queued.request.operation.kind();
        if !capabilities.contains(&kind) {
            return Err(OperationError::CapabilityMismatch { node: id, operation: kind });
        }
        Ok(ExecutionTarget {
            node_id: id,
            element: entry.element.clone(),
            capabilities,
            default_fields,
        })
    }

    /// Record one finished attempt: requeue a retryable failure while the
    /// budget allows, otherwise deliver the final result.
    fn settle_attempt(
        &mut self,
        mut queued: QueuedRequest,
        outcome: Result<OperationOutput, OperationError>,
    ) -> Option<OperationResult> {
        let now = self.clock.now();
        self.scheduler.finish(queued.node_id);
        let elapsed = now.saturating_sub(queued.submitted_at);
        let kind = queued.request.operation.kind();

        let result = match outcome {
            Ok(output) => {
                if kind.requires_visibility() {
                    if let Some(change) = self.focus.focus(Some(queued.node_id)) {
                        self.focus_changed(change);
                    }
                }
                OperationResult::succeeded(queued.request_id, queued.node_id, output, elapsed, queued.attempts_used)
            }
            Err(error) if error.is_retryable() && queued.has_attempts_left() => {
                let backoff = queued.request.retry.backoff_ms(
                    queued.attempts_used,
                    self.config.retry_backoff_base_ms,
                    self.config.retry_backoff_cap_ms,
                );
                debug!(
                    request = %queued.request_id,
                    node = %queued.node_id,
                    attempt = queued.attempts_used,
                    backoff_ms = backoff,
                    error = %error,
                    "operation attempt failed, retrying"
                );
                self.scheduler.requeue(queued, now.saturating_add(backoff));
                return None;
            }
            Err(error) => {
                warn!(
                    request = %queued.request_id,
                    node = %queued.node_id,
                    operation = %kind,
                    attempts = queued.attempts_used,
                    code = error.code(),
                    "operation failed"
                );
                OperationResult::failed(queued.request_id, queued.node_id, error, elapsed, queued.attempts_used)
            }
        };
        self.complete_request(&mut queued, result.clone());
        Some(result)
    }

    fn complete_request(&self, queued: &mut QueuedRequest, result: OperationResult) {
        self.events.emit(EngineEvent::OperationCompleted {
            request_id: result.request_id,
            node_id: result.node_id,
            operation: queued.request.operation.kind(),
            success: result.success,
            error: result.error.clone(),
            execution_time_ms: result.execution_time_ms,
            attempts_used: result.attempts_used,
        });
        queued.resolve(result);
    }

    /// Cancel queued requests and release every page subscription.
    pub async fn shutdown(&mut self) {
        for mut queued in self.scheduler.drain_all() {
            let result = OperationResult::failed(
                queued.request_id,
                queued.node_id,
                OperationError::Cancelled,
                0,
                queued.attempts_used,
            );
            self.complete_request(&mut queued, result);
        }
        let subscriptions: Vec<SubscriptionId> = self.subscriptions.drain().map(|(s, _)| s).collect();
        for subscription in subscriptions {
            if let Err(e) = self.provider.unobserve(subscription).await {
                debug!(subscription = subscription.0, error = %format!("{e:#}"), "unobserve failed");
            }
        }
        for entry in self.nodes.values_mut() {
            entry.subscription = None;
        }
        info!(nodes = self.nodes.len(), "engine shut down");
    }
}

/// Remove and return the matches bound to one definition, in order.
fn take_group(matches: &mut Vec<Match>, definition_id: &str) -> Vec<Match> {
    let (group, rest) = std::mem::take(matches)
        .into_iter()
        .partition(|m| m.definition_id == definition_id);
    *matches = rest;
    group
}

fn page_error(error: anyhow::Error) -> EngineError {
    EngineError::Page(format!("{error:#}"))
}
