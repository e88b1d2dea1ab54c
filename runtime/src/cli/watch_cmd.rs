//! `trellis watch <library> <url>`: keep the tree fresh and stream events.

use crate::cli::discover_cmd::print_tree;
use crate::cli::open_engine;
use crate::cli::output::{self, Styled};
use crate::config::EngineConfig;
use crate::events::EngineEvent;
use anyhow::Result;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub async fn run(
    library: &Path,
    url: &str,
    html: Option<&Path>,
    duration_secs: u64,
    tick_ms: u64,
    config: EngineConfig,
) -> Result<()> {
    let mut engine = open_engine(library, url, html, config).await?;
    let mut events = Box::pin(engine.event_stream());
    let snapshot = engine.discover().await?;
    if !output::is_json() && !output::is_quiet() {
        print_tree(&snapshot);
        println!();
    }

    let s = Styled::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration_secs);
    let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms.max(10)));
    loop {
        tokio::select! {
            Some(event) = events.next() => {
                print_event(&event, &s);
                continue;
            }
            _ = ticker.tick() => {}
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => break,
        }
        if let Err(e) = engine.tick().await {
            warn!(error = %e, "tick failed");
        }
    }

    engine.shutdown().await;
    if !output::is_json() && !output::is_quiet() {
        println!();
        print_tree(&engine.snapshot());
    }
    Ok(())
}

fn print_event(event: &EngineEvent, s: &Styled) {
    if output::is_json() {
        output::print_json_line(event);
        return;
    }
    if output::is_quiet() {
        return;
    }
    let line = match event {
        EngineEvent::NodeDiscovered { node_id, definition_id, .. } => {
            format!("{} {node_id} discovered ({definition_id})", s.ok_sym())
        }
        EngineEvent::NodeEvicted { node_id, definition_id } => {
            format!("{} {node_id} retired ({definition_id})", s.warn_sym())
        }
        EngineEvent::RefreshCompleted { node_id, trigger, coalesced, latency_ms, duration_ms } => format!(
            "  {node_id} refreshed ({trigger:?}, {coalesced} coalesced, {latency_ms}ms latency, {duration_ms}ms)"
        ),
        EngineEvent::RefreshFailed { node_id, failures, error, suspended } => format!(
            "{} {node_id} refresh failed x{failures}{}: {error}",
            s.fail_sym(),
            if *suspended { " (suspended)" } else { "" }
        ),
        EngineEvent::MatchAmbiguous { definition_id, candidates, strategy, .. } => format!(
            "{} {definition_id} matched {candidates} elements, picked by {strategy}",
            s.warn_sym()
        ),
        // lifecycle and operation chatter only with --verbose
        other if output::is_verbose() => format!("  {}", s.dim(&format!("{other:?}"))),
        _ => return,
    };
    println!("  {line}");
}
