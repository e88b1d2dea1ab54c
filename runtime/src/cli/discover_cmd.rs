//! `trellis discover <library> <url>`: discover the container tree once.

use crate::cli::output::{self, Styled};
use crate::cli::open_engine;
use crate::config::EngineConfig;
use crate::container::{ContainerNode, NodeId, TreeSnapshot};
use anyhow::Result;
use std::path::Path;

pub async fn run(
    library: &Path,
    url: &str,
    html: Option<&Path>,
    timeout_ms: Option<u64>,
    mut config: EngineConfig,
) -> Result<()> {
    if let Some(ms) = timeout_ms {
        config.discovery_timeout_ms = ms;
    }
    let mut engine = open_engine(library, url, html, config).await?;
    let snapshot = engine.discover().await?;
    engine.shutdown().await;

    if output::is_json() {
        output::print_json(&snapshot);
    } else {
        print_tree(&snapshot);
    }
    Ok(())
}

/// Human-readable tree, one node per line.
pub fn print_tree(snapshot: &TreeSnapshot) {
    let s = Styled::new();
    println!(
        "  {} / {}  ({} nodes)",
        snapshot.site,
        snapshot.page_type,
        snapshot.len()
    );
    for root in &snapshot.root_node_ids {
        print_node(snapshot, *root, 1, &s);
    }
}

fn print_node(snapshot: &TreeSnapshot, id: NodeId, depth: usize, s: &Styled) {
    let Some(node) = snapshot.node(id) else {
        return;
    };
    println!("  {}{}", "  ".repeat(depth), describe(node, s));
    for child in &node.child_node_ids {
        print_node(snapshot, *child, depth + 1, s);
    }
}

fn describe(node: &ContainerNode, s: &Styled) -> String {
    let sym = match (node.exists, node.visible) {
        (true, true) => s.ok_sym(),
        (true, false) => s.warn_sym(),
        (false, _) => s.fail_sym(),
    };
    let caps: Vec<&str> = node.capabilities.iter().map(|op| op.as_str()).collect();
    format!(
        "{sym} {} {:<20} {} {}",
        node.node_id,
        node.definition_id,
        node.lifecycle_state,
        s.dim(&format!("[{}]", caps.join(", ")))
    )
}
