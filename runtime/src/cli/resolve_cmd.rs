//! `trellis resolve <library> <url>`: show which definitions apply to a URL.

use crate::cli::{load_resolver, output};
use crate::definition::resolver::PageIdentity;
use anyhow::{Context, Result};
use std::path::Path;

pub async fn run(library: &Path, url: &str) -> Result<()> {
    let resolver = load_resolver(library)?;
    let resolved = resolver
        .resolve(&PageIdentity::new(url))
        .with_context(|| format!("resolving definitions for {url}"))?;

    if output::is_json() {
        let containers: Vec<_> = resolved.iter().collect();
        output::print_json(&serde_json::json!({
            "url": url,
            "site": resolved.site(),
            "page_type": resolved.page_type(),
            "containers": containers,
        }));
        return Ok(());
    }

    println!("  {} / {}", resolved.site(), resolved.page_type());
    for def in resolved.iter() {
        let indent = "  ".repeat(resolved.depth(&def.id));
        let kind = if def.multiple { "list" } else { "single" };
        let ops: Vec<&str> = def.allowed_operations.iter().map(|op| op.as_str()).collect();
        println!(
            "    {indent}{:<24} {:<8} {:<32} [{}]",
            def.id,
            kind,
            def.selector,
            ops.join(", ")
        );
    }
    Ok(())
}
