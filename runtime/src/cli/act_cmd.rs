//! `trellis act <library> <url> --container <id> --op <kind>`: run one
//! operation against the first node of a definition.

use crate::cli::open_engine;
use crate::cli::output::{self, Styled};
use crate::config::EngineConfig;
use crate::ops::{Operation, OperationKind, OperationRequest, ScrollDirection};
use anyhow::{anyhow, bail, Result};
use std::path::Path;

pub struct ActArgs<'a> {
    pub container: &'a str,
    pub op: OperationKind,
    pub text: Option<&'a str>,
    pub timeout_ms: Option<u64>,
}

pub async fn run(
    library: &Path,
    url: &str,
    html: Option<&Path>,
    args: ActArgs<'_>,
    config: EngineConfig,
) -> Result<()> {
    let operation = build_operation(args.op, args.text)?;
    let mut engine = open_engine(library, url, html, config).await?;
    let snapshot = engine.discover().await?;

    let node = snapshot
        .by_definition(args.container)
        .find(|n| n.exists)
        .ok_or_else(|| anyhow!("no `{}` container found on {url}", args.container))?;

    let mut request = OperationRequest::on_node(node.node_id, operation);
    if let Some(ms) = args.timeout_ms {
        request = request.with_timeout(ms);
    }
    let ticket = engine.submit(request)?;
    engine.run_operations().await;
    let result = ticket.wait().await;
    engine.shutdown().await;

    if output::is_json() {
        output::print_json(&result);
    } else if !output::is_quiet() {
        let s = Styled::new();
        if result.success {
            println!(
                "  {} {} on {} ({}ms, {} attempt(s))",
                s.ok_sym(),
                args.op,
                result.node_id,
                result.execution_time_ms,
                result.attempts_used
            );
            if let Some(data) = &result.data {
                println!("{}", serde_json::to_string_pretty(data)?);
            }
        }
    }

    if let Some(error) = &result.error {
        bail!("{} on {} failed: {error}", args.op, result.node_id);
    }
    Ok(())
}

fn build_operation(kind: OperationKind, text: Option<&str>) -> Result<Operation> {
    Ok(match kind {
        OperationKind::Click => Operation::Click,
        OperationKind::Type => {
            let Some(text) = text else {
                bail!("--op type needs --text");
            };
            Operation::Type {
                text: text.to_string(),
                clear_first: false,
            }
        }
        OperationKind::Scroll => Operation::Scroll {
            direction: ScrollDirection::Down,
            amount_px: None,
        },
        OperationKind::Extract => Operation::Extract { fields: Vec::new() },
        OperationKind::Hover => Operation::Hover,
        OperationKind::Focus => Operation::Focus,
    })
}
