// Copyright 2026 Trellis Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use trellis_runtime::cli;
use trellis_runtime::config::EngineConfig;
use trellis_runtime::ops::OperationKind;

#[derive(Parser)]
#[command(
    name = "trellis",
    about = "Trellis — container engine for live, mutating web pages",
    version,
    after_help = "Run 'trellis <command> --help' for details on each command."
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a definition library and report every problem in it
    Validate {
        /// Definition library (JSON)
        library: PathBuf,
    },
    /// Show which definitions apply to a URL
    Resolve {
        library: PathBuf,
        url: String,
    },
    /// Discover the container tree of a page once
    Discover {
        library: PathBuf,
        url: String,
        /// Read the page from an HTML file instead of launching Chromium
        #[arg(long)]
        html: Option<PathBuf>,
        /// Discovery timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Keep the tree fresh and stream engine events
    Watch {
        library: PathBuf,
        url: String,
        #[arg(long)]
        html: Option<PathBuf>,
        /// How long to watch
        #[arg(long, default_value = "30")]
        duration_secs: u64,
        /// Interval between refresh ticks in milliseconds
        #[arg(long, default_value = "250")]
        tick_ms: u64,
    },
    /// Run one operation against the first node of a container definition
    Act {
        library: PathBuf,
        url: String,
        /// Definition id of the target container
        #[arg(long)]
        container: String,
        /// Operation kind (click, type, scroll, extract, hover, focus)
        #[arg(long)]
        op: OperationKind,
        /// Text for `type`
        #[arg(long)]
        text: Option<String>,
        /// Per-attempt timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        html: Option<PathBuf>,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: Shell,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let directive = if verbose { "trellis=debug" } else { "trellis=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global flags via environment variables so all modules can check them
    if cli.json {
        std::env::set_var("TRELLIS_JSON", "1");
    }
    if cli.quiet {
        std::env::set_var("TRELLIS_QUIET", "1");
    }
    if cli.verbose {
        std::env::set_var("TRELLIS_VERBOSE", "1");
    }
    if cli.no_color {
        std::env::set_var("TRELLIS_NO_COLOR", "1");
    }
    init_tracing(cli.verbose, cli.json);

    let result = run(cli).await;

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        if cli::output::is_json() {
            cli::output::print_json(&serde_json::json!({
                "error": true,
                "message": format!("{e:#}"),
            }));
        } else if !cli::output::is_quiet() {
            eprintln!("  Error: {e:#}");
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = || EngineConfig::resolve(cli.config.as_deref());
    match cli.command {
        Commands::Validate { library } => cli::validate_cmd::run(&library).await,
        Commands::Resolve { library, url } => cli::resolve_cmd::run(&library, &url).await,
        Commands::Discover {
            library,
            url,
            html,
            timeout,
        } => cli::discover_cmd::run(&library, &url, html.as_deref(), timeout, config()?).await,
        Commands::Watch {
            library,
            url,
            html,
            duration_secs,
            tick_ms,
        } => {
            cli::watch_cmd::run(&library, &url, html.as_deref(), duration_secs, tick_ms, config()?)
                .await
        }
        Commands::Act {
            library,
            url,
            container,
            op,
            text,
            timeout,
            html,
        } => {
            let args = cli::act_cmd::ActArgs {
                container: &container,
                op,
                text: text.as_deref(),
                timeout_ms: timeout,
            };
            cli::act_cmd::run(&library, &url, html.as_deref(), args, config()?).await
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "trellis", &mut std::io::stdout());
            Ok(())
        }
    }
}
