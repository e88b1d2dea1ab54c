//! CLI subcommand implementations for the Trellis binary.

pub mod act_cmd;
pub mod discover_cmd;
pub mod output;
pub mod resolve_cmd;
pub mod validate_cmd;
pub mod watch_cmd;

use crate::config::EngineConfig;
use crate::definition::library::DefinitionLibrary;
use crate::definition::resolver::{DefinitionResolver, PageIdentity};
use crate::engine::Engine;
use crate::page::chromium::ChromiumPage;
use crate::page::snapshot::StaticPage;
use crate::page::PageProvider;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Page load budget for the browser-backed provider.
pub const DEFAULT_LOAD_TIMEOUT_MS: u64 = 30_000;

/// Load a definition library and build its resolver.
pub fn load_resolver(library: &Path) -> Result<DefinitionResolver> {
    let library = DefinitionLibrary::load(library)
        .with_context(|| format!("loading definition library {}", library.display()))?;
    Ok(DefinitionResolver::new(library)?)
}

/// Open the page: an HTML snapshot when `html` is given, Chromium otherwise.
pub async fn open_page(url: &str, html: Option<&Path>, timeout_ms: u64) -> Result<Arc<dyn PageProvider>> {
    match html {
        Some(path) => {
            let markup = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            info!(url, file = %path.display(), "using HTML snapshot");
            Ok(Arc::new(StaticPage::new(url, markup)))
        }
        None => {
            let page = ChromiumPage::launch(url, timeout_ms)
                .await
                .with_context(|| format!("loading {url} in Chromium"))?;
            Ok(Arc::new(page))
        }
    }
}

/// Resolve definitions for `url`, open the page and build an engine.
pub async fn open_engine(
    library: &Path,
    url: &str,
    html: Option<&Path>,
    config: EngineConfig,
) -> Result<Engine> {
    let resolver = load_resolver(library)?;
    let definitions = resolver
        .resolve(&PageIdentity::new(url))
        .with_context(|| format!("resolving definitions for {url}"))?;
    let page = open_page(url, html, DEFAULT_LOAD_TIMEOUT_MS).await?;
    Ok(Engine::new(page, definitions, config)?)
}
