//! `trellis validate <library>`: check a definition library.

use crate::cli::output::{self, Styled};
use crate::definition::library::DefinitionLibrary;
use anyhow::{bail, Context, Result};
use std::path::Path;

pub async fn run(library: &Path) -> Result<()> {
    let lib = DefinitionLibrary::load(library)
        .with_context(|| format!("loading definition library {}", library.display()))?;
    let problems = lib.validate();

    if output::is_json() {
        let items: Vec<serde_json::Value> = problems
            .iter()
            .map(|p| {
                serde_json::json!({
                    "site": p.site,
                    "page_type": p.page_type,
                    "message": p.error.to_string(),
                })
            })
            .collect();
        output::print_json(&serde_json::json!({
            "library": library.display().to_string(),
            "sites": lib.sites.len(),
            "containers": lib.container_count(),
            "valid": problems.is_empty(),
            "problems": items,
        }));
    } else if !output::is_quiet() {
        let s = Styled::new();
        for site in &lib.sites {
            for page in &site.pages {
                let failed = problems
                    .iter()
                    .any(|p| p.site == site.site && p.page_type.as_deref() == Some(page.page_type.as_str()));
                let sym = if failed { s.fail_sym() } else { s.ok_sym() };
                println!(
                    "  {sym} {}/{:<20} {} containers",
                    site.site,
                    page.page_type,
                    page.containers.len()
                );
            }
        }
        for p in &problems {
            match &p.page_type {
                Some(page_type) => eprintln!("  {} {}/{page_type}: {}", s.warn_sym(), p.site, p.error),
                None => eprintln!("  {} {}: {}", s.warn_sym(), p.site, p.error),
            }
        }
    }

    if !problems.is_empty() {
        bail!("{} problem(s) in {}", problems.len(), library.display());
    }
    Ok(())
}
