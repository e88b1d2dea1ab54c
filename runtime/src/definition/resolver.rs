//! Container Definition Resolver: maps a page identity to the ordered,
//! validated definitions that apply to it.

use super::library::DefinitionLibrary;
use super::ContainerDefinition;
use crate::error::DefinitionError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// What the engine knows about the page it is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageIdentity {
    pub url: String,
}

impl PageIdentity {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// Definitions selected for one page, parents ordered before children.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedDefinitions {
    site: String,
    page_type: String,
    definitions: Vec<ContainerDefinition>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ResolvedDefinitions {
    pub fn new(
        site: impl Into<String>,
        page_type: impl Into<String>,
        definitions: &[ContainerDefinition],
    ) -> Result<Self, DefinitionError> {
        let definitions = order_definitions(definitions)?;
        let index = definitions
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        Ok(Self {
            site: site.into(),
            page_type: page_type.into(),
            definitions,
            index,
        })
    }

    /// Build from a bare definition list (tests, ad-hoc embedding).
    pub fn from_definitions(definitions: &[ContainerDefinition]) -> Result<Self, DefinitionError> {
        Self::new("adhoc", "adhoc", definitions)
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn page_type(&self) -> &str {
        &self.page_type
    }

    pub fn get(&self, id: &str) -> Option<&ContainerDefinition> {
        self.index.get(id).map(|i| &self.definitions[*i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContainerDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Direct children of `parent` (`None` = top-level), in definition order.
    pub fn children_of<'a>(
        &'a self,
        parent: Option<&'a str>,
    ) -> impl Iterator<Item = &'a ContainerDefinition> + 'a {
        self.definitions
            .iter()
            .filter(move |d| d.parent_id.as_deref() == parent)
    }

    /// Number of ancestors of a definition.
    pub fn depth(&self, id: &str) -> usize {
        let mut depth = 0;
        let mut current = self.get(id).and_then(|d| d.parent_id.as_deref());
        while let Some(parent) = current {
            depth += 1;
            current = self.get(parent).and_then(|d| d.parent_id.as_deref());
        }
        depth
    }
}

/// Validate a page's definitions and order parents before children.
///
/// The order is otherwise the order the library lists them in.
pub fn order_definitions(
    definitions: &[ContainerDefinition],
) -> Result<Vec<ContainerDefinition>, DefinitionError> {
    let mut ids = HashSet::new();
    for def in definitions {
        if def.id.trim().is_empty() {
            return Err(DefinitionError::InvalidDefinition {
                id: def.id.clone(),
                reason: "empty id".to_string(),
            });
        }
        if !ids.insert(def.id.as_str()) {
            return Err(DefinitionError::DuplicateId(def.id.clone()));
        }
        validate_one(def)?;
    }

    let by_id: HashMap<&str, &ContainerDefinition> =
        definitions.iter().map(|d| (d.id.as_str(), d)).collect();

    for def in definitions {
        if let Some(parent) = &def.parent_id {
            if !by_id.contains_key(parent.as_str()) {
                return Err(DefinitionError::UnknownParent {
                    id: def.id.clone(),
                    parent: parent.clone(),
                });
            }
        }
        // Walk the parent chain; more steps than definitions means a loop.
        let mut current = def.parent_id.as_deref();
        let mut steps = 0;
        while let Some(parent) = current {
            steps += 1;
            if parent == def.id || steps > definitions.len() {
                return Err(DefinitionError::ParentCycle(def.id.clone()));
            }
            current = by_id.get(parent).and_then(|d| d.parent_id.as_deref());
        }
    }

    let mut ordered: Vec<ContainerDefinition> = Vec::with_capacity(definitions.len());
    let mut placed: HashSet<&str> = HashSet::new();
    while ordered.len() < definitions.len() {
        for def in definitions {
            if placed.contains(def.id.as_str()) {
                continue;
            }
            let ready = def
                .parent_id
                .as_deref()
                .map_or(true, |p| placed.contains(p));
            if ready {
                placed.insert(def.id.as_str());
                ordered.push(def.clone());
            }
        }
    }

    Ok(ordered)
}

fn validate_one(def: &ContainerDefinition) -> Result<(), DefinitionError> {
    let invalid = |reason: String| DefinitionError::InvalidDefinition {
        id: def.id.clone(),
        reason,
    };

    if def.selector.trim().is_empty() {
        return Err(invalid("empty selector".to_string()));
    }
    if let Err(e) = scraper::Selector::parse(&def.selector) {
        return Err(invalid(format!("selector `{}` is not valid CSS: {e:?}", def.selector)));
    }
    if def.multiple && def.disambiguation.is_some() {
        return Err(invalid(
            "a list container binds every match and takes no disambiguation rule".to_string(),
        ));
    }
    if def.refresh_policy.max_refresh_retries == 0 {
        return Err(invalid("max_refresh_retries must be at least 1".to_string()));
    }
    for field in &def.extract {
        if let Some(selector) = &field.selector {
            if scraper::Selector::parse(selector).is_err() {
                return Err(invalid(format!(
                    "extract field `{}` has invalid selector `{selector}`",
                    field.name
                )));
            }
        }
    }
    Ok(())
}

struct CompiledPage {
    pattern: Option<Regex>,
}

/// Resolves page identities against a loaded library.
pub struct DefinitionResolver {
    library: DefinitionLibrary,
    compiled: Vec<Vec<CompiledPage>>,
}

impl DefinitionResolver {
    /// Compile every page pattern up front.
    pub fn new(library: DefinitionLibrary) -> Result<Self, DefinitionError> {
        let mut compiled = Vec::with_capacity(library.sites.len());
        for site in &library.sites {
            let mut pages = Vec::with_capacity(site.pages.len());
            for page in &site.pages {
                let pattern = match &page.url_pattern {
                    Some(p) => Some(Regex::new(p).map_err(|e| DefinitionError::InvalidPattern {
                        pattern: p.clone(),
                        reason: e.to_string(),
                    })?),
                    None => None,
                };
                pages.push(CompiledPage { pattern });
            }
            compiled.push(pages);
        }
        Ok(Self { library, compiled })
    }

    pub fn library(&self) -> &DefinitionLibrary {
        &self.library
    }

    /// Find the definitions for a page by URL.
    pub fn resolve(&self, page: &PageIdentity) -> Result<ResolvedDefinitions, DefinitionError> {
        let url = url::Url::parse(&page.url).map_err(|e| DefinitionError::InvalidUrl {
            url: page.url.clone(),
            reason: e.to_string(),
        })?;
        let host = url.host_str().ok_or_else(|| DefinitionError::InvalidUrl {
            url: page.url.clone(),
            reason: "url has no host".to_string(),
        })?;

        let (site_idx, site) = self
            .library
            .sites
            .iter()
            .enumerate()
            .find(|(_, s)| s.hosts.iter().any(|h| host_matches(host, h)))
            .ok_or_else(|| DefinitionError::UnknownSite(host.to_string()))?;

        let path = match url.query() {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_string(),
        };

        let (page_idx, page_defs) = site
            .pages
            .iter()
            .enumerate()
            .find(|(i, _)| {
                self.compiled[site_idx][*i]
                    .pattern
                    .as_ref()
                    .map_or(true, |re| re.is_match(&path))
            })
            .ok_or_else(|| DefinitionError::NoMatchingPage {
                site: site.site.clone(),
                path: path.clone(),
            })?;

        debug!(
            site = %site.site,
            page_type = %page_defs.page_type,
            page_idx,
            "resolved page definitions"
        );
        ResolvedDefinitions::new(&site.site, &page_defs.page_type, &page_defs.containers)
    }

    /// Select a page explicitly by site and page type.
    pub fn resolve_page(
        &self,
        site: &str,
        page_type: &str,
    ) -> Result<ResolvedDefinitions, DefinitionError> {
        let site_defs = self
            .library
            .site(site)
            .ok_or_else(|| DefinitionError::UnknownSite(site.to_string()))?;
        let page = site_defs
            .pages
            .iter()
            .find(|p| p.page_type == page_type)
            .ok_or_else(|| DefinitionError::NoMatchingPage {
                site: site.to_string(),
                path: page_type.to_string(),
            })?;
        ResolvedDefinitions::new(site, page_type, &page.containers)
    }
}

fn host_matches(host: &str, pattern: &str) -> bool {
    let pattern = pattern.trim().trim_start_matches("*.").to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::library::{PageDefinitions, SiteDefinitions};
    use crate::definition::Disambiguation;

    fn library() -> DefinitionLibrary {
        DefinitionLibrary {
            sites: vec![SiteDefinitions {
                site: "example-feed".into(),
                hosts: vec!["example.com".into()],
                pages: vec![
                    PageDefinitions {
                        page_type: "search".into(),
                        url_pattern: Some(r"^/search\?q=".into()),
                        containers: vec![ContainerDefinition::new("results", "#results")],
                    },
                    PageDefinitions {
                        page_type: "home".into(),
                        url_pattern: None,
                        containers: vec![
                            ContainerDefinition::new("feed_item", ".item")
                                .child_of("feed_list")
                                .list(),
                            ContainerDefinition::new("feed_list", "#feed"),
                        ],
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_resolve_by_host_and_path() {
        let resolver = DefinitionResolver::new(library()).unwrap();

        let search = resolver
            .resolve(&PageIdentity::new("https://www.example.com/search?q=rust"))
            .unwrap();
        assert_eq!(search.page_type(), "search");

        let home = resolver
            .resolve(&PageIdentity::new("https://example.com/"))
            .unwrap();
        assert_eq!(home.page_type(), "home");
        // Parent comes first even though the library lists the child first.
        let ids: Vec<_> = home.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["feed_list", "feed_item"]);
        assert_eq!(home.depth("feed_item"), 1);
        assert_eq!(home.children_of(Some("feed_list")).count(), 1);
    }

    #[test]
    fn test_unknown_host() {
        let resolver = DefinitionResolver::new(library()).unwrap();
        let err = resolver
            .resolve(&PageIdentity::new("https://notexample.com/"))
            .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownSite(h) if h == "notexample.com"));
    }

    #[test]
    fn test_invalid_url() {
        let resolver = DefinitionResolver::new(library()).unwrap();
        assert!(matches!(
            resolver.resolve(&PageIdentity::new("not a url")),
            Err(DefinitionError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_resolve_page_explicitly() {
        let resolver = DefinitionResolver::new(library()).unwrap();
        let defs = resolver.resolve_page("example-feed", "search").unwrap();
        assert_eq!(defs.len(), 1);
        assert!(resolver.resolve_page("example-feed", "profile").is_err());
    }

    #[test]
    fn test_rejects_duplicates_and_cycles() {
        let dup = [
            ContainerDefinition::new("a", "#a"),
            ContainerDefinition::new("a", "#b"),
        ];
        assert!(matches!(
            order_definitions(&dup),
            Err(DefinitionError::DuplicateId(id)) if id == "a"
        ));

        let cycle = [
            ContainerDefinition::new("a", "#a").child_of("b"),
            ContainerDefinition::new("b", "#b").child_of("a"),
        ];
        assert!(matches!(
            order_definitions(&cycle),
            Err(DefinitionError::ParentCycle(_))
        ));
    }

    #[test]
    fn test_rejects_bad_selector_and_list_disambiguation() {
        let bad = [ContainerDefinition::new("a", "div[")];
        assert!(matches!(
            order_definitions(&bad),
            Err(DefinitionError::InvalidDefinition { .. })
        ));

        let list = [ContainerDefinition::new("a", ".x")
            .list()
            .with_disambiguation(Disambiguation::Last)];
        assert!(order_definitions(&list).is_err());
    }
}
