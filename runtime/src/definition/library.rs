//! Definition library: per-site, per-page container definitions loaded once
//! per session.

use super::resolver::order_definitions;
use super::ContainerDefinition;
use crate::error::DefinitionError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Definitions for one page type of a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDefinitions {
    pub page_type: String,
    /// Regex matched against the URL path (and query). Absent = any page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    pub containers: Vec<ContainerDefinition>,
}

/// Everything known about one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteDefinitions {
    pub site: String,
    /// Hosts served by this site; subdomains match as well.
    pub hosts: Vec<String>,
    pub pages: Vec<PageDefinitions>,
}

/// The full library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionLibrary {
    pub sites: Vec<SiteDefinitions>,
}

/// A problem found while validating a library.
#[derive(Debug)]
pub struct LibraryProblem {
    pub site: String,
    pub page_type: Option<String>,
    pub error: DefinitionError,
}

impl DefinitionLibrary {
    pub fn from_json(raw: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn site(&self, name: &str) -> Option<&SiteDefinitions> {
        self.sites.iter().find(|s| s.site == name)
    }

    /// Total number of container definitions across all sites.
    pub fn container_count(&self) -> usize {
        self.sites
            .iter()
            .flat_map(|s| &s.pages)
            .map(|p| p.containers.len())
            .sum()
    }

    /// Check every page of every site, collecting all problems.
    pub fn validate(&self) -> Vec<LibraryProblem> {
        let mut problems = Vec::new();
        let mut seen_sites = std::collections::HashSet::new();

        for site in &self.sites {
            if !seen_sites.insert(site.site.as_str()) {
                problems.push(LibraryProblem {
                    site: site.site.clone(),
                    page_type: None,
                    error: DefinitionError::InvalidDefinition {
                        id: site.site.clone(),
                        reason: "site listed twice".to_string(),
                    },
                });
            }
            if site.hosts.is_empty() {
                problems.push(LibraryProblem {
                    site: site.site.clone(),
                    page_type: None,
                    error: DefinitionError::InvalidDefinition {
                        id: site.site.clone(),
                        reason: "site has no hosts".to_string(),
                    },
                });
            }

            for page in &site.pages {
                if let Some(pattern) = &page.url_pattern {
                    if let Err(e) = regex::Regex::new(pattern) {
                        problems.push(LibraryProblem {
                            site: site.site.clone(),
                            page_type: Some(page.page_type.clone()),
                            error: DefinitionError::InvalidPattern {
                                pattern: pattern.clone(),
                                reason: e.to_string(),
                            },
                        });
                    }
                }
                if let Err(error) = order_definitions(&page.containers) {
                    problems.push(LibraryProblem {
                        site: site.site.clone(),
                        page_type: Some(page.page_type.clone()),
                        error,
                    });
                }
            }
        }

        problems
    }
}
