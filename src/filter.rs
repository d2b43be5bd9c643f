/*
 * rescenter - Resource aggregation and transaction engine for software centers.
 * Copyright (C) 2025  compiledkernel-idk and rescenter contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Query descriptor fanned out to every backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::resource::{Resource, ResourceRef, ResourceState, StreamResult};

/// Immutable query; an empty filter lists everything a backend knows
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub category: Option<String>,
    pub origin: Option<String>,
    pub search: Option<String>,
    pub resource_url: Option<Url>,
    pub only_installed: bool,
    /// Only resources whose state is at least this one
    pub minimum_state: Option<ResourceState>,
    /// Route the query to this backend only
    pub backend: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_resource_url(mut self, url: Url) -> Self {
        self.resource_url = Some(url);
        self
    }

    pub fn installed_only(mut self) -> Self {
        self.only_installed = true;
        self
    }

    pub fn with_minimum_state(mut self, state: ResourceState) -> Self {
        self.minimum_state = Some(state);
        self
    }

    pub fn for_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Filter selecting the upgradeable resources of one backend
    pub fn upgradeable(backend: impl Into<String>) -> Self {
        Self::new()
            .with_minimum_state(ResourceState::Upgradeable)
            .for_backend(backend)
    }

    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.origin.is_none()
            && self.search.as_deref().map_or(true, str::is_empty)
            && self.resource_url.is_none()
            && !self.only_installed
            && self.minimum_state.is_none()
    }

    /// Whether a backend named `name` should receive this query
    pub fn targets_backend(&self, name: &str) -> bool {
        self.backend.as_deref().map_or(true, |b| b == name)
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if let Some(url) = &self.resource_url {
            if !resource.matches_url(url) {
                return false;
            }
        }
        if let Some(origin) = &self.origin {
            if !resource.origin().eq_ignore_ascii_case(origin) {
                return false;
            }
        }
        let state = resource.state();
        if self.only_installed && !state.is_installed() {
            return false;
        }
        if let Some(min) = self.minimum_state {
            if state < min {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if !resource.has_category(category) {
                return false;
            }
        }
        match self.search.as_deref() {
            Some(term) if !term.is_empty() => resource.matches_text(term),
            _ => true,
        }
    }

    /// Relevance of a matching resource for the search term; 0 without one
    pub fn score(&self, resource: &Resource) -> u32 {
        let Some(term) = self.search.as_deref().filter(|t| !t.is_empty()) else {
            return 0;
        };
        let term = term.to_lowercase();
        let name = resource.name().to_lowercase();
        if name == term {
            100
        } else if resource.id().eq_ignore_ascii_case(&term) {
            90
        } else if name.starts_with(&term) {
            60
        } else if name.contains(&term) {
            40
        } else {
            10
        }
    }

    /// Keep the resources that match, best scores first
    pub fn rank(&self, resources: impl IntoIterator<Item = ResourceRef>) -> Vec<StreamResult> {
        let mut results: Vec<StreamResult> = resources
            .into_iter()
            .filter(|r| self.matches(r))
            .map(|r| {
                let score = self.score(&r);
                StreamResult::with_score(r, score)
            })
            .collect();
        results.sort_by(|a, b| b.sort_score.cmp(&a.sort_score));
        results
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filter(")?;
        if let Some(category) = &self.category {
            write!(f, "category: {category},")?;
        }
        if let Some(origin) = &self.origin {
            write!(f, "origin: {origin},")?;
        }
        if let Some(search) = &self.search {
            write!(f, "search: {search},")?;
        }
        if let Some(url) = &self.resource_url {
            write!(f, "resourceUrl: {url},")?;
        }
        if self.only_installed {
            write!(f, "installed,")?;
        }
        if let Some(state) = self.minimum_state {
            write!(f, "state: {state},")?;
        }
        if let Some(backend) = &self.backend {
            write!(f, "backend: {backend},")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceInfo, ResourceKey, ResourceKind};
    use std::sync::Arc;

    fn res(id: &str, origin: &str, state: ResourceState) -> Arc<Resource> {
        Arc::new(Resource::new(
            ResourceKey::new("memory", id),
            ResourceKind::Application,
            ResourceInfo::new(id, origin)
                .with_state(state)
                .with_categories(["Graphics"]),
        ))
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let f = Filter::new();
        assert!(f.is_empty());
        assert!(f.matches(&res("gimp", "flathub", ResourceState::Broken)));
        assert!(Filter::new().with_search("").is_empty());
        assert!(!Filter::new().installed_only().is_empty());
    }

    #[test]
    fn test_installed_and_minimum_state() {
        let installed = Filter::new().installed_only();
        assert!(installed.matches(&res("gimp", "flathub", ResourceState::Upgradeable)));
        assert!(!installed.matches(&res("gimp", "flathub", ResourceState::None)));

        let upgradeable = Filter::upgradeable("memory");
        assert!(upgradeable.matches(&res("gimp", "flathub", ResourceState::Upgradeable)));
        assert!(!upgradeable.matches(&res("gimp", "flathub", ResourceState::Installed)));
        assert!(upgradeable.targets_backend("memory"));
        assert!(!upgradeable.targets_backend("snap"));
    }

    #[test]
    fn test_origin_category_search() {
        let r = res("gimp", "flathub", ResourceState::None);
        assert!(Filter::new().with_origin("Flathub").matches(&r));
        assert!(!Filter::new().with_origin("fedora").matches(&r));
        assert!(Filter::new().with_category("graphics").matches(&r));
        assert!(!Filter::new().with_category("Office").matches(&r));
        assert!(Filter::new().with_search("GIM").matches(&r));
        assert!(!Filter::new().with_search("inkscape").matches(&r));
    }

    #[test]
    fn test_rank_orders_by_score() {
        let f = Filter::new().with_search("gimp");
        let results = f.rank(vec![
            res("gimp-plugins", "flathub", ResourceState::None),
            res("krita", "flathub", ResourceState::None),
            res("gimp", "flathub", ResourceState::None),
        ]);
        let ids: Vec<&str> = results.iter().map(|r| r.resource.id()).collect();
        assert_eq!(ids, vec!["gimp", "gimp-plugins"]);
        assert_eq!(results[0].sort_score, 100);
        assert_eq!(results[1].sort_score, 60);

        let unsorted = Filter::new().rank(vec![
            res("b", "flathub", ResourceState::None),
            res("a", "flathub", ResourceState::None),
        ]);
        assert!(unsorted.iter().all(|r| r.sort_score == 0));
        assert_eq!(unsorted[0].resource.id(), "b");
    }

    #[test]
    fn test_display() {
        let f = Filter::new().with_search("kate").with_origin("flathub");
        assert_eq!(f.to_string(), "Filter(origin: flathub,search: kate,)");
    }
}
