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

//! Resources: the installable/updatable units every backend exposes.
//!
//! A backend owns its resources (`Arc<Resource>` in its own map). Streams and
//! models hold clones of the `Arc`; transactions hold a [`ResourceLink`] so a
//! resource can be re-resolved through its backend after a reload.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use url::Url;

/// Identity of a resource: which backend produced it and its id there
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub backend: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(backend: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.id)
    }
}

/// Normalized resource state, ordered so that "at least Installed" filters work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    /// Somehow broken
    Broken,
    /// Neither installed nor broken
    None,
    /// Installed and up to date
    Installed,
    /// Installed with an update available
    Upgradeable,
}

impl ResourceState {
    pub fn is_installed(self) -> bool {
        self >= ResourceState::Installed
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceState::Broken => write!(f, "broken"),
            ResourceState::None => write!(f, "available"),
            ResourceState::Installed => write!(f, "installed"),
            ResourceState::Upgradeable => write!(f, "upgradeable"),
        }
    }
}

/// What kind of unit a resource is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Application,
    Addon,
    Runtime,
    Firmware,
    SystemImage,
    /// Plain packages that are not meant to be browsed
    Technical,
}

/// Mutable part of a resource, always read and written as a whole
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub name: String,
    pub summary: String,
    pub origin: String,
    pub installed_version: Option<String>,
    pub available_version: Option<String>,
    pub size: u64,
    pub state: ResourceState,
    pub categories: Vec<String>,
    pub icon: Option<String>,
    /// Resources sharing a download key are one download (counted once in update size)
    pub download_key: Option<String>,
    /// Ids of sibling resources that have to be updated together with this one
    pub requires: Vec<String>,
}

impl ResourceInfo {
    pub fn new(name: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            summary: String::new(),
            origin: origin.into(),
            installed_version: None,
            available_version: None,
            size: 0,
            state: ResourceState::None,
            categories: Vec::new(),
            icon: None,
            download_key: None,
            requires: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: ResourceState) -> Self {
        self.state = state;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_versions(mut self, installed: Option<&str>, available: Option<&str>) -> Self {
        self.installed_version = installed.map(str::to_string);
        self.available_version = available.map(str::to_string);
        self
    }

    pub fn with_download_key(mut self, key: impl Into<String>) -> Self {
        self.download_key = Some(key.into());
        self
    }

    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }
}

/// One installable/updatable unit
#[derive(Debug)]
pub struct Resource {
    key: ResourceKey,
    kind: ResourceKind,
    appstream_id: Option<String>,
    info: RwLock<ResourceInfo>,
}

/// Shared, non-owning handle used by streams and models
pub type ResourceRef = Arc<Resource>;

impl Resource {
    pub fn new(key: ResourceKey, kind: ResourceKind, info: ResourceInfo) -> Self {
        Self {
            key,
            kind,
            appstream_id: None,
            info: RwLock::new(info),
        }
    }

    pub fn with_appstream_id(mut self, id: impl Into<String>) -> Self {
        self.appstream_id = Some(id.into());
        self
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub fn backend(&self) -> &str {
        &self.key.backend
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn appstream_id(&self) -> Option<&str> {
        self.appstream_id.as_deref()
    }

    fn read(&self) -> RwLockReadGuard<'_, ResourceInfo> {
        self.info.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ResourceInfo> {
        self.info.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Consistent snapshot of the mutable fields
    pub fn info(&self) -> ResourceInfo {
        self.read().clone()
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    pub fn origin(&self) -> String {
        self.read().origin.clone()
    }

    pub fn state(&self) -> ResourceState {
        self.read().state
    }

    pub fn size(&self) -> u64 {
        self.read().size
    }

    pub fn is_installed(&self) -> bool {
        self.state().is_installed()
    }

    /// Only the owning backend should call the mutators below.
    pub fn set_state(&self, state: ResourceState) -> bool {
        let mut info = self.write();
        if info.state == state {
            return false;
        }
        info.state = state;
        true
    }

    /// Replace the mutable fields in one step; returns whether anything changed
    pub fn replace_info(&self, new_info: ResourceInfo) -> bool {
        let mut info = self.write();
        if *info == new_info {
            return false;
        }
        *info = new_info;
        true
    }

    /// Apply an in-place edit under the write lock
    pub fn update<F: FnOnce(&mut ResourceInfo)>(&self, edit: F) {
        let mut info = self.write();
        edit(&mut info);
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.read()
            .categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
    }

    /// Case-insensitive match on id, name and summary
    pub fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        if self.key.id.to_lowercase().contains(&needle) {
            return true;
        }
        let info = self.read();
        info.name.to_lowercase().contains(&needle) || info.summary.to_lowercase().contains(&needle)
    }

    /// `appstream://<id>` matches the appstream id; `<backend>://<id>` matches the id
    pub fn matches_url(&self, url: &Url) -> bool {
        let target = url
            .host_str()
            .map(str::to_string)
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| url.path().trim_start_matches('/').to_string());
        if target.is_empty() {
            return false;
        }
        if url.scheme() == "appstream" {
            return self
                .appstream_id
                .as_deref()
                .map(|id| id.eq_ignore_ascii_case(&target) || id.trim_end_matches(".desktop").eq_ignore_ascii_case(&target))
                .unwrap_or(false);
        }
        url.scheme() == self.key.backend && self.key.id.eq_ignore_ascii_case(&target)
    }

    /// Serializable view used by the exporter
    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            id: self.key.id.clone(),
            backend: self.key.backend.clone(),
            kind: self.kind,
            appstream_id: self.appstream_id.clone(),
            info: self.info(),
        }
    }

    pub fn link(self: &Arc<Self>) -> ResourceLink {
        ResourceLink {
            key: self.key.clone(),
            weak: Arc::downgrade(self),
        }
    }
}

/// Flat property view of a resource
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub id: String,
    pub backend: String,
    pub kind: ResourceKind,
    pub appstream_id: Option<String>,
    #[serde(flatten)]
    pub info: ResourceInfo,
}

/// Non-owning reference held by transactions
#[derive(Debug, Clone)]
pub struct ResourceLink {
    key: ResourceKey,
    weak: Weak<Resource>,
}

impl ResourceLink {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Returns the resource if its backend still holds it
    pub fn upgrade(&self) -> Option<ResourceRef> {
        self.weak.upgrade()
    }
}

/// A resource found by a query, with a backend-specific relevance score
#[derive(Debug, Clone)]
pub struct StreamResult {
    pub resource: ResourceRef,
    pub sort_score: u32,
}

impl StreamResult {
    pub fn new(resource: ResourceRef) -> Self {
        Self {
            resource,
            sort_score: 0,
        }
    }

    pub fn with_score(resource: ResourceRef, sort_score: u32) -> Self {
        Self { resource, sort_score }
    }
}

impl PartialEq for StreamResult {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.resource, &other.resource)
    }
}

impl From<ResourceRef> for StreamResult {
    fn from(resource: ResourceRef) -> Self {
        StreamResult::new(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kate() -> Resource {
        Resource::new(
            ResourceKey::new("flatpak", "org.kde.kate"),
            ResourceKind::Application,
            ResourceInfo::new("Kate", "flathub")
                .with_summary("Advanced text editor")
                .with_categories(["Utility", "TextEditor"]),
        )
        .with_appstream_id("org.kde.kate.desktop")
    }

    #[test]
    fn test_state_ordering() {
        assert!(ResourceState::Upgradeable > ResourceState::Installed);
        assert!(ResourceState::Installed > ResourceState::None);
        assert!(ResourceState::None > ResourceState::Broken);
        assert!(ResourceState::Upgradeable.is_installed());
        assert!(!ResourceState::None.is_installed());
    }

    #[test]
    fn test_text_and_category_match() {
        let res = kate();
        assert!(res.matches_text("TEXT editor"));
        assert!(res.matches_text("kde.kate"));
        assert!(!res.matches_text("browser"));
        assert!(res.has_category("texteditor"));
        assert!(!res.has_category("Game"));
    }

    #[test]
    fn test_url_match() {
        let res = kate();
        assert!(res.matches_url(&Url::parse("appstream://org.kde.kate.desktop").unwrap()));
        assert!(res.matches_url(&Url::parse("appstream://org.kde.kate").unwrap()));
        assert!(res.matches_url(&Url::parse("flatpak://org.kde.kate").unwrap()));
        assert!(!res.matches_url(&Url::parse("snap://org.kde.kate").unwrap()));
    }

    #[test]
    fn test_set_state_reports_change() {
        let res = kate();
        assert!(res.set_state(ResourceState::Installed));
        assert!(!res.set_state(ResourceState::Installed));
        assert_eq!(res.state(), ResourceState::Installed);
    }

    #[test]
    fn test_link_does_not_keep_resource_alive() {
        let res = Arc::new(kate());
        let link = res.link();
        assert!(link.upgrade().is_some());
        drop(res);
        assert!(link.upgrade().is_none());
        assert_eq!(link.key().to_string(), "flatpak:org.kde.kate");
    }

    #[test]
    fn test_snapshot_flattens_info() {
        let value = serde_json::to_value(kate().snapshot()).unwrap();
        assert_eq!(value["id"], "org.kde.kate");
        assert_eq!(value["name"], "Kate");
        assert_eq!(value["state"], "none");
        assert_eq!(value["kind"], "application");
    }
}
