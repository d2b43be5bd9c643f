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

//! The capability surface every package-management backend implements.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::RescenterResult;
use crate::filter::Filter;
use crate::resource::{ResourceKey, ResourceRef};
use crate::stream::ResultsStream;
use crate::transaction::{AddonList, Transaction};
use crate::updater::BackendUpdater;

/// Notifications a backend publishes about itself
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    FetchingChanged(bool),
    UpdatesCountChanged(usize),
    /// 0..=100
    FetchingProgressChanged(u8),
    /// Initial loading finished
    Initialized,
    ResourcesChanged {
        resource: ResourceKey,
        properties: Vec<String>,
    },
    AllDataChanged {
        properties: Vec<String>,
    },
    ResourceRemoved(ResourceKey),
    /// Message for the user; used for backend-local failures
    PassiveMessage(String),
    /// The backend stopped being usable and should be unregistered
    Invalidated,
}

/// Result of [`Backend::fetch_updates`]
pub struct UpdateSet {
    pub resources: Vec<ResourceRef>,
    pub updater: Option<Arc<dyn BackendUpdater>>,
}

impl std::fmt::Debug for UpdateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSet")
            .field("resources", &self.resources.len())
            .field("updater", &self.updater.is_some())
            .finish()
    }
}

/// A source of resources.
///
/// `search` and the transaction starters return immediately; the work runs on
/// the backend's own tasks. The transaction starters are called while the
/// transaction registry is locked, so they must neither block nor call back
/// into the resources model.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Unique, stable name used for routing and resource keys
    fn name(&self) -> &str;

    fn display_name(&self) -> String {
        self.name().to_string()
    }

    /// Invalid backends are discarded at registration
    fn is_valid(&self) -> bool {
        true
    }

    /// Start a query; results arrive on the returned stream
    fn search(&self, filter: &Filter) -> ResultsStream;

    fn resource(&self, id: &str) -> Option<ResourceRef>;

    /// The upgradeable set together with the updater that can apply it
    async fn fetch_updates(&self) -> RescenterResult<UpdateSet> {
        let resources = self
            .search(&Filter::upgradeable(self.name()))
            .collect_all()
            .await
            .into_iter()
            .map(|r| r.resource)
            .collect();
        Ok(UpdateSet {
            resources,
            updater: self.updater(),
        })
    }

    fn updates_count(&self) -> usize;

    fn has_security_updates(&self) -> bool {
        false
    }

    fn is_fetching(&self) -> bool;

    /// 0..=100
    fn fetching_progress(&self) -> u8 {
        if self.is_fetching() {
            42
        } else {
            100
        }
    }

    fn updater(&self) -> Option<Arc<dyn BackendUpdater>>;

    fn install_application(
        &self,
        resource: &ResourceRef,
        addons: &AddonList,
    ) -> RescenterResult<Arc<Transaction>>;

    fn remove_application(&self, resource: &ResourceRef) -> RescenterResult<Arc<Transaction>>;

    fn update_application(&self, resource: &ResourceRef) -> RescenterResult<Arc<Transaction>>;

    /// Refresh metadata; progress is reported through `FetchingChanged`
    fn check_for_updates(&self);

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}
