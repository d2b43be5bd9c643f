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

//! Per-backend update batches.
//!
//! An updater is used in three steps: [`BackendUpdater::prepare`] takes a
//! snapshot of the upgradeable set and marks all of it, the caller adjusts the
//! selection with `add_resources`/`remove_resources`, then
//! [`BackendUpdater::start`] runs the batch as transactions.

pub mod graph;
pub mod standard;

pub use graph::UpdateGraph;
pub use standard::StandardBackendUpdater;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tokio::sync::{broadcast, watch};

use crate::error::RescenterResult;
use crate::resource::{ResourceKey, ResourceRef};
use crate::transaction::TransactionModel;

/// Phase of one resource inside a running batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateState {
    None,
    Downloading,
    Installing,
    Done,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateState::None => write!(f, "waiting"),
            UpdateState::Downloading => write!(f, "downloading"),
            UpdateState::Installing => write!(f, "installing"),
            UpdateState::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdaterEvent {
    /// 0.0..=100.0
    ProgressChanged(f64),
    CancelableChanged(bool),
    ProgressingChanged(bool),
    UpdatesCountChanged(usize),
    ResourceProgressed {
        resource: ResourceKey,
        progress: u8,
        state: UpdateState,
    },
    PassiveMessage(String),
    NeedsRebootChanged(bool),
}

#[async_trait]
pub trait BackendUpdater: Send + Sync {
    fn backend_name(&self) -> &str;

    /// Recompute the upgradeable set from the backend
    async fn refresh(&self) -> RescenterResult<()>;

    /// Snapshot the upgradeable set and mark all of it; rejected while a batch runs
    fn prepare(&self) -> RescenterResult<()>;

    fn has_updates(&self) -> bool;

    /// Mark resources, pulling in whatever they require
    fn add_resources(&self, resources: &[ResourceRef]) -> RescenterResult<()>;

    /// Unmark resources together with everything that requires them
    fn remove_resources(&self, resources: &[ResourceRef]) -> RescenterResult<()>;

    fn to_update(&self) -> Vec<ResourceRef>;

    fn is_marked(&self, resource: &ResourceRef) -> bool;

    /// 0.0..=100.0
    fn progress(&self) -> f64;

    fn last_update(&self) -> Option<DateTime<Utc>>;

    fn is_cancelable(&self) -> bool;

    fn is_progressing(&self) -> bool;

    fn watch_progressing(&self) -> watch::Receiver<bool>;

    /// Bytes to download for the marked set
    fn update_size(&self) -> u64;

    /// Bytes per second over the running transactions
    fn download_speed(&self) -> u64;

    /// Run the marked set; transactions are registered in `transactions`
    fn start(&self, transactions: &TransactionModel) -> RescenterResult<()>;

    fn cancel(&self);

    fn needs_reboot(&self) -> bool {
        false
    }

    /// Whether the last batch had a failed transaction
    fn has_errors(&self) -> bool;

    /// Whether this updater may run at the same time as other updaters
    fn runs_in_parallel(&self) -> bool {
        true
    }

    fn subscribe(&self) -> broadcast::Receiver<UpdaterEvent>;
}

/// Sum of sizes, counting resources sharing a download key once
pub fn deduplicated_size(resources: &[ResourceRef]) -> u64 {
    let mut seen = HashSet::new();
    resources
        .iter()
        .filter_map(|r| {
            let info = r.info();
            match info.download_key {
                Some(key) if !seen.insert(key.clone()) => None,
                _ => Some(info.size),
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Resource, ResourceInfo, ResourceKind};
    use std::sync::Arc;

    fn res(id: &str, size: u64, key: Option<&str>) -> ResourceRef {
        let mut info = ResourceInfo::new(id, "local").with_size(size);
        if let Some(key) = key {
            info = info.with_download_key(key);
        }
        Arc::new(Resource::new(ResourceKey::new("memory", id), ResourceKind::Runtime, info))
    }

    #[test]
    fn test_shared_downloads_count_once() {
        let list = vec![
            res("org.kde.Platform", 300, Some("kde-runtime")),
            res("org.kde.Platform.Locale", 300, Some("kde-runtime")),
            res("org.gimp.GIMP", 120, None),
            res("org.inkscape.Inkscape", 80, None),
        ];
        assert_eq!(deduplicated_size(&list), 500);
    }
}
