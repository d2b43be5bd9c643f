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

//! Updater that runs a batch as one update transaction per resource.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn, Instrument};

use super::graph::UpdateGraph;
use super::{deduplicated_size, BackendUpdater, UpdateState, UpdaterEvent};
use crate::backend::Backend;
use crate::error::{RescenterError, RescenterResult};
use crate::filter::Filter;
use crate::resource::{ResourceKey, ResourceRef, ResourceState};
use crate::transaction::{Transaction, TransactionModel, TransactionState, TransactionStatus};

#[derive(Default)]
struct Batch {
    /// Upgradeable set, sorted by name
    upgradeable: Vec<ResourceRef>,
    marked: HashSet<ResourceKey>,
    pending: HashSet<ResourceKey>,
    running: HashMap<ResourceKey, Arc<Transaction>>,
    size: usize,
    progress: f64,
    cancelable: bool,
    has_errors: bool,
    last_update: Option<DateTime<Utc>>,
    /// Set from `start` until `cleanup`; the progressing watch mirrors it
    in_progress: bool,
}

impl Batch {
    fn find(&self, key: &ResourceKey) -> Option<&ResourceRef> {
        self.upgradeable.iter().find(|r| r.key() == key)
    }

    fn marked_resources(&self) -> Vec<ResourceRef> {
        self.upgradeable
            .iter()
            .filter(|r| self.marked.contains(r.key()))
            .cloned()
            .collect()
    }
}

/// Default [`BackendUpdater`] for backends that update one resource at a time
pub struct StandardBackendUpdater {
    name: String,
    backend: Weak<dyn Backend>,
    this: Weak<StandardBackendUpdater>,
    batch: Mutex<Batch>,
    progressing: watch::Sender<bool>,
    refresh_deferred: AtomicBool,
    parallel: AtomicBool,
    events: broadcast::Sender<UpdaterEvent>,
}

impl std::fmt::Debug for StandardBackendUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardBackendUpdater")
            .field("backend", &self.name)
            .field("progressing", &self.is_progressing())
            .finish()
    }
}

fn update_state(state: &TransactionState) -> UpdateState {
    match state.status {
        TransactionStatus::Queued => UpdateState::None,
        TransactionStatus::Running if state.download_speed > 0 => UpdateState::Downloading,
        TransactionStatus::Running => UpdateState::Installing,
        _ => UpdateState::Done,
    }
}

impl StandardBackendUpdater {
    /// Updater for `backend`; backends usually create it inside `Arc::new_cyclic`
    pub fn new(name: impl Into<String>, backend: Weak<dyn Backend>) -> Arc<Self> {
        let (progressing, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        let name = name.into();
        Arc::new_cyclic(|this| StandardBackendUpdater {
            name,
            backend,
            this: this.clone(),
            batch: Mutex::new(Batch::default()),
            progressing,
            refresh_deferred: AtomicBool::new(false),
            parallel: AtomicBool::new(true),
            events,
        })
    }

    /// Backends that cannot share the system with other updates turn this off
    pub fn set_runs_in_parallel(&self, parallel: bool) {
        self.parallel.store(parallel, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Batch> {
        self.batch.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: UpdaterEvent) {
        let _ = self.events.send(event);
    }

    fn backend(&self) -> RescenterResult<Arc<dyn Backend>> {
        self.backend
            .upgrade()
            .ok_or_else(|| RescenterError::backend(&self.name, "backend is gone"))
    }

    fn busy(&self) -> RescenterError {
        RescenterError::UpdaterBusy {
            backend: self.name.clone(),
        }
    }

    /// Refresh the upgradeable set in the background; deferred while a batch runs
    pub fn schedule_refresh(&self) {
        if self.is_progressing() {
            self.refresh_deferred.store(true, Ordering::SeqCst);
            return;
        }
        let Some(me) = self.this.upgrade() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let span = tracing::debug_span!("refresh_upgradeable", backend = %self.name);
        handle.spawn(
            async move {
                if let Err(e) = me.refresh().await {
                    warn!(error = %e, "could not refresh the upgradeable set");
                }
            }
            .instrument(span),
        );
    }

    fn refresh_progress(&self, batch: &mut Batch) {
        if batch.size == 0 {
            return;
        }
        let finished = batch.size.saturating_sub(batch.pending.len()) as f64 * 100.0;
        let running: f64 = batch
            .running
            .values()
            .map(|t| f64::from(t.progress()))
            .sum();
        let progress = ((finished + running) / batch.size as f64).clamp(0.0, 100.0);
        if (progress - batch.progress).abs() > f64::EPSILON {
            batch.progress = progress;
            self.emit(UpdaterEvent::ProgressChanged(progress));
        }
    }

    fn set_progressing(&self, progressing: bool) {
        if self.progressing.send_replace(progressing) != progressing {
            self.emit(UpdaterEvent::ProgressingChanged(progressing));
        }
    }

    fn transaction_progressed(&self, key: &ResourceKey, state: &TransactionState) {
        self.emit(UpdaterEvent::ResourceProgressed {
            resource: key.clone(),
            progress: state.progress,
            state: update_state(state),
        });
        let mut batch = self.lock();
        self.refresh_progress(&mut batch);
    }

    fn transaction_finished(&self, key: &ResourceKey, status: TransactionStatus) {
        let mut batch = self.lock();
        if !batch.pending.remove(key) {
            return;
        }
        batch.running.remove(key);
        if status != TransactionStatus::Done {
            batch.has_errors = true;
        }
        self.refresh_progress(&mut batch);
        if batch.pending.is_empty() {
            self.cleanup(&mut batch);
        }
    }

    fn cleanup(&self, batch: &mut Batch) {
        batch.in_progress = false;
        batch.last_update = Some(Utc::now());
        batch.marked.clear();
        batch.running.clear();
        batch.progress = 100.0;
        self.emit(UpdaterEvent::ProgressChanged(100.0));
        if batch.cancelable {
            batch.cancelable = false;
            self.emit(UpdaterEvent::CancelableChanged(false));
        }
        info!(backend = %self.name, errors = batch.has_errors, "update batch finished");
        self.set_progressing(false);
        self.refresh_deferred.store(false, Ordering::SeqCst);
        self.schedule_refresh();
    }

    fn watch_transaction(me: Arc<Self>, key: ResourceKey, transaction: Arc<Transaction>) {
        let mut rx = transaction.watch();
        tokio::spawn(async move {
            loop {
                let state = rx.borrow_and_update().clone();
                me.transaction_progressed(&key, &state);
                if state.status.is_terminal() {
                    me.transaction_finished(&key, state.status);
                    return;
                }
                if rx.changed().await.is_err() {
                    me.transaction_finished(&key, TransactionStatus::DoneWithError);
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl BackendUpdater for StandardBackendUpdater {
    fn backend_name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self) -> RescenterResult<()> {
        let backend = self.backend()?;
        if !backend.is_valid() || backend.is_fetching() {
            return Ok(());
        }
        if self.is_progressing() {
            self.refresh_deferred.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let mut found: Vec<ResourceRef> = Vec::new();
        let mut seen = HashSet::new();
        for result in backend
            .search(&Filter::upgradeable(&self.name))
            .collect_all()
            .await
        {
            if result.resource.state() == ResourceState::Upgradeable
                && seen.insert(result.resource.key().clone())
            {
                found.push(result.resource);
            }
        }
        found.sort_by_key(|r| r.name());

        let mut batch = self.lock();
        if batch.in_progress {
            self.refresh_deferred.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let keys: HashSet<&ResourceKey> = found.iter().map(|r| r.key()).collect();
        batch.marked.retain(|k| keys.contains(k));
        let count = found.len();
        batch.upgradeable = found;
        drop(batch);

        debug!(backend = %self.name, count, "upgradeable set refreshed");
        self.emit(UpdaterEvent::UpdatesCountChanged(count));
        Ok(())
    }

    fn prepare(&self) -> RescenterResult<()> {
        let mut batch = self.lock();
        if batch.in_progress {
            return Err(self.busy());
        }
        batch.marked = batch.upgradeable.iter().map(|r| r.key().clone()).collect();
        debug!(backend = %self.name, marked = batch.marked.len(), "updater prepared");
        Ok(())
    }

    fn has_updates(&self) -> bool {
        !self.lock().upgradeable.is_empty()
    }

    fn add_resources(&self, resources: &[ResourceRef]) -> RescenterResult<()> {
        let mut batch = self.lock();
        if batch.in_progress {
            return Err(self.busy());
        }
        for resource in resources {
            if batch.find(resource.key()).is_none() {
                return Err(RescenterError::NotUpgradeable {
                    resource: resource.key().to_string(),
                });
            }
        }
        let graph = UpdateGraph::from_resources(&batch.upgradeable);
        let closure = graph.with_requirements(resources.iter().map(|r| r.id()));
        let added: Vec<ResourceKey> = batch
            .upgradeable
            .iter()
            .filter(|r| closure.contains(r.id()))
            .map(|r| r.key().clone())
            .collect();
        batch.marked.extend(added);
        Ok(())
    }

    fn remove_resources(&self, resources: &[ResourceRef]) -> RescenterResult<()> {
        let mut batch = self.lock();
        if batch.in_progress {
            return Err(self.busy());
        }
        let graph = UpdateGraph::from_resources(&batch.upgradeable);
        let mut dropped: HashSet<String> = HashSet::new();
        for resource in resources {
            dropped.insert(resource.id().to_string());
            dropped.extend(graph.removal_impact(resource.id()));
        }
        let backend = self.name.clone();
        batch
            .marked
            .retain(|k| k.backend != backend || !dropped.contains(&k.id));
        Ok(())
    }

    fn to_update(&self) -> Vec<ResourceRef> {
        self.lock().marked_resources()
    }

    fn is_marked(&self, resource: &ResourceRef) -> bool {
        self.lock().marked.contains(resource.key())
    }

    fn progress(&self) -> f64 {
        self.lock().progress
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        self.lock().last_update
    }

    fn is_cancelable(&self) -> bool {
        let batch = self.lock();
        batch.in_progress && batch.cancelable
    }

    fn is_progressing(&self) -> bool {
        *self.progressing.borrow()
    }

    fn watch_progressing(&self) -> watch::Receiver<bool> {
        self.progressing.subscribe()
    }

    fn update_size(&self) -> u64 {
        deduplicated_size(&self.to_update())
    }

    fn download_speed(&self) -> u64 {
        self.lock().running.values().map(|t| t.download_speed()).sum()
    }

    fn start(&self, transactions: &TransactionModel) -> RescenterResult<()> {
        let backend = self.backend()?;
        let me = self
            .this
            .upgrade()
            .ok_or_else(|| RescenterError::backend(&self.name, "updater is gone"))?;

        // Claim the batch and publish it under one lock so a concurrent
        // start or selection change sees it taken.
        let list = {
            let mut batch = self.lock();
            if batch.in_progress {
                return Err(self.busy());
            }
            batch.in_progress = true;
            self.set_progressing(true);
            batch.marked_resources()
        };

        let graph = UpdateGraph::from_resources(&list);
        let ids: Vec<String> = list.iter().map(|r| r.id().to_string()).collect();
        let order = graph.ordered(&ids).unwrap_or_else(|e| {
            warn!(error = %e, "updating in name order");
            ids.clone()
        });
        let by_id: HashMap<&str, &ResourceRef> = list.iter().map(|r| (r.id(), r)).collect();

        info!(backend = %self.name, count = list.len(), "starting update batch");
        let mut started = Vec::new();
        let mut failed = false;
        for id in &order {
            let Some(resource) = by_id.get(id.as_str()) else {
                continue;
            };
            match transactions.start_with(Some(resource.key()), || backend.update_application(resource)) {
                Ok(t) => {
                    t.set_visible(false);
                    started.push((resource.key().clone(), t));
                }
                Err(e) => {
                    warn!(resource = %resource.key(), error = %e, "could not start update");
                    self.emit(UpdaterEvent::PassiveMessage(e.to_string()));
                    failed = true;
                }
            }
        }

        let mut batch = self.lock();
        batch.size = list.len();
        batch.has_errors = failed;
        batch.progress = 0.0;
        batch.pending = started.iter().map(|(k, _)| k.clone()).collect();
        batch.running = started.iter().cloned().collect();
        let cancelable = started.iter().any(|(_, t)| t.is_cancellable());
        if cancelable != batch.cancelable {
            batch.cancelable = cancelable;
            self.emit(UpdaterEvent::CancelableChanged(cancelable));
        }

        if batch.pending.is_empty() {
            self.cleanup(&mut batch);
            return Ok(());
        }
        batch.progress = 1.0;
        self.emit(UpdaterEvent::ProgressChanged(1.0));
        drop(batch);

        for (key, t) in started {
            Self::watch_transaction(Arc::clone(&me), key, t);
        }
        Ok(())
    }

    fn cancel(&self) {
        let running: Vec<Arc<Transaction>> = self.lock().running.values().cloned().collect();
        for t in running {
            if let Err(e) = t.cancel() {
                debug!(transaction = %t.id(), error = %e, "not cancelled");
            }
        }
    }

    fn has_errors(&self) -> bool {
        self.lock().has_errors
    }

    fn runs_in_parallel(&self) -> bool {
        self.parallel.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<UpdaterEvent> {
        self.events.subscribe()
    }
}
