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

//! In-memory backend.
//!
//! Holds a fixed catalog and simulates transactions step by step. Its knobs
//! (delays, stalls, failures, cancellation windows) make it the backend the
//! rest of the crate is tested against, and it doubles as a demo backend for
//! the CLI.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn, Instrument};

use crate::backend::{Backend, BackendEvent};
use crate::error::{RescenterError, RescenterResult};
use crate::filter::Filter;
use crate::resource::{Resource, ResourceInfo, ResourceKey, ResourceKind, ResourceRef, ResourceState};
use crate::stream::{send_in_slices, ResultsStream};
use crate::transaction::{AddonList, Transaction, TransactionDriver, TransactionRole, TransactionStatus};
use crate::updater::{BackendUpdater, StandardBackendUpdater};
use crate::{span_query, span_transaction};

pub const NAME: &str = "memory";

#[derive(Debug, Clone)]
struct MemoryOptions {
    search_delay: Duration,
    stalled: bool,
    failing_search: Option<String>,
    steps: u8,
    step_delay: Duration,
    cancellable: bool,
    point_of_no_return: Option<u8>,
    failing: HashSet<String>,
    slice_size: usize,
    slice_pause: Duration,
    fetch_delay: Duration,
    valid: bool,
    serial_updates: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            search_delay: Duration::ZERO,
            stalled: false,
            failing_search: None,
            steps: 4,
            step_delay: Duration::from_millis(5),
            cancellable: true,
            point_of_no_return: None,
            failing: HashSet::new(),
            slice_size: 100,
            slice_pause: Duration::ZERO,
            fetch_delay: Duration::from_millis(5),
            valid: true,
            serial_updates: false,
        }
    }
}

/// Builder for [`MemoryBackend`]
pub struct MemoryBackendBuilder {
    name: String,
    resources: Vec<Resource>,
    pending_upgrades: Vec<String>,
    initial_fetch: Option<Duration>,
    options: MemoryOptions,
}

impl MemoryBackendBuilder {
    /// Add an application with a generated name
    pub fn app(self, id: &str, state: ResourceState) -> Self {
        let info = ResourceInfo::new(id, self.name.clone())
            .with_state(state)
            .with_size(1024 * 1024)
            .with_versions(
                state.is_installed().then_some("1.0"),
                Some(if state == ResourceState::Upgradeable { "1.1" } else { "1.0" }),
            );
        self.info(id, info)
    }

    pub fn info(mut self, id: &str, info: ResourceInfo) -> Self {
        let key = ResourceKey::new(self.name.clone(), id);
        self.resources.push(Resource::new(key, ResourceKind::Application, info));
        self
    }

    /// Add a fully built resource; its key must name this backend
    pub fn resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn search_delay(mut self, delay: Duration) -> Self {
        self.options.search_delay = delay;
        self
    }

    /// Searches never finish on their own
    pub fn stalled(mut self) -> Self {
        self.options.stalled = true;
        self
    }

    /// Searches fail with `message` and end empty
    pub fn failing_search(mut self, message: impl Into<String>) -> Self {
        self.options.failing_search = Some(message.into());
        self
    }

    pub fn steps(mut self, steps: u8) -> Self {
        self.options.steps = steps.max(1);
        self
    }

    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.options.step_delay = delay;
        self
    }

    pub fn not_cancellable(mut self) -> Self {
        self.options.cancellable = false;
        self
    }

    /// Transactions stop being cancellable once progress reaches `percent`
    pub fn point_of_no_return(mut self, percent: u8) -> Self {
        self.options.point_of_no_return = Some(percent.min(100));
        self
    }

    /// Transactions on `id` end with an error
    pub fn failing(mut self, id: &str) -> Self {
        self.options.failing.insert(id.to_string());
        self
    }

    pub fn slices(mut self, size: usize, pause: Duration) -> Self {
        self.options.slice_size = size.max(1);
        self.options.slice_pause = pause;
        self
    }

    /// `check_for_updates` turns `id` upgradeable
    pub fn pending_upgrade(mut self, id: &str) -> Self {
        self.pending_upgrades.push(id.to_string());
        self
    }

    pub fn fetch_delay(mut self, delay: Duration) -> Self {
        self.options.fetch_delay = delay;
        self
    }

    /// Start in the fetching state and finish loading after `delay`
    pub fn initial_fetch(mut self, delay: Duration) -> Self {
        self.initial_fetch = Some(delay);
        self
    }

    pub fn invalid(mut self) -> Self {
        self.options.valid = false;
        self
    }

    /// Updater that must not run next to other updaters
    pub fn serial_updates(mut self) -> Self {
        self.options.serial_updates = true;
        self
    }

    /// Build the backend; `initial_fetch` needs a running tokio runtime
    pub fn build(self) -> Arc<MemoryBackend> {
        let (events, _) = broadcast::channel(256);
        let resources: BTreeMap<String, ResourceRef> = self
            .resources
            .into_iter()
            .map(|r| (r.id().to_string(), Arc::new(r)))
            .collect();
        let name = self.name;
        let valid = self.options.valid;
        let serial = self.options.serial_updates;
        let backend = Arc::new_cyclic(|this: &Weak<MemoryBackend>| {
            let as_backend: Weak<dyn Backend> = this.clone();
            MemoryBackend {
                updater: StandardBackendUpdater::new(name.clone(), as_backend),
                name,
                this: this.clone(),
                resources: RwLock::new(resources),
                pending_upgrades: Mutex::new(self.pending_upgrades),
                addons: Mutex::new(HashMap::new()),
                fetching: AtomicBool::new(self.initial_fetch.is_some()),
                valid: AtomicBool::new(valid),
                events,
                options: self.options,
            }
        });
        backend.updater.set_runs_in_parallel(!serial);

        if let Some(delay) = self.initial_fetch {
            let me = Arc::clone(&backend);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                me.set_fetching(false);
                me.emit(BackendEvent::Initialized);
                me.updater.schedule_refresh();
            });
        } else {
            backend.updater.schedule_refresh();
        }
        backend
    }
}

/// Backend serving a fixed in-memory catalog
pub struct MemoryBackend {
    name: String,
    this: Weak<MemoryBackend>,
    resources: RwLock<BTreeMap<String, ResourceRef>>,
    pending_upgrades: Mutex<Vec<String>>,
    /// Installed addons per resource id
    addons: Mutex<HashMap<String, BTreeSet<String>>>,
    fetching: AtomicBool,
    valid: AtomicBool,
    updater: Arc<StandardBackendUpdater>,
    events: broadcast::Sender<BackendEvent>,
    options: MemoryOptions,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("name", &self.name)
            .field("resources", &self.len())
            .finish()
    }
}

impl MemoryBackend {
    pub fn builder(name: impl Into<String>) -> MemoryBackendBuilder {
        MemoryBackendBuilder {
            name: name.into(),
            resources: Vec::new(),
            pending_upgrades: Vec::new(),
            initial_fetch: None,
            options: MemoryOptions::default(),
        }
    }

    /// Small catalog used by `--backend memory`
    pub fn demo() -> Arc<MemoryBackend> {
        Self::builder(NAME)
            .info(
                "org.kde.kate",
                ResourceInfo::new("Kate", "memory")
                    .with_summary("Advanced text editor")
                    .with_categories(["Utility", "TextEditor"])
                    .with_versions(Some("23.08"), Some("24.02"))
                    .with_state(ResourceState::Upgradeable)
                    .with_size(12 * 1024 * 1024),
            )
            .info(
                "org.gimp.GIMP",
                ResourceInfo::new("GIMP", "memory")
                    .with_summary("GNU Image Manipulation Program")
                    .with_categories(["Graphics"])
                    .with_versions(None, Some("2.10.36"))
                    .with_size(300 * 1024 * 1024),
            )
            .info(
                "org.videolan.VLC",
                ResourceInfo::new("VLC", "memory")
                    .with_summary("Media player")
                    .with_categories(["AudioVideo"])
                    .with_versions(Some("3.0.20"), Some("3.0.20"))
                    .with_state(ResourceState::Installed)
                    .with_size(80 * 1024 * 1024),
            )
            .step_delay(Duration::from_millis(150))
            .build()
    }

    pub fn standard_updater(&self) -> Arc<StandardBackendUpdater> {
        Arc::clone(&self.updater)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ResourceRef>> {
        self.resources.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish an event as if the backend raised it
    pub fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_fetching(&self, fetching: bool) {
        if self.fetching.swap(fetching, Ordering::SeqCst) != fetching {
            self.emit(BackendEvent::FetchingChanged(fetching));
        }
    }

    /// Mark the backend unusable and tell listeners
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
        self.emit(BackendEvent::Invalidated);
    }

    /// Drop a resource from the catalog
    pub fn remove_resource(&self, id: &str) -> Option<ResourceRef> {
        let removed = self
            .resources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Some(resource) = &removed {
            self.emit(BackendEvent::ResourceRemoved(resource.key().clone()));
        }
        removed
    }

    /// Addons installed for `id`, sorted
    pub fn installed_addons(&self, id: &str) -> Vec<String> {
        self.addons
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn apply_addons(&self, id: &str, addons: &AddonList) {
        let mut all = self.addons.lock().unwrap_or_else(|e| e.into_inner());
        let set = all.entry(id.to_string()).or_default();
        for addon in &addons.to_remove {
            set.remove(addon);
        }
        set.extend(addons.to_install.iter().cloned());
        if set.is_empty() {
            all.remove(id);
        }
    }

    fn set_state(&self, resource: &ResourceRef, state: ResourceState) {
        if resource.set_state(state) {
            self.emit(BackendEvent::ResourcesChanged {
                resource: resource.key().clone(),
                properties: vec!["state".to_string()],
            });
        }
    }

    fn own(&self, resource: &ResourceRef) -> RescenterResult<ResourceRef> {
        if resource.backend() != self.name {
            return Err(RescenterError::ResourceNotFound {
                resource: resource.key().to_string(),
            });
        }
        self.resource(resource.id())
            .ok_or_else(|| RescenterError::ResourceNotFound {
                resource: resource.key().to_string(),
            })
    }

    fn start_transaction(&self, resource: &ResourceRef, role: TransactionRole, addons: AddonList) -> RescenterResult<Arc<Transaction>> {
        let resource = self.own(resource)?;
        let me = self
            .this
            .upgrade()
            .ok_or_else(|| RescenterError::backend(&self.name, "backend is shutting down"))?;
        let (transaction, driver) = Transaction::new(&resource, role, addons);
        driver.set_cancellable(self.options.cancellable);
        let span = span_transaction!(transaction);
        tokio::spawn(me.run_transaction(driver, resource).instrument(span));
        Ok(transaction)
    }

    async fn run_transaction(self: Arc<Self>, driver: TransactionDriver, resource: ResourceRef) {
        let role = driver.transaction().role();
        if driver.set_status(TransactionStatus::Running).is_err() {
            return;
        }
        let steps = self.options.steps;
        for step in 1..=steps {
            tokio::select! {
                _ = driver.cancelled() => {
                    debug!("cancelled at step {step}");
                    let _ = driver.set_status(TransactionStatus::Cancelled);
                    return;
                }
                _ = tokio::time::sleep(self.options.step_delay) => {}
            }
            let progress = (u32::from(step) * 100 / u32::from(steps)) as u8;
            if matches!(self.options.point_of_no_return, Some(limit) if progress >= limit) {
                driver.set_cancellable(false);
            }
            if progress < 100 {
                driver.set_progress(progress);
            }
        }

        if self.options.failing.contains(resource.id()) {
            let message = format!("Could not {} {}", role, resource.name());
            warn!(resource = %resource.key(), "{message}");
            driver.passive_message(message.clone());
            self.emit(BackendEvent::PassiveMessage(message));
            let _ = driver.set_status(TransactionStatus::DoneWithError);
            return;
        }

        let addons = driver.transaction().addons().clone();
        match role {
            TransactionRole::Remove => {
                resource.update(|info| info.installed_version = None);
                self.addons
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(resource.id());
                self.set_state(&resource, ResourceState::None);
            }
            TransactionRole::ChangeAddons => {
                self.apply_addons(resource.id(), &addons);
                self.emit(BackendEvent::ResourcesChanged {
                    resource: resource.key().clone(),
                    properties: vec!["addons".to_string()],
                });
            }
            TransactionRole::Install | TransactionRole::Update => {
                resource.update(|info| info.installed_version = info.available_version.clone());
                if !addons.is_empty() {
                    self.apply_addons(resource.id(), &addons);
                }
                self.set_state(&resource, ResourceState::Installed);
            }
        }
        let _ = driver.set_status(TransactionStatus::Done);
        self.emit(BackendEvent::UpdatesCountChanged(self.updates_count()));
        self.updater.schedule_refresh();
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> String {
        format!("In-memory catalog ({})", self.name)
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn search(&self, filter: &Filter) -> ResultsStream {
        let (tx, stream) = ResultsStream::channel(format!("{}-search", self.name));
        let stream = stream.with_backend(self.name.clone());
        if !filter.targets_backend(&self.name) {
            tx.finish();
            return stream;
        }

        let snapshot: Vec<ResourceRef> = self.read().values().cloned().collect();
        let options = self.options.clone();
        let events = self.events.clone();
        let filter = filter.clone();
        let span = span_query!(self.name, filter);
        tokio::spawn(
            async move {
                if !options.search_delay.is_zero() {
                    tokio::select! {
                        _ = tx.cancelled() => return,
                        _ = tokio::time::sleep(options.search_delay) => {}
                    }
                }
                if options.stalled {
                    tx.cancelled().await;
                    return;
                }
                if let Some(message) = options.failing_search {
                    warn!(%message, "search failed");
                    let _ = events.send(BackendEvent::PassiveMessage(message));
                    tx.finish();
                    return;
                }
                let results = filter.rank(snapshot);
                debug!(count = results.len(), "search done");
                send_in_slices(&tx, results, options.slice_size, options.slice_pause).await;
                tx.finish();
            }
            .instrument(span),
        );
        stream
    }

    fn resource(&self, id: &str) -> Option<ResourceRef> {
        self.read().get(id).cloned()
    }

    fn updates_count(&self) -> usize {
        self.read()
            .values()
            .filter(|r| r.state() == ResourceState::Upgradeable)
            .count()
    }

    fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::SeqCst)
    }

    fn updater(&self) -> Option<Arc<dyn BackendUpdater>> {
        Some(self.updater.clone())
    }

    fn install_application(&self, resource: &ResourceRef, addons: &AddonList) -> RescenterResult<Arc<Transaction>> {
        let role = if addons.is_empty() || !resource.is_installed() {
            TransactionRole::Install
        } else {
            TransactionRole::ChangeAddons
        };
        self.start_transaction(resource, role, addons.clone())
    }

    fn remove_application(&self, resource: &ResourceRef) -> RescenterResult<Arc<Transaction>> {
        self.start_transaction(resource, TransactionRole::Remove, AddonList::default())
    }

    fn update_application(&self, resource: &ResourceRef) -> RescenterResult<Arc<Transaction>> {
        self.start_transaction(resource, TransactionRole::Update, AddonList::default())
    }

    fn check_for_updates(&self) {
        let Some(me) = self.this.upgrade() else {
            return;
        };
        if self.is_fetching() {
            return;
        }
        self.set_fetching(true);
        tokio::spawn(async move {
            tokio::time::sleep(me.options.fetch_delay).await;
            let pending: Vec<String> = std::mem::take(&mut *me.pending_upgrades.lock().unwrap_or_else(|e| e.into_inner()));
            for id in pending {
                if let Some(resource) = me.resource(&id) {
                    resource.update(|info| {
                        if info.available_version == info.installed_version {
                            info.available_version = Some(format!(
                                "{}.1",
                                info.installed_version.as_deref().unwrap_or("1.0")
                            ));
                        }
                    });
                    me.set_state(&resource, ResourceState::Upgradeable);
                }
            }
            me.set_fetching(false);
            me.emit(BackendEvent::UpdatesCountChanged(me.updates_count()));
            me.updater.schedule_refresh();
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}
