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

//! Backend registry and query router.
//!
//! [`ResourcesModel`] owns the set of registered backends, fans queries out to
//! them and keeps the aggregate state (fetching, updates count, fetching
//! progress). Aggregate state has a single writer: a coordinator task fed by
//! a channel. Backend events reach it through one forwarder task per backend,
//! so the order of one backend's events is kept. Observers read the result
//! through `watch` receivers and the [`ModelEvent`] broadcast.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::aggregate::{AggregateOptions, AggregatedResultsStream};
use crate::backend::{Backend, BackendEvent};
use crate::config::AggregationConfig;
use crate::error::{RescenterError, RescenterResult};
use crate::filter::Filter;
use crate::resource::{ResourceKey, ResourceRef};
use crate::stream::ResultsStream;
use crate::transaction::{AddonList, Transaction, TransactionModel};
use crate::updater::BackendUpdater;

/// Aggregate notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    BackendsChanged,
    BackendRemoved(String),
    /// No registered backend is still loading
    AllInitialized,
    FetchingChanged(bool),
    UpdatesCountChanged(usize),
    FetchingUpdatesProgressChanged(u8),
    ResourceDataChanged {
        resource: ResourceKey,
        properties: Vec<String>,
    },
    AllDataChanged {
        backend: String,
        properties: Vec<String>,
    },
    ResourceRemoved(ResourceKey),
    PassiveMessage {
        backend: String,
        message: String,
    },
}

#[derive(Debug)]
enum Command {
    Registered {
        name: String,
        status: BackendStatus,
    },
    Backend {
        name: String,
        event: BackendEvent,
    },
    UpdaterProgressing {
        name: String,
        progressing: bool,
    },
    /// Events were lost; re-read the backend state
    Resync {
        name: String,
    },
    Unregistered {
        name: String,
    },
}

/// Last state a backend reported
#[derive(Debug, Clone, Copy, Default)]
struct BackendStatus {
    fetching: bool,
    updater_progressing: bool,
    updates_count: usize,
    fetching_progress: u8,
}

impl BackendStatus {
    fn read(backend: &dyn Backend) -> Self {
        Self {
            fetching: backend.is_fetching(),
            updater_progressing: backend.updater().map_or(false, |u| u.is_progressing()),
            updates_count: backend.updates_count(),
            fetching_progress: backend.fetching_progress(),
        }
    }
}

struct BackendEntry {
    backend: Arc<dyn Backend>,
    forwarders: Vec<JoinHandle<()>>,
}

struct ModelInner {
    config: AggregationConfig,
    backends: RwLock<Vec<BackendEntry>>,
    transactions: TransactionModel,
    fetching: watch::Sender<bool>,
    updates_count: watch::Sender<usize>,
    fetching_progress: watch::Sender<u8>,
    events: broadcast::Sender<ModelEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ModelInner {
    fn read(&self) -> RwLockReadGuard<'_, Vec<BackendEntry>> {
        self.backends.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<BackendEntry>> {
        self.backends.write().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ModelEvent) {
        let _ = self.events.send(event);
    }

    fn backend(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.read()
            .iter()
            .find(|e| e.backend.name() == name)
            .map(|e| Arc::clone(&e.backend))
    }

    fn unregister(&self, name: &str) -> RescenterResult<()> {
        let entry = {
            let mut backends = self.write();
            let pos = backends
                .iter()
                .position(|e| e.backend.name() == name)
                .ok_or_else(|| RescenterError::UnknownBackend {
                    backend: name.to_string(),
                })?;
            backends.remove(pos)
        };
        for task in &entry.forwarders {
            task.abort();
        }
        info!(backend = %name, "backend unregistered");
        let _ = self.commands.send(Command::Unregistered {
            name: name.to_string(),
        });
        Ok(())
    }
}

impl Drop for ModelInner {
    fn drop(&mut self) {
        let backends = self.backends.get_mut().unwrap_or_else(|e| e.into_inner());
        for entry in backends.iter() {
            for task in &entry.forwarders {
                task.abort();
            }
        }
    }
}

/// Single writer of the aggregate state
struct Coordinator {
    inner: Weak<ModelInner>,
    statuses: BTreeMap<String, BackendStatus>,
    initializing: HashSet<String>,
}

impl Coordinator {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            let Some(inner) = self.inner.upgrade() else {
                break;
            };
            self.handle(&inner, command);
        }
        debug!("coordinator stopped");
    }

    fn handle(&mut self, inner: &ModelInner, command: Command) {
        match command {
            Command::Registered { name, status } => {
                if status.fetching {
                    self.initializing.insert(name.clone());
                }
                self.statuses.insert(name, status);
                inner.emit(ModelEvent::BackendsChanged);
                if self.initializing.is_empty() {
                    inner.emit(ModelEvent::AllInitialized);
                }
            }
            Command::Unregistered { name } => {
                self.statuses.remove(&name);
                let was_initializing = self.initializing.remove(&name);
                inner.emit(ModelEvent::BackendRemoved(name));
                inner.emit(ModelEvent::BackendsChanged);
                if was_initializing && self.initializing.is_empty() {
                    inner.emit(ModelEvent::AllInitialized);
                }
            }
            Command::UpdaterProgressing { name, progressing } => {
                if let Some(status) = self.statuses.get_mut(&name) {
                    status.updater_progressing = progressing;
                }
            }
            Command::Resync { name } => {
                if let (Some(backend), Some(status)) = (inner.backend(&name), self.statuses.get_mut(&name)) {
                    debug!(backend = %name, "resynchronizing backend state");
                    let fresh = BackendStatus::read(backend.as_ref());
                    let was_fetching = status.fetching;
                    *status = fresh;
                    if was_fetching && !fresh.fetching {
                        self.finished_initializing(inner, &name);
                    }
                }
            }
            Command::Backend { name, event } => {
                if !self.statuses.contains_key(&name) {
                    return;
                }
                self.backend_event(inner, &name, event);
                if let Some(backend) = inner.backend(&name) {
                    if !backend.is_valid() {
                        warn!(backend = %name, "backend became invalid, discarding it");
                        let _ = inner.unregister(&name);
                    }
                }
            }
        }
        self.recompute(inner);
    }

    fn finished_initializing(&mut self, inner: &ModelInner, name: &str) {
        if self.initializing.remove(name) && self.initializing.is_empty() {
            info!("all backends initialized");
            inner.emit(ModelEvent::AllInitialized);
        }
    }

    fn backend_event(&mut self, inner: &ModelInner, name: &str, event: BackendEvent) {
        match event {
            BackendEvent::FetchingChanged(fetching) => {
                let Some(status) = self.statuses.get_mut(name) else {
                    return;
                };
                if status.fetching == fetching {
                    return;
                }
                status.fetching = fetching;
                if let Some(backend) = inner.backend(name) {
                    status.fetching_progress = backend.fetching_progress().min(100);
                    if !fetching {
                        status.updates_count = backend.updates_count();
                    }
                }
                if fetching {
                    self.initializing.insert(name.to_string());
                } else {
                    self.finished_initializing(inner, name);
                }
            }
            BackendEvent::UpdatesCountChanged(count) => {
                if let Some(status) = self.statuses.get_mut(name) {
                    status.updates_count = count;
                }
            }
            BackendEvent::FetchingProgressChanged(progress) => {
                if let Some(status) = self.statuses.get_mut(name) {
                    status.fetching_progress = progress.min(100);
                }
            }
            BackendEvent::Initialized => self.finished_initializing(inner, name),
            BackendEvent::ResourcesChanged { resource, properties } => {
                inner.emit(ModelEvent::ResourceDataChanged { resource, properties });
            }
            BackendEvent::AllDataChanged { properties } => {
                inner.emit(ModelEvent::AllDataChanged {
                    backend: name.to_string(),
                    properties,
                });
            }
            BackendEvent::ResourceRemoved(key) => inner.emit(ModelEvent::ResourceRemoved(key)),
            BackendEvent::PassiveMessage(message) => {
                inner.emit(ModelEvent::PassiveMessage {
                    backend: name.to_string(),
                    message,
                });
            }
            BackendEvent::Invalidated => {
                warn!(backend = %name, "backend invalidated itself");
                let _ = inner.unregister(name);
            }
        }
    }

    fn recompute(&self, inner: &ModelInner) {
        let fetching = self
            .statuses
            .values()
            .any(|s| s.fetching || s.updater_progressing);
        let count: usize = self.statuses.values().map(|s| s.updates_count).sum();
        let progress = if self.statuses.is_empty() {
            0
        } else {
            let sum: u32 = self.statuses.values().map(|s| u32::from(s.fetching_progress)).sum();
            (sum / self.statuses.len() as u32) as u8
        };

        if inner.fetching.send_if_modified(|v| std::mem::replace(v, fetching) != fetching) {
            inner.emit(ModelEvent::FetchingChanged(fetching));
        }
        if inner.updates_count.send_if_modified(|v| std::mem::replace(v, count) != count) {
            inner.emit(ModelEvent::UpdatesCountChanged(count));
        }
        if inner
            .fetching_progress
            .send_if_modified(|v| std::mem::replace(v, progress) != progress)
        {
            inner.emit(ModelEvent::FetchingUpdatesProgressChanged(progress));
        }
    }
}

/// Registry of backends plus the aggregate view over them.
///
/// Cheap to clone; every clone talks to the same registry. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct ResourcesModel {
    inner: Arc<ModelInner>,
}

impl std::fmt::Debug for ResourcesModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.backends().iter().map(|b| b.name().to_string()).collect();
        f.debug_struct("ResourcesModel").field("backends", &names).finish()
    }
}

impl ResourcesModel {
    pub fn new(config: AggregationConfig) -> Self {
        Self::with_transactions(config, TransactionModel::new())
    }

    /// Model sharing an existing transaction registry
    pub fn with_transactions(config: AggregationConfig, transactions: TransactionModel) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (fetching, _) = watch::channel(false);
        let (updates_count, _) = watch::channel(0);
        let (fetching_progress, _) = watch::channel(0);
        let (events, _) = broadcast::channel(1024);
        let inner = Arc::new(ModelInner {
            config,
            backends: RwLock::new(Vec::new()),
            transactions,
            fetching,
            updates_count,
            fetching_progress,
            events,
            commands,
        });
        let coordinator = Coordinator {
            inner: Arc::downgrade(&inner),
            statuses: BTreeMap::new(),
            initializing: HashSet::new(),
        };
        tokio::spawn(coordinator.run(rx).instrument(tracing::debug_span!("coordinator")));
        Self { inner }
    }

    /// Add a backend. Invalid and duplicate backends are rejected.
    pub fn register_backend(&self, backend: Arc<dyn Backend>) -> RescenterResult<()> {
        let name = backend.name().to_string();
        if !backend.is_valid() {
            warn!(backend = %name, "discarding invalid backend");
            return Err(RescenterError::InvalidBackend { backend: name });
        }

        let mut backends = self.inner.write();
        if backends.iter().any(|e| e.backend.name() == name) {
            return Err(RescenterError::DuplicateBackend { backend: name });
        }

        // Subscribe before reading the state so no change falls in between.
        let mut events = backend.subscribe();
        let updater = backend.updater();
        let mut progressing = updater.as_ref().map(|u| u.watch_progressing());
        let status = BackendStatus::read(backend.as_ref());
        let _ = self.inner.commands.send(Command::Registered {
            name: name.clone(),
            status,
        });

        let mut forwarders = Vec::new();
        let commands = self.inner.commands.clone();
        let backend_name = name.clone();
        forwarders.push(tokio::spawn(
            async move {
                loop {
                    let command = match events.recv().await {
                        Ok(event) => Command::Backend {
                            name: backend_name.clone(),
                            event,
                        },
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "backend events lagged");
                            Command::Resync {
                                name: backend_name.clone(),
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if commands.send(command).is_err() {
                        break;
                    }
                }
            }
            .instrument(tracing::debug_span!("forward", backend = %name)),
        ));

        if let Some(mut rx) = progressing.take() {
            let commands = self.inner.commands.clone();
            let backend_name = name.clone();
            forwarders.push(tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let progressing = *rx.borrow_and_update();
                    let command = Command::UpdaterProgressing {
                        name: backend_name.clone(),
                        progressing,
                    };
                    if commands.send(command).is_err() {
                        break;
                    }
                }
            }));
        }

        info!(backend = %name, display = %backend.display_name(), "backend registered");
        backends.push(BackendEntry { backend, forwarders });
        Ok(())
    }

    /// Remove a backend; streams it already started keep running
    pub fn unregister_backend(&self, name: &str) -> RescenterResult<()> {
        self.inner.unregister(name)
    }

    pub fn backends(&self) -> Vec<Arc<dyn Backend>> {
        self.inner
            .read()
            .iter()
            .map(|e| Arc::clone(&e.backend))
            .collect()
    }

    pub fn backend(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.inner.backend(name)
    }

    /// Updaters of every registered backend that has one
    pub fn updaters(&self) -> Vec<Arc<dyn BackendUpdater>> {
        self.backends().iter().filter_map(|b| b.updater()).collect()
    }

    /// Interactive search over every backend the filter targets
    pub fn search(&self, filter: &Filter) -> ResultsStream {
        self.search_with(filter, self.inner.config.search_options())
    }

    pub fn search_with(&self, filter: &Filter, options: AggregateOptions) -> ResultsStream {
        let children: Vec<ResultsStream> = self
            .backends()
            .into_iter()
            .filter(|b| filter.targets_backend(b.name()))
            .map(|b| b.search(filter))
            .collect();
        debug!(%filter, backends = children.len(), "search");
        if children.is_empty() {
            return ResultsStream::empty("ResourcesModel");
        }
        AggregatedResultsStream::new(children, options)
    }

    /// Look a resource up through its backend
    pub fn resolve(&self, key: &ResourceKey) -> Option<ResourceRef> {
        self.backend(&key.backend)?.resource(&key.id)
    }

    fn owner(&self, resource: &ResourceRef) -> RescenterResult<Arc<dyn Backend>> {
        self.backend(resource.backend())
            .ok_or_else(|| RescenterError::UnknownBackend {
                backend: resource.backend().to_string(),
            })
    }

    pub fn install_application(&self, resource: &ResourceRef, addons: &AddonList) -> RescenterResult<Arc<Transaction>> {
        let backend = self.owner(resource)?;
        self.inner
            .transactions
            .start_with(Some(resource.key()), || backend.install_application(resource, addons))
    }

    pub fn remove_application(&self, resource: &ResourceRef) -> RescenterResult<Arc<Transaction>> {
        let backend = self.owner(resource)?;
        self.inner
            .transactions
            .start_with(Some(resource.key()), || backend.remove_application(resource))
    }

    pub fn update_application(&self, resource: &ResourceRef) -> RescenterResult<Arc<Transaction>> {
        let backend = self.owner(resource)?;
        self.inner
            .transactions
            .start_with(Some(resource.key()), || backend.update_application(resource))
    }

    /// Ask every backend to refresh its metadata; returns immediately
    pub fn check_for_updates(&self) {
        for backend in self.backends() {
            debug!(backend = %backend.name(), "checking for updates");
            backend.check_for_updates();
        }
    }

    pub fn transactions(&self) -> &TransactionModel {
        &self.inner.transactions
    }

    pub fn is_fetching(&self) -> bool {
        *self.inner.fetching.borrow()
    }

    pub fn watch_fetching(&self) -> watch::Receiver<bool> {
        self.inner.fetching.subscribe()
    }

    pub fn updates_count(&self) -> usize {
        *self.inner.updates_count.borrow()
    }

    pub fn watch_updates_count(&self) -> watch::Receiver<usize> {
        self.inner.updates_count.subscribe()
    }

    /// Mean of the backends' fetching progress, 0..=100
    pub fn fetching_updates_progress(&self) -> u8 {
        *self.inner.fetching_progress.borrow()
    }

    pub fn has_security_updates(&self) -> bool {
        self.backends().iter().any(|b| b.has_security_updates())
    }

    /// Whether any transaction is running
    pub fn is_busy(&self) -> bool {
        !self.inner.transactions.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once no backend is fetching
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.fetching.subscribe();
        let _ = rx.wait_for(|fetching| !*fetching).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;
    use crate::resource::ResourceState;
    use crate::transaction::TransactionStatus;
    use std::time::Duration;
    use tokio::time::Instant;

    const WAIT: Duration = Duration::from_secs(10);

    fn model() -> ResourcesModel {
        ResourcesModel::new(AggregationConfig::default())
    }

    async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, f: F)
    where
        F: FnMut(&T) -> bool,
    {
        tokio::time::timeout(WAIT, rx.wait_for(f))
            .await
            .expect("condition reached in time")
            .expect("model alive");
    }

    async fn wait_event<F>(rx: &mut broadcast::Receiver<ModelEvent>, mut f: F)
    where
        F: FnMut(&ModelEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Ok(event) if f(&event) => return,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("model closed"),
                }
            }
        })
        .await
        .expect("event in time");
    }

    #[tokio::test]
    async fn test_no_backends_gives_terminal_stream() {
        let model = model();
        let mut stream = model.search(&Filter::new().with_search("kate"));
        assert!(stream.next_batch().await.is_none());
        assert!(stream.is_terminated());
    }

    #[tokio::test]
    async fn test_three_plus_zero_results() {
        let model = model();
        let a = MemoryBackend::builder("a")
            .app("kate", ResourceState::None)
            .app("kdevelop", ResourceState::None)
            .app("konsole", ResourceState::Installed)
            .build();
        let b = MemoryBackend::builder("b").app("gimp", ResourceState::None).build();
        model.register_backend(a).unwrap();
        model.register_backend(b).unwrap();

        let results = model.search(&Filter::new().with_search("k")).collect_all().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.resource.backend() == "a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_backend_is_cut_off() {
        let model = model();
        let fast = MemoryBackend::builder("fast")
            .app("kate", ResourceState::None)
            .app("krita", ResourceState::None)
            .build();
        let stalled = MemoryBackend::builder("stalled")
            .app("gimp", ResourceState::None)
            .stalled()
            .build();
        model.register_backend(fast).unwrap();
        model.register_backend(stalled).unwrap();

        let started = Instant::now();
        let results = model
            .search_with(&Filter::new(), AggregateOptions::bounded(Duration::from_secs(15)))
            .collect_all()
            .await;
        assert_eq!(results.len(), 2);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));
    }

    #[tokio::test]
    async fn test_failing_backend_is_isolated() {
        let model = model();
        let mut events = model.subscribe();
        let good = MemoryBackend::builder("good").app("kate", ResourceState::None).build();
        let bad = MemoryBackend::builder("bad")
            .app("kate", ResourceState::None)
            .failing_search("mirror unreachable")
            .build();
        model.register_backend(good).unwrap();
        model.register_backend(bad).unwrap();

        let results = model.search(&Filter::new()).collect_all().await;
        assert_eq!(results.len(), 1);
        wait_event(&mut events, |e| {
            matches!(e, ModelEvent::PassiveMessage { backend, .. } if backend == "bad")
        })
        .await;
    }

    #[tokio::test]
    async fn test_registration_rules() {
        let model = model();
        let mut events = model.subscribe();
        let invalid = MemoryBackend::builder("broken").invalid().build();
        assert!(matches!(
            model.register_backend(invalid),
            Err(RescenterError::InvalidBackend { .. })
        ));

        model
            .register_backend(MemoryBackend::builder("memory").build())
            .unwrap();
        assert!(matches!(
            model.register_backend(MemoryBackend::builder("memory").build()),
            Err(RescenterError::DuplicateBackend { .. })
        ));
        assert_eq!(model.backends().len(), 1);
        wait_event(&mut events, |e| *e == ModelEvent::BackendsChanged).await;
        wait_event(&mut events, |e| *e == ModelEvent::AllInitialized).await;

        assert!(matches!(
            model.unregister_backend("nope"),
            Err(RescenterError::UnknownBackend { .. })
        ));
    }

    #[tokio::test]
    async fn test_all_initialized_waits_for_loading_backends() {
        let model = model();
        let mut events = model.subscribe();
        let slow = MemoryBackend::builder("slow")
            .initial_fetch(Duration::from_millis(50))
            .build();
        model.register_backend(slow).unwrap();

        let mut fetching = model.watch_fetching();
        wait_for(&mut fetching, |f| *f).await;
        wait_event(&mut events, |e| *e == ModelEvent::AllInitialized).await;
        wait_for(&mut fetching, |f| !*f).await;
    }

    #[tokio::test]
    async fn test_updates_count_and_fetching() {
        let model = model();
        let mut events = model.subscribe();
        let a = MemoryBackend::builder("a")
            .app("kate", ResourceState::Upgradeable)
            .app("krita", ResourceState::Upgradeable)
            .build();
        let b = MemoryBackend::builder("b")
            .app("gimp", ResourceState::Upgradeable)
            .app("vlc", ResourceState::Installed)
            .pending_upgrade("vlc")
            .fetch_delay(Duration::from_millis(20))
            .build();
        model.register_backend(a).unwrap();
        model.register_backend(b).unwrap();

        let mut count = model.watch_updates_count();
        wait_for(&mut count, |c| *c == 3).await;

        model.check_for_updates();
        wait_event(&mut events, |e| *e == ModelEvent::FetchingChanged(true)).await;
        wait_for(&mut count, |c| *c == 4).await;
        let mut fetching = model.watch_fetching();
        wait_for(&mut fetching, |f| !*f).await;
        assert_eq!(model.fetching_updates_progress(), 100);
    }

    #[tokio::test]
    async fn test_one_transaction_per_resource() {
        let model = model();
        let backend = MemoryBackend::builder("memory")
            .app("kate", ResourceState::None)
            .step_delay(Duration::from_millis(5))
            .build();
        model.register_backend(backend.clone()).unwrap();
        let kate = model.resolve(&ResourceKey::new("memory", "kate")).unwrap();

        let t = model.install_application(&kate, &AddonList::default()).unwrap();
        assert!(model.is_busy());
        let err = model.remove_application(&kate).unwrap_err();
        assert!(matches!(err, RescenterError::TransactionInProgress { .. }));
        assert_eq!(model.transactions().count(), 1);

        assert_eq!(t.wait().await, TransactionStatus::Done);
        tokio::time::timeout(WAIT, model.transactions().wait_idle()).await.unwrap();
        assert_eq!(kate.state(), ResourceState::Installed);

        let t = model.remove_application(&kate).unwrap();
        assert_eq!(t.wait().await, TransactionStatus::Done);
        assert_eq!(kate.state(), ResourceState::None);
    }

    #[tokio::test]
    async fn test_unknown_owner_is_rejected() {
        let model = model();
        let orphan = MemoryBackend::builder("orphan").app("kate", ResourceState::None).build();
        let kate = orphan.resource("kate").unwrap();
        assert!(matches!(
            model.install_application(&kate, &AddonList::default()),
            Err(RescenterError::UnknownBackend { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalidated_backend_is_removed() {
        let model = model();
        let mut events = model.subscribe();
        let keep = MemoryBackend::builder("keep").app("kate", ResourceState::None).build();
        let gone = MemoryBackend::builder("gone").app("gimp", ResourceState::None).build();
        model.register_backend(keep).unwrap();
        model.register_backend(gone.clone()).unwrap();

        gone.invalidate();
        wait_event(&mut events, |e| *e == ModelEvent::BackendRemoved("gone".to_string())).await;
        assert_eq!(model.backends().len(), 1);
        let results = model.search(&Filter::new()).collect_all().await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_keeps_running_streams() {
        let model = model();
        let slow = MemoryBackend::builder("slow")
            .app("gimp", ResourceState::None)
            .search_delay(Duration::from_millis(50))
            .build();
        model.register_backend(slow).unwrap();

        let stream = model.search(&Filter::new());
        model.unregister_backend("slow").unwrap();
        assert_eq!(stream.collect_all().await.len(), 1);
        assert!(model.search(&Filter::new()).collect_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_resource_changes_are_relayed() {
        let model = model();
        let mut events = model.subscribe();
        let backend = MemoryBackend::builder("memory")
            .app("kate", ResourceState::None)
            .step_delay(Duration::from_millis(1))
            .build();
        model.register_backend(backend).unwrap();
        let kate = model.resolve(&ResourceKey::new("memory", "kate")).unwrap();
        model.install_application(&kate, &AddonList::default()).unwrap();
        wait_event(&mut events, |e| {
            matches!(e, ModelEvent::ResourceDataChanged { resource, properties }
                if resource.id == "kate" && properties.iter().any(|p| p == "state"))
        })
        .await;
    }
}
