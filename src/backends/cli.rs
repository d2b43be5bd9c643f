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

//! Backend driving a package-manager command line tool.
//!
//! A [`PackageTool`] knows how to list, search and query updates with one
//! tool and which arguments install, remove or update a resource.
//! [`CliBackend`] turns that into a [`Backend`]: it owns the resource cache,
//! runs the tool off the caller's task and reports through events.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Instrument};

use super::command;
use crate::backend::{Backend, BackendEvent};
use crate::error::{RescenterError, RescenterResult};
use crate::filter::Filter;
use crate::resource::{Resource, ResourceRef, ResourceState};
use crate::stream::{send_in_slices, ResultsStream};
use crate::transaction::{AddonList, Transaction, TransactionRole};
use crate::updater::{BackendUpdater, StandardBackendUpdater};
use crate::{span_query, span_transaction};

/// One pending update reported by a tool
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub id: String,
    pub version: Option<String>,
}

#[async_trait]
pub trait PackageTool: Send + Sync + 'static {
    /// Backend name, also the `backend` part of resource keys
    fn name(&self) -> &str;

    fn display_name(&self) -> String;

    /// Executable used for transactions
    fn program(&self) -> &str;

    /// Whether the tool can be used; checked once when the backend is created
    fn is_usable(&self) -> bool {
        command::is_available(self.program())
    }

    /// Everything installed; authoritative for the installed state
    async fn installed(&self) -> RescenterResult<Vec<Resource>>;

    /// Remote search for a free-text term
    async fn search(&self, term: &str) -> RescenterResult<Vec<Resource>>;

    async fn updates(&self) -> RescenterResult<Vec<PendingUpdate>>;

    fn install_args(&self, resource: &Resource) -> Vec<String>;

    fn remove_args(&self, resource: &Resource) -> Vec<String>;

    fn update_args(&self, resource: &Resource) -> Vec<String>;

    /// Commands adding and dropping addons of `resource`, run in order after
    /// the main operation. Tools without addons return nothing.
    fn addon_args(&self, _resource: &Resource, _addons: &AddonList) -> Vec<Vec<String>> {
        Vec::new()
    }
}

/// How results are handed out in batches
#[derive(Debug, Clone, Copy)]
pub struct SliceOptions {
    pub size: usize,
    pub pause: Duration,
}

impl Default for SliceOptions {
    fn default() -> Self {
        Self {
            size: 100,
            pause: Duration::from_millis(10),
        }
    }
}

pub struct CliBackend<T: PackageTool> {
    tool: Arc<T>,
    this: Weak<CliBackend<T>>,
    resources: RwLock<BTreeMap<String, ResourceRef>>,
    valid: bool,
    fetching: AtomicBool,
    updates: AtomicUsize,
    updater: Arc<StandardBackendUpdater>,
    events: broadcast::Sender<BackendEvent>,
    slices: SliceOptions,
}

impl<T: PackageTool> std::fmt::Debug for CliBackend<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliBackend")
            .field("name", &self.tool.name())
            .field("resources", &self.read().len())
            .field("fetching", &self.is_fetching())
            .finish()
    }
}

impl<T: PackageTool> CliBackend<T> {
    /// Backend with an empty cache; call [`CliBackend::start`] to load it
    pub fn new(tool: T, slices: SliceOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let name = tool.name().to_string();
        let valid = tool.is_usable();
        Arc::new_cyclic(|this: &Weak<CliBackend<T>>| {
            let as_backend: Weak<dyn Backend> = this.clone();
            CliBackend {
                tool: Arc::new(tool),
                this: this.clone(),
                resources: RwLock::new(BTreeMap::new()),
                valid,
                fetching: AtomicBool::new(false),
                updates: AtomicUsize::new(0),
                updater: StandardBackendUpdater::new(name, as_backend),
                events,
                slices,
            }
        })
    }

    /// Begin the initial load in the background
    pub fn start(self: &Arc<Self>) {
        self.check_for_updates();
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ResourceRef>> {
        self.resources.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ResourceRef>> {
        self.resources.write().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    fn set_fetching(&self, fetching: bool) {
        if self.fetching.swap(fetching, Ordering::SeqCst) != fetching {
            self.emit(BackendEvent::FetchingChanged(fetching));
        }
    }

    fn changed(&self, resource: &Resource, property: &str) {
        self.emit(BackendEvent::ResourcesChanged {
            resource: resource.key().clone(),
            properties: vec![property.to_string()],
        });
    }

    /// Remote results only fill gaps; cached resources keep their installed state
    fn merge_remote(&self, found: Vec<Resource>) -> Vec<ResourceRef> {
        let mut cache = self.write();
        found
            .into_iter()
            .map(|resource| {
                Arc::clone(
                    cache
                        .entry(resource.id().to_string())
                        .or_insert_with(|| Arc::new(resource)),
                )
            })
            .collect()
    }

    /// Installed listing replaces what is cached; anything missing from it is no longer installed
    fn merge_installed(&self, installed: Vec<Resource>, updates: &[PendingUpdate]) {
        let pending: HashMap<&str, Option<&str>> = updates
            .iter()
            .map(|u| (u.id.as_str(), u.version.as_deref()))
            .collect();
        let mut changed: Vec<ResourceRef> = Vec::new();
        let mut seen = HashSet::with_capacity(installed.len());
        {
            let mut cache = self.write();
            for resource in installed {
                let mut info = resource.info();
                if let Some(version) = pending.get(resource.id()) {
                    info.state = ResourceState::Upgradeable;
                    if let Some(version) = version {
                        info.available_version = Some(version.to_string());
                    }
                } else if info.state == ResourceState::Upgradeable {
                    info.state = ResourceState::Installed;
                }
                seen.insert(resource.id().to_string());
                match cache.get(resource.id()) {
                    Some(existing) => {
                        if existing.replace_info(info) {
                            changed.push(Arc::clone(existing));
                        }
                    }
                    None => {
                        resource.replace_info(info);
                        cache.insert(resource.id().to_string(), Arc::new(resource));
                    }
                }
            }
            for (id, resource) in cache.iter() {
                if resource.is_installed() && !seen.contains(id) && resource.set_state(ResourceState::None) {
                    changed.push(Arc::clone(resource));
                }
            }
        }
        for resource in &changed {
            self.changed(resource, "state");
        }
    }

    /// Re-read installed resources and pending updates
    pub async fn reload(&self) {
        let tool = Arc::clone(&self.tool);
        let loaded = async {
            let installed = tool.installed().await?;
            let updates = tool.updates().await?;
            Ok::<_, RescenterError>((installed, updates))
        }
        .await;

        match loaded {
            Ok((installed, updates)) => {
                debug!(installed = installed.len(), updates = updates.len(), "reloaded");
                self.merge_installed(installed, &updates);
            }
            Err(e) => {
                warn!(backend = %self.tool.name(), error = %e, "reload failed");
                self.emit(BackendEvent::PassiveMessage(e.inline_message()));
            }
        }

        let count = self.count_upgradeable();
        if self.updates.swap(count, Ordering::SeqCst) != count {
            self.emit(BackendEvent::UpdatesCountChanged(count));
        }
        self.set_fetching(false);
        self.emit(BackendEvent::Initialized);
        self.updater.schedule_refresh();
    }

    fn count_upgradeable(&self) -> usize {
        self.read()
            .values()
            .filter(|r| r.state() == ResourceState::Upgradeable)
            .count()
    }

    fn own(&self, resource: &ResourceRef) -> RescenterResult<ResourceRef> {
        if resource.backend() != self.tool.name() {
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
            .ok_or_else(|| RescenterError::backend(self.tool.name(), "backend is shutting down"))?;
        let mut commands = match role {
            TransactionRole::Install => vec![self.tool.install_args(&resource)],
            TransactionRole::ChangeAddons => Vec::new(),
            TransactionRole::Remove => vec![self.tool.remove_args(&resource)],
            TransactionRole::Update => vec![self.tool.update_args(&resource)],
        };
        if matches!(role, TransactionRole::Install | TransactionRole::ChangeAddons) && !addons.is_empty() {
            let extra = self.tool.addon_args(&resource, &addons);
            if extra.is_empty() {
                return Err(RescenterError::Unsupported {
                    backend: self.tool.name().to_string(),
                    operation: "addons".to_string(),
                });
            }
            commands.extend(extra);
        }
        let (transaction, driver) = Transaction::new(&resource, role, addons);
        let span = span_transaction!(transaction);
        tokio::spawn(
            async move {
                let name = me.tool.name().to_string();
                let mut result = Ok(());
                for args in &commands {
                    result = command::run_transaction(&driver, &name, me.tool.program(), args).await;
                    if result.is_err() {
                        break;
                    }
                }
                match &result {
                    Ok(()) => {
                        match role {
                            TransactionRole::ChangeAddons => me.changed(&resource, "addons"),
                            TransactionRole::Remove => {
                                resource.update(|info| info.installed_version = None);
                                if resource.set_state(ResourceState::None) {
                                    me.changed(&resource, "state");
                                }
                            }
                            TransactionRole::Install | TransactionRole::Update => {
                                resource.update(|info| {
                                    if info.available_version.is_some() {
                                        info.installed_version = info.available_version.clone();
                                    }
                                });
                                if resource.set_state(ResourceState::Installed) {
                                    me.changed(&resource, "state");
                                }
                            }
                        }
                        info!(resource = %resource.key(), %role, "transaction done");
                    }
                    Err(RescenterError::Interrupted) => debug!("transaction cancelled"),
                    Err(e) => {
                        warn!(resource = %resource.key(), error = %e, "transaction failed");
                        me.emit(BackendEvent::PassiveMessage(e.inline_message()));
                    }
                }
                driver.finish(&result);
                if result.is_ok() {
                    me.check_for_updates();
                }
            }
            .instrument(span),
        );
        Ok(transaction)
    }
}

#[async_trait]
impl<T: PackageTool> Backend for CliBackend<T> {
    fn name(&self) -> &str {
        self.tool.name()
    }

    fn display_name(&self) -> String {
        self.tool.display_name()
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn search(&self, filter: &Filter) -> ResultsStream {
        let (tx, stream) = ResultsStream::channel(format!("{}-search", self.tool.name()));
        let stream = stream.with_backend(self.tool.name().to_string());
        let Some(me) = self.this.upgrade().filter(|_| filter.targets_backend(self.tool.name())) else {
            tx.finish();
            return stream;
        };

        let filter = filter.clone();
        let span = span_query!(self.tool.name(), filter);
        tokio::spawn(
            async move {
                let mut found: Vec<ResourceRef> = me.read().values().cloned().collect();
                let remote_term = filter.search.clone().filter(|_| !filter.only_installed);
                if let Some(term) = remote_term {
                    let remote = tokio::select! {
                        _ = tx.cancelled() => return,
                        remote = me.tool.search(&term) => remote,
                    };
                    match remote {
                        Ok(list) => {
                            let merged = me.merge_remote(list);
                            found.retain(|r| !merged.iter().any(|m| Arc::ptr_eq(m, r)));
                            found.extend(merged);
                        }
                        Err(e) => {
                            warn!(error = %e, "remote search failed");
                            me.emit(BackendEvent::PassiveMessage(e.inline_message()));
                        }
                    }
                }
                let results = filter.rank(found);
                debug!(count = results.len(), "search done");
                send_in_slices(&tx, results, me.slices.size, me.slices.pause).await;
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
        self.updates.load(Ordering::SeqCst)
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
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.fetching.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(BackendEvent::FetchingChanged(true));
        let span = tracing::debug_span!("reload", backend = %self.tool.name());
        handle.spawn(async move { me.reload().await }.instrument(span));
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceInfo, ResourceKey, ResourceKind};
    use crate::transaction::TransactionStatus;

    const WAIT: Duration = Duration::from_secs(10);

    struct FakeTool {
        script: &'static str,
        /// Addon commands append `<verb> <addon>` lines here
        addon_log: Option<std::path::PathBuf>,
    }

    fn app(id: &str, state: ResourceState) -> Resource {
        Resource::new(
            ResourceKey::new("fake", id),
            ResourceKind::Application,
            ResourceInfo::new(id, "fake-remote")
                .with_state(state)
                .with_versions(state.is_installed().then_some("1.0"), Some("1.0")),
        )
    }

    #[async_trait]
    impl PackageTool for FakeTool {
        fn name(&self) -> &str {
            "fake"
        }

        fn display_name(&self) -> String {
            "Fake".to_string()
        }

        fn program(&self) -> &str {
            "sh"
        }

        async fn installed(&self) -> RescenterResult<Vec<Resource>> {
            Ok(vec![app("kate", ResourceState::Installed), app("vlc", ResourceState::Installed)])
        }

        async fn search(&self, _term: &str) -> RescenterResult<Vec<Resource>> {
            Ok(vec![app("gimp", ResourceState::None), app("kate", ResourceState::None)])
        }

        async fn updates(&self) -> RescenterResult<Vec<PendingUpdate>> {
            Ok(vec![PendingUpdate {
                id: "kate".to_string(),
                version: Some("2.0".to_string()),
            }])
        }

        fn install_args(&self, _resource: &Resource) -> Vec<String> {
            vec!["-c".to_string(), self.script.to_string()]
        }

        fn remove_args(&self, resource: &Resource) -> Vec<String> {
            self.install_args(resource)
        }

        fn update_args(&self, resource: &Resource) -> Vec<String> {
            self.install_args(resource)
        }

        fn addon_args(&self, _resource: &Resource, addons: &AddonList) -> Vec<Vec<String>> {
            let Some(log) = &self.addon_log else {
                return Vec::new();
            };
            let log = log.display();
            let lines = addons
                .to_install
                .iter()
                .map(|a| format!("echo install {a} >> {log}"))
                .chain(addons.to_remove.iter().map(|a| format!("echo remove {a} >> {log}")));
            lines.map(|line| vec!["-c".to_string(), line]).collect()
        }
    }

    async fn backend(script: &'static str) -> Arc<CliBackend<FakeTool>> {
        let backend = CliBackend::new(FakeTool { script, addon_log: None }, SliceOptions::default());
        backend.reload().await;
        backend
    }

    #[tokio::test]
    async fn test_reload_marks_updates() {
        let backend = backend("true").await;
        assert!(!backend.is_fetching());
        assert_eq!(backend.updates_count(), 1);
        let kate = backend.resource("kate").unwrap();
        assert_eq!(kate.state(), ResourceState::Upgradeable);
        assert_eq!(kate.info().available_version.as_deref(), Some("2.0"));
        assert_eq!(backend.resource("vlc").unwrap().state(), ResourceState::Installed);
    }

    #[tokio::test]
    async fn test_remote_results_keep_installed_state() {
        let backend = backend("true").await;
        let results = backend.search(&Filter::new().with_search("gimp")).collect_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(backend.resource("gimp").unwrap().state(), ResourceState::None);

        let results = backend.search(&Filter::new().with_search("kate")).collect_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].resource.state(), ResourceState::Upgradeable);

        let installed = backend.search(&Filter::new().installed_only()).collect_all().await;
        assert_eq!(installed.len(), 2);
        assert_eq!(backend.search(&Filter::new()).collect_all().await.len(), 3);
    }

    #[tokio::test]
    async fn test_install_runs_the_tool() {
        let backend = backend("echo 50%").await;
        backend.search(&Filter::new().with_search("gimp")).collect_all().await;
        let gimp = backend.resource("gimp").unwrap();

        let t = backend.install_application(&gimp, &AddonList::default()).unwrap();
        let status = tokio::time::timeout(WAIT, t.wait()).await.unwrap();
        assert_eq!(status, TransactionStatus::Done);
        assert_eq!(gimp.state(), ResourceState::Installed);
    }

    #[tokio::test]
    async fn test_change_addons_runs_addon_commands() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("addons.log");
        let tool = FakeTool {
            script: "exit 1",
            addon_log: Some(log.clone()),
        };
        let backend = CliBackend::new(tool, SliceOptions::default());
        backend.reload().await;
        let vlc = backend.resource("vlc").unwrap();

        let addons = AddonList {
            to_install: vec!["codecs".to_string()],
            to_remove: vec!["subtitles".to_string()],
        };
        let t = backend.install_application(&vlc, &addons).unwrap();
        assert_eq!(t.role(), TransactionRole::ChangeAddons);
        let status = tokio::time::timeout(WAIT, t.wait()).await.unwrap();
        assert_eq!(status, TransactionStatus::Done);
        assert_eq!(vlc.state(), ResourceState::Installed);
        let written = std::fs::read_to_string(&log).unwrap();
        assert_eq!(written.lines().collect::<Vec<_>>(), vec!["install codecs", "remove subtitles"]);
    }

    #[tokio::test]
    async fn test_addons_without_tool_support_are_rejected() {
        let backend = backend("true").await;
        let vlc = backend.resource("vlc").unwrap();
        let addons = AddonList {
            to_install: vec!["codecs".to_string()],
            to_remove: Vec::new(),
        };
        assert!(matches!(
            backend.install_application(&vlc, &addons),
            Err(RescenterError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_command_is_reported() {
        let backend = backend("echo 'remote not found' >&2; exit 2").await;
        let mut events = backend.subscribe();
        let vlc = backend.resource("vlc").unwrap();

        let t = backend.remove_application(&vlc).unwrap();
        let status = tokio::time::timeout(WAIT, t.wait()).await.unwrap();
        assert_eq!(status, TransactionStatus::DoneWithError);
        assert_eq!(vlc.state(), ResourceState::Installed);
        let message = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(BackendEvent::PassiveMessage(m)) = events.recv().await {
                    return m;
                }
            }
        })
        .await
        .unwrap();
        assert!(message.contains("remote not found"));
    }

    #[tokio::test]
    async fn test_cancel_stops_the_tool() {
        let backend = backend("sleep 30").await;
        let vlc = backend.resource("vlc").unwrap();
        let t = backend.update_application(&vlc).unwrap();
        let mut state = t.watch();
        tokio::time::timeout(WAIT, state.wait_for(|s| s.status == TransactionStatus::Running))
            .await
            .unwrap()
            .unwrap();
        t.cancel().unwrap();
        let status = tokio::time::timeout(WAIT, t.wait()).await.unwrap();
        assert_eq!(status, TransactionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_uninstalled_outside_is_noticed() {
        let backend = backend("true").await;
        let extra = backend.merge_remote(vec![app("krita", ResourceState::Installed)]);
        assert!(extra[0].is_installed());
        backend.reload().await;
        assert_eq!(backend.resource("krita").unwrap().state(), ResourceState::None);
    }
}
