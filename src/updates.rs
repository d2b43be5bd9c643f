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

//! System-wide updates across every backend updater.
//!
//! [`UpdatesOrchestrator::update_all`] wraps the whole run in one aggregate
//! `Update` transaction. Updaters that may run in parallel start together;
//! the others run one after another once the parallel group is done.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, warn, Instrument};

use crate::error::{RescenterError, RescenterResult};
use crate::model::ResourcesModel;
use crate::resource::ResourceRef;
use crate::transaction::{Transaction, TransactionDriver, TransactionModel, TransactionRole, TransactionStatus};
use crate::updater::{BackendUpdater, UpdaterEvent};

/// Drives `prepare -> select -> update_all` over all registered backends
#[derive(Clone)]
pub struct UpdatesOrchestrator {
    model: ResourcesModel,
    current: Arc<Mutex<Option<Arc<Transaction>>>>,
}

impl std::fmt::Debug for UpdatesOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdatesOrchestrator")
            .field("progressing", &self.is_progressing())
            .finish()
    }
}

impl UpdatesOrchestrator {
    pub fn new(model: ResourcesModel) -> Self {
        Self {
            model,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Updaters of the backends registered right now
    pub fn updaters(&self) -> Vec<Arc<dyn BackendUpdater>> {
        self.model.updaters()
    }

    /// The aggregate transaction of the last run
    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_progressing(&self) -> bool {
        self.transaction().map_or(false, |t| t.is_active())
    }

    fn busy(&self) -> RescenterError {
        RescenterError::UpdaterBusy {
            backend: "all".to_string(),
        }
    }

    /// Snapshot and mark every updater's upgradeable set
    pub fn prepare(&self) -> RescenterResult<()> {
        if self.is_progressing() {
            warn!("trying to prepare a running update");
            return Err(self.busy());
        }
        for updater in self.updaters() {
            updater.prepare()?;
        }
        Ok(())
    }

    pub fn has_updates(&self) -> bool {
        self.updaters().iter().any(|u| u.has_updates())
    }

    pub fn to_update(&self) -> Vec<ResourceRef> {
        self.updaters().iter().flat_map(|u| u.to_update()).collect()
    }

    pub fn update_size(&self) -> u64 {
        self.updaters().iter().map(|u| u.update_size()).sum()
    }

    /// Most recent batch completion over all updaters
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.updaters().iter().filter_map(|u| u.last_update()).max()
    }

    pub fn needs_reboot(&self) -> bool {
        self.updaters().iter().any(|u| u.needs_reboot())
    }

    fn route(&self, resources: &[ResourceRef]) -> RescenterResult<Vec<(Arc<dyn BackendUpdater>, Vec<ResourceRef>)>> {
        let mut grouped: BTreeMap<String, Vec<ResourceRef>> = BTreeMap::new();
        for resource in resources {
            grouped
                .entry(resource.backend().to_string())
                .or_default()
                .push(Arc::clone(resource));
        }
        grouped
            .into_iter()
            .map(|(name, list)| {
                let backend = self
                    .model
                    .backend(&name)
                    .ok_or_else(|| RescenterError::UnknownBackend { backend: name.clone() })?;
                let updater = backend.updater().ok_or_else(|| RescenterError::Unsupported {
                    backend: name.clone(),
                    operation: "updates".to_string(),
                })?;
                Ok((updater, list))
            })
            .collect()
    }

    pub fn add_resources(&self, resources: &[ResourceRef]) -> RescenterResult<()> {
        for (updater, list) in self.route(resources)? {
            updater.add_resources(&list)?;
        }
        Ok(())
    }

    pub fn remove_resources(&self, resources: &[ResourceRef]) -> RescenterResult<()> {
        for (updater, list) in self.route(resources)? {
            updater.remove_resources(&list)?;
        }
        Ok(())
    }

    /// Start every updater that has updates. `None` when there is nothing to do.
    pub fn update_all(&self) -> RescenterResult<Option<Arc<Transaction>>> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_ref().map_or(false, |t| t.is_active()) {
            return Err(self.busy());
        }

        let updaters: Vec<Arc<dyn BackendUpdater>> = self
            .updaters()
            .into_iter()
            .filter(|u| u.has_updates())
            .collect();
        if updaters.is_empty() {
            debug!("nothing to update");
            return Ok(None);
        }

        let (transaction, driver) = Transaction::detached("System update", TransactionRole::Update);
        self.model.transactions().add_transaction(Arc::clone(&transaction))?;
        *current = Some(Arc::clone(&transaction));

        info!(updaters = updaters.len(), transaction = %transaction.id(), "starting system update");
        let run = UpdateRun::new(driver, updaters, self.model.transactions().clone());
        tokio::spawn(run.run().instrument(tracing::info_span!("update_all")));
        Ok(Some(transaction))
    }

    /// Cancel the running update, if any
    pub fn cancel(&self) -> RescenterResult<()> {
        match self.transaction() {
            Some(t) if t.is_active() => t.cancel(),
            _ => Ok(()),
        }
    }
}

/// State of one `update_all` run; owned by its task
struct UpdateRun {
    driver: TransactionDriver,
    updaters: Vec<Arc<dyn BackendUpdater>>,
    started: Vec<bool>,
    transactions: TransactionModel,
    cancel_sent: bool,
    failed: bool,
}

impl UpdateRun {
    fn new(driver: TransactionDriver, updaters: Vec<Arc<dyn BackendUpdater>>, transactions: TransactionModel) -> Self {
        let started = vec![false; updaters.len()];
        Self {
            driver,
            updaters,
            started,
            transactions,
            cancel_sent: false,
            failed: false,
        }
    }

    /// Parallel-capable updaters form the first phase, every other updater its own
    fn phases(&self) -> Vec<Vec<usize>> {
        let (parallel, serial): (Vec<usize>, Vec<usize>) =
            (0..self.updaters.len()).partition(|&i| self.updaters[i].runs_in_parallel());
        let mut phases = Vec::new();
        if !parallel.is_empty() {
            phases.push(parallel);
        }
        phases.extend(serial.into_iter().map(|i| vec![i]));
        phases
    }

    async fn run(mut self) {
        if self.driver.set_status(TransactionStatus::Running).is_err() {
            return;
        }
        for phase in self.phases() {
            if self.driver.is_cancel_requested() {
                break;
            }
            self.run_phase(&phase).await;
        }

        self.failed |= self.updaters.iter().any(|u| u.has_errors());
        let status = if self.driver.is_cancel_requested() {
            TransactionStatus::Cancelled
        } else if self.failed {
            TransactionStatus::DoneWithError
        } else {
            TransactionStatus::Done
        };
        info!(%status, "system update finished");
        let _ = self.driver.set_status(status);
    }

    async fn run_phase(&mut self, phase: &[usize]) {
        // Subscribe before starting so no progressing change is missed.
        let mut events = StreamMap::new();
        for (i, updater) in self.updaters.iter().enumerate() {
            events.insert(i, BroadcastStream::new(updater.subscribe()));
        }

        for &i in phase {
            let updater = &self.updaters[i];
            debug!(backend = %updater.backend_name(), "starting updater");
            if let Err(e) = updater.start(&self.transactions) {
                warn!(backend = %updater.backend_name(), error = %e, "updater did not start");
                self.driver.passive_message(e.inline_message());
                self.failed = true;
            }
            self.started[i] = true;
        }

        loop {
            self.report(phase);
            if phase.iter().all(|&i| !self.updaters[i].is_progressing()) {
                break;
            }
            tokio::select! {
                _ = self.driver.cancelled(), if !self.cancel_sent => {
                    info!("cancelling system update");
                    for updater in &self.updaters {
                        updater.cancel();
                    }
                    self.cancel_sent = true;
                }
                event = events.next() => match event {
                    Some((_, Ok(UpdaterEvent::PassiveMessage(message)))) => {
                        self.driver.passive_message(message);
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
    }

    fn report(&self, phase: &[usize]) {
        let total: f64 = self
            .updaters
            .iter()
            .zip(&self.started)
            .map(|(u, &started)| match (started, u.is_progressing()) {
                (false, _) => 0.0,
                (true, true) => u.progress(),
                (true, false) => 100.0,
            })
            .sum();
        let progress = total / self.updaters.len() as f64;
        if progress < 100.0 {
            self.driver.set_progress(progress.round() as u8);
        }
        self.driver
            .set_download_speed(self.updaters.iter().map(|u| u.download_speed()).sum());
        self.driver
            .set_cancellable(phase.iter().any(|&i| self.updaters[i].is_cancelable()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;
    use crate::config::AggregationConfig;
    use crate::resource::{ResourceKey, ResourceState};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    async fn setup(backends: Vec<Arc<MemoryBackend>>) -> (ResourcesModel, UpdatesOrchestrator) {
        let model = ResourcesModel::new(AggregationConfig::default());
        for backend in backends {
            backend.standard_updater().refresh().await.unwrap();
            model.register_backend(backend).unwrap();
        }
        let updates = UpdatesOrchestrator::new(model.clone());
        (model, updates)
    }

    async fn finish(t: &Transaction) -> TransactionStatus {
        tokio::time::timeout(WAIT, t.wait()).await.expect("update finished in time")
    }

    #[tokio::test]
    async fn test_update_all_runs_every_backend() {
        let a = MemoryBackend::builder("a")
            .app("kate", ResourceState::Upgradeable)
            .app("krita", ResourceState::Upgradeable)
            .build();
        let b = MemoryBackend::builder("b")
            .app("gimp", ResourceState::Upgradeable)
            .app("vlc", ResourceState::Installed)
            .build();
        let (model, updates) = setup(vec![a.clone(), b.clone()]).await;

        updates.prepare().unwrap();
        assert_eq!(updates.to_update().len(), 3);
        assert_eq!(updates.update_size(), 3 * 1024 * 1024);

        let t = updates.update_all().unwrap().expect("updates pending");
        assert_eq!(t.role(), TransactionRole::Update);
        assert!(t.resource_key().is_none());
        assert_eq!(finish(&t).await, TransactionStatus::Done);
        assert_eq!(t.progress(), 100);

        for (backend, id) in [(&a, "kate"), (&a, "krita"), (&b, "gimp")] {
            use crate::backend::Backend;
            assert_eq!(backend.resource(id).unwrap().state(), ResourceState::Installed);
        }
        tokio::time::timeout(WAIT, model.transactions().wait_idle()).await.unwrap();
        assert!(!updates.is_progressing());
        assert!(updates.last_update().is_some());
        assert!(!updates.needs_reboot());
    }

    #[tokio::test]
    async fn test_nothing_to_update() {
        let a = MemoryBackend::builder("a").app("kate", ResourceState::Installed).build();
        let (_model, updates) = setup(vec![a]).await;
        updates.prepare().unwrap();
        assert!(!updates.has_updates());
        assert!(updates.update_all().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_resource_gives_error_status() {
        let a = MemoryBackend::builder("a")
            .app("kate", ResourceState::Upgradeable)
            .app("krita", ResourceState::Upgradeable)
            .failing("kate")
            .build();
        let (_model, updates) = setup(vec![a]).await;
        updates.prepare().unwrap();
        let t = updates.update_all().unwrap().unwrap();
        assert_eq!(finish(&t).await, TransactionStatus::DoneWithError);
    }

    #[tokio::test]
    async fn test_running_update_rejects_new_batches() {
        let a = MemoryBackend::builder("a")
            .app("kate", ResourceState::Upgradeable)
            .step_delay(Duration::from_millis(50))
            .build();
        let (_model, updates) = setup(vec![a]).await;
        updates.prepare().unwrap();
        let t = updates.update_all().unwrap().unwrap();

        assert!(matches!(updates.prepare(), Err(RescenterError::UpdaterBusy { .. })));
        assert!(matches!(updates.update_all(), Err(RescenterError::UpdaterBusy { .. })));
        assert_eq!(finish(&t).await, TransactionStatus::Done);
    }

    #[tokio::test]
    async fn test_cancel_reaches_updaters() {
        let a = MemoryBackend::builder("a")
            .app("kate", ResourceState::Upgradeable)
            .steps(20)
            .step_delay(Duration::from_millis(50))
            .build();
        let (_model, updates) = setup(vec![a]).await;
        updates.prepare().unwrap();
        let t = updates.update_all().unwrap().unwrap();

        updates.cancel().unwrap();
        assert_eq!(finish(&t).await, TransactionStatus::Cancelled);
        assert!(updates.cancel().is_ok());
    }

    #[tokio::test]
    async fn test_serial_updaters_run_one_after_another() {
        let a = MemoryBackend::builder("a")
            .app("kate", ResourceState::Upgradeable)
            .serial_updates()
            .build();
        let b = MemoryBackend::builder("b")
            .app("gimp", ResourceState::Upgradeable)
            .serial_updates()
            .build();
        let (ua, ub) = (a.standard_updater(), b.standard_updater());
        let (_model, updates) = setup(vec![a, b]).await;
        updates.prepare().unwrap();
        let t = updates.update_all().unwrap().unwrap();

        while t.is_active() {
            assert!(!(ua.is_progressing() && ub.is_progressing()));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(t.status(), TransactionStatus::Done);
    }

    #[tokio::test]
    async fn test_selection_is_routed_per_backend() {
        let a = MemoryBackend::builder("a")
            .app("kate", ResourceState::Upgradeable)
            .app("krita", ResourceState::Upgradeable)
            .build();
        let (model, updates) = setup(vec![a]).await;
        updates.prepare().unwrap();

        let kate = model.resolve(&ResourceKey::new("a", "kate")).unwrap();
        updates.remove_resources(&[Arc::clone(&kate)]).unwrap();
        let names: Vec<String> = updates.to_update().iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["krita"]);

        updates.add_resources(&[kate]).unwrap();
        assert_eq!(updates.to_update().len(), 2);

        let stray = MemoryBackend::builder("stray").app("vlc", ResourceState::Upgradeable).build();
        let vlc = {
            use crate::backend::Backend;
            stray.resource("vlc").unwrap()
        };
        assert!(matches!(
            updates.add_resources(&[vlc]),
            Err(RescenterError::UnknownBackend { .. })
        ));
    }
}
