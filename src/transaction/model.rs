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

//! Registry of running transactions.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use super::{Transaction, TransactionId, TransactionStatus};
use crate::error::{RescenterError, RescenterResult};
use crate::resource::ResourceKey;

#[derive(Debug, Clone, PartialEq)]
pub enum TransactionModelEvent {
    /// The registry went from empty to one transaction
    StartingFirstTransaction,
    Added(TransactionId),
    Changed {
        id: TransactionId,
        status: TransactionStatus,
        progress: u8,
    },
    Removed(TransactionId),
    /// The registry became empty again
    LastTransactionFinished,
}

struct Inner {
    transactions: Mutex<Vec<Arc<Transaction>>>,
    events: broadcast::Sender<TransactionModelEvent>,
    count: watch::Sender<usize>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Transaction>>> {
        self.transactions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TransactionModelEvent) {
        let _ = self.events.send(event);
    }

    fn remove(&self, id: TransactionId) {
        let mut list = self.lock();
        let Some(pos) = list.iter().position(|t| t.id() == id) else {
            return;
        };
        let t = list.remove(pos);
        let remaining = list.len();
        self.count.send_replace(remaining);
        drop(list);

        debug!(id = %id, name = %t.name(), status = %t.status(), "transaction removed");
        self.emit(TransactionModelEvent::Removed(id));
        if remaining == 0 {
            info!("last transaction finished");
            self.emit(TransactionModelEvent::LastTransactionFinished);
        }
    }
}

/// Insertion-ordered set of active transactions, at most one per resource.
///
/// Finished transactions leave the registry on their own. The registry never
/// touches resource state; the owning backend refreshes it.
#[derive(Clone)]
pub struct TransactionModel {
    inner: Arc<Inner>,
}

impl Default for TransactionModel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionModel")
            .field("count", &self.count())
            .finish()
    }
}

impl TransactionModel {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                transactions: Mutex::new(Vec::new()),
                events,
                count,
            }),
        }
    }

    /// Register a transaction. Adding the same transaction twice is a no-op.
    pub fn add_transaction(&self, transaction: Arc<Transaction>) -> RescenterResult<()> {
        let mut list = self.inner.lock();
        self.insert_locked(&mut list, transaction)
    }

    /// Run `start` and register the transaction it returns, holding the
    /// registry lock for the whole operation so no other start for the same
    /// resource can slip in between. `start` must not block or call back
    /// into this model.
    pub fn start_with<F>(&self, key: Option<&ResourceKey>, start: F) -> RescenterResult<Arc<Transaction>>
    where
        F: FnOnce() -> RescenterResult<Arc<Transaction>>,
    {
        let mut list = self.inner.lock();
        if let Some(key) = key {
            if Self::active_for(list.as_slice(), key).is_some() {
                return Err(RescenterError::TransactionInProgress {
                    resource: key.to_string(),
                });
            }
        }
        let transaction = start()?;
        self.insert_locked(&mut list, Arc::clone(&transaction))?;
        Ok(transaction)
    }

    fn active_for<'a>(list: &'a [Arc<Transaction>], key: &ResourceKey) -> Option<&'a Arc<Transaction>> {
        list.iter()
            .find(|t| t.is_active() && t.resource_key() == Some(key))
    }

    fn insert_locked(
        &self,
        list: &mut MutexGuard<'_, Vec<Arc<Transaction>>>,
        transaction: Arc<Transaction>,
    ) -> RescenterResult<()> {
        if list.iter().any(|t| t.id() == transaction.id()) {
            return Ok(());
        }
        if !transaction.is_active() {
            debug!(id = %transaction.id(), "not adding a finished transaction");
            return Ok(());
        }
        if let Some(key) = transaction.resource_key() {
            if Self::active_for(list.as_slice(), key).is_some() {
                return Err(RescenterError::TransactionInProgress {
                    resource: key.to_string(),
                });
            }
        }

        let was_empty = list.is_empty();
        list.push(Arc::clone(&transaction));
        self.inner.count.send_replace(list.len());

        if was_empty {
            self.inner.emit(TransactionModelEvent::StartingFirstTransaction);
        }
        self.inner.emit(TransactionModelEvent::Added(transaction.id()));
        debug!(id = %transaction.id(), name = %transaction.name(), role = %transaction.role(), "transaction added");

        Self::watch_transaction(Arc::downgrade(&self.inner), &transaction);
        Ok(())
    }

    fn watch_transaction(inner: Weak<Inner>, transaction: &Arc<Transaction>) {
        let id = transaction.id();
        let mut rx = transaction.watch();
        tokio::spawn(async move {
            let mut state = rx.borrow_and_update().clone();
            loop {
                if state.status.is_terminal() {
                    if let Some(inner) = inner.upgrade() {
                        inner.remove(id);
                    }
                    return;
                }
                if rx.changed().await.is_err() {
                    if let Some(inner) = inner.upgrade() {
                        inner.remove(id);
                    }
                    return;
                }
                state = rx.borrow_and_update().clone();
                match inner.upgrade() {
                    Some(inner) => inner.emit(TransactionModelEvent::Changed {
                        id,
                        status: state.status,
                        progress: state.progress,
                    }),
                    None => return,
                }
            }
        });
    }

    /// Request cancellation of a registered transaction
    pub fn cancel(&self, id: TransactionId) -> RescenterResult<()> {
        match self.get(id) {
            Some(t) => t.cancel(),
            None => Err(RescenterError::TransactionFinished {
                transaction: id.to_string(),
            }),
        }
    }

    pub fn get(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.inner.lock().iter().find(|t| t.id() == id).cloned()
    }

    /// Active transaction for `key`, if any
    pub fn transaction_for(&self, key: &ResourceKey) -> Option<Arc<Transaction>> {
        Self::active_for(self.inner.lock().as_slice(), key).cloned()
    }

    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        self.inner.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Mean progress over visible transactions
    pub fn progress(&self) -> u8 {
        let list = self.inner.lock();
        let visible: Vec<u32> = list
            .iter()
            .filter(|t| t.is_visible())
            .map(|t| u32::from(t.progress()))
            .collect();
        if visible.is_empty() {
            return 0;
        }
        (visible.iter().sum::<u32>() / visible.len() as u32) as u8
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionModelEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.inner.count.subscribe()
    }

    /// Resolves once no transaction is registered
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.count.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Resource, ResourceInfo, ResourceKind, ResourceRef};
    use crate::transaction::{AddonList, TransactionRole};
    use std::time::Duration;

    fn res(id: &str) -> ResourceRef {
        Arc::new(Resource::new(
            ResourceKey::new("memory", id),
            ResourceKind::Application,
            ResourceInfo::new(id, "local"),
        ))
    }

    async fn next_event(rx: &mut broadcast::Receiver<TransactionModelEvent>) -> TransactionModelEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_one_active_transaction_per_resource() {
        let model = TransactionModel::new();
        let kate = res("kate");
        let (first, d1) = Transaction::new(&kate, TransactionRole::Install, AddonList::default());
        let (second, _d2) = Transaction::new(&kate, TransactionRole::Remove, AddonList::default());

        model.add_transaction(first.clone()).unwrap();
        model.add_transaction(first.clone()).unwrap();
        assert_eq!(model.count(), 1);

        let err = model.add_transaction(second.clone()).unwrap_err();
        assert!(err.is_policy_violation());
        assert_eq!(model.count(), 1);
        assert_eq!(model.transaction_for(kate.key()).map(|t| t.id()), Some(first.id()));

        d1.set_status(TransactionStatus::Done).unwrap();
        tokio::time::timeout(Duration::from_secs(5), model.wait_idle()).await.unwrap();
        model.add_transaction(second).unwrap();
        assert_eq!(model.count(), 1);
    }

    #[tokio::test]
    async fn test_event_sequence() {
        let model = TransactionModel::new();
        let mut events = model.subscribe();
        let kate = res("kate");
        let (t, driver) = Transaction::new(&kate, TransactionRole::Install, AddonList::default());
        model.add_transaction(t.clone()).unwrap();

        assert_eq!(next_event(&mut events).await, TransactionModelEvent::StartingFirstTransaction);
        assert_eq!(next_event(&mut events).await, TransactionModelEvent::Added(t.id()));

        driver.set_status(TransactionStatus::Running).unwrap();
        driver.set_status(TransactionStatus::Done).unwrap();

        let mut saw_removed = false;
        loop {
            match next_event(&mut events).await {
                TransactionModelEvent::Changed { .. } => {}
                TransactionModelEvent::Removed(id) => {
                    assert_eq!(id, t.id());
                    saw_removed = true;
                }
                TransactionModelEvent::LastTransactionFinished => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_removed);
        assert!(model.is_empty());
        // The model does not touch the resource
        assert_eq!(kate.state(), crate::resource::ResourceState::None);
    }

    #[tokio::test]
    async fn test_start_with_rejects_before_calling_backend() {
        let model = TransactionModel::new();
        let kate = res("kate");
        let mut driver = None;
        let first = model
            .start_with(Some(kate.key()), || {
                let (t, d) = Transaction::new(&kate, TransactionRole::Install, AddonList::default());
                driver = Some(d);
                Ok(t)
            })
            .unwrap();
        assert!(first.is_active());

        let mut called = false;
        let err = model
            .start_with(Some(kate.key()), || {
                called = true;
                Err(RescenterError::Interrupted)
            })
            .unwrap_err();
        assert!(matches!(err, RescenterError::TransactionInProgress { .. }));
        assert!(!called);
        assert!(driver.is_some());
    }

    #[tokio::test]
    async fn test_cancel_through_model() {
        let model = TransactionModel::new();
        let kate = res("kate");
        let (t, driver) = Transaction::new(&kate, TransactionRole::Install, AddonList::default());
        model.add_transaction(t.clone()).unwrap();

        driver.set_cancellable(false);
        assert!(matches!(model.cancel(t.id()), Err(RescenterError::NotCancellable { .. })));
        assert!(t.is_active());

        driver.set_cancellable(true);
        model.cancel(t.id()).unwrap();
        assert!(driver.is_cancel_requested());
        driver.set_status(TransactionStatus::Cancelled).unwrap();
        tokio::time::timeout(Duration::from_secs(5), model.wait_idle()).await.unwrap();
        assert!(matches!(model.cancel(t.id()), Err(RescenterError::TransactionFinished { .. })));
    }

    #[tokio::test]
    async fn test_progress_over_visible() {
        let model = TransactionModel::new();
        let (a, da) = Transaction::new(&res("a"), TransactionRole::Install, AddonList::default());
        let (b, db) = Transaction::new(&res("b"), TransactionRole::Install, AddonList::default());
        let (c, dc) = Transaction::new(&res("c"), TransactionRole::Install, AddonList::default());
        for t in [&a, &b, &c] {
            model.add_transaction(Arc::clone(t)).unwrap();
        }
        da.set_progress(20);
        db.set_progress(60);
        dc.set_progress(90);
        c.set_visible(false);
        assert_eq!(model.progress(), 40);
    }

    #[tokio::test]
    async fn test_dropped_driver_leaves_registry() {
        let model = TransactionModel::new();
        let (t, driver) = Transaction::new(&res("a"), TransactionRole::Install, AddonList::default());
        model.add_transaction(t.clone()).unwrap();
        drop(driver);
        tokio::time::timeout(Duration::from_secs(5), model.wait_idle()).await.unwrap();
        assert_eq!(t.status(), TransactionStatus::DoneWithError);
    }
}
