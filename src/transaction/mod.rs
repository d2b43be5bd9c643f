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

//! Install/remove/update operations and their state machine.
//!
//! A transaction is split in two halves. [`Transaction`] is shared with the
//! model and the UI: it can be observed and asked to cancel. The
//! [`TransactionDriver`] stays with the backend that created it and is the
//! only way to move status and progress.
//!
//! Status only moves forward:
//!
//! ```text
//! Queued -> Running -> { Done | DoneWithError | Cancelled }
//! ```

pub mod model;

pub use model::{TransactionModel, TransactionModelEvent};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::error::{RescenterError, RescenterResult};
use crate::resource::{ResourceKey, ResourceLink, ResourceRef};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    fn next() -> Self {
        TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionRole {
    Install,
    Remove,
    ChangeAddons,
    Update,
}

impl fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionRole::Install => write!(f, "install"),
            TransactionRole::Remove => write!(f, "remove"),
            TransactionRole::ChangeAddons => write!(f, "change-addons"),
            TransactionRole::Update => write!(f, "update"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionStatus {
    Queued,
    Running,
    Done,
    DoneWithError,
    Cancelled,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Done | TransactionStatus::DoneWithError | TransactionStatus::Cancelled
        )
    }

    fn rank(self) -> u8 {
        match self {
            TransactionStatus::Queued => 0,
            TransactionStatus::Running => 1,
            _ => 2,
        }
    }

    /// Whether moving from `self` to `to` keeps the machine going forward
    pub fn can_move_to(self, to: TransactionStatus) -> bool {
        !self.is_terminal() && to.rank() >= self.rank()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Queued => write!(f, "queued"),
            TransactionStatus::Running => write!(f, "running"),
            TransactionStatus::Done => write!(f, "done"),
            TransactionStatus::DoneWithError => write!(f, "done-with-error"),
            TransactionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Addons to add or drop together with the main operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonList {
    pub to_install: Vec<String>,
    pub to_remove: Vec<String>,
}

impl AddonList {
    pub fn is_empty(&self) -> bool {
        self.to_install.is_empty() && self.to_remove.is_empty()
    }
}

/// Observable state of a transaction, always published as a whole
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionState {
    pub status: TransactionStatus,
    /// 0..=100
    pub progress: u8,
    pub cancellable: bool,
    pub cancel_requested: bool,
    pub visible: bool,
    /// Bytes per second
    pub download_speed: u64,
    /// Seconds
    pub remaining_time: u64,
}

impl Default for TransactionState {
    fn default() -> Self {
        Self {
            status: TransactionStatus::Queued,
            progress: 0,
            cancellable: true,
            cancel_requested: false,
            visible: true,
            download_speed: 0,
            remaining_time: 0,
        }
    }
}

/// Shared, read-mostly handle of one operation
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    name: String,
    resource: Option<ResourceLink>,
    role: TransactionRole,
    addons: AddonList,
    state: watch::Sender<TransactionState>,
    messages: broadcast::Sender<String>,
}

impl Transaction {
    /// Transaction targeting `resource`; the driver goes to the backend
    pub fn new(
        resource: &ResourceRef,
        role: TransactionRole,
        addons: AddonList,
    ) -> (Arc<Transaction>, TransactionDriver) {
        Self::build(resource.name(), Some(resource.link()), role, addons)
    }

    /// Transaction without a target resource, such as "update everything"
    pub fn detached(name: impl Into<String>, role: TransactionRole) -> (Arc<Transaction>, TransactionDriver) {
        Self::build(name.into(), None, role, AddonList::default())
    }

    fn build(
        name: String,
        resource: Option<ResourceLink>,
        role: TransactionRole,
        addons: AddonList,
    ) -> (Arc<Transaction>, TransactionDriver) {
        let (state, _) = watch::channel(TransactionState::default());
        let (messages, _) = broadcast::channel(32);
        let transaction = Arc::new(Transaction {
            id: TransactionId::next(),
            name,
            resource,
            role,
            addons,
            state,
            messages,
        });
        debug!(id = %transaction.id, name = %transaction.name, role = %role, "transaction created");
        let driver = TransactionDriver {
            transaction: Arc::clone(&transaction),
        };
        (transaction, driver)
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> TransactionRole {
        self.role
    }

    pub fn addons(&self) -> &AddonList {
        &self.addons
    }

    pub fn resource_key(&self) -> Option<&ResourceKey> {
        self.resource.as_ref().map(ResourceLink::key)
    }

    /// The target resource, if it still exists in its backend
    pub fn resource(&self) -> Option<ResourceRef> {
        self.resource.as_ref().and_then(ResourceLink::upgrade)
    }

    pub fn state(&self) -> TransactionState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> TransactionStatus {
        self.state.borrow().status
    }

    pub fn progress(&self) -> u8 {
        self.state.borrow().progress
    }

    pub fn is_cancellable(&self) -> bool {
        self.state.borrow().cancellable
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state.borrow().cancel_requested
    }

    pub fn is_visible(&self) -> bool {
        self.state.borrow().visible
    }

    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    pub fn download_speed(&self) -> u64 {
        self.state.borrow().download_speed
    }

    pub fn remaining_time(&self) -> u64 {
        self.state.borrow().remaining_time
    }

    /// Human readable status line
    pub fn status_text(&self) -> String {
        match self.status() {
            TransactionStatus::Queued => "Waiting".to_string(),
            TransactionStatus::Running => match self.role {
                TransactionRole::Install => "Installing".to_string(),
                TransactionRole::Remove => "Removing".to_string(),
                TransactionRole::ChangeAddons => "Changing Addons".to_string(),
                TransactionRole::Update => "Updating".to_string(),
            },
            TransactionStatus::Done => "Done".to_string(),
            TransactionStatus::DoneWithError => "Failed".to_string(),
            TransactionStatus::Cancelled => "Cancelled".to_string(),
        }
    }

    /// Ask the owning backend to stop. The backend moves the status to Cancelled.
    pub fn cancel(&self) -> RescenterResult<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if state.status.is_terminal() {
                result = Err(RescenterError::TransactionFinished {
                    transaction: self.name.clone(),
                });
                return false;
            }
            if !state.cancellable {
                result = Err(RescenterError::NotCancellable {
                    transaction: self.name.clone(),
                });
                return false;
            }
            if state.cancel_requested {
                return false;
            }
            state.cancel_requested = true;
            true
        });
        if result.is_ok() {
            debug!(id = %self.id, name = %self.name, "cancellation requested");
        }
        result
    }

    /// Hidden transactions are left out of aggregate progress
    pub fn set_visible(&self, visible: bool) {
        self.state.send_if_modified(|state| {
            if state.visible == visible {
                return false;
            }
            state.visible = visible;
            true
        });
    }

    /// Receiver that sees every state change
    pub fn watch(&self) -> watch::Receiver<TransactionState> {
        self.state.subscribe()
    }

    /// Passive messages emitted by the backend for this operation
    pub fn messages(&self) -> broadcast::Receiver<String> {
        self.messages.subscribe()
    }

    /// Resolves once the transaction reached a terminal status
    #[allow(clippy::let_and_return)]
    pub async fn wait(&self) -> TransactionStatus {
        let mut rx = self.state.subscribe();
        let status = match rx.wait_for(|s| s.status.is_terminal()).await {
            Ok(state) => state.status,
            Err(_) => self.status(),
        };
        status
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        write!(f, "{} {} ({}, {}%)", self.id, self.name, state.status, state.progress)
    }
}

/// Backend-side handle; the only way to change a transaction's status
#[derive(Debug)]
pub struct TransactionDriver {
    transaction: Arc<Transaction>,
}

impl TransactionDriver {
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    pub fn id(&self) -> TransactionId {
        self.transaction.id
    }

    pub fn set_status(&self, status: TransactionStatus) -> RescenterResult<()> {
        let mut result = Ok(());
        self.transaction.state.send_if_modified(|state| {
            if state.status == status {
                return false;
            }
            if !state.status.can_move_to(status) {
                result = Err(RescenterError::InvalidTransition {
                    transaction: self.transaction.name.clone(),
                    from: state.status,
                    to: status,
                });
                return false;
            }
            state.status = status;
            if status.is_terminal() {
                state.cancellable = false;
                state.download_speed = 0;
                state.remaining_time = 0;
                if status == TransactionStatus::Done {
                    state.progress = 100;
                }
            }
            true
        });
        if result.is_ok() {
            debug!(id = %self.transaction.id, name = %self.transaction.name, %status, "transaction status");
        }
        result
    }

    /// Progress is clamped to 0..=100; ignored once terminal
    pub fn set_progress(&self, progress: u8) {
        let progress = progress.min(100);
        self.transaction.state.send_if_modified(|state| {
            if state.status.is_terminal() || state.progress == progress {
                return false;
            }
            state.progress = progress;
            true
        });
    }

    pub fn set_cancellable(&self, cancellable: bool) {
        self.transaction.state.send_if_modified(|state| {
            if state.status.is_terminal() || state.cancellable == cancellable {
                return false;
            }
            state.cancellable = cancellable;
            true
        });
    }

    pub fn set_download_speed(&self, bytes_per_sec: u64) {
        self.transaction.state.send_if_modified(|state| {
            if state.download_speed == bytes_per_sec {
                return false;
            }
            state.download_speed = bytes_per_sec;
            true
        });
    }

    pub fn set_remaining_time(&self, seconds: u64) {
        self.transaction.state.send_if_modified(|state| {
            if state.remaining_time == seconds {
                return false;
            }
            state.remaining_time = seconds;
            true
        });
    }

    /// Message for the user that does not change the status
    pub fn passive_message(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(id = %self.transaction.id, %message, "passive message");
        let _ = self.transaction.messages.send(message);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.transaction.is_cancel_requested()
    }

    /// Resolves when cancellation was requested (or the transaction already ended)
    pub async fn cancelled(&self) {
        let mut rx = self.transaction.state.subscribe();
        let _ = rx
            .wait_for(|s| s.cancel_requested || s.status.is_terminal())
            .await;
    }

    /// Finish according to `outcome`, reporting the error as a passive message
    pub fn finish<T>(&self, outcome: &RescenterResult<T>) {
        let status = match outcome {
            Ok(_) => TransactionStatus::Done,
            Err(RescenterError::Interrupted) => TransactionStatus::Cancelled,
            Err(e) => {
                self.passive_message(e.to_string());
                TransactionStatus::DoneWithError
            }
        };
        if let Err(e) = self.set_status(status) {
            debug!(error = %e, "transaction already finished");
        }
    }
}

impl Drop for TransactionDriver {
    fn drop(&mut self) {
        if self.transaction.is_active() {
            warn!(
                id = %self.transaction.id,
                name = %self.transaction.name,
                "transaction driver dropped before the transaction finished"
            );
            let _ = self.set_status(TransactionStatus::DoneWithError);
        }
    }
}
