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

//! Resource aggregation and transaction engine for software centers.
//!
//! Backends (Flatpak, Snap, an in-memory catalog) publish resources through
//! [`ResultsStream`]s; the [`ResourcesModel`] fans queries out to all of them,
//! merges the answers and tracks every running [`Transaction`].

pub mod aggregate;
pub mod backend;
pub mod backends;
pub mod config;
pub mod error;
pub mod export;
pub mod filter;
pub mod logging;
pub mod model;
pub mod resource;
pub mod stream;
pub mod transaction;
pub mod updater;
pub mod updates;

pub use aggregate::{AggregateOptions, AggregatedResultsStream, DedupPolicy};
pub use backend::{Backend, BackendEvent};
pub use config::Config;
pub use error::{ErrorContext, RescenterError, RescenterResult};
pub use filter::Filter;
pub use model::{ModelEvent, ResourcesModel};
pub use resource::{Resource, ResourceKey, ResourceRef, ResourceState, StreamResult};
pub use stream::ResultsStream;
pub use transaction::{Transaction, TransactionModel, TransactionRole, TransactionStatus};
pub use updater::{BackendUpdater, StandardBackendUpdater};
pub use updates::UpdatesOrchestrator;
