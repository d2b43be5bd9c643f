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

//! Catalog export.
//!
//! Lists everything every backend knows, with a hard cutoff, and writes it as
//! a JSON array of property maps.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::aggregate::AggregateOptions;
use crate::config::Config;
use crate::error::{RescenterError, RescenterResult};
use crate::filter::Filter;
use crate::model::ResourcesModel;

pub type ExportEntry = Map<String, Value>;

pub struct Exporter {
    model: ResourcesModel,
    options: AggregateOptions,
    excluded: HashSet<String>,
}

impl Exporter {
    pub fn new(model: ResourcesModel, config: &Config) -> Self {
        Self {
            model,
            options: config.aggregation.export_options(),
            excluded: config.export.excluded_properties.iter().cloned().collect(),
        }
    }

    pub fn with_options(mut self, options: AggregateOptions) -> Self {
        self.options = options;
        self
    }

    /// Property maps of every resource, sorted by backend and id
    pub async fn collect(&self) -> Vec<ExportEntry> {
        if let Some(deadline) = self.options.deadline {
            if tokio::time::timeout(deadline, self.model.wait_until_idle())
                .await
                .is_err()
            {
                warn!("backends still loading, exporting what is there");
            }
        }

        let results = self
            .model
            .search_with(&Filter::new(), self.options.clone())
            .collect_all()
            .await;
        debug!(count = results.len(), "resources found");

        let mut entries: Vec<ExportEntry> = results
            .iter()
            .filter_map(|r| match serde_json::to_value(r.resource.snapshot()) {
                Ok(Value::Object(map)) => Some(self.strip(map)),
                Ok(_) => None,
                Err(e) => {
                    warn!(resource = %r.resource.key(), error = %e, "could not serialize resource");
                    None
                }
            })
            .collect();
        entries.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        entries
    }

    fn strip(&self, mut map: ExportEntry) -> ExportEntry {
        map.retain(|k, v| !v.is_null() && !self.excluded.contains(k));
        map
    }

    pub async fn to_json(&self) -> RescenterResult<String> {
        Ok(serde_json::to_string_pretty(&self.collect().await)?)
    }

    /// Write the document to `path`; returns the number of exported resources
    pub async fn export_to(&self, path: &Path) -> RescenterResult<usize> {
        let entries = self.collect().await;
        let json = serde_json::to_string_pretty(&entries)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RescenterError::filesystem(parent.display().to_string(), "could not create directory", e))?;
        }
        tokio::fs::write(path, json)
            .await
            .map_err(|e| RescenterError::filesystem(path.display().to_string(), "could not write export", e))?;
        info!(count = entries.len(), path = %path.display(), "export written");
        Ok(entries.len())
    }
}

fn field<'a>(entry: &'a ExportEntry, name: &str) -> &'a str {
    entry.get(name).and_then(Value::as_str).unwrap_or_default()
}

fn sort_key(entry: &ExportEntry) -> (&str, &str) {
    (field(entry, "backend"), field(entry, "id"))
}
