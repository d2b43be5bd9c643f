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

//! Concrete backends and the factory that picks them from configuration.

pub mod cli;
pub mod command;
pub mod flatpak;
pub mod memory;
pub mod snap;

use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::config::BackendsConfig;
use crate::error::{RescenterError, RescenterResult};

/// What the host offers for one known backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub name: &'static str,
    pub program: Option<&'static str>,
    pub available: bool,
    pub enabled: bool,
}

fn program_for(name: &str) -> Option<&'static str> {
    match name {
        flatpak::NAME => Some("flatpak"),
        snap::NAME => Some("snap"),
        _ => None,
    }
}

fn is_host_available(name: &str) -> bool {
    match name {
        snap::NAME => command::is_available("snap") && snap::is_running(),
        other => program_for(other).map_or(true, command::is_available),
    }
}

/// Build one backend by name
pub fn by_name(name: &str, config: &BackendsConfig) -> RescenterResult<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match name {
        memory::NAME => memory::MemoryBackend::demo(),
        flatpak::NAME => flatpak::create(config),
        snap::NAME => snap::create(config),
        other => {
            return Err(RescenterError::UnknownBackend {
                backend: other.to_string(),
            })
        }
    };
    Ok(backend)
}

/// Enabled backends whose tools are present on this host
pub fn available(config: &BackendsConfig) -> Vec<Arc<dyn Backend>> {
    let mut backends = Vec::new();
    for name in &config.enabled {
        if !is_host_available(name) {
            debug!(backend = %name, "tool not found, skipping");
            continue;
        }
        match by_name(name, config) {
            Ok(backend) => {
                info!(backend = %name, "backend loaded");
                backends.push(backend);
            }
            Err(e) => debug!(backend = %name, error = %e, "backend skipped"),
        }
    }
    backends
}

/// Every known backend with its host availability
pub fn detect(config: &BackendsConfig) -> Vec<Detection> {
    [memory::NAME, flatpak::NAME, snap::NAME]
        .into_iter()
        .map(|name| Detection {
            name,
            program: program_for(name),
            available: is_host_available(name),
            enabled: config.enabled.iter().any(|e| e == name),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_by_name() {
        let config = BackendsConfig::default();
        let backend = by_name("memory", &config).unwrap();
        assert_eq!(backend.name(), "memory");
        assert!(matches!(
            by_name("apt", &config),
            Err(RescenterError::UnknownBackend { .. })
        ));
    }

    #[tokio::test]
    async fn test_available_keeps_memory() {
        let config = BackendsConfig {
            enabled: vec!["memory".to_string()],
            ..Default::default()
        };
        let backends = available(&config);
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].name(), "memory");
    }

    #[test]
    fn test_detect_lists_known_backends() {
        let config = BackendsConfig {
            enabled: vec!["flatpak".to_string()],
            ..Default::default()
        };
        let found = detect(&config);
        let names: Vec<&str> = found.iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["memory", "flatpak", "snap"]);
        assert!(found[0].available);
        assert!(!found[0].enabled);
        assert!(found[1].enabled);
        assert_eq!(found[2].program, Some("snap"));
    }
}
