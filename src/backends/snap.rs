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

//! Snap backend on top of the `snap` command.

use async_trait::async_trait;
use std::process::{Command, Stdio};
use std::sync::Arc;

use super::cli::{CliBackend, PackageTool, PendingUpdate, SliceOptions};
use super::command;
use crate::config::BackendsConfig;
use crate::error::RescenterResult;
use crate::resource::{Resource, ResourceInfo, ResourceKey, ResourceKind, ResourceState};

pub const NAME: &str = "snap";

pub type SnapBackend = CliBackend<SnapTool>;

const ORIGIN: &str = "snapcraft";

/// Snap confinement level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confinement {
    Strict,
    Classic,
    Devmode,
}

impl From<&str> for Confinement {
    fn from(notes: &str) -> Self {
        if notes.contains("classic") {
            Confinement::Classic
        } else if notes.contains("devmode") {
            Confinement::Devmode
        } else {
            Confinement::Strict
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapTool {
    channel: String,
}

impl SnapTool {
    pub fn new(channel: impl Into<String>) -> Self {
        Self { channel: channel.into() }
    }
}

/// Check if the snapd service is running
pub fn is_running() -> bool {
    Command::new("systemctl")
        .args(["is-active", "--quiet", "snapd"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn create(config: &BackendsConfig) -> Arc<SnapBackend> {
    let backend = CliBackend::new(
        SnapTool::new(config.snap_channel.clone()),
        SliceOptions {
            size: config.slice_size,
            pause: config.slice_pause(),
        },
    );
    backend.start();
    backend
}

#[async_trait]
impl PackageTool for SnapTool {
    fn name(&self) -> &str {
        NAME
    }

    fn display_name(&self) -> String {
        format!("Snap ({})", self.channel)
    }

    fn program(&self) -> &str {
        "snap"
    }

    fn is_usable(&self) -> bool {
        command::is_available("snap") && is_running()
    }

    async fn installed(&self) -> RescenterResult<Vec<Resource>> {
        let output = command::run_checked(NAME, "snap", &["list"]).await?;
        Ok(parse_list(&output))
    }

    async fn search(&self, term: &str) -> RescenterResult<Vec<Resource>> {
        let output = command::run(NAME, "snap", &["find", term]).await?;
        // `snap find` exits non-zero when nothing matches
        if !output.success {
            return Ok(Vec::new());
        }
        Ok(parse_find(&output.stdout))
    }

    async fn updates(&self) -> RescenterResult<Vec<PendingUpdate>> {
        let output = command::run_checked(NAME, "snap", &["refresh", "--list"]).await?;
        Ok(parse_refresh_list(&output))
    }

    fn install_args(&self, resource: &Resource) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            resource.id().to_string(),
            format!("--channel={}", self.channel),
        ];
        if resource.has_category("classic") {
            args.push("--classic".to_string());
        }
        args
    }

    fn remove_args(&self, resource: &Resource) -> Vec<String> {
        vec!["remove".to_string(), resource.id().to_string()]
    }

    fn update_args(&self, resource: &Resource) -> Vec<String> {
        vec!["refresh".to_string(), resource.id().to_string()]
    }
}

fn publisher(raw: &str) -> &str {
    raw.trim_end_matches(['✓', '✪', '*'])
}

fn kind_for(notes: &str) -> ResourceKind {
    if notes.split(',').any(|n| matches!(n, "base" | "core" | "snapd" | "gadget" | "kernel")) {
        ResourceKind::Runtime
    } else {
        ResourceKind::Application
    }
}

/// Classic snaps carry a "classic" category so installs pass `--classic`
fn info_for(name: &str, notes: &str, state: ResourceState) -> ResourceInfo {
    let mut categories = Vec::new();
    if Confinement::from(notes) == Confinement::Classic {
        categories.push("classic");
    }
    ResourceInfo::new(name, ORIGIN)
        .with_state(state)
        .with_categories(categories)
}

/// `snap list`: Name Version Rev Tracking Publisher Notes
pub fn parse_list(output: &str) -> Vec<Resource> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5 {
                return None;
            }
            let notes = parts.get(5).copied().unwrap_or("-");
            let info = info_for(parts[0], notes, ResourceState::Installed)
                .with_versions(Some(parts[1]), Some(parts[1]))
                .with_summary(format!("{} by {}", parts[3], publisher(parts[4])));
            Some(Resource::new(ResourceKey::new(NAME, parts[0]), kind_for(notes), info))
        })
        .collect()
}

/// `snap find`: Name Version Publisher Notes Summary
pub fn parse_find(output: &str) -> Vec<Resource> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return None;
            }
            let notes = parts[3];
            let info = info_for(parts[0], notes, ResourceState::None)
                .with_versions(None, Some(parts[1]))
                .with_summary(parts[4..].join(" "));
            Some(Resource::new(ResourceKey::new(NAME, parts[0]), kind_for(notes), info))
        })
        .collect()
}

/// `snap refresh --list`: Name Version Rev Size Publisher Notes
pub fn parse_refresh_list(output: &str) -> Vec<PendingUpdate> {
    output
        .lines()
        .filter(|line| !line.starts_with("Name") && !line.starts_with("All snaps"))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            Some(PendingUpdate {
                id: id.to_string(),
                version: parts.next().map(str::to_string),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let output = "Name    Version   Rev    Tracking       Publisher   Notes\n\
                      core22  20240111  1122   latest/stable  canonical✓  base\n\
                      code    1.87.0    155    latest/stable  vscode✓     classic\n\
                      vlc     3.0.20    3777   latest/stable  videolan✪   -\n";
        let snaps = parse_list(output);
        assert_eq!(snaps.len(), 3);
        assert_eq!(snaps[0].kind(), ResourceKind::Runtime);
        assert!(snaps[1].has_category("classic"));
        assert_eq!(snaps[2].key(), &ResourceKey::new("snap", "vlc"));
        assert_eq!(snaps[2].state(), ResourceState::Installed);
        assert_eq!(snaps[2].info().summary, "latest/stable by videolan");
    }

    #[test]
    fn test_parse_find() {
        let output = "Name  Version  Publisher  Notes  Summary\n\
                      vlc   3.0.20   videolan✪  -      The ultimate media player\n\
                      code  1.87.0   vscode✓    classic  Code editing. Redefined.\n";
        let found = parse_find(output);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].info().summary, "The ultimate media player");
        assert_eq!(found[0].state(), ResourceState::None);
        assert_eq!(found[1].info().available_version.as_deref(), Some("1.87.0"));
    }

    #[test]
    fn test_parse_refresh_list() {
        assert!(parse_refresh_list("All snaps up to date.\n").is_empty());
        let output = "Name     Version  Rev   Size   Publisher  Notes\n\
                      firefox  124.0    4033  276MB  mozilla✓   -\n";
        assert_eq!(
            parse_refresh_list(output),
            vec![PendingUpdate {
                id: "firefox".to_string(),
                version: Some("124.0".to_string()),
            }]
        );
    }

    #[test]
    fn test_classic_install_arguments() {
        let tool = SnapTool::new("beta");
        let found = parse_find("Name Version Publisher Notes Summary\ncode 1.87.0 vscode✓ classic Editor\n");
        assert_eq!(
            tool.install_args(&found[0]),
            vec!["install", "code", "--channel=beta", "--classic"]
        );
        assert_eq!(tool.update_args(&found[0]), vec!["refresh", "code"]);
    }
}
