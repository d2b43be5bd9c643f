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

//! Flatpak backend on top of the `flatpak` command.

use async_trait::async_trait;
use std::sync::Arc;

use super::cli::{CliBackend, PackageTool, PendingUpdate, SliceOptions};
use super::command;
use crate::config::BackendsConfig;
use crate::error::RescenterResult;
use crate::resource::{Resource, ResourceInfo, ResourceKey, ResourceKind, ResourceState};
use crate::transaction::AddonList;

pub const NAME: &str = "flatpak";

pub type FlatpakBackend = CliBackend<FlatpakTool>;

const LIST_COLUMNS: &str = "--columns=name,application,version,branch,arch,origin,installation,size";
const SEARCH_COLUMNS: &str = "--columns=name,application,version,branch,remotes,description";

/// Talks to one Flatpak installation
#[derive(Debug, Clone)]
pub struct FlatpakTool {
    /// Use the per-user installation
    user: bool,
}

impl FlatpakTool {
    pub fn new(user: bool) -> Self {
        Self { user }
    }

    fn installation_flag(&self) -> &'static str {
        if self.user {
            "--user"
        } else {
            "--system"
        }
    }

    fn args(&self, verb: &str, id: &str) -> Vec<String> {
        self.args_for(verb, std::slice::from_ref(&id.to_string()))
    }

    fn args_for(&self, verb: &str, refs: &[String]) -> Vec<String> {
        let mut args = vec![
            verb.to_string(),
            "-y".to_string(),
            "--noninteractive".to_string(),
            self.installation_flag().to_string(),
        ];
        args.extend(refs.iter().cloned());
        args
    }
}

/// Backend for the configured installation, loading in the background
pub fn create(config: &BackendsConfig) -> Arc<FlatpakBackend> {
    let backend = CliBackend::new(
        FlatpakTool::new(config.flatpak_user),
        SliceOptions {
            size: config.slice_size,
            pause: config.slice_pause(),
        },
    );
    backend.start();
    backend
}

#[async_trait]
impl PackageTool for FlatpakTool {
    fn name(&self) -> &str {
        NAME
    }

    fn display_name(&self) -> String {
        if self.user {
            "Flatpak (user)".to_string()
        } else {
            "Flatpak".to_string()
        }
    }

    fn program(&self) -> &str {
        "flatpak"
    }

    async fn installed(&self) -> RescenterResult<Vec<Resource>> {
        let flag = self.installation_flag();
        let apps = command::run_checked(NAME, "flatpak", &["list", "--app", LIST_COLUMNS, flag]).await?;
        let runtimes = command::run_checked(NAME, "flatpak", &["list", "--runtime", LIST_COLUMNS, flag]).await?;
        let mut found = parse_list(&apps, ResourceKind::Application);
        found.extend(parse_list(&runtimes, ResourceKind::Runtime));
        Ok(found)
    }

    async fn search(&self, term: &str) -> RescenterResult<Vec<Resource>> {
        let output = command::run(NAME, "flatpak", &["search", SEARCH_COLUMNS, term]).await?;
        // A search without matches exits non-zero
        if !output.success {
            return Ok(Vec::new());
        }
        Ok(parse_search(&output.stdout))
    }

    async fn updates(&self) -> RescenterResult<Vec<PendingUpdate>> {
        let output = command::run_checked(
            NAME,
            "flatpak",
            &["remote-ls", "--updates", "--columns=ref,version", self.installation_flag()],
        )
        .await?;
        Ok(parse_updates(&output))
    }

    fn install_args(&self, resource: &Resource) -> Vec<String> {
        let mut args = self.args("install", resource.id());
        let origin = resource.origin();
        if !origin.is_empty() {
            args.insert(args.len() - 1, origin);
        }
        args
    }

    fn remove_args(&self, resource: &Resource) -> Vec<String> {
        self.args("uninstall", resource.id())
    }

    fn update_args(&self, resource: &Resource) -> Vec<String> {
        self.args("update", resource.id())
    }

    /// Extensions are installed from the application's remote
    fn addon_args(&self, resource: &Resource, addons: &AddonList) -> Vec<Vec<String>> {
        let mut commands = Vec::new();
        if !addons.to_install.is_empty() {
            let mut args = self.args_for("install", &addons.to_install);
            let origin = resource.origin();
            if !origin.is_empty() {
                args.insert(4, origin);
            }
            commands.push(args);
        }
        if !addons.to_remove.is_empty() {
            commands.push(self.args_for("uninstall", &addons.to_remove));
        }
        commands
    }
}

fn columns(line: &str) -> Vec<&str> {
    line.split('\t').map(str::trim).collect()
}

fn is_header(parts: &[&str]) -> bool {
    parts.get(1).map_or(false, |c| c.eq_ignore_ascii_case("application id"))
}

/// Applications are keyed by id; runtimes by `id//branch` since several
/// branches of one runtime are usually installed side by side. Flatpak
/// accepts that partial ref form wherever it takes an id.
fn resource_id(kind: ResourceKind, id: &str, branch: &str) -> String {
    match kind {
        ResourceKind::Runtime if !branch.is_empty() => format!("{id}//{branch}"),
        _ => id.to_string(),
    }
}

fn non_empty(value: Option<&&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(|v| v.to_string())
}

/// `flatpak list` output; every listed ref is installed
pub fn parse_list(output: &str, kind: ResourceKind) -> Vec<Resource> {
    output
        .lines()
        .map(columns)
        .filter(|parts| parts.len() >= 6 && !is_header(parts))
        .map(|parts| {
            let id = parts[1];
            let branch = parts.get(3).copied().unwrap_or("stable");
            let version = non_empty(parts.get(2));
            let origin = parts.get(5).copied().unwrap_or("flathub");
            let info = ResourceInfo::new(parts[0], origin)
                .with_state(ResourceState::Installed)
                .with_versions(version.as_deref(), version.as_deref())
                .with_size(parts.get(7).and_then(|s| parse_size(s)).unwrap_or(0))
                .with_download_key(format!("{id}/{branch}"));
            let resource = Resource::new(ResourceKey::new(NAME, resource_id(kind, id, branch)), kind, info);
            if kind == ResourceKind::Application {
                resource.with_appstream_id(id)
            } else {
                resource
            }
        })
        .collect()
}

/// `flatpak search` output
pub fn parse_search(output: &str) -> Vec<Resource> {
    output
        .lines()
        .map(columns)
        .filter(|parts| parts.len() >= 4 && !is_header(parts))
        .map(|parts| {
            let id = parts[1];
            let origin = parts
                .get(4)
                .and_then(|remotes| remotes.split(',').next())
                .filter(|r| !r.is_empty())
                .unwrap_or("flathub");
            let mut info = ResourceInfo::new(parts[0], origin)
                .with_state(ResourceState::None)
                .with_versions(None, non_empty(parts.get(2)).as_deref());
            if let Some(summary) = non_empty(parts.get(5)) {
                info = info.with_summary(summary);
            }
            Resource::new(ResourceKey::new(NAME, id), ResourceKind::Application, info).with_appstream_id(id)
        })
        .collect()
}

/// `flatpak remote-ls --updates` output, one `ref<TAB>version` per line
pub fn parse_updates(output: &str) -> Vec<PendingUpdate> {
    output
        .lines()
        .map(columns)
        .filter_map(|parts| {
            // app/<id>/<arch>/<branch> or runtime/<id>/<arch>/<branch>
            let fields: Vec<&str> = parts[0].split('/').collect();
            let kind = match fields.first().copied() {
                Some("app") => ResourceKind::Application,
                Some("runtime") => ResourceKind::Runtime,
                _ => return None,
            };
            let id = fields.get(1).filter(|id| !id.is_empty())?;
            let branch = fields.get(3).copied().unwrap_or_default();
            Some(PendingUpdate {
                id: resource_id(kind, id, branch),
                version: non_empty(parts.get(1)),
            })
        })
        .collect()
}

/// Parse size string like "1.2 GB" to bytes
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().replace('\u{a0}', " ");
    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.len() != 2 {
        return None;
    }

    let value: f64 = parts[0].parse().ok()?;
    let multiplier: u64 = match parts[1].to_uppercase().as_str() {
        "B" | "BYTES" => 1,
        "KB" => 1000,
        "MB" => 1000 * 1000,
        "GB" => 1000 * 1000 * 1000,
        "TB" => 1000_u64 * 1000 * 1000 * 1000,
        "KIB" => 1024,
        "MIB" => 1024 * 1024,
        "GIB" => 1024 * 1024 * 1024,
        "TIB" => 1024_u64 * 1024 * 1024 * 1024,
        _ => return None,
    };

    Some((value * multiplier as f64).round() as u64)
}
