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

//! Configuration management with validation and defaults.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregate::{AggregateOptions, DedupPolicy};
use crate::error::{RescenterError, RescenterResult};

/// Backend names the factory knows about
pub const KNOWN_BACKENDS: &[&str] = &["memory", "flatpak", "snap"];

/// Main configuration structure for rescenter
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enable colored output
    pub color: bool,

    /// How backend streams are merged
    pub aggregation: AggregationConfig,

    /// Backend selection and tuning
    pub backends: BackendsConfig,

    /// Exporter settings
    pub export: ExportConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            color: true,
            aggregation: AggregationConfig::default(),
            backends: BackendsConfig::default(),
            export: ExportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Aggregation configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Cutoff for interactive searches in seconds (0 = wait for every backend)
    pub search_timeout_secs: u64,

    /// Cutoff for exports in seconds
    pub export_timeout_secs: u64,

    /// Delay before the first merged emission in milliseconds
    pub emission_interval_ms: u64,

    /// Added to the emission delay after every emission
    pub emission_backoff_ms: u64,

    /// Streams slower than this are logged
    pub slow_stream_warning_secs: u64,

    /// identity, appstream-id or disabled
    pub dedup: DedupPolicy,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            search_timeout_secs: 0,
            export_timeout_secs: 15,
            emission_interval_ms: 0,
            emission_backoff_ms: 100,
            slow_stream_warning_secs: 5,
            dedup: DedupPolicy::Identity,
        }
    }
}

impl AggregationConfig {
    fn base_options(&self) -> AggregateOptions {
        AggregateOptions {
            deadline: None,
            dedup: self.dedup,
            emission_interval: Duration::from_millis(self.emission_interval_ms),
            emission_backoff: Duration::from_millis(self.emission_backoff_ms),
            slow_stream_warning: Duration::from_secs(self.slow_stream_warning_secs),
        }
    }

    /// Options for interactive searches
    pub fn search_options(&self) -> AggregateOptions {
        let deadline = (self.search_timeout_secs > 0).then(|| Duration::from_secs(self.search_timeout_secs));
        self.base_options().with_deadline(deadline)
    }

    /// Options for bulk exports; always bounded
    pub fn export_options(&self) -> AggregateOptions {
        self.base_options()
            .with_deadline(Some(Duration::from_secs(self.export_timeout_secs.max(1))))
    }

    fn merge(mut self, other: AggregationConfig) -> Self {
        let default = AggregationConfig::default();

        if other.search_timeout_secs != default.search_timeout_secs {
            self.search_timeout_secs = other.search_timeout_secs;
        }
        if other.export_timeout_secs != default.export_timeout_secs {
            self.export_timeout_secs = other.export_timeout_secs;
        }
        if other.emission_interval_ms != default.emission_interval_ms {
            self.emission_interval_ms = other.emission_interval_ms;
        }
        if other.emission_backoff_ms != default.emission_backoff_ms {
            self.emission_backoff_ms = other.emission_backoff_ms;
        }
        if other.slow_stream_warning_secs != default.slow_stream_warning_secs {
            self.slow_stream_warning_secs = other.slow_stream_warning_secs;
        }
        if other.dedup != default.dedup {
            self.dedup = other.dedup;
        }

        self
    }
}

/// Backend configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// Backends to load when their tools are installed
    pub enabled: Vec<String>,

    /// Use the per-user Flatpak installation instead of the system one
    pub flatpak_user: bool,

    /// Snap channel used for installs
    pub snap_channel: String,

    /// Results per batch when a backend lists many resources
    pub slice_size: usize,

    /// Pause between batches in milliseconds
    pub slice_pause_ms: u64,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["flatpak".to_string(), "snap".to_string()],
            flatpak_user: false,
            snap_channel: "stable".to_string(),
            slice_size: 100,
            slice_pause_ms: 10,
        }
    }
}

impl BackendsConfig {
    pub fn slice_pause(&self) -> Duration {
        Duration::from_millis(self.slice_pause_ms)
    }

    fn merge(mut self, other: BackendsConfig) -> Self {
        let default = BackendsConfig::default();

        if other.enabled != default.enabled {
            self.enabled = other.enabled;
        }
        if other.flatpak_user != default.flatpak_user {
            self.flatpak_user = other.flatpak_user;
        }
        if other.snap_channel != default.snap_channel {
            self.snap_channel = other.snap_channel;
        }
        if other.slice_size != default.slice_size {
            self.slice_size = other.slice_size;
        }
        if other.slice_pause_ms != default.slice_pause_ms {
            self.slice_pause_ms = other.slice_pause_ms;
        }

        self
    }
}

/// Export configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Property names left out of exported documents
    pub excluded_properties: Vec<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            excluded_properties: vec!["icon".to_string(), "download_key".to_string()],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (empty = no file logging)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}

fn parse_bool(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. /etc/rescenter/rescenter.toml (system-wide)
    /// 2. ~/.config/rescenter/config.toml (user)
    /// 3. Environment variables (RESCENTER_*)
    pub fn load() -> Self {
        let mut config = Config::default();

        let system_config = Path::new("/etc/rescenter/rescenter.toml");
        if let Ok(parsed) = Self::from_file(system_config) {
            config = config.merge(parsed);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("rescenter").join("config.toml");
            if let Ok(parsed) = Self::from_file(&user_config) {
                config = config.merge(parsed);
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Like [`Config::load`], then layer an explicit file on top; that file must exist and parse
    pub fn load_with(explicit: Option<&Path>) -> RescenterResult<Self> {
        let mut config = Self::load();
        if let Some(path) = explicit {
            config = config.merge(Self::from_file(path)?);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> RescenterResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| RescenterError::filesystem(path.display().to_string(), "cannot read config", e))?;
        Self::from_toml_str(&content).map_err(|e| RescenterError::ConfigError {
            message: format!("{}: {}", path.display(), e),
        })
    }

    pub fn from_toml_str(content: &str) -> RescenterResult<Self> {
        toml::from_str::<Config>(content).map_err(|e| RescenterError::ConfigError {
            message: e.to_string(),
        })
    }

    /// Merge another config into this one (other takes precedence for non-default values)
    fn merge(mut self, other: Config) -> Self {
        let default = Config::default();

        if other.color != default.color {
            self.color = other.color;
        }

        self.aggregation = self.aggregation.merge(other.aggregation);
        self.backends = self.backends.merge(other.backends);
        if other.export != default.export {
            self.export = other.export;
        }
        if other.logging.level != default.logging.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.file.is_some() {
            self.logging.file = other.logging.file;
        }

        self
    }

    /// Apply RESCENTER_* overrides; `lookup` reads a variable
    fn apply_overrides<F: Fn(&str) -> Option<String>>(mut self, lookup: F) -> Self {
        if let Some(n) = lookup("RESCENTER_SEARCH_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.aggregation.search_timeout_secs = n;
        }

        if let Some(n) = lookup("RESCENTER_EXPORT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.aggregation.export_timeout_secs = n;
        }

        if let Some(val) = lookup("RESCENTER_DEDUP") {
            match val.to_lowercase().as_str() {
                "identity" => self.aggregation.dedup = DedupPolicy::Identity,
                "appstream-id" | "appstream" => self.aggregation.dedup = DedupPolicy::AppstreamId,
                "disabled" | "none" => self.aggregation.dedup = DedupPolicy::Disabled,
                _ => {}
            }
        }

        if let Some(val) = lookup("RESCENTER_BACKENDS") {
            self.backends.enabled = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(val) = lookup("RESCENTER_FLATPAK_USER") {
            self.backends.flatpak_user = parse_bool(&val);
        }

        if let Some(val) = lookup("RESCENTER_COLOR") {
            self.color = parse_bool(&val);
        }

        if let Some(val) = lookup("RESCENTER_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> RescenterResult<()> {
        let fail = |message: &str| {
            Err(RescenterError::ConfigError {
                message: message.to_string(),
            })
        };

        if self.aggregation.export_timeout_secs == 0 {
            return fail("export_timeout_secs must be at least 1");
        }
        if self.aggregation.emission_backoff_ms > 10_000 {
            return fail("emission_backoff_ms must be at most 10000");
        }
        if self.backends.slice_size == 0 {
            return fail("slice_size must be at least 1");
        }
        if let Some(unknown) = self
            .backends
            .enabled
            .iter()
            .find(|name| !KNOWN_BACKENDS.contains(&name.as_str()))
        {
            return Err(RescenterError::UnknownBackend {
                backend: unknown.clone(),
            });
        }
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.to_lowercase().as_str()) {
            return fail("log level must be one of trace, debug, info, warn, error");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.aggregation.export_timeout_secs, 15);
        assert_eq!(config.aggregation.dedup, DedupPolicy::Identity);
        assert!(config.aggregation.search_options().deadline.is_none());
        assert_eq!(config.aggregation.export_options().deadline, Some(Duration::from_secs(15)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.backends.slice_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.backends.enabled.push("apt".to_string());
        assert!(matches!(config.validate(), Err(RescenterError::UnknownBackend { .. })));

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_sections_merge_over_defaults() {
        let parsed = Config::from_toml_str(
            r#"
            [aggregation]
            search_timeout_secs = 3
            dedup = "appstream-id"

            [backends]
            enabled = ["memory"]
            "#,
        )
        .unwrap();
        let config = Config::default().merge(parsed);
        assert_eq!(config.aggregation.search_options().deadline, Some(Duration::from_secs(3)));
        assert_eq!(config.aggregation.dedup, DedupPolicy::AppstreamId);
        assert_eq!(config.aggregation.export_timeout_secs, 15);
        assert_eq!(config.backends.enabled, vec!["memory"]);
        assert_eq!(config.backends.snap_channel, "stable");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RESCENTER_EXPORT_TIMEOUT", "30"),
            ("RESCENTER_DEDUP", "disabled"),
            ("RESCENTER_BACKENDS", "memory, snap"),
            ("RESCENTER_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let config = Config::default().apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.aggregation.export_timeout_secs, 30);
        assert_eq!(config.aggregation.dedup, DedupPolicy::Disabled);
        assert_eq!(config.backends.enabled, vec!["memory", "snap"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_explicit_file_must_parse() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[export]\nexcluded_properties = [\"size\"]").unwrap();
        let parsed = Config::from_file(file.path()).unwrap();
        assert_eq!(parsed.export.excluded_properties, vec!["size"]);

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        writeln!(broken, "[aggregation\nnope").unwrap();
        assert!(matches!(
            Config::from_file(broken.path()),
            Err(RescenterError::ConfigError { .. })
        ));
        assert!(Config::from_file(Path::new("/nonexistent/rescenter.toml")).is_err());
    }
}
