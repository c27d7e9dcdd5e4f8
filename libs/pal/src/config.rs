// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, ensure};
use serde::Deserialize;

fn default_spin_count() -> u32 {
    4000
}
fn default_root() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_runtime_temp_dir() -> String {
    String::from(".pal")
}

/// Runtime configuration of the platform abstraction layer.
///
/// Every field has a default, so an empty document is a valid configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PalConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub critical_section: CriticalSectionConfig,
    #[serde(default)]
    pub shared_memory: SharedMemoryConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LogConfig {
    /// The verbosity of every channel without its own directive
    #[serde(default)]
    pub level: LogLevel,
    /// Per-channel filter directives such as `critsect=trace` or `shmem::manager=debug`
    #[serde(default)]
    pub channels: Vec<String>,
}

/// The available verbosity levels of logging output
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Off,
    /// Log only very serious errors.
    Error,
    /// Log only on hazardous situations.
    Warn,
    /// Log general information. This is the default.
    #[default]
    Info,
    /// Log lower priority, debug information.
    Debug,
    /// Log everything, often extremely verbose, very low priority information.
    Trace,
}

impl From<LogLevel> for tracing::level_filters::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => Self::OFF,
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CriticalSectionConfig {
    /// How often a contended acquire polls the lock before blocking
    #[serde(default = "default_spin_count")]
    pub spin_count: u32,
    /// Hand ownership directly to the longest blocked waiter on release
    #[serde(default)]
    pub fair: bool,
}

impl Default for CriticalSectionConfig {
    fn default() -> Self {
        Self {
            spin_count: default_spin_count(),
            fair: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SharedMemoryConfig {
    /// The directory all shared memory files are created under
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// The name of the runtime's directory below `root`
    #[serde(default = "default_runtime_temp_dir")]
    pub runtime_temp_dir: String,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            runtime_temp_dir: default_runtime_temp_dir(),
        }
    }
}

impl From<&SharedMemoryConfig> for shmem::SharedMemoryConfig {
    fn from(config: &SharedMemoryConfig) -> Self {
        Self {
            root: config.root.clone(),
            runtime_temp_dir: config.runtime_temp_dir.clone(),
        }
    }
}

impl PalConfig {
    /// Parses a configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML, contains unknown keys, or names an
    /// unusable runtime directory.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(s).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or [`Self::from_toml_str`] fails.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::from_toml_str(&s)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let dir = &self.shared_memory.runtime_temp_dir;
        ensure!(!dir.is_empty(), "runtime-temp-dir must not be empty");
        ensure!(
            !dir.contains(['/', '\0']) && dir != "." && dir != "..",
            "runtime-temp-dir must be a single path component, got {dir:?}"
        );
        Ok(())
    }
}
