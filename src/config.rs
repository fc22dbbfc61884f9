// Copyright (c) 2025 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Configuration utils.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Encountered when the configuration cannot be loaded.
#[derive(Error, Debug)]
#[error("Configuration Error: {0}")]
pub struct ConfigError(#[from] toml::de::Error);

/// Default configuration TOML string.
const DEFAULT_CONFIG: &str = include_str!("default_config.toml");

/// Represents a piece of configuration that can be merged with another one.
trait MergeableConfig {
    /// Merge this configuration object with another one, taking values not set in this object from
    /// the other one (if present).
    fn merge(&self, other: &Self) -> Self;
}

/// Configuration for catalog duration lookups.
#[expect(missing_copy_implementations)]
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// Consult the release catalog for duplicate duration arbitration.
    pub enabled: Option<bool>,
    /// Upper bound for a single lookup, in seconds.
    pub timeout_secs: Option<u64>,
}

impl MergeableConfig for CatalogConfig {
    fn merge(&self, other: &Self) -> Self {
        CatalogConfig {
            enabled: self.enabled.or(other.enabled),
            timeout_secs: self.timeout_secs.or(other.timeout_secs),
        }
    }
}

/// Worker pool configuration.
#[expect(missing_copy_implementations)]
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Concurrently processed sibling directories.
    ///
    /// Use `0` to process one directory per CPU core.
    pub max_dir_workers: Option<usize>,
}

impl MergeableConfig for WorkerConfig {
    fn merge(&self, other: &Self) -> Self {
        WorkerConfig {
            max_dir_workers: self.max_dir_workers.or(other.max_dir_workers),
        }
    }
}

/// The main configuration struct.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Catalog lookup configuration.
    pub catalog: CatalogConfig,
    /// Worker pool configuration.
    pub workers: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::load_default().expect("Failed to load default config")
    }
}

impl MergeableConfig for Config {
    /// Merge this configuration object with another one, taking values not set in this object from
    /// the other one (if present).
    fn merge(&self, other: &Self) -> Self {
        Config {
            catalog: self.catalog.merge(&other.catalog),
            workers: self.workers.merge(&other.workers),
        }
    }
}

impl Config {
    /// Load the configuration from a string slice.
    fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config = toml::from_str(text)?;
        Ok(config)
    }

    /// Load the default configuration.
    fn load_default() -> Result<Self, ConfigError> {
        Self::load_from_str(DEFAULT_CONFIG)
    }

    /// Load the configuration from a file located at the given path.
    ///
    /// # Errors
    ///
    /// This method can fail if the file cannot be accessed or if it contains malformed
    /// configuration markup.
    pub fn load_from_path<T: AsRef<Path>>(path: T) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::load_from_str(&text)?;
        Ok(config)
    }

    /// Merge this configuration struct with the default values.
    #[must_use]
    pub fn with_defaults(&self) -> Self {
        let default = Self::default();
        self.merge(&default)
    }
}
