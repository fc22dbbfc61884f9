// Copyright (c) 2025 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

#![cfg(test)]
//! Testing utils.

use crate::analyzer::{AnalyzerError, AudioAnalyzer, ProbeRequest, TrackProbe};
use crate::catalog::ReleaseCatalog;
use crate::context::GuardContext;
use crate::options::Options;
use crate::tags::{TagDialect, TagError, TagField, TagStore, TagStoreFactory};
use crate::track::TrackInfo;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Build an album-track [`TrackInfo`] with sane stream defaults.
pub(crate) fn track_info(
    album_id: &str,
    release_group_id: &str,
    track_number: u32,
    num_tracks: u32,
    disc_number: u32,
    num_discs: u32,
) -> TrackInfo {
    TrackInfo {
        track_number: Some(track_number),
        num_tracks: Some(num_tracks),
        disc_number: Some(disc_number),
        num_discs: Some(num_discs),
        album_id: Some(album_id.to_string()),
        release_group_id: Some(release_group_id.to_string()),
        track_gain: None,
        track_peak: None,
        track_lra: None,
        track_iloud: None,
        track_rthres: None,
        album_gain: None,
        album_peak: None,
        sample_rate: 44_100,
        bit_rate: 900_000,
        bit_depth: 16,
        duration_secs: 180.0,
        duration_diff: 0.0,
        total_frames: 7_938_000,
        standalone_key: None,
    }
}

/// A fully-populated probe as the analyzer would return it after a fresh
/// decode.
pub(crate) fn fresh_probe(format_name: &str, iloud: f64) -> TrackProbe {
    TrackProbe {
        format_name: format_name.to_string(),
        sample_rate: 44_100,
        bit_rate: 900_000,
        bit_depth: 16,
        duration_secs: 180.0,
        duration_diff: 0.0,
        total_frames: 7_938_000,
        rg2_gain: Some(-18.0 - iloud),
        sample_peak: Some(0.8),
        ebur128_lra: Some(9.0),
        ebur128_iloud: Some(iloud),
        relative_threshold: Some(iloud - 10.0),
    }
}

/// Canned analysis outcome.
pub(crate) enum FakeProbe {
    /// Successful probe.
    Ok(TrackProbe),
    /// Failure constructed on demand.
    Err(Box<dyn Fn() -> AnalyzerError + Send + Sync>),
}

/// Analyzer that answers from a canned per-file-name table.
#[derive(Default)]
pub(crate) struct FakeAnalyzer {
    /// Probe results by file name.
    probes: HashMap<String, FakeProbe>,
}

impl FakeAnalyzer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a successful probe for a file name.
    pub(crate) fn with_probe(mut self, name: &str, probe: TrackProbe) -> Self {
        let _ = self.probes.insert(name.to_string(), FakeProbe::Ok(probe));
        self
    }

    /// Add a failing probe for a file name.
    pub(crate) fn with_error(
        mut self,
        name: &str,
        make: impl Fn() -> AnalyzerError + Send + Sync + 'static,
    ) -> Self {
        let _ = self
            .probes
            .insert(name.to_string(), FakeProbe::Err(Box::new(make)));
        self
    }
}

impl AudioAnalyzer for FakeAnalyzer {
    fn analyze(&self, path: &Path, request: ProbeRequest) -> Result<TrackProbe, AnalyzerError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        match self.probes.get(name) {
            Some(FakeProbe::Ok(probe)) => {
                let mut probe = probe.clone();
                if !request.decode {
                    // Header-only probes carry no loudness data.
                    probe.rg2_gain = None;
                    probe.sample_peak = None;
                    probe.ebur128_lra = None;
                    probe.ebur128_iloud = None;
                    probe.relative_threshold = None;
                }
                Ok(probe)
            }
            Some(FakeProbe::Err(make)) => Err(make()),
            None => Err(AnalyzerError::format(format!("no canned probe for {name}"))),
        }
    }
}

/// Shared tag state of all fake stores handed out by a factory.
type SharedTags = Arc<Mutex<HashMap<PathBuf, FakeTagState>>>;

/// Backing state of one fake tag container.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeTagState {
    /// Raw values by dialect key.
    pub(crate) values: HashMap<String, String>,
    /// Number of times the store was saved.
    pub(crate) saves: usize,
}

/// In-memory [`TagStore`] for tests, keyed by the on-disk dialect keys so
/// the key tables are exercised.
pub(crate) struct FakeTagStore {
    /// Dialect the store pretends to be.
    dialect: TagDialect,
    /// Local values by dialect key.
    values: HashMap<String, String>,
    /// Factory state to write back into on save.
    shared: Option<(PathBuf, SharedTags)>,
}

impl FakeTagStore {
    /// A free-standing store, not connected to a factory.
    pub(crate) fn new(dialect: TagDialect) -> Self {
        Self {
            dialect,
            values: HashMap::new(),
            shared: None,
        }
    }
}

impl TagStore for FakeTagStore {
    fn dialect(&self) -> TagDialect {
        self.dialect
    }

    fn get(&self, field: TagField) -> Option<String> {
        self.values.get(self.dialect.key(field)).cloned()
    }

    fn set(&mut self, field: TagField, value: &str) {
        let _ = self
            .values
            .insert(self.dialect.key(field).to_string(), value.to_string());
    }

    fn remove(&mut self, field: TagField) {
        let _ = self.values.remove(self.dialect.key(field));
    }

    fn save(&mut self) -> Result<(), TagError> {
        if let Some((path, shared)) = &self.shared {
            let mut shared = shared.lock().unwrap();
            let state = shared.entry(path.clone()).or_default();
            state.values = self.values.clone();
            state.saves += 1;
        }
        Ok(())
    }
}

/// Factory producing connected [`FakeTagStore`]s with pre-seeded tags.
#[derive(Default)]
pub(crate) struct FakeTagStoreFactory {
    /// Initial tag values by file name (dialect keys).
    seeds: Mutex<HashMap<String, HashMap<String, String>>>,
    /// Saved state by path, inspectable after a run.
    saved: SharedTags,
}

impl FakeTagStoreFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Seed the tags of a file name with `(field, value)` pairs, stored
    /// under the given dialect's keys.
    pub(crate) fn seed(&self, name: &str, dialect: TagDialect, pairs: &[(TagField, &str)]) {
        let mut values = HashMap::new();
        for (field, value) in pairs {
            let _ = values.insert(dialect.key(*field).to_string(), (*value).to_string());
        }
        let _ = self.seeds.lock().unwrap().insert(name.to_string(), values);
    }

    /// Saved tag state of a path, if the store was saved.
    pub(crate) fn saved_state(&self, path: &Path) -> Option<FakeTagState> {
        self.saved.lock().unwrap().get(path).cloned()
    }
}

impl TagStoreFactory for FakeTagStoreFactory {
    fn open(&self, path: &Path, dialect: TagDialect) -> Result<Box<dyn TagStore>, TagError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        // Saved state wins over the initial seed, so a second run sees the
        // tags the first run wrote.
        let saved = self.saved.lock().unwrap().get(path).map(|state| state.values.clone());
        let values = saved.unwrap_or_else(|| {
            self.seeds
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_default()
        });
        Ok(Box::new(FakeTagStore {
            dialect,
            values,
            shared: Some((path.to_path_buf(), Arc::clone(&self.saved))),
        }))
    }
}

/// Catalog with a fixed answer for a single `(album, track)` pair.
#[derive(Debug, Default)]
pub(crate) struct FakeCatalog {
    /// The answered entry.
    entry: Option<(String, u32, f64)>,
}

impl FakeCatalog {
    /// A catalog that answers `duration` for the given album and track.
    pub(crate) fn with_duration(album_id: &str, track_number: u32, duration: f64) -> Self {
        Self {
            entry: Some((album_id.to_string(), track_number, duration)),
        }
    }
}

impl ReleaseCatalog for FakeCatalog {
    fn lookup(&self, album_id: &str, track_number: u32) -> Option<f64> {
        self.entry.as_ref().and_then(|(album, track, duration)| {
            (album == album_id && *track == track_number).then_some(*duration)
        })
    }
}

/// Assemble a [`GuardContext`] around fakes.
pub(crate) fn fake_context(
    options: Options,
    analyzer: FakeAnalyzer,
    tag_stores: Arc<FakeTagStoreFactory>,
) -> GuardContext {
    GuardContext {
        options,
        analyzer: Arc::new(analyzer),
        tag_stores,
        catalog: Arc::new(crate::catalog::NullCatalog),
    }
}
