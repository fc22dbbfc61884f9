// Copyright (c) 2025 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Release catalog lookups.
//!
//! Duration arbitration between duplicate tracks may consult the canonical
//! track length on MusicBrainz. The lookup is strictly best-effort: network
//! failures, timeouts and unknown releases all yield `None` and the caller
//! falls back to its local tolerance rules.

use musicbrainz_rs_nova::entity::release::Release as MusicBrainzRelease;
use musicbrainz_rs_nova::Fetch;
use std::time::Duration;
use tokio::runtime::Handle;

/// Resolves canonical track durations for a release.
pub trait ReleaseCatalog: Send + Sync {
    /// Look up the canonical duration (in seconds) of the given track.
    fn lookup(&self, album_id: &str, track_number: u32) -> Option<f64>;
}

/// A catalog that never answers; used when lookups are disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCatalog;

impl ReleaseCatalog for NullCatalog {
    fn lookup(&self, _album_id: &str, _track_number: u32) -> Option<f64> {
        None
    }
}

/// MusicBrainz-backed catalog.
#[derive(Debug, Clone)]
pub struct MusicBrainzCatalog {
    /// Runtime handle used to drive the async API client.
    handle: Handle,
    /// Upper bound for a single lookup.
    timeout: Duration,
}

impl MusicBrainzCatalog {
    /// Create a catalog that performs lookups on the given runtime.
    #[must_use]
    pub fn new(handle: Handle, timeout: Duration) -> Self {
        Self { handle, timeout }
    }

    /// Fetch the release and extract the wanted track length.
    async fn fetch_duration(album_id: &str, track_number: u32) -> Option<f64> {
        let release = MusicBrainzRelease::fetch()
            .id(album_id)
            .with_recordings()
            .execute()
            .await
            .inspect_err(|err| log::debug!("Catalog lookup for {album_id} failed: {err}"))
            .ok()?;
        release
            .media
            .iter()
            .flatten()
            .filter_map(|media| media.tracks.as_ref())
            .flatten()
            .find(|track| track.position == track_number)
            .and_then(|track| track.length)
            .map(|millis| f64::from(millis) / 1000.0)
    }
}

impl ReleaseCatalog for MusicBrainzCatalog {
    fn lookup(&self, album_id: &str, track_number: u32) -> Option<f64> {
        let timeout = self.timeout;
        let album_id = album_id.to_string();
        self.handle.block_on(async move {
            match tokio::time::timeout(timeout, Self::fetch_duration(&album_id, track_number))
                .await
            {
                Ok(duration) => duration,
                Err(_) => {
                    log::debug!("Catalog lookup for {album_id} timed out");
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_catalog_never_answers() {
        assert_eq!(NullCatalog.lookup("some-album-id", 3), None);
    }
}
