// Copyright (c) 2026 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Album-level loudness re-integration.
//!
//! Instead of decoding a whole disc a second time, the album loudness is
//! reconstructed from the per-track EBU R 128 measurements: each track's
//! mean energy is weighted by the share of its frames estimated to pass the
//! relative gate, then the weighted energies are merged and converted back
//! to LUFS.

/// ReplayGain 2.0 reference loudness in LUFS.
const REFERENCE_LUFS: f64 = -18.0;

/// Offset between the BS.1770 mean-square value and LKFS.
const LOUDNESS_OFFSET: f64 = 0.691;

/// Calibration against the gstreamer rganalysis scanner the library was
/// originally vetted with.
const ALBUM_GAIN_CORRECTION: f64 = -0.05;

/// Per-track loudness measurements feeding the album merge.
#[derive(Debug, Clone, Copy)]
pub struct TrackLoudness {
    /// Integrated loudness in LUFS.
    pub iloud: f64,
    /// Relative threshold in LUFS.
    pub rthres: f64,
    /// Total number of audio frames.
    pub total_frames: u64,
    /// Sample peak, linear.
    pub peak: f64,
}

/// Album-level replay-gain values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlbumLoudness {
    /// Album gain in dB.
    pub gain: f64,
    /// Album peak, linear.
    pub peak: f64,
}

/// Convert a LUFS value to its mean-square energy.
fn lufs_to_energy(lufs: f64) -> f64 {
    10.0f64.powf((lufs + LOUDNESS_OFFSET) / 10.0)
}

/// Merge per-track loudness measurements into album gain and peak.
///
/// Returns `None` when the inputs collapse to a degenerate sum (no frames,
/// silence) or the math leaves the finite domain; callers treat that as
/// "skip the album gain step", not as a directory failure.
#[must_use]
pub fn integrate_album(tracks: &[TrackLoudness]) -> Option<AlbumLoudness> {
    if tracks.len() < 2 {
        return None;
    }

    let mut sum_energy = 0.0f64;
    let mut sum_weight = 0.0f64;
    let mut peak = 0.0f64;
    for track in tracks {
        let energy = lufs_to_energy(track.iloud);
        let threshold_energy = lufs_to_energy(track.rthres);
        let gated_ratio = if threshold_energy > 0.0 {
            (energy / threshold_energy).min(1.0)
        } else {
            1.0
        };
        let weight = track.total_frames as f64 * gated_ratio;
        sum_energy += energy * weight;
        sum_weight += weight;
        peak = peak.max(track.peak);
    }

    if sum_weight <= 0.0 {
        return None;
    }
    let album_energy = sum_energy / sum_weight;
    if album_energy <= 0.0 {
        return None;
    }
    let album_lufs = 10.0 * album_energy.log10() - LOUDNESS_OFFSET;
    let gain = REFERENCE_LUFS - album_lufs + ALBUM_GAIN_CORRECTION;
    if !gain.is_finite() {
        return None;
    }
    Some(AlbumLoudness { gain, peak })
}
