// Copyright (c) 2026 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Audio files and the [`TrackInfo`] record extracted from them.

use crate::analyzer::{AnalyzerErrorKind, ProbeRequest};
use crate::context::GuardContext;
use crate::error::ErrorKind;
use crate::options::Options;
use crate::tags::{format_gain, format_peak, TagDialect, TagField, TagStore, TagStoreExt};
use crate::vcache;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimum sample rate accepted into the library, in Hz.
pub const MIN_SAMPLE_RATE: u32 = 44_100;

/// Minimum bit depth accepted into the library.
pub const MIN_BIT_DEPTH: u32 = 16;

/// The closed set of audio codecs the library accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// MPEG-1 Layer III.
    Mp3,
    /// Vorbis in an Ogg container.
    Vorbis,
    /// Free Lossless Audio Codec.
    Flac,
    /// WavPack.
    WavPack,
}

impl AudioCodec {
    /// Codec for a file extension (without the dot).
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp3" => Some(Self::Mp3),
            "ogg" => Some(Self::Vorbis),
            "flac" => Some(Self::Flac),
            "wv" => Some(Self::WavPack),
            _ => None,
        }
    }

    /// Codec for an analyzer format name.
    #[must_use]
    pub fn from_format_name(name: &str) -> Option<Self> {
        match name {
            "mp3" => Some(Self::Mp3),
            "vorbis" => Some(Self::Vorbis),
            "flac" => Some(Self::Flac),
            "wavpack" => Some(Self::WavPack),
            _ => None,
        }
    }

    /// Canonical file extension.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Vorbis => "ogg",
            Self::Flac => "flac",
            Self::WavPack => "wv",
        }
    }

    /// MIME type used during classification.
    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Vorbis => "audio/ogg",
            Self::Flac => "audio/flac",
            Self::WavPack => "audio/x-wavpack",
        }
    }

    /// Minimum accepted bit rate in bits per second; lossless codecs have
    /// no minimum.
    #[must_use]
    pub fn min_bit_rate(self) -> u32 {
        match self {
            Self::Mp3 => 128_000,
            Self::Vorbis => 112_000,
            Self::Flac | Self::WavPack => 0,
        }
    }

    /// Relative weight of the format in the quality metric.
    #[must_use]
    pub fn format_weight(self) -> f64 {
        match self {
            Self::Mp3 => 0.55,
            Self::Vorbis => 0.70,
            Self::Flac => 1.00,
            Self::WavPack => 0.95,
        }
    }

    /// Tag container dialect used by this codec.
    #[must_use]
    pub fn dialect(self) -> TagDialect {
        match self {
            Self::Mp3 => TagDialect::Id3v2,
            Self::Vorbis | Self::Flac => TagDialect::VorbisComment,
            Self::WavPack => TagDialect::Ape,
        }
    }
}

/// Source of unique keys for standalone tracks.
static STANDALONE_KEY: AtomicU64 = AtomicU64::new(1);

/// Stream parameters, identity tags and loudness data of a single track.
///
/// Frozen after construction; album-level loudness updates go to the tag
/// store, never back into this record.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Track number on the disc.
    pub track_number: Option<u32>,
    /// Total tracks on the disc.
    pub num_tracks: Option<u32>,
    /// Disc number within the release.
    pub disc_number: Option<u32>,
    /// Total discs of the release.
    pub num_discs: Option<u32>,
    /// MusicBrainz release identifier.
    pub album_id: Option<String>,
    /// MusicBrainz release group identifier.
    pub release_group_id: Option<String>,
    /// ReplayGain track gain in dB.
    pub track_gain: Option<f64>,
    /// ReplayGain track peak, linear.
    pub track_peak: Option<f64>,
    /// Loudness range in LU.
    pub track_lra: Option<f64>,
    /// Integrated loudness in LUFS.
    pub track_iloud: Option<f64>,
    /// Relative threshold in LUFS.
    pub track_rthres: Option<f64>,
    /// ReplayGain album gain in dB, as found in the tags.
    pub album_gain: Option<f64>,
    /// ReplayGain album peak, as found in the tags.
    pub album_peak: Option<f64>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bit rate in bits per second.
    pub bit_rate: u32,
    /// Bit depth.
    pub bit_depth: u32,
    /// Duration in seconds.
    pub duration_secs: f64,
    /// Header-vs-decode duration difference in seconds.
    pub duration_diff: f64,
    /// Total number of audio frames.
    pub total_frames: u64,
    /// Unique key assigned to standalone tracks so they never collide.
    pub(crate) standalone_key: Option<u64>,
}

/// Identity of a track for duplicate grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackIdentity {
    /// Identity of an album track: the release/position tuple.
    Album {
        /// MusicBrainz release identifier.
        album_id: Option<String>,
        /// MusicBrainz release group identifier.
        release_group_id: Option<String>,
        /// Track number on the disc.
        track_number: Option<u32>,
        /// Total tracks on the disc.
        num_tracks: Option<u32>,
        /// Disc number within the release.
        disc_number: Option<u32>,
        /// Total discs of the release.
        num_discs: Option<u32>,
    },
    /// Identity of a standalone track: a fresh key plus stream data.
    Standalone {
        /// Run-unique key.
        key: u64,
        /// Sample rate in Hz.
        sample_rate: u32,
        /// Bit rate in bits per second.
        bit_rate: u32,
        /// Bit depth.
        bit_depth: u32,
        /// Duration bit pattern (exact, not approximate).
        duration_bits: u64,
    },
}

impl TrackInfo {
    /// Returns `true` if this track carries no release identity at all.
    #[must_use]
    pub fn is_standalone(&self) -> bool {
        self.album_id.is_none()
            && self.release_group_id.is_none()
            && self.num_tracks.is_none()
            && self.num_discs.is_none()
    }

    /// Identity used for duplicate grouping.
    #[must_use]
    pub fn identity(&self) -> TrackIdentity {
        if let Some(key) = self.standalone_key {
            TrackIdentity::Standalone {
                key,
                sample_rate: self.sample_rate,
                bit_rate: self.bit_rate,
                bit_depth: self.bit_depth,
                duration_bits: self.duration_secs.to_bits(),
            }
        } else {
            TrackIdentity::Album {
                album_id: self.album_id.clone(),
                release_group_id: self.release_group_id.clone(),
                track_number: self.track_number,
                num_tracks: self.num_tracks,
                disc_number: self.disc_number,
                num_discs: self.num_discs,
            }
        }
    }
}

impl PartialEq for TrackInfo {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for TrackInfo {}

/// Leading decimal prefix of a file name (`01` in `01 Intro.flac`).
///
/// Follows the library naming convention of a whitespace-separated decimal
/// track number prefix.
#[must_use]
pub fn filename_track_prefix(name: &str) -> Option<u32> {
    let token = name.split_whitespace().next()?;
    if token.chars().all(|c| c.is_ascii_digit()) {
        token.parse().ok()
    } else {
        None
    }
}

/// Reference sample rate of the quality metric (studio-grade 48 kHz).
const QUALITY_REF_SAMPLE_RATE: f64 = 48_000.0;
/// Reference bit depth of the quality metric.
const QUALITY_REF_BIT_DEPTH: f64 = 24.0;
/// Reference bit rate of the quality metric (16-bit 44.1 kHz stereo PCM).
const QUALITY_REF_BIT_RATE: f64 = 705_600.0;
/// Reference loudness range of the quality metric, in LU.
const QUALITY_REF_LRA: f64 = 10.0;

/// An audio file of the library, bound to its tag container.
pub struct AudioFile {
    /// Path of the file.
    path: PathBuf,
    /// File name.
    name: String,
    /// Codec of the stream.
    codec: AudioCodec,
    /// The frozen track record.
    info: TrackInfo,
    /// Verification state; [`ErrorKind::Ok`] for a clean file.
    status: ErrorKind,
    /// Pending tag modifications that must be persisted on close.
    tags_updated: bool,
    /// The file lost a duplicate battle and is removed on close.
    delete_on_close: bool,
    /// Run options.
    options: Options,
    /// Tag container handle.
    store: Box<dyn TagStore>,
}

impl std::fmt::Debug for AudioFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFile")
            .field("path", &self.path)
            .field("codec", &self.codec)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl AudioFile {
    /// Construct an audio file record.
    ///
    /// Consults the verification cache to decide between a full probe and a
    /// header-only probe, validates the stream parameters, and synchronizes
    /// the [`TrackInfo`] with the tag container. Hard failures (unreadable
    /// container, unparsable tags) reject the file; soft failures are kept
    /// in the verification state so the directory can decide.
    pub fn build(path: &Path, ctx: &GuardContext) -> Result<Self, ErrorKind> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
            .ok_or(ErrorKind::InvalidFormat)?;

        let fresh = vcache::needs_check(path, ctx.options).map_err(|err| {
            log::error!("Failed to stat {}: {err}", path.display());
            ErrorKind::AccessDenied
        })?;
        let request = if fresh {
            ProbeRequest::full()
        } else {
            ProbeRequest::header_only()
        };

        let mut status = ErrorKind::Ok;
        let probe = match ctx.analyzer.analyze(path, request) {
            Ok(probe) => probe,
            Err(mut err) => {
                let partial = err.take_partial();
                match (err.kind(), partial) {
                    (AnalyzerErrorKind::Codec, Some(partial)) => {
                        log::error!("Integrity check failed: {} ({err})", path.display());
                        status = ErrorKind::Corrupted;
                        partial
                    }
                    (AnalyzerErrorKind::EbuR128, Some(partial)) => {
                        log::warn!("Loudness analysis failed: {} ({err})", path.display());
                        status = ErrorKind::RgainFailed;
                        partial
                    }
                    _ => {
                        log::error!("Unusable audio file: {} ({err})", path.display());
                        return Err(ErrorKind::InvalidFormat);
                    }
                }
            }
        };

        let codec =
            AudioCodec::from_format_name(&probe.format_name).ok_or(ErrorKind::InvalidFormat)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        if extension.as_deref() != Some(codec.extension()) {
            log::warn!(
                "File extension does not match codec {:?}: {}",
                codec,
                path.display()
            );
        }

        // Stream parameter validation; a corrupted stream is never
        // downgraded to a parameter violation.
        if status != ErrorKind::Corrupted {
            if probe.bit_rate < codec.min_bit_rate() {
                log::error!(
                    "Bitrate below threshold ({}): {}",
                    probe.bit_rate,
                    path.display()
                );
                status = ErrorKind::InvalidBitRate;
            } else if probe.sample_rate < MIN_SAMPLE_RATE {
                log::error!(
                    "Sample rate below threshold ({}): {}",
                    probe.sample_rate,
                    path.display()
                );
                status = ErrorKind::InvalidSampleRate;
            } else if probe.bit_depth < MIN_BIT_DEPTH {
                log::error!(
                    "Bit depth below threshold ({}): {}",
                    probe.bit_depth,
                    path.display()
                );
                status = ErrorKind::InvalidBitDepth;
            }
        }

        let mut store = ctx.tag_stores.open(path, codec.dialect()).map_err(|err| {
            log::error!(
                "Failed to open tags, treating as invalid: {} ({err})",
                path.display()
            );
            ErrorKind::InvalidTags
        })?;

        let track_pair = store.get_int_pair(TagField::TrackNumber);
        let disc_pair = store.get_int_pair(TagField::DiscNumber);
        let track_number = track_pair.map(|(number, _)| number);
        let num_tracks = store
            .get_u32(TagField::TotalTracks)
            .or(track_pair.and_then(|(_, total)| total));
        let disc_number = disc_pair.map(|(number, _)| number);
        let num_discs = store
            .get_u32(TagField::TotalDiscs)
            .or(disc_pair.and_then(|(_, total)| total));
        let album_id = store.get(TagField::AlbumId);
        let release_group_id = store.get(TagField::ReleaseGroupId);
        let album_gain = store.get_f64(TagField::AlbumGain);
        let album_peak = store.get_f64(TagField::AlbumPeak);

        let mut tags_updated = false;
        let (track_gain, track_peak, track_lra, track_iloud, track_rthres) =
            if let Some(gain) = probe.rg2_gain {
                // Fresh analysis: write the track-level values and drop the
                // legacy reference loudness tag.
                store.set(TagField::TrackGain, &format_gain(gain));
                if let Some(peak) = probe.sample_peak {
                    store.set(TagField::TrackPeak, &format_peak(peak));
                }
                if let Some(lra) = probe.ebur128_lra {
                    store.set(TagField::TrackRange, &format_gain(lra));
                }
                store.remove(TagField::ReferenceLoudness);
                tags_updated = true;
                (
                    Some(gain),
                    probe.sample_peak,
                    probe.ebur128_lra,
                    probe.ebur128_iloud,
                    probe.relative_threshold,
                )
            } else {
                (
                    store.get_f64(TagField::TrackGain),
                    store.get_f64(TagField::TrackPeak),
                    store.get_f64(TagField::TrackRange),
                    None,
                    None,
                )
            };

        let standalone = album_id.is_none()
            && release_group_id.is_none()
            && num_tracks.is_none()
            && num_discs.is_none();
        let standalone_key =
            standalone.then(|| STANDALONE_KEY.fetch_add(1, Ordering::Relaxed));

        let info = TrackInfo {
            track_number,
            num_tracks,
            disc_number,
            num_discs,
            album_id,
            release_group_id,
            track_gain,
            track_peak,
            track_lra,
            track_iloud,
            track_rthres,
            album_gain,
            album_peak,
            sample_rate: probe.sample_rate,
            bit_rate: probe.bit_rate,
            bit_depth: probe.bit_depth,
            duration_secs: probe.duration_secs,
            duration_diff: probe.duration_diff,
            total_frames: probe.total_frames,
            standalone_key,
        };

        Ok(Self {
            path: path.to_path_buf(),
            name,
            codec,
            info,
            status,
            tags_updated,
            delete_on_close: false,
            options: ctx.options,
            store,
        })
    }

    /// Path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Codec of the stream.
    #[must_use]
    pub fn codec(&self) -> AudioCodec {
        self.codec
    }

    /// The frozen track record.
    #[must_use]
    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    /// Verification state.
    #[must_use]
    pub fn status(&self) -> ErrorKind {
        self.status
    }

    /// Mark this file as the loser of a duplicate battle.
    pub fn mark_for_deletion(&mut self) {
        self.delete_on_close = true;
    }

    /// Returns `true` if the file is scheduled for removal.
    #[must_use]
    pub fn is_marked_for_deletion(&self) -> bool {
        self.delete_on_close
    }

    /// Write album-level replay-gain values into the tags.
    pub fn write_album_gain(&mut self, gain: f64, peak: f64) {
        self.store.set(TagField::AlbumGain, &format_gain(gain));
        self.store.set(TagField::AlbumPeak, &format_peak(peak));
        self.tags_updated = true;
    }

    /// Quality metric `Q` of the file, or `None` if verification failed.
    ///
    /// Compares stream parameters against studio-grade references on a log
    /// scale, with a dynamic-range term around 10 LU and a penalty for
    /// brickwalled masters.
    #[must_use]
    pub fn quality(&self) -> Option<f64> {
        if self.status.is_err() {
            return None;
        }
        let info = &self.info;
        if info.sample_rate == 0 || info.bit_rate == 0 || info.bit_depth == 0 {
            return None;
        }

        let sr = (f64::from(info.sample_rate) / QUALITY_REF_SAMPLE_RATE).log2();
        let bd = (f64::from(info.bit_depth) / QUALITY_REF_BIT_DEPTH).log2();
        let br = (f64::from(info.bit_rate) / QUALITY_REF_BIT_RATE).log2();

        let dr = info.track_lra.map_or(0.5, |lra| {
            let deviation = lra / QUALITY_REF_LRA - 1.0;
            (-0.5 * deviation.powi(2) / 0.5).exp().clamp(0.2, 1.0)
        });

        let pk = match info.track_peak {
            None => 1.0,
            Some(peak) if peak <= 0.95 => 1.0,
            Some(peak) => {
                let mut pk = 1.0 - (peak - 0.95) * 2.0;
                if let Some(lra) = info.track_lra {
                    if lra < 6.0 {
                        pk -= (6.0 - lra) / 60.0;
                    }
                }
                pk
            }
        };

        Some(
            0.25 * sr
                + 0.25 * bd
                + 0.15 * br
                + 0.15 * dr
                + 0.10 * pk
                + 1.1 * self.codec.format_weight(),
        )
    }

    /// Normalized quality `Q' = Q / (Q + scale)`; a failed file scores 0.
    #[must_use]
    pub fn quality_normalized(&self, scale: f64) -> f64 {
        match self.quality() {
            Some(q) if q + scale != 0.0 => q / (q + scale),
            _ => 0.0,
        }
    }

    /// Duration reconciliation score against another file.
    ///
    /// Positive favors `self`, negative favors `other`. `None` means the
    /// durations differ beyond every tolerance and the directory must be
    /// flagged inconsistent.
    #[must_use]
    pub fn compare_duration(
        &self,
        other: &Self,
        catalog: &dyn crate::catalog::ReleaseCatalog,
    ) -> Option<f64> {
        let own = self.info.duration_secs;
        let theirs = other.info.duration_secs;
        if own == 0.0 && theirs > 0.0 {
            return Some(-1.0);
        }
        if theirs == 0.0 && own > 0.0 {
            return Some(1.0);
        }
        let delta = (own - theirs).abs();
        if delta <= 2.0 {
            return Some(0.0);
        }

        let canonical = self
            .info
            .album_id
            .as_deref()
            .zip(self.info.track_number)
            .and_then(|(album_id, number)| catalog.lookup(album_id, number));
        if let Some(canonical) = canonical {
            let own_diff = (own - canonical).abs();
            let their_diff = (theirs - canonical).abs();
            if their_diff - own_diff >= 2.0 {
                return Some(1.0);
            }
            if own_diff - their_diff >= 2.0 {
                return Some(-1.0);
            }
            return Some(0.0);
        }

        if delta <= 5.0 {
            return Some(if own > theirs { 0.5 } else { -0.5 });
        }
        None
    }

    /// Overall duel score against another file with equal identity.
    ///
    /// `None` signals an irreconcilable duration difference.
    #[must_use]
    pub fn battle(
        &self,
        other: &Self,
        scale: f64,
        catalog: &dyn crate::catalog::ReleaseCatalog,
    ) -> Option<f64> {
        let duration_score = self.compare_duration(other, catalog)?;
        let quality_score = self.quality_normalized(scale) - other.quality_normalized(scale);
        Some(0.6 * quality_score + 0.4 * duration_score)
    }

    /// Close the file.
    ///
    /// A duplicate loser is removed from disk. Otherwise, if the file (and
    /// its directory) is clean and tags were modified, the tags are
    /// persisted and the verification stamp refreshed. A file in a failed
    /// directory is released untouched.
    pub fn close(mut self, directory_failed: bool) -> ErrorKind {
        if directory_failed {
            return self.status;
        }
        if self.delete_on_close {
            if self.options.dry_run {
                log::info!("Would remove duplicate: {}", self.path.display());
            } else if let Err(err) = std::fs::remove_file(&self.path) {
                log::error!("Failed to remove duplicate {}: {err}", self.path.display());
            } else {
                log::info!("Removed duplicate: {}", self.path.display());
            }
            return self.status;
        }
        if self.status.is_err() || self.options.dry_run {
            return self.status;
        }
        if self.tags_updated {
            match self.store.save() {
                Ok(()) => {
                    log::info!("Updated tags: {}", self.path.display());
                    vcache::mark_verified(&self.path);
                }
                Err(err) => {
                    log::error!("Tag update failed: {} ({err})", self.path.display());
                    self.status = ErrorKind::RgainFailed;
                }
            }
        }
        self.status
    }

    /// Build an audio file around canned parts, bypassing probe and tag
    /// I/O. Used by tests.
    #[cfg(test)]
    pub(crate) fn from_parts(
        path: PathBuf,
        codec: AudioCodec,
        info: TrackInfo,
        status: ErrorKind,
        options: Options,
        store: Box<dyn TagStore>,
    ) -> Self {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        Self {
            path,
            name,
            codec,
            info,
            status,
            tags_updated: false,
            delete_on_close: false,
            options,
            store,
        }
    }
}
