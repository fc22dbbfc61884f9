// Copyright (c) 2025 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Tags and tag-related functions.
//!
//! The library only consumes a small, fixed set of fields; each audio codec
//! stores them under a different key in a different container dialect. The
//! [`TagStore`] trait hides the container behind uniform field-level access,
//! the default implementation is backed by [`lofty`].

use lofty::{ItemKey, Tag, TagExt, TagType, TaggedFileExt};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Tag container dialect of an audio codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagDialect {
    /// ID3v2 frames, replay-gain in user `TXXX` frames (MP3).
    Id3v2,
    /// Vorbis comments (Ogg Vorbis, FLAC).
    VorbisComment,
    /// APEv2 items (WavPack).
    Ape,
}

/// A field consumed or produced by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagField {
    /// Track number on the disc.
    TrackNumber,
    /// Total tracks on this disc.
    TotalTracks,
    /// Number of the disc in this release.
    DiscNumber,
    /// Total number of discs in this release.
    TotalDiscs,
    /// MusicBrainz release ("album") identifier.
    AlbumId,
    /// MusicBrainz release group identifier.
    ReleaseGroupId,
    /// ReplayGain track gain.
    TrackGain,
    /// ReplayGain track peak.
    TrackPeak,
    /// ReplayGain track range (loudness range).
    TrackRange,
    /// ReplayGain album gain.
    AlbumGain,
    /// ReplayGain album peak.
    AlbumPeak,
    /// Legacy reference loudness, removed on write.
    ReferenceLoudness,
}

impl TagDialect {
    /// The on-disk key for a field in this dialect.
    ///
    /// In ID3v2 and APEv2 the track and disc numbers are stored as `n/N`
    /// pairs under a single key, so [`TagField::TotalTracks`] and
    /// [`TagField::TotalDiscs`] map to the same key as their counterparts
    /// and [`TagStoreExt::get_int_pair`] splits the value.
    #[must_use]
    pub fn key(self, field: TagField) -> &'static str {
        match self {
            Self::Id3v2 => match field {
                TagField::TrackNumber | TagField::TotalTracks => "TRCK",
                TagField::DiscNumber | TagField::TotalDiscs => "TPOS",
                TagField::AlbumId => "TXXX:MusicBrainz Album Id",
                TagField::ReleaseGroupId => "TXXX:MusicBrainz Release Group Id",
                TagField::TrackGain => "TXXX:REPLAYGAIN_TRACK_GAIN",
                TagField::TrackPeak => "TXXX:REPLAYGAIN_TRACK_PEAK",
                TagField::TrackRange => "TXXX:REPLAYGAIN_TRACK_RANGE",
                TagField::AlbumGain => "TXXX:REPLAYGAIN_ALBUM_GAIN",
                TagField::AlbumPeak => "TXXX:REPLAYGAIN_ALBUM_PEAK",
                TagField::ReferenceLoudness => "TXXX:REPLAYGAIN_REFERENCE_LOUDNESS",
            },
            Self::VorbisComment => match field {
                TagField::TrackNumber => "TRACKNUMBER",
                TagField::TotalTracks => "TOTALTRACKS",
                TagField::DiscNumber => "DISCNUMBER",
                TagField::TotalDiscs => "TOTALDISCS",
                TagField::AlbumId => "MUSICBRAINZ_ALBUMID",
                TagField::ReleaseGroupId => "MUSICBRAINZ_RELEASEGROUPID",
                TagField::TrackGain => "REPLAYGAIN_TRACK_GAIN",
                TagField::TrackPeak => "REPLAYGAIN_TRACK_PEAK",
                TagField::TrackRange => "REPLAYGAIN_TRACK_RANGE",
                TagField::AlbumGain => "REPLAYGAIN_ALBUM_GAIN",
                TagField::AlbumPeak => "REPLAYGAIN_ALBUM_PEAK",
                TagField::ReferenceLoudness => "REPLAYGAIN_REFERENCE_LOUDNESS",
            },
            Self::Ape => match field {
                TagField::TrackNumber | TagField::TotalTracks => "Track",
                TagField::DiscNumber | TagField::TotalDiscs => "Disc",
                TagField::AlbumId => "MusicBrainz Album Id",
                TagField::ReleaseGroupId => "MusicBrainz Release Group Id",
                TagField::TrackGain => "REPLAYGAIN_TRACK_GAIN",
                TagField::TrackPeak => "REPLAYGAIN_TRACK_PEAK",
                TagField::TrackRange => "REPLAYGAIN_TRACK_RANGE",
                TagField::AlbumGain => "REPLAYGAIN_ALBUM_GAIN",
                TagField::AlbumPeak => "REPLAYGAIN_ALBUM_PEAK",
                TagField::ReferenceLoudness => "REPLAYGAIN_REFERENCE_LOUDNESS",
            },
        }
    }

    /// Native lofty tag type for this dialect.
    fn tag_type(self) -> TagType {
        match self {
            Self::Id3v2 => TagType::Id3v2,
            Self::VorbisComment => TagType::VorbisComments,
            Self::Ape => TagType::Ape,
        }
    }
}

/// Tag access error.
#[derive(Error, Debug)]
pub enum TagError {
    /// I/O Error.
    #[error("Input/Output error ({:?})", .0)]
    Io(#[from] io::Error),
    /// Errors raised by the [`lofty`] crate.
    #[error("Failed to access tag: {0}")]
    Lofty(#[from] lofty::error::LoftyError),
    /// Temporary file could not be persisted over the original.
    #[error("Failed to persist tagged file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Format a gain or range value the way it is written to tags.
#[must_use]
pub fn format_gain(value: f64) -> String {
    format!("{value:.2} dB")
}

/// Format a peak value the way it is written to tags.
#[must_use]
pub fn format_peak(value: f64) -> String {
    format!("{value:.6}")
}

/// Field-level access to a tag container.
pub trait TagStore: Send {
    /// The dialect this store reads and writes.
    fn dialect(&self) -> TagDialect;
    /// Get the raw string value of a field.
    fn get(&self, field: TagField) -> Option<String>;
    /// Set the raw string value of a field.
    fn set(&mut self, field: TagField, value: &str);
    /// Remove a field.
    fn remove(&mut self, field: TagField);
    /// Persist pending changes to disk.
    fn save(&mut self) -> Result<(), TagError>;
}

/// Typed accessors on top of the raw field access.
pub trait TagStoreExt {
    /// Parse a field as a decibel value, tolerating a ` dB` suffix.
    fn get_f64(&self, field: TagField) -> Option<f64>;
    /// Parse a field as an unsigned integer, tolerating a `n/N` pair.
    fn get_u32(&self, field: TagField) -> Option<u32>;
    /// Parse a field as a `n/N` pair; a plain `n` yields `(n, None)`.
    fn get_int_pair(&self, field: TagField) -> Option<(u32, Option<u32>)>;
}

impl<T: TagStore + ?Sized> TagStoreExt for T {
    fn get_f64(&self, field: TagField) -> Option<f64> {
        let raw = self.get(field)?;
        let raw = raw.trim();
        let raw = raw
            .strip_suffix("dB")
            .or_else(|| raw.strip_suffix("db"))
            .unwrap_or(raw);
        raw.trim().parse().ok()
    }

    fn get_u32(&self, field: TagField) -> Option<u32> {
        self.get_int_pair(field).map(|(first, _)| first)
    }

    fn get_int_pair(&self, field: TagField) -> Option<(u32, Option<u32>)> {
        let raw = self.get(field)?;
        let raw = raw.trim();
        match raw.split_once('/') {
            Some((first, second)) => {
                let first = first.trim().parse().ok()?;
                Some((first, second.trim().parse().ok()))
            }
            None => Some((raw.parse().ok()?, None)),
        }
    }
}

/// Read keys tried for a field, in order of preference.
///
/// Lofty normalizes the well-known keys of every dialect into its own
/// [`ItemKey`] space on read; legacy lowercase replay-gain variants surface
/// as unknown keys and are tried last.
fn read_keys(field: TagField) -> Vec<ItemKey> {
    match field {
        TagField::TrackNumber => vec![ItemKey::TrackNumber],
        TagField::TotalTracks => vec![ItemKey::TrackTotal],
        TagField::DiscNumber => vec![ItemKey::DiscNumber],
        TagField::TotalDiscs => vec![ItemKey::DiscTotal],
        TagField::AlbumId => vec![ItemKey::MusicBrainzReleaseId],
        TagField::ReleaseGroupId => vec![ItemKey::MusicBrainzReleaseGroupId],
        TagField::TrackGain => replaygain_keys("REPLAYGAIN_TRACK_GAIN"),
        TagField::TrackPeak => replaygain_keys("REPLAYGAIN_TRACK_PEAK"),
        TagField::TrackRange => replaygain_keys("REPLAYGAIN_TRACK_RANGE"),
        TagField::AlbumGain => replaygain_keys("REPLAYGAIN_ALBUM_GAIN"),
        TagField::AlbumPeak => replaygain_keys("REPLAYGAIN_ALBUM_PEAK"),
        TagField::ReferenceLoudness => replaygain_keys("REPLAYGAIN_REFERENCE_LOUDNESS"),
    }
}

/// Candidate keys for a replay-gain field: canonical uppercase plus the
/// legacy lowercase spelling.
fn replaygain_keys(canonical: &str) -> Vec<ItemKey> {
    vec![
        ItemKey::Unknown(canonical.to_string()),
        ItemKey::Unknown(canonical.to_ascii_lowercase()),
    ]
}

/// The single key a field is written under.
fn write_key(field: TagField) -> ItemKey {
    read_keys(field)
        .into_iter()
        .next()
        .expect("every field has at least one key")
}

/// Opens tag stores for audio files.
pub trait TagStoreFactory: Send + Sync {
    /// Open the tag container of the file at `path`.
    fn open(&self, path: &Path, dialect: TagDialect) -> Result<Box<dyn TagStore>, TagError>;
}

/// [`lofty`]-backed tag store.
pub struct LoftyTagStore {
    /// Path of the tagged file.
    path: PathBuf,
    /// Dialect the file uses.
    dialect: TagDialect,
    /// The tag, including unsaved modifications.
    tag: Tag,
}

impl LoftyTagStore {
    /// Read the tag container of the file at `path`.
    ///
    /// A file without any tag gets a fresh, empty tag of its native
    /// dialect.
    pub fn read_from_path(path: &Path, dialect: TagDialect) -> Result<Self, TagError> {
        let tagged = lofty::read_from_path(path)?;
        let tag = tagged
            .primary_tag()
            .cloned()
            .unwrap_or_else(|| Tag::new(dialect.tag_type()));
        Ok(Self {
            path: path.to_path_buf(),
            dialect,
            tag,
        })
    }
}

impl TagStore for LoftyTagStore {
    fn dialect(&self) -> TagDialect {
        self.dialect
    }

    fn get(&self, field: TagField) -> Option<String> {
        read_keys(field)
            .into_iter()
            .find_map(|key| self.tag.get_string(&key).map(ToString::to_string))
    }

    fn set(&mut self, field: TagField, value: &str) {
        let _ = self.tag.insert_text(write_key(field), value.to_string());
    }

    fn remove(&mut self, field: TagField) {
        for key in read_keys(field) {
            self.tag.remove_key(&key);
        }
    }

    fn save(&mut self) -> Result<(), TagError> {
        // Write into a temporary copy and atomically persist it over the
        // original, so an interrupted save never leaves a half-written
        // file in the library.
        let dir = self
            .path
            .parent()
            .ok_or_else(|| io::Error::other("tagged file has no parent directory"))?;
        let file_name = self
            .path
            .file_name()
            .and_then(std::ffi::OsStr::to_str)
            .ok_or_else(|| io::Error::other("tagged file has no usable file name"))?;
        let mut temp = tempfile::Builder::new()
            .prefix(format!(".lguard.{file_name}").as_str())
            .suffix(".tmp")
            .tempfile_in(dir)?;
        let mut source = std::fs::File::open(&self.path)?;
        let _ = io::copy(&mut source, temp.as_file_mut())?;
        self.tag.save_to_path(temp.path())?;
        let _persisted = temp.persist(&self.path)?;
        log::debug!("Saved tags: {}", self.path.display());
        Ok(())
    }
}

/// Factory for [`LoftyTagStore`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoftyTagStoreFactory;

impl TagStoreFactory for LoftyTagStoreFactory {
    fn open(&self, path: &Path, dialect: TagDialect) -> Result<Box<dyn TagStore>, TagError> {
        LoftyTagStore::read_from_path(path, dialect).map(|store| Box::new(store) as Box<dyn TagStore>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTagStore;

    #[test]
    fn test_dialect_keys_match_wire_contract() {
        assert_eq!(
            TagDialect::Id3v2.key(TagField::TrackGain),
            "TXXX:REPLAYGAIN_TRACK_GAIN"
        );
        assert_eq!(
            TagDialect::VorbisComment.key(TagField::AlbumId),
            "MUSICBRAINZ_ALBUMID"
        );
        assert_eq!(TagDialect::Ape.key(TagField::TrackNumber), "Track");
        assert_eq!(TagDialect::Id3v2.key(TagField::TotalDiscs), "TPOS");
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_gain(-3.456_789), "-3.46 dB");
        assert_eq!(format_peak(0.987_654_321), "0.987654");
    }

    #[test]
    fn test_get_f64_strips_db_suffix() {
        let mut store = FakeTagStore::new(TagDialect::VorbisComment);
        store.set(TagField::TrackGain, "-6.20 dB");
        assert_eq!(store.get_f64(TagField::TrackGain), Some(-6.20));
    }

    #[test]
    fn test_get_int_pair() {
        let mut store = FakeTagStore::new(TagDialect::Id3v2);
        store.set(TagField::TrackNumber, "3/12");
        assert_eq!(store.get_int_pair(TagField::TrackNumber), Some((3, Some(12))));
        assert_eq!(store.get_u32(TagField::TrackNumber), Some(3));

        store.set(TagField::DiscNumber, "1");
        assert_eq!(store.get_int_pair(TagField::DiscNumber), Some((1, None)));
    }

    #[test]
    fn test_get_int_pair_rejects_garbage() {
        let mut store = FakeTagStore::new(TagDialect::VorbisComment);
        store.set(TagField::TrackNumber, "one of twelve");
        assert_eq!(store.get_int_pair(TagField::TrackNumber), None);
    }
}
