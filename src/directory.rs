// Copyright (c) 2026 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Directory records.
//!
//! Every visited directory is classified into a [`DirectoryKind`] from its
//! contents. Audio directories additionally reconcile their tracks into a
//! single consistent release (identity tags, numbering, naming), resolve
//! duplicates by quality, and re-integrate album loudness.

use crate::classify::{self, FormatCategory};
use crate::context::GuardContext;
use crate::error::{pick_worst, ErrorKind};
use crate::index::IndexStore;
use crate::junkyard;
use crate::loudness::{self, TrackLoudness};
use crate::track::{filename_track_prefix, AudioFile};
use crate::vcache;
use itertools::Itertools;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Maximum number of per-file workers while constructing one directory.
const FILE_WORKERS: usize = 4;

/// Directory name holding tracks that belong to no release.
const STANDALONE_DIR_NAME: &str = "Standalone Recordings";

/// Artwork file that stays in the album root during rearrangement.
const COVER_FILE_NAME: &str = "album_cover.jpg";

/// The decided kind of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    /// No entries at all; deleted.
    Empty,
    /// Contains a marker file; the subtree is skipped.
    Ignored,
    /// At least one file failed construction.
    Failed,
    /// Only subdirectories.
    Intermediate,
    /// Subdirectories plus mixed auxiliary files.
    DirtyIntermediate,
    /// Mixed auxiliary files without subdirectories.
    DirtyLeaf,
    /// Only artwork; belongs to the parent release.
    Artwork,
    /// Only video; belongs to the parent release.
    Video,
    /// Only text; belongs to the parent release.
    Info,
    /// A single-disc release.
    AudioAlbum,
    /// One disc of a multi-disc release.
    AudioDisc,
    /// Tracks without a release identity.
    AudioStandalone,
}

impl DirectoryKind {
    /// Returns `true` for the audio kinds.
    #[must_use]
    pub fn is_audio(self) -> bool {
        matches!(
            self,
            Self::AudioAlbum | Self::AudioDisc | Self::AudioStandalone
        )
    }
}

/// Result of classifying and constructing one file.
enum BuiltFile {
    /// A constructed audio file.
    Audio(Box<AudioFile>),
    /// Artwork, kept by path.
    Artwork(PathBuf),
    /// Video, kept by path.
    Video(PathBuf),
    /// Text, kept by path.
    Text(PathBuf),
    /// A directory marker.
    Marker,
    /// Construction failed with the given kind.
    Failed(ErrorKind),
}

/// Classify one directory entry and construct the matching record.
fn build_one(path: &Path, ctx: &GuardContext) -> BuiltFile {
    match classify::classify(path) {
        Err(err) => {
            log::error!("Failed to read {}: {err}", path.display());
            BuiltFile::Failed(ErrorKind::AccessDenied)
        }
        Ok(None) => BuiltFile::Failed(ErrorKind::InvalidFormat),
        Ok(Some(FormatCategory::Marker)) => BuiltFile::Marker,
        Ok(Some(FormatCategory::Audio)) => match AudioFile::build(path, ctx) {
            Ok(file) => BuiltFile::Audio(Box::new(file)),
            Err(kind) => BuiltFile::Failed(kind),
        },
        Ok(Some(FormatCategory::Artwork)) => BuiltFile::Artwork(path.to_path_buf()),
        Ok(Some(FormatCategory::Video)) => BuiltFile::Video(path.to_path_buf()),
        Ok(Some(FormatCategory::Text)) => BuiltFile::Text(path.to_path_buf()),
    }
}

/// A visited directory with its classified contents.
pub struct Directory {
    /// Path of the directory.
    path: PathBuf,
    /// Base name of the directory.
    name: String,
    /// Shared collaborators.
    ctx: GuardContext,
    /// The decided kind.
    kind: DirectoryKind,
    /// This directory is one part of a larger release.
    part_of_set: bool,
    /// Tracks carry no release identity; consistency checks are skipped.
    standalone: bool,
    /// Duplicate track numbers were seen; resolve before finalizing.
    check_duplicates: bool,
    /// Album gain/peak absent or inconsistent; re-integrate loudness.
    needs_rgain: bool,
    /// More tracks announced than present (not fatal).
    partial_release: bool,
    /// Contents were moved to the junkyard.
    withdrawn: bool,
    /// Location after withdrawal.
    new_path: Option<PathBuf>,
    /// Collected errors; non-empty means the directory failed.
    errors: Vec<ErrorKind>,
    /// Audio tracks.
    audio_files: Vec<AudioFile>,
    /// Artwork paths.
    artwork_files: Vec<PathBuf>,
    /// Video paths.
    video_files: Vec<PathBuf>,
    /// Text paths.
    text_files: Vec<PathBuf>,
    /// Rolled-up release identifier.
    album_id: Option<String>,
    /// Rolled-up release group identifier.
    release_group_id: Option<String>,
    /// Rolled-up track count.
    num_tracks: Option<u32>,
    /// Rolled-up disc count.
    num_discs: Option<u32>,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

/// Fold a per-file value into a rolled-up directory value.
///
/// The first non-null value wins; later files must agree (null against
/// null is agreement, null against a rolled value is not).
fn roll<T: PartialEq + Clone>(rolled: &mut Option<T>, value: &Option<T>) -> bool {
    if rolled.is_none() && value.is_some() {
        rolled.clone_from(value);
        true
    } else {
        rolled == value
    }
}

impl Directory {
    /// Construct a directory record from its file entries.
    ///
    /// Files are classified and probed concurrently on the blocking pool,
    /// at most [`FILE_WORKERS`] at a time. `has_subdirs` is supplied by the
    /// walker, which has already listed the directory.
    pub async fn build(
        path: PathBuf,
        mut files: Vec<PathBuf>,
        has_subdirs: bool,
        ctx: GuardContext,
    ) -> Self {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        let mut dir = Self {
            path,
            name,
            ctx,
            kind: DirectoryKind::Intermediate,
            part_of_set: false,
            standalone: false,
            check_duplicates: false,
            needs_rgain: false,
            partial_release: false,
            withdrawn: false,
            new_path: None,
            errors: Vec::new(),
            audio_files: Vec::new(),
            artwork_files: Vec::new(),
            video_files: Vec::new(),
            text_files: Vec::new(),
            album_id: None,
            release_group_id: None,
            num_tracks: None,
            num_discs: None,
        };
        log::debug!("Got dir: {}", dir.path.display());

        if files.is_empty() && !has_subdirs {
            log::info!("Got empty directory: {}", dir.path.display());
            dir.kind = DirectoryKind::Empty;
            dir.errors.push(ErrorKind::Empty);
            return dir;
        }
        files.sort_unstable();

        let semaphore = Arc::new(Semaphore::new(FILE_WORKERS));
        let mut handles = JoinSet::new();
        for (index, file_path) in files.into_iter().enumerate() {
            let ctx = dir.ctx.clone();
            let semaphore = Arc::clone(&semaphore);
            let _abort_handle = handles.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("file worker semaphore closed");
                let built =
                    tokio::task::spawn_blocking(move || build_one(&file_path, &ctx)).await;
                (index, built.unwrap_or(BuiltFile::Failed(ErrorKind::Unknown)))
            });
        }
        let mut built: Vec<(usize, BuiltFile)> = Vec::new();
        while let Some(result) = handles.join_next().await {
            match result {
                Ok(item) => built.push(item),
                Err(err) => {
                    log::error!("File worker panicked: {err}");
                    dir.errors.push(ErrorKind::Unknown);
                }
            }
        }
        built.sort_by_key(|(index, _)| *index);

        let mut failures: Vec<ErrorKind> = Vec::new();
        let mut has_marker = false;
        for (_, item) in built {
            match item {
                BuiltFile::Audio(file) => dir.audio_files.push(*file),
                BuiltFile::Artwork(path) => dir.artwork_files.push(path),
                BuiltFile::Video(path) => dir.video_files.push(path),
                BuiltFile::Text(path) => dir.text_files.push(path),
                BuiltFile::Marker => has_marker = true,
                BuiltFile::Failed(kind) => failures.push(kind),
            }
        }

        if has_marker {
            // The marker overrides everything else; release the children
            // untouched and prune the subtree.
            log::info!("Got ignore marker: {}", dir.path.display());
            dir.kind = DirectoryKind::Ignored;
            dir.errors = vec![ErrorKind::Ignore];
            dir.release_children();
            return dir;
        }
        if !failures.is_empty() || !dir.errors.is_empty() {
            dir.kind = DirectoryKind::Failed;
            dir.errors.append(&mut failures);
            dir.release_children();
            return dir;
        }

        let has_audio = !dir.audio_files.is_empty();
        let has_artwork = !dir.artwork_files.is_empty();
        let has_video = !dir.video_files.is_empty();
        let has_text = !dir.text_files.is_empty();
        dir.kind = match (has_audio, has_artwork, has_video, has_text, has_subdirs) {
            (false, false, false, false, _) => DirectoryKind::Intermediate,
            (false, true, false, false, false) => DirectoryKind::Artwork,
            (false, false, true, false, false) => DirectoryKind::Video,
            (false, false, false, true, false) => DirectoryKind::Info,
            (true, ..) => {
                dir.reconcile_audio();
                dir.kind
            }
            (false, _, _, _, true) => DirectoryKind::DirtyIntermediate,
            (false, _, _, _, false) => DirectoryKind::DirtyLeaf,
        };
        if matches!(
            dir.kind,
            DirectoryKind::Artwork | DirectoryKind::Video | DirectoryKind::Info
        ) {
            dir.part_of_set = true;
        }
        dir
    }

    /// Drop all children without mutating anything on disk.
    fn release_children(&mut self) {
        self.audio_files.clear();
        self.artwork_files.clear();
        self.video_files.clear();
        self.text_files.clear();
    }

    /// Reconcile the audio files into a single consistent release.
    ///
    /// Decides between the audio kinds and fills the rolled-up identity.
    /// Fails fast on the first violation.
    fn reconcile_audio(&mut self) {
        self.audio_files.sort_by(|a, b| {
            a.info()
                .track_number
                .cmp(&b.info().track_number)
                .then_with(|| a.name().cmp(b.name()))
        });
        log::debug!("Got audio dir: {}", self.path.display());

        let non_audio =
            self.artwork_files.len() + self.video_files.len() + self.text_files.len();
        if non_audio > self.audio_files.len() {
            log::warn!(
                "Dir contains more non-audio files than audio files: {}",
                self.path.display()
            );
        }

        if self.name == STANDALONE_DIR_NAME {
            self.kind = DirectoryKind::AudioStandalone;
            self.standalone = true;
            return;
        }
        self.kind = DirectoryKind::AudioAlbum;

        let mut last_track: Option<u32> = None;
        let mut album_id: Option<String> = None;
        let mut release_group_id: Option<String> = None;
        let mut num_tracks: Option<u32> = None;
        let mut num_discs: Option<u32> = None;
        let mut disc_number: Option<u32> = None;
        let mut album_gain: Option<f64> = None;
        let mut album_peak: Option<f64> = None;

        for file in &self.audio_files {
            let info = file.info();
            let Some(track_number) = info.track_number else {
                log::error!("Track without a track number: {}", file.path().display());
                self.errors.push(ErrorKind::Inconsistent);
                return;
            };
            match last_track {
                // An album may start at track 0 (hidden track one audio).
                None if track_number > 1 => {
                    log::error!(
                        "Track out of order (missing track 1): {}",
                        file.path().display()
                    );
                    self.errors.push(ErrorKind::Inconsistent);
                    return;
                }
                None => last_track = Some(track_number),
                Some(last) if track_number == last => {
                    log::debug!("Duplicate track number: {}", file.path().display());
                    self.check_duplicates = true;
                }
                Some(last) if track_number != last + 1 => {
                    log::error!(
                        "Track out of order (missing track {}): {}",
                        last + 1,
                        file.path().display()
                    );
                    self.errors.push(ErrorKind::Inconsistent);
                    return;
                }
                Some(_) => last_track = Some(track_number),
            }
            if filename_track_prefix(file.name()) != Some(track_number) {
                log::error!(
                    "File name does not match track number {track_number}: {}",
                    file.path().display()
                );
                self.errors.push(ErrorKind::Inconsistent);
                return;
            }

            let consistent = roll(&mut album_id, &info.album_id)
                && roll(&mut release_group_id, &info.release_group_id)
                && roll(&mut num_tracks, &info.num_tracks)
                && roll(&mut num_discs, &info.num_discs)
                && roll(&mut disc_number, &info.disc_number);
            if !consistent {
                log::error!(
                    "Album metadata inconsistency (mixed releases): {}",
                    self.path.display()
                );
                self.errors.push(ErrorKind::Inconsistent);
                return;
            }
            if !roll(&mut album_gain, &info.album_gain)
                || !roll(&mut album_peak, &info.album_peak)
            {
                log::debug!(
                    "Inconsistent album gain, re-integrating: {}",
                    self.path.display()
                );
                self.needs_rgain = true;
            }
        }

        self.album_id = album_id;
        self.release_group_id = release_group_id;
        self.num_tracks = num_tracks;
        self.num_discs = num_discs;

        if self.num_discs.is_some_and(|discs| discs > 1) {
            self.part_of_set = true;
            self.kind = DirectoryKind::AudioDisc;
        }

        if self.album_id.is_none() {
            log::error!("Could not determine release: {}", self.path.display());
            self.errors.push(ErrorKind::MissingTags);
            return;
        }
        let Some(num_tracks) = self.num_tracks.filter(|&count| count > 0) else {
            log::error!(
                "Missing or zero track count: {}",
                self.path.display()
            );
            self.errors.push(ErrorKind::InvalidTags);
            return;
        };
        if self.release_group_id.is_none() {
            log::warn!(
                "Could not determine release group id: {}",
                self.path.display()
            );
        }

        let file_count = u32::try_from(self.audio_files.len()).unwrap_or(u32::MAX);
        if num_tracks < file_count {
            log::debug!("More files than tracks: {}", self.path.display());
            self.check_duplicates = true;
        } else if num_tracks == file_count + 1 {
            log::error!(
                "First or last track missing ({num_tracks}): {}",
                self.path.display()
            );
            self.errors.push(ErrorKind::Inconsistent);
            return;
        } else if num_tracks > file_count + 1 {
            log::warn!("More tracks than files: {}", self.path.display());
            self.partial_release = true;
        }

        if album_gain.is_none() || album_peak.is_none() {
            self.needs_rgain = true;
        }
    }

    /// Process a clean audio directory: rearrange auxiliary files, resolve
    /// duplicates, collect verification results and re-integrate album
    /// loudness.
    pub fn process(&mut self) {
        if !self.errors.is_empty() || !self.kind.is_audio() {
            return;
        }

        self.rearrange();

        if self.check_duplicates && !self.standalone {
            self.resolve_duplicates();
            if !self.errors.is_empty() {
                return;
            }
        }

        let mut rgain_failed = false;
        for file in &self.audio_files {
            if file.is_marked_for_deletion() {
                continue;
            }
            match file.status() {
                ErrorKind::Ok => {}
                ErrorKind::RgainFailed => rgain_failed = true,
                kind => {
                    self.errors.push(kind);
                    return;
                }
            }
        }

        if self.needs_rgain && !rgain_failed && !self.standalone {
            self.integrate_album_loudness();
        }
    }

    /// Move auxiliary files into their canonical subfolders.
    ///
    /// Artwork goes to `Artwork/` (except the canonical cover, and only
    /// when there is more than one image), text goes to `Info/`. Failures
    /// are logged and do not fail the directory.
    fn rearrange(&mut self) {
        if self.artwork_files.len() >= 2 {
            let artwork_dir = self.path.join("Artwork");
            self.move_artwork_files(&artwork_dir);
            self.artwork_files.clear();
        }
        if !self.text_files.is_empty() {
            let info_dir = self.path.join("Info");
            self.move_text_files(&info_dir);
            self.text_files.clear();
        }
    }

    /// Move the artwork files into `target`, skipping the cover.
    fn move_artwork_files(&self, target: &Path) {
        let files = self.artwork_files.iter().filter(|path| {
            path.file_name().and_then(|name| name.to_str()) != Some(COVER_FILE_NAME)
        });
        if self.ctx.options.dry_run {
            for file in files {
                log::info!("Would move {} to {}", file.display(), target.display());
            }
            return;
        }
        if let Err(err) = std::fs::create_dir_all(target) {
            log::error!("Could not create {}: {err}", target.display());
            return;
        }
        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let destination = target.join(name);
            log::info!("Moving {} to {}", file.display(), target.display());
            if let Err(err) = std::fs::rename(file, &destination) {
                log::error!("Failed to move {}: {err}", file.display());
            }
        }
    }

    /// Move the text files into `target`.
    fn move_text_files(&self, target: &Path) {
        if self.ctx.options.dry_run {
            for file in &self.text_files {
                log::info!("Would move {} to {}", file.display(), target.display());
            }
            return;
        }
        if let Err(err) = std::fs::create_dir_all(target) {
            log::error!("Could not create {}: {err}", target.display());
            return;
        }
        for file in &self.text_files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let destination = target.join(name);
            log::info!("Moving {} to {}", file.display(), target.display());
            if let Err(err) = std::fs::rename(file, &destination) {
                log::error!("Failed to move {}: {err}", file.display());
            }
        }
    }

    /// Resolve duplicate tracks: group by identity, keep the best of each
    /// group, mark the rest for deletion.
    fn resolve_duplicates(&mut self) {
        let groups: HashMap<_, Vec<usize>> = self
            .audio_files
            .iter()
            .enumerate()
            .map(|(index, file)| (file.info().identity(), index))
            .into_group_map();

        for indices in groups.into_values() {
            if indices.len() < 2 {
                continue;
            }
            let qualities: Vec<f64> = indices
                .iter()
                .filter_map(|&index| self.audio_files[index].quality())
                .collect();
            let scale = quality_scale(&qualities);

            let mut winner = indices[0];
            for &contender in &indices[1..] {
                let score = self.audio_files[contender].battle(
                    &self.audio_files[winner],
                    scale,
                    self.ctx.catalog.as_ref(),
                );
                match score {
                    None => {
                        log::error!(
                            "Duplicate tracks with irreconcilable durations: {}",
                            self.path.display()
                        );
                        self.errors.push(ErrorKind::Inconsistent);
                        return;
                    }
                    Some(score) if score > 0.0 => winner = contender,
                    Some(_) => {}
                }
            }
            for &index in &indices {
                if index != winner {
                    log::info!(
                        "Duplicate loses to {}: {}",
                        self.audio_files[winner].name(),
                        self.audio_files[index].path().display()
                    );
                    self.audio_files[index].mark_for_deletion();
                }
            }
        }
    }

    /// Re-integrate the album loudness from the per-track measurements and
    /// write the result into every surviving track.
    fn integrate_album_loudness(&mut self) {
        let mut tracks = Vec::new();
        for file in &self.audio_files {
            if file.is_marked_for_deletion() {
                continue;
            }
            let info = file.info();
            let (Some(iloud), Some(rthres), Some(peak)) =
                (info.track_iloud, info.track_rthres, info.track_peak)
            else {
                log::debug!(
                    "Missing per-track loudness, skipping album gain: {}",
                    self.path.display()
                );
                return;
            };
            tracks.push(TrackLoudness {
                iloud,
                rthres,
                total_frames: info.total_frames,
                peak,
            });
        }

        let Some(album) = loudness::integrate_album(&tracks) else {
            log::debug!(
                "Album loudness not integrable: {}",
                self.path.display()
            );
            return;
        };
        log::debug!(
            "ReplayGain info for disc {}: gain {:.2} dB, peak {:.6}",
            self.name,
            album.gain,
            album.peak
        );
        for file in &mut self.audio_files {
            if !file.is_marked_for_deletion() {
                file.write_album_gain(album.gain, album.peak);
            }
        }
    }

    /// Register a surviving release under its own path.
    ///
    /// Set members do not register themselves; their identifiers travel to
    /// the parent via [`Directory::registration`] so that a failing
    /// sibling suppresses the whole set. The returned kind is for
    /// reporting only and never triggers a withdrawal.
    pub fn register(&self, index: &IndexStore) -> ErrorKind {
        if !self.errors.is_empty() {
            return self.worst();
        }
        if self.part_of_set
            || !matches!(
                self.kind,
                DirectoryKind::AudioAlbum | DirectoryKind::AudioDisc
            )
        {
            return ErrorKind::Ok;
        }
        let (Some(release_group_id), Some(album_id)) =
            (&self.release_group_id, &self.album_id)
        else {
            return ErrorKind::MissingTags;
        };
        if let Err(err) = index.add_album(&self.path, release_group_id, album_id) {
            log::error!("Failed to index {}: {err}", self.path.display());
            return ErrorKind::DbError;
        }
        ErrorKind::Ok
    }

    /// Identifiers a clean set member contributes to its parent's
    /// registration.
    #[must_use]
    pub fn registration(&self) -> Option<(String, String)> {
        if !self.errors.is_empty()
            || !matches!(
                self.kind,
                DirectoryKind::AudioAlbum | DirectoryKind::AudioDisc
            )
        {
            return None;
        }
        self.release_group_id.clone().zip(self.album_id.clone())
    }

    /// Move the directory's contents into the junkyard.
    pub fn withdraw(&mut self, junkyard: &Path) {
        if self.withdrawn || self.errors.is_empty() {
            return;
        }
        let worst = self.worst();
        if let Some(destination) = junkyard::withdraw(&self.path, worst, junkyard, self.ctx.options)
        {
            self.new_path = Some(destination);
            self.withdrawn = true;
        }
    }

    /// Close all children and seal a clean audio directory.
    pub fn finalize(mut self) {
        let failed = !self.errors.is_empty() || self.withdrawn;
        for file in std::mem::take(&mut self.audio_files) {
            let _ = file.close(failed);
        }
        if !failed && self.kind.is_audio() && self.ctx.options.may_mutate() {
            vcache::remove_group_write(&self.path);
        }
    }

    /// Path of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base name of the directory.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The decided kind.
    #[must_use]
    pub fn kind(&self) -> DirectoryKind {
        self.kind
    }

    /// Returns `true` if this directory is one part of a larger release.
    #[must_use]
    pub fn part_of_set(&self) -> bool {
        self.part_of_set
    }

    /// Returns `true` if the release announces more tracks than are
    /// present on disk.
    #[must_use]
    pub fn is_partial_release(&self) -> bool {
        self.partial_release
    }

    /// Collected errors.
    #[must_use]
    pub fn errors(&self) -> &[ErrorKind] {
        &self.errors
    }

    /// Append an error reported by a child that is part of this set.
    pub fn push_error(&mut self, kind: ErrorKind) {
        self.errors.push(kind);
    }

    /// The most severe collected error.
    #[must_use]
    pub fn worst(&self) -> ErrorKind {
        pick_worst(&self.errors)
    }

    /// Returns `true` if the directory has a non-empty error bag.
    #[must_use]
    pub fn should_withdraw(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns `true` once the contents were moved to the junkyard.
    #[must_use]
    pub fn is_withdrawn(&self) -> bool {
        self.withdrawn
    }

    /// Location after withdrawal.
    #[must_use]
    pub fn new_path(&self) -> Option<&Path> {
        self.new_path.as_deref()
    }
}

/// Normalization scale for a duplicate group: mean plus population
/// standard deviation of the available quality values.
fn quality_scale(qualities: &[f64]) -> f64 {
    if qualities.is_empty() {
        return 1.0;
    }
    let n = qualities.len() as f64;
    let mean = qualities.iter().sum::<f64>() / n;
    let variance = qualities
        .iter()
        .map(|quality| (quality - mean).powi(2))
        .sum::<f64>()
        / n;
    mean + variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::tags::{TagDialect, TagField};
    use crate::testing::{fake_context, fresh_probe, FakeAnalyzer, FakeTagStoreFactory};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn tempdir() -> TempDir {
        tempfile::tempdir_in(env!("CARGO_MANIFEST_DIR")).expect("failed to create temp dir")
    }

    /// Write a minimal FLAC-looking file.
    fn write_flac(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"fLaC\x00\x00\x00\x22").unwrap();
        path
    }

    /// Identity tags of track `n` out of `total` on disc 1/1.
    fn album_tags(n: u32, total: u32) -> Vec<(TagField, String)> {
        vec![
            (TagField::TrackNumber, n.to_string()),
            (TagField::TotalTracks, total.to_string()),
            (TagField::DiscNumber, "1".to_string()),
            (TagField::TotalDiscs, "1".to_string()),
            (TagField::AlbumId, "album-x".to_string()),
            (TagField::ReleaseGroupId, "group-g".to_string()),
        ]
    }

    fn seed_album_track(factory: &FakeTagStoreFactory, name: &str, n: u32, total: u32) {
        let tags = album_tags(n, total);
        let pairs: Vec<(TagField, &str)> = tags
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
            .collect();
        factory.seed(name, TagDialect::VorbisComment, &pairs);
    }

    async fn build_album(
        dir: &Path,
        names: &[&str],
        analyzer: FakeAnalyzer,
        factory: Arc<FakeTagStoreFactory>,
    ) -> Directory {
        let files = names.iter().map(|name| dir.join(name)).collect();
        let ctx = fake_context(Options::default(), analyzer, factory);
        Directory::build(dir.to_path_buf(), files, false, ctx).await
    }

    #[tokio::test]
    async fn test_happy_album() {
        let root = tempdir();
        let album = root.path().join("Artist").join("Album");
        fs::create_dir_all(&album).unwrap();
        let names = ["01 A.flac", "02 B.flac", "03 C.flac"];
        let factory = Arc::new(FakeTagStoreFactory::new());
        let mut analyzer = FakeAnalyzer::new();
        for (i, name) in names.iter().enumerate() {
            write_flac(&album, name);
            seed_album_track(&factory, name, u32::try_from(i).unwrap() + 1, 3);
            analyzer = analyzer.with_probe(name, fresh_probe("flac", -20.0));
        }

        let mut dir = build_album(&album, &names, analyzer, Arc::clone(&factory)).await;
        assert_eq!(dir.kind(), DirectoryKind::AudioAlbum);
        assert!(dir.errors().is_empty());
        assert!(!dir.part_of_set());
        assert!(dir.needs_rgain);

        dir.process();
        assert!(dir.errors().is_empty());
        dir.finalize();

        // Tags were persisted with track and album replay-gain values.
        for name in names {
            let state = factory
                .saved_state(&album.join(name))
                .expect("tags were saved");
            let key = TagDialect::VorbisComment.key(TagField::TrackGain);
            assert_eq!(state.values.get(key).map(String::as_str), Some("2.00 dB"));
            let album_gain_key = TagDialect::VorbisComment.key(TagField::AlbumGain);
            assert_eq!(
                state.values.get(album_gain_key).map(String::as_str),
                // Identical tracks, so the album gain is the track gain
                // plus the calibration offset.
                Some("1.95 dB")
            );
        }

        // Verification stamps are in place.
        for name in names {
            assert!(
                !crate::vcache::needs_check(&album.join(name), Options::default()).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_track_gap_is_inconsistent() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir_all(&album).unwrap();
        let names = ["01 A.flac", "03 C.flac"];
        let factory = Arc::new(FakeTagStoreFactory::new());
        let mut analyzer = FakeAnalyzer::new();
        for name in names {
            write_flac(&album, name);
            analyzer = analyzer.with_probe(name, fresh_probe("flac", -20.0));
        }
        seed_album_track(&factory, "01 A.flac", 1, 2);
        seed_album_track(&factory, "03 C.flac", 3, 2);

        let dir = build_album(&album, &names, analyzer, factory).await;
        assert_eq!(dir.errors(), &[ErrorKind::Inconsistent]);
    }

    #[tokio::test]
    async fn test_filename_mismatch_is_inconsistent() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir_all(&album).unwrap();
        let names = ["02 A.flac"];
        let factory = Arc::new(FakeTagStoreFactory::new());
        let analyzer = FakeAnalyzer::new().with_probe("02 A.flac", fresh_probe("flac", -20.0));
        write_flac(&album, "02 A.flac");
        // Tagged as track 1 but named "02 ...".
        seed_album_track(&factory, "02 A.flac", 1, 1);

        let dir = build_album(&album, &names, analyzer, factory).await;
        assert_eq!(dir.errors(), &[ErrorKind::Inconsistent]);
    }

    #[tokio::test]
    async fn test_mixed_releases_are_inconsistent() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir_all(&album).unwrap();
        let names = ["01 A.flac", "02 B.flac"];
        let factory = Arc::new(FakeTagStoreFactory::new());
        let mut analyzer = FakeAnalyzer::new();
        for name in names {
            write_flac(&album, name);
            analyzer = analyzer.with_probe(name, fresh_probe("flac", -20.0));
        }
        seed_album_track(&factory, "01 A.flac", 1, 2);
        factory.seed(
            "02 B.flac",
            TagDialect::VorbisComment,
            &[
                (TagField::TrackNumber, "2"),
                (TagField::TotalTracks, "2"),
                (TagField::DiscNumber, "1"),
                (TagField::TotalDiscs, "1"),
                (TagField::AlbumId, "album-other"),
                (TagField::ReleaseGroupId, "group-g"),
            ],
        );

        let dir = build_album(&album, &names, analyzer, factory).await;
        assert_eq!(dir.errors(), &[ErrorKind::Inconsistent]);
    }

    #[tokio::test]
    async fn test_missing_album_id() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir_all(&album).unwrap();
        let names = ["01 A.flac"];
        let factory = Arc::new(FakeTagStoreFactory::new());
        let analyzer = FakeAnalyzer::new().with_probe("01 A.flac", fresh_probe("flac", -20.0));
        write_flac(&album, "01 A.flac");
        factory.seed(
            "01 A.flac",
            TagDialect::VorbisComment,
            &[
                (TagField::TrackNumber, "1"),
                (TagField::TotalTracks, "1"),
                (TagField::TotalDiscs, "2"),
                (TagField::DiscNumber, "2"),
                (TagField::ReleaseGroupId, "group-g"),
            ],
        );

        let dir = build_album(&album, &names, analyzer, factory).await;
        assert_eq!(dir.errors(), &[ErrorKind::MissingTags]);
        // The disc count was read before the failure, so the withdrawal
        // escalates to the parent.
        assert!(dir.part_of_set());
        assert_eq!(dir.kind(), DirectoryKind::AudioDisc);
    }

    #[tokio::test]
    async fn test_marker_short_circuits_to_ignored() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir_all(&album).unwrap();
        write_flac(&album, "01 A.flac");
        fs::write(album.join("ignore"), b"").unwrap();
        let factory = Arc::new(FakeTagStoreFactory::new());
        let analyzer = FakeAnalyzer::new().with_probe("01 A.flac", fresh_probe("flac", -20.0));

        let dir = build_album(&album, &["01 A.flac", "ignore"], analyzer, factory).await;
        assert_eq!(dir.kind(), DirectoryKind::Ignored);
        assert_eq!(dir.errors(), &[ErrorKind::Ignore]);
    }

    #[tokio::test]
    async fn test_bad_sample_rate_fails_processing() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir_all(&album).unwrap();
        write_flac(&album, "01 A.flac");
        let mut probe = fresh_probe("flac", -20.0);
        probe.sample_rate = 22_050;
        let factory = Arc::new(FakeTagStoreFactory::new());
        seed_album_track(&factory, "01 A.flac", 1, 1);
        let analyzer = FakeAnalyzer::new().with_probe("01 A.flac", probe);

        let mut dir = build_album(&album, &["01 A.flac"], analyzer, factory).await;
        assert!(dir.errors().is_empty());
        dir.process();
        assert_eq!(dir.errors(), &[ErrorKind::InvalidSampleRate]);
        assert_eq!(dir.worst(), ErrorKind::InvalidSampleRate);
    }

    #[tokio::test]
    async fn test_corrupted_stream_fails_directory() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir_all(&album).unwrap();
        write_flac(&album, "01 A.flac");
        let factory = Arc::new(FakeTagStoreFactory::new());
        seed_album_track(&factory, "01 A.flac", 1, 1);
        // The header parses but the stream is truncated.
        let analyzer = FakeAnalyzer::new().with_error("01 A.flac", || {
            let mut partial = fresh_probe("flac", -20.0);
            partial.rg2_gain = None;
            partial.sample_peak = None;
            partial.ebur128_lra = None;
            partial.ebur128_iloud = None;
            partial.relative_threshold = None;
            crate::analyzer::AnalyzerError::codec("truncated stream", Some(partial))
        });

        let mut dir = build_album(&album, &["01 A.flac"], analyzer, factory).await;
        // The file is retained; the failure surfaces during processing.
        assert!(dir.errors().is_empty());
        dir.process();
        assert_eq!(dir.errors(), &[ErrorKind::Corrupted]);
    }

    #[tokio::test]
    async fn test_lost_loudness_is_not_fatal() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir_all(&album).unwrap();
        write_flac(&album, "01 A.flac");
        let factory = Arc::new(FakeTagStoreFactory::new());
        seed_album_track(&factory, "01 A.flac", 1, 1);
        let analyzer = FakeAnalyzer::new().with_error("01 A.flac", || {
            let mut partial = fresh_probe("flac", -20.0);
            partial.rg2_gain = None;
            partial.ebur128_iloud = None;
            partial.relative_threshold = None;
            crate::analyzer::AnalyzerError::ebur128("loudness analysis failed", Some(partial))
        });

        let mut dir = build_album(&album, &["01 A.flac"], analyzer, factory).await;
        assert!(dir.errors().is_empty());
        dir.process();
        // The album-gain step is disabled but the directory survives.
        assert!(dir.errors().is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_resolved_by_quality() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir_all(&album).unwrap();
        let flac_path = write_flac(&album, "01 Track.flac");
        let mp3_path = album.join("01 Track.mp3");
        fs::write(&mp3_path, [0xFFu8, 0xFB, 0x90, 0x00]).unwrap();

        let factory = Arc::new(FakeTagStoreFactory::new());
        seed_album_track(&factory, "01 Track.flac", 1, 1);
        let tags = album_tags(1, 1);
        let pairs: Vec<(TagField, &str)> = tags
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
            .collect();
        factory.seed("01 Track.mp3", TagDialect::Id3v2, &pairs);

        let mut mp3_probe = fresh_probe("mp3", -20.0);
        mp3_probe.bit_rate = 320_000;
        let analyzer = FakeAnalyzer::new()
            .with_probe("01 Track.flac", fresh_probe("flac", -20.0))
            .with_probe("01 Track.mp3", mp3_probe);

        let mut dir = build_album(
            &album,
            &["01 Track.flac", "01 Track.mp3"],
            analyzer,
            factory,
        )
        .await;
        assert!(dir.errors().is_empty());
        assert!(dir.check_duplicates);

        dir.process();
        assert!(dir.errors().is_empty());
        dir.finalize();

        // The FLAC survives, the MP3 is deleted.
        assert!(flac_path.exists());
        assert!(!mp3_path.exists());
    }

    #[tokio::test]
    async fn test_artwork_rearrangement() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir_all(&album).unwrap();
        write_flac(&album, "01 A.flac");
        fs::write(album.join("album_cover.jpg"), [0xFF, 0xD8, 0xFF, 0xE0]).unwrap();
        fs::write(album.join("back.jpg"), [0xFF, 0xD8, 0xFF, 0xE0]).unwrap();
        fs::write(album.join("rip.log"), b"EAC extraction logfile\n").unwrap();

        let factory = Arc::new(FakeTagStoreFactory::new());
        seed_album_track(&factory, "01 A.flac", 1, 1);
        let analyzer = FakeAnalyzer::new().with_probe("01 A.flac", fresh_probe("flac", -20.0));

        let mut dir = build_album(
            &album,
            &["01 A.flac", "album_cover.jpg", "back.jpg", "rip.log"],
            analyzer,
            factory,
        )
        .await;
        assert_eq!(dir.kind(), DirectoryKind::AudioAlbum);
        dir.process();
        assert!(dir.errors().is_empty());

        // The cover stays, the rest moves into the canonical subfolders.
        assert!(album.join("album_cover.jpg").exists());
        assert!(album.join("Artwork").join("back.jpg").exists());
        assert!(album.join("Info").join("rip.log").exists());
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let root = tempdir();
        let empty = root.path().join("Empty");
        fs::create_dir_all(&empty).unwrap();
        let factory = Arc::new(FakeTagStoreFactory::new());
        let ctx = fake_context(Options::default(), FakeAnalyzer::new(), factory);
        let dir = Directory::build(empty, Vec::new(), false, ctx).await;
        assert_eq!(dir.kind(), DirectoryKind::Empty);
        assert_eq!(dir.errors(), &[ErrorKind::Empty]);
    }

    #[tokio::test]
    async fn test_artwork_only_directory_is_part_of_set() {
        let root = tempdir();
        let artwork = root.path().join("Artwork");
        fs::create_dir_all(&artwork).unwrap();
        fs::write(artwork.join("front.jpg"), [0xFF, 0xD8, 0xFF, 0xE0]).unwrap();
        let factory = Arc::new(FakeTagStoreFactory::new());
        let ctx = fake_context(Options::default(), FakeAnalyzer::new(), factory);
        let dir = Directory::build(
            artwork.clone(),
            vec![artwork.join("front.jpg")],
            false,
            ctx,
        )
        .await;
        assert_eq!(dir.kind(), DirectoryKind::Artwork);
        assert!(dir.part_of_set());
    }

    #[tokio::test]
    async fn test_standalone_directory_skips_checks() {
        let root = tempdir();
        let standalone = root.path().join("Standalone Recordings");
        fs::create_dir_all(&standalone).unwrap();
        let names = ["Some Song.flac", "Other Song.flac"];
        let factory = Arc::new(FakeTagStoreFactory::new());
        let mut analyzer = FakeAnalyzer::new();
        for name in names {
            write_flac(&standalone, name);
            analyzer = analyzer.with_probe(name, fresh_probe("flac", -20.0));
        }

        let mut dir = build_album(&standalone, &names, analyzer, factory).await;
        assert_eq!(dir.kind(), DirectoryKind::AudioStandalone);
        assert!(dir.errors().is_empty());
        dir.process();
        assert!(dir.errors().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_file_fails_directory() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir_all(&album).unwrap();
        write_flac(&album, "01 A.flac");
        fs::write(album.join("garbage.qqq"), [0u8, 255, 17]).unwrap();
        let factory = Arc::new(FakeTagStoreFactory::new());
        seed_album_track(&factory, "01 A.flac", 1, 1);
        let analyzer = FakeAnalyzer::new().with_probe("01 A.flac", fresh_probe("flac", -20.0));

        let dir = build_album(&album, &["01 A.flac", "garbage.qqq"], analyzer, factory).await;
        assert_eq!(dir.kind(), DirectoryKind::Failed);
        assert_eq!(dir.worst(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_quality_scale() {
        use float_eq::assert_float_eq;
        assert_float_eq!(quality_scale(&[]), 1.0, abs <= f64::EPSILON);
        assert_float_eq!(quality_scale(&[2.0]), 2.0, abs <= f64::EPSILON);
        // Mean 2.0, population stdev 1.0.
        assert_float_eq!(quality_scale(&[1.0, 3.0]), 3.0, abs <= 1e-12);
    }
}
