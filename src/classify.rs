// Copyright (c) 2025 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! File classification: decide the semantic category of a directory entry
//! from its extension and a content sniff.

use crate::track::AudioCodec;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Semantic category of a library file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatCategory {
    /// An audio track.
    Audio,
    /// A music video or similar.
    Video,
    /// Cover art, booklet scans, PDF booklets.
    Artwork,
    /// Accompanying text (rip logs, cue sheets, notes).
    Text,
    /// A `lock`/`locked`/`ignore` marker file.
    Marker,
}

/// File names that act as directory markers.
const MARKER_NAMES: [&str; 3] = ["lock", "locked", "ignore"];

/// Returns `true` if a file name is one of the directory markers.
#[must_use]
pub fn is_marker_name(name: &str) -> bool {
    MARKER_NAMES.contains(&name)
}

/// Number of leading bytes consulted by the content sniff.
const SNIFF_LEN: usize = 8192;

/// Guess a MIME type from the file extension.
///
/// The closed audio codec table takes precedence so that the library's own
/// formats never depend on the guesser's database (WavPack in particular is
/// missing from common extension maps).
fn extension_mime(path: &Path) -> Option<String> {
    let ext = path.extension().and_then(|ext| ext.to_str())?;
    if let Some(codec) = AudioCodec::from_extension(ext) {
        return Some(codec.mime_type().to_string());
    }
    mime_guess::from_path(path)
        .first_raw()
        .map(ToString::to_string)
}

/// Sniff a MIME type from the file contents.
///
/// Mirrors the subset of libmagic behavior the classification rules rely
/// on: known magic numbers, an explicit empty-file marker, and a plain-text
/// fallback for valid UTF-8.
fn sniff_mime(path: &Path) -> std::io::Result<String> {
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut file = File::open(path)?;
    let mut filled = 0;
    loop {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    buf.truncate(filled);

    if buf.is_empty() {
        return Ok("inode/x-empty".to_string());
    }
    if buf.starts_with(b"wvpk") {
        return Ok("audio/x-wavpack".to_string());
    }
    if let Some(kind) = infer::get(&buf) {
        return Ok(kind.mime_type().to_string());
    }
    if std::str::from_utf8(&buf).is_ok() {
        return Ok("text/plain".to_string());
    }
    Ok("application/octet-stream".to_string())
}

/// Split a MIME string into its major and minor part.
fn split_mime(mime: &str) -> (&str, &str) {
    mime.split_once('/').unwrap_or((mime, ""))
}

/// Returns `true` if the two minor types only differ by an `x-` prefix.
fn minor_matches_modulo_x(lhs: &str, rhs: &str) -> bool {
    lhs == rhs
        || lhs.strip_prefix("x-").is_some_and(|l| l == rhs)
        || rhs.strip_prefix("x-").is_some_and(|r| r == lhs)
}

/// Map an agreed-upon MIME type to a category.
fn category_from_mime(mime: &str) -> Option<FormatCategory> {
    let (major, _minor) = split_mime(mime);
    match major {
        "audio" => Some(FormatCategory::Audio),
        "image" => Some(FormatCategory::Artwork),
        "application" if mime == "application/pdf" => Some(FormatCategory::Artwork),
        "text" => Some(FormatCategory::Text),
        "video" => Some(FormatCategory::Video),
        _ => None,
    }
}

/// Classify a single file.
///
/// Returns `None` for unsupported files; the caller treats that as an
/// invalid format. Disagreements between extension and content are resolved
/// with a set of warn-only policies so that sloppy but recoverable files do
/// not take their whole album with them.
pub fn classify(path: &Path) -> std::io::Result<Option<FormatCategory>> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    if MARKER_NAMES.contains(&name) {
        log::info!("Got marker file: {}", path.display());
        return Ok(Some(FormatCategory::Marker));
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let Some(guessed) = extension_mime(path) else {
        if extension.as_deref() == Some("accurip") {
            return Ok(Some(FormatCategory::Text));
        }
        log::error!("Unknown file extension: {}", path.display());
        return Ok(None);
    };
    let sniffed = sniff_mime(path)?;

    let (guessed_major, guessed_minor) = split_mime(&guessed);
    let (sniffed_major, sniffed_minor) = split_mime(&sniffed);

    if guessed == sniffed || guessed_major == sniffed_major {
        if guessed != sniffed && !minor_matches_modulo_x(guessed_minor, sniffed_minor) {
            log::warn!(
                "Inconsistent file extension: {} (is {sniffed} vs {guessed})",
                path.display()
            );
        }
        return Ok(category_from_mime(&guessed));
    }

    // Majors disagree, apply the non-fatal policies in order.
    if guessed == "text/plain" && sniffed == "inode/x-empty" {
        log::debug!("Empty text file: {}", path.display());
        return Ok(Some(FormatCategory::Text));
    }
    if guessed == "text/plain" || sniffed == "text/plain" {
        log::warn!(
            "Inconsistent text file: {} (is {sniffed} vs {guessed})",
            path.display()
        );
        return Ok(Some(FormatCategory::Text));
    }
    if extension.as_deref() == Some("mp3") {
        if sniffed == "application/octet-stream" {
            // MP3 data may start anywhere in the file, so a missing header
            // is not conclusive. The stream probe will have the final say.
            log::debug!("Headerless mp3: {}", path.display());
            return Ok(Some(FormatCategory::Audio));
        }
        log::warn!(
            "Inconsistent magic value on mp3: {} (is {sniffed} vs {guessed})",
            path.display()
        );
        return Ok(Some(FormatCategory::Audio));
    }

    log::error!(
        "Inconsistent file format: {} (is {sniffed} vs {guessed})",
        path.display()
    );
    Ok(None)
}
