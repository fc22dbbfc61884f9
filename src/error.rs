// Copyright (c) 2025 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Error and result types.

use std::fmt;
use std::io;
use thiserror::Error;

/// Classified failure of a file or directory.
///
/// The discriminant doubles as the process exit code, so the values are
/// stable. Severity ordering for directory-level decisions is a separate
/// concern, see [`pick_worst`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    /// No error.
    Ok = 0,
    /// The file format could not be determined or is unsupported.
    InvalidFormat = 1,
    /// The tag container could not be parsed.
    InvalidTags = 2,
    /// Mandatory tags (e.g. the release identifier) are absent.
    MissingTags = 3,
    /// Sibling tracks disagree on release identity, numbering or naming.
    Inconsistent = 4,
    /// The audio stream failed its integrity check.
    Corrupted = 5,
    /// Sample rate below the library minimum.
    InvalidSampleRate = 6,
    /// Bit rate below the per-codec minimum.
    InvalidBitRate = 7,
    /// Bit depth below the library minimum.
    InvalidBitDepth = 8,
    /// Loudness analysis failed, the track is usable but gain data is lost.
    RgainFailed = 9,
    /// The directory contains no entries.
    Empty = 10,
    /// An ignore marker was found, the subtree is skipped.
    Ignore = 11,
    /// The directory could not be read.
    AccessDenied = 12,
    /// The index database reported an error.
    DbError = 13,
    /// Processing was interrupted by a termination request.
    Terminate = 14,
    /// Unclassified failure.
    Unknown = 15,
}

impl ErrorKind {
    /// Human-readable name, also used as the quarantine category folder.
    #[must_use]
    pub fn human_name(self) -> &'static str {
        match self {
            Self::Ok => "No error",
            Self::InvalidFormat => "Invalid format",
            Self::InvalidTags => "Invalid tags",
            Self::MissingTags => "Missing tags",
            Self::Inconsistent => "Inconsistent",
            Self::Corrupted => "Corrupted",
            Self::InvalidSampleRate => "Invalid sampling rate",
            Self::InvalidBitRate => "Invalid bitrate",
            Self::InvalidBitDepth => "Invalid bit depth",
            Self::RgainFailed => "ReplayGain failed",
            Self::Empty => "Empty",
            Self::Ignore => "Ignored",
            Self::AccessDenied => "Access denied",
            Self::DbError => "Database error",
            Self::Terminate => "Terminated",
            Self::Unknown => "Unknown error",
        }
    }

    /// Returns `true` unless this is [`ErrorKind::Ok`].
    #[must_use]
    pub fn is_err(self) -> bool {
        self != Self::Ok
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.human_name())
    }
}

/// Severity order for directory-level withdrawal, worst first.
///
/// Kinds not listed here never drive a withdrawal decision on their own and
/// collapse to [`ErrorKind::Unknown`].
const WORST_ORDER: [ErrorKind; 7] = [
    ErrorKind::InvalidFormat,
    ErrorKind::InvalidTags,
    ErrorKind::MissingTags,
    ErrorKind::Inconsistent,
    ErrorKind::Corrupted,
    ErrorKind::InvalidSampleRate,
    ErrorKind::InvalidBitRate,
];

/// Select the most severe error out of a non-empty bag.
///
/// Returns [`ErrorKind::Unknown`] for a non-empty bag without a ranked
/// member and [`ErrorKind::Ok`] for an empty one.
#[must_use]
pub fn pick_worst(errors: &[ErrorKind]) -> ErrorKind {
    if errors.is_empty() {
        return ErrorKind::Ok;
    }
    WORST_ORDER
        .into_iter()
        .find(|kind| errors.contains(kind))
        .unwrap_or(ErrorKind::Unknown)
}

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration Error ({0})")]
    Config(#[from] crate::config::ConfigError),
    /// I/O Error.
    #[error("Input/Output error ({:?})", .0)]
    Io(#[from] io::Error),
    /// Index database failure.
    #[error("Index database error ({0})")]
    Index(#[from] rusqlite::Error),
    /// Tag container failure.
    #[error("Tag access failed ({0})")]
    Tag(#[from] crate::tags::TagError),
    /// An error occurred while probing an audio track.
    #[error("Audio analysis failed: {0}")]
    Analyzer(#[from] crate::analyzer::AnalyzerError),
    /// A file or directory failed a library check.
    #[error("Library check failed: {0}")]
    Check(ErrorKind),
}

/// Convenience type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_worst_empty_is_ok() {
        assert_eq!(pick_worst(&[]), ErrorKind::Ok);
    }

    #[test]
    fn test_pick_worst_singleton_is_idempotent() {
        for kind in WORST_ORDER {
            assert_eq!(pick_worst(&[kind]), kind);
        }
    }

    #[test]
    fn test_pick_worst_prefers_earlier_kind() {
        let bag = [
            ErrorKind::Corrupted,
            ErrorKind::MissingTags,
            ErrorKind::InvalidBitRate,
        ];
        assert_eq!(pick_worst(&bag), ErrorKind::MissingTags);
    }

    #[test]
    fn test_pick_worst_is_monotone() {
        let mut bag = vec![ErrorKind::InvalidSampleRate];
        let before = pick_worst(&bag);
        bag.push(ErrorKind::InvalidTags);
        let after = pick_worst(&bag);
        let rank = |kind| WORST_ORDER.iter().position(|&k| k == kind);
        assert!(rank(after) <= rank(before));
    }

    #[test]
    fn test_pick_worst_unranked_collapses_to_unknown() {
        assert_eq!(pick_worst(&[ErrorKind::RgainFailed]), ErrorKind::Unknown);
        assert_eq!(
            pick_worst(&[ErrorKind::Empty, ErrorKind::DbError]),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(ErrorKind::Ok as i32, 0);
        assert_eq!(ErrorKind::Inconsistent as i32, 4);
        assert_eq!(ErrorKind::Terminate as i32, 14);
    }
}
