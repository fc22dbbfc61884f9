// Copyright (c) 2025 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Verification cache.
//!
//! Files that passed a full check are stamped with an extended attribute
//! holding the mtime at the moment of verification. As long as the mtime
//! matches the stamp, later runs skip the expensive decode. Successful
//! verification also drops the group-write bit so that the radio automation
//! user cannot modify a vetted file by accident.

use crate::options::Options;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Extended attribute holding the verified mtime as decimal ASCII.
const VERIFICATION_TS_ATTR: &str = "user.lguard_verification_ts";

/// Group-write permission bit.
const GROUP_WRITE: u32 = 0o020;

/// Current mtime of the file, in whole seconds since the epoch.
fn mtime_secs(path: &Path) -> io::Result<u64> {
    let mtime = fs::metadata(path)?.modified()?;
    Ok(mtime
        .duration_since(UNIX_EPOCH)
        .map_err(|err| io::Error::other(err.to_string()))?
        .as_secs())
}

/// Read the stored verification stamp, if any.
fn read_stamp(path: &Path) -> Option<u64> {
    let raw = xattr::get(path, VERIFICATION_TS_ATTR).ok()??;
    std::str::from_utf8(&raw).ok()?.trim().parse().ok()
}

/// Returns `true` if the file must be (re-)verified.
///
/// A missing, malformed or stale stamp requires a check, as does the
/// force-check option.
pub fn needs_check(path: &Path, options: Options) -> io::Result<bool> {
    if options.force_check {
        return Ok(true);
    }
    let mtime = mtime_secs(path)?;
    match read_stamp(path) {
        Some(stamp) if stamp == mtime => {
            log::debug!("Verification stamp still valid: {}", path.display());
            Ok(false)
        }
        Some(_) => {
            log::debug!("File modified since last check: {}", path.display());
            Ok(true)
        }
        None => {
            log::debug!("No verification stamp present: {}", path.display());
            Ok(true)
        }
    }
}

/// Stamp a file as verified at its current mtime.
///
/// Flushes the file to disk first so the recorded mtime is final, then
/// drops the group-write bit. Failures here only cost a re-check on the
/// next run, so they are logged as warnings instead of propagated.
pub fn mark_verified(path: &Path) {
    if let Err(err) = File::open(path).and_then(|file| file.sync_all()) {
        log::warn!("Failed to sync {}: {err}", path.display());
    }
    match mtime_secs(path) {
        Ok(mtime) => {
            if let Err(err) = xattr::set(path, VERIFICATION_TS_ATTR, mtime.to_string().as_bytes())
            {
                log::warn!(
                    "Failed to update verification stamp on {}: {err}",
                    path.display()
                );
            } else {
                log::debug!("Updated verification stamp ({mtime}): {}", path.display());
            }
        }
        Err(err) => {
            log::warn!("Failed to stat {}: {err}", path.display());
        }
    }
    remove_group_write(path);
}

/// Drop the group-write bit from a file or directory mode.
///
/// Used on files after successful verification and on audio directories
/// after a clean finalization.
pub fn remove_group_write(path: &Path) {
    let result = fs::metadata(path).and_then(|meta| {
        let mut perms = meta.permissions();
        let mode = perms.mode();
        if mode & GROUP_WRITE == 0 {
            return Ok(());
        }
        perms.set_mode(mode & !GROUP_WRITE);
        fs::set_permissions(path, perms)
    });
    if let Err(err) = result {
        log::warn!(
            "Failed to remove group-write bit from {}: {err}",
            path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Temp dir inside the crate; `/tmp` is often tmpfs where user xattrs
    /// may be unavailable.
    fn tempdir() -> TempDir {
        tempfile::tempdir_in(env!("CARGO_MANIFEST_DIR")).expect("failed to create temp dir")
    }

    #[test]
    fn test_unstamped_file_needs_check() {
        let dir = tempdir();
        let path = dir.path().join("track.flac");
        fs::write(&path, b"fLaC").unwrap();
        assert!(needs_check(&path, Options::default()).unwrap());
    }

    #[test]
    fn test_stamp_roundtrip() {
        let dir = tempdir();
        let path = dir.path().join("track.flac");
        fs::write(&path, b"fLaC").unwrap();

        mark_verified(&path);
        assert!(!needs_check(&path, Options::default()).unwrap());

        // The stamp must match the mtime exactly.
        let stamp = read_stamp(&path).unwrap();
        assert_eq!(stamp, mtime_secs(&path).unwrap());
    }

    #[test]
    fn test_force_check_overrides_stamp() {
        let dir = tempdir();
        let path = dir.path().join("track.flac");
        fs::write(&path, b"fLaC").unwrap();

        mark_verified(&path);
        let options = Options {
            force_check: true,
            ..Options::default()
        };
        assert!(needs_check(&path, options).unwrap());
    }

    #[test]
    fn test_malformed_stamp_needs_check() {
        let dir = tempdir();
        let path = dir.path().join("track.flac");
        fs::write(&path, b"fLaC").unwrap();
        xattr::set(&path, VERIFICATION_TS_ATTR, b"not-a-number").unwrap();
        assert!(needs_check(&path, Options::default()).unwrap());
    }

    #[test]
    fn test_mark_verified_drops_group_write() {
        let dir = tempdir();
        let path = dir.path().join("track.flac");
        fs::write(&path, b"fLaC").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o664);
        fs::set_permissions(&path, perms).unwrap();

        mark_verified(&path);
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & GROUP_WRITE, 0);
    }

    #[test]
    fn test_modified_file_needs_check() {
        let dir = tempdir();
        let path = dir.path().join("track.flac");
        fs::write(&path, b"fLaC").unwrap();
        mark_verified(&path);

        // Pretend the stamp is from an earlier mtime.
        xattr::set(&path, VERIFICATION_TS_ATTR, b"1000").unwrap();
        assert!(needs_check(&path, Options::default()).unwrap());
    }
}
