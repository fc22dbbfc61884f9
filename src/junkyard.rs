// Copyright (c) 2025 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! The junkyard: quarantine area for failed directories.
//!
//! A withdrawn directory lands under `<junkyard>/<error name>/<basename>`,
//! with a `" (i)"` suffix when two failing directories share a name. Moves
//! are per-entry and atomic; failures are logged but never escalate, the
//! next run will retry whatever was left behind.

use crate::error::ErrorKind;
use crate::options::Options;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Create a destination for `name` under the category folder, appending
/// `" (i)"` with the smallest free `i >= 1` on collision.
///
/// The final component is claimed with a plain `create_dir`, so two
/// concurrent withdrawals of equally-named directories cannot end up
/// merged into one.
fn claim_destination(category_dir: &Path, name: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(category_dir)?;
    let mut candidate = name.to_string();
    let mut i = 1;
    loop {
        let destination = category_dir.join(&candidate);
        match fs::create_dir(&destination) {
            Ok(()) => return Ok(destination),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                candidate = format!("{name} ({i})");
                i += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Move a single directory entry, falling back to copy-and-persist for
/// files when a plain rename crosses filesystems.
fn move_entry(source: &Path, destination: &Path) -> io::Result<()> {
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    if source.is_dir() {
        // Directories are only ever moved within the library filesystem;
        // a failed rename is not worth a recursive copy.
        return Err(io::Error::other(format!(
            "failed to rename directory {}",
            source.display()
        )));
    }
    let dest_dir = destination
        .parent()
        .ok_or_else(|| io::Error::other("destination has no parent directory"))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".lguard.")
        .suffix(".tmp")
        .tempfile_in(dest_dir)?;
    let mut source_file = File::open(source)?;
    let _ = io::copy(&mut source_file, temp.as_file_mut())?;
    temp.into_temp_path()
        .persist(destination)
        .map_err(|err| err.error)?;
    fs::remove_file(source)?;
    Ok(())
}

/// Flush a directory's entries to disk.
fn sync_dir(path: &Path) {
    if let Err(err) = File::open(path).and_then(|dir| dir.sync_all()) {
        log::debug!("Failed to sync {}: {err}", path.display());
    }
}

/// Withdraw the contents of `path` into the junkyard under the category of
/// `worst`.
///
/// Returns the new location, or `None` if nothing was moved (dry run or
/// failure to prepare the destination). The source directory is removed
/// once it is empty.
pub fn withdraw(
    path: &Path,
    worst: ErrorKind,
    junkyard: &Path,
    options: Options,
) -> Option<PathBuf> {
    let name = path.file_name().and_then(|name| name.to_str())?;
    let category_dir = junkyard.join(worst.human_name());

    if options.dry_run {
        log::info!(
            "Would move {} to {} ({worst})",
            path.display(),
            category_dir.join(name).display()
        );
        return None;
    }

    let destination = match claim_destination(&category_dir, name) {
        Ok(destination) => destination,
        Err(err) => {
            log::error!(
                "Could not create junkyard directory for {name}: {err}"
            );
            return None;
        }
    };
    log::info!("Moving {}/* to {}/*", path.display(), destination.display());

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) => {
            log::error!("Could not read {}: {err}", path.display());
            return None;
        }
    };
    for entry in entries.filter_map(Result::ok) {
        let target = destination.join(entry.file_name());
        if let Err(err) = move_entry(&entry.path(), &target) {
            log::error!(
                "Failed to move {} to {}: {err}",
                entry.path().display(),
                target.display()
            );
        }
    }
    sync_dir(&destination);

    match fs::read_dir(path).map(|mut entries| entries.next().is_none()) {
        Ok(true) => {
            if let Err(err) = fs::remove_dir(path) {
                log::warn!("Failed to remove {}: {err}", path.display());
            }
        }
        Ok(false) => {
            log::warn!("Directory not empty after withdrawal: {}", path.display());
        }
        Err(err) => {
            log::warn!("Could not re-read {}: {err}", path.display());
        }
    }

    Some(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tempdir() -> TempDir {
        tempfile::tempdir_in(env!("CARGO_MANIFEST_DIR")).expect("failed to create temp dir")
    }

    #[test]
    fn test_withdraw_moves_children_and_removes_source() {
        let root = tempdir();
        let album = root.path().join("Best of");
        fs::create_dir_all(album.join("Disc 1")).unwrap();
        fs::write(album.join("01 Intro.flac"), b"fLaC").unwrap();
        fs::write(album.join("Disc 1").join("01 Same.flac"), b"fLaC").unwrap();
        let junk = root.path().join(".junk");

        let dest = withdraw(&album, ErrorKind::Corrupted, &junk, Options::default())
            .expect("withdrawal happened");
        assert_eq!(dest, junk.join("Corrupted").join("Best of"));
        assert!(dest.join("01 Intro.flac").exists());
        assert!(dest.join("Disc 1").join("01 Same.flac").exists());
        assert!(!album.exists());
    }

    #[test]
    fn test_withdraw_name_collision_appends_suffix() {
        let root = tempdir();
        let junk = root.path().join(".junk");
        for i in 0..3 {
            let album = root.path().join("Best of");
            fs::create_dir(&album).unwrap();
            fs::write(album.join("track.flac"), b"fLaC").unwrap();
            let dest = withdraw(&album, ErrorKind::Inconsistent, &junk, Options::default())
                .expect("withdrawal happened");
            let expected = if i == 0 {
                "Best of".to_string()
            } else {
                format!("Best of ({i})")
            };
            assert_eq!(dest, junk.join("Inconsistent").join(expected));
        }
    }

    #[test]
    fn test_dry_run_moves_nothing() {
        let root = tempdir();
        let album = root.path().join("Album");
        fs::create_dir(&album).unwrap();
        fs::write(album.join("track.flac"), b"fLaC").unwrap();
        let junk = root.path().join(".junk");

        let options = Options {
            dry_run: true,
            ..Options::default()
        };
        assert_eq!(withdraw(&album, ErrorKind::Empty, &junk, options), None);
        assert!(album.join("track.flac").exists());
        assert!(!junk.exists());
    }
}
