// Copyright (c) 2025 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Library index.
//!
//! Surviving albums are recorded as `(release_group_id, path)` and
//! `(album_id, path)` pairs so that the same release living in two places
//! can be surfaced. The store deliberately refuses to insert a second
//! location and warns instead; deciding which copy wins is a job for a
//! human.

use parking_lot::ReentrantMutex;
use rusqlite::Connection;
use std::path::Path;

/// Schema applied on every open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS release_groups (
    id INTEGER PRIMARY KEY,
    releasegroup_id TEXT NOT NULL,
    path TEXT NOT NULL,
    UNIQUE(releasegroup_id, path)
);
CREATE TABLE IF NOT EXISTS albums (
    id INTEGER PRIMARY KEY,
    album_id TEXT NOT NULL,
    path TEXT NOT NULL,
    UNIQUE(album_id, path)
);
CREATE INDEX IF NOT EXISTS idx_releasegroup ON release_groups(releasegroup_id);
CREATE INDEX IF NOT EXISTS idx_album ON albums(album_id);
CREATE INDEX IF NOT EXISTS idx_rg_path ON release_groups(path);
CREATE INDEX IF NOT EXISTS idx_album_path ON albums(path);
";

/// The on-disk album index.
///
/// A single connection shared across worker threads; writes are serialized
/// by a reentrant lock.
pub struct IndexStore {
    /// The shared database connection.
    conn: ReentrantMutex<Connection>,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore").finish_non_exhaustive()
    }
}

impl IndexStore {
    /// Open (and if necessary create) the index database at `path`.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory index, used by tests.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Apply pragmas and the schema to a fresh connection.
    fn from_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: ReentrantMutex::new(conn),
        })
    }

    /// Record an album at `path`.
    ///
    /// A pair that is already present is a no-op. If the release group or
    /// the album is already recorded at a *different* path, a warning is
    /// emitted and nothing is inserted.
    pub fn add_album(
        &self,
        path: &Path,
        release_group_id: &str,
        album_id: &str,
    ) -> rusqlite::Result<()> {
        let path = path.to_string_lossy();
        let conn = self.conn.lock();

        let rg_exists = conn
            .prepare("SELECT 1 FROM release_groups WHERE releasegroup_id = ?1 AND path = ?2 LIMIT 1")?
            .exists((release_group_id, path.as_ref()))?;
        let album_exists = conn
            .prepare("SELECT 1 FROM albums WHERE album_id = ?1 AND path = ?2 LIMIT 1")?
            .exists((album_id, path.as_ref()))?;
        if rg_exists && album_exists {
            log::debug!("Album already indexed: {path}");
            return Ok(());
        }

        let mut duplicates_found = false;
        let mut stmt =
            conn.prepare("SELECT path FROM release_groups WHERE releasegroup_id = ?1 AND path != ?2")?;
        for other in stmt
            .query_map((release_group_id, path.as_ref()), |row| {
                row.get::<_, String>(0)
            })?
            .filter_map(Result::ok)
        {
            log::warn!("Same release group exists at multiple locations: {path} and {other}");
            duplicates_found = true;
        }
        let mut stmt = conn.prepare("SELECT path FROM albums WHERE album_id = ?1 AND path != ?2")?;
        for other in stmt
            .query_map((album_id, path.as_ref()), |row| row.get::<_, String>(0))?
            .filter_map(Result::ok)
        {
            log::warn!("Same album exists at multiple locations: {path} and {other}");
            duplicates_found = true;
        }
        if duplicates_found {
            log::warn!("Album not added due to existing duplicates: {path}");
            return Ok(());
        }

        let tx = conn.unchecked_transaction()?;
        if !rg_exists {
            let _ = tx.execute(
                "INSERT INTO release_groups (releasegroup_id, path) VALUES (?1, ?2)",
                (release_group_id, path.as_ref()),
            )?;
        }
        if !album_exists {
            let _ = tx.execute(
                "INSERT INTO albums (album_id, path) VALUES (?1, ?2)",
                (album_id, path.as_ref()),
            )?;
        }
        tx.commit()?;
        log::info!("Album added to index: {path} (RG: {release_group_id}, Album: {album_id})");
        Ok(())
    }

    /// Number of rows in each table, for diagnostics.
    pub fn counts(&self) -> rusqlite::Result<(u64, u64)> {
        let conn = self.conn.lock();
        let release_groups =
            conn.query_row("SELECT COUNT(*) FROM release_groups", [], |row| row.get(0))?;
        let albums = conn.query_row("SELECT COUNT(*) FROM albums", [], |row| row.get(0))?;
        Ok((release_groups, albums))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_add_album_inserts_both_rows() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .add_album(&PathBuf::from("/lib/Artist/Album"), "rg-1", "album-1")
            .unwrap();
        assert_eq!(store.counts().unwrap(), (1, 1));
    }

    #[test]
    fn test_add_album_is_idempotent() {
        let store = IndexStore::open_in_memory().unwrap();
        let path = PathBuf::from("/lib/Artist/Album");
        store.add_album(&path, "rg-1", "album-1").unwrap();
        store.add_album(&path, "rg-1", "album-1").unwrap();
        assert_eq!(store.counts().unwrap(), (1, 1));
    }

    #[test]
    fn test_duplicate_location_is_not_inserted() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .add_album(&PathBuf::from("/lib/Artist/Album"), "rg-1", "album-1")
            .unwrap();
        store
            .add_album(&PathBuf::from("/lib/Other/Album"), "rg-1", "album-1")
            .unwrap();
        // The second location only warns; no rows are added.
        assert_eq!(store.counts().unwrap(), (1, 1));
    }

    #[test]
    fn test_same_release_group_new_album_is_flagged() {
        let store = IndexStore::open_in_memory().unwrap();
        store
            .add_album(&PathBuf::from("/lib/Artist/Album"), "rg-1", "album-1")
            .unwrap();
        // A different edition of the same release group elsewhere is a
        // duplicate location as well.
        store
            .add_album(&PathBuf::from("/lib/Artist/Album (Remaster)"), "rg-1", "album-2")
            .unwrap();
        assert_eq!(store.counts().unwrap(), (1, 1));
    }

    #[test]
    fn test_open_creates_file_store() {
        let dir = tempfile::tempdir_in(env!("CARGO_MANIFEST_DIR")).unwrap();
        let db_path = dir.path().join("index.db");
        let store = IndexStore::open(&db_path).unwrap();
        store
            .add_album(&PathBuf::from("/lib/A/B"), "rg", "album")
            .unwrap();
        drop(store);
        assert!(db_path.exists());

        // Re-opening applies the schema idempotently and sees the data.
        let store = IndexStore::open(&db_path).unwrap();
        assert_eq!(store.counts().unwrap(), (1, 1));
    }
}
