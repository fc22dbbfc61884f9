// Copyright (c) 2026 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! The tree scheduler.
//!
//! The walker descends the library depth-first and finalizes every
//! directory strictly after all of its children (bottom-up). Siblings are
//! processed concurrently on a bounded pool; inside each directory another
//! bounded pool probes the files. A child that is part of a set reports its
//! failure upward instead of withdrawing itself, so multi-disc releases are
//! judged as a whole by their parent.

use crate::classify;
use crate::context::GuardContext;
use crate::directory::{Directory, DirectoryKind};
use crate::error::ErrorKind;
use crate::index::IndexStore;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default number of concurrently processed sibling directories.
pub const DEFAULT_MAX_WORKERS: usize = 2;

/// Outcome of one directory, reported to its parent.
#[derive(Debug, Clone)]
struct ChildReport {
    /// Worst error of the directory, or [`ErrorKind::Ok`].
    error: ErrorKind,
    /// The directory belongs to its parent's release set.
    part_of_set: bool,
    /// Identifiers a clean set member contributes to the parent's
    /// registration.
    registration: Option<(String, String)>,
}

impl ChildReport {
    /// A clean outcome.
    fn clean() -> Self {
        Self {
            error: ErrorKind::Ok,
            part_of_set: false,
            registration: None,
        }
    }

    /// A failed outcome outside any set.
    fn failed(error: ErrorKind) -> Self {
        Self {
            error,
            part_of_set: false,
            registration: None,
        }
    }
}

/// The bottom-up tree scheduler.
pub struct Walker {
    /// Shared collaborators.
    ctx: GuardContext,
    /// Album index.
    index: Arc<IndexStore>,
    /// Quarantine root; skipped if nested under the library.
    junkyard: PathBuf,
    /// Bound on concurrently processed directories.
    siblings: Semaphore,
    /// Termination flag, set asynchronously by the signal handler.
    terminate: Arc<AtomicBool>,
    /// Number of finished top-level directories.
    progress: AtomicU64,
}

impl std::fmt::Debug for Walker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Walker")
            .field("junkyard", &self.junkyard)
            .finish_non_exhaustive()
    }
}

impl Walker {
    /// Create a walker.
    #[must_use]
    pub fn new(
        ctx: GuardContext,
        index: Arc<IndexStore>,
        junkyard: PathBuf,
        max_workers: usize,
        terminate: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let max_workers = if max_workers == 0 {
            num_cpus::get()
        } else {
            max_workers
        };
        Arc::new(Self {
            ctx,
            index,
            junkyard,
            siblings: Semaphore::new(max_workers),
            terminate,
            progress: AtomicU64::new(0),
        })
    }

    /// Walk the library rooted at `root` and return the root's outcome.
    pub async fn run(self: Arc<Self>, root: &Path) -> ErrorKind {
        log::info!("Starting scan of {}", root.display());
        let report = Arc::clone(&self).process_dir(root.to_path_buf(), 0).await;
        log::info!(
            "Processed {} top-level directories",
            self.progress.load(Ordering::Relaxed)
        );
        report.error
    }

    /// Process one directory: children first, then the directory itself.
    fn process_dir(
        self: Arc<Self>,
        path: PathBuf,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = ChildReport> + Send>> {
        Box::pin(async move {
            if self.terminate.load(Ordering::Relaxed) {
                return ChildReport::failed(ErrorKind::Terminate);
            }
            if path == self.junkyard {
                log::debug!("Skipping junkyard: {}", path.display());
                return ChildReport::clean();
            }

            let mut files: Vec<PathBuf> = Vec::new();
            let mut subdirs: Vec<PathBuf> = Vec::new();
            let entries = match fs::read_dir(&path) {
                Ok(entries) => entries,
                Err(err) => {
                    log::error!("Cannot read {}: {err}", path.display());
                    return ChildReport::failed(ErrorKind::AccessDenied);
                }
            };
            for entry in entries.filter_map(Result::ok) {
                // Symlinked directories are not followed; symlinked files
                // are treated like their targets.
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if file_type.is_dir() {
                    subdirs.push(entry.path());
                } else if entry.path().is_file() {
                    files.push(entry.path());
                }
            }

            // A marker prunes the whole subtree before anything else
            // happens, children included.
            let has_marker = files.iter().any(|file| {
                file.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(classify::is_marker_name)
            });
            if has_marker {
                log::info!("Got ignore marker, skipping: {}", path.display());
                return ChildReport {
                    error: ErrorKind::Ignore,
                    part_of_set: false,
                    registration: None,
                };
            }

            let has_subdirs = !subdirs.is_empty();
            let mut child_reports: Vec<ChildReport> = Vec::new();
            if has_subdirs && !self.terminate.load(Ordering::Relaxed) {
                let mut handles = JoinSet::new();
                for subdir in subdirs {
                    let walker = Arc::clone(&self);
                    let _abort_handle = handles.spawn(walker.process_dir(subdir, depth + 1));
                }
                while let Some(result) = handles.join_next().await {
                    match result {
                        Ok(report) => child_reports.push(report),
                        Err(err) => {
                            log::error!("Directory worker panicked: {err}");
                            child_reports.push(ChildReport::failed(ErrorKind::Unknown));
                        }
                    }
                }
            }
            if self.terminate.load(Ordering::Relaxed)
                || child_reports
                    .iter()
                    .any(|report| report.error == ErrorKind::Terminate)
            {
                return ChildReport::failed(ErrorKind::Terminate);
            }

            // The directory's own files are only touched once every child
            // has finalized.
            let permit = self
                .siblings
                .acquire()
                .await
                .expect("sibling semaphore closed");
            let dir = Directory::build(path, files, has_subdirs, self.ctx.clone()).await;
            let walker = Arc::clone(&self);
            let is_root = depth == 0;
            let report = tokio::task::spawn_blocking(move || {
                walker.finish_directory(dir, child_reports, is_root)
            })
            .await
            .unwrap_or_else(|err| {
                log::error!("Directory finalization panicked: {err}");
                ChildReport::failed(ErrorKind::Unknown)
            });
            drop(permit);

            if depth <= 1 {
                let done = self.progress.fetch_add(1, Ordering::Relaxed) + 1;
                log::info!("Progress: {done} top-level directories finished");
            }
            report
        })
    }

    /// Finalize a constructed directory: set escalation, withdrawal,
    /// processing and registration.
    fn finish_directory(
        &self,
        mut dir: Directory,
        child_reports: Vec<ChildReport>,
        is_root: bool,
    ) -> ChildReport {
        // Failures of set members become this directory's failures; the
        // set is judged as a whole.
        let mut set_failed = false;
        for report in &child_reports {
            if report.part_of_set && report.error.is_err() && report.error != ErrorKind::Ignore {
                dir.push_error(report.error);
                set_failed = true;
            }
        }

        if self.terminate.load(Ordering::Relaxed) {
            dir.push_error(ErrorKind::Terminate);
            dir.finalize();
            return ChildReport::failed(ErrorKind::Terminate);
        }

        match dir.kind() {
            DirectoryKind::Empty => {
                if self.ctx.options.dry_run {
                    log::info!("Would purge empty directory: {}", dir.path().display());
                } else {
                    log::info!("Purging empty directory: {}", dir.path().display());
                    if let Err(err) = fs::remove_dir(dir.path()) {
                        log::warn!("Failed to remove {}: {err}", dir.path().display());
                    }
                }
                dir.finalize();
                return ChildReport::failed(ErrorKind::Empty);
            }
            DirectoryKind::Ignored => {
                dir.finalize();
                return ChildReport {
                    error: ErrorKind::Ignore,
                    part_of_set: false,
                    registration: None,
                };
            }
            _ => {}
        }

        if !dir.should_withdraw() {
            dir.process();
        }
        if dir.should_withdraw() {
            let worst = dir.worst();
            let part_of_set = dir.part_of_set();
            if part_of_set && !is_root {
                // The parent withdraws the whole set.
                dir.finalize();
                return ChildReport {
                    error: worst,
                    part_of_set: true,
                    registration: None,
                };
            }
            dir.withdraw(&self.junkyard);
            dir.finalize();
            return ChildReport {
                error: worst,
                part_of_set,
                registration: None,
            };
        }

        let part_of_set = dir.part_of_set();
        let registration = if part_of_set {
            dir.registration()
        } else {
            let status = dir.register(self.index.as_ref());
            if status.is_err() {
                log::debug!(
                    "Not registered ({status}): {}",
                    dir.path().display()
                );
            }
            if !set_failed {
                for report in child_reports {
                    if let Some((release_group_id, album_id)) = report.registration {
                        if let Err(err) =
                            self.index
                                .add_album(dir.path(), &release_group_id, &album_id)
                        {
                            log::error!("Failed to index {}: {err}", dir.path().display());
                        }
                    }
                }
            }
            None
        };
        dir.finalize();
        ChildReport {
            error: ErrorKind::Ok,
            part_of_set,
            registration,
        }
    }
}
