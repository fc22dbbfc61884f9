// Copyright (c) 2026 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Main module

use clap::Parser;
use libguard::analyzer::SymphoniaAnalyzer;
use libguard::catalog::{MusicBrainzCatalog, NullCatalog, ReleaseCatalog};
use libguard::index::IndexStore;
use libguard::tags::LoftyTagStoreFactory;
use libguard::walker::{Walker, DEFAULT_MAX_WORKERS};
use libguard::{Config, GuardContext, Options};
use simplelog::{
    ColorChoice, CombinedLogger, LevelFilter, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};

/// ANSI escape codes for the console banners.
mod colors {
    /// Red.
    pub const RED: &str = "\x1b[91m";
    /// Green.
    pub const GREEN: &str = "\x1b[92m";
    /// Yellow.
    pub const YELLOW: &str = "\x1b[93m";
    /// Magenta.
    pub const MAGENTA: &str = "\x1b[95m";
    /// Cyan.
    pub const CYAN: &str = "\x1b[96m";
    /// Reset.
    pub const RESET: &str = "\x1b[0m";
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Music library organization and verification tool", long_about = None)]
struct Args {
    /// Path to the music library.
    #[arg(default_value = ".")]
    library_path: PathBuf,
    /// Path to store invalid/failed files and directories.
    #[arg(short, long, default_value = "./.junk")]
    junkyard: PathBuf,
    /// Path to the log file (defaults to libguard.log in the temporary
    /// directory).
    #[arg(short, long)]
    log: Option<PathBuf>,
    /// Path to the index database (defaults to libguard_index.db in the
    /// temporary directory).
    #[arg(short, long)]
    db: Option<PathBuf>,
    /// Perform a dry run (don't modify files).
    #[arg(short = 'n', long)]
    dry_run: bool,
    /// Force checking all files (ignore verification timestamps).
    #[arg(short, long)]
    force_check: bool,
    /// Maximum number of worker threads per directory.
    #[arg(short = 'w', long)]
    max_workers: Option<usize>,
    /// Path to a configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Increase verbosity (can be used multiple times).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Initialize console and file logging.
fn init_logging(log_path: &Path, verbose: u8) -> libguard::Result<()> {
    let file_level = if verbose > 0 {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let term_level = if verbose > 1 {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(
            term_level,
            simplelog::Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(
            file_level,
            simplelog::Config::default(),
            File::create(log_path)?,
        ),
    ];
    if let Err(err) = CombinedLogger::init(loggers) {
        eprintln!("Failed to initialize logging: {err}");
    }
    Ok(())
}

/// Install SIGINT/SIGTERM handlers that request a graceful shutdown.
fn install_signal_handlers(terminate: &Arc<AtomicBool>) {
    let flag = Arc::clone(terminate);
    let _handle = tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                log::warn!("Failed to install SIGTERM handler: {err}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        println!(
            "{}Shutdown requested. Completing current operations...{}",
            colors::RED,
            colors::RESET
        );
        log::warn!("Shutdown requested. Completing current operations...");
        flag.store(true, Ordering::Relaxed);
    });
}

/// Run the library audit and return the process exit code.
async fn run(args: Args) -> libguard::Result<i32> {
    let log_path = args
        .log
        .unwrap_or_else(|| std::env::temp_dir().join("libguard.log"));
    let db_path = args
        .db
        .unwrap_or_else(|| std::env::temp_dir().join("libguard_index.db"));
    init_logging(&log_path, args.verbose)?;

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?.with_defaults(),
        None => Config::default(),
    };
    let options = Options {
        dry_run: args.dry_run,
        force_check: args.force_check,
    };

    std::fs::create_dir_all(&args.junkyard)?;
    let library = std::fs::canonicalize(&args.library_path)?;
    let junkyard = std::fs::canonicalize(&args.junkyard)?;

    println!("{}Library Guardian starting...{}", colors::CYAN, colors::RESET);
    println!(
        "{}Library path:\t{}{}",
        colors::MAGENTA,
        library.display(),
        colors::RESET
    );
    println!(
        "{}Logfile at:\t{}{}",
        colors::MAGENTA,
        log_path.display(),
        colors::RESET
    );
    println!(
        "{}Junkyard:\t{}{}",
        colors::MAGENTA,
        junkyard.display(),
        colors::RESET
    );
    if options.dry_run {
        println!(
            "{}DRY RUN MODE - No files will be modified{}",
            colors::YELLOW,
            colors::RESET
        );
        log::info!("DRY RUN MODE - No files will be modified");
    }
    println!("{}Started{}", colors::GREEN, colors::RESET);
    log::info!("Library Guardian starting...");
    log::info!("Library path: {}", library.display());
    log::info!("Junkyard: {}", junkyard.display());

    let index = Arc::new(IndexStore::open(&db_path)?);
    let terminate = Arc::new(AtomicBool::new(false));
    install_signal_handlers(&terminate);

    let catalog: Arc<dyn ReleaseCatalog> = if config.catalog.enabled.unwrap_or(true) {
        let timeout = Duration::from_secs(config.catalog.timeout_secs.unwrap_or(5));
        Arc::new(MusicBrainzCatalog::new(
            tokio::runtime::Handle::current(),
            timeout,
        ))
    } else {
        Arc::new(NullCatalog)
    };
    let ctx = GuardContext {
        options,
        analyzer: Arc::new(SymphoniaAnalyzer),
        tag_stores: Arc::new(LoftyTagStoreFactory),
        catalog,
    };
    let max_workers = args
        .max_workers
        .or(config.workers.max_dir_workers)
        .unwrap_or(DEFAULT_MAX_WORKERS);
    let walker = Walker::new(
        ctx,
        index,
        junkyard,
        max_workers,
        Arc::clone(&terminate),
    );

    let started = Instant::now();
    let outcome = walker.run(&library).await;
    let elapsed = started.elapsed().as_secs_f64();

    if terminate.load(Ordering::Relaxed) {
        println!(
            "{}Gracefully shut down after {elapsed:.1} sec{}",
            colors::YELLOW,
            colors::RESET
        );
        log::info!("Gracefully shut down after {elapsed:.1} sec");
    } else {
        println!(
            "{}Finished in {elapsed:.1} sec{}",
            colors::YELLOW,
            colors::RESET
        );
        log::info!("Finished in {elapsed:.1} sec");
    }
    if outcome.is_err() {
        log::error!("Error processing library: {outcome}");
    }
    Ok(outcome as i32)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}Error: {err}{}", colors::RED, colors::RESET);
            log::error!("Unexpected error: {err}");
            1
        }
    };
    std::process::exit(code);
}
