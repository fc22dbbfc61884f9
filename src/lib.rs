// Copyright (c) 2026 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Library auditing and normalization.
//!
//! LibraryGuard walks a music library bottom-up, verifies every audio file,
//! reconciles each album directory into a consistent release, computes
//! replay-gain corrections, quarantines failing subtrees and records
//! surviving releases in an index database.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::missing_docs_in_private_items)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]
#![warn(missing_docs)]
#![warn(missing_copy_implementations)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]
#![warn(absolute_paths_not_starting_with_crate)]
#![warn(elided_lifetimes_in_paths)]
#![warn(explicit_outlives_requirements)]
#![warn(keyword_idents)]
#![warn(let_underscore_drop)]
#![warn(macro_use_extern_crate)]
#![warn(meta_variable_misuse)]
#![warn(missing_abi)]
#![warn(non_ascii_idents)]
#![warn(noop_method_call)]
#![warn(single_use_lifetimes)]
#![warn(trivial_casts)]
#![warn(trivial_numeric_casts)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_lifetimes)]
#![warn(unused_macro_rules)]
#![warn(unused_qualifications)]
#![warn(unused_results)]

pub mod analyzer;
pub mod catalog;
pub mod classify;
pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod index;
pub mod junkyard;
pub mod loudness;
pub mod options;
pub mod tags;
#[cfg(test)]
mod testing;
pub mod track;
pub mod vcache;
pub mod walker;

pub use config::Config;
pub use context::GuardContext;
pub use error::{pick_worst, Error, ErrorKind};
pub use options::Options;

/// Convenience type.
pub type Result<T> = error::Result<T>;
