// Copyright (c) 2025 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Shared collaborators of a library run.

use crate::analyzer::AudioAnalyzer;
use crate::catalog::ReleaseCatalog;
use crate::options::Options;
use crate::tags::TagStoreFactory;
use std::sync::Arc;

/// Everything a directory needs to audit its files: the run options plus
/// the swappable collaborators (probe, tags, duration catalog).
#[derive(Clone)]
pub struct GuardContext {
    /// Run options.
    pub options: Options,
    /// Audio probe.
    pub analyzer: Arc<dyn AudioAnalyzer>,
    /// Tag container access.
    pub tag_stores: Arc<dyn TagStoreFactory>,
    /// Canonical duration lookups for duplicate arbitration.
    pub catalog: Arc<dyn ReleaseCatalog>,
}

impl std::fmt::Debug for GuardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardContext")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
