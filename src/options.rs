// Copyright (c) 2025 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Run-wide behavior switches.

/// Options that apply to a whole library run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Log intended mutations instead of performing them.
    pub dry_run: bool,
    /// Ignore verification stamps and re-probe every file.
    pub force_check: bool,
}

impl Options {
    /// Returns `true` if on-disk state may be mutated.
    #[must_use]
    pub fn may_mutate(self) -> bool {
        !self.dry_run
    }
}
