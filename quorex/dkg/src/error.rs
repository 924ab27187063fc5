// This file is part of Quorex.
//
// Copyright (C) 2024-2025 Quorex Authors.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use thiserror::Error;

/// Canonical DKG error categories.
///
/// Adversarial input is never an error: these cover local misuse and missing
/// local state only.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DkgErrorKind {
    #[error("Operation invalid in current phase")]
    WrongPhase,
    #[error("Empty membership snapshot")]
    EmptyMembership,
    #[error("Duplicate members in snapshot")]
    DuplicateMembers,
    #[error("Unknown member")]
    UnknownMember,
    #[error("Local member has no operator secret")]
    MissingOperatorSecret,
    #[error("Missing verification vector for valid member")]
    MissingVerificationVector,
    #[error("Missing secret share for valid member")]
    MissingSecretShare,
    #[error("Verified contribution not found in store")]
    MissingVerifiedContribution,
}

/// Extension for downcasting `anyhow::Error` into `DkgErrorKind`.
pub trait DkgErrorExt {
    fn dkg_error_kind(&self) -> Option<DkgErrorKind>;
}

impl DkgErrorExt for anyhow::Error {
    fn dkg_error_kind(&self) -> Option<DkgErrorKind> {
        self.downcast_ref::<DkgErrorKind>().copied()
    }
}
