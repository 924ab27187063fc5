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

//! Distributed key generation for Quorex quorums.
//!
//! [`session::DkgSession`] runs one five-phase quorum-formation instance;
//! [`manager::DkgSessionManager`] persists verified contribution material and
//! serves relay lookups; [`pending::PendingMessages`] queues pre-verified
//! inbound messages for batched signature verification.

mod error;

pub mod manager;
pub mod pending;
pub mod session;

#[cfg(test)]
mod tests;

pub use error::{DkgErrorExt, DkgErrorKind};
pub use manager::DkgSessionManager;
pub use session::{
    ContributionSink, DkgAction, DkgMember, DkgPhase, DkgSession, DkgSessionConfig, FaultSim,
    PreVerify, SessionArchive,
};
