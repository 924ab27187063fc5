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

//! Recovered-signature pipeline for Quorex quorums.
//!
//! [`store::RecoveredSigStore`] persists recovered signatures under multiple
//! indices with time-bucketed expiry; [`manager::SigningManager`] receives,
//! batch-verifies, deduplicates and disseminates them, and exposes the
//! asynchronous sign-if-member entry point.

pub mod manager;
pub mod store;

pub use manager::{
    DEFAULT_MAX_RECOVERED_SIGS_AGE, SigningConfig, SigningManager, unix_now,
};
pub use store::RecoveredSigStore;
