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

//! Quorex common types and traits.

pub mod bls;
pub mod messages;
pub mod oracle;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use parity_scale_codec::{Decode, Encode};
use sha3::{Digest as _, Keccak256};

pub use primitive_types::H256;

/// Base-block hash identifying a quorum.
pub type QuorumHash = H256;
/// Application-level request id a quorum signs over.
pub type SigningId = H256;
/// Hash of the message being signed for a given id.
pub type MsgHash = H256;

/// Stable identifier of a masternode (its registration tx hash).
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Encode,
    Decode,
    derive_more::Deref,
    derive_more::Display,
)]
#[display("{}", self.0)]
pub struct MemberId(pub H256);

impl MemberId {
    pub const fn zero() -> Self {
        Self(H256::zero())
    }
}

/// Transport-level origin of an inbound message.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Encode,
    Decode,
    derive_more::Display,
)]
#[display("origin({})", self.0)]
pub struct OriginId(pub u64);

/// Anything hashable into the protocol digest space.
pub trait ToDigest {
    fn update_hasher(&self, hasher: &mut Keccak256);

    fn to_digest(&self) -> H256 {
        let mut hasher = Keccak256::new();
        self.update_hasher(&mut hasher);
        H256(hasher.finalize().into())
    }
}

/// Keccak digest of raw bytes.
pub fn hash_bytes(data: &[u8]) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    H256(hasher.finalize().into())
}

/// Sign hash of a signing session: `(quorum, id, msg)` collapsed into one
/// digest. Used purely for duplicate-session detection and as the message the
/// quorum threshold key actually signs.
pub fn build_sign_hash(quorum_hash: QuorumHash, id: SigningId, msg_hash: MsgHash) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(quorum_hash.as_bytes());
    hasher.update(id.as_bytes());
    hasher.update(msg_hash.as_bytes());
    H256(hasher.finalize().into())
}

/// Dynamic bitset over quorum member indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct MemberMask(Vec<bool>);

impl MemberMask {
    pub fn new(len: usize) -> Self {
        Self(vec![false; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> bool {
        self.0.get(idx).copied().unwrap_or(false)
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        if let Some(slot) = self.0.get_mut(idx) {
            *slot = value;
        }
    }

    pub fn count_ones(&self) -> usize {
        self.0.iter().filter(|b| **b).count()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(idx, b)| b.then_some(idx))
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|b| *b)
    }
}

impl ToDigest for MemberMask {
    fn update_hasher(&self, hasher: &mut Keccak256) {
        hasher.update(self.encode());
    }
}

/// Static parameters of one quorum type.
///
/// `indexed_commitments` decides whether a single DKG session may finalize
/// more than one non-conflicting commitment group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumParams {
    pub name: &'static str,
    /// Number of members selected per quorum.
    pub size: usize,
    /// Minimum surviving members for the session to finalize.
    pub min_size: usize,
    /// Shares required to recover a threshold signature.
    pub threshold: usize,
    /// How many recent quorums participate in signing-session selection.
    pub signing_active_quorum_count: usize,
    /// Blocks between two DKG rounds of this type.
    pub dkg_interval: u32,
    /// Persisted quorum data older than this many blocks is swept.
    pub max_store_depth: u32,
    pub indexed_commitments: bool,
}

impl QuorumParams {
    /// The standard 50/60 profile.
    pub const fn standard() -> Self {
        Self {
            name: "quorum_50_60",
            size: 50,
            min_size: 40,
            threshold: 30,
            signing_active_quorum_count: 24,
            dkg_interval: 24,
            max_store_depth: 24 * 30,
            indexed_commitments: false,
        }
    }

    /// Small profile used by functional tests and devnets.
    pub const fn small(size: usize, threshold: usize) -> Self {
        Self {
            name: "quorum_test",
            size,
            min_size: threshold,
            threshold,
            signing_active_quorum_count: 4,
            dkg_interval: 2,
            max_store_depth: 24,
            indexed_commitments: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_mask_counts_and_iterates() {
        let mut mask = MemberMask::new(5);
        assert_eq!(mask.count_ones(), 0);
        mask.set(1, true);
        mask.set(3, true);
        mask.set(7, true); // out of range, ignored
        assert_eq!(mask.count_ones(), 2);
        assert_eq!(mask.iter_ones().collect::<Vec<_>>(), vec![1, 3]);
        assert!(!mask.get(0));
        assert!(mask.get(3));
    }

    #[test]
    fn sign_hash_depends_on_every_component() {
        let q = H256::repeat_byte(1);
        let id = H256::repeat_byte(2);
        let msg = H256::repeat_byte(3);

        let base = build_sign_hash(q, id, msg);
        assert_ne!(base, build_sign_hash(H256::repeat_byte(9), id, msg));
        assert_ne!(base, build_sign_hash(q, H256::repeat_byte(9), msg));
        assert_ne!(base, build_sign_hash(q, id, H256::repeat_byte(9)));
        assert_eq!(base, build_sign_hash(q, id, msg));
    }

    #[test]
    fn member_mask_codec_roundtrip() {
        let mut mask = MemberMask::new(3);
        mask.set(2, true);
        let decoded = MemberMask::decode(&mut mask.encode().as_slice()).unwrap();
        assert_eq!(mask, decoded);
    }
}
