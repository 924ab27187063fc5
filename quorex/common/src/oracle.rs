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

//! Capabilities the engine consumes from its host: chain state, mined
//! quorums, peer transport feedback and share signing.

use crate::{
    H256, MemberId, MemberMask, MsgHash, OriginId, QuorumHash, QuorumParams, SigningId,
    bls::BlsPublicKey,
    messages::RecoveredSig,
};
use std::sync::Arc;

/// One entry of the deterministic masternode list used as a quorum snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasternodeEntry {
    pub id: MemberId,
    /// Operator key individual protocol messages are signed with.
    pub operator_key: BlsPublicKey,
}

/// Chain-tip and block-index facts.
#[auto_impl::auto_impl(&, Arc)]
pub trait ChainOracle: Send + Sync {
    fn block_height(&self, hash: H256) -> Option<u32>;
    fn is_on_active_chain(&self, hash: H256) -> bool;
    fn active_height(&self) -> u32;
}

/// A quorum whose final commitment was mined on-chain.
#[derive(Debug, Clone)]
pub struct QuorumInfo {
    pub quorum_hash: QuorumHash,
    pub params: QuorumParams,
    pub public_key: BlsPublicKey,
    pub members: Vec<MasternodeEntry>,
    pub valid_members: MemberMask,
}

impl QuorumInfo {
    pub fn member_index(&self, member: MemberId) -> Option<usize> {
        self.members.iter().position(|entry| entry.id == member)
    }

    pub fn is_member(&self, member: MemberId) -> bool {
        self.member_index(member).is_some()
    }

    pub fn is_valid_member(&self, member: MemberId) -> bool {
        self.member_index(member)
            .is_some_and(|idx| self.valid_members.get(idx))
    }
}

/// Lookup over mined quorums.
#[auto_impl::auto_impl(&, Arc)]
pub trait QuorumRegistry: Send + Sync {
    fn quorum(&self, quorum_hash: QuorumHash) -> Option<Arc<QuorumInfo>>;
    /// Most recently mined quorums first.
    fn scan_quorums(&self, count: usize) -> Vec<Arc<QuorumInfo>>;
    fn is_active(&self, quorum_hash: QuorumHash) -> bool;
}

/// Feedback channel towards the peer layer. Reputation handling happens
/// entirely outside this core.
#[auto_impl::auto_impl(&, Arc)]
pub trait PeerReporter: Send + Sync {
    fn misbehaving(&self, origin: OriginId, score: i32, reason: &str);
    fn relay_recovered_sig(&self, hash: H256);
}

/// Share-signing collaborator: generates and aggregates signature shares
/// until a recovered signature materializes.
#[auto_impl::auto_impl(&, Arc)]
pub trait ShareSigner: Send + Sync {
    fn async_sign(&self, quorum: Arc<QuorumInfo>, id: SigningId, msg_hash: MsgHash);
    /// Re-announce known shares after a controlled re-sign.
    fn force_reannouncement(&self, quorum: Arc<QuorumInfo>, id: SigningId, msg_hash: MsgHash);
}

/// Observer of freshly accepted recovered signatures.
pub trait RecoveredSigListener: Send + Sync {
    fn handle_new_recovered_sig(&self, sig: &RecoveredSig);
}
