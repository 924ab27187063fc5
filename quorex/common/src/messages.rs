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

//! Protocol messages of the DKG and the recovered-signature pipeline.
//!
//! Every message is keyed by its content hash. Signed messages expose a
//! `sign_digest` over their encoding with the signature zeroed, which is the
//! value the operator key actually signs.

use crate::{
    H256, MemberId, MemberMask, MsgHash, QuorumHash, QuorumParams, SigningId,
    bls::{BlsPublicKey, BlsSecretKey, BlsSignature, VerificationVector},
    build_sign_hash, hash_bytes,
};
use parity_scale_codec::{Decode, Encode};
use sha3::Digest as _;

/// Digest both premature and final commitments commit to: the claim
/// `(quorum, valid member set, quorum key, verification-vector hash)`.
pub fn build_commitment_hash(
    quorum_hash: QuorumHash,
    valid_members: &MemberMask,
    quorum_public_key: &BlsPublicKey,
    quorum_vvec_hash: H256,
) -> H256 {
    let mut hasher = sha3::Keccak256::new();
    hasher.update(quorum_hash.as_bytes());
    hasher.update(valid_members.encode());
    hasher.update(quorum_public_key.encode());
    hasher.update(quorum_vvec_hash.as_bytes());
    H256(hasher.finalize().into())
}

/// Shared surface of the four signed DKG messages, used by the batched
/// signature-verification pipeline.
pub trait SignedDkgMessage: Encode + Clone {
    fn quorum_hash(&self) -> QuorumHash;
    fn member_id(&self) -> MemberId;
    fn signature(&self) -> &BlsSignature;
    fn set_signature(&mut self, sig: BlsSignature);

    /// Hash of the message with its signature zeroed.
    fn sign_digest(&self) -> H256 {
        let mut unsigned = self.clone();
        unsigned.set_signature(BlsSignature::default());
        hash_bytes(&unsigned.encode())
    }

    /// Hash of the full message, including the signature.
    fn content_hash(&self) -> H256 {
        hash_bytes(&self.encode())
    }
}

macro_rules! impl_signed_message {
    ($ty:ident) => {
        impl SignedDkgMessage for $ty {
            fn quorum_hash(&self) -> QuorumHash {
                self.quorum_hash
            }

            fn member_id(&self) -> MemberId {
                self.member_id
            }

            fn signature(&self) -> &BlsSignature {
                &self.sig
            }

            fn set_signature(&mut self, sig: BlsSignature) {
                self.sig = sig;
            }
        }
    };
}

/// A member's verification vector plus one secret share per quorum member.
///
/// Share slots are positional (slot `i` belongs to member index `i`); share
/// encryption for transit is the transport's concern.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DkgContribution {
    pub quorum_hash: QuorumHash,
    pub member_id: MemberId,
    pub vvec: VerificationVector,
    pub shares: Vec<BlsSecretKey>,
    pub sig: BlsSignature,
}

impl_signed_message!(DkgContribution);

/// Accusation bitsets: members the sender can prove bad, and members whose
/// contribution the sender is missing or could not validate.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DkgComplaint {
    pub quorum_hash: QuorumHash,
    pub member_id: MemberId,
    pub bad_members: MemberMask,
    pub complain_for_members: MemberMask,
    pub sig: BlsSignature,
}

impl DkgComplaint {
    pub fn new(quorum_hash: QuorumHash, member_id: MemberId, len: usize) -> Self {
        Self {
            quorum_hash,
            member_id,
            bad_members: MemberMask::new(len),
            complain_for_members: MemberMask::new(len),
            sig: BlsSignature::default(),
        }
    }
}

impl_signed_message!(DkgComplaint);

/// One disclosed share: the accused reveals what it sent to member `index`.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct JustifiedShare {
    pub index: u32,
    pub share: BlsSecretKey,
}

/// An accused member's response to complaints it disagrees with.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DkgJustification {
    pub quorum_hash: QuorumHash,
    pub member_id: MemberId,
    pub contributions: Vec<JustifiedShare>,
    pub sig: BlsSignature,
}

impl_signed_message!(DkgJustification);

/// A member's individual claim about the DKG outcome: the valid member set,
/// the resulting quorum key, and its own threshold-signature share over that
/// claim.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct DkgPrematureCommitment {
    pub quorum_hash: QuorumHash,
    pub member_id: MemberId,
    pub valid_members: MemberMask,
    pub quorum_public_key: BlsPublicKey,
    pub quorum_vvec_hash: H256,
    /// Threshold signature share over the commitment hash.
    pub quorum_sig: BlsSignature,
    /// Operator signature over the commitment hash.
    pub sig: BlsSignature,
}

impl DkgPrematureCommitment {
    pub fn count_valid_members(&self) -> usize {
        self.valid_members.count_ones()
    }

    pub fn commitment_hash(&self) -> H256 {
        build_commitment_hash(
            self.quorum_hash,
            &self.valid_members,
            &self.quorum_public_key,
            self.quorum_vvec_hash,
        )
    }
}

impl SignedDkgMessage for DkgPrematureCommitment {
    fn quorum_hash(&self) -> QuorumHash {
        self.quorum_hash
    }

    fn member_id(&self) -> MemberId {
        self.member_id
    }

    fn signature(&self) -> &BlsSignature {
        &self.sig
    }

    fn set_signature(&mut self, sig: BlsSignature) {
        self.sig = sig;
    }

    // Both member and quorum signatures cover the commitment hash, not the
    // message encoding.
    fn sign_digest(&self) -> H256 {
        self.commitment_hash()
    }
}

/// Aggregation of premature commitments sharing one claim; valid only with at
/// least `min_size` contributing signers. Immutable once produced and
/// submitted externally for on-chain inclusion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct FinalCommitment {
    pub version: u16,
    pub quorum_hash: QuorumHash,
    /// Members whose premature commitments were aggregated.
    pub signers: MemberMask,
    pub valid_members: MemberMask,
    pub quorum_public_key: BlsPublicKey,
    pub quorum_vvec_hash: H256,
    /// Recovered threshold signature over the commitment hash.
    pub quorum_sig: BlsSignature,
    /// Aggregate of the signers' operator signatures.
    pub members_sig: BlsSignature,
}

impl FinalCommitment {
    pub const CURRENT_VERSION: u16 = 1;

    pub fn count_signers(&self) -> usize {
        self.signers.count_ones()
    }

    pub fn count_valid_members(&self) -> usize {
        self.valid_members.count_ones()
    }

    pub fn commitment_hash(&self) -> H256 {
        build_commitment_hash(
            self.quorum_hash,
            &self.valid_members,
            &self.quorum_public_key,
            self.quorum_vvec_hash,
        )
    }

    pub fn is_null(&self) -> bool {
        !self.signers.any()
            && !self.valid_members.any()
            && !self.quorum_public_key.is_valid()
            && self.quorum_vvec_hash.is_zero()
            && !self.quorum_sig.is_valid()
            && !self.members_sig.is_valid()
    }

    pub fn verify_sizes(&self, params: &QuorumParams) -> bool {
        self.signers.len() == params.size
            && self.valid_members.len() == params.size
            && self.count_signers() >= params.min_size
            && self.count_valid_members() >= params.min_size
    }
}

/// The fully recovered threshold signature over an application message.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RecoveredSig {
    pub quorum_hash: QuorumHash,
    pub id: SigningId,
    pub msg_hash: MsgHash,
    pub sig: BlsSignature,
}

impl RecoveredSig {
    /// Content hash identifying this object on the wire and in the store.
    pub fn hash(&self) -> H256 {
        hash_bytes(&self.encode())
    }

    /// Session key: distinct recovered sigs for one session share this value.
    pub fn sign_hash(&self) -> H256 {
        build_sign_hash(self.quorum_hash, self.id, self.msg_hash)
    }
}
