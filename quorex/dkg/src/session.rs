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

//! One DKG session: a single pass of
//! `Init -> Contribute -> Complain -> Justify -> Commit -> Finalize`.
//!
//! The session is driven serially by an external handler. Inbound messages go
//! through `pre_verify_*` (cheap, structural), a batched signature check, and
//! then `receive_*`. Conflicting signed messages from one member are retained
//! as evidence and relayed, but the member is marked bad and drops out of the
//! valid-member set. The session holds no persistent state; dropping it
//! abandons the run.

use crate::error::DkgErrorKind;
use anyhow::Result;
use parity_scale_codec::Encode;
use parking_lot::Mutex;
use quorex_common::{
    H256, MemberId, MemberMask, QuorumHash, QuorumParams,
    bls::{BlsBackend, BlsPublicKey, BlsScalarId, BlsSecretKey, VerificationVector},
    hash_bytes,
    messages::{
        DkgComplaint, DkgContribution, DkgJustification, DkgPrematureCommitment, FinalCommitment,
        JustifiedShare, SignedDkgMessage,
    },
    oracle::MasternodeEntry,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// Digest of the valid members' verification vectors in member order.
fn vvec_digest(vvecs: &[&VerificationVector]) -> H256 {
    let mut material = Vec::new();
    for vvec in vvecs {
        vvec.encode_to(&mut material);
    }
    hash_bytes(&material)
}

/// Narrow interface the session persists verified contribution data through.
/// The only writers are a successfully verified Contribute message and a
/// successfully verified Justify disclosure; each member's material is
/// forwarded at most once.
#[auto_impl::auto_impl(&, Arc)]
pub trait ContributionSink {
    fn persist_vvec_contribution(
        &self,
        quorum_hash: QuorumHash,
        member: MemberId,
        vvec: &VerificationVector,
    ) -> Result<()>;

    fn persist_sk_share(
        &self,
        quorum_hash: QuorumHash,
        member: MemberId,
        share: &BlsSecretKey,
    ) -> Result<()>;
}

/// Session phases in strict order; one pass, no regression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DkgPhase {
    Initialized,
    Contribute,
    Complain,
    Justify,
    Commit,
    Finalize,
}

impl DkgPhase {
    fn next(self) -> Option<Self> {
        match self {
            Self::Initialized => Some(Self::Contribute),
            Self::Contribute => Some(Self::Complain),
            Self::Complain => Some(Self::Justify),
            Self::Justify => Some(Self::Commit),
            Self::Commit => Some(Self::Finalize),
            Self::Finalize => None,
        }
    }
}

/// Cheap synchronous screening of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreVerify {
    Accept,
    /// Drop silently (wrong session, late, not actionable).
    Reject,
    /// Drop and report the origin for misbehavior.
    Punish,
}

/// Outbound protocol messages produced by phase operations.
#[derive(Debug, Clone)]
pub enum DkgAction {
    BroadcastContribution(Box<DkgContribution>),
    BroadcastComplaint(DkgComplaint),
    BroadcastJustification(DkgJustification),
    BroadcastCommitment(Box<DkgPrematureCommitment>),
}

/// Per-member protocol state for the lifetime of one session.
#[derive(Debug)]
pub struct DkgMember {
    pub entry: MasternodeEntry,
    pub idx: usize,
    pub scalar_id: BlsScalarId,
    pub contributions: BTreeSet<H256>,
    pub complaints: BTreeSet<H256>,
    pub justifications: BTreeSet<H256>,
    pub premature_commitments: BTreeSet<H256>,
    /// Excluded due to provable misbehavior.
    pub bad: bool,
    /// We detected a missing or invalid contribution from this member.
    pub we_complain: bool,
    /// Someone accused this member in a complaint.
    pub someone_complain: bool,
    /// The member justified successfully after being accused.
    pub justified: bool,
}

impl DkgMember {
    fn new(entry: MasternodeEntry, idx: usize, scalar_id: BlsScalarId) -> Self {
        Self {
            entry,
            idx,
            scalar_id,
            contributions: BTreeSet::new(),
            complaints: BTreeSet::new(),
            justifications: BTreeSet::new(),
            premature_commitments: BTreeSet::new(),
            bad: false,
            we_complain: false,
            someone_complain: false,
            justified: false,
        }
    }
}

/// Message archive shared between the session and the session manager.
///
/// All received messages are kept keyed by content hash, conflicting ones
/// included, so they can be relayed and used as evidence.
#[derive(Default)]
pub struct SessionArchive {
    contributions: Mutex<BTreeMap<H256, DkgContribution>>,
    complaints: Mutex<BTreeMap<H256, DkgComplaint>>,
    justifications: Mutex<BTreeMap<H256, DkgJustification>>,
    commitments: Mutex<BTreeMap<H256, DkgPrematureCommitment>>,
}

impl SessionArchive {
    fn insert_contribution(&self, hash: H256, msg: DkgContribution) -> bool {
        self.contributions.lock().insert(hash, msg).is_none()
    }

    fn insert_complaint(&self, hash: H256, msg: DkgComplaint) -> bool {
        self.complaints.lock().insert(hash, msg).is_none()
    }

    fn insert_justification(&self, hash: H256, msg: DkgJustification) -> bool {
        self.justifications.lock().insert(hash, msg).is_none()
    }

    fn insert_commitment(&self, hash: H256, msg: DkgPrematureCommitment) -> bool {
        self.commitments.lock().insert(hash, msg).is_none()
    }

    pub fn contribution(&self, hash: H256) -> Option<DkgContribution> {
        self.contributions.lock().get(&hash).cloned()
    }

    pub fn complaint(&self, hash: H256) -> Option<DkgComplaint> {
        self.complaints.lock().get(&hash).cloned()
    }

    pub fn justification(&self, hash: H256) -> Option<DkgJustification> {
        self.justifications.lock().get(&hash).cloned()
    }

    pub fn commitment(&self, hash: H256) -> Option<DkgPrematureCommitment> {
        self.commitments.lock().get(&hash).cloned()
    }

    pub fn has(&self, hash: H256) -> bool {
        self.contributions.lock().contains_key(&hash)
            || self.complaints.lock().contains_key(&hash)
            || self.justifications.lock().contains_key(&hash)
            || self.commitments.lock().contains_key(&hash)
    }
}

/// Injected fault strategy; the production path always carries
/// [`FaultSim::none`]. Non-trivial configurations are test-build only.
#[derive(Debug, Default, Clone)]
pub struct FaultSim {
    contribution_omit: bool,
    contribution_lie: bool,
    complain_lie: bool,
    justify_omit: bool,
    justify_lie: bool,
    commit_omit: bool,
    commit_lie: bool,
}

impl FaultSim {
    pub fn none() -> Self {
        Self::default()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl FaultSim {
    pub fn with_contribution_omit(mut self) -> Self {
        self.contribution_omit = true;
        self
    }

    pub fn with_contribution_lie(mut self) -> Self {
        self.contribution_lie = true;
        self
    }

    pub fn with_complain_lie(mut self) -> Self {
        self.complain_lie = true;
        self
    }

    pub fn with_justify_omit(mut self) -> Self {
        self.justify_omit = true;
        self
    }

    pub fn with_justify_lie(mut self) -> Self {
        self.justify_lie = true;
        self
    }

    pub fn with_commit_omit(mut self) -> Self {
        self.commit_omit = true;
        self
    }

    pub fn with_commit_lie(mut self) -> Self {
        self.commit_lie = true;
        self
    }
}

/// Static inputs of one session.
pub struct DkgSessionConfig {
    pub quorum_hash: QuorumHash,
    pub params: QuorumParams,
    /// Ordered membership snapshot the quorum was selected with.
    pub members: Vec<MasternodeEntry>,
    /// Our identity when we are part of the snapshot.
    pub my_id: Option<MemberId>,
    /// Operator secret of the local masternode; required when `my_id` is set.
    pub operator_secret: Option<BlsSecretKey>,
}

/// A single quorum-formation instance.
pub struct DkgSession<S: ContributionSink> {
    backend: Arc<dyn BlsBackend>,
    sink: S,
    params: QuorumParams,
    quorum_hash: QuorumHash,
    members: Vec<DkgMember>,
    members_map: BTreeMap<MemberId, usize>,
    my_id: Option<MemberId>,
    my_idx: Option<usize>,
    operator_secret: Option<BlsSecretKey>,
    phase: DkgPhase,
    aborted: bool,
    archive: Arc<SessionArchive>,

    // Our dealt contribution, kept until Justify so disputed shares can be
    // revealed.
    dealt_vvec: Option<VerificationVector>,
    dealt_shares: Vec<BlsSecretKey>,

    // Per-member received state, indexed like `members`.
    received_vvecs: Vec<Option<VerificationVector>>,
    offered_shares: Vec<Option<BlsSecretKey>>,
    received_shares: Vec<Option<BlsSecretKey>>,
    persisted_shares: BTreeSet<usize>,
    complainers_against_us: BTreeSet<usize>,

    pending_share_checks: Mutex<Vec<usize>>,
    valid_commitments: Mutex<BTreeSet<H256>>,

    faults: FaultSim,
}

impl<S: ContributionSink> DkgSession<S> {
    pub fn new(
        config: DkgSessionConfig,
        backend: Arc<dyn BlsBackend>,
        sink: S,
        faults: FaultSim,
    ) -> Result<Self> {
        let DkgSessionConfig {
            quorum_hash,
            params,
            members,
            my_id,
            operator_secret,
        } = config;

        if members.is_empty() {
            return Err(anyhow::Error::new(DkgErrorKind::EmptyMembership));
        }

        let mut table = Vec::with_capacity(members.len());
        let mut members_map = BTreeMap::new();
        for (idx, entry) in members.into_iter().enumerate() {
            let scalar_id = backend.scalar_id(&entry.id);
            if members_map.insert(entry.id, idx).is_some() {
                return Err(anyhow::Error::new(DkgErrorKind::DuplicateMembers));
            }
            table.push(DkgMember::new(entry, idx, scalar_id));
        }

        let my_idx = match my_id {
            Some(id) => {
                let idx = *members_map
                    .get(&id)
                    .ok_or_else(|| anyhow::Error::new(DkgErrorKind::UnknownMember))?;
                if operator_secret.is_none() {
                    return Err(anyhow::Error::new(DkgErrorKind::MissingOperatorSecret));
                }
                Some(idx)
            }
            None => None,
        };

        let size = table.len();
        Ok(Self {
            backend,
            sink,
            params,
            quorum_hash,
            members: table,
            members_map,
            my_id,
            my_idx,
            operator_secret,
            phase: DkgPhase::Initialized,
            aborted: false,
            archive: Arc::new(SessionArchive::default()),
            dealt_vvec: None,
            dealt_shares: Vec::new(),
            received_vvecs: vec![None; size],
            offered_shares: vec![None; size],
            received_shares: vec![None; size],
            persisted_shares: BTreeSet::new(),
            complainers_against_us: BTreeSet::new(),
            pending_share_checks: Mutex::new(Vec::new()),
            valid_commitments: Mutex::new(BTreeSet::new()),
            faults,
        })
    }

    pub fn phase(&self) -> DkgPhase {
        self.phase
    }

    pub fn quorum_hash(&self) -> QuorumHash {
        self.quorum_hash
    }

    pub fn archive(&self) -> Arc<SessionArchive> {
        self.archive.clone()
    }

    pub fn are_we_member(&self) -> bool {
        self.my_idx.is_some()
    }

    pub fn my_member_index(&self) -> Option<usize> {
        self.my_idx
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn member(&self, id: MemberId) -> Option<&DkgMember> {
        self.members_map.get(&id).map(|idx| &self.members[*idx])
    }

    pub fn members(&self) -> &[DkgMember] {
        &self.members
    }

    /// Operator key used by the batched signature pipeline.
    pub fn member_operator_key(&self, id: MemberId) -> Option<BlsPublicKey> {
        self.member(id).map(|member| member.entry.operator_key)
    }

    fn advance_to(&mut self, next: DkgPhase) -> Result<()> {
        if self.phase.next() != Some(next) {
            return Err(anyhow::Error::new(DkgErrorKind::WrongPhase));
        }
        self.phase = next;
        Ok(())
    }

    fn mark_bad(&mut self, idx: usize) {
        let member = &mut self.members[idx];
        if !member.bad {
            tracing::debug!(
                quorum = ?self.quorum_hash,
                member = %member.entry.id,
                "marking member bad",
            );
            member.bad = true;
        }
    }

    fn sign_message<M: SignedDkgMessage>(&self, msg: &mut M) -> Result<()> {
        let secret = self
            .operator_secret
            .as_ref()
            .ok_or_else(|| anyhow::Error::new(DkgErrorKind::MissingOperatorSecret))?;
        let sig = self.backend.sign(secret, msg.sign_digest());
        msg.set_signature(sig);
        Ok(())
    }

    // Phase 1: contribution

    /// Generates and broadcasts our contribution.
    pub fn contribute(&mut self) -> Result<Vec<DkgAction>> {
        self.advance_to(DkgPhase::Contribute)?;

        let Some(my_idx) = self.my_idx else {
            return Ok(Vec::new());
        };
        let my_id = self.my_id.expect("my_idx implies my_id");

        let ids: Vec<BlsScalarId> = self.members.iter().map(|m| m.scalar_id).collect();
        let mut seed = self.quorum_hash.as_bytes().to_vec();
        seed.extend_from_slice(my_id.as_bytes());
        seed.extend_from_slice(
            &self
                .operator_secret
                .as_ref()
                .expect("my_idx implies operator secret")
                .encode(),
        );
        let (vvec, shares) =
            self.backend
                .generate_contribution(self.params.threshold, &ids, &seed);

        self.dealt_vvec = Some(vvec.clone());
        self.dealt_shares = shares.clone();

        if self.faults.contribution_omit {
            tracing::debug!(quorum = ?self.quorum_hash, "simulating contribution omission");
            return Ok(Vec::new());
        }

        let mut shares_out = shares;
        if self.faults.contribution_lie {
            for (idx, share) in shares_out.iter_mut().enumerate() {
                if idx != my_idx {
                    share.0[0] ^= 0xff;
                }
            }
        }

        let mut msg = DkgContribution {
            quorum_hash: self.quorum_hash,
            member_id: my_id,
            vvec,
            shares: shares_out,
            sig: Default::default(),
        };
        self.sign_message(&mut msg)?;

        Ok(vec![DkgAction::BroadcastContribution(Box::new(msg))])
    }

    pub fn pre_verify_contribution(&self, msg: &DkgContribution) -> PreVerify {
        if msg.quorum_hash != self.quorum_hash {
            return PreVerify::Reject;
        }
        if !self.members_map.contains_key(&msg.member_id) {
            return PreVerify::Punish;
        }
        if msg.vvec.len() != self.params.threshold || msg.shares.len() != self.members.len() {
            return PreVerify::Punish;
        }
        PreVerify::Accept
    }

    /// Accepts a contribution whose signature already verified.
    pub fn receive_contribution(&mut self, hash: H256, msg: DkgContribution) -> Result<()> {
        if self.phase < DkgPhase::Contribute {
            return Err(anyhow::Error::new(DkgErrorKind::WrongPhase));
        }
        let idx = *self
            .members_map
            .get(&msg.member_id)
            .ok_or_else(|| anyhow::Error::new(DkgErrorKind::UnknownMember))?;

        if !self.archive.insert_contribution(hash, msg.clone()) {
            return Ok(());
        }
        self.members[idx].contributions.insert(hash);
        if self.members[idx].contributions.len() > 1 {
            // Conflicting signed contributions: kept for relay, member out.
            tracing::warn!(
                quorum = ?self.quorum_hash,
                member = %msg.member_id,
                "conflicting contribution received",
            );
            self.mark_bad(idx);
            return Ok(());
        }

        self.received_vvecs[idx] = Some(msg.vvec);

        if let Some(my_idx) = self.my_idx {
            self.offered_shares[idx] = Some(msg.shares[my_idx]);
            // Cryptographic validation is deferred and batched.
            self.pending_share_checks.lock().push(idx);
        }

        Ok(())
    }

    /// Validates queued secret shares in one batch and forwards verified
    /// material to the session manager.
    pub fn verify_pending_contributions(&mut self) -> Result<()> {
        let pending: Vec<usize> = std::mem::take(&mut *self.pending_share_checks.lock());
        let Some(my_idx) = self.my_idx else {
            return Ok(());
        };
        if pending.is_empty() {
            return Ok(());
        }

        let my_scalar = self.members[my_idx].scalar_id;
        let mut batch: Vec<(usize, VerificationVector, BlsSecretKey)> = Vec::new();
        for idx in pending {
            if let (Some(vvec), Some(share)) = (&self.received_vvecs[idx], self.offered_shares[idx])
            {
                batch.push((idx, vvec.clone(), share));
            }
        }

        let results = {
            let items: Vec<(&VerificationVector, &BlsSecretKey)> =
                batch.iter().map(|(_, vvec, share)| (vvec, share)).collect();
            self.backend.verify_contribution_shares(my_scalar, &items)
        };

        for ((idx, vvec, share), valid) in batch.into_iter().zip(results) {
            if valid {
                self.received_shares[idx] = Some(share);
                self.persist_verified(idx, &vvec, &share)?;
            } else {
                tracing::debug!(
                    quorum = ?self.quorum_hash,
                    member = %self.members[idx].entry.id,
                    "invalid secret share received",
                );
                self.members[idx].we_complain = true;
            }
        }

        Ok(())
    }

    fn persist_verified(
        &mut self,
        idx: usize,
        vvec: &VerificationVector,
        share: &BlsSecretKey,
    ) -> Result<()> {
        if !self.persisted_shares.insert(idx) {
            return Ok(());
        }
        let member = self.members[idx].entry.id;
        self.sink
            .persist_vvec_contribution(self.quorum_hash, member, vvec)?;
        self.sink.persist_sk_share(self.quorum_hash, member, share)?;
        Ok(())
    }

    // Phase 2: complaint

    /// Closes the contribution window and broadcasts a complaint when we
    /// detected missing or invalid contributions.
    pub fn verify_and_complain(&mut self) -> Result<Vec<DkgAction>> {
        self.verify_pending_contributions()?;
        self.advance_to(DkgPhase::Complain)?;

        for member in &mut self.members {
            if !member.bad && member.contributions.is_empty() {
                member.we_complain = true;
            }
        }

        let Some(my_idx) = self.my_idx else {
            return Ok(Vec::new());
        };
        let my_id = self.my_id.expect("my_idx implies my_id");

        if self.faults.complain_lie {
            for member in &mut self.members {
                if member.idx != my_idx {
                    member.we_complain = !member.we_complain;
                }
            }
        }

        let mut complaint = DkgComplaint::new(self.quorum_hash, my_id, self.members.len());
        let mut any = false;
        for member in &self.members {
            if member.bad {
                complaint.bad_members.set(member.idx, true);
                any = true;
            } else if member.we_complain {
                complaint.complain_for_members.set(member.idx, true);
                any = true;
            }
        }
        if !any {
            return Ok(Vec::new());
        }

        self.sign_message(&mut complaint)?;
        Ok(vec![DkgAction::BroadcastComplaint(complaint)])
    }

    pub fn pre_verify_complaint(&self, msg: &DkgComplaint) -> PreVerify {
        if msg.quorum_hash != self.quorum_hash {
            return PreVerify::Reject;
        }
        if !self.members_map.contains_key(&msg.member_id) {
            return PreVerify::Punish;
        }
        if msg.bad_members.len() != self.members.len()
            || msg.complain_for_members.len() != self.members.len()
        {
            return PreVerify::Punish;
        }
        PreVerify::Accept
    }

    pub fn receive_complaint(&mut self, hash: H256, msg: DkgComplaint) -> Result<()> {
        if self.phase < DkgPhase::Complain {
            return Err(anyhow::Error::new(DkgErrorKind::WrongPhase));
        }
        let complainer_idx = *self
            .members_map
            .get(&msg.member_id)
            .ok_or_else(|| anyhow::Error::new(DkgErrorKind::UnknownMember))?;

        if !self.archive.insert_complaint(hash, msg.clone()) {
            return Ok(());
        }
        self.members[complainer_idx].complaints.insert(hash);
        if self.members[complainer_idx].complaints.len() > 1 {
            tracing::warn!(
                quorum = ?self.quorum_hash,
                member = %msg.member_id,
                "conflicting complaint received",
            );
            self.mark_bad(complainer_idx);
            return Ok(());
        }

        for accused_idx in msg.complain_for_members.iter_ones() {
            if accused_idx >= self.members.len() {
                continue;
            }
            self.members[accused_idx].someone_complain = true;
            if Some(accused_idx) == self.my_idx {
                self.complainers_against_us.insert(complainer_idx);
            }
        }

        Ok(())
    }

    // Phase 3: justification

    /// Reveals the disputed shares when we were accused and disagree.
    pub fn verify_and_justify(&mut self) -> Result<Vec<DkgAction>> {
        self.advance_to(DkgPhase::Justify)?;

        let Some(_my_idx) = self.my_idx else {
            return Ok(Vec::new());
        };
        let my_id = self.my_id.expect("my_idx implies my_id");

        if self.complainers_against_us.is_empty() || self.dealt_shares.is_empty() {
            return Ok(Vec::new());
        }
        if self.faults.justify_omit {
            tracing::debug!(quorum = ?self.quorum_hash, "simulating justification omission");
            return Ok(Vec::new());
        }

        let mut contributions = Vec::new();
        for complainer_idx in &self.complainers_against_us {
            let mut share = self.dealt_shares[*complainer_idx];
            if self.faults.justify_lie {
                share.0[0] ^= 0xff;
            }
            contributions.push(JustifiedShare {
                index: *complainer_idx as u32,
                share,
            });
        }

        let mut msg = DkgJustification {
            quorum_hash: self.quorum_hash,
            member_id: my_id,
            contributions,
            sig: Default::default(),
        };
        self.sign_message(&mut msg)?;
        Ok(vec![DkgAction::BroadcastJustification(msg)])
    }

    pub fn pre_verify_justification(&self, msg: &DkgJustification) -> PreVerify {
        if msg.quorum_hash != self.quorum_hash {
            return PreVerify::Reject;
        }
        if !self.members_map.contains_key(&msg.member_id) {
            return PreVerify::Punish;
        }
        if msg.contributions.is_empty()
            || msg
                .contributions
                .iter()
                .any(|entry| entry.index as usize >= self.members.len())
        {
            return PreVerify::Punish;
        }
        PreVerify::Accept
    }

    /// Validates disclosed shares; a valid disclosure addressed to us closes
    /// the gap left by a failed Contribute-phase verification.
    pub fn receive_justification(&mut self, hash: H256, msg: DkgJustification) -> Result<()> {
        if self.phase < DkgPhase::Justify {
            return Err(anyhow::Error::new(DkgErrorKind::WrongPhase));
        }
        let idx = *self
            .members_map
            .get(&msg.member_id)
            .ok_or_else(|| anyhow::Error::new(DkgErrorKind::UnknownMember))?;

        if !self.archive.insert_justification(hash, msg.clone()) {
            return Ok(());
        }
        self.members[idx].justifications.insert(hash);
        if self.members[idx].justifications.len() > 1 {
            tracing::warn!(
                quorum = ?self.quorum_hash,
                member = %msg.member_id,
                "conflicting justification received",
            );
            self.mark_bad(idx);
            return Ok(());
        }

        let Some(vvec) = self.received_vvecs[idx].clone() else {
            // Justifying without a contribution proves nothing.
            self.mark_bad(idx);
            return Ok(());
        };

        let mut all_valid = true;
        for entry in &msg.contributions {
            let receiver_idx = entry.index as usize;
            let receiver_scalar = self.members[receiver_idx].scalar_id;
            if !self
                .backend
                .verify_contribution_share(receiver_scalar, &entry.share, &vvec)
            {
                all_valid = false;
                break;
            }

            if Some(receiver_idx) == self.my_idx {
                self.received_shares[idx] = Some(entry.share);
                self.members[idx].we_complain = false;
                self.persist_verified(idx, &vvec, &entry.share)?;
            }
        }

        if all_valid {
            self.members[idx].justified = true;
        } else {
            tracing::debug!(
                quorum = ?self.quorum_hash,
                member = %msg.member_id,
                "justification with invalid share",
            );
            self.mark_bad(idx);
        }

        Ok(())
    }

    // Phase 4: commit

    /// Settles the valid-member set and broadcasts our premature commitment.
    /// Aborts the session without output when fewer than `min_size` members
    /// remain eligible.
    pub fn verify_and_commit(&mut self) -> Result<Vec<DkgAction>> {
        self.advance_to(DkgPhase::Commit)?;

        for idx in 0..self.members.len() {
            if self.members[idx].bad {
                continue;
            }
            if self.members[idx].contributions.is_empty() {
                self.mark_bad(idx);
            } else if self.members[idx].someone_complain && !self.members[idx].justified {
                self.mark_bad(idx);
            }
        }

        let eligible = self.members.iter().filter(|m| !m.bad).count();
        if eligible < self.params.min_size {
            tracing::warn!(
                quorum = ?self.quorum_hash,
                eligible,
                min_size = self.params.min_size,
                "not enough eligible members, aborting session",
            );
            self.aborted = true;
            return Ok(Vec::new());
        }

        let Some(my_idx) = self.my_idx else {
            return Ok(Vec::new());
        };
        if self.members[my_idx].bad {
            return Ok(Vec::new());
        }
        if self.faults.commit_omit {
            tracing::debug!(quorum = ?self.quorum_hash, "simulating commitment omission");
            return Ok(Vec::new());
        }

        let mut valid_members = MemberMask::new(self.members.len());
        for member in &self.members {
            if !member.bad {
                valid_members.set(member.idx, true);
            }
        }

        let (quorum_public_key, quorum_vvec_hash) = self.claim_for(&valid_members)?;

        let mut sk_shares = Vec::new();
        for idx in valid_members.iter_ones() {
            let share = self.received_shares[idx]
                .ok_or_else(|| anyhow::Error::new(DkgErrorKind::MissingSecretShare))?;
            sk_shares.push(share);
        }
        let quorum_sk_share = self.backend.aggregate_secrets(&sk_shares);

        let mut msg = DkgPrematureCommitment {
            quorum_hash: self.quorum_hash,
            member_id: self.my_id.expect("my_idx implies my_id"),
            valid_members,
            quorum_public_key,
            quorum_vvec_hash,
            quorum_sig: Default::default(),
            sig: Default::default(),
        };
        let commitment_hash = msg.commitment_hash();
        msg.quorum_sig = self.backend.sign(&quorum_sk_share, commitment_hash);
        if self.faults.commit_lie {
            msg.quorum_sig.0[0] ^= 0xff;
        }
        self.sign_message(&mut msg)?;

        Ok(vec![DkgAction::BroadcastCommitment(Box::new(msg))])
    }

    /// Quorum public key and verification-vector hash implied by a
    /// valid-member set, computed from our received contributions.
    fn claim_for(&self, valid_members: &MemberMask) -> Result<(BlsPublicKey, H256)> {
        let mut first_rows = Vec::new();
        let mut vvecs = Vec::new();
        for idx in valid_members.iter_ones() {
            let vvec = self.received_vvecs[idx]
                .as_ref()
                .ok_or_else(|| anyhow::Error::new(DkgErrorKind::MissingVerificationVector))?;
            first_rows.push(vvec[0]);
            vvecs.push(vvec);
        }
        let quorum_public_key = self.backend.aggregate_public_keys(&first_rows);
        let quorum_vvec_hash = vvec_digest(&vvecs);
        Ok((quorum_public_key, quorum_vvec_hash))
    }

    pub fn pre_verify_commitment(&self, msg: &DkgPrematureCommitment) -> PreVerify {
        if msg.quorum_hash != self.quorum_hash {
            return PreVerify::Reject;
        }
        if !self.members_map.contains_key(&msg.member_id) {
            return PreVerify::Punish;
        }
        if msg.valid_members.len() != self.members.len() {
            return PreVerify::Punish;
        }
        if msg.count_valid_members() < self.params.min_size {
            return PreVerify::Punish;
        }
        if !msg.quorum_public_key.is_valid() || !msg.quorum_sig.is_valid() {
            return PreVerify::Punish;
        }
        PreVerify::Accept
    }

    /// Accepts a premature commitment whose operator signature already
    /// verified; full claim validation happens here. Only the first
    /// commitment per distinct claim tuple from a member counts toward
    /// aggregation, but conflicting ones are retained.
    pub fn receive_commitment(&mut self, hash: H256, msg: DkgPrematureCommitment) -> Result<()> {
        if self.phase < DkgPhase::Commit {
            return Err(anyhow::Error::new(DkgErrorKind::WrongPhase));
        }
        let idx = *self
            .members_map
            .get(&msg.member_id)
            .ok_or_else(|| anyhow::Error::new(DkgErrorKind::UnknownMember))?;

        if !self.archive.insert_commitment(hash, msg.clone()) {
            return Ok(());
        }
        self.members[idx].premature_commitments.insert(hash);

        if self.members[idx].bad {
            // Stored as evidence; excluded from aggregation.
            return Ok(());
        }
        if !msg.valid_members.get(idx) {
            tracing::debug!(
                quorum = ?self.quorum_hash,
                member = %msg.member_id,
                "commitment excludes its own sender",
            );
            return Ok(());
        }

        // Recompute the claim from our own data; a diverging local view is
        // not punishable, the commitment just does not count.
        let recomputed = match self.claim_for(&msg.valid_members) {
            Ok(claim) => claim,
            Err(_) => {
                tracing::debug!(
                    quorum = ?self.quorum_hash,
                    member = %msg.member_id,
                    "cannot validate commitment, missing contributions",
                );
                return Ok(());
            }
        };
        if recomputed != (msg.quorum_public_key, msg.quorum_vvec_hash) {
            tracing::debug!(
                quorum = ?self.quorum_hash,
                member = %msg.member_id,
                "commitment claim does not match local view",
            );
            return Ok(());
        }

        // The threshold-signature share must verify under the member's public
        // key share implied by the claimed member set.
        let vvecs: Vec<&VerificationVector> = msg
            .valid_members
            .iter_ones()
            .filter_map(|member_idx| self.received_vvecs[member_idx].as_ref())
            .collect();
        let pk_share = self
            .backend
            .quorum_public_key_share(&vvecs, self.members[idx].scalar_id);
        if !self
            .backend
            .verify(&pk_share, msg.commitment_hash(), &msg.quorum_sig)
        {
            tracing::debug!(
                quorum = ?self.quorum_hash,
                member = %msg.member_id,
                "invalid threshold signature share in commitment",
            );
            return Ok(());
        }

        self.valid_commitments.lock().insert(hash);
        Ok(())
    }

    // Phase 5: finalize

    /// Aggregates premature commitments into final commitments. Groups share
    /// an identical claim tuple; each group with at least `min_size` distinct
    /// signers yields one commitment. Multiplicity is a per-quorum-type
    /// decision (`indexed_commitments`).
    pub fn finalize_commitments(&mut self) -> Result<Vec<FinalCommitment>> {
        self.advance_to(DkgPhase::Finalize)?;
        if self.aborted {
            return Ok(Vec::new());
        }

        let valid = self.valid_commitments.lock().clone();
        let mut groups: BTreeMap<H256, Vec<DkgPrematureCommitment>> = BTreeMap::new();
        for hash in valid {
            if let Some(msg) = self.archive.commitment(hash) {
                groups.entry(msg.commitment_hash()).or_default().push(msg);
            }
        }

        let mut out = Vec::new();
        for (commitment_hash, msgs) in groups {
            let mut seen_members = BTreeSet::new();
            let unique: Vec<&DkgPrematureCommitment> = msgs
                .iter()
                .filter(|msg| seen_members.insert(msg.member_id))
                .collect();
            if unique.len() < self.params.min_size {
                continue;
            }

            let mut signers = MemberMask::new(self.members.len());
            let mut member_sigs = Vec::new();
            let mut threshold_shares = Vec::new();
            for msg in &unique {
                let idx = self.members_map[&msg.member_id];
                signers.set(idx, true);
                member_sigs.push(msg.sig);
                threshold_shares.push((self.members[idx].scalar_id, msg.quorum_sig));
            }

            let Some(quorum_sig) = self.backend.threshold_recover(&threshold_shares) else {
                tracing::warn!(
                    quorum = ?self.quorum_hash,
                    "threshold recovery failed for commitment group",
                );
                continue;
            };
            let template = unique[0];
            if !self
                .backend
                .verify(&template.quorum_public_key, commitment_hash, &quorum_sig)
            {
                tracing::warn!(
                    quorum = ?self.quorum_hash,
                    "recovered quorum signature does not verify",
                );
                continue;
            }

            out.push(FinalCommitment {
                version: FinalCommitment::CURRENT_VERSION,
                quorum_hash: self.quorum_hash,
                signers,
                valid_members: template.valid_members.clone(),
                quorum_public_key: template.quorum_public_key,
                quorum_vvec_hash: template.quorum_vvec_hash,
                quorum_sig,
                members_sig: self.backend.aggregate_signatures(&member_sigs),
            });
        }

        if !self.params.indexed_commitments && out.len() > 1 {
            out.truncate(1);
        }

        Ok(out)
    }
}
