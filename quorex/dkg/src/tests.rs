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

//! Full DKG rounds over an in-memory network of sessions.

use anyhow::Result;
use parking_lot::Mutex;
use quorex_common::{
    H256, MemberId, MemberMask, QuorumHash, QuorumParams,
    bls::{BlsBackend, BlsSecretKey, InsecureBls, VerificationVector},
    hash_bytes,
    messages::{
        DkgComplaint, DkgContribution, DkgJustification, DkgPrematureCommitment, FinalCommitment,
    },
    oracle::MasternodeEntry,
};
use quorex_common::OriginId;
use crate::{
    ContributionSink, DkgAction, DkgSession, DkgSessionConfig, DkgSessionManager, FaultSim,
    PreVerify, pending::verify_signed_batch,
};
use quorex_db::MemDb;
use std::{collections::HashMap, sync::Arc};

/// Sink that counts persist calls per member on top of the real manager.
#[derive(Clone)]
struct CountingSink {
    manager: Arc<DkgSessionManager<MemDb>>,
    share_writes: Arc<Mutex<HashMap<MemberId, usize>>>,
}

impl ContributionSink for CountingSink {
    fn persist_vvec_contribution(
        &self,
        quorum_hash: QuorumHash,
        member: MemberId,
        vvec: &VerificationVector,
    ) -> Result<()> {
        self.manager
            .persist_vvec_contribution(quorum_hash, member, vvec)
    }

    fn persist_sk_share(
        &self,
        quorum_hash: QuorumHash,
        member: MemberId,
        share: &BlsSecretKey,
    ) -> Result<()> {
        *self.share_writes.lock().entry(member).or_insert(0) += 1;
        self.manager.persist_sk_share(quorum_hash, member, share)
    }
}

struct Node {
    session: DkgSession<CountingSink>,
    manager: Arc<DkgSessionManager<MemDb>>,
    share_writes: Arc<Mutex<HashMap<MemberId, usize>>>,
}

struct Network {
    quorum_hash: QuorumHash,
    params: QuorumParams,
    entries: Vec<MasternodeEntry>,
    nodes: Vec<Node>,
}

fn build_network(size: usize, threshold: usize, faults: &[(usize, FaultSim)]) -> Network {
    let bls = InsecureBls;
    let quorum_hash = H256::repeat_byte(0x51);
    let params = QuorumParams::small(size, threshold);

    let mut entries = Vec::new();
    let mut secrets = Vec::new();
    for idx in 0..size {
        let sk = bls.secret_from_seed(&[idx as u8, 0x11]);
        entries.push(MasternodeEntry {
            id: MemberId(hash_bytes(&[idx as u8, 0x22])),
            operator_key: bls.public_key(&sk),
        });
        secrets.push(sk);
    }

    let nodes = (0..size)
        .map(|idx| {
            let manager = Arc::new(DkgSessionManager::new(MemDb::default()));
            let share_writes = Arc::new(Mutex::new(HashMap::new()));
            let sink = CountingSink {
                manager: manager.clone(),
                share_writes: share_writes.clone(),
            };
            let fault = faults
                .iter()
                .find(|(node, _)| *node == idx)
                .map(|(_, fault)| fault.clone())
                .unwrap_or_else(FaultSim::none);
            let session = DkgSession::new(
                DkgSessionConfig {
                    quorum_hash,
                    params: params.clone(),
                    members: entries.clone(),
                    my_id: Some(entries[idx].id),
                    operator_secret: Some(secrets[idx]),
                },
                Arc::new(InsecureBls),
                sink,
                fault,
            )
            .expect("session init");
            manager.attach_archive(quorum_hash, session.archive());
            Node {
                session,
                manager,
                share_writes,
            }
        })
        .collect();

    Network {
        quorum_hash,
        params,
        entries,
        nodes,
    }
}

/// Delivers broadcasts through the full pipeline: structural pre-verify,
/// batched signature verification, then acceptance.
macro_rules! deliver {
    ($network:expr, $messages:expr, $pre:ident, $receive:ident) => {{
        for node in $network.nodes.iter_mut() {
            let mut batch = Vec::new();
            for (origin, msg) in $messages.iter() {
                match node.session.$pre(msg) {
                    PreVerify::Accept => batch.push((*origin, msg.clone())),
                    outcome => panic!("unexpected pre-verify outcome: {outcome:?}"),
                }
            }
            let verified = verify_signed_batch(
                &InsecureBls,
                |member| node.session.member_operator_key(member),
                batch,
            );
            assert!(verified.bad_origins.is_empty(), "honest signatures only");
            for (_origin, hash, msg) in verified.accepted {
                node.session.$receive(hash, msg).expect("receive");
            }
        }
    }};
}

fn collect_contributions(actions: Vec<(usize, Vec<DkgAction>)>) -> Vec<(OriginId, DkgContribution)> {
    actions
        .into_iter()
        .flat_map(|(origin, actions)| {
            actions.into_iter().filter_map(move |action| match action {
                DkgAction::BroadcastContribution(msg) => Some((OriginId(origin as u64), *msg)),
                _ => None,
            })
        })
        .collect()
}

fn collect_complaints(actions: Vec<(usize, Vec<DkgAction>)>) -> Vec<(OriginId, DkgComplaint)> {
    actions
        .into_iter()
        .flat_map(|(origin, actions)| {
            actions.into_iter().filter_map(move |action| match action {
                DkgAction::BroadcastComplaint(msg) => Some((OriginId(origin as u64), msg)),
                _ => None,
            })
        })
        .collect()
}

fn collect_justifications(
    actions: Vec<(usize, Vec<DkgAction>)>,
) -> Vec<(OriginId, DkgJustification)> {
    actions
        .into_iter()
        .flat_map(|(origin, actions)| {
            actions.into_iter().filter_map(move |action| match action {
                DkgAction::BroadcastJustification(msg) => Some((OriginId(origin as u64), msg)),
                _ => None,
            })
        })
        .collect()
}

fn collect_commitments(
    actions: Vec<(usize, Vec<DkgAction>)>,
) -> Vec<(OriginId, DkgPrematureCommitment)> {
    actions
        .into_iter()
        .flat_map(|(origin, actions)| {
            actions.into_iter().filter_map(move |action| match action {
                DkgAction::BroadcastCommitment(msg) => Some((OriginId(origin as u64), *msg)),
                _ => None,
            })
        })
        .collect()
}

/// Runs all five phases and returns each node's finalized commitments.
fn run_session(network: &mut Network) -> Vec<Vec<FinalCommitment>> {
    let contributions = collect_contributions(
        network
            .nodes
            .iter_mut()
            .enumerate()
            .map(|(idx, node)| (idx, node.session.contribute().expect("contribute")))
            .collect(),
    );
    deliver!(
        network,
        contributions,
        pre_verify_contribution,
        receive_contribution
    );

    let complaints = collect_complaints(
        network
            .nodes
            .iter_mut()
            .enumerate()
            .map(|(idx, node)| (idx, node.session.verify_and_complain().expect("complain")))
            .collect(),
    );
    deliver!(network, complaints, pre_verify_complaint, receive_complaint);

    let justifications = collect_justifications(
        network
            .nodes
            .iter_mut()
            .enumerate()
            .map(|(idx, node)| (idx, node.session.verify_and_justify().expect("justify")))
            .collect(),
    );
    deliver!(
        network,
        justifications,
        pre_verify_justification,
        receive_justification
    );

    let commitments = collect_commitments(
        network
            .nodes
            .iter_mut()
            .enumerate()
            .map(|(idx, node)| (idx, node.session.verify_and_commit().expect("commit")))
            .collect(),
    );
    deliver!(
        network,
        commitments,
        pre_verify_commitment,
        receive_commitment
    );

    network
        .nodes
        .iter_mut()
        .map(|node| node.session.finalize_commitments().expect("finalize"))
        .collect()
}

#[test]
fn honest_session_finalizes_one_commitment() {
    let mut network = build_network(5, 3, &[]);
    let finalized = run_session(&mut network);

    let reference = &finalized[0][0];
    for commitments in &finalized {
        assert_eq!(commitments.len(), 1, "exactly one final commitment");
        assert_eq!(&commitments[0], reference, "all nodes agree");
    }

    assert_eq!(reference.count_valid_members(), 5);
    assert_eq!(reference.count_signers(), 5);
    assert!(reference.verify_sizes(&network.params));

    // The recovered threshold signature verifies under the quorum key.
    let bls = InsecureBls;
    assert!(bls.verify(
        &reference.quorum_public_key,
        reference.commitment_hash(),
        &reference.quorum_sig,
    ));

    // The aggregated members signature verifies under the signers' keys.
    let pairs: Vec<_> = reference
        .signers
        .iter_ones()
        .map(|idx| {
            (
                network.entries[idx].operator_key,
                reference.commitment_hash(),
            )
        })
        .collect();
    assert!(bls.verify_aggregated_insecure(&pairs, &reference.members_sig));

    // Every node persisted all five verified contributions and can rebuild
    // its signing inputs.
    for node in &network.nodes {
        let (indexes, vvecs, shares) = node
            .manager
            .get_verified_contributions(
                network.quorum_hash,
                &network.entries,
                &reference.valid_members,
            )
            .expect("verified contributions");
        assert_eq!(indexes.len(), 5);
        assert_eq!(vvecs.len(), 5);
        assert_eq!(shares.len(), 5);
    }
}

#[test]
fn contribution_omission_excludes_member_without_aborting() {
    let faults = [(4usize, FaultSim::none().with_contribution_omit())];
    let mut network = build_network(5, 3, &faults);
    let finalized = run_session(&mut network);

    let omitted = network.entries[4].id;
    let reference = &finalized[0][0];
    for commitments in &finalized {
        assert_eq!(commitments.len(), 1);
        assert_eq!(&commitments[0], reference);
    }

    let mut expected_valid = MemberMask::new(5);
    for idx in 0..4 {
        expected_valid.set(idx, true);
    }
    assert_eq!(reference.valid_members, expected_valid);
    assert_eq!(reference.count_signers(), 4);

    // The omitting member was complained about and never persisted.
    for node in &network.nodes[..4] {
        assert_eq!(node.share_writes.lock().get(&omitted), None);
    }
}

#[test]
fn lying_member_recovers_through_justification() {
    let faults = [(2usize, FaultSim::none().with_contribution_lie())];
    let mut network = build_network(5, 3, &faults);
    let finalized = run_session(&mut network);

    let liar = network.entries[2].id;
    let reference = &finalized[0][0];
    for commitments in &finalized {
        assert_eq!(commitments.len(), 1);
        assert_eq!(&commitments[0], reference);
    }

    // The justification repaired the member: full quorum survives.
    assert_eq!(reference.count_valid_members(), 5);
    assert_eq!(reference.count_signers(), 5);

    // The justified share was forwarded to the manager exactly once.
    for (idx, node) in network.nodes.iter().enumerate() {
        if idx == 2 {
            continue;
        }
        assert_eq!(node.share_writes.lock().get(&liar), Some(&1));
    }
}

#[test]
fn unjustified_accusation_excludes_member() {
    let faults = [(
        2usize,
        FaultSim::none().with_contribution_lie().with_justify_omit(),
    )];
    let mut network = build_network(5, 3, &faults);
    let finalized = run_session(&mut network);

    let reference = &finalized[0][0];
    assert_eq!(reference.count_valid_members(), 4);
    assert!(!reference.valid_members.get(2));
}

#[test]
fn session_aborts_below_min_size() {
    let faults = [
        (1usize, FaultSim::none().with_contribution_omit()),
        (2usize, FaultSim::none().with_contribution_omit()),
        (3usize, FaultSim::none().with_contribution_omit()),
    ];
    let mut network = build_network(5, 3, &faults);
    let finalized = run_session(&mut network);

    for (commitments, node) in finalized.iter().zip(&network.nodes) {
        assert!(commitments.is_empty(), "no commitment below min size");
        assert!(node.session.is_aborted());
    }
}
