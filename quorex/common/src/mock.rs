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

//! Test doubles for the consumed capabilities.

use crate::{
    H256, MemberId, MemberMask, MsgHash, OriginId, QuorumHash, QuorumParams, SigningId,
    bls::{BlsBackend, BlsSecretKey, InsecureBls},
    hash_bytes,
    messages::RecoveredSig,
    oracle::{
        ChainOracle, MasternodeEntry, PeerReporter, QuorumInfo, QuorumRegistry,
        RecoveredSigListener, ShareSigner,
    },
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

#[derive(Default)]
pub struct MockChain {
    heights: Mutex<HashMap<H256, u32>>,
    tip: AtomicU32,
}

impl MockChain {
    pub fn add_block(&self, hash: H256, height: u32) {
        self.heights.lock().insert(hash, height);
        self.tip.fetch_max(height, Ordering::SeqCst);
    }

    pub fn set_tip(&self, height: u32) {
        self.tip.store(height, Ordering::SeqCst);
    }
}

impl ChainOracle for MockChain {
    fn block_height(&self, hash: H256) -> Option<u32> {
        self.heights.lock().get(&hash).copied()
    }

    fn is_on_active_chain(&self, hash: H256) -> bool {
        self.heights.lock().contains_key(&hash)
    }

    fn active_height(&self) -> u32 {
        self.tip.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockRegistry {
    quorums: Mutex<Vec<(Arc<QuorumInfo>, bool)>>,
}

impl MockRegistry {
    pub fn add_quorum(&self, quorum: Arc<QuorumInfo>, active: bool) {
        self.quorums.lock().push((quorum, active));
    }

    pub fn set_active(&self, quorum_hash: QuorumHash, active: bool) {
        for (quorum, flag) in self.quorums.lock().iter_mut() {
            if quorum.quorum_hash == quorum_hash {
                *flag = active;
            }
        }
    }
}

impl QuorumRegistry for MockRegistry {
    fn quorum(&self, quorum_hash: QuorumHash) -> Option<Arc<QuorumInfo>> {
        self.quorums
            .lock()
            .iter()
            .find(|(quorum, _)| quorum.quorum_hash == quorum_hash)
            .map(|(quorum, _)| quorum.clone())
    }

    fn scan_quorums(&self, count: usize) -> Vec<Arc<QuorumInfo>> {
        self.quorums
            .lock()
            .iter()
            .rev()
            .filter(|(_, active)| *active)
            .take(count)
            .map(|(quorum, _)| quorum.clone())
            .collect()
    }

    fn is_active(&self, quorum_hash: QuorumHash) -> bool {
        self.quorums
            .lock()
            .iter()
            .any(|(quorum, active)| *active && quorum.quorum_hash == quorum_hash)
    }
}

#[derive(Default)]
pub struct MockReporter {
    pub misbehaving: Mutex<Vec<(OriginId, i32, String)>>,
    pub relayed: Mutex<Vec<H256>>,
}

impl PeerReporter for MockReporter {
    fn misbehaving(&self, origin: OriginId, score: i32, reason: &str) {
        self.misbehaving
            .lock()
            .push((origin, score, reason.to_string()));
    }

    fn relay_recovered_sig(&self, hash: H256) {
        self.relayed.lock().push(hash);
    }
}

#[derive(Default)]
pub struct MockShareSigner {
    pub signed: Mutex<Vec<(QuorumHash, SigningId, MsgHash)>>,
    pub reannounced: Mutex<Vec<(QuorumHash, SigningId, MsgHash)>>,
}

impl ShareSigner for MockShareSigner {
    fn async_sign(&self, quorum: Arc<QuorumInfo>, id: SigningId, msg_hash: MsgHash) {
        self.signed.lock().push((quorum.quorum_hash, id, msg_hash));
    }

    fn force_reannouncement(&self, quorum: Arc<QuorumInfo>, id: SigningId, msg_hash: MsgHash) {
        self.reannounced
            .lock()
            .push((quorum.quorum_hash, id, msg_hash));
    }
}

#[derive(Default)]
pub struct CollectingListener {
    pub received: Mutex<Vec<RecoveredSig>>,
}

impl RecoveredSigListener for CollectingListener {
    fn handle_new_recovered_sig(&self, sig: &RecoveredSig) {
        self.received.lock().push(sig.clone());
    }
}

/// A mined quorum with the secrets needed to forge its signatures in tests.
pub struct TestQuorum {
    pub info: Arc<QuorumInfo>,
    pub quorum_secret: BlsSecretKey,
    pub operator_secrets: Vec<BlsSecretKey>,
}

impl TestQuorum {
    /// Threshold signature of this quorum over a signing session.
    pub fn recovered_sig(&self, id: SigningId, msg_hash: MsgHash) -> RecoveredSig {
        let bls = InsecureBls;
        let sign_hash = crate::build_sign_hash(self.info.quorum_hash, id, msg_hash);
        RecoveredSig {
            quorum_hash: self.info.quorum_hash,
            id,
            msg_hash,
            sig: bls.sign(&self.quorum_secret, sign_hash),
        }
    }
}

/// Builds a deterministic quorum of `size` members from a seed.
pub fn test_quorum(seed: u8, size: usize, params: QuorumParams) -> TestQuorum {
    let bls = InsecureBls;
    let quorum_hash = H256::repeat_byte(seed);
    let quorum_secret = bls.secret_from_seed(&[seed, 0x51]);

    let mut members = Vec::with_capacity(size);
    let mut operator_secrets = Vec::with_capacity(size);
    let mut valid_members = MemberMask::new(size);
    for idx in 0..size {
        let id = MemberId(hash_bytes(&[seed, idx as u8, 0x4d]));
        let sk = bls.secret_from_seed(&[seed, idx as u8, 0x4f]);
        members.push(MasternodeEntry {
            id,
            operator_key: bls.public_key(&sk),
        });
        operator_secrets.push(sk);
        valid_members.set(idx, true);
    }

    let info = Arc::new(QuorumInfo {
        quorum_hash,
        params,
        public_key: bls.public_key(&quorum_secret),
        members,
        valid_members,
    });

    TestQuorum {
        info,
        quorum_secret,
        operator_secrets,
    }
}
