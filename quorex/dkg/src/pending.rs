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

//! FIFO queue for pre-verified DKG messages awaiting batched signature
//! verification. One instance exists per message type; per-origin counts are
//! bounded and content hashes are deduplicated.

use parking_lot::Mutex;
use quorex_common::{
    H256, MemberId, OriginId,
    bls::{BlsBackend, BlsBatchVerifier, BlsPublicKey},
    messages::SignedDkgMessage,
};
use std::collections::{HashMap, HashSet, VecDeque};

pub struct PendingMessages<M> {
    max_per_origin: usize,
    inner: Mutex<PendingInner<M>>,
}

struct PendingInner<M> {
    queue: VecDeque<(OriginId, M)>,
    per_origin: HashMap<OriginId, usize>,
    seen: HashSet<H256>,
}

impl<M: SignedDkgMessage> PendingMessages<M> {
    pub fn new(max_per_origin: usize) -> Self {
        Self {
            max_per_origin,
            inner: Mutex::new(PendingInner {
                queue: VecDeque::new(),
                per_origin: HashMap::new(),
                seen: HashSet::new(),
            }),
        }
    }

    /// Enqueues a message. Returns `false` when it was already seen or the
    /// origin exceeded its budget; such messages are dropped, not queued.
    pub fn push(&self, origin: OriginId, msg: M) -> bool {
        let hash = msg.content_hash();
        let mut inner = self.inner.lock();

        if !inner.seen.insert(hash) {
            return false;
        }
        let count = inner.per_origin.entry(origin).or_insert(0);
        if *count >= self.max_per_origin {
            tracing::debug!(%origin, "dropping message, origin over budget");
            return false;
        }
        *count += 1;
        inner.queue.push_back((origin, msg));
        true
    }

    /// Pops up to `max` messages in arrival order.
    pub fn pop(&self, max: usize) -> Vec<(OriginId, M)> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        while out.len() < max {
            let Some((origin, msg)) = inner.queue.pop_front() else {
                break;
            };
            if let Some(count) = inner.per_origin.get_mut(&origin) {
                *count = count.saturating_sub(1);
            }
            out.push((origin, msg));
        }
        out
    }

    pub fn has_seen(&self, hash: H256) -> bool {
        self.inner.lock().seen.contains(&hash)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.per_origin.clear();
        inner.seen.clear();
    }
}

/// Result of one batched signature pass.
pub struct VerifiedBatch<M> {
    /// `(origin, content hash, message)` triples with a valid signature.
    pub accepted: Vec<(OriginId, H256, M)>,
    /// Origins that contributed at least one invalid message.
    pub bad_origins: Vec<OriginId>,
}

/// Runs one cryptographic batch over pre-verified messages. Messages from an
/// unresolvable member count against their origin.
pub fn verify_signed_batch<M: SignedDkgMessage>(
    backend: &dyn BlsBackend,
    resolve_key: impl Fn(MemberId) -> Option<BlsPublicKey>,
    batch: Vec<(OriginId, M)>,
) -> VerifiedBatch<M> {
    let mut verifier = BlsBatchVerifier::<OriginId, H256>::new();
    let mut entries = Vec::with_capacity(batch.len());

    for (origin, msg) in batch {
        let hash = msg.content_hash();
        match resolve_key(msg.member_id()) {
            Some(pubkey) => {
                verifier.push_message(origin, hash, msg.sign_digest(), *msg.signature(), pubkey);
                entries.push((origin, hash, msg));
            }
            None => verifier.mark_bad_source(origin),
        }
    }

    verifier.verify(backend);

    let accepted = entries
        .into_iter()
        .filter(|(origin, hash, _)| {
            !verifier.is_bad_source(*origin) && !verifier.bad_messages().contains(hash)
        })
        .collect();

    VerifiedBatch {
        accepted,
        bad_origins: verifier.bad_sources().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorex_common::{
        MemberId, QuorumHash, hash_bytes,
        bls::{BlsSecretKey, InsecureBls},
        messages::DkgComplaint,
    };

    fn signed_complaint(seed: u8, secret: &BlsSecretKey) -> DkgComplaint {
        let bls = InsecureBls;
        let mut msg = DkgComplaint::new(
            QuorumHash::repeat_byte(1),
            MemberId(hash_bytes(&[seed])),
            4,
        );
        msg.complain_for_members.set(seed as usize % 4, true);
        msg.sig = bls.sign(secret, msg.sign_digest());
        msg
    }

    #[test]
    fn push_deduplicates_and_bounds_per_origin() {
        let bls = InsecureBls;
        let sk = bls.secret_from_seed(b"queue");
        let queue = PendingMessages::new(2);
        let origin = OriginId(7);

        let msg = signed_complaint(0, &sk);
        assert!(queue.push(origin, msg.clone()));
        // Same content hash is dropped.
        assert!(!queue.push(origin, msg.clone()));
        assert!(queue.has_seen(msg.content_hash()));

        assert!(queue.push(origin, signed_complaint(1, &sk)));
        // Third distinct message exceeds the per-origin budget.
        assert!(!queue.push(origin, signed_complaint(2, &sk)));
        // Another origin still has room.
        assert!(queue.push(OriginId(8), signed_complaint(3, &sk)));

        let popped = queue.pop(10);
        assert_eq!(popped.len(), 3);
        assert!(queue.is_empty());

        // Popping freed the origin budget.
        assert!(queue.push(origin, signed_complaint(9, &sk)));
    }

    #[test]
    fn batch_verification_drops_only_bad_origins() {
        let bls = InsecureBls;
        let honest_sk = bls.secret_from_seed(b"honest");
        let honest_pk = bls.public_key(&honest_sk);

        let good = signed_complaint(0, &honest_sk);
        let mut forged = signed_complaint(1, &honest_sk);
        forged.sig = bls.sign(&bls.secret_from_seed(b"forger"), forged.sign_digest());

        let result = verify_signed_batch(
            &bls,
            |_member| Some(honest_pk),
            vec![(OriginId(1), good.clone()), (OriginId(2), forged)],
        );

        assert_eq!(result.bad_origins, vec![OriginId(2)]);
        assert_eq!(result.accepted.len(), 1);
        assert_eq!(result.accepted[0].0, OriginId(1));
        assert_eq!(result.accepted[0].1, good.content_hash());
    }

    #[test]
    fn unknown_member_counts_against_origin() {
        let bls = InsecureBls;
        let sk = bls.secret_from_seed(b"unknown");
        let msg = signed_complaint(0, &sk);

        let result = verify_signed_batch(&bls, |_member| None, vec![(OriginId(3), msg)]);
        assert_eq!(result.bad_origins, vec![OriginId(3)]);
        assert!(result.accepted.is_empty());
    }
}
