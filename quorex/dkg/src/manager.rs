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

//! DKG session manager: persistence of verified contribution material and
//! relay access to per-session message archives.
//!
//! Verified `(verification vector, secret share)` pairs are keyed by
//! `(quorum, member)` and written exactly twice at most: once on a verified
//! Contribute message, once on a verified Justify disclosure. Lookups for
//! signing participation are fronted by a short-lived cache whose entries are
//! pruned by a periodic sweep, not by lookups.

use crate::{
    error::DkgErrorKind,
    session::{ContributionSink, SessionArchive},
};
use anyhow::Result;
use parity_scale_codec::{Decode, Encode};
use parking_lot::Mutex;
use quorex_common::{
    H256, MemberId, MemberMask, QuorumHash, QuorumParams,
    bls::{BlsSecretKey, VerificationVector},
    messages::{DkgComplaint, DkgContribution, DkgJustification, DkgPrematureCommitment},
    oracle::{ChainOracle, MasternodeEntry},
};
use quorex_db::{KVDatabase, WriteBatch};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

const KEY_VVEC: u8 = 0x01;
const KEY_SK_SHARE: u8 = 0x02;

const CONTRIBUTION_CACHE_TTL: Duration = Duration::from_secs(60);

fn contribution_key(tag: u8, quorum_hash: QuorumHash, member: MemberId) -> Vec<u8> {
    let mut key = Vec::with_capacity(65);
    key.push(tag);
    key.extend_from_slice(quorum_hash.as_bytes());
    key.extend_from_slice(member.as_bytes());
    key
}

struct CachedContribution {
    inserted_at: Instant,
    vvec: VerificationVector,
    share: BlsSecretKey,
}

/// Owns the verified-contribution store and mediates between sessions and the
/// persistence layer.
pub struct DkgSessionManager<DB> {
    db: DB,
    cache_ttl: Duration,
    contributions_cache: Mutex<HashMap<(QuorumHash, MemberId), CachedContribution>>,
    archives: Mutex<HashMap<QuorumHash, Arc<SessionArchive>>>,
}

impl<DB: KVDatabase> DkgSessionManager<DB> {
    pub fn new(db: DB) -> Self {
        Self {
            db,
            cache_ttl: CONTRIBUTION_CACHE_TTL,
            contributions_cache: Mutex::new(HashMap::new()),
            archives: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Makes a running session's messages available for relay lookups.
    pub fn attach_archive(&self, quorum_hash: QuorumHash, archive: Arc<SessionArchive>) {
        self.archives.lock().insert(quorum_hash, archive);
    }

    /// Drops the archive when the owning handler abandons the session.
    pub fn detach_archive(&self, quorum_hash: QuorumHash) {
        self.archives.lock().remove(&quorum_hash);
    }

    pub fn already_have(&self, hash: H256) -> bool {
        self.archives
            .lock()
            .values()
            .any(|archive| archive.has(hash))
    }

    pub fn get_contribution(&self, hash: H256) -> Option<DkgContribution> {
        self.archives
            .lock()
            .values()
            .find_map(|archive| archive.contribution(hash))
    }

    pub fn get_complaint(&self, hash: H256) -> Option<DkgComplaint> {
        self.archives
            .lock()
            .values()
            .find_map(|archive| archive.complaint(hash))
    }

    pub fn get_justification(&self, hash: H256) -> Option<DkgJustification> {
        self.archives
            .lock()
            .values()
            .find_map(|archive| archive.justification(hash))
    }

    pub fn get_premature_commitment(&self, hash: H256) -> Option<DkgPrematureCommitment> {
        self.archives
            .lock()
            .values()
            .find_map(|archive| archive.commitment(hash))
    }

    /// Reconstructs the data needed to participate in signing for a quorum:
    /// member indexes, verification vectors and our secret shares of every
    /// valid member. Any missing record fails the whole lookup.
    pub fn get_verified_contributions(
        &self,
        quorum_hash: QuorumHash,
        members: &[MasternodeEntry],
        valid_members: &MemberMask,
    ) -> Result<(Vec<u16>, Vec<VerificationVector>, Vec<BlsSecretKey>)> {
        let mut indexes = Vec::new();
        let mut vvecs = Vec::new();
        let mut shares = Vec::new();

        let mut cache = self.contributions_cache.lock();
        for (idx, entry) in members.iter().enumerate() {
            if !valid_members.get(idx) {
                continue;
            }

            let cache_key = (quorum_hash, entry.id);
            if !cache.contains_key(&cache_key) {
                let vvec_raw = self
                    .db
                    .get(&contribution_key(KEY_VVEC, quorum_hash, entry.id))
                    .ok_or_else(|| anyhow::Error::new(DkgErrorKind::MissingVerifiedContribution))?;
                let vvec = VerificationVector::decode(&mut vvec_raw.as_slice())
                    .map_err(|_| anyhow::Error::new(DkgErrorKind::MissingVerifiedContribution))?;

                let share = self
                    .db
                    .get(&contribution_key(KEY_SK_SHARE, quorum_hash, entry.id))
                    .and_then(|raw| BlsSecretKey::decode(&mut raw.as_slice()).ok())
                    .unwrap_or_default();

                cache.insert(
                    cache_key,
                    CachedContribution {
                        inserted_at: Instant::now(),
                        vvec,
                        share,
                    },
                );
            }

            let cached = &cache[&cache_key];
            indexes.push(idx as u16);
            vvecs.push(cached.vvec.clone());
            shares.push(cached.share);
        }

        Ok((indexes, vvecs, shares))
    }

    /// Prunes expired cache entries; driven by a periodic sweep independent
    /// of lookups.
    pub fn cleanup_cache(&self) {
        let mut cache = self.contributions_cache.lock();
        let ttl = self.cache_ttl;
        cache.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
    }

    /// Erases persisted contribution data of quorums whose base block is
    /// unknown or deeper than the retention depth.
    pub fn cleanup_old_contributions(
        &self,
        chain: &dyn ChainOracle,
        params: &QuorumParams,
    ) -> Result<usize> {
        let active_height = chain.active_height();
        let mut batch = WriteBatch::default();
        let mut scanned = 0usize;

        for tag in [KEY_VVEC, KEY_SK_SHARE] {
            for (key, _) in self.db.iter_prefix(&[tag]) {
                if key.len() < 33 {
                    continue;
                }
                scanned += 1;
                let quorum_hash = H256::from_slice(&key[1..33]);
                let stale = match chain.block_height(quorum_hash) {
                    Some(height) => active_height.saturating_sub(height) > params.max_store_depth,
                    None => true,
                };
                if stale {
                    batch.delete(key);
                }
            }
        }

        let removed = batch.deletes.len();
        if removed > 0 {
            self.db.write_batch(batch)?;
        }
        tracing::debug!(scanned, removed, "cleaned up old contributions");
        Ok(removed)
    }
}

impl<DB: KVDatabase> ContributionSink for DkgSessionManager<DB> {
    fn persist_vvec_contribution(
        &self,
        quorum_hash: QuorumHash,
        member: MemberId,
        vvec: &VerificationVector,
    ) -> Result<()> {
        self.db.put(
            &contribution_key(KEY_VVEC, quorum_hash, member),
            vvec.encode(),
        );
        Ok(())
    }

    fn persist_sk_share(
        &self,
        quorum_hash: QuorumHash,
        member: MemberId,
        share: &BlsSecretKey,
    ) -> Result<()> {
        self.db.put(
            &contribution_key(KEY_SK_SHARE, quorum_hash, member),
            share.encode(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorex_common::{
        bls::{BlsBackend, BlsScalarId, InsecureBls},
        hash_bytes,
        mock::MockChain,
    };
    use quorex_db::MemDb;

    fn member(idx: u8) -> MasternodeEntry {
        let bls = InsecureBls;
        MasternodeEntry {
            id: MemberId(hash_bytes(&[idx])),
            operator_key: bls.public_key(&bls.secret_from_seed(&[idx])),
        }
    }

    fn vvec_and_share(seed: &[u8]) -> (VerificationVector, BlsSecretKey) {
        let bls = InsecureBls;
        let (vvec, shares) = bls.generate_contribution(2, &[BlsScalarId(3)], seed);
        (vvec, shares[0])
    }

    #[test]
    fn verified_contributions_roundtrip() {
        let manager = DkgSessionManager::new(MemDb::default());
        let quorum_hash = H256::repeat_byte(1);
        let members = vec![member(0), member(1), member(2)];
        let mut valid = MemberMask::new(3);
        valid.set(0, true);
        valid.set(2, true);

        for idx in [0usize, 2] {
            let (vvec, share) = vvec_and_share(&[idx as u8]);
            manager
                .persist_vvec_contribution(quorum_hash, members[idx].id, &vvec)
                .unwrap();
            manager
                .persist_sk_share(quorum_hash, members[idx].id, &share)
                .unwrap();
        }

        let (indexes, vvecs, shares) = manager
            .get_verified_contributions(quorum_hash, &members, &valid)
            .unwrap();
        assert_eq!(indexes, vec![0, 2]);
        assert_eq!(vvecs.len(), 2);
        assert_eq!(shares.len(), 2);
        assert_eq!(vvecs[0], vvec_and_share(&[0]).0);
        assert_eq!(shares[1], vvec_and_share(&[2]).1);

        // Second lookup is served from the cache.
        let again = manager
            .get_verified_contributions(quorum_hash, &members, &valid)
            .unwrap();
        assert_eq!(again.0, indexes);
    }

    #[test]
    fn missing_member_fails_the_lookup() {
        let manager = DkgSessionManager::new(MemDb::default());
        let quorum_hash = H256::repeat_byte(1);
        let members = vec![member(0), member(1)];
        let mut valid = MemberMask::new(2);
        valid.set(0, true);
        valid.set(1, true);

        let (vvec, share) = vvec_and_share(b"only-one");
        manager
            .persist_vvec_contribution(quorum_hash, members[0].id, &vvec)
            .unwrap();
        manager
            .persist_sk_share(quorum_hash, members[0].id, &share)
            .unwrap();

        assert!(
            manager
                .get_verified_contributions(quorum_hash, &members, &valid)
                .is_err()
        );
    }

    #[test]
    fn cache_sweep_prunes_expired_entries() {
        let manager =
            DkgSessionManager::new(MemDb::default()).with_cache_ttl(Duration::from_secs(0));
        let quorum_hash = H256::repeat_byte(1);
        let members = vec![member(0)];
        let mut valid = MemberMask::new(1);
        valid.set(0, true);

        let (vvec, share) = vvec_and_share(b"ttl");
        manager
            .persist_vvec_contribution(quorum_hash, members[0].id, &vvec)
            .unwrap();
        manager
            .persist_sk_share(quorum_hash, members[0].id, &share)
            .unwrap();
        manager
            .get_verified_contributions(quorum_hash, &members, &valid)
            .unwrap();

        assert_eq!(manager.contributions_cache.lock().len(), 1);
        manager.cleanup_cache();
        assert!(manager.contributions_cache.lock().is_empty());
    }

    #[test]
    fn cleanup_erases_unknown_and_deep_quorums() {
        let db = MemDb::default();
        let manager = DkgSessionManager::new(db.clone());
        let params = QuorumParams::small(3, 2);

        let chain = MockChain::default();
        let fresh = H256::repeat_byte(1);
        let deep = H256::repeat_byte(2);
        let unknown = H256::repeat_byte(3);
        chain.add_block(fresh, 1000);
        chain.add_block(deep, 1000 - params.max_store_depth - 1);
        chain.set_tip(1000);

        let who = member(0);
        let (vvec, share) = vvec_and_share(b"gc");
        for quorum in [fresh, deep, unknown] {
            manager
                .persist_vvec_contribution(quorum, who.id, &vvec)
                .unwrap();
            manager.persist_sk_share(quorum, who.id, &share).unwrap();
        }

        let removed = manager.cleanup_old_contributions(&chain, &params).unwrap();
        assert_eq!(removed, 4);

        assert!(
            db.contains(&contribution_key(KEY_VVEC, fresh, who.id)),
            "fresh quorum data must survive"
        );
        assert!(!db.contains(&contribution_key(KEY_VVEC, deep, who.id)));
        assert!(!db.contains(&contribution_key(KEY_SK_SHARE, unknown, who.id)));
    }

    #[test]
    fn archive_lookups_cover_all_message_kinds() {
        let manager = DkgSessionManager::new(MemDb::default());
        let archive = Arc::new(SessionArchive::default());
        let quorum_hash = H256::repeat_byte(9);
        manager.attach_archive(quorum_hash, archive);

        assert!(!manager.already_have(H256::repeat_byte(1)));
        assert!(manager.get_contribution(H256::repeat_byte(1)).is_none());

        manager.detach_archive(quorum_hash);
        assert!(manager.archives.lock().is_empty());
    }
}
