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

//! Persistent store of recovered signatures and per-id vote records.
//!
//! One logical record is indexed four ways: by id, by `(id, msg hash)` pair,
//! by content hash and by sign hash; a fifth, time-bucketed index exists only
//! for aging sweeps. Keys are `(tag, big-endian components…)` so prefix
//! iteration observes oldest-first order. Small LRU caches front the three
//! boolean existence checks and are invalidated precisely on write/remove.

use anyhow::Result;
use lru::LruCache;
use parity_scale_codec::{Decode, Encode};
use parking_lot::Mutex;
use quorex_common::{H256, MsgHash, SigningId, messages::RecoveredSig};
use quorex_db::{KVDatabase, WriteBatch};
use std::num::NonZeroUsize;

const TAG_REC: u8 = 0x01;
const TAG_PAIR: u8 = 0x02;
const TAG_HASH: u8 = 0x03;
const TAG_SESSION: u8 = 0x04;
const TAG_TIME: u8 = 0x05;
const TAG_VOTE: u8 = 0x06;
const TAG_VOTE_TIME: u8 = 0x07;

const EXISTENCE_CACHE_SIZE: usize = 30_000;
/// Aging sweeps flush in chunks to bound single-transaction growth.
const MAX_SWEEP_BATCH_OPS: usize = 1 << 10;

fn key1(tag: u8, component: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(tag);
    key.extend_from_slice(component.as_bytes());
    key
}

fn key2(tag: u8, first: H256, second: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(65);
    key.push(tag);
    key.extend_from_slice(first.as_bytes());
    key.extend_from_slice(second.as_bytes());
    key
}

fn time_key(tag: u8, time: u32, id: H256) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.push(tag);
    key.extend_from_slice(&time.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn parse_time_key(key: &[u8]) -> Option<(u32, H256)> {
    if key.len() != 37 {
        return None;
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&key[1..5]);
    Some((u32::from_be_bytes(raw), H256::from_slice(&key[5..37])))
}

struct ExistenceCaches {
    by_id: LruCache<H256, bool>,
    by_session: LruCache<H256, bool>,
    by_hash: LruCache<H256, bool>,
}

/// Recovered-signature store over a generic key-value database.
pub struct RecoveredSigStore<DB> {
    db: DB,
    caches: Mutex<ExistenceCaches>,
}

impl<DB: KVDatabase> RecoveredSigStore<DB> {
    pub fn new(db: DB) -> Self {
        let capacity = NonZeroUsize::new(EXISTENCE_CACHE_SIZE).expect("nonzero capacity");
        Self {
            db,
            caches: Mutex::new(ExistenceCaches {
                by_id: LruCache::new(capacity),
                by_session: LruCache::new(capacity),
                by_hash: LruCache::new(capacity),
            }),
        }
    }

    pub fn has_recovered_sig(&self, id: SigningId, msg_hash: MsgHash) -> bool {
        self.db.contains(&key2(TAG_PAIR, id, msg_hash))
    }

    pub fn has_recovered_sig_for_id(&self, id: SigningId) -> bool {
        if let Some(cached) = self.caches.lock().by_id.get(&id) {
            return *cached;
        }
        let present = self.db.contains(&key1(TAG_REC, id));
        self.caches.lock().by_id.put(id, present);
        present
    }

    pub fn has_recovered_sig_for_session(&self, sign_hash: H256) -> bool {
        if let Some(cached) = self.caches.lock().by_session.get(&sign_hash) {
            return *cached;
        }
        let present = self.db.contains(&key1(TAG_SESSION, sign_hash));
        self.caches.lock().by_session.put(sign_hash, present);
        present
    }

    pub fn has_recovered_sig_for_hash(&self, hash: H256) -> bool {
        if let Some(cached) = self.caches.lock().by_hash.get(&hash) {
            return *cached;
        }
        let present = self.db.contains(&key1(TAG_HASH, hash));
        self.caches.lock().by_hash.put(hash, present);
        present
    }

    pub fn get_recovered_sig_by_id(&self, id: SigningId) -> Option<RecoveredSig> {
        let raw = self.db.get(&key1(TAG_REC, id))?;
        RecoveredSig::decode(&mut raw.as_slice()).ok()
    }

    pub fn get_recovered_sig_by_hash(&self, hash: H256) -> Option<RecoveredSig> {
        let raw = self.db.get(&key1(TAG_HASH, hash))?;
        let id = H256::decode(&mut raw.as_slice()).ok()?;
        self.get_recovered_sig_by_id(id)
    }

    /// Persists a recovered signature under every index and drops the vote
    /// record for its id in the same batch.
    pub fn write_recovered_sig(&self, sig: &RecoveredSig, now: u64) -> Result<()> {
        let write_time = now as u32;
        let sign_hash = sig.sign_hash();
        let hash = sig.hash();

        let mut batch = WriteBatch::default();
        batch.put(key1(TAG_REC, sig.id), sig.encode());
        // The pair key doubles as the back-pointer to the time bucket.
        batch.put(key2(TAG_PAIR, sig.id, sig.msg_hash), write_time.encode());
        batch.put(key1(TAG_HASH, hash), sig.id.encode());
        batch.put(key1(TAG_SESSION, sign_hash), vec![1]);
        batch.put(time_key(TAG_TIME, write_time, sig.id), vec![1]);

        // The vote served its purpose once the recovered sig landed.
        if let Some((_, vote_time)) = self.read_vote(sig.id) {
            batch.delete(key1(TAG_VOTE, sig.id));
            batch.delete(time_key(TAG_VOTE_TIME, vote_time, sig.id));
        }

        self.db.write_batch(batch)?;

        let mut caches = self.caches.lock();
        caches.by_id.put(sig.id, true);
        caches.by_session.put(sign_hash, true);
        caches.by_hash.put(hash, true);
        Ok(())
    }

    /// Removes every index for the id.
    pub fn remove_recovered_sig(&self, id: SigningId) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_removal(&mut batch, id, true, true);
        self.db.write_batch(batch)
    }

    /// Partial delete: frees the record but intentionally leaves the
    /// by-content-hash index behind so "have we ever seen this" queries keep
    /// answering true. Safe only when the caller guarantees no future
    /// conflict can arise for the id.
    pub fn truncate_recovered_sig(&self, id: SigningId) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_removal(&mut batch, id, false, false);
        self.db.write_batch(batch)
    }

    fn stage_removal(
        &self,
        batch: &mut WriteBatch,
        id: SigningId,
        delete_hash_key: bool,
        delete_time_key: bool,
    ) {
        let Some(sig) = self.get_recovered_sig_by_id(id) else {
            return;
        };
        let sign_hash = sig.sign_hash();
        let hash = sig.hash();

        batch.delete(key1(TAG_REC, id));
        if delete_hash_key {
            batch.delete(key1(TAG_HASH, hash));
        }
        batch.delete(key1(TAG_SESSION, sign_hash));
        if delete_time_key {
            if let Some(raw) = self.db.get(&key2(TAG_PAIR, id, sig.msg_hash)) {
                if let Ok(write_time) = u32::decode(&mut raw.as_slice()) {
                    batch.delete(time_key(TAG_TIME, write_time, id));
                }
            }
        }
        batch.delete(key2(TAG_PAIR, id, sig.msg_hash));

        let mut caches = self.caches.lock();
        caches.by_id.pop(&id);
        caches.by_session.pop(&sign_hash);
        if delete_hash_key {
            caches.by_hash.pop(&hash);
        }
    }

    /// Sweeps records written at or before `now - max_age`, flushing deletes
    /// in bounded chunks. Returns the number of removed records.
    pub fn cleanup_old_recovered_sigs(&self, max_age: u64, now: u64) -> Result<usize> {
        let cutoff = now.saturating_sub(max_age);

        let mut expired = Vec::new();
        for (key, _) in self.db.iter_prefix(&[TAG_TIME]) {
            let Some((write_time, id)) = parse_time_key(&key) else {
                continue;
            };
            if write_time as u64 > cutoff {
                // Time buckets are ordered; everything further is younger.
                break;
            }
            expired.push((key, id));
        }
        if expired.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::default();
        for (time_key, id) in &expired {
            self.stage_removal(&mut batch, *id, true, false);
            batch.delete(time_key.clone());
            if batch.ops() >= MAX_SWEEP_BATCH_OPS {
                self.db.write_batch(std::mem::take(&mut batch))?;
            }
        }
        if !batch.is_empty() {
            self.db.write_batch(batch)?;
        }

        tracing::debug!(removed = expired.len(), "swept old recovered sigs");
        Ok(expired.len())
    }

    // Vote records: at most one `(id -> msg hash)` mark per id.

    pub fn has_voted_on_id(&self, id: SigningId) -> bool {
        self.db.contains(&key1(TAG_VOTE, id))
    }

    pub fn get_vote_for_id(&self, id: SigningId) -> Option<MsgHash> {
        self.read_vote(id).map(|(msg_hash, _)| msg_hash)
    }

    fn read_vote(&self, id: SigningId) -> Option<(MsgHash, u32)> {
        let raw = self.db.get(&key1(TAG_VOTE, id))?;
        <(MsgHash, u32)>::decode(&mut raw.as_slice()).ok()
    }

    pub fn write_vote_for_id(&self, id: SigningId, msg_hash: MsgHash, now: u64) -> Result<()> {
        let write_time = now as u32;
        let mut batch = WriteBatch::default();
        batch.put(key1(TAG_VOTE, id), (msg_hash, write_time).encode());
        batch.put(time_key(TAG_VOTE_TIME, write_time, id), vec![1]);
        self.db.write_batch(batch)
    }

    /// Ages out votes whose recovered signature never materialized.
    pub fn cleanup_old_votes(&self, max_age: u64, now: u64) -> Result<usize> {
        let cutoff = now.saturating_sub(max_age);

        let mut batch = WriteBatch::default();
        let mut removed = 0usize;
        for (key, _) in self.db.iter_prefix(&[TAG_VOTE_TIME]) {
            let Some((write_time, id)) = parse_time_key(&key) else {
                continue;
            };
            if write_time as u64 > cutoff {
                break;
            }
            batch.delete(key);
            batch.delete(key1(TAG_VOTE, id));
            removed += 1;
        }
        if removed > 0 {
            self.db.write_batch(batch)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorex_common::{bls::BlsSignature, messages::RecoveredSig};
    use quorex_db::MemDb;

    fn store() -> RecoveredSigStore<MemDb> {
        RecoveredSigStore::new(MemDb::default())
    }

    fn rec_sig(id_byte: u8, msg_byte: u8) -> RecoveredSig {
        RecoveredSig {
            quorum_hash: H256::repeat_byte(0x0a),
            id: H256::repeat_byte(id_byte),
            msg_hash: H256::repeat_byte(msg_byte),
            sig: BlsSignature([0x33; 96]),
        }
    }

    #[test]
    fn write_is_idempotent_across_all_indices() {
        let store = store();
        let sig = rec_sig(1, 2);

        store.write_recovered_sig(&sig, 1000).unwrap();
        store.write_recovered_sig(&sig, 1000).unwrap();

        assert!(store.has_recovered_sig(sig.id, sig.msg_hash));
        assert!(store.has_recovered_sig_for_id(sig.id));
        assert!(store.has_recovered_sig_for_session(sig.sign_hash()));
        assert!(store.has_recovered_sig_for_hash(sig.hash()));
        assert_eq!(store.get_recovered_sig_by_id(sig.id), Some(sig.clone()));
        assert_eq!(store.get_recovered_sig_by_hash(sig.hash()), Some(sig));
    }

    #[test]
    fn existence_caches_are_updated_on_write_and_remove() {
        let store = store();
        let sig = rec_sig(3, 4);

        // Prime the caches with negative answers.
        assert!(!store.has_recovered_sig_for_id(sig.id));
        assert!(!store.has_recovered_sig_for_hash(sig.hash()));
        assert!(!store.has_recovered_sig_for_session(sig.sign_hash()));

        store.write_recovered_sig(&sig, 1000).unwrap();
        assert!(store.has_recovered_sig_for_id(sig.id));
        assert!(store.has_recovered_sig_for_hash(sig.hash()));
        assert!(store.has_recovered_sig_for_session(sig.sign_hash()));

        store.remove_recovered_sig(sig.id).unwrap();
        assert!(!store.has_recovered_sig_for_id(sig.id));
        assert!(!store.has_recovered_sig_for_hash(sig.hash()));
        assert!(!store.has_recovered_sig_for_session(sig.sign_hash()));
    }

    #[test]
    fn truncate_keeps_the_ever_seen_marker() {
        let store = store();
        let sig = rec_sig(5, 6);
        store.write_recovered_sig(&sig, 1000).unwrap();

        store.truncate_recovered_sig(sig.id).unwrap();

        assert!(store.has_recovered_sig_for_hash(sig.hash()));
        assert!(!store.has_recovered_sig_for_id(sig.id));
        assert!(!store.has_recovered_sig_for_session(sig.sign_hash()));
        assert_eq!(store.get_recovered_sig_by_id(sig.id), None);
        // The hash index survives but points at a freed record.
        assert_eq!(store.get_recovered_sig_by_hash(sig.hash()), None);
    }

    #[test]
    fn sweep_with_zero_age_removes_everything() {
        let store = store();
        for idx in 0..5u8 {
            store
                .write_recovered_sig(&rec_sig(idx + 1, idx + 10), 1000 + idx as u64)
                .unwrap();
        }

        let removed = store.cleanup_old_recovered_sigs(0, 2000).unwrap();
        assert_eq!(removed, 5);
        for idx in 0..5u8 {
            assert!(!store.has_recovered_sig_for_id(H256::repeat_byte(idx + 1)));
        }
    }

    #[test]
    fn sweep_with_huge_age_removes_nothing() {
        let store = store();
        let sig = rec_sig(1, 2);
        store.write_recovered_sig(&sig, 1000).unwrap();

        let removed = store.cleanup_old_recovered_sigs(u64::MAX, 2000).unwrap();
        assert_eq!(removed, 0);
        assert!(store.has_recovered_sig_for_id(sig.id));
    }

    #[test]
    fn sweep_respects_the_age_boundary() {
        let store = store();
        let old = rec_sig(1, 2);
        let young = rec_sig(3, 4);
        store.write_recovered_sig(&old, 1000).unwrap();
        store.write_recovered_sig(&young, 5000).unwrap();

        let removed = store.cleanup_old_recovered_sigs(2000, 6000).unwrap();
        assert_eq!(removed, 1);
        assert!(!store.has_recovered_sig_for_id(old.id));
        assert!(store.has_recovered_sig_for_id(young.id));
    }

    #[test]
    fn votes_roundtrip_and_clear_on_recovered_sig() {
        let store = store();
        let id = H256::repeat_byte(7);
        let msg_hash = H256::repeat_byte(8);

        assert!(!store.has_voted_on_id(id));
        store.write_vote_for_id(id, msg_hash, 1000).unwrap();
        assert!(store.has_voted_on_id(id));
        assert_eq!(store.get_vote_for_id(id), Some(msg_hash));

        store.write_recovered_sig(&rec_sig(7, 8), 1500).unwrap();
        assert!(!store.has_voted_on_id(id));
    }

    #[test]
    fn old_votes_age_out() {
        let store = store();
        store
            .write_vote_for_id(H256::repeat_byte(1), H256::repeat_byte(2), 1000)
            .unwrap();
        store
            .write_vote_for_id(H256::repeat_byte(3), H256::repeat_byte(4), 5000)
            .unwrap();

        let removed = store.cleanup_old_votes(2000, 6000).unwrap();
        assert_eq!(removed, 1);
        assert!(!store.has_voted_on_id(H256::repeat_byte(1)));
        assert!(store.has_voted_on_id(H256::repeat_byte(3)));
    }
}
