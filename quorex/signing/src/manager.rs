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

//! Signing manager: reception, batched verification, conflict resolution and
//! dissemination of recovered signatures, plus the asynchronous
//! sign-if-member entry point.

use crate::store::RecoveredSigStore;
use anyhow::Result;
use parking_lot::Mutex;
use quorex_common::{
    H256, MemberId, MsgHash, OriginId, QuorumHash, SigningId,
    bls::{BlsBackend, BlsBatchVerifier},
    hash_bytes,
    messages::RecoveredSig,
    oracle::{PeerReporter, QuorumInfo, QuorumRegistry, RecoveredSigListener, ShareSigner},
};
use quorex_db::KVDatabase;
use rand::seq::SliceRandom;
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::watch;

/// Keep recovered signatures for a week by default.
pub const DEFAULT_MAX_RECOVERED_SIGS_AGE: u64 = 60 * 60 * 24 * 7;

/// Per-tick batch bound across distinct origins.
const MAX_PENDING_BATCH: usize = 32;
/// Aging cleanup runs at most once per this many milliseconds.
const CLEANUP_INTERVAL_MS: u64 = 5_000;
const WORKER_TICK: Duration = Duration::from_millis(100);

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone)]
pub struct SigningConfig {
    /// Seconds before a recovered signature or vote is garbage collected.
    pub max_recovered_sigs_age: u64,
    /// How many recent active quorums participate in quorum selection.
    pub active_quorums_scanned: usize,
    /// Whether this node performs quorum duties (relays accepted sigs).
    pub quorum_duty: bool,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            max_recovered_sigs_age: DEFAULT_MAX_RECOVERED_SIGS_AGE,
            active_quorums_scanned: 24,
            quorum_duty: true,
        }
    }
}

#[derive(Default)]
struct PendingSigs {
    /// Incoming and not verified yet, per origin.
    by_origin: BTreeMap<OriginId, VecDeque<RecoveredSig>>,
    /// Reconstructed from other protocol messages, known valid.
    reconstructed: HashMap<H256, RecoveredSig>,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

struct Inner<DB: KVDatabase> {
    store: RecoveredSigStore<DB>,
    backend: Arc<dyn BlsBackend>,
    registry: Arc<dyn QuorumRegistry>,
    reporter: Arc<dyn PeerReporter>,
    share_signer: Arc<dyn ShareSigner>,
    config: SigningConfig,
    local_member: Option<MemberId>,
    pending: Mutex<PendingSigs>,
    /// Serializes the vote check-then-write of `sign_if_member`.
    vote_lock: Mutex<()>,
    listeners: Mutex<Vec<(u64, Arc<dyn RecoveredSigListener>)>>,
    listener_seq: AtomicU64,
    last_cleanup_ms: AtomicU64,
    worker: Mutex<Option<Worker>>,
}

/// Orchestrates the recovered-signature lifecycle. Cheap to clone; clones
/// share state.
pub struct SigningManager<DB: KVDatabase> {
    inner: Arc<Inner<DB>>,
}

impl<DB: KVDatabase> Clone for SigningManager<DB> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<DB: KVDatabase + 'static> SigningManager<DB> {
    pub fn new(
        db: DB,
        backend: Arc<dyn BlsBackend>,
        registry: Arc<dyn QuorumRegistry>,
        reporter: Arc<dyn PeerReporter>,
        share_signer: Arc<dyn ShareSigner>,
        local_member: Option<MemberId>,
        config: SigningConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: RecoveredSigStore::new(db),
                backend,
                registry,
                reporter,
                share_signer,
                config,
                local_member,
                pending: Mutex::new(PendingSigs::default()),
                vote_lock: Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                listener_seq: AtomicU64::new(0),
                last_cleanup_ms: AtomicU64::new(0),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &RecoveredSigStore<DB> {
        &self.inner.store
    }

    pub fn already_have(&self, hash: H256) -> bool {
        if self.inner.pending.lock().reconstructed.contains_key(&hash) {
            return true;
        }
        self.inner.store.has_recovered_sig_for_hash(hash)
    }

    /// Serves a recovered signature for relay; signatures of inactive
    /// quorums are not propagated.
    pub fn get_recovered_sig_for_relay(&self, hash: H256) -> Option<RecoveredSig> {
        let sig = self.inner.store.get_recovered_sig_by_hash(hash)?;
        self.inner
            .registry
            .is_active(sig.quorum_hash)
            .then_some(sig)
    }

    /// Entry point for recovered signatures arriving from peers. Cheap
    /// pre-verification here; cryptographic verification is batched.
    pub fn push_recovered_sig(&self, origin: OriginId, sig: RecoveredSig) {
        let Some(quorum) = self.inner.registry.quorum(sig.quorum_hash) else {
            tracing::debug!(quorum = ?sig.quorum_hash, %origin, "recovered sig for unknown quorum");
            return;
        };
        if !self.inner.registry.is_active(quorum.quorum_hash) {
            tracing::debug!(quorum = ?sig.quorum_hash, %origin, "recovered sig for inactive quorum");
            return;
        }

        let hash = sig.hash();
        if self.inner.store.has_recovered_sig_for_hash(hash) {
            return;
        }

        let mut pending = self.inner.pending.lock();
        if pending.reconstructed.contains_key(&hash) {
            // Full verification is unnecessary, the reconstruction path
            // already vouches for it.
            return;
        }
        pending.by_origin.entry(origin).or_default().push_back(sig);
    }

    /// Accepts a recovered signature reconstructed from another protocol
    /// message and therefore known valid.
    pub fn push_reconstructed_recovered_sig(&self, sig: RecoveredSig) {
        self.inner
            .pending
            .lock()
            .reconstructed
            .insert(sig.hash(), sig);
    }

    /// One verification round: drains reconstructed signatures, samples up
    /// to a batch of pending candidates fairly across origins, verifies them
    /// in one cryptographic batch and accepts the survivors. Returns whether
    /// a full batch was drained (the caller should loop).
    pub fn process_pending(&self) -> Result<bool> {
        let now = unix_now();

        let reconstructed: Vec<RecoveredSig> = {
            let mut pending = self.inner.pending.lock();
            std::mem::take(&mut pending.reconstructed)
                .into_values()
                .collect()
        };
        for sig in reconstructed {
            self.process_recovered_sig(None, sig, now)?;
        }

        let collected = self.collect_pending_to_verify(MAX_PENDING_BATCH);
        if collected.is_empty() {
            return Ok(false);
        }
        let collected_count: usize = collected.values().map(Vec::len).sum();

        // Resolve each referenced quorum once; candidates of unknown or
        // inactive quorums are dropped.
        let mut quorums: HashMap<QuorumHash, Arc<QuorumInfo>> = HashMap::new();
        let mut by_origin: BTreeMap<OriginId, Vec<RecoveredSig>> = BTreeMap::new();
        for (origin, sigs) in collected {
            for sig in sigs {
                let quorum = match quorums.get(&sig.quorum_hash) {
                    Some(quorum) => Some(quorum.clone()),
                    None => match self.inner.registry.quorum(sig.quorum_hash) {
                        Some(quorum) if self.inner.registry.is_active(sig.quorum_hash) => {
                            quorums.insert(sig.quorum_hash, quorum.clone());
                            Some(quorum)
                        }
                        _ => {
                            tracing::debug!(
                                quorum = ?sig.quorum_hash,
                                %origin,
                                "dropping candidate, quorum unknown or inactive",
                            );
                            None
                        }
                    },
                };
                if quorum.is_some() {
                    by_origin.entry(origin).or_default().push(sig);
                }
            }
        }
        if by_origin.is_empty() {
            return Ok(collected_count >= MAX_PENDING_BATCH);
        }

        // Verification against quorum public keys is rogue-key immune, so
        // the insecure batched path is fine here.
        let mut verifier = BlsBatchVerifier::<OriginId, H256>::new();
        for (origin, sigs) in &by_origin {
            for sig in sigs {
                if !sig.sig.is_valid() {
                    verifier.mark_bad_source(*origin);
                    break;
                }
                let quorum = &quorums[&sig.quorum_hash];
                verifier.push_message(
                    *origin,
                    sig.hash(),
                    sig.sign_hash(),
                    sig.sig,
                    quorum.public_key,
                );
            }
        }
        verifier.verify(self.inner.backend.as_ref());

        let mut processed = HashSet::new();
        for (origin, sigs) in by_origin {
            if verifier.is_bad_source(origin) {
                tracing::debug!(%origin, "invalid recovered sig in batch, discarding origin");
                self.inner
                    .reporter
                    .misbehaving(origin, 100, "invalid recovered signature");
                continue;
            }
            for sig in sigs {
                if processed.insert(sig.hash()) {
                    self.process_recovered_sig(Some(origin), sig, now)?;
                }
            }
        }

        Ok(collected_count >= MAX_PENDING_BATCH)
    }

    /// Samples up to `max_candidates` pending signatures with a randomized
    /// round-robin over origins so one noisy origin cannot starve others.
    fn collect_pending_to_verify(
        &self,
        max_candidates: usize,
    ) -> BTreeMap<OriginId, Vec<RecoveredSig>> {
        let mut out: BTreeMap<OriginId, Vec<RecoveredSig>> = BTreeMap::new();
        let mut pending = self.inner.pending.lock();
        if pending.by_origin.is_empty() {
            return out;
        }

        let mut origins: Vec<OriginId> = pending.by_origin.keys().copied().collect();
        origins.shuffle(&mut rand::thread_rng());

        let mut unique_sessions: HashSet<(OriginId, H256)> = HashSet::new();
        let mut cursor = 0usize;
        while !origins.is_empty() && unique_sessions.len() < max_candidates {
            let origin = origins[cursor % origins.len()];
            let queue = pending
                .by_origin
                .get_mut(&origin)
                .expect("origin taken from key set");

            match queue.pop_front() {
                Some(sig) => {
                    if !self.inner.store.has_recovered_sig_for_hash(sig.hash()) {
                        unique_sessions.insert((origin, sig.sign_hash()));
                        out.entry(origin).or_default().push(sig);
                    }
                    cursor += 1;
                }
                None => {
                    pending.by_origin.remove(&origin);
                    let position = cursor % origins.len();
                    origins.remove(position);
                    if origins.is_empty() {
                        break;
                    }
                    cursor = position;
                }
            }
            if !origins.is_empty() {
                cursor %= origins.len();
            }
        }

        pending.by_origin.retain(|_, queue| !queue.is_empty());
        out
    }

    /// Accepts one verified recovered signature: deduplicates, detects
    /// conflicting claims for the same id, persists, relays and notifies.
    pub fn process_recovered_sig(
        &self,
        origin: Option<OriginId>,
        sig: RecoveredSig,
        now: u64,
    ) -> Result<bool> {
        let hash = sig.hash();
        if self.inner.store.has_recovered_sig_for_hash(hash) {
            return Ok(false);
        }

        if self.inner.store.has_recovered_sig_for_id(sig.id) {
            match self.inner.store.get_recovered_sig_by_id(sig.id) {
                Some(existing) if existing.sign_hash() != sig.sign_hash() => {
                    // A second recovered signature for the id with another
                    // message is a protocol-level conflict; never silently
                    // replace the stored record.
                    tracing::warn!(
                        id = ?sig.id,
                        msg_hash = ?sig.msg_hash,
                        existing_msg_hash = ?existing.msg_hash,
                        ?origin,
                        "conflicting recovered signature rejected",
                    );
                    return Ok(false);
                }
                Some(_) => {
                    // Same session recovered through another path.
                    return Ok(false);
                }
                // The record vanished between the existence check and the
                // read (cleanup race); treat it as never seen.
                None => {}
            }
        }

        self.inner.store.write_recovered_sig(&sig, now)?;
        self.inner.pending.lock().reconstructed.remove(&hash);

        tracing::debug!(
            id = ?sig.id,
            msg_hash = ?sig.msg_hash,
            sign_hash = ?sig.sign_hash(),
            "recovered signature accepted",
        );

        if self.inner.config.quorum_duty {
            self.inner.reporter.relay_recovered_sig(hash);
        }

        let listeners: Vec<Arc<dyn RecoveredSigListener>> = {
            let guard = self.inner.listeners.lock();
            guard.iter().map(|(_, listener)| listener.clone()).collect()
        };
        for listener in listeners {
            listener.handle_new_recovered_sig(&sig);
        }

        Ok(true)
    }

    pub fn register_listener(&self, listener: Arc<dyn RecoveredSigListener>) -> u64 {
        let id = self.inner.listener_seq.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().push((id, listener));
        id
    }

    pub fn unregister_listener(&self, id: u64) {
        self.inner
            .listeners
            .lock()
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Signs for `(id, msg_hash)` when the local node is a member of the
    /// responsible quorum. At most one vote per id; a controlled re-sign
    /// must be requested explicitly. Returns whether signing was dispatched
    /// or a recovered signature already exists.
    pub fn sign_if_member(
        &self,
        id: SigningId,
        msg_hash: MsgHash,
        quorum_hash: Option<QuorumHash>,
        allow_resign: bool,
    ) -> Result<bool> {
        let Some(local) = self.inner.local_member else {
            return Ok(false);
        };

        let quorum = match quorum_hash {
            Some(hash) => self.inner.registry.quorum(hash),
            None => self.select_quorum_for_signing(id),
        };
        let Some(quorum) = quorum else {
            tracing::debug!(?id, ?msg_hash, "failed to select quorum for signing");
            return Ok(false);
        };
        if !quorum.is_valid_member(local) {
            return Ok(false);
        }

        {
            let _guard = self.inner.vote_lock.lock();

            let has_voted = self.inner.store.has_voted_on_id(id);
            if has_voted {
                let previous = self.inner.store.get_vote_for_id(id);
                if previous != Some(msg_hash) {
                    tracing::warn!(
                        ?id,
                        ?previous,
                        conflicting = ?msg_hash,
                        "already voted for another message, refusing to sign",
                    );
                    return Ok(false);
                }
                if !allow_resign {
                    tracing::debug!(?id, "already voted, not voting again");
                    return Ok(false);
                }
                tracing::debug!(?id, "controlled re-sign requested");
            }

            if self.inner.store.has_recovered_sig_for_id(id) {
                // Nothing to sign, the quorum already recovered it.
                return Ok(true);
            }
            if !has_voted {
                self.inner
                    .store
                    .write_vote_for_id(id, msg_hash, unix_now())?;
            }
        }

        if allow_resign {
            // Other members may have run into a timeout; re-announce our
            // known shares.
            self.inner
                .share_signer
                .force_reannouncement(quorum.clone(), id, msg_hash);
        }
        self.inner.share_signer.async_sign(quorum, id, msg_hash);
        Ok(true)
    }

    /// Deterministic quorum selection: score every recent active quorum by
    /// `keccak(quorum_hash, id)` and pick the lowest.
    fn select_quorum_for_signing(&self, id: SigningId) -> Option<Arc<QuorumInfo>> {
        let quorums = self
            .inner
            .registry
            .scan_quorums(self.inner.config.active_quorums_scanned);
        quorums.into_iter().min_by_key(|quorum| {
            let mut material = quorum.quorum_hash.as_bytes().to_vec();
            material.extend_from_slice(id.as_bytes());
            hash_bytes(&material)
        })
    }

    pub fn has_recovered_sig(&self, id: SigningId, msg_hash: MsgHash) -> bool {
        self.inner.store.has_recovered_sig(id, msg_hash)
    }

    pub fn has_recovered_sig_for_id(&self, id: SigningId) -> bool {
        self.inner.store.has_recovered_sig_for_id(id)
    }

    pub fn has_recovered_sig_for_session(&self, sign_hash: H256) -> bool {
        self.inner.store.has_recovered_sig_for_session(sign_hash)
    }

    pub fn get_recovered_sig_for_id(&self, id: SigningId) -> Option<RecoveredSig> {
        self.inner.store.get_recovered_sig_by_id(id)
    }

    pub fn get_vote_for_id(&self, id: SigningId) -> Option<MsgHash> {
        self.inner.store.get_vote_for_id(id)
    }

    /// A recovered signature for the id exists but covers another message.
    pub fn is_conflicting(&self, id: SigningId, msg_hash: MsgHash) -> bool {
        if !self.inner.store.has_recovered_sig_for_id(id) {
            return false;
        }
        !self.inner.store.has_recovered_sig(id, msg_hash)
    }

    /// Called when external logic guarantees no future conflict for the id.
    pub fn truncate_recovered_sig(&self, id: SigningId) -> Result<()> {
        self.inner.store.truncate_recovered_sig(id)
    }

    /// Throttled aging sweep over recovered signatures and votes.
    pub fn cleanup(&self) -> Result<()> {
        let now_ms = unix_now() * 1000;
        let last = self.inner.last_cleanup_ms.load(Ordering::SeqCst);
        if now_ms.saturating_sub(last) < CLEANUP_INTERVAL_MS {
            return Ok(());
        }

        let max_age = self.inner.config.max_recovered_sigs_age;
        let now = unix_now();
        self.inner.store.cleanup_old_recovered_sigs(max_age, now)?;
        self.inner.store.cleanup_old_votes(max_age, now)?;
        self.inner.last_cleanup_ms.store(now_ms, Ordering::SeqCst);
        Ok(())
    }

    /// Starts the background worker performing batched verification and
    /// periodic cleanup. Idempotent.
    pub fn start(&self) {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(WORKER_TICK);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => {
                        loop {
                            match manager.process_pending() {
                                Ok(true) => continue,
                                Ok(false) => break,
                                Err(err) => {
                                    tracing::warn!("processing pending recovered sigs failed: {err}");
                                    break;
                                }
                            }
                        }
                        if let Err(err) = manager.cleanup() {
                            tracing::warn!("recovered sig cleanup failed: {err}");
                        }
                    }
                }
            }
        });

        *worker = Some(Worker { shutdown, handle });
    }

    /// Stops the background worker. Idempotent.
    pub async fn stop(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            let _ = worker.handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorex_common::{
        QuorumParams,
        bls::InsecureBls,
        mock::{
            CollectingListener, MockRegistry, MockReporter, MockShareSigner, TestQuorum,
            test_quorum,
        },
    };
    use quorex_db::MemDb;

    struct Setup {
        manager: SigningManager<MemDb>,
        registry: Arc<MockRegistry>,
        reporter: Arc<MockReporter>,
        share_signer: Arc<MockShareSigner>,
        quorum: TestQuorum,
    }

    fn setup(local_member: bool) -> Setup {
        let quorum = test_quorum(0x31, 5, QuorumParams::small(5, 3));
        let registry = Arc::new(MockRegistry::default());
        registry.add_quorum(quorum.info.clone(), true);
        let reporter = Arc::new(MockReporter::default());
        let share_signer = Arc::new(MockShareSigner::default());

        let manager = SigningManager::new(
            MemDb::default(),
            Arc::new(InsecureBls),
            registry.clone(),
            reporter.clone(),
            share_signer.clone(),
            local_member.then(|| quorum.info.members[0].id),
            SigningConfig::default(),
        );

        Setup {
            manager,
            registry,
            reporter,
            share_signer,
            quorum,
        }
    }

    fn drain(manager: &SigningManager<MemDb>) {
        while manager.process_pending().unwrap() {}
        // One final pass for the non-full tail batch.
        manager.process_pending().unwrap();
    }

    #[test]
    fn single_bad_origin_is_discarded_others_survive() {
        let setup = setup(false);

        let mut expected = Vec::new();
        for origin in 0..4u64 {
            let sig = setup.quorum.recovered_sig(
                H256::from_low_u64_be(origin + 1),
                H256::repeat_byte(0xa0 + origin as u8),
            );
            if origin == 2 {
                let mut forged = sig.clone();
                forged.sig.0[0] ^= 0x01;
                setup.manager.push_recovered_sig(OriginId(origin), forged);
            } else {
                setup.manager.push_recovered_sig(OriginId(origin), sig.clone());
                expected.push(sig);
            }
        }

        drain(&setup.manager);

        for sig in &expected {
            assert!(setup.manager.has_recovered_sig(sig.id, sig.msg_hash));
        }
        assert!(!setup.manager.has_recovered_sig_for_id(H256::from_low_u64_be(3)));

        let reports = setup.reporter.misbehaving.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, OriginId(2));
        assert_eq!(reports[0].1, 100);
    }

    #[test]
    fn conflicting_recovered_sig_is_rejected_not_replaced() {
        let setup = setup(false);
        let id = H256::repeat_byte(0x01);

        let first = setup.quorum.recovered_sig(id, H256::repeat_byte(0xaa));
        let conflicting = setup.quorum.recovered_sig(id, H256::repeat_byte(0xbb));

        setup.manager.push_reconstructed_recovered_sig(first.clone());
        drain(&setup.manager);
        assert!(setup.manager.has_recovered_sig(id, first.msg_hash));

        setup
            .manager
            .push_reconstructed_recovered_sig(conflicting.clone());
        drain(&setup.manager);

        assert!(setup.manager.has_recovered_sig(id, first.msg_hash));
        assert!(!setup.manager.has_recovered_sig(id, conflicting.msg_hash));
        assert!(setup.manager.is_conflicting(id, conflicting.msg_hash));
        assert!(!setup.manager.is_conflicting(id, first.msg_hash));
    }

    #[test]
    fn duplicates_are_accepted_once_and_listeners_notified_once() {
        let setup = setup(false);
        let listener = Arc::new(CollectingListener::default());
        let listener_id = setup.manager.register_listener(listener.clone());

        let sig = setup
            .quorum
            .recovered_sig(H256::repeat_byte(0x02), H256::repeat_byte(0xcc));
        setup.manager.push_recovered_sig(OriginId(1), sig.clone());
        setup.manager.push_recovered_sig(OriginId(2), sig.clone());
        drain(&setup.manager);

        assert!(setup.manager.already_have(sig.hash()));
        assert_eq!(listener.received.lock().len(), 1);

        // Re-pushing a stored signature is a no-op.
        setup.manager.push_recovered_sig(OriginId(3), sig.clone());
        drain(&setup.manager);
        assert_eq!(listener.received.lock().len(), 1);

        setup.manager.unregister_listener(listener_id);
        let other = setup
            .quorum
            .recovered_sig(H256::repeat_byte(0x03), H256::repeat_byte(0xdd));
        setup.manager.push_reconstructed_recovered_sig(other);
        drain(&setup.manager);
        assert_eq!(listener.received.lock().len(), 1);
    }

    #[test]
    fn accepted_sigs_are_relayed_when_on_quorum_duty() {
        let setup = setup(false);
        let sig = setup
            .quorum
            .recovered_sig(H256::repeat_byte(0x04), H256::repeat_byte(0xee));
        setup.manager.push_reconstructed_recovered_sig(sig.clone());
        drain(&setup.manager);
        assert_eq!(*setup.reporter.relayed.lock(), vec![sig.hash()]);

        assert_eq!(
            setup.manager.get_recovered_sig_for_relay(sig.hash()),
            Some(sig.clone())
        );
        setup.registry.set_active(setup.quorum.info.quorum_hash, false);
        assert_eq!(setup.manager.get_recovered_sig_for_relay(sig.hash()), None);
    }

    #[test]
    fn sign_if_member_votes_once_and_dispatches_once() {
        let setup = setup(true);
        let id = H256::repeat_byte(0x05);
        let msg_hash = H256::repeat_byte(0x11);

        assert!(setup.manager.sign_if_member(id, msg_hash, None, false).unwrap());
        assert_eq!(setup.share_signer.signed.lock().len(), 1);
        assert_eq!(setup.manager.get_vote_for_id(id), Some(msg_hash));

        // Second identical call without re-sign is a no-op.
        assert!(!setup.manager.sign_if_member(id, msg_hash, None, false).unwrap());
        assert_eq!(setup.share_signer.signed.lock().len(), 1);

        // A conflicting message for the same id is refused.
        assert!(
            !setup
                .manager
                .sign_if_member(id, H256::repeat_byte(0x12), None, false)
                .unwrap()
        );
        assert_eq!(setup.share_signer.signed.lock().len(), 1);

        // Controlled re-sign dispatches again and re-announces.
        assert!(setup.manager.sign_if_member(id, msg_hash, None, true).unwrap());
        assert_eq!(setup.share_signer.signed.lock().len(), 2);
        assert_eq!(setup.share_signer.reannounced.lock().len(), 1);
    }

    #[test]
    fn sign_if_member_skips_non_members_and_recovered_ids() {
        let non_member = setup(false);
        assert!(
            !non_member
                .manager
                .sign_if_member(H256::repeat_byte(0x06), H256::repeat_byte(0x13), None, false)
                .unwrap()
        );
        assert!(non_member.share_signer.signed.lock().is_empty());

        let setup = setup(true);
        let id = H256::repeat_byte(0x07);
        let msg_hash = H256::repeat_byte(0x14);
        let sig = setup.quorum.recovered_sig(id, msg_hash);
        setup.manager.push_reconstructed_recovered_sig(sig);
        drain(&setup.manager);

        // Recovered already: reports success without dispatching shares.
        assert!(setup.manager.sign_if_member(id, msg_hash, None, false).unwrap());
        assert!(setup.share_signer.signed.lock().is_empty());
    }

    #[test]
    fn explicit_quorum_is_honored() {
        let setup = setup(true);
        let unknown = H256::repeat_byte(0x66);
        assert!(
            !setup
                .manager
                .sign_if_member(
                    H256::repeat_byte(0x08),
                    H256::repeat_byte(0x15),
                    Some(unknown),
                    false,
                )
                .unwrap()
        );

        assert!(
            setup
                .manager
                .sign_if_member(
                    H256::repeat_byte(0x08),
                    H256::repeat_byte(0x15),
                    Some(setup.quorum.info.quorum_hash),
                    false,
                )
                .unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_drains_pending_in_background() {
        let setup = setup(false);
        setup.manager.start();
        // Second start is a no-op.
        setup.manager.start();

        let sig = setup
            .quorum
            .recovered_sig(H256::repeat_byte(0x09), H256::repeat_byte(0x16));
        setup.manager.push_recovered_sig(OriginId(1), sig.clone());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !setup.manager.already_have(sig.hash()) {
            assert!(std::time::Instant::now() < deadline, "worker never accepted sig");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        setup.manager.stop().await;
        // Idempotent stop.
        setup.manager.stop().await;
    }
}
