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

//! BLS capability seam.
//!
//! The threshold scheme itself is an external collaborator: everything here is
//! either an opaque value type or a trait the rest of the engine consumes.
//! [`InsecureBls`] models the scheme over a prime field so protocol logic and
//! tests exercise real share validation, aggregation and recovery without the
//! pairing library.

use crate::{H256, MemberId, hash_bytes};
use parity_scale_codec::{Decode, Encode};
use std::collections::BTreeMap;

pub const BLS_SECRET_KEY_SIZE: usize = 32;
pub const BLS_PUBLIC_KEY_SIZE: usize = 48;
pub const BLS_SIGNATURE_SIZE: usize = 96;

/// Secret key or secret-key share.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct BlsSecretKey(pub [u8; BLS_SECRET_KEY_SIZE]);

/// Public key, verification-vector entry or aggregate public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct BlsPublicKey(pub [u8; BLS_PUBLIC_KEY_SIZE]);

/// Plain signature, signature share or recovered threshold signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct BlsSignature(pub [u8; BLS_SIGNATURE_SIZE]);

/// Protocol-level scalar id a member evaluates shares at. Always non-zero.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode,
)]
pub struct BlsScalarId(pub u64);

/// Verification vector: one public commitment per polynomial coefficient.
pub type VerificationVector = Vec<BlsPublicKey>;

macro_rules! opaque_impls {
    ($ty:ident, $size:expr) => {
        impl Default for $ty {
            fn default() -> Self {
                Self([0u8; $size])
            }
        }

        impl $ty {
            pub fn is_valid(&self) -> bool {
                self.0.iter().any(|b| *b != 0)
            }
        }

        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($ty), "({}..)"), hex::encode(&self.0[..8]))
            }
        }
    };
}

opaque_impls!(BlsSecretKey, BLS_SECRET_KEY_SIZE);
opaque_impls!(BlsPublicKey, BLS_PUBLIC_KEY_SIZE);
opaque_impls!(BlsSignature, BLS_SIGNATURE_SIZE);

/// The consumed threshold-crypto capability.
///
/// Verification entry points are "insecure" in the rogue-key sense: callers
/// only ever pass public keys that are not craftable by individual peers
/// (quorum keys, keys from the deterministic masternode list).
pub trait BlsBackend: Send + Sync {
    fn secret_from_seed(&self, seed: &[u8]) -> BlsSecretKey;
    fn public_key(&self, sk: &BlsSecretKey) -> BlsPublicKey;
    /// Deterministic protocol id of a member.
    fn scalar_id(&self, member: &MemberId) -> BlsScalarId;

    /// Generates a contribution: the verification vector plus one secret
    /// share per receiver, evaluated at the receiver's id.
    fn generate_contribution(
        &self,
        threshold: usize,
        receivers: &[BlsScalarId],
        seed: &[u8],
    ) -> (VerificationVector, Vec<BlsSecretKey>);

    /// Checks a received share against the contributor's verification vector.
    fn verify_contribution_share(
        &self,
        receiver: BlsScalarId,
        share: &BlsSecretKey,
        vvec: &VerificationVector,
    ) -> bool;

    /// Batched variant of [`Self::verify_contribution_share`].
    fn verify_contribution_shares(
        &self,
        receiver: BlsScalarId,
        items: &[(&VerificationVector, &BlsSecretKey)],
    ) -> Vec<bool> {
        items
            .iter()
            .map(|(vvec, share)| self.verify_contribution_share(receiver, share, vvec))
            .collect()
    }

    /// Sums secret shares into the member's quorum secret-key share.
    fn aggregate_secrets(&self, shares: &[BlsSecretKey]) -> BlsSecretKey;

    fn sign(&self, sk: &BlsSecretKey, msg: H256) -> BlsSignature;
    fn verify(&self, pk: &BlsPublicKey, msg: H256, sig: &BlsSignature) -> bool;

    fn aggregate_public_keys(&self, pks: &[BlsPublicKey]) -> BlsPublicKey;
    fn aggregate_signatures(&self, sigs: &[BlsSignature]) -> BlsSignature;

    /// Verifies an aggregate signature over per-message public keys.
    fn verify_aggregated_insecure(
        &self,
        items: &[(BlsPublicKey, H256)],
        sig: &BlsSignature,
    ) -> bool;

    /// Public-key share of a member under the combined verification vectors.
    fn quorum_public_key_share(
        &self,
        vvecs: &[&VerificationVector],
        id: BlsScalarId,
    ) -> BlsPublicKey;

    /// Recovers the threshold signature from `(id, share)` pairs.
    fn threshold_recover(&self, shares: &[(BlsScalarId, BlsSignature)]) -> Option<BlsSignature>;
}

/// Collects signed messages from many sources and verifies them in one pass
/// per source. A failing source gets every message re-checked individually so
/// the specific bad messages are known too.
pub struct BlsBatchVerifier<S, M> {
    items: Vec<BatchItem<S, M>>,
    bad_sources: Vec<S>,
    bad_messages: Vec<M>,
}

struct BatchItem<S, M> {
    source: S,
    msg_id: M,
    sign_hash: H256,
    sig: BlsSignature,
    pubkey: BlsPublicKey,
}

impl<S: Ord + Copy, M: Ord + Copy> Default for BlsBatchVerifier<S, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Ord + Copy, M: Ord + Copy> BlsBatchVerifier<S, M> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            bad_sources: Vec::new(),
            bad_messages: Vec::new(),
        }
    }

    pub fn push_message(
        &mut self,
        source: S,
        msg_id: M,
        sign_hash: H256,
        sig: BlsSignature,
        pubkey: BlsPublicKey,
    ) {
        self.items.push(BatchItem {
            source,
            msg_id,
            sign_hash,
            sig,
            pubkey,
        });
    }

    /// Pre-marks a source bad without verification (e.g. undecodable input).
    pub fn mark_bad_source(&mut self, source: S) {
        if !self.bad_sources.contains(&source) {
            self.bad_sources.push(source);
        }
    }

    pub fn verify(&mut self, backend: &dyn BlsBackend) {
        let mut by_source: BTreeMap<S, Vec<usize>> = BTreeMap::new();
        for (idx, item) in self.items.iter().enumerate() {
            by_source.entry(item.source).or_default().push(idx);
        }

        for (source, idxs) in by_source {
            if self.bad_sources.contains(&source) {
                continue;
            }

            // A null signature can never verify; skip the aggregate work.
            if idxs.iter().any(|idx| !self.items[*idx].sig.is_valid()) {
                self.mark_bad_source(source);
                continue;
            }

            let sigs: Vec<_> = idxs.iter().map(|idx| self.items[*idx].sig).collect();
            let pairs: Vec<_> = idxs
                .iter()
                .map(|idx| (self.items[*idx].pubkey, self.items[*idx].sign_hash))
                .collect();
            let aggregate = backend.aggregate_signatures(&sigs);
            if backend.verify_aggregated_insecure(&pairs, &aggregate) {
                continue;
            }

            self.mark_bad_source(source);
            for idx in idxs {
                let item = &self.items[idx];
                if !backend.verify(&item.pubkey, item.sign_hash, &item.sig) {
                    self.bad_messages.push(item.msg_id);
                }
            }
        }
    }

    pub fn is_bad_source(&self, source: S) -> bool {
        self.bad_sources.contains(&source)
    }

    pub fn bad_sources(&self) -> &[S] {
        &self.bad_sources
    }

    pub fn bad_messages(&self) -> &[M] {
        &self.bad_messages
    }
}

/// Deterministic stand-in scheme over the prime field `2^61 - 1`.
///
/// Keys, shares and signatures are scalars; the "group" operation is field
/// addition, so every protocol identity (polynomial share checks, signature
/// aggregation, Lagrange recovery) holds exactly like in the real scheme while
/// offering zero security.
#[derive(Debug, Default, Clone, Copy)]
pub struct InsecureBls;

const FIELD_ORDER: u128 = (1u128 << 61) - 1;
const GENERATOR: u64 = 7;

fn fadd(a: u64, b: u64) -> u64 {
    ((a as u128 + b as u128) % FIELD_ORDER) as u64
}

fn fsub(a: u64, b: u64) -> u64 {
    ((a as u128 + FIELD_ORDER - b as u128) % FIELD_ORDER) as u64
}

fn fmul(a: u64, b: u64) -> u64 {
    ((a as u128 * b as u128) % FIELD_ORDER) as u64
}

fn fpow(mut base: u64, mut exp: u128) -> u64 {
    let mut acc = 1u64;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = fmul(acc, base);
        }
        base = fmul(base, base);
        exp >>= 1;
    }
    acc
}

fn finv(a: u64) -> Option<u64> {
    (a != 0).then(|| fpow(a, FIELD_ORDER - 2))
}

fn scalar_from_hash(hash: H256) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&hash.as_bytes()[..8]);
    let scalar = (u64::from_le_bytes(raw) as u128 % FIELD_ORDER) as u64;
    if scalar == 0 { 1 } else { scalar }
}

fn scalar_of(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    (u64::from_le_bytes(raw) as u128 % FIELD_ORDER) as u64
}

fn secret_of(sk: &BlsSecretKey) -> u64 {
    scalar_of(&sk.0)
}

fn point_of(pk: &BlsPublicKey) -> u64 {
    scalar_of(&pk.0)
}

fn sig_of(sig: &BlsSignature) -> u64 {
    scalar_of(&sig.0)
}

fn secret_from(scalar: u64) -> BlsSecretKey {
    let mut out = [0u8; BLS_SECRET_KEY_SIZE];
    out[..8].copy_from_slice(&scalar.to_le_bytes());
    BlsSecretKey(out)
}

fn point_from(scalar: u64) -> BlsPublicKey {
    let mut out = [0u8; BLS_PUBLIC_KEY_SIZE];
    out[..8].copy_from_slice(&scalar.to_le_bytes());
    BlsPublicKey(out)
}

fn sig_from(scalar: u64) -> BlsSignature {
    let mut out = [0u8; BLS_SIGNATURE_SIZE];
    out[..8].copy_from_slice(&scalar.to_le_bytes());
    BlsSignature(out)
}

impl InsecureBls {
    /// Evaluates the committed polynomial at `x` in the exponent.
    fn eval_vvec(vvec: &VerificationVector, x: u64) -> u64 {
        let mut acc = 0u64;
        let mut x_pow = 1u64;
        for coeff in vvec {
            acc = fadd(acc, fmul(point_of(coeff), x_pow));
            x_pow = fmul(x_pow, x);
        }
        acc
    }
}

impl BlsBackend for InsecureBls {
    fn secret_from_seed(&self, seed: &[u8]) -> BlsSecretKey {
        secret_from(scalar_from_hash(hash_bytes(seed)))
    }

    fn public_key(&self, sk: &BlsSecretKey) -> BlsPublicKey {
        point_from(fmul(secret_of(sk), GENERATOR))
    }

    fn scalar_id(&self, member: &MemberId) -> BlsScalarId {
        BlsScalarId(scalar_from_hash(hash_bytes(member.as_bytes())))
    }

    fn generate_contribution(
        &self,
        threshold: usize,
        receivers: &[BlsScalarId],
        seed: &[u8],
    ) -> (VerificationVector, Vec<BlsSecretKey>) {
        let mut coefficients = Vec::with_capacity(threshold);
        for k in 0..threshold {
            let mut material = seed.to_vec();
            material.extend_from_slice(&(k as u64).to_le_bytes());
            coefficients.push(scalar_from_hash(hash_bytes(&material)));
        }

        let vvec = coefficients
            .iter()
            .map(|coeff| point_from(fmul(*coeff, GENERATOR)))
            .collect();

        let shares = receivers
            .iter()
            .map(|id| {
                let mut acc = 0u64;
                let mut x_pow = 1u64;
                for coeff in &coefficients {
                    acc = fadd(acc, fmul(*coeff, x_pow));
                    x_pow = fmul(x_pow, id.0);
                }
                secret_from(acc)
            })
            .collect();

        (vvec, shares)
    }

    fn verify_contribution_share(
        &self,
        receiver: BlsScalarId,
        share: &BlsSecretKey,
        vvec: &VerificationVector,
    ) -> bool {
        !vvec.is_empty()
            && fmul(secret_of(share), GENERATOR) == Self::eval_vvec(vvec, receiver.0)
    }

    fn aggregate_secrets(&self, shares: &[BlsSecretKey]) -> BlsSecretKey {
        secret_from(shares.iter().fold(0u64, |acc, sk| fadd(acc, secret_of(sk))))
    }

    fn sign(&self, sk: &BlsSecretKey, msg: H256) -> BlsSignature {
        sig_from(fmul(secret_of(sk), scalar_from_hash(msg)))
    }

    fn verify(&self, pk: &BlsPublicKey, msg: H256, sig: &BlsSignature) -> bool {
        sig.is_valid()
            && fmul(sig_of(sig), GENERATOR)
                == fmul(point_of(pk), scalar_from_hash(msg))
    }

    fn aggregate_public_keys(&self, pks: &[BlsPublicKey]) -> BlsPublicKey {
        point_from(pks.iter().fold(0u64, |acc, pk| fadd(acc, point_of(pk))))
    }

    fn aggregate_signatures(&self, sigs: &[BlsSignature]) -> BlsSignature {
        sig_from(sigs.iter().fold(0u64, |acc, sig| fadd(acc, sig_of(sig))))
    }

    fn verify_aggregated_insecure(
        &self,
        items: &[(BlsPublicKey, H256)],
        sig: &BlsSignature,
    ) -> bool {
        let expected = items.iter().fold(0u64, |acc, (pk, msg)| {
            fadd(acc, fmul(point_of(pk), scalar_from_hash(*msg)))
        });
        fmul(sig_of(sig), GENERATOR) == expected
    }

    fn quorum_public_key_share(
        &self,
        vvecs: &[&VerificationVector],
        id: BlsScalarId,
    ) -> BlsPublicKey {
        point_from(
            vvecs
                .iter()
                .fold(0u64, |acc, vvec| fadd(acc, Self::eval_vvec(vvec, id.0))),
        )
    }

    fn threshold_recover(&self, shares: &[(BlsScalarId, BlsSignature)]) -> Option<BlsSignature> {
        if shares.is_empty() {
            return None;
        }

        let mut acc = 0u64;
        for (j, (id_j, share)) in shares.iter().enumerate() {
            // Lagrange coefficient of id_j at x = 0.
            let mut num = 1u64;
            let mut den = 1u64;
            for (m, (id_m, _)) in shares.iter().enumerate() {
                if m == j {
                    continue;
                }
                num = fmul(num, id_m.0);
                den = fmul(den, fsub(id_m.0, id_j.0));
            }
            let lambda = fmul(num, finv(den)?);
            acc = fadd(acc, fmul(lambda, sig_of(share)));
        }

        Some(sig_from(acc))
    }
}
