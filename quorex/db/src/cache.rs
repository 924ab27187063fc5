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

//! Bounded write-back cache layered over a [`KVDatabase`].

use crate::{KVDatabase, WriteBatch};
use indexmap::IndexMap;
use parity_scale_codec::{Decode, Encode};
use parking_lot::Mutex;
use std::{collections::HashSet, hash::Hash};

/// FIFO-bounded write-back cache.
///
/// Writes and erases accumulate in memory and reach the backing store only on
/// [`flush`](Self::flush), which applies them as one atomic batch. When the
/// combined number of pending writes and erases exceeds `max_entries`, the
/// oldest pending write is dropped from memory; the backing store is never
/// touched by eviction. An erase arms a flush-before-next-read so stale
/// in-flight readers observe the erase consistently.
pub struct WriteBackCache<K, V>
where
    K: Encode + Eq + Hash + Clone,
    V: Encode + Decode + Clone,
{
    db: Box<dyn KVDatabase>,
    prefix: u8,
    max_entries: usize,
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    pending: IndexMap<K, V>,
    pending_erase: HashSet<K>,
    flush_before_read: bool,
}

impl<K, V> WriteBackCache<K, V>
where
    K: Encode + Eq + Hash + Clone,
    V: Encode + Decode + Clone,
{
    /// `max_entries == 0` disables the bound.
    pub fn new(db: Box<dyn KVDatabase>, prefix: u8, max_entries: usize) -> Self {
        Self {
            db,
            prefix,
            max_entries,
            inner: Mutex::new(Inner {
                pending: IndexMap::new(),
                pending_erase: HashSet::new(),
                flush_before_read: false,
            }),
        }
    }

    fn storage_key(&self, key: &K) -> Vec<u8> {
        let mut out = vec![self.prefix];
        key.encode_to(&mut out);
        out
    }

    pub fn read(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        self.maybe_flush_before_read(&mut inner);

        if let Some(value) = inner.pending.get(key) {
            return Some(value.clone());
        }
        if inner.pending_erase.contains(key) {
            return None;
        }
        let raw = self.db.get(&self.storage_key(key))?;
        V::decode(&mut raw.as_slice()).ok()
    }

    pub fn exists(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        self.maybe_flush_before_read(&mut inner);

        if inner.pending.contains_key(key) {
            return true;
        }
        if inner.pending_erase.contains(key) {
            return false;
        }
        self.db.contains(&self.storage_key(key))
    }

    pub fn write(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        // Re-inserting moves the entry to the FIFO back.
        inner.pending.shift_remove(&key);
        inner.pending_erase.remove(&key);
        inner.pending.insert(key, value);

        if self.max_entries > 0
            && inner.pending.len() + inner.pending_erase.len() > self.max_entries
        {
            inner.pending.shift_remove_index(0);
        }
    }

    pub fn erase(&self, key: K) {
        let mut inner = self.inner.lock();
        inner.pending.shift_remove(&key);
        inner.pending_erase.insert(key);
        inner.flush_before_read = true;
    }

    /// Applies all pending state as one batch. On failure the pending state
    /// is left completely untouched so the caller can retry.
    pub fn flush(&self) -> bool {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        self.max_entries > 0
            && inner.pending.len() + inner.pending_erase.len() >= self.max_entries
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn pending_erases(&self) -> usize {
        self.inner.lock().pending_erase.len()
    }

    fn maybe_flush_before_read(&self, inner: &mut Inner<K, V>) {
        if inner.flush_before_read {
            log::debug!("flushing write-back cache before read");
            // On failure the pending view stays authoritative; keep the flag
            // armed so the next read retries.
            self.flush_locked(inner);
        }
    }

    fn flush_locked(&self, inner: &mut Inner<K, V>) -> bool {
        if inner.pending.is_empty() && inner.pending_erase.is_empty() {
            inner.flush_before_read = false;
            return true;
        }

        let mut batch = WriteBatch::default();
        for (key, value) in &inner.pending {
            batch.put(self.storage_key(key), value.encode());
        }
        for key in &inner.pending_erase {
            batch.delete(self.storage_key(key));
        }

        match self.db.write_batch(batch) {
            Ok(()) => {
                log::debug!(
                    "flushed write-back cache: {} writes, {} erases",
                    inner.pending.len(),
                    inner.pending_erase.len(),
                );
                inner.pending.clear();
                inner.pending_erase.clear();
                inner.flush_before_read = false;
                true
            }
            Err(err) => {
                log::warn!("write-back cache flush failed: {err}");
                false
            }
        }
    }
}

impl<K, V> Drop for WriteBackCache<K, V>
where
    K: Encode + Eq + Hash + Clone,
    V: Encode + Decode + Clone,
{
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.pending.is_empty() || !inner.pending_erase.is_empty() {
            let mut batch = WriteBatch::default();
            for (key, value) in &inner.pending {
                let mut storage_key = vec![self.prefix];
                key.encode_to(&mut storage_key);
                batch.put(storage_key, value.encode());
            }
            for key in &inner.pending_erase {
                let mut storage_key = vec![self.prefix];
                key.encode_to(&mut storage_key);
                batch.delete(storage_key);
            }
            if self.db.write_batch(batch).is_err() {
                log::warn!("final write-back cache flush failed, pending data lost");
            }
        }
    }
}
