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

//! Key-value database layer for Quorex.
//!
//! The storage engine itself is external; everything here is the generic
//! interface, an in-memory implementation, and the bounded write-back cache
//! persistence-touching components sit on.

mod cache;

pub use cache::WriteBackCache;

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;

/// One atomic unit of puts and deletes.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    pub puts: Vec<(Vec<u8>, Vec<u8>)>,
    pub deletes: Vec<Vec<u8>>,
}

impl WriteBatch {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.puts.push((key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.deletes.push(key);
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    /// Total operations, used to bound single-transaction growth.
    pub fn ops(&self) -> usize {
        self.puts.len() + self.deletes.len()
    }
}

/// Generic key-value database consumed through `Box<dyn KVDatabase>`.
///
/// `iter_prefix` must yield keys in ascending lexicographic order: the
/// time-bucketed aging sweeps rely on observing oldest entries first.
pub trait KVDatabase: Send + Sync {
    fn clone_boxed(&self) -> Box<dyn KVDatabase>;

    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn put(&self, key: &[u8], value: Vec<u8>);

    fn delete(&self, key: &[u8]);

    fn contains(&self, key: &[u8]) -> bool;

    fn iter_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Applies all puts and deletes as one atomic unit.
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;
}

impl Clone for Box<dyn KVDatabase> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

impl<T: KVDatabase + Clone + 'static> KVDatabase for Arc<T> {
    fn clone_boxed(&self) -> Box<dyn KVDatabase> {
        Box::new(self.as_ref().clone())
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.as_ref().get(key)
    }

    fn put(&self, key: &[u8], value: Vec<u8>) {
        self.as_ref().put(key, value)
    }

    fn delete(&self, key: &[u8]) {
        self.as_ref().delete(key)
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.as_ref().contains(key)
    }

    fn iter_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        self.as_ref().iter_prefix(prefix)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.as_ref().write_batch(batch)
    }
}

/// In-memory database. Clones share storage.
#[derive(Debug, Default, Clone)]
pub struct MemDb {
    inner: Arc<DashMap<Vec<u8>, Vec<u8>>>,
}

impl KVDatabase for MemDb {
    fn clone_boxed(&self) -> Box<dyn KVDatabase> {
        Box::new(self.clone())
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.get(key).map(|v| v.value().clone())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) {
        self.inner.insert(key.to_vec(), value);
    }

    fn delete(&self, key: &[u8]) {
        self.inner.remove(key);
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.inner.contains_key(key)
    }

    fn iter_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let mut entries: Vec<_> = self
            .inner
            .iter()
            .filter(|refs| refs.key().starts_with(prefix))
            .map(|refs| (refs.key().clone(), refs.value().clone()))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        Box::new(entries.into_iter())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        for (key, value) in batch.puts {
            self.inner.insert(key, value);
        }
        for key in batch.deletes {
            self.inner.remove(&key);
        }
        Ok(())
    }
}

/// Wrapper whose batch writes can be made to fail, for exercising the cache
/// flush-failure contract.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default, Clone)]
pub struct FailingDb {
    mem: MemDb,
    fail_batches: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(any(test, feature = "test-utils"))]
impl FailingDb {
    pub fn fail_next_batches(&self, fail: bool) {
        self.fail_batches
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn mem(&self) -> MemDb {
        self.mem.clone()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl KVDatabase for FailingDb {
    fn clone_boxed(&self) -> Box<dyn KVDatabase> {
        Box::new(self.clone())
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.mem.get(key)
    }

    fn put(&self, key: &[u8], value: Vec<u8>) {
        self.mem.put(key, value)
    }

    fn delete(&self, key: &[u8]) {
        self.mem.delete(key)
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.mem.contains(key)
    }

    fn iter_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        self.mem.iter_prefix(prefix)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        if self.fail_batches.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("batch write failure injected");
        }
        self.mem.write_batch(batch)
    }
}
