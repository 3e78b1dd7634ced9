//! Capacity-bucketed index over the worker pool.
//!
//! [`PoolIndex`] files every live worker under the free-capacity value it had
//! when it was last looked at. Workers release capacity without touching the
//! index, so placement drifts between dispatches; [`PoolIndex::reconcile`]
//! folds all accumulated drift back in with one pass over the pool.
//!
//! Buckets are ordered maps keyed by [`WorkerId`], so "first worker in a
//! bucket" is always the oldest one. That is the dispatcher's tie-break.

use super::worker::Worker;
use parkline_core::WorkerId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug)]
pub struct PoolIndex {
    buckets: Vec<BTreeMap<WorkerId, Arc<Worker>>>,
    placement: HashMap<WorkerId, usize>,
}

impl PoolIndex {
    /// Creates an empty index with buckets `0..=capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            buckets: vec![BTreeMap::new(); capacity + 1],
            placement: HashMap::new(),
        }
    }

    /// Highest bucket key.
    pub fn capacity(&self) -> usize {
        self.buckets.len() - 1
    }

    pub fn len(&self) -> usize {
        self.placement.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.placement.is_empty()
    }

    /// Bucket key `id` is currently filed under.
    #[cfg(test)]
    pub fn bucket_of(&self, id: WorkerId) -> Option<usize> {
        self.placement.get(&id).copied()
    }

    /// Number of workers filed under each key, indexed by key.
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(BTreeMap::len).collect()
    }

    /// Files `worker` under its current free value, moving it if it is
    /// already present.
    pub fn refile(&mut self, worker: &Arc<Worker>) {
        self.place(worker, worker.free());
    }

    /// Files `worker` under `key`, moving it if it is already present.
    pub fn place(&mut self, worker: &Arc<Worker>, key: usize) {
        let key = key.min(self.capacity());
        let id = worker.id();

        if let Some(previous) = self.placement.insert(id, key) {
            if previous == key {
                return;
            }
            self.buckets[previous].remove(&id);
        }
        self.buckets[key].insert(id, Arc::clone(worker));
    }

    /// Oldest worker filed under `key`.
    pub fn first_at(&self, key: usize) -> Option<Arc<Worker>> {
        self.buckets
            .get(key)
            .and_then(|bucket| bucket.values().next())
            .map(Arc::clone)
    }

    /// All workers filed under `key`, oldest first.
    pub fn workers_at(&self, key: usize) -> Vec<Arc<Worker>> {
        self.buckets
            .get(key)
            .map(|bucket| bucket.values().map(Arc::clone).collect())
            .unwrap_or_default()
    }

    /// Every filed worker, oldest first.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        let mut workers: Vec<_> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.values().map(Arc::clone))
            .collect();
        workers.sort_by_key(|worker| worker.id());
        workers
    }

    /// Moves every worker whose free value differs from its bucket key to the
    /// bucket matching its current value. Returns the number of workers moved.
    ///
    /// Afterwards each worker's key equals the free value read during the
    /// pass.
    pub fn reconcile(&mut self) -> usize {
        let mut stale = Vec::new();

        for (key, bucket) in self.buckets.iter().enumerate() {
            for worker in bucket.values() {
                let free = worker.free();
                if free != key {
                    stale.push((Arc::clone(worker), free));
                }
            }
        }

        let moved = stale.len();
        for (worker, free) in stale {
            self.place(&worker, free);
        }
        moved
    }

    /// Empties the index, returning workers from the highest bucket down to
    /// bucket 0.
    pub fn drain(&mut self) -> Vec<Arc<Worker>> {
        self.placement.clear();
        self.buckets
            .iter_mut()
            .rev()
            .flat_map(|bucket| core::mem::take(bucket).into_values())
            .collect()
    }
}
