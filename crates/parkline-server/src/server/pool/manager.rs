//! Capacity-aware dispatcher over a growable worker pool.
//!
//! This module defines the [`Dispatcher`], which owns every worker, files them
//! in a [`PoolIndex`] by spare capacity, and picks a worker for each incoming
//! [`WorkItem`]. Selection runs under the pool lock:
//!
//! 1. Reconcile the index with the workers' live capacity counters.
//! 2. Take the oldest worker from the highest nonempty bucket above zero.
//! 3. If every worker is saturated, probe them one by one with a bounded wait
//!    (outside the lock, so one slow worker cannot stall the pool).
//! 4. If no probe succeeds, grow the pool by one worker.
//!
//! Dispatch therefore never fails for lack of capacity. Unless a worker cap is
//! configured, overload is relieved by adding workers, which is logged as a
//! capacity-planning alarm.

use super::{index::PoolIndex, worker::Worker};
use crate::server::{
    processing::processor::PackageProcessor,
    telemetry::{
        adjust_pool_size, increment_degraded_probes, increment_dispatches,
        increment_pool_growth, increment_workers_created,
    },
};
use core::time::Duration;
use futures::future::join_all;
use parking_lot::Mutex;
use parkline_core::{Error, Result, WorkItem, WorkerId};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::{task::JoinHandle, time::timeout};

/// Resolved dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Workers created by [`Dispatcher::start`].
    pub initial_workers: usize,
    /// Concurrent operations each worker accepts.
    pub worker_capacity: usize,
    /// How long degraded mode waits on each saturated worker.
    pub probe_timeout: Duration,
    /// Upper bound on pool size. `None` lets the pool grow without limit.
    pub max_workers: Option<usize>,
    /// How long background teardown waits for each worker's acknowledgement.
    pub shutdown_timeout: Duration,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub free_capacity: usize,
    /// Number of workers filed under each bucket key, indexed by key.
    pub buckets: Vec<usize>,
}

/// Background teardown started by [`Dispatcher::drain`].
///
/// Dropping it detaches the teardown task. Awaiting [`Teardown::join`] waits
/// until every drained worker has processed its queued items and stopped, or
/// timed out doing so.
#[derive(Debug, Default)]
pub struct Teardown {
    workers: usize,
    handle: Option<JoinHandle<()>>,
}

impl Teardown {
    /// Workers scheduled for teardown. Zero for every drain after the first.
    pub const fn workers(&self) -> usize {
        self.workers
    }

    pub async fn join(self) {
        if let Some(handle) = self.handle {
            if let Err(e) = handle.await {
                tracing::error!("Worker teardown task failed: {e}");
            }
        }
    }
}

pub struct Dispatcher<P> {
    name: Arc<str>,
    config: DispatcherConfig,
    processor: Arc<P>,
    index: Mutex<PoolIndex>,
    next_worker_id: AtomicU64,
    started: AtomicBool,
    drained: AtomicBool,
}

impl<P> Dispatcher<P>
where
    P: PackageProcessor,
{
    /// Creates a dispatcher with an empty pool. Call [`Dispatcher::start`] to
    /// create the initial workers.
    pub fn new(name: impl Into<Arc<str>>, config: DispatcherConfig, processor: Arc<P>) -> Self {
        let index = PoolIndex::new(config.worker_capacity);
        Self {
            name: name.into(),
            config,
            processor,
            index: Mutex::new(index),
            next_worker_id: AtomicU64::new(0),
            started: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub const fn processor(&self) -> &Arc<P> {
        &self.processor
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    /// Creates the initial workers. Only the first call has any effect.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut index = self.index.lock();
        if self.is_drained() {
            return;
        }
        for _ in 0..self.config.initial_workers {
            let worker = self.spawn_worker();
            index.refile(&worker);
        }

        tracing::info!(
            "{} started with {} workers (capacity {} each)",
            self.name,
            index.len(),
            self.config.worker_capacity
        );
    }

    fn spawn_worker(&self) -> Arc<Worker> {
        let id = WorkerId::new(self.next_worker_id.fetch_add(1, Ordering::Relaxed));
        let worker = Worker::spawn(id, self.config.worker_capacity, Arc::clone(&self.processor));
        worker.bind_owner(&self.name);

        increment_workers_created();
        adjust_pool_size(1);
        tracing::debug!("{}: created {id}", self.name);
        worker
    }

    /// Re-files every worker under its current free capacity. Returns the
    /// number of workers that moved.
    #[cfg(test)]
    pub fn reconcile(&self) -> usize {
        self.index.lock().reconcile()
    }

    /// Picks a worker for one item and reserves one unit of its capacity.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once [`Dispatcher::drain`] has run.
    /// - [`Error::PoolExhausted`] if a worker cap is configured, the pool is
    ///   at the cap, and no saturated worker frees up within the probe
    ///   timeout.
    pub async fn select(&self) -> Result<Arc<Worker>> {
        let saturated = {
            let mut index = self.index.lock();
            if self.is_drained() {
                return Err(Error::ServiceShutdown);
            }

            index.reconcile();
            if let Some(worker) = Self::take_most_available(&mut index) {
                worker.bind_owner(&self.name);
                return Ok(worker);
            }
            index.workers_at(0)
        };

        if let Some(worker) = self.probe_saturated(saturated).await? {
            return Ok(worker);
        }

        self.grow()
    }

    /// Scans buckets from most to least free and reserves a unit on the first
    /// worker that still has one.
    fn take_most_available(index: &mut PoolIndex) -> Option<Arc<Worker>> {
        for key in (1..=index.capacity()).rev() {
            while let Some(worker) = index.first_at(key) {
                if worker.acquire(1) {
                    index.refile(&worker);
                    return Some(worker);
                }
                // Lost its capacity since reconciliation.
                index.place(&worker, 0);
            }
        }
        None
    }

    /// Degraded mode: waits on each saturated worker in turn, without holding
    /// the pool lock, and returns the first that frees a unit.
    async fn probe_saturated(&self, saturated: Vec<Arc<Worker>>) -> Result<Option<Arc<Worker>>> {
        if saturated.is_empty() {
            return Ok(None);
        }

        tracing::debug!(
            "{}: all {} workers saturated, probing for {:?} each",
            self.name,
            saturated.len(),
            self.config.probe_timeout
        );

        for worker in saturated {
            increment_degraded_probes();
            if !worker.try_acquire_timeout(self.config.probe_timeout).await {
                continue;
            }

            let mut index = self.index.lock();
            if self.is_drained() {
                worker.release();
                return Err(Error::ServiceShutdown);
            }
            index.refile(&worker);
            worker.bind_owner(&self.name);
            return Ok(Some(worker));
        }

        Ok(None)
    }

    /// Adds a worker to the pool and reserves a unit on it.
    fn grow(&self) -> Result<Arc<Worker>> {
        let mut index = self.index.lock();
        if self.is_drained() {
            return Err(Error::ServiceShutdown);
        }
        if let Some(limit) = self.config.max_workers {
            if index.len() >= limit {
                return Err(Error::PoolExhausted { limit });
            }
        }

        let worker = self.spawn_worker();
        index.refile(&worker);
        if worker.acquire(1) {
            index.refile(&worker);
        }

        increment_pool_growth();
        tracing::warn!(
            "{}: no worker freed capacity within {:?}, pool grown to {} workers",
            self.name,
            self.config.probe_timeout,
            index.len()
        );

        Ok(worker)
    }

    /// Selects a worker for `item` and forwards the item to its mailbox.
    /// Returns the id of the chosen worker.
    ///
    /// # Errors
    ///
    /// Propagates [`Dispatcher::select`] errors, and returns
    /// [`Error::ChannelError`] if the chosen worker's task has stopped.
    pub async fn dispatch(&self, item: WorkItem) -> Result<WorkerId> {
        let worker = self.select().await?;
        if let Err(e) = worker.submit(item) {
            worker.release();
            return Err(e);
        }

        increment_dispatches();
        Ok(worker.id())
    }

    /// Stops admission and tears down every worker. Only the first call has
    /// any effect; later calls return an empty [`Teardown`].
    ///
    /// Each worker's remaining capacity is consumed so nothing new can be
    /// admitted to it, and its task is asked to stop once queued items are
    /// processed. This does not wait for those items: the returned
    /// [`Teardown`] tracks the acknowledgements and can be awaited.
    pub fn drain(&self) -> Teardown {
        let (workers, in_flight) = {
            let mut index = self.index.lock();
            if self.drained.swap(true, Ordering::AcqRel) {
                return Teardown::default();
            }

            let workers = index.drain();
            let in_flight: usize = workers.iter().map(|worker| worker.in_flight()).sum();
            for worker in &workers {
                worker.force_acquire(self.config.worker_capacity);
            }
            (workers, in_flight)
        };

        let count = workers.len();
        adjust_pool_size(-(count as i64));
        tracing::info!(
            "{}: draining {count} workers with {in_flight} items in flight",
            self.name
        );

        let acks: Vec<_> = workers
            .iter()
            .filter_map(|worker| worker.shutdown().map(|rx| (worker.id(), rx)))
            .collect();
        drop(workers);

        let wait = self.config.shutdown_timeout;
        let name = Arc::clone(&self.name);
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(async move {
                let pending = acks.into_iter().map(|(id, rx)| async move {
                    match timeout(wait, rx).await {
                        Ok(Ok(())) => tracing::trace!("{id} shutdown acknowledged"),
                        Ok(Err(e)) => tracing::error!("{id} dropped its acknowledgement: {e}"),
                        Err(_) => tracing::warn!("{id} shutdown timed out"),
                    }
                });
                join_all(pending).await;
                tracing::info!("{name}: worker teardown complete");
            })),
            Err(_) => {
                tracing::debug!("{name}: no runtime, worker acknowledgements not observed");
                None
            }
        };

        Teardown {
            workers: count,
            handle,
        }
    }

    /// Snapshot of the pool as currently filed.
    pub fn stats(&self) -> PoolStats {
        let index = self.index.lock();
        let workers = index.workers();
        PoolStats {
            workers: workers.len(),
            free_capacity: workers.iter().map(|worker| worker.free()).sum(),
            buckets: index.bucket_sizes(),
        }
    }

    /// Every worker in the pool, oldest first.
    #[cfg(test)]
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.index.lock().workers()
    }

    /// Bucket key the worker is currently filed under.
    #[cfg(test)]
    pub fn placement(&self, id: WorkerId) -> Option<usize> {
        self.index.lock().bucket_of(id)
    }
}
