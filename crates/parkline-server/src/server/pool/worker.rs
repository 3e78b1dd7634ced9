//! A single pool worker and its mailbox loop.
//!
//! A [`Worker`] is the dispatcher's handle to one worker task. Capacity is a
//! counting semaphore with one permit per concurrent operation: the dispatcher
//! takes permits when it admits work and the worker task returns one after
//! every item it finishes. Returning a permit never touches the dispatcher's
//! pool lock, so the dispatcher's view of a worker's free capacity is only a
//! hint until its next reconciliation pass.

use crate::server::{
    processing::processor::PackageProcessor,
    telemetry::{increment_items_processed, increment_processing_errors},
};
use parkline_core::{Error, Result, WorkItem, WorkerId};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::{
    sync::{Semaphore, mpsc, oneshot},
    time::timeout,
};

/// A message delivered to a worker's mailbox.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Process one admitted item, then release its capacity unit.
    Process { item: WorkItem },

    /// Stop after everything queued ahead of this message has been processed.
    ///
    /// - `response`: One-shot channel acknowledging that the worker loop has
    ///   exited.
    Shutdown { response: oneshot::Sender<()> },
}

/// State shared between the dispatcher-side handle and the worker task.
#[derive(Debug)]
pub(crate) struct WorkerState {
    capacity: usize,
    permits: Semaphore,
    owner: OnceLock<Arc<str>>,
}

impl WorkerState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: Semaphore::new(capacity),
            owner: OnceLock::new(),
        }
    }

    fn free(&self) -> usize {
        self.permits.available_permits().min(self.capacity)
    }

    /// Returns one unit of capacity. Called from the worker task only.
    fn release(&self) {
        if self.permits.available_permits() < self.capacity {
            self.permits.add_permits(1);
        }
    }

    fn owner(&self) -> &str {
        self.owner.get().map_or("unbound", |owner| &**owner)
    }
}

/// Dispatcher-side handle to a running worker task.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    state: Arc<WorkerState>,
    mailbox: mpsc::Sender<WorkerMessage>,
}

impl Worker {
    /// Spawns a worker task with `capacity` units and returns its handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<P>(id: WorkerId, capacity: usize, processor: Arc<P>) -> Arc<Self>
    where
        P: PackageProcessor,
    {
        // At most `capacity` items can be admitted but not yet dequeued, plus
        // one slot for the shutdown message, so `submit` never sees a full
        // mailbox.
        let (tx, rx) = mpsc::channel(capacity + 1);
        let state = Arc::new(WorkerState::new(capacity));

        tokio::spawn(worker_loop(id, rx, Arc::clone(&state), processor));

        Arc::new(Self {
            id,
            state,
            mailbox: tx,
        })
    }

    pub const fn id(&self) -> WorkerId {
        self.id
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    /// Current spare capacity, `capacity - in_flight`.
    pub fn free(&self) -> usize {
        self.state.free()
    }

    /// Operations admitted but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.state.capacity - self.state.free()
    }

    /// Reserves `units` of capacity without waiting.
    ///
    /// Returns `false` and reserves nothing if fewer than `units` are free.
    pub fn acquire(&self, units: usize) -> bool {
        if units == 0 {
            return true;
        }
        let Ok(units) = u32::try_from(units) else {
            return false;
        };
        match self.state.permits.try_acquire_many(units) {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Reserves one unit, waiting up to `wait` for a completion to free one.
    pub async fn try_acquire_timeout(&self, wait: Duration) -> bool {
        match timeout(wait, self.state.permits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            Ok(Err(_)) | Err(_) => false,
        }
    }

    /// Consumes up to `units` of the remaining capacity and stops admitting
    /// new work. Returns the number of units consumed.
    pub fn force_acquire(&self, units: usize) -> usize {
        let consumed = self.state.permits.forget_permits(units);
        self.state.permits.close();
        consumed
    }

    /// Gives back a unit reserved by [`Worker::acquire`] or
    /// [`Worker::try_acquire_timeout`] that was never submitted.
    pub fn release(&self) {
        self.state.release();
    }

    /// Delivers an admitted item to the worker's mailbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the worker task has stopped.
    pub fn submit(&self, item: WorkItem) -> Result<()> {
        self.mailbox
            .try_send(WorkerMessage::Process { item })
            .map_err(|e| Error::ChannelError {
                context: format!("{} mailbox rejected item: {e}", self.id),
            })
    }

    /// Binds the owning dispatcher's name as this worker's log context.
    ///
    /// The first binding wins; later calls are no-ops.
    pub fn bind_owner(&self, owner: &Arc<str>) {
        let _ = self.state.owner.get_or_init(|| Arc::clone(owner));
    }

    #[cfg(test)]
    pub fn owner(&self) -> Option<&str> {
        self.state.owner.get().map(|owner| &**owner)
    }

    /// Asks the worker task to stop once its queued items are processed.
    ///
    /// Returns the acknowledgement receiver, or `None` if the worker task has
    /// already stopped.
    pub fn shutdown(&self) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        match self.mailbox.try_send(WorkerMessage::Shutdown { response: tx }) {
            Ok(()) => Some(rx),
            Err(e) => {
                tracing::debug!("{} not accepting shutdown: {e}", self.id);
                None
            }
        }
    }
}

/// Worker task processing [`WorkerMessage`]s in mailbox order.
///
/// Each item is handed to the [`PackageProcessor`]; a returned response is
/// routed back through the item's connection handle. Capacity is released
/// after every item whatever the outcome, since a failed item is not retried.
async fn worker_loop<P>(
    worker_id: WorkerId,
    mut rx: mpsc::Receiver<WorkerMessage>,
    state: Arc<WorkerState>,
    processor: Arc<P>,
) where
    P: PackageProcessor,
{
    tracing::trace!("{worker_id} started");

    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Process { item } => {
                match processor.process(worker_id, &item).await {
                    Ok(Some(response)) => {
                        if let Err(e) = item.connection().respond(item.package_type(), response) {
                            tracing::debug!("{worker_id} dropped response: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        increment_processing_errors();
                        tracing::warn!(
                            "{worker_id} ({}) failed package {} from {}: {e}",
                            state.owner(),
                            item.package_type(),
                            item.connection().id()
                        );
                    }
                }
                state.release();
                increment_items_processed();
            }
            WorkerMessage::Shutdown { response } => {
                tracing::debug!("{worker_id} ({}) received shutdown signal", state.owner());

                if response.send(()).is_err() {
                    tracing::trace!("{worker_id} shutdown acknowledgement unobserved");
                }
                break;
            }
        }
    }

    tracing::trace!("{worker_id} stopped");
}
