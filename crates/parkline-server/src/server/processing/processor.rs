//! Per-item processing contract and the default acknowledging processor.
//!
//! Workers call [`PackageProcessor::process`] once for every admitted item, on
//! the worker's own task.

use bytes::Bytes;
use parkline_core::{Result, WorkItem, WorkerId};

/// The operation a worker performs on each admitted [`WorkItem`].
///
/// Implementations are shared by every worker in the pool, so they must be
/// `Send + Sync`. A returned `Some(bytes)` is sent back to the originating
/// connection under the item's package type; `None` sends nothing.
///
/// Errors are logged by the worker and the item is dropped. The dispatcher
/// never retries.
pub trait PackageProcessor: Send + Sync + 'static {
    fn process(
        &self,
        worker: WorkerId,
        item: &WorkItem,
    ) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}

/// Default processor: logs each package and acknowledges it with the payload
/// length as a big-endian `u32`.
#[derive(Clone, Copy, Debug, Default)]
pub struct AckProcessor;

impl PackageProcessor for AckProcessor {
    async fn process(&self, worker: WorkerId, item: &WorkItem) -> Result<Option<Bytes>> {
        let length = item.payload().len();
        tracing::debug!(
            "{worker} processed package {} ({length} bytes) from {}",
            item.package_type(),
            item.connection().peer()
        );

        let ack = u32::try_from(length).unwrap_or(u32::MAX).to_be_bytes();
        Ok(Some(Bytes::copy_from_slice(&ack)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use parkline_core::{ConnectionHandle, ConnectionId, Frame, PackageType};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Semaphore, mpsc};

    /// Processor whose items block until the test opens the gate of the worker
    /// processing them.
    #[derive(Debug, Default)]
    pub(crate) struct GateProcessor {
        gates: Mutex<HashMap<WorkerId, Arc<Semaphore>>>,
        processed: AtomicUsize,
    }

    impl GateProcessor {
        fn gate(&self, worker: WorkerId) -> Arc<Semaphore> {
            Arc::clone(
                self.gates
                    .lock()
                    .entry(worker)
                    .or_insert_with(|| Arc::new(Semaphore::new(0))),
            )
        }

        /// Lets `items` queued on `worker` complete.
        pub(crate) fn open(&self, worker: WorkerId, items: usize) {
            self.gate(worker).add_permits(items);
        }

        pub(crate) fn processed(&self) -> usize {
            self.processed.load(Ordering::Acquire)
        }

        pub(crate) async fn wait_processed(&self, count: usize) {
            eventually(|| self.processed() >= count).await;
        }
    }

    impl PackageProcessor for GateProcessor {
        async fn process(&self, worker: WorkerId, _item: &WorkItem) -> Result<Option<Bytes>> {
            let gate = self.gate(worker);
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
            self.processed.fetch_add(1, Ordering::AcqRel);
            Ok(None)
        }
    }

    /// Polls `condition` until it holds, panicking after two seconds.
    pub(crate) async fn eventually(condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    pub(crate) fn work_item(package_type: i32) -> (WorkItem, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = "127.0.0.1:40000".parse().unwrap();
        let connection = ConnectionHandle::new(ConnectionId::new(1), peer, tx);
        let item = WorkItem::new(
            connection,
            PackageType::new(package_type),
            Bytes::from_static(b"payload"),
        );
        (item, rx)
    }

    #[tokio::test]
    async fn ack_processor_replies_with_length() {
        let (item, _rx) = work_item(3);

        let response = AckProcessor
            .process(WorkerId::new(0), &item)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.as_ref(), &7_u32.to_be_bytes());
    }
}
