//! Dispatch service: the dispatcher plus its mailbox loop.
//!
//! This module defines [`DispatchService`], which owns the [`Dispatcher`] and
//! the task that feeds it, and [`DispatchHandle`], the cloneable entry point
//! the connection layer uses to hand over packages.
//!
//! ## Responsibilities
//!
//! - Create the dispatcher and its initial workers.
//! - Run a single mailbox loop so dispatch requests are selected strictly one
//!   at a time.
//! - Accept packages from the connection layer without ever blocking or
//!   failing the caller.
//! - Drain the pool on shutdown.

use crate::server::{
    pool::manager::{Dispatcher, DispatcherConfig, Teardown},
    processing::processor::PackageProcessor,
    telemetry::record_dispatch_latency,
};
use bytes::Bytes;
use parkline_core::{ConnectionHandle, Error, PackageType, WorkItem};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// A work item waiting in the dispatcher's mailbox.
#[derive(Debug)]
pub struct DispatchRequest {
    item: WorkItem,
    received: Instant,
}

/// Cloneable sender side of the dispatcher's mailbox.
#[derive(Clone, Debug)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<DispatchRequest>,
}

impl DispatchHandle {
    /// Queues a package for dispatch. Never blocks and never fails; if the
    /// dispatcher has stopped, the package is logged and dropped.
    pub fn dispatch(&self, connection: ConnectionHandle, package_type: PackageType, payload: Bytes) {
        let request = DispatchRequest {
            item: WorkItem::new(connection, package_type, payload),
            received: Instant::now(),
        };

        if let Err(e) = self.tx.send(request) {
            let item = e.0.item;
            tracing::warn!(
                "Dispatcher stopped, dropping package {} from {}",
                item.package_type(),
                item.connection().id()
            );
        }
    }
}

/// Owns the [`Dispatcher`] and the task draining its mailbox.
pub struct DispatchService<P> {
    dispatcher: Arc<Dispatcher<P>>,
    handle: DispatchHandle,
}

impl<P> Clone for DispatchService<P> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            handle: self.handle.clone(),
        }
    }
}

impl<P> DispatchService<P>
where
    P: PackageProcessor,
{
    /// Creates the dispatcher, spawns its initial workers and starts the
    /// mailbox loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: DispatcherConfig, processor: P) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            "data-dispatcher",
            config,
            Arc::new(processor),
        ));
        dispatcher.start();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(Arc::clone(&dispatcher), rx));

        Self {
            dispatcher,
            handle: DispatchHandle { tx },
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    pub const fn dispatcher(&self) -> &Arc<Dispatcher<P>> {
        &self.dispatcher
    }

    /// Drains the worker pool. Packages still in the mailbox, or arriving
    /// later, are dropped. Items already admitted keep running; await the
    /// returned [`Teardown`] to let them finish.
    pub fn shutdown(&self) -> Teardown {
        tracing::info!("Refusing new packages");
        self.dispatcher.drain()
    }
}

/// Processes dispatch requests one at a time until every handle is dropped.
async fn dispatch_loop<P>(
    dispatcher: Arc<Dispatcher<P>>,
    mut rx: mpsc::UnboundedReceiver<DispatchRequest>,
) where
    P: PackageProcessor,
{
    tracing::info!("{} accepting packages", dispatcher.name());

    while let Some(DispatchRequest { item, received }) = rx.recv().await {
        let package_type = item.package_type();
        let connection = item.connection().id();

        match dispatcher.dispatch(item).await {
            Ok(worker) => {
                record_dispatch_latency(received.elapsed().as_secs_f64() * 1_000.0);
                tracing::trace!("Package {package_type} from {connection} assigned to {worker}");
            }
            Err(Error::ServiceShutdown) => {
                tracing::debug!("Dropping package {package_type} from {connection}: shutting down");
            }
            Err(e) => {
                tracing::warn!("Dropping package {package_type} from {connection}: {e}");
            }
        }
    }

    tracing::info!("{} mailbox closed", dispatcher.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::processing::processor::{
        AckProcessor,
        tests::{GateProcessor, eventually, work_item},
    };
    use core::time::Duration;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            initial_workers: 2,
            worker_capacity: 4,
            probe_timeout: Duration::from_millis(10),
            max_workers: None,
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn dispatched_packages_are_acknowledged() {
        let service = DispatchService::new(config(), AckProcessor);
        let handle = service.handle();

        let (item, mut rx) = work_item(12);
        handle.dispatch(
            item.connection().clone(),
            item.package_type(),
            item.payload().clone(),
        );

        let response = rx.recv().await.unwrap();
        assert_eq!(response.package_type(), PackageType::new(12));
        assert_eq!(response.payload().as_ref(), &7_u32.to_be_bytes());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_lets_admitted_items_finish() {
        let processor = GateProcessor::default();
        let service = DispatchService::new(config(), processor);
        let (item, mut rx) = work_item(8);
        let id = service.dispatcher().dispatch(item).await.unwrap();

        let teardown = service.shutdown();
        assert_eq!(teardown.workers(), 2);

        // Still running after the drain; finishes once its gate opens.
        let gate = Arc::clone(service.dispatcher());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            gate.processor().open(id, 1);
        });

        tokio::time::timeout(Duration::from_secs(2), teardown.join())
            .await
            .unwrap();
        assert_eq!(service.dispatcher().processor().processed(), 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn packages_after_shutdown_are_dropped() {
        let service = DispatchService::new(config(), AckProcessor);
        assert_eq!(service.shutdown().workers(), 2);
        assert_eq!(service.shutdown().workers(), 0);

        let (item, rx) = work_item(1);
        service.handle().dispatch(
            item.connection().clone(),
            item.package_type(),
            item.payload().clone(),
        );
        drop(item);

        // The request is dropped, so the connection's last sender goes away.
        eventually(|| rx.is_closed()).await;
        assert_eq!(service.dispatcher().stats().workers, 0);
    }
}
