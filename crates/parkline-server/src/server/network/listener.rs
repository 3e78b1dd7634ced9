//! TCP listener feeding the dispatcher.
//!
//! [`Listener`] accepts connections up to a configured limit and spawns
//! [`serve_connection`] for each one. Cancelling the shutdown token stops the
//! accept loop and every open connection's reader.

use super::connection::serve_connection;
use crate::server::service::handler::DispatchHandle;
use parkline_core::{ConnectionId, Error, FrameCodec, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::Semaphore};
use tokio_util::sync::CancellationToken;

pub struct Listener {
    listener: TcpListener,
    codec: FrameCodec,
    connections: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Binds `addr` and prepares to serve up to `max_connections` concurrent
    /// connections with payloads of at most `max_package_bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the address cannot be bound.
    pub async fn bind(addr: &str, max_connections: usize, max_package_bytes: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            codec: FrameCodec::new(max_package_bytes),
            connections: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Io`] if the socket's address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` is cancelled.
    ///
    /// Once `max_connections` are open, accepting pauses until one closes.
    /// Accept failures are logged and the loop continues.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the connection limiter is closed.
    pub async fn run(self, dispatcher: DispatchHandle, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            "Listening on {} (max {} connections)",
            self.local_addr()?,
            self.max_connections
        );

        let mut next_connection = 0_u64;
        loop {
            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = Arc::clone(&self.connections).acquire_owned() => {
                    permit.map_err(|e| Error::ChannelError {
                        context: format!("Connection limiter closed: {e}"),
                    })?
                }
            };

            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {e}");
                        continue;
                    }
                },
            };

            let id = ConnectionId::new(next_connection);
            next_connection += 1;
            tracing::debug!("{id}: accepted from {peer}");

            let codec = self.codec;
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                match serve_connection(id, stream, peer, codec, dispatcher, shutdown, permit).await {
                    Ok(()) => tracing::debug!("{id}: closed"),
                    Err(e) => tracing::warn!("{id}: closed with error: {e}"),
                }
            });
        }

        tracing::info!("Listener stopped");
        Ok(())
    }
}
