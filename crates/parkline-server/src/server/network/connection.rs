use crate::server::service::handler::DispatchHandle;
use bytes::BytesMut;
use parkline_core::{ConnectionHandle, ConnectionId, Frame, FrameCodec, Result};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{OwnedSemaphorePermit, mpsc},
};
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 4096;

/// Serves one accepted connection until the peer disconnects, a malformed
/// frame arrives, or `shutdown` is cancelled.
///
/// Every complete frame is handed to the dispatcher as-is. Responses produced
/// by workers are written back by a separate writer task that outlives the
/// reader until all outstanding items for this connection have finished. The
/// connection slot `_permit` is held for the reader's lifetime.
pub async fn serve_connection(
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    codec: FrameCodec,
    dispatcher: DispatchHandle,
    shutdown: CancellationToken,
    _permit: OwnedSemaphorePermit,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let connection = ConnectionHandle::new(id, peer, tx);

    tokio::spawn(async move {
        let mut out = BytesMut::with_capacity(READ_BUFFER_SIZE);
        while let Some(frame) = rx.recv().await {
            out.clear();
            if let Err(e) = codec.encode(&frame, &mut out) {
                tracing::warn!("{id}: dropping response: {e}");
                continue;
            }
            if let Err(e) = writer.write_all(&out).await {
                tracing::debug!("{id}: write failed, closing writer: {e}");
                break;
            }
        }
        tracing::trace!("{id}: writer closed");
    });

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        while let Some(frame) = codec.decode(&mut buf)? {
            let (package_type, payload) = frame.into_parts();
            dispatcher.dispatch(connection.clone(), package_type, payload);
        }

        tokio::select! {
            () = shutdown.cancelled() => {
                tracing::debug!("{id}: closing for shutdown");
                break;
            }
            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    if !buf.is_empty() {
                        tracing::debug!("{id}: peer closed with {} bytes of partial frame", buf.len());
                    }
                    break;
                }
            }
        }
    }

    Ok(())
}
