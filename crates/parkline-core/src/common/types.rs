//! # Message Types
//!
//! The types in this module travel between the three execution contexts of
//! the service: the connection layer, the dispatcher loop, and each worker.
//! They are passed by message and never shared mutably.
//!
//! - [`WorkerId`] - Identity of a worker for its whole lifetime
//! - [`ConnectionId`] / [`ConnectionHandle`] - Back-reference to the
//!   originating connection, used to route a response
//! - [`PackageType`] - The package tag carried in every frame header
//! - [`WorkItem`] - One immutable unit of work

use crate::{Error, Frame, Result};
use bytes::Bytes;
use core::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Opaque worker identity.
///
/// Ids are assigned in creation order and never reused, so ordering by id is
/// ordering by age. The dispatcher relies on this for its tie-break.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Identity of an accepted connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Package tag from the frame header. Its meaning belongs to the processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PackageType(i32);

impl PackageType {
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Back-reference to the connection a package arrived on.
///
/// Cloning is cheap. Responses are queued to the connection's writer task;
/// once the connection is gone, [`ConnectionHandle::respond`] fails with
/// [`Error::ChannelError`].
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    responder: mpsc::UnboundedSender<Frame>,
}

impl ConnectionHandle {
    pub const fn new(
        id: ConnectionId,
        peer: SocketAddr,
        responder: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            id,
            peer,
            responder,
        }
    }

    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns `true` once the connection's writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.responder.is_closed()
    }

    /// Queues a response frame back to the originating connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the connection has been closed.
    pub fn respond(&self, package_type: PackageType, payload: Bytes) -> Result<()> {
        self.responder
            .send(Frame::new(package_type, payload))
            .map_err(|_| Error::ChannelError {
                context: format!("Connection {} closed before response", self.id),
            })
    }
}

/// An immutable unit of work: payload bytes, the package tag, and the
/// connection it came from.
#[derive(Clone, Debug)]
pub struct WorkItem {
    connection: ConnectionHandle,
    package_type: PackageType,
    payload: Bytes,
}

impl WorkItem {
    pub const fn new(connection: ConnectionHandle, package_type: PackageType, payload: Bytes) -> Self {
        Self {
            connection,
            package_type,
            payload,
        }
    }

    pub const fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub const fn package_type(&self) -> PackageType {
        self.package_type
    }

    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }
}
