pub mod error;
pub mod frame;
pub mod types;

pub use error::{Error, Result};
pub use frame::{Frame, FrameCodec, HEADER_LEN};
pub use types::{ConnectionHandle, ConnectionId, PackageType, WorkItem, WorkerId};
