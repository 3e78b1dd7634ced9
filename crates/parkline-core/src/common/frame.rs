//! Length-prefixed package framing.
//!
//! Every package on the wire, in either direction, is an 8-byte header
//! followed by the payload:
//!
//! ```text
//! +----------------------+----------------------+------------------+
//! | package_type: i32 BE | length: u32 BE       | payload (length) |
//! +----------------------+----------------------+------------------+
//! ```
//!
//! [`FrameCodec`] decodes incrementally from a [`BytesMut`] read buffer so the
//! connection task can call it after every read.

use crate::{Error, PackageType, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size in bytes of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// A decoded package: its tag and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    package_type: PackageType,
    payload: Bytes,
}

impl Frame {
    pub const fn new(package_type: PackageType, payload: Bytes) -> Self {
        Self {
            package_type,
            payload,
        }
    }

    pub const fn package_type(&self) -> PackageType {
        self.package_type
    }

    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_parts(self) -> (PackageType, Bytes) {
        (self.package_type, self.payload)
    }
}

/// Encoder/decoder for the package framing, bounded by a maximum payload
/// size.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub const fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Attempts to split one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Partial input is left in
    /// place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPackage`] if the header announces a payload
    /// larger than `max_payload`. The buffer is then unusable and the
    /// connection should be closed.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let package_type = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

        if length > self.max_payload {
            return Err(Error::InvalidPackage {
                reason: format!(
                    "Payload of {length} bytes exceeds maximum ({})",
                    self.max_payload
                ),
            });
        }

        let total = HEADER_LEN + length;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(length).freeze();

        Ok(Some(Frame::new(PackageType::new(package_type), payload)))
    }

    /// Appends `frame` to `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPackage`] if the payload exceeds `max_payload`.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        let length = frame.payload.len();
        if length > self.max_payload {
            return Err(Error::InvalidPackage {
                reason: format!(
                    "Response of {length} bytes exceeds maximum ({})",
                    self.max_payload
                ),
            });
        }

        dst.reserve(HEADER_LEN + length);
        dst.put_i32(frame.package_type.get());
        dst.put_u32(length as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_for_complete_header() {
        let codec = FrameCodec::new(64);
        let mut buf = BytesMut::from(&[0_u8, 0, 0][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn waits_for_complete_payload() {
        let codec = FrameCodec::new(64);
        let mut buf = BytesMut::new();
        buf.put_i32(2);
        buf.put_u32(5);
        buf.extend_from_slice(b"ab");

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"cde");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.package_type(), PackageType::new(2));
        assert_eq!(frame.payload().as_ref(), b"abcde");
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let codec = FrameCodec::new(64);
        let mut buf = BytesMut::new();
        codec
            .encode(&Frame::new(PackageType::new(-1), Bytes::from_static(b"x")), &mut buf)
            .unwrap();
        codec
            .encode(&Frame::new(PackageType::new(9), Bytes::new()), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.package_type(), PackageType::new(-1));
        assert_eq!(first.payload().as_ref(), b"x");
        assert_eq!(second.package_type(), PackageType::new(9));
        assert!(second.payload().is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_payload() {
        let codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        buf.put_i32(1);
        buf.put_u32(5);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::InvalidPackage { .. }));

        let frame = Frame::new(PackageType::new(1), Bytes::from_static(b"12345"));
        assert!(codec.encode(&frame, &mut BytesMut::new()).is_err());
    }
}
