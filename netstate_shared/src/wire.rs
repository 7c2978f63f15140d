//! Binary wire codec for the gameplay plane.
//!
//! All values are little-endian. Decoding reads from a `&[u8]` cursor and
//! checks the remaining length before every field, so a truncated datagram
//! yields an error instead of a partially filled value.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::math::{Quat, Vec3};

/// Codec failures. Any of these fails the connection of the sending peer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WireError {
    #[error("truncated {what}: needed {needed} bytes, {remaining} left")]
    Truncated {
        what: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("unknown packet tag {0:#04x}")]
    UnknownTag(u8),
    #[error("invalid flag bits {0:#04x}")]
    InvalidFlags(u8),
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),
    #[error("batch of {0} entries exceeds the wire limit")]
    BatchTooLarge(usize),
    #[error("diff base time {expected} does not match snapshot time {actual}")]
    BaseMismatch { expected: f64, actual: f64 },
    #[error("diff checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// A value with a fixed binary layout.
pub trait WireFormat: Sized {
    fn encode(&self, buf: &mut BytesMut);

    fn decode(buf: &mut &[u8]) -> Result<Self, WireError>;

    /// Encodes into a fresh buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a complete value; leftover bytes are an error.
    fn from_bytes(mut bytes: &[u8]) -> Result<Self, WireError> {
        let value = Self::decode(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(WireError::TrailingBytes(bytes.len()));
        }
        Ok(value)
    }
}

pub(crate) fn need(buf: &[u8], n: usize, what: &'static str) -> Result<(), WireError> {
    if buf.remaining() < n {
        return Err(WireError::Truncated {
            what,
            needed: n,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn read_u8(buf: &mut &[u8], what: &'static str) -> Result<u8, WireError> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub(crate) fn read_u32(buf: &mut &[u8], what: &'static str) -> Result<u32, WireError> {
    need(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn read_f32(buf: &mut &[u8], what: &'static str) -> Result<f32, WireError> {
    need(buf, 4, what)?;
    Ok(buf.get_f32_le())
}

pub(crate) fn read_f64(buf: &mut &[u8], what: &'static str) -> Result<f64, WireError> {
    need(buf, 8, what)?;
    Ok(buf.get_f64_le())
}

pub(crate) fn read_vec3(buf: &mut &[u8], what: &'static str) -> Result<Vec3, WireError> {
    need(buf, 12, what)?;
    Ok(Vec3::new(buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le()))
}

pub(crate) fn read_quat(buf: &mut &[u8], what: &'static str) -> Result<Quat, WireError> {
    need(buf, 16, what)?;
    Ok(Quat::from_xyzw(
        buf.get_f32_le(),
        buf.get_f32_le(),
        buf.get_f32_le(),
        buf.get_f32_le(),
    ))
}

pub(crate) fn put_vec3(buf: &mut BytesMut, v: Vec3) {
    buf.put_f32_le(v.x);
    buf.put_f32_le(v.y);
    buf.put_f32_le(v.z);
}

pub(crate) fn put_quat(buf: &mut BytesMut, q: Quat) {
    buf.put_f32_le(q.x);
    buf.put_f32_le(q.y);
    buf.put_f32_le(q.z);
    buf.put_f32_le(q.w);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_read_reports_sizes() {
        let mut cursor: &[u8] = &[1, 2];
        let err = read_u32(&mut cursor, "tick").unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                what: "tick",
                needed: 4,
                remaining: 2
            }
        );
    }

    #[test]
    fn vec3_layout_is_three_le_floats() {
        let mut buf = BytesMut::new();
        put_vec3(&mut buf, Vec3::new(1.0, -2.0, 0.5));
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[0..4], &1.0f32.to_le_bytes());
        let mut cursor: &[u8] = &buf;
        assert_eq!(
            read_vec3(&mut cursor, "v").unwrap(),
            Vec3::new(1.0, -2.0, 0.5)
        );
        assert!(cursor.is_empty());
    }
}
