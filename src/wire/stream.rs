//! Wire Stream Codec
//!
//! Fixed-width little-endian reader/writer used by every packet payload.
//! Strings are u16-length-prefixed UTF-8, opaque blobs are u32-length-prefixed.
//! Entity fields are additionally tagged with a [`ReplicationContext`] so a
//! single serialize/deserialize pair can decide, per call, which subset of
//! fields travels for a given direction and ownership.

use thiserror::Error;

/// Direction + locality tag for a single entity serialize/deserialize pass.
///
/// `Local` variants mean the side that owns the entity (write authority);
/// `ToNewClient` is the full-snapshot context used for a peer's initial
/// backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationContext {
    /// Frontend writing an entity it does not own up to the backend.
    ToServer,
    /// Frontend writing an entity it owns up to the backend.
    ToServerLocal,
    /// Backend writing to a frontend that does not own the entity.
    ToClient,
    /// Backend writing to the frontend that owns the entity.
    ToClientLocal,
    /// Backend writing the full snapshot for a freshly-authenticated peer.
    ToNewClient,
    /// Frontend reading a server-driven update.
    FromServer,
    /// Frontend reading a correction for an entity it owns locally.
    FromServerLocal,
    /// Backend reading an update from a peer without authority.
    FromClient,
    /// Backend reading an update from the owning peer.
    FromClientLocal,
}

impl ReplicationContext {
    /// True for the full-snapshot context sent to a newly-joined peer.
    pub fn is_initial(self) -> bool {
        self == ReplicationContext::ToNewClient
    }

    /// True when the side on the other end of this pass owns the entity.
    pub fn is_local(self) -> bool {
        matches!(
            self,
            ReplicationContext::ToServerLocal
                | ReplicationContext::ToClientLocal
                | ReplicationContext::FromServerLocal
                | ReplicationContext::FromClientLocal
        )
    }

    /// True when data flows toward the backend.
    pub fn server_bound(self) -> bool {
        matches!(
            self,
            ReplicationContext::ToServer
                | ReplicationContext::ToServerLocal
                | ReplicationContext::FromClient
                | ReplicationContext::FromClientLocal
        )
    }

    /// True when data flows toward a frontend.
    pub fn client_bound(self) -> bool {
        !self.server_bound()
    }
}

/// Wire decode errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Ran out of payload bytes mid-field.
    #[error("unexpected end of packet: needed {needed} bytes, {remaining} left")]
    UnexpectedEof {
        /// Bytes the field required.
        needed: usize,
        /// Bytes left in the payload.
        remaining: usize,
    },

    /// String field was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// Enum discriminant outside the known range.
    #[error("bad discriminant: {value}")]
    BadDiscriminant {
        /// The offending byte.
        value: u8,
    },
}

/// Growable little-endian packet writer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer, yielding the packet bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Borrow the bytes written so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Write a single byte.
    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write a bool as one byte.
    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    /// Write a u16 (little-endian).
    #[inline]
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u32 (little-endian).
    #[inline]
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u64 (little-endian).
    #[inline]
    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write an i32 (little-endian).
    #[inline]
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write an i64 (little-endian).
    #[inline]
    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write an f32 (little-endian bits).
    #[inline]
    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write an f64 (little-endian bits).
    #[inline]
    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u16-length-prefixed UTF-8 string.
    ///
    /// Strings longer than 64 KiB are truncated at a char boundary; nothing
    /// on this protocol legitimately approaches that.
    pub fn write_string(&mut self, value: &str) {
        let mut end = value.len().min(u16::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        let bytes = &value.as_bytes()[..end];
        self.write_u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
    }

    /// Write a u32-length-prefixed opaque blob.
    pub fn write_blob(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }
}

/// Borrowing little-endian packet reader.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Wrap a received payload.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Read a bool from one byte (nonzero = true).
    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a u16 (little-endian).
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a u32 (little-endian).
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a u64 (little-endian).
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// Read an i32 (little-endian).
    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read an i64 (little-endian).
    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_le_bytes(arr))
    }

    /// Read an f32 (little-endian bits).
    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read an f64 (little-endian bits).
    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_le_bytes(arr))
    }

    /// Read a u16-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    /// Read a u32-length-prefixed opaque blob.
    pub fn read_blob(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

/// A signed payload envelope: the bytes plus a detached base64 signature and
/// the base64 public key that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    /// The signed bytes.
    pub payload: Vec<u8>,
    /// Base64 detached signature over `payload`.
    pub signature: String,
    /// Base64 public key.
    pub public_key: String,
}

impl SignedMessage {
    /// Append the envelope to a packet.
    pub fn write(&self, w: &mut WireWriter) {
        w.write_blob(&self.payload);
        w.write_string(&self.signature);
        w.write_string(&self.public_key);
    }

    /// Decode an envelope from a packet.
    pub fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            payload: r.read_blob()?,
            signature: r.read_string()?,
            public_key: r.read_string()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn scalar_roundtrip() {
        let mut w = WireWriter::new();
        w.write_u8(0xAB);
        w.write_bool(true);
        w.write_u16(0xBEEF);
        w.write_u32(0xDEAD_BEEF);
        w.write_u64(u64::MAX - 1);
        w.write_i32(-42);
        w.write_i64(i64::MIN + 7);
        w.write_f32(1.5);
        w.write_f64(-2.25);

        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u16().unwrap(), 0xBEEF);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.read_i32().unwrap(), -42);
        assert_eq!(r.read_i64().unwrap(), i64::MIN + 7);
        assert_eq!(r.read_f32().unwrap(), 1.5);
        assert_eq!(r.read_f64().unwrap(), -2.25);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn string_roundtrip() {
        let mut w = WireWriter::new();
        w.write_string("emberlink");
        w.write_string("");
        w.write_string("ünïcøde");

        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "emberlink");
        assert_eq!(r.read_string().unwrap(), "");
        assert_eq!(r.read_string().unwrap(), "ünïcøde");
    }

    #[test]
    fn truncated_payload_is_eof_not_panic() {
        let mut w = WireWriter::new();
        w.write_u32(12345);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes[..2]);
        assert!(matches!(r.read_u32(), Err(WireError::UnexpectedEof { .. })));
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut w = WireWriter::new();
        w.write_u16(2);
        w.write_u8(0xFF);
        w.write_u8(0xFE);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert!(matches!(r.read_string(), Err(WireError::InvalidUtf8)));
    }

    #[test]
    fn signed_message_roundtrip() {
        let msg = SignedMessage {
            payload: vec![1, 2, 3, 4],
            signature: "c2lnbmF0dXJl".into(),
            public_key: "cHVibGlja2V5".into(),
        };

        let mut w = WireWriter::new();
        msg.write(&mut w);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        let decoded = SignedMessage::read(&mut r).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn context_predicates() {
        assert!(ReplicationContext::ToNewClient.is_initial());
        assert!(!ReplicationContext::ToClient.is_initial());
        assert!(ReplicationContext::ToServerLocal.is_local());
        assert!(ReplicationContext::FromClientLocal.server_bound());
        assert!(ReplicationContext::ToNewClient.client_bound());
    }

    proptest! {
        #[test]
        fn blob_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut w = WireWriter::new();
            w.write_blob(&data);
            let bytes = w.into_bytes();
            let mut r = WireReader::new(&bytes);
            prop_assert_eq!(r.read_blob().unwrap(), data);
        }

        #[test]
        fn mixed_string_scalar_roundtrip(s in ".{0,64}", v in any::<u32>()) {
            let mut w = WireWriter::new();
            w.write_string(&s);
            w.write_u32(v);
            let bytes = w.into_bytes();
            let mut r = WireReader::new(&bytes);
            prop_assert_eq!(r.read_string().unwrap(), s);
            prop_assert_eq!(r.read_u32().unwrap(), v);
        }
    }
}
