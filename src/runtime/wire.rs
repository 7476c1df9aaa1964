//! Wire format for length-prefixed packets.
//!
//! Every packet starts with a fixed 8-byte header in network byte order:
//!
//! ```text
//! +----------------+----------------+--------------------------------+
//! | total_len: u16 | code: u16      | checksum: i32                  |
//! +----------------+----------------+--------------------------------+
//! | body: total_len - 8 bytes                                        |
//! +------------------------------------------------------------------+
//! ```
//!
//! The checksum covers the body only. A header-only packet carries 0.
//!
//! Inside the process a packet travels as a [`Message`]: the wire bytes plus
//! the [`ConnRef`] of the connection it belongs to. The reference is never
//! written to a socket; it only lets consumers tell whether the connection
//! that produced or will receive the message is still the same peer.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::runtime::connection::ConnRef;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 8;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Standard CRC-32 (PKZip/Ethernet polynomial) over `bytes`.
pub fn checksum(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Header plus body length.
    pub total_len: u16,
    /// Message code used to pick a handler.
    pub code: u16,
    /// CRC-32 of the body, 0 for header-only packets.
    pub checksum: u32,
}

impl PacketHeader {
    /// Decode a header from exactly [`HEADER_SIZE`] bytes.
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        Self {
            total_len: u16::from_be_bytes([raw[0], raw[1]]),
            code: u16::from_be_bytes([raw[2], raw[3]]),
            checksum: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }

    /// Encode into the first [`HEADER_SIZE`] bytes of `out`.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u16(self.total_len);
        out.put_u16(self.code);
        out.put_u32(self.checksum);
    }

    /// Body length implied by `total_len`.
    pub fn body_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(HEADER_SIZE)
    }
}

/// A framed packet owned by exactly one pipeline stage at a time.
///
/// Produced by the framer (inbound) or a handler (outbound), moved into a
/// queue, and dropped by whichever stage consumes it. Dropping is the only
/// way its buffer is released.
#[derive(Debug)]
pub struct Message {
    origin: ConnRef,
    header: PacketHeader,
    /// Header and body exactly as they appear on the wire.
    frame: BytesMut,
}

impl Message {
    /// Build an outbound packet with a computed checksum.
    pub fn new(origin: ConnRef, code: u16, body: &[u8]) -> Self {
        let total = HEADER_SIZE + body.len();
        debug_assert!(total <= u16::MAX as usize, "packet too large");

        let header = PacketHeader {
            total_len: total as u16,
            code,
            checksum: if body.is_empty() { 0 } else { checksum(body) },
        };

        let mut frame = BytesMut::with_capacity(total);
        header.encode(&mut frame);
        frame.extend_from_slice(body);

        Self {
            origin,
            header,
            frame,
        }
    }

    /// Header-only reply carrying just a code.
    pub fn empty(origin: ConnRef, code: u16) -> Self {
        Self::new(origin, code, &[])
    }

    /// Start an inbound packet from a validated header. The body region is
    /// zero-filled and gets written in place through [`Message::body_mut`].
    pub(crate) fn with_header(origin: ConnRef, raw: &[u8; HEADER_SIZE]) -> Self {
        let header = PacketHeader::decode(raw);
        let mut frame = BytesMut::with_capacity(header.total_len as usize);
        frame.extend_from_slice(raw);
        frame.resize(header.total_len as usize, 0);

        Self {
            origin,
            header,
            frame,
        }
    }

    pub fn origin(&self) -> ConnRef {
        self.origin
    }

    #[cfg(test)]
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn code(&self) -> u16 {
        self.header.code
    }

    pub fn body(&self) -> &[u8] {
        &self.frame[HEADER_SIZE..]
    }

    pub(crate) fn body_mut(&mut self) -> &mut [u8] {
        &mut self.frame[HEADER_SIZE..]
    }

    /// Bytes to put on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    /// Whether the header checksum agrees with the body.
    pub fn checksum_ok(&self) -> bool {
        let body = self.body();
        if body.is_empty() {
            self.header.checksum == 0
        } else {
            checksum(body) == self.header.checksum
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> ConnRef {
        ConnRef::new(3, 7)
    }

    #[test]
    fn test_checksum_known_value() {
        // Standard CRC-32 check value
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn test_header_layout() {
        let msg = Message::new(origin(), 5, b"abc");
        let bytes = msg.as_bytes();

        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(&bytes[0..2], &[0, 11]);
        assert_eq!(&bytes[2..4], &[0, 5]);
        assert_eq!(&bytes[4..8], &checksum(b"abc").to_be_bytes());
        assert_eq!(&bytes[8..], b"abc");
        assert_eq!(msg.origin(), origin());
    }

    #[test]
    fn test_header_only_has_zero_checksum() {
        let msg = Message::empty(origin(), 0);
        assert_eq!(msg.as_bytes(), &[0, 8, 0, 0, 0, 0, 0, 0]);
        assert!(msg.body().is_empty());
        assert!(msg.checksum_ok());
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut raw = [0u8; HEADER_SIZE];
        raw[1] = 12;
        raw[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());

        let mut msg = Message::with_header(origin(), &raw);
        msg.body_mut().copy_from_slice(b"ping");
        assert!(!msg.checksum_ok());

        // header-only packets must carry zero
        let mut raw = [0u8; HEADER_SIZE];
        raw[1] = 8;
        raw[7] = 1;
        assert!(!Message::with_header(origin(), &raw).checksum_ok());
    }

    #[test]
    fn test_decode_matches_encode() {
        let header = PacketHeader {
            total_len: 108,
            code: 6,
            checksum: 0x0102_0304,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let raw: [u8; HEADER_SIZE] = buf[..].try_into().unwrap();
        assert_eq!(PacketHeader::decode(&raw), header);
        assert_eq!(header.body_len(), 100);
    }
}
