//! RTP fixed header framing.
//!
//! [RFC3550]: https://tools.ietf.org/html/rfc3550
//!
//! Only the 12-byte fixed header of [RFC3550] is supported; CSRC lists and
//! header extensions are never emitted and not interpreted on ingress. One
//! packet carries exactly one 20 ms frame of 8 kHz G.711, 160 payload
//! octets.

use bytes::{BufMut, BytesMut};

use crate::Error;

/// Samples per 20 ms frame at 8 kHz.
pub const FRAME_SAMPLES: usize = 160;

/// Fixed header length, no CSRC and no extension.
pub const HEADER_LEN: usize = 12;

/// Version 2, no padding, no extension, no CSRC.
const VERSION_BYTE: u8 = 0x80;

/// Static payload types of the audio profile this agent speaks.
pub const PT_PCMU: u8 = 0;
pub const PT_PCMA: u8 = 8;
pub const PT_TELEPHONE_EVENT: u8 = 101;

/// Outgoing sequence numbers live in `256..=65535`; the low block is never
/// emitted.
const SEQUENCE_FLOOR: u16 = 256;

/// Timestamp value the counter restarts from when it would pass `u32::MAX`.
/// A strictly standard stream would wrap to 0 instead.
const TIMESTAMP_RESTART: u32 = 65536;

pub fn is_audio(payload_type: u8) -> bool {
    payload_type == PT_PCMU || payload_type == PT_PCMA
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl Header {
    /// Append the 12 header bytes to `bytes`.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use sip_agent_codec::rtp::Header;
    ///
    /// let header = Header {
    ///     payload_type: 8,
    ///     sequence: 0x0102,
    ///     timestamp: 0x0a0b0c0d,
    ///     ssrc: 0x11223344,
    /// };
    ///
    /// let mut bytes = BytesMut::new();
    /// header.encode(&mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     &[
    ///         0x80, 0x08, 0x01, 0x02, 0x0a, 0x0b, 0x0c, 0x0d, 0x11, 0x22,
    ///         0x33, 0x44,
    ///     ]
    /// );
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u8(VERSION_BYTE);
        bytes.put_u8(self.payload_type & 0x7f);
        bytes.put_u16(self.sequence);
        bytes.put_u32(self.timestamp);
        bytes.put_u32(self.ssrc);
    }

    /// Split a datagram into its header and payload.
    ///
    /// # Test
    ///
    /// ```
    /// use sip_agent_codec::rtp::Header;
    ///
    /// let datagram = [
    ///     0x80u8, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0xa0, 0xde, 0xad,
    ///     0xbe, 0xef, 0x55, 0x55,
    /// ];
    ///
    /// let (header, payload) = Header::decode(&datagram).unwrap();
    ///
    /// assert_eq!(header.payload_type, 0);
    /// assert_eq!(header.sequence, 256);
    /// assert_eq!(header.timestamp, 160);
    /// assert_eq!(header.ssrc, 0xdeadbeef);
    /// assert_eq!(payload, &[0x55, 0x55]);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<(Header, &[u8]), Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidInput);
        }

        Ok((
            Header {
                payload_type: bytes[1] & 0x7f,
                sequence: u16::from_be_bytes([bytes[2], bytes[3]]),
                timestamp: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
                ssrc: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            },
            &bytes[HEADER_LEN..],
        ))
    }
}

/// Egress sequencing state for one call.
///
/// Sequence and timestamp counters are owned here rather than in process
/// globals; the audio pump creates one session when a call starts and drops
/// it when the call ends.
pub struct Session {
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
}

impl Session {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            payload_type,
            sequence: SEQUENCE_FLOOR,
            timestamp: 0,
            ssrc,
        }
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Header for the next outgoing frame.
    ///
    /// The sequence increments by one per frame and wraps from 65535 back to
    /// 256; the timestamp advances by one frame of samples and restarts from
    /// 65536 when it would pass `u32::MAX`.
    pub fn next_header(&mut self) -> Header {
        let header = Header {
            payload_type: self.payload_type,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };

        self.sequence = if self.sequence == u16::MAX {
            SEQUENCE_FLOOR
        } else {
            self.sequence + 1
        };

        self.timestamp = if u64::from(self.timestamp) + (FRAME_SAMPLES as u64) < u64::from(u32::MAX)
        {
            self.timestamp + FRAME_SAMPLES as u32
        } else {
            TIMESTAMP_RESTART
        };

        header
    }
}
