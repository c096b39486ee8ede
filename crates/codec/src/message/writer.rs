//! Bounded SIP message building.
//!
//! Outgoing datagrams are formatted into a fixed 2 KiB text buffer that is
//! reused across sends. Running out of space marks the buffer as overflowed
//! instead of panicking; an overflowed message must never reach the wire,
//! so reading one back trips a debug assertion.

use std::fmt::{self, Write};

use super::Packet;

pub const TX_BUFFER_SIZE: usize = 2048;

/// Fixed-capacity text builder for one outgoing datagram.
pub struct TxBuffer {
    buffer: [u8; TX_BUFFER_SIZE],
    length: usize,
    overflowed: bool,
}

impl Default for TxBuffer {
    fn default() -> Self {
        Self {
            buffer: [0; TX_BUFFER_SIZE],
            length: 0,
            overflowed: false,
        }
    }
}

impl TxBuffer {
    pub fn clear(&mut self) {
        self.length = 0;
        self.overflowed = false;
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn as_bytes(&self) -> &[u8] {
        debug_assert!(!self.overflowed, "outgoing message truncated");
        &self.buffer[..self.length]
    }

    /// The formatted text. Everything written here is US-ASCII.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }
}

impl fmt::Write for TxBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let available = TX_BUFFER_SIZE - self.length;
        let take = s.len().min(available);

        if take < s.len() {
            self.overflowed = true;
        }

        self.buffer[self.length..self.length + take].copy_from_slice(&s.as_bytes()[..take]);
        self.length += take;

        Ok(())
    }
}

/// Composes one request or reply into a [`TxBuffer`].
///
/// The start line is written on construction, headers one call at a time in
/// emission order, and [`MessageWriter::finish`] closes the message with its
/// `Content-Length`.
///
/// # Test
///
/// ```
/// use sip_agent_codec::message::writer::{MessageWriter, TxBuffer};
///
/// let mut buffer = TxBuffer::default();
/// let mut writer = MessageWriter::request(&mut buffer, "BYE", "sip:**613@192.168.179.1");
/// writer.header("CSeq", format_args!("23 BYE"));
///
/// let expected = b"BYE sip:**613@192.168.179.1 SIP/2.0\r\n\
///                  CSeq: 23 BYE\r\n\
///                  Content-Length: 0\r\n\
///                  \r\n";
///
/// assert_eq!(writer.finish(), &expected[..]);
/// ```
pub struct MessageWriter<'a> {
    buffer: &'a mut TxBuffer,
}

impl<'a> MessageWriter<'a> {
    pub fn request(buffer: &'a mut TxBuffer, method: &str, uri: &str) -> Self {
        buffer.clear();
        let _ = write!(buffer, "{method} {uri} SIP/2.0\r\n");
        Self { buffer }
    }

    pub fn reply(buffer: &'a mut TxBuffer, code: &str) -> Self {
        buffer.clear();
        let _ = write!(buffer, "SIP/2.0 {code}\r\n");
        Self { buffer }
    }

    /// Start a reply that echoes the identity of the request it answers:
    /// `To`, `From`, every `Record-Route` and `Via` in arrival order, `CSeq`
    /// and `Call-ID`.
    pub fn reply_to(buffer: &'a mut TxBuffer, code: &str, packet: &Packet<'_>) -> Self {
        let mut writer = Self::reply(buffer, code);

        if let Some(to) = packet.to {
            writer.header("To", format_args!("{to}"));
        }
        if let Some(from) = packet.from {
            writer.header("From", format_args!("{from}"));
        }
        for route in packet.record_route.iter() {
            writer.header("Record-Route", format_args!("{route}"));
        }
        for via in packet.via.iter() {
            writer.header("Via", format_args!("{via}"));
        }
        if let Some(cseq) = packet.cseq {
            writer.header("CSeq", format_args!("{cseq}"));
        }
        if let Some(call_id) = packet.call_id {
            writer.header("Call-ID", format_args!("{call_id}"));
        }
        writer.header("Max-Forwards", format_args!("70"));

        writer
    }

    pub fn header(&mut self, name: &str, value: fmt::Arguments<'_>) -> &mut Self {
        let _ = write!(self.buffer, "{name}: {value}\r\n");
        self
    }

    /// Close a bodyless message.
    pub fn finish(self) -> &'a [u8] {
        let _ = write!(self.buffer, "Content-Length: 0\r\n\r\n");
        self.buffer.as_bytes()
    }

    /// Close the message with a body. `Content-Type` must already have been
    /// written by the caller.
    pub fn finish_with_body(self, body: &str) -> &'a [u8] {
        let _ = write!(self.buffer, "Content-Length: {}\r\n\r\n{body}", body.len());
        self.buffer.as_bytes()
    }
}
