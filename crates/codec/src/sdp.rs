//! SDP offer building and answer inspection.
//!
//! [RFC4566]: https://tools.ietf.org/html/rfc4566
//!
//! The agent always offers the same audio session: PCMU, PCMA and
//! telephone-event on its fixed RTP port, receive-only, 20 ms packets. The
//! answer is never interpreted beyond the first audio payload type, which
//! selects the companding law for the call.

use std::fmt::Write;

use crate::message::writer::TxBuffer;

/// The session offered in every outgoing INVITE.
pub struct Offer<'a> {
    pub user: &'a str,
    pub session_id: u32,
    pub local_ip: &'a str,
    pub rtp_port: u16,
}

impl Offer<'_> {
    /// # Test
    ///
    /// ```
    /// use sip_agent_codec::message::writer::TxBuffer;
    /// use sip_agent_codec::sdp::Offer;
    ///
    /// let mut buffer = TxBuffer::default();
    /// Offer {
    ///     user: "620",
    ///     session_id: 42,
    ///     local_ip: "192.168.179.20",
    ///     rtp_port: 7078,
    /// }
    /// .render(&mut buffer);
    ///
    /// assert!(buffer.as_str().starts_with("v=0\r\n"));
    /// assert!(buffer.as_str().contains("o=620 42 42 IN IP4 192.168.179.20\r\n"));
    /// assert!(buffer.as_str().contains("m=audio 7078 RTP/AVP 0 8 101\r\n"));
    /// ```
    pub fn render(&self, buffer: &mut TxBuffer) {
        buffer.clear();

        let _ = write!(
            buffer,
            "v=0\r\n\
             o={user} {sid} {sid} IN IP4 {ip}\r\n\
             s={software}\r\n\
             c=IN IP4 {ip}\r\n\
             t=0 0\r\n\
             m=audio {port} RTP/AVP 0 8 101\r\n\
             a=recvonly\r\n\
             a=rtpmap:101 telephone-event/8000\r\n\
             a=fmtp:101 0-15\r\n\
             a=ptime:20\r\n",
            user = self.user,
            sid = self.session_id,
            ip = self.local_ip,
            software = crate::SOFTWARE,
            port = self.rtp_port,
        );
    }
}

/// First G.711 payload type listed on an `m=audio` line, if any.
///
/// # Test
///
/// ```
/// use sip_agent_codec::sdp::preferred_payload_type;
///
/// assert_eq!(preferred_payload_type("m=audio 7078 RTP/AVP 8 0 101"), Some(8));
/// assert_eq!(preferred_payload_type("m=audio 7078 RTP/AVP 101"), None);
/// assert_eq!(preferred_payload_type("m=video 9000 RTP/AVP 96"), None);
/// ```
pub fn preferred_payload_type(media_line: &str) -> Option<u8> {
    if !media_line.starts_with("m=audio ") {
        return None;
    }

    media_line
        .split_whitespace()
        .skip(3)
        .filter_map(|token| token.parse::<u8>().ok())
        .find(|&payload_type| payload_type == 0 || payload_type == 8)
}
