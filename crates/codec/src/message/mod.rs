//! SIP datagram parsing.
//!
//! [RFC3261]: https://tools.ietf.org/html/rfc3261
//!
//! One UDP datagram holds one message: CRLF separated lines, an empty line
//! terminating the header block, the rest of the datagram being the body.
//! The parser is deliberately permissive: it recognizes the handful of
//! headers the signaling machine consumes by exact prefix match, ignores
//! everything else, and does not verify `Content-Length` against the actual
//! body. Malformed datagrams are reported as errors and dropped by the
//! caller; they never abort the agent.

pub mod writer;

use num_enum::FromPrimitive;

use crate::Error;

/// `Via` and `Record-Route` are kept in arrival order, at most this many of
/// each.
pub const MAX_TRACKED_HEADERS: usize = 5;

/// Reply status codes the signaling machine distinguishes. Anything else
/// parses as [`Status::Unknown`].
#[derive(FromPrimitive, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    #[default]
    Unknown = 0,
    Trying = 100,
    SessionProgress = 183,
    Ok = 200,
    Unauthorized = 401,
    ProxyAuthenticationRequired = 407,
    BusyHere = 486,
    RequestTerminated = 487,
    ServerInternalError = 500,
    Decline = 603,
}

/// Request methods the agent reacts to; everything else is
/// [`Method::Unknown`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Notify,
    Bye,
    Info,
    Invite,
    #[default]
    Unknown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ApplicationDtmfRelay,
    #[default]
    Unknown,
}

/// DTMF INFO body, `Signal=` and `Duration=` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtmf {
    pub signal: char,
    pub duration_ms: u16,
}

/// A bounded, order-preserving list of repeated header values.
#[derive(Debug, Clone, Copy)]
pub struct HeaderList<'a> {
    items: [&'a str; MAX_TRACKED_HEADERS],
    length: usize,
}

impl Default for HeaderList<'_> {
    fn default() -> Self {
        Self {
            items: [""; MAX_TRACKED_HEADERS],
            length: 0,
        }
    }
}

impl<'a> HeaderList<'a> {
    /// Values past the capacity are silently discarded.
    pub fn push(&mut self, value: &'a str) {
        if self.length < MAX_TRACKED_HEADERS {
            self.items[self.length] = value;
            self.length += 1;
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &'a str> + '_ {
        self.items[..self.length].iter().copied()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// One parsed SIP datagram. Borrows from the receive buffer and lives only
/// across the handling of a single event.
#[derive(Debug, Default, Clone)]
pub struct Packet<'a> {
    pub status: Status,
    pub method: Method,
    pub content_type: ContentType,
    pub content_length: usize,
    pub realm: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub contact: Option<&'a str>,
    pub contact_expires: u32,
    pub to: Option<&'a str>,
    pub to_tag: Option<&'a str>,
    pub from: Option<&'a str>,
    pub cseq: Option<&'a str>,
    pub call_id: Option<&'a str>,
    pub p_called_party_id: Option<&'a str>,
    pub via: HeaderList<'a>,
    pub record_route: HeaderList<'a>,
    /// First `m=` line of an SDP body, kept opaque.
    pub media: Option<&'a str>,
    /// Address of the first `c=IN IP4` line of an SDP body.
    pub connection: Option<&'a str>,
    pub dtmf: Option<Dtmf>,
}

impl<'a> Packet<'a> {
    /// Parse one received datagram.
    ///
    /// # Test
    ///
    /// ```
    /// use sip_agent_codec::message::{Packet, Status};
    ///
    /// let datagram = b"SIP/2.0 200 OK\r\n\
    ///     Via: SIP/2.0/UDP 192.168.179.20:5060;branch=z9hG4bK-1;rport\r\n\
    ///     To: <sip:620@192.168.179.1>;tag=as1fd23a\r\n\
    ///     Contact: <sip:620@192.168.179.1:5060>;expires=300\r\n\
    ///     CSeq: 21 REGISTER\r\n\
    ///     Content-Length: 0\r\n\
    ///     \r\n";
    ///
    /// let packet = Packet::parse(datagram).unwrap();
    ///
    /// assert_eq!(packet.status, Status::Ok);
    /// assert_eq!(packet.to_tag, Some("as1fd23a"));
    /// assert_eq!(packet.contact, Some("sip:620@192.168.179.1:5060"));
    /// assert_eq!(packet.contact_expires, 300);
    /// ```
    pub fn parse(datagram: &'a [u8]) -> Result<Packet<'a>, Error> {
        let text = std::str::from_utf8(datagram)?;

        let (head, body) = text
            .split_once("\r\n\r\n")
            .ok_or(Error::UnterminatedHeader)?;

        let mut packet = Packet::default();

        for (index, line) in head.split("\r\n").enumerate() {
            let line = line.trim_end();

            if index == 0 {
                packet.parse_start_line(line);
                continue;
            }

            packet.parse_header_line(line);
        }

        if !body.is_empty() {
            packet.parse_body(body);
        }

        Ok(packet)
    }

    fn parse_start_line(&mut self, line: &'a str) {
        if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
            let code = rest
                .split_whitespace()
                .next()
                .and_then(|token| token.parse::<u16>().ok())
                .unwrap_or_default();

            self.status = Status::from(code);
        } else if line.starts_with("NOTIFY ") {
            self.method = Method::Notify;
        } else if line.starts_with("BYE ") {
            self.method = Method::Bye;
        } else if line.starts_with("INFO ") {
            self.method = Method::Info;
        } else if line.starts_with("INVITE ") {
            self.method = Method::Invite;
        }
    }

    fn parse_header_line(&mut self, line: &'a str) {
        if let Some(value) = line.strip_prefix("Via: ") {
            self.via.push(value);
        } else if let Some(value) = line.strip_prefix("Record-Route: ") {
            self.record_route.push(value);
        } else if let Some(value) = line.strip_prefix("Contact: ") {
            self.parse_contact(value);
        } else if let Some(value) = line.strip_prefix("To: ") {
            self.to = Some(value);
            if let Some(position) = value.find(">;tag=") {
                self.to_tag = Some(&value[position + 6..]);
            }
        } else if let Some(value) = line.strip_prefix("From: ") {
            self.from = Some(value);
        } else if let Some(value) = line.strip_prefix("CSeq: ") {
            self.cseq = Some(value);
        } else if let Some(value) = line.strip_prefix("Call-ID: ") {
            self.call_id = Some(value);
        } else if let Some(value) = line.strip_prefix("Content-Type: ") {
            if value.starts_with("application/dtmf-relay") {
                self.content_type = ContentType::ApplicationDtmfRelay;
            }
        } else if let Some(value) = line.strip_prefix("Content-Length: ") {
            self.content_length = value.parse().unwrap_or_default();
        } else if let Some(value) = line.strip_prefix("P-Called-Party-ID: ") {
            self.p_called_party_id = Some(value);
        } else if line.starts_with("WWW-Authenticate") || line.starts_with("Proxy-Authenticate") {
            self.realm = quoted_param(line, "realm");
            self.nonce = quoted_param(line, "nonce");
        }
    }

    /// `Contact` carries the peer URI in angle brackets, optionally followed
    /// by an `;expires=` parameter granted by the registrar.
    fn parse_contact(&mut self, value: &'a str) {
        let Some(start) = value.find('<') else {
            return;
        };
        let Some(length) = value[start + 1..].find('>') else {
            return;
        };

        self.contact = Some(&value[start + 1..start + 1 + length]);

        let tail = &value[start + 1 + length + 1..];
        if let Some(expires) = tail.strip_prefix(";expires=") {
            self.contact_expires = expires
                .split(';')
                .next()
                .and_then(|token| token.trim().parse().ok())
                .unwrap_or_default();
        }
    }

    fn parse_body(&mut self, body: &'a str) {
        let mut signal = None;
        let mut duration = 0u16;

        for line in body.lines() {
            let line = line.trim_end();

            if let Some(value) = line.strip_prefix("c=IN IP4 ") {
                if self.connection.is_none() {
                    self.connection = Some(value);
                }
            } else if line.starts_with("m=") {
                if self.media.is_none() {
                    self.media = Some(line);
                }
            } else if let Some(value) = line.strip_prefix("Signal=") {
                signal = value.chars().next();
            } else if let Some(value) = line.strip_prefix("Duration=") {
                duration = value.parse().unwrap_or_default();
            }
        }

        if self.content_type == ContentType::ApplicationDtmfRelay {
            if let Some(signal) = signal {
                self.dtmf = Some(Dtmf {
                    signal,
                    duration_ms: duration,
                });
            }
        }
    }
}

/// Extract the value of a `key="value"` parameter from a header line.
fn quoted_param<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut search = line;

    while let Some(position) = search.find(key) {
        let rest = &search[position + key.len()..];
        if let Some(rest) = rest.strip_prefix("=\"") {
            let end = rest.find('"')?;
            return Some(&rest[..end]);
        }

        search = &search[position + key.len()..];
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_param_skips_non_matches() {
        let line = "WWW-Authenticate: Digest algorithm=MD5, realm=\"asterisk\", nonce=\"n1\"";

        assert_eq!(quoted_param(line, "realm"), Some("asterisk"));
        assert_eq!(quoted_param(line, "nonce"), Some("n1"));
        assert_eq!(quoted_param(line, "opaque"), None);
    }

    #[test]
    fn unterminated_header_is_an_error() {
        assert!(Packet::parse(b"SIP/2.0 200 OK\r\nCSeq: 1 REGISTER\r\n").is_err());
    }

    #[test]
    fn non_utf8_is_an_error() {
        assert!(Packet::parse(&[0x80, 0xff, 0x00, 0x13]).is_err());
    }
}
