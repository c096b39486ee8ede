//! ## SIP wire formats
//!
//! [RFC3261]: https://tools.ietf.org/html/rfc3261
//! [RFC3550]: https://tools.ietf.org/html/rfc3550
//! [RFC2617]: https://tools.ietf.org/html/rfc2617
//!
//! This crate carries everything that touches bytes on the wire and nothing
//! that touches sockets: the line-oriented SIP message parser and the bounded
//! message writer (a permissive subset of [RFC3261]), the MD5 digest
//! computation of [RFC2617], the RTP fixed header of [RFC3550] together with
//! the egress sequencing rules of this agent, the G.711 companding functions
//! and the SDP offer used in outgoing INVITEs.
//!
//! All parsing borrows from the received datagram; a [`message::Packet`] is
//! only valid for the lifetime of the buffer it was decoded from.

pub mod auth;
pub mod g711;
pub mod message;
pub mod rtp;
pub mod sdp;

use std::str::Utf8Error;

/// The User-Agent and SDP session name advertised on the wire.
pub const SOFTWARE: &str = "sip-client/0.0.1";

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    /// The datagram has no empty line terminating the header block.
    UnterminatedHeader,
    Utf8Error(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}
