//! MD5 digest access authentication.
//!
//! [RFC2617]: https://tools.ietf.org/html/rfc2617
//!
//! Only the plain [RFC2617] MD5 scheme is computed; `qop`, `nc` and
//! `cnonce` are not supported, which matches what the registrars this agent
//! talks to actually challenge with.

use md5::{Digest, Md5};

/// Digest response over a challenge, as lowercase hex.
///
/// > HA1 = MD5(user ":" realm ":" password)
/// > HA2 = MD5(method ":" uri)
/// > response = MD5(HA1 ":" nonce ":" HA2)
///
/// # Test
///
/// ```
/// use sip_agent_codec::auth::digest_response;
///
/// let response = digest_response(
///     "620",
///     "secret",
///     "asterisk",
///     "abc",
///     "REGISTER",
///     "sip:192.168.179.1",
/// );
///
/// assert_eq!(response, "89469c16556e1e10258f6c99f0dff29b");
/// ```
pub fn digest_response(
    user: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = md5_hex(&[user, realm, password].join(":"));
    let ha2 = md5_hex(&[method, uri].join(":"));
    md5_hex(&[ha1.as_str(), nonce, ha2.as_str()].join(":"))
}

fn md5_hex(input: &str) -> String {
    const HEXITS: &[u8; 16] = b"0123456789abcdef";

    let mut hasher = Md5::new();
    hasher.update(input);

    let mut out = String::with_capacity(32);
    for byte in hasher.finalize() {
        out.push(HEXITS[usize::from(byte >> 4)] as char);
        out.push(HEXITS[usize::from(byte & 0x0f)] as char);
    }

    out
}
