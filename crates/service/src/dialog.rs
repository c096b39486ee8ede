//! Dialog and digest state owned by the signaling machine.

use codec::message::Packet;

/// The peer half of the current dialog. Only the signaling machine mutates
/// this; it is refreshed from every parsed reply.
#[derive(Debug, Default, Clone)]
pub struct Dialog {
    /// Current request URI.
    pub uri: String,
    /// URI placed in `To` headers of outgoing requests.
    pub to_uri: String,
    /// Peer contact learned from replies; ACKs for answered calls go here.
    pub to_contact: String,
    /// Remote tag captured from the reply that established the dialog.
    pub to_tag: String,
    /// `Record-Route` set of the dialog, in arrival order. Echoed back as
    /// `Route` headers, reversed, on ACK.
    pub record_route: Vec<String>,
}

impl Dialog {
    /// Refresh the peer state from a parsed reply.
    pub fn absorb(&mut self, packet: &Packet<'_>) {
        if let Some(contact) = packet.contact {
            self.to_contact = contact.to_string();
        }

        if let Some(tag) = packet.to_tag {
            self.to_tag = tag.to_string();
        }

        self.record_route.clear();
        for route in packet.record_route.iter() {
            self.record_route.push(route.to_string());
        }
    }
}

/// Digest challenge state. Populated from 401/407 replies, cleared once a
/// REGISTER succeeds.
#[derive(Debug, Default, Clone)]
pub struct DigestState {
    pub realm: String,
    pub nonce: String,
    /// Computed response, lowercase hex; empty while unauthenticated.
    pub response: String,
    /// The latched challenge was a 407, so credentials go out as
    /// `Proxy-Authorization`.
    pub proxy: bool,
}

impl DigestState {
    pub fn clear(&mut self) {
        self.realm.clear();
        self.nonce.clear();
        self.response.clear();
        self.proxy = false;
    }

    pub fn has_response(&self) -> bool {
        !self.response.is_empty()
    }
}
