//! ## SIP signaling service
//!
//! [RFC3261]: https://tools.ietf.org/html/rfc3261
//!
//! Protocol state without I/O: the registration and call state machine, the
//! dialog identity it maintains, and the jitter buffer of the audio path.
//! The machine consumes parsed datagrams, commands and timer expiries, and
//! produces outgoing datagrams, timer updates and events through the
//! [`Driver`] and [`SignalingHandler`] seams; the reactor that owns the
//! sockets implements those seams.
//!
//! Everything here is single-threaded: one [`Signaling`] instance is driven
//! from one task, events are processed in arrival order, and every datagram
//! a transition produces is handed to the driver before the transition
//! returns.

pub mod dialog;
pub mod jitter;

mod machine;

pub use machine::{Signaling, SignalingOptions};

use std::time::Duration;

/// Why an outgoing call ended without being answered. A plain cancellation
/// initiated on this side carries no reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    TargetBusy,
    CallDeclined,
}

/// Events published on the outgoing bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipEvent {
    CallStart,
    CallEnd,
    CallCancelled { reason: Option<CancelReason> },
    ButtonPress { signal: char, duration_ms: u16 },
}

/// Consumer of the outgoing event bus.
///
/// Called synchronously from within transitions; implementations must only
/// enqueue and return.
pub trait SignalingHandler: Send + Sync {
    fn on_event(&self, event: SipEvent);
}

/// The timers the machine arms. Rearming a timer replaces its deadline,
/// never stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// No reply to a REGISTER within 5 s; retransmit.
    ReplyTimeout,
    /// Half the granted registration expiry has elapsed.
    Reregister,
    /// Cooldown after a 500 reply before registration restarts.
    Recovery,
}

/// Transport and timer operations a transition needs.
///
/// `transmit` must put the datagram on the wire (or fail and log) before
/// returning; the machine reuses its send buffer for the next message as
/// soon as the call returns. Send failures are absorbed here and never
/// influence protocol state.
pub trait Driver {
    fn transmit(&mut self, datagram: &[u8]);
    fn arm(&mut self, timer: Timer, after: Duration);
    fn disarm(&mut self, timer: Timer);
}

/// Commands posted onto the reactor from outside.
#[derive(Debug, Clone)]
pub enum Command {
    /// Begin (or restart) registration.
    Start,
    /// Place a call to a locally registered number; `caller_display` is what
    /// the called phone shows.
    Ring {
        local_number: String,
        caller_display: String,
    },
    /// Abandon the pending outgoing call.
    Cancel,
    SetServerIp(String),
    SetMyIp(String),
    SetCredentials { user: String, password: String },
}
