//! The registration and call state machine.
//!
//! States and events are closed sums; a transition is a total function from
//! `(state, event)` to the next state plus its entry actions. Events that a
//! state does not consume are ignored. Actions run before the transition
//! returns: outgoing datagrams go through [`Driver::transmit`], timers
//! through [`Driver::arm`]/[`Driver::disarm`], bus events through
//! [`SignalingHandler::on_event`].

use std::time::Duration;

use codec::{
    SOFTWARE, auth,
    message::{
        ContentType, Method, Packet, Status,
        writer::{MessageWriter, TxBuffer},
    },
    sdp,
};
use rand::Rng;

use crate::{
    CancelReason, Command, Driver, SignalingHandler, SipEvent, Timer,
    dialog::{Dialog, DigestState},
};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// Expiry requested in REGISTER and assumed when the registrar grants none.
const REGISTRATION_EXPIRES: u32 = 3600;

/// Substitute expiry when the re-register timer fires while a call keeps
/// the machine away from `Registered`.
const BUSY_REREGISTER_EXPIRES: u32 = 20;

const ALLOW_METHODS: &str =
    "INVITE, ACK, CANCEL, OPTIONS, BYE, REFER, NOTIFY, MESSAGE, SUBSCRIBE, INFO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    WaitingForAuthReply,
    Registered,
    Calling,
    Cancelling,
    CallEstablished,
}

#[derive(Debug)]
enum Event<'a> {
    Start,
    ReplyTimeout,
    Reregister,
    Ok {
        contact_expires: u32,
    },
    AuthChallenge,
    Trying,
    SessionProgress,
    RequestCancelled,
    BusyHere,
    Decline,
    ServerError,
    RxInvite,
    RxBye,
    RequestCall {
        local_number: &'a str,
        caller_display: &'a str,
    },
    InitiateCall,
    CancelCall,
}

pub struct SignalingOptions<T> {
    pub user: String,
    pub password: String,
    pub server_ip: String,
    pub my_ip: String,
    pub local_port: u16,
    pub local_rtp_port: u16,
    /// Number dialed after registration when no explicit target is given.
    pub call_target: String,
    /// Display name shown on called phones; falls back to `user` when
    /// empty. Inbound calls announcing this same name are reflections of
    /// our own ring and get declined.
    pub caller_display: String,
    pub handler: T,
}

/// One SIP user agent: at most one registration, at most one dialog.
pub struct Signaling<T> {
    state: State,
    handler: T,

    user: String,
    password: String,
    server_ip: String,
    my_ip: String,
    local_port: u16,
    local_rtp_port: u16,
    call_target: String,
    caller_display: String,

    dialog: Dialog,
    digest: DigestState,

    /// Strictly increasing for the lifetime of the registration.
    cseq: u32,
    /// Constant for the lifetime of one dialog.
    call_id: u32,
    /// Local `From` tag of the current transaction.
    tag: u32,
    /// `Via` branch of the current transaction.
    branch: u32,
    sdp_session_id: u32,

    /// First G.711 payload type the peer offered for the pending dialog.
    media_payload_type: Option<u8>,

    tx: TxBuffer,
    sdp: TxBuffer,
}

impl<T> Signaling<T>
where
    T: SignalingHandler,
{
    pub fn new(options: SignalingOptions<T>) -> Self {
        let caller_display = if options.caller_display.is_empty() {
            options.user.clone()
        } else {
            options.caller_display
        };

        Self {
            state: State::Idle,
            handler: options.handler,
            dialog: Dialog {
                uri: format!("sip:{}", options.server_ip),
                to_uri: format!("sip:{}@{}", options.user, options.server_ip),
                ..Dialog::default()
            },
            digest: DigestState::default(),
            cseq: random_id(),
            call_id: random_id(),
            tag: random_id(),
            branch: random_id(),
            sdp_session_id: 0,
            media_payload_type: None,
            tx: TxBuffer::default(),
            sdp: TxBuffer::default(),
            user: options.user,
            password: options.password,
            server_ip: options.server_ip,
            my_ip: options.my_ip,
            local_port: options.local_port,
            local_rtp_port: options.local_rtp_port,
            call_target: options.call_target,
            caller_display,
        }
    }

    /// Whether the audio pump should be running.
    pub fn call_active(&self) -> bool {
        self.state == State::CallEstablished
    }

    /// Companding law the peer offered for the current dialog, when known.
    pub fn media_payload_type(&self) -> Option<u8> {
        self.media_payload_type
    }

    pub fn on_command(&mut self, command: Command, driver: &mut dyn Driver) {
        match command {
            Command::Start => self.dispatch(Event::Start, driver),
            Command::Ring {
                local_number,
                caller_display,
            } => {
                log::info!("request to call {local_number}");
                self.dispatch(
                    Event::RequestCall {
                        local_number: &local_number,
                        caller_display: &caller_display,
                    },
                    driver,
                );
            }
            Command::Cancel => {
                log::info!("request to cancel the call");
                self.dispatch(Event::CancelCall, driver);
            }
            Command::SetServerIp(server_ip) => {
                self.server_ip = server_ip;
                self.dialog.uri = format!("sip:{}", self.server_ip);
                self.dialog.to_uri = format!("sip:{}@{}", self.user, self.server_ip);
            }
            Command::SetMyIp(my_ip) => self.my_ip = my_ip,
            Command::SetCredentials { user, password } => {
                self.user = user;
                self.password = password;
                self.dialog.to_uri = format!("sip:{}@{}", self.user, self.server_ip);
            }
        }
    }

    pub fn on_timer(&mut self, timer: Timer, driver: &mut dyn Driver) {
        match timer {
            Timer::ReplyTimeout => self.dispatch(Event::ReplyTimeout, driver),
            Timer::Reregister => self.dispatch(Event::Reregister, driver),
            Timer::Recovery => self.dispatch(Event::Start, driver),
        }
    }

    /// Demultiplex one received datagram into machine events.
    pub fn on_datagram(&mut self, datagram: &[u8], driver: &mut dyn Driver) {
        let packet = match Packet::parse(datagram) {
            Ok(packet) => packet,
            Err(error) => {
                log::info!("dropping malformed datagram: {error}");
                return;
            }
        };

        driver.disarm(Timer::ReplyTimeout);
        log::debug!(
            "rx: status={:?} method={:?}",
            packet.status,
            packet.method
        );

        if packet.status == Status::ServerInternalError {
            self.dispatch(Event::ServerError, driver);
            return;
        }

        match packet.status {
            Status::Unauthorized | Status::ProxyAuthenticationRequired => {
                self.digest.realm = packet.realm.unwrap_or_default().to_string();
                self.digest.nonce = packet.nonce.unwrap_or_default().to_string();
                self.digest.proxy = packet.status == Status::ProxyAuthenticationRequired;
            }
            // Requests the machine has no state for are acknowledged
            // statelessly.
            Status::Unknown
                if matches!(packet.method, Method::Notify | Method::Bye | Method::Info) =>
            {
                self.send_reply("200 OK", &packet, driver);
            }
            _ => {}
        }

        self.dialog.absorb(&packet);

        if self.state != State::CallEstablished {
            if let Some(line) = packet.media {
                if let Some(payload_type) = sdp::preferred_payload_type(line) {
                    self.media_payload_type = Some(payload_type);
                }
            }
        }

        match packet.status {
            Status::Unauthorized | Status::ProxyAuthenticationRequired => {
                self.dispatch(Event::AuthChallenge, driver)
            }
            Status::Ok => self.dispatch(
                Event::Ok {
                    contact_expires: packet.contact_expires,
                },
                driver,
            ),
            Status::Trying => self.dispatch(Event::Trying, driver),
            Status::SessionProgress => self.dispatch(Event::SessionProgress, driver),
            Status::RequestTerminated => self.dispatch(Event::RequestCancelled, driver),
            Status::BusyHere => {
                self.acknowledge_rejection(driver);
                self.dispatch(Event::BusyHere, driver);
            }
            Status::Decline => {
                self.acknowledge_rejection(driver);
                self.dispatch(Event::Decline, driver);
            }
            _ => {}
        }

        match packet.method {
            Method::Bye => self.dispatch(Event::RxBye, driver),
            Method::Info if packet.content_type == ContentType::ApplicationDtmfRelay => {
                if let Some(dtmf) = packet.dtmf {
                    self.handler.on_event(SipEvent::ButtonPress {
                        signal: dtmf.signal,
                        duration_ms: dtmf.duration_ms,
                    });
                }
            }
            Method::Invite => {
                // A call announcing our own display name is our own ring
                // reflected back by the server; everything else is picked up
                // immediately.
                if self.is_reflected_invite(packet.from) {
                    log::debug!("declining invite from {:?}", packet.from);
                    self.send_reply("603 Decline", &packet, driver);
                } else {
                    log::debug!(
                        "accepting invite from {:?}, called party {:?}",
                        packet.from,
                        packet.p_called_party_id
                    );
                    self.send_reply("200 OK", &packet, driver);
                    self.dispatch(Event::RxInvite, driver);
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, event: Event<'_>, driver: &mut dyn Driver) {
        let mut next = Some(event);
        while let Some(event) = next {
            next = self.transition(event, driver);
        }
    }

    fn transition(&mut self, event: Event<'_>, driver: &mut dyn Driver) -> Option<Event<'static>> {
        let state = self.state;
        let mut follow_up = None;

        self.state = match (state, event) {
            (
                State::Idle | State::Registered | State::Calling | State::CallEstablished,
                Event::Start,
            ) => {
                self.register_unauth(driver);
                State::WaitingForAuthReply
            }
            (State::WaitingForAuthReply, Event::AuthChallenge) => {
                self.register_auth(driver);
                State::WaitingForAuthReply
            }
            (State::WaitingForAuthReply, Event::ReplyTimeout) => {
                self.register_unauth(driver);
                State::WaitingForAuthReply
            }
            (State::WaitingForAuthReply, Event::Ok { contact_expires }) => {
                self.schedule_reregister(contact_expires, driver);
                self.registration_complete();
                State::Registered
            }
            (State::WaitingForAuthReply, Event::ServerError) => {
                self.server_error_cooldown(driver);
                State::Idle
            }
            (State::Registered, Event::Reregister) => {
                self.register_unauth(driver);
                State::WaitingForAuthReply
            }
            (
                State::Registered,
                Event::RequestCall {
                    local_number,
                    caller_display,
                },
            ) => {
                self.prepare_call(local_number, caller_display);
                follow_up = Some(Event::InitiateCall);
                State::Registered
            }
            (State::Registered, Event::InitiateCall) => {
                self.send_fresh_invite(driver);
                State::Calling
            }
            (State::Registered, Event::RxInvite) => {
                self.handler.on_event(SipEvent::CallStart);
                State::CallEstablished
            }
            (State::Calling, Event::AuthChallenge) => {
                self.retry_invite_with_credentials(driver);
                State::Calling
            }
            (State::Calling, Event::CancelCall) => {
                self.send_cancel(driver);
                State::Cancelling
            }
            (State::Calling, Event::Trying | Event::SessionProgress) => State::Calling,
            (State::Calling, Event::Ok { .. }) => {
                self.establish_outgoing_call(driver);
                State::CallEstablished
            }
            (State::Calling | State::Cancelling, Event::RequestCancelled) => {
                self.finish_cancelled_call(driver);
                State::Registered
            }
            (State::Calling, Event::BusyHere) => {
                self.report_declined(CancelReason::TargetBusy);
                State::Registered
            }
            (State::Calling, Event::Decline) => {
                self.report_declined(CancelReason::CallDeclined);
                State::Registered
            }
            (State::Calling | State::CallEstablished, Event::Reregister) => {
                // Do not tear the call down; try again shortly.
                self.schedule_reregister(BUSY_REREGISTER_EXPIRES, driver);
                state
            }
            // The 200 acknowledges the CANCEL itself; the call is only over
            // once the INVITE comes back with a 487.
            (State::Cancelling, Event::Ok { .. }) => State::Cancelling,
            (State::CallEstablished, Event::RxBye) => {
                self.finish_call();
                State::Registered
            }
            (state, event) => {
                log::debug!("ignoring {event:?} in {state:?}");
                state
            }
        };

        follow_up
    }

    // Entry actions.

    fn register_unauth(&mut self, driver: &mut dyn Driver) {
        self.regenerate_transaction();
        self.send_register(driver);
        self.regenerate_transaction();
    }

    fn register_auth(&mut self, driver: &mut dyn Driver) {
        self.cseq += 1;
        let uri = format!("sip:{}", self.server_ip);
        self.compute_digest("REGISTER", &uri);
        self.send_register(driver);
    }

    fn schedule_reregister(&mut self, mut expires: u32, driver: &mut dyn Driver) {
        if expires < 10 {
            expires = REGISTRATION_EXPIRES;
        }

        driver.arm(Timer::Reregister, Duration::from_secs(u64::from(expires / 2)));
    }

    fn registration_complete(&mut self) {
        self.cseq += 1;
        self.digest.clear();
        log::info!("registration ok");

        self.dialog.uri = format!("sip:{}@{}", self.call_target, self.server_ip);
        self.dialog.to_uri = self.dialog.uri.clone();
    }

    fn prepare_call(&mut self, local_number: &str, caller_display: &str) {
        self.call_id = random_id();
        self.dialog.uri = format!("sip:{}@{}", local_number, self.server_ip);
        self.dialog.to_uri = self.dialog.uri.clone();
        self.caller_display = caller_display.to_string();
        self.media_payload_type = None;
    }

    fn send_fresh_invite(&mut self, driver: &mut dyn Driver) {
        self.cseq += 1;
        self.sdp_session_id = random_id();
        self.branch = random_id();
        self.send_invite(driver);
    }

    fn retry_invite_with_credentials(&mut self, driver: &mut dyn Driver) {
        // The rejected INVITE still wants its ACK before the retry.
        self.send_ack(driver);

        self.sdp_session_id = random_id();
        self.branch = random_id();
        self.cseq += 1;

        let uri = self.dialog.uri.clone();
        self.compute_digest("INVITE", &uri);
        self.send_invite(driver);
    }

    fn establish_outgoing_call(&mut self, driver: &mut dyn Driver) {
        self.send_ack(driver);
        self.handler.on_event(SipEvent::CallStart);
    }

    fn finish_cancelled_call(&mut self, driver: &mut dyn Driver) {
        self.handler.on_event(SipEvent::CallCancelled { reason: None });
        self.send_ack(driver);
        self.regenerate_transaction();
        self.cseq += 1;
        self.media_payload_type = None;
    }

    fn report_declined(&mut self, reason: CancelReason) {
        self.handler.on_event(SipEvent::CallCancelled {
            reason: Some(reason),
        });
        self.media_payload_type = None;
    }

    fn finish_call(&mut self) {
        self.cseq += 1;
        self.handler.on_event(SipEvent::CallEnd);
        self.media_payload_type = None;
    }

    fn server_error_cooldown(&mut self, driver: &mut dyn Driver) {
        self.regenerate_transaction();
        self.cseq += 1;
        driver.arm(Timer::Recovery, RECOVERY_DELAY);
    }

    /// ACK a 486/603 reply and leave the failed INVITE transaction behind.
    fn acknowledge_rejection(&mut self, driver: &mut dyn Driver) {
        self.send_ack(driver);
        self.cseq += 1;
        self.branch = random_id();
    }

    fn regenerate_transaction(&mut self) {
        self.tag = random_id();
        self.branch = random_id();
    }

    fn compute_digest(&mut self, method: &str, uri: &str) {
        self.digest.response = auth::digest_response(
            &self.user,
            &self.password,
            &self.digest.realm,
            &self.digest.nonce,
            method,
            uri,
        );
    }

    fn is_reflected_invite(&self, from: Option<&str>) -> bool {
        from.and_then(|from| from.strip_prefix('"'))
            .and_then(|rest| rest.strip_prefix(self.caller_display.as_str()))
            .is_some_and(|rest| rest.starts_with('"'))
    }

    // Message emission.

    fn send_register(&mut self, driver: &mut dyn Driver) {
        let uri = format!("sip:{}", self.server_ip);
        let to_uri = format!("sip:{}@{}", self.user, self.server_ip);

        let context = RequestContext {
            method: "REGISTER",
            uri: &uri,
            to_uri: &to_uri,
            to_tag: None,
            routes: &[],
            user: &self.user,
            caller_display: &self.caller_display,
            server_ip: &self.server_ip,
            my_ip: &self.my_ip,
            local_port: self.local_port,
            cseq: self.cseq,
            call_id: self.call_id,
            tag: self.tag,
            branch: self.branch,
        };

        let mut writer = begin_request(&mut self.tx, &context);
        writer.header(
            "Contact",
            format_args!(
                "\"{}\" <sip:{}@{}:{};transport=udp>",
                self.user, self.user, self.my_ip, self.local_port
            ),
        );

        if self.digest.has_response() {
            writer.header(
                "Authorization",
                format_args!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
                     algorithm=MD5, response=\"{}\"",
                    self.user, self.digest.realm, self.digest.nonce, uri, self.digest.response
                ),
            );
        }

        writer.header("Allow", format_args!("{ALLOW_METHODS}"));
        writer.header("Expires", format_args!("{REGISTRATION_EXPIRES}"));

        driver.transmit(writer.finish());
        driver.arm(Timer::ReplyTimeout, REPLY_TIMEOUT);
    }

    fn send_invite(&mut self, driver: &mut dyn Driver) {
        sdp::Offer {
            user: &self.user,
            session_id: self.sdp_session_id,
            local_ip: &self.my_ip,
            rtp_port: self.local_rtp_port,
        }
        .render(&mut self.sdp);

        let context = RequestContext {
            method: "INVITE",
            uri: &self.dialog.uri,
            to_uri: &self.dialog.to_uri,
            to_tag: None,
            routes: &[],
            user: &self.user,
            caller_display: &self.caller_display,
            server_ip: &self.server_ip,
            my_ip: &self.my_ip,
            local_port: self.local_port,
            cseq: self.cseq,
            call_id: self.call_id,
            tag: self.tag,
            branch: self.branch,
        };

        let mut writer = begin_request(&mut self.tx, &context);
        writer.header(
            "Contact",
            format_args!(
                "\"{}\" <sip:{}@{}:{};transport=udp>",
                self.user, self.user, self.my_ip, self.local_port
            ),
        );

        if self.digest.has_response() {
            let name = if self.digest.proxy {
                "Proxy-Authorization"
            } else {
                "Authorization"
            };
            writer.header(
                name,
                format_args!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
                     response=\"{}\"",
                    self.user,
                    self.digest.realm,
                    self.digest.nonce,
                    self.dialog.uri,
                    self.digest.response
                ),
            );
        }

        writer.header("Content-Type", format_args!("application/sdp"));
        writer.header("Allow", format_args!("{ALLOW_METHODS}"));

        driver.transmit(writer.finish_with_body(self.sdp.as_str()));
    }

    /// The CANCEL matches its INVITE: same CSeq number, `From` tag and
    /// branch, none of which are regenerated here.
    fn send_cancel(&mut self, driver: &mut dyn Driver) {
        let context = RequestContext {
            method: "CANCEL",
            uri: &self.dialog.uri,
            to_uri: &self.dialog.to_uri,
            to_tag: None,
            routes: &[],
            user: &self.user,
            caller_display: &self.caller_display,
            server_ip: &self.server_ip,
            my_ip: &self.my_ip,
            local_port: self.local_port,
            cseq: self.cseq,
            call_id: self.call_id,
            tag: self.tag,
            branch: self.branch,
        };

        let mut writer = begin_request(&mut self.tx, &context);

        if self.digest.has_response() {
            writer.header(
                "Contact",
                format_args!(
                    "\"{}\" <sip:{}@{}:{};transport=udp>",
                    self.user, self.user, self.my_ip, self.local_port
                ),
            );
            writer.header("Content-Type", format_args!("application/sdp"));
            writer.header(
                "Authorization",
                format_args!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
                     response=\"{}\"",
                    self.user,
                    self.digest.realm,
                    self.digest.nonce,
                    self.dialog.uri,
                    self.digest.response
                ),
            );
        }

        driver.transmit(writer.finish());
    }

    /// ACK for a 2xx goes to the learned peer contact and carries its tag;
    /// ACK for a failed INVITE goes back to the request URI under the
    /// original branch.
    fn send_ack(&mut self, driver: &mut dyn Driver) {
        let uri = if self.dialog.to_contact.is_empty() {
            self.dialog.uri.as_str()
        } else {
            self.dialog.to_contact.as_str()
        };

        let context = RequestContext {
            method: "ACK",
            uri,
            to_uri: &self.dialog.to_uri,
            to_tag: (!self.dialog.to_tag.is_empty()).then_some(self.dialog.to_tag.as_str()),
            routes: &self.dialog.record_route,
            user: &self.user,
            caller_display: &self.caller_display,
            server_ip: &self.server_ip,
            my_ip: &self.my_ip,
            local_port: self.local_port,
            cseq: self.cseq,
            call_id: self.call_id,
            tag: self.tag,
            branch: self.branch,
        };

        let writer = begin_request(&mut self.tx, &context);
        driver.transmit(writer.finish());
    }

    fn send_reply(&mut self, code: &str, packet: &Packet<'_>, driver: &mut dyn Driver) {
        let writer = MessageWriter::reply_to(&mut self.tx, code, packet);
        driver.transmit(writer.finish());
    }
}

/// Everything the shared request header needs, borrowed from the machine.
struct RequestContext<'a> {
    method: &'a str,
    uri: &'a str,
    to_uri: &'a str,
    to_tag: Option<&'a str>,
    routes: &'a [String],
    user: &'a str,
    caller_display: &'a str,
    server_ip: &'a str,
    my_ip: &'a str,
    local_port: u16,
    cseq: u32,
    call_id: u32,
    tag: u32,
    branch: u32,
}

fn begin_request<'a>(buffer: &'a mut TxBuffer, context: &RequestContext<'_>) -> MessageWriter<'a> {
    let mut writer = MessageWriter::request(buffer, context.method, context.uri);

    writer.header("CSeq", format_args!("{} {}", context.cseq, context.method));
    writer.header(
        "Call-ID",
        format_args!("{}@{}", context.call_id, context.my_ip),
    );
    writer.header("Max-Forwards", format_args!("70"));
    writer.header("User-Agent", format_args!("{SOFTWARE}"));

    match context.method {
        "REGISTER" => writer.header(
            "From",
            format_args!(
                "<sip:{}@{}>;tag={}",
                context.user, context.server_ip, context.tag
            ),
        ),
        "INVITE" => writer.header(
            "From",
            format_args!(
                "\"{}\" <sip:{}@{}>;tag={}",
                context.caller_display, context.user, context.server_ip, context.tag
            ),
        ),
        _ => writer.header(
            "From",
            format_args!(
                "\"{}\" <sip:{}@{}>;tag={}",
                context.user, context.user, context.server_ip, context.tag
            ),
        ),
    };

    writer.header(
        "Via",
        format_args!(
            "SIP/2.0/UDP {}:{};branch=z9hG4bK-{};rport",
            context.my_ip, context.local_port, context.branch
        ),
    );

    match context.to_tag {
        Some(tag) => writer.header("To", format_args!("<{}>;tag={}", context.to_uri, tag)),
        None => writer.header("To", format_args!("<{}>", context.to_uri)),
    };

    // Learned Record-Routes come back as Route headers, reversed.
    for route in context.routes.iter().rev() {
        if route.is_empty() {
            continue;
        }
        writer.header("Route", format_args!("{route}"));
    }

    writer
}

fn random_id() -> u32 {
    rand::rng().random_range(0..2_147_483_647u32)
}
