use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use sip_agent_service::{
    CancelReason, Command, Driver, Signaling, SignalingHandler, SignalingOptions, SipEvent, Timer,
};

/// Records everything the machine pushes through its seams.
#[derive(Default)]
struct TestDriver {
    sent: Vec<String>,
    armed: Vec<(Timer, Duration)>,
    disarmed: Vec<Timer>,
}

impl Driver for TestDriver {
    fn transmit(&mut self, datagram: &[u8]) {
        self.sent
            .push(String::from_utf8(datagram.to_vec()).expect("ascii datagram"));
    }

    fn arm(&mut self, timer: Timer, after: Duration) {
        self.armed.push((timer, after));
    }

    fn disarm(&mut self, timer: Timer) {
        self.disarmed.push(timer);
    }
}

#[derive(Default, Clone)]
struct Events(Arc<Mutex<Vec<SipEvent>>>);

impl Events {
    fn take(&self) -> Vec<SipEvent> {
        std::mem::take(&mut self.0.lock().unwrap())
    }
}

impl SignalingHandler for Events {
    fn on_event(&self, event: SipEvent) {
        self.0.lock().unwrap().push(event);
    }
}

fn agent(events: Events) -> Signaling<Events> {
    Signaling::new(SignalingOptions {
        user: "620".to_string(),
        password: "secret".to_string(),
        server_ip: "192.168.179.1".to_string(),
        my_ip: "192.168.179.20".to_string(),
        local_port: 5060,
        local_rtp_port: 7078,
        call_target: "**613".to_string(),
        caller_display: "Door".to_string(),
        handler: events,
    })
}

/// First non-empty CSeq number found in a sent message.
fn cseq_of(message: &str) -> u32 {
    message
        .lines()
        .find_map(|line| line.strip_prefix("CSeq: "))
        .and_then(|value| value.split(' ').next())
        .and_then(|number| number.parse().ok())
        .expect("message carries a CSeq")
}

fn header_of<'a>(message: &'a str, name: &str) -> Option<&'a str> {
    let prefix = format!("{name}: ");
    message
        .lines()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
}

fn from_tag_of(message: &str) -> &str {
    header_of(message, "From")
        .and_then(|from| from.split(";tag=").nth(1))
        .expect("From carries a tag")
}

fn branch_of(message: &str) -> &str {
    header_of(message, "Via")
        .and_then(|via| via.split("branch=").nth(1))
        .map(|branch| branch.split(';').next().unwrap_or(branch))
        .expect("Via carries a branch")
}

fn challenge_401(nonce: &str) -> Vec<u8> {
    format!(
        "SIP/2.0 401 Unauthorized\r\n\
         To: <sip:620@192.168.179.1>;tag=as58f4201b\r\n\
         CSeq: 20 REGISTER\r\n\
         WWW-Authenticate: Digest algorithm=MD5, realm=\"asterisk\", nonce=\"{nonce}\"\r\n\
         Content-Length: 0\r\n\
         \r\n"
    )
    .into_bytes()
}

fn register_ok(expires: u32) -> Vec<u8> {
    format!(
        "SIP/2.0 200 OK\r\n\
         To: <sip:620@192.168.179.1>;tag=as58f4201c\r\n\
         CSeq: 21 REGISTER\r\n\
         Contact: <sip:620@192.168.179.20:5060>;expires={expires}\r\n\
         Content-Length: 0\r\n\
         \r\n"
    )
    .into_bytes()
}

fn reply(status_line: &str) -> Vec<u8> {
    format!(
        "{status_line}\r\n\
         To: <sip:**613@192.168.179.1>;tag=peer1\r\n\
         CSeq: 22 INVITE\r\n\
         Content-Length: 0\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Drive the machine into `Registered` and drain the driver.
fn register(machine: &mut Signaling<Events>, driver: &mut TestDriver) {
    machine.on_command(Command::Start, driver);
    machine.on_datagram(&challenge_401("n1"), driver);
    machine.on_datagram(&register_ok(300), driver);
    driver.sent.clear();
    driver.armed.clear();
}

#[test]
fn register_happy_path() -> Result<()> {
    let events = Events::default();
    let mut machine = agent(events.clone());
    let mut driver = TestDriver::default();

    machine.on_command(Command::Start, &mut driver);

    let first = &driver.sent[0];
    assert!(first.starts_with("REGISTER sip:192.168.179.1 SIP/2.0\r\n"));
    assert!(first.contains("User-Agent: sip-client/0.0.1\r\n"));
    assert!(first.contains("Expires: 3600\r\n"));
    assert!(!first.contains("Authorization"));
    assert_eq!(driver.armed[0].0, Timer::ReplyTimeout);
    let first_cseq = cseq_of(first);

    machine.on_datagram(&challenge_401("n1"), &mut driver);

    // The pending reply timeout dies with the response.
    assert!(driver.disarmed.contains(&Timer::ReplyTimeout));

    let retry = &driver.sent[1];
    assert_eq!(cseq_of(retry), first_cseq + 1);
    let authorization = header_of(retry, "Authorization").expect("credentials on retry");
    assert!(authorization.contains("realm=\"asterisk\""));
    assert!(authorization.contains("nonce=\"n1\""));
    assert!(authorization.contains("uri=\"sip:192.168.179.1\""));
    // MD5(MD5("620:asterisk:secret") ":n1:" MD5("REGISTER:sip:192.168.179.1"))
    assert!(authorization.contains("response=\"fd43d1992bbc8ea12853082531f847d4\""));

    machine.on_datagram(&register_ok(300), &mut driver);

    // Half the granted expiry.
    assert!(
        driver
            .armed
            .iter()
            .any(|&(timer, after)| timer == Timer::Reregister
                && after == Duration::from_secs(150))
    );
    assert!(events.take().is_empty());

    Ok(())
}

#[test]
fn reply_timeout_retransmits_unauthenticated_register() {
    let events = Events::default();
    let mut machine = agent(events);
    let mut driver = TestDriver::default();

    machine.on_command(Command::Start, &mut driver);
    machine.on_timer(Timer::ReplyTimeout, &mut driver);

    assert_eq!(driver.sent.len(), 2);
    assert!(driver.sent[1].starts_with("REGISTER "));
    assert!(!driver.sent[1].contains("Authorization"));
    // CSeq does not advance on a plain retransmit.
    assert_eq!(cseq_of(&driver.sent[0]), cseq_of(&driver.sent[1]));
}

#[test]
fn outgoing_call_cancelled_before_answer() -> Result<()> {
    let events = Events::default();
    let mut machine = agent(events.clone());
    let mut driver = TestDriver::default();
    register(&mut machine, &mut driver);

    machine.on_command(
        Command::Ring {
            local_number: "**613".to_string(),
            caller_display: "Door".to_string(),
        },
        &mut driver,
    );

    let invite = driver.sent[0].clone();
    assert!(invite.starts_with("INVITE sip:**613@192.168.179.1 SIP/2.0\r\n"));
    assert!(invite.contains("Content-Type: application/sdp\r\n"));
    assert!(invite.contains("m=audio 7078 RTP/AVP 0 8 101\r\n"));
    assert!(invite.contains("From: \"Door\" <sip:620@192.168.179.1>;tag="));

    machine.on_datagram(b"SIP/2.0 100 Trying\r\nCSeq: 22 INVITE\r\n\r\n", &mut driver);
    assert_eq!(driver.sent.len(), 1);

    machine.on_command(Command::Cancel, &mut driver);

    let cancel = driver.sent[1].clone();
    assert!(cancel.starts_with("CANCEL sip:**613@192.168.179.1 SIP/2.0\r\n"));
    assert_eq!(cseq_of(&cancel), cseq_of(&invite));
    assert_eq!(from_tag_of(&cancel), from_tag_of(&invite));
    assert_eq!(branch_of(&cancel), branch_of(&invite));

    // 200 for the CANCEL itself is not the end of the call.
    machine.on_datagram(&reply("SIP/2.0 200 OK"), &mut driver);
    assert!(events.take().is_empty());

    machine.on_datagram(&reply("SIP/2.0 487 Request Cancelled"), &mut driver);

    let ack = driver.sent.last().unwrap();
    assert!(ack.starts_with("ACK "));
    assert_eq!(events.take(), vec![SipEvent::CallCancelled { reason: None }]);

    // Back in `Registered`: a new call goes out again.
    let before = driver.sent.len();
    machine.on_command(
        Command::Ring {
            local_number: "**613".to_string(),
            caller_display: "Door".to_string(),
        },
        &mut driver,
    );
    assert!(driver.sent[before].starts_with("INVITE "));

    Ok(())
}

#[test]
fn busy_and_decline_end_the_attempt_with_one_ack() {
    for (status_line, reason) in [
        ("SIP/2.0 486 Busy Here", CancelReason::TargetBusy),
        ("SIP/2.0 603 Decline", CancelReason::CallDeclined),
    ] {
        let events = Events::default();
        let mut machine = agent(events.clone());
        let mut driver = TestDriver::default();
        register(&mut machine, &mut driver);

        machine.on_command(
            Command::Ring {
                local_number: "**613".to_string(),
                caller_display: "Door".to_string(),
            },
            &mut driver,
        );
        let invite_cseq = cseq_of(&driver.sent[0]);
        driver.sent.clear();

        machine.on_datagram(&reply(status_line), &mut driver);

        let acks = driver
            .sent
            .iter()
            .filter(|message| message.starts_with("ACK "))
            .count();
        assert_eq!(acks, 1);
        let invites = driver
            .sent
            .iter()
            .filter(|message| message.starts_with("INVITE "))
            .count();
        assert_eq!(invites, 0, "no further INVITE for this call id");
        assert_eq!(
            events.take(),
            vec![SipEvent::CallCancelled {
                reason: Some(reason)
            }]
        );

        // The failed transaction is left behind.
        driver.sent.clear();
        machine.on_command(
            Command::Ring {
                local_number: "**613".to_string(),
                caller_display: "Door".to_string(),
            },
            &mut driver,
        );
        assert!(cseq_of(&driver.sent[0]) > invite_cseq);
    }
}

#[test]
fn invite_challenge_is_acked_and_retried_with_credentials() {
    let events = Events::default();
    let mut machine = agent(events);
    let mut driver = TestDriver::default();
    register(&mut machine, &mut driver);

    machine.on_command(
        Command::Ring {
            local_number: "**613".to_string(),
            caller_display: "Door".to_string(),
        },
        &mut driver,
    );
    let invite_cseq = cseq_of(&driver.sent[0]);
    driver.sent.clear();

    machine.on_datagram(
        b"SIP/2.0 407 Proxy Authentication Required\r\n\
          To: <sip:**613@192.168.179.1>;tag=peer1\r\n\
          CSeq: 22 INVITE\r\n\
          Proxy-Authenticate: Digest algorithm=MD5, realm=\"asterisk\", nonce=\"n2\"\r\n\
          Content-Length: 0\r\n\
          \r\n",
        &mut driver,
    );

    assert!(driver.sent[0].starts_with("ACK "));
    let retry = &driver.sent[1];
    assert!(retry.starts_with("INVITE "));
    assert_eq!(cseq_of(retry), invite_cseq + 1);

    let authorization = header_of(retry, "Proxy-Authorization").expect("407 answers with proxy credentials");
    // MD5(MD5("620:asterisk:secret") ":n2:" MD5("INVITE:sip:**613@192.168.179.1"))
    assert!(authorization.contains("response=\"73230291dbeb43460b17cc640a80a8f2\""));
}

#[test]
fn answered_call_is_acked_at_the_learned_contact() {
    let events = Events::default();
    let mut machine = agent(events.clone());
    let mut driver = TestDriver::default();
    register(&mut machine, &mut driver);

    machine.on_command(
        Command::Ring {
            local_number: "**613".to_string(),
            caller_display: "Door".to_string(),
        },
        &mut driver,
    );
    driver.sent.clear();

    machine.on_datagram(
        b"SIP/2.0 200 OK\r\n\
          Record-Route: <sip:192.168.179.1:5060;lr>\r\n\
          To: <sip:**613@192.168.179.1>;tag=peer7\r\n\
          Contact: <sip:**613@192.168.179.77:5062>\r\n\
          CSeq: 22 INVITE\r\n\
          Content-Length: 0\r\n\
          \r\n",
        &mut driver,
    );

    let ack = &driver.sent[0];
    assert!(ack.starts_with("ACK sip:**613@192.168.179.77:5062 SIP/2.0\r\n"));
    assert!(ack.contains("To: <sip:**613@192.168.179.1>;tag=peer7\r\n"));
    assert!(ack.contains("Route: <sip:192.168.179.1:5060;lr>\r\n"));
    assert_eq!(events.take(), vec![SipEvent::CallStart]);
    assert!(machine.call_active());
}

#[test]
fn incoming_call_from_own_display_name_is_declined() {
    let events = Events::default();
    let mut machine = agent(events.clone());
    let mut driver = TestDriver::default();
    register(&mut machine, &mut driver);

    machine.on_datagram(
        b"INVITE sip:620@192.168.179.20:5060 SIP/2.0\r\n\
          Via: SIP/2.0/UDP 192.168.179.1:5060;branch=z9hG4bK7F31A2C4\r\n\
          From: \"Door\" <sip:620@192.168.179.1>;tag=ring1\r\n\
          To: <sip:620@192.168.179.20>\r\n\
          Call-ID: 77@192.168.179.1\r\n\
          CSeq: 1 INVITE\r\n\
          Content-Length: 0\r\n\
          \r\n",
        &mut driver,
    );

    assert_eq!(driver.sent.len(), 1);
    assert!(driver.sent[0].starts_with("SIP/2.0 603 Decline\r\n"));
    assert!(events.take().is_empty());
    assert!(!machine.call_active());
}

#[test]
fn incoming_call_from_other_party_is_picked_up() {
    let events = Events::default();
    let mut machine = agent(events.clone());
    let mut driver = TestDriver::default();
    register(&mut machine, &mut driver);

    machine.on_datagram(
        b"INVITE sip:620@192.168.179.20:5060 SIP/2.0\r\n\
          Via: SIP/2.0/UDP 192.168.179.1:5060;branch=z9hG4bK7F31A2C5\r\n\
          From: \"Kitchen\" <sip:**611@192.168.179.1>;tag=ring2\r\n\
          To: <sip:620@192.168.179.20>\r\n\
          Call-ID: 78@192.168.179.1\r\n\
          CSeq: 1 INVITE\r\n\
          Content-Type: application/sdp\r\n\
          Content-Length: 47\r\n\
          \r\n\
          c=IN IP4 192.168.179.1\r\n\
          m=audio 7078 RTP/AVP 8 0 101\r\n",
        &mut driver,
    );

    let ok = &driver.sent[0];
    assert!(ok.starts_with("SIP/2.0 200 OK\r\n"));
    assert!(ok.contains("Via: SIP/2.0/UDP 192.168.179.1:5060;branch=z9hG4bK7F31A2C5\r\n"));
    assert_eq!(events.take(), vec![SipEvent::CallStart]);
    assert!(machine.call_active());
    // The peer listed PCMA first.
    assert_eq!(machine.media_payload_type(), Some(8));
}

#[test]
fn dtmf_info_during_call_is_acknowledged_and_reported() {
    let events = Events::default();
    let mut machine = agent(events.clone());
    let mut driver = TestDriver::default();
    register(&mut machine, &mut driver);

    machine.on_datagram(
        b"INVITE sip:620@192.168.179.20:5060 SIP/2.0\r\n\
          From: \"Kitchen\" <sip:**611@192.168.179.1>;tag=ring2\r\n\
          To: <sip:620@192.168.179.20>\r\n\
          Call-ID: 78@192.168.179.1\r\n\
          CSeq: 1 INVITE\r\n\
          Content-Length: 0\r\n\
          \r\n",
        &mut driver,
    );
    events.take();
    driver.sent.clear();

    machine.on_datagram(
        b"INFO sip:620@192.168.179.20:5060 SIP/2.0\r\n\
          From: \"Kitchen\" <sip:**611@192.168.179.1>;tag=ring2\r\n\
          To: <sip:620@192.168.179.20>;tag=local\r\n\
          Call-ID: 78@192.168.179.1\r\n\
          CSeq: 2 INFO\r\n\
          Content-Type: application/dtmf-relay\r\n\
          Content-Length: 25\r\n\
          \r\n\
          Signal=5\r\n\
          Duration=250\r\n",
        &mut driver,
    );

    assert!(driver.sent[0].starts_with("SIP/2.0 200 OK\r\n"));
    assert_eq!(
        events.take(),
        vec![SipEvent::ButtonPress {
            signal: '5',
            duration_ms: 250
        }]
    );
    assert!(machine.call_active());

    // The remote hangs up.
    machine.on_datagram(
        b"BYE sip:620@192.168.179.20:5060 SIP/2.0\r\n\
          From: \"Kitchen\" <sip:**611@192.168.179.1>;tag=ring2\r\n\
          To: <sip:620@192.168.179.20>;tag=local\r\n\
          Call-ID: 78@192.168.179.1\r\n\
          CSeq: 3 BYE\r\n\
          Content-Length: 0\r\n\
          \r\n",
        &mut driver,
    );

    assert!(driver.sent[1].starts_with("SIP/2.0 200 OK\r\n"));
    assert_eq!(events.take(), vec![SipEvent::CallEnd]);
    assert!(!machine.call_active());
}

#[test]
fn server_error_cools_down_then_restarts_registration() {
    let events = Events::default();
    let mut machine = agent(events);
    let mut driver = TestDriver::default();

    machine.on_command(Command::Start, &mut driver);
    let first_cseq = cseq_of(&driver.sent[0]);

    machine.on_datagram(
        b"SIP/2.0 500 Server Internal Error\r\nCSeq: 20 REGISTER\r\n\r\n",
        &mut driver,
    );

    assert!(
        driver
            .armed
            .iter()
            .any(|&(timer, after)| timer == Timer::Recovery && after == Duration::from_secs(5))
    );
    assert_eq!(driver.sent.len(), 1, "nothing sent during the cooldown");

    // The recovery timer posts a fresh start.
    machine.on_timer(Timer::Recovery, &mut driver);

    let restarted = &driver.sent[1];
    assert!(restarted.starts_with("REGISTER "));
    assert_eq!(cseq_of(restarted), first_cseq + 1);
}

#[test]
fn reregister_timer_runs_a_fresh_registration_cycle() {
    let events = Events::default();
    let mut machine = agent(events);
    let mut driver = TestDriver::default();
    register(&mut machine, &mut driver);

    machine.on_timer(Timer::Reregister, &mut driver);

    assert!(driver.sent[0].starts_with("REGISTER "));
    assert!(!driver.sent[0].contains("Authorization"));

    machine.on_datagram(&challenge_401("n9"), &mut driver);
    assert!(driver.sent[1].contains("nonce=\"n9\""));

    machine.on_datagram(&register_ok(600), &mut driver);
    assert!(
        driver
            .armed
            .iter()
            .any(|&(timer, after)| timer == Timer::Reregister
                && after == Duration::from_secs(300))
    );
}

#[test]
fn reregister_during_a_call_attempt_is_deferred() {
    let events = Events::default();
    let mut machine = agent(events);
    let mut driver = TestDriver::default();
    register(&mut machine, &mut driver);

    machine.on_command(
        Command::Ring {
            local_number: "**613".to_string(),
            caller_display: "Door".to_string(),
        },
        &mut driver,
    );
    driver.sent.clear();

    machine.on_timer(Timer::Reregister, &mut driver);

    // The call attempt is left alone; the timer comes back shortly.
    assert!(driver.sent.is_empty());
    assert!(
        driver
            .armed
            .iter()
            .any(|&(timer, after)| timer == Timer::Reregister
                && after == Duration::from_secs(10))
    );
}

#[test]
fn start_during_an_established_call_abandons_it_for_registration() {
    let events = Events::default();
    let mut machine = agent(events.clone());
    let mut driver = TestDriver::default();
    register(&mut machine, &mut driver);

    machine.on_datagram(
        b"INVITE sip:620@192.168.179.20:5060 SIP/2.0\r\n\
          From: \"Kitchen\" <sip:**611@192.168.179.1>;tag=ring2\r\n\
          To: <sip:620@192.168.179.20>\r\n\
          Call-ID: 79@192.168.179.1\r\n\
          CSeq: 1 INVITE\r\n\
          Content-Length: 0\r\n\
          \r\n",
        &mut driver,
    );
    assert!(machine.call_active());
    events.take();
    driver.sent.clear();

    machine.on_command(Command::Start, &mut driver);

    assert!(driver.sent[0].starts_with("REGISTER "));
    assert!(!machine.call_active());
}

#[test]
fn registration_without_granted_expiry_falls_back_to_an_hour() {
    let events = Events::default();
    let mut machine = agent(events);
    let mut driver = TestDriver::default();

    machine.on_command(Command::Start, &mut driver);
    machine.on_datagram(&challenge_401("n1"), &mut driver);
    machine.on_datagram(
        b"SIP/2.0 200 OK\r\n\
          To: <sip:620@192.168.179.1>;tag=as58f4201c\r\n\
          CSeq: 21 REGISTER\r\n\
          Content-Length: 0\r\n\
          \r\n",
        &mut driver,
    );

    assert!(
        driver
            .armed
            .iter()
            .any(|&(timer, after)| timer == Timer::Reregister
                && after == Duration::from_secs(1800))
    );
}

#[test]
fn malformed_datagrams_are_dropped_without_transition() {
    let events = Events::default();
    let mut machine = agent(events.clone());
    let mut driver = TestDriver::default();
    register(&mut machine, &mut driver);

    machine.on_datagram(b"SIP/2.0 200 OK\r\nCSeq: 1", &mut driver);
    machine.on_datagram(&[0xff, 0xfe, 0x00, 0x01], &mut driver);

    assert!(driver.sent.is_empty());
    assert!(events.take().is_empty());
    assert!(!machine.call_active());
}
