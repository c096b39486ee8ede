//! The event loop that owns the sockets.
//!
//! One task drives all signaling I/O: it waits on the SIP socket, the
//! command channel and the earliest armed timer, feeds whichever fires into
//! the state machine, and flushes everything the transition produced before
//! waiting again. No protocol state is shared with any other task.
//!
//! The audio pump is a second task gated on the signaling state; it owns
//! the RTP socket and the jitter buffer exclusively and is aborted the
//! moment the call ends.

mod media;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use service::{Command, Driver, Signaling, SignalingOptions, Timer};
use tokio::{
    net::UdpSocket,
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Instant, sleep_until},
};

use crate::{
    audio::{Discard, Silence},
    config::Config,
    observer::Observer,
};

/// SIP and RTP datagrams both fit comfortably.
const RX_BUFFER_SIZE: usize = 2048;

/// The peer media port is fixed, independent of our own RTP port.
const RTP_REMOTE_PORT: u16 = 7078;

/// One deadline slot per timer; rearming replaces the deadline.
#[derive(Default)]
struct Timers {
    reply: Option<Instant>,
    reregister: Option<Instant>,
    recovery: Option<Instant>,
}

impl Timers {
    fn slot(&mut self, timer: Timer) -> &mut Option<Instant> {
        match timer {
            Timer::ReplyTimeout => &mut self.reply,
            Timer::Reregister => &mut self.reregister,
            Timer::Recovery => &mut self.recovery,
        }
    }

    fn next(&self) -> Option<(Timer, Instant)> {
        let mut earliest: Option<(Timer, Instant)> = None;

        for (timer, deadline) in [
            (Timer::ReplyTimeout, self.reply),
            (Timer::Reregister, self.reregister),
            (Timer::Recovery, self.recovery),
        ] {
            if let Some(deadline) = deadline {
                if earliest.is_none_or(|(_, other)| deadline < other) {
                    earliest = Some((timer, deadline));
                }
            }
        }

        earliest
    }
}

/// [`Driver`] over the SIP socket and the timer slots.
///
/// Sends are best-effort: a failed or short send is logged and otherwise
/// ignored, recovery comes from reply timeouts and retransmits.
struct SocketDriver<'a> {
    socket: &'a UdpSocket,
    peer: SocketAddr,
    timers: &'a mut Timers,
}

impl Driver for SocketDriver<'_> {
    fn transmit(&mut self, datagram: &[u8]) {
        match self.socket.try_send_to(datagram, self.peer) {
            Ok(size) if size != datagram.len() => {
                log::warn!("sip socket short write: {size}/{}", datagram.len())
            }
            Ok(size) => log::trace!("sip socket sent {size} bytes to {}", self.peer),
            Err(error) => log::warn!("sip socket send error: {error}"),
        }
    }

    fn arm(&mut self, timer: Timer, after: Duration) {
        *self.timers.slot(timer) = Some(Instant::now() + after);
    }

    fn disarm(&mut self, timer: Timer) {
        *self.timers.slot(timer) = None;
    }
}

pub(crate) struct ReactorOptions {
    pub config: Arc<Config>,
    pub observer: Observer,
    pub commands: UnboundedReceiver<Command>,
    pub sip_socket: UdpSocket,
    pub rtp_socket: Arc<UdpSocket>,
}

pub(crate) async fn run(options: ReactorOptions) -> Result<()> {
    let ReactorOptions {
        config,
        observer,
        mut commands,
        sip_socket,
        rtp_socket,
    } = options;

    let mut peer = SocketAddr::new(config.sip.server_ip, config.sip.server_port);
    let mut rtp_peer = SocketAddr::new(config.sip.server_ip, RTP_REMOTE_PORT);

    // Fixed for the lifetime of the process, one value across all calls.
    let ssrc: u32 = rand::random();

    let mut client = Signaling::new(SignalingOptions {
        user: config.sip.user.clone(),
        password: config.sip.password.clone(),
        server_ip: config.sip.server_ip.to_string(),
        my_ip: config.network.local_ip.to_string(),
        local_port: config.network.local_port,
        local_rtp_port: config.network.local_rtp_port,
        call_target: config.call.target_user.clone(),
        caller_display: config.call.caller_display.clone(),
        handler: observer,
    });

    let mut timers = Timers::default();
    let mut pump: Option<JoinHandle<()>> = None;
    let mut buffer = vec![0u8; RX_BUFFER_SIZE];

    log::info!(
        "sip agent listening: sip={}, rtp={}, server={peer}",
        sip_socket.local_addr()?,
        rtp_socket.local_addr()?,
    );

    loop {
        let wake = timers.next();

        tokio::select! {
            received = sip_socket.recv_from(&mut buffer) => {
                match received {
                    Ok((size, _)) => {
                        let mut driver = SocketDriver { socket: &sip_socket, peer, timers: &mut timers };
                        client.on_datagram(&buffer[..size], &mut driver);
                    }
                    Err(error) => log::warn!("sip socket receive error: {error}"),
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    // Every handle is gone: deinit.
                    break;
                };

                if let Command::SetServerIp(address) = &command {
                    match address.parse() {
                        Ok(ip) => {
                            peer = SocketAddr::new(ip, config.sip.server_port);
                            rtp_peer = SocketAddr::new(ip, RTP_REMOTE_PORT);
                        }
                        Err(error) => log::warn!("ignoring bad server address {address}: {error}"),
                    }
                }

                let mut driver = SocketDriver { socket: &sip_socket, peer, timers: &mut timers };
                client.on_command(command, &mut driver);
            }
            _ = sleep_until(wake.map(|(_, deadline)| deadline).unwrap_or_else(Instant::now)), if wake.is_some() => {
                if let Some((timer, _)) = wake {
                    *timers.slot(timer) = None;
                    let mut driver = SocketDriver { socket: &sip_socket, peer, timers: &mut timers };
                    client.on_timer(timer, &mut driver);
                }
            }
        }

        // The signaling state gates the audio pump.
        if client.call_active() {
            if pump.is_none() {
                log::info!("audio pump starting");
                pump = Some(tokio::spawn(media::run(
                    media::MediaOptions {
                        socket: rtp_socket.clone(),
                        peer: rtp_peer,
                        ssrc,
                        payload_type: client.media_payload_type(),
                    },
                    Silence,
                    Discard,
                )));
            }
        } else if let Some(task) = pump.take() {
            task.abort();
            log::info!("audio pump stopped");
        }
    }

    if let Some(task) = pump.take() {
        task.abort();
    }

    log::info!("sip agent reactor closed");
    Ok(())
}
