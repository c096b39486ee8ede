pub mod audio;
pub mod config;
pub mod observer;

mod reactor;

use std::sync::Arc;

use anyhow::Result;
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

pub use service::{CancelReason, Command, SipEvent};

use self::{config::Config, observer::Observer};

/// In order to let the integration tests start the agent the same way the
/// binary does, startup is a library function rather than part of main.
///
/// Binds the SIP and RTP sockets, spawns the reactor and returns the handle
/// external components talk to.
pub async fn startup(config: Arc<Config>) -> Result<SipAgent> {
    let sip_socket =
        UdpSocket::bind(("0.0.0.0", config.network.local_port)).await?;
    let rtp_socket =
        Arc::new(UdpSocket::bind(("0.0.0.0", config.network.local_rtp_port)).await?);

    let (event_sender, event_receiver) = mpsc::unbounded_channel();
    let (command_sender, command_receiver) = mpsc::unbounded_channel();

    let reactor = tokio::spawn(reactor::run(reactor::ReactorOptions {
        observer: Observer::new(event_sender),
        commands: command_receiver,
        config,
        sip_socket,
        rtp_socket,
    }));

    Ok(SipAgent {
        commands: Some(command_sender),
        events: Some(event_receiver),
        reactor,
    })
}

/// Handle to a running agent.
///
/// Commands are posted onto the reactor and return immediately; outcomes
/// arrive on the event bus. Dropping the handle (or calling
/// [`SipAgent::deinit`]) shuts the reactor down.
pub struct SipAgent {
    commands: Option<UnboundedSender<Command>>,
    events: Option<UnboundedReceiver<SipEvent>>,
    reactor: JoinHandle<Result<()>>,
}

impl SipAgent {
    /// Begin registration.
    pub fn init(&self) {
        self.post(Command::Start);
    }

    /// Place a call; the `CallStart`/`CallCancelled` events on the bus are
    /// the authoritative outcome.
    pub fn request_ring(&self, local_number: &str, caller_display: &str) {
        self.post(Command::Ring {
            local_number: local_number.to_string(),
            caller_display: caller_display.to_string(),
        });
    }

    /// Abandon the pending outgoing call. Takes effect only while a call is
    /// being placed; the `CallCancelled` event is the reply.
    pub fn request_cancel(&self) {
        self.post(Command::Cancel);
    }

    pub fn set_server_ip(&self, server_ip: &str) {
        self.post(Command::SetServerIp(server_ip.to_string()));
    }

    pub fn set_my_ip(&self, my_ip: &str) {
        self.post(Command::SetMyIp(my_ip.to_string()));
    }

    pub fn set_credentials(&self, user: &str, password: &str) {
        self.post(Command::SetCredentials {
            user: user.to_string(),
            password: password.to_string(),
        });
    }

    /// The outgoing event bus. There is one receiver; the first caller
    /// takes it.
    pub fn events(&mut self) -> Option<UnboundedReceiver<SipEvent>> {
        self.events.take()
    }

    /// Stop the reactor. Idempotent.
    pub fn deinit(&mut self) {
        self.commands = None;
    }

    /// Wait for the reactor to finish after [`SipAgent::deinit`].
    pub async fn join(self) -> Result<()> {
        self.reactor.await?
    }

    fn post(&self, command: Command) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(command);
        }
    }
}
