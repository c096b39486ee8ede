use std::{fs::read_to_string, net::IpAddr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Sip {
    ///
    /// account user name on the registrar
    ///
    pub user: String,
    ///
    /// account password
    ///
    pub password: String,
    ///
    /// registrar/proxy address
    ///
    /// name resolution happens outside the agent; this is the address the
    /// SIP and RTP sockets talk to.
    ///
    pub server_ip: IpAddr,
    #[serde(default = "Sip::server_port")]
    pub server_port: u16,
}

impl Sip {
    fn server_port() -> u16 {
        5060
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Network {
    ///
    /// local address advertised in Via, Contact and SDP
    ///
    pub local_ip: IpAddr,
    ///
    /// SIP signaling port
    ///
    #[serde(default = "Network::local_port")]
    pub local_port: u16,
    ///
    /// RTP media port
    ///
    #[serde(default = "Network::local_rtp_port")]
    pub local_rtp_port: u16,
}

impl Network {
    fn local_port() -> u16 {
        5060
    }

    fn local_rtp_port() -> u16 {
        7078
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Call {
    ///
    /// number dialed when the bell button fires
    ///
    /// a group number registered locally on the server, e.g. "**613" rings
    /// every phone of the household.
    ///
    #[serde(default = "Call::target_user")]
    pub target_user: String,
    ///
    /// display name shown on called phones
    ///
    /// also used to recognize our own ring when the server reflects it
    /// back; empty means the account user name is used.
    ///
    #[serde(default)]
    pub caller_display: String,
}

impl Call {
    fn target_user() -> String {
        "**613".to_string()
    }
}

impl Default for Call {
    fn default() -> Self {
        Self {
            target_user: Self::target_user(),
            caller_display: String::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub sip: Sip,
    pub network: Network,
    #[serde(default)]
    pub call: Call,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: sip-agent --config /etc/sip-agent/config.json
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters and read the configuration from the
    /// file they point at.
    ///
    pub fn load() -> Result<Self> {
        Ok(serde_json5::from_str::<Self>(&read_to_string(
            &Cli::parse().config,
        )?)?)
    }
}
