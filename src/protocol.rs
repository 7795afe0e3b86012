//! Wire protocol between server and agents
//!
//! Every datagram is ASCII text made of fields joined by [`SEPARATOR`]; the first field
//! is an uppercase command token.
//!
//! ```text
//! server → agent   SRVHB%%<server hostname>
//! agent  → server  CONFREQ%%<agent hostname>
//! server → agent   CONFIG%%START%%<line>%%<line>...
//! server → agent   RESET%%<agent hostname>
//! agent  → server  ALERT%%<agent hostname>%%<id>%%<created at>%%<tags>%%<source>%%<message>
//! server → agent   ACK%%<alert id>
//! ```
//!
//! The server listens on `port + 1`, agents on `port`.

use std::fmt;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{trace, warn};

use crate::error::{ProtocolError, ProtocolResult};

/// Field separator used on the wire and inside alert texts
pub const SEPARATOR: &str = "%%";

/// Marker opening the payload of a `CONFIG` datagram
pub const CONFIG_START: &str = "START";

/// Source field used by alerts that are not tied to a file
pub const NO_SOURCE: &str = "NULL";

/// Largest datagram either side expects to receive
pub const MAX_DATAGRAM: usize = 65536;

/// An alert as produced by the monitoring engines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub tags: String,
    /// File the alert originates from, `None` for process/command/system alerts
    pub source: Option<String>,
    pub message: String,
}

impl Alert {
    pub fn new(tags: impl Into<String>, source: Option<String>, message: impl Into<String>) -> Self {
        Self {
            tags: tags.into(),
            source,
            message: message.into(),
        }
    }

    /// Alert raised by the agent itself (idle heartbeat, all-clear notices).
    pub fn system(message: impl Into<String>) -> Self {
        Self::new("SYSTEM", None, message)
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.tags,
            self.source.as_deref().unwrap_or(NO_SOURCE),
            self.message
        )
    }
}

/// One alert in flight from an agent to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertDatagram {
    pub hostname: String,
    pub id: String,
    /// Unix timestamp (seconds) of the moment the alert was queued
    pub created_at: i64,
    /// Rendered [`Alert`] (`tags%%source%%message`)
    pub text: String,
}

impl AlertDatagram {
    /// Everything after the command token, as recorded in the event stream.
    pub fn payload(&self) -> String {
        [
            self.hostname.as_str(),
            self.id.as_str(),
            &self.created_at.to_string(),
            self.text.as_str(),
        ]
        .join(SEPARATOR)
    }
}

/// A message together with the address it has to be sent to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub message: Message,
}

impl Outbound {
    pub fn new(to: SocketAddr, message: Message) -> Self {
        Self { to, message }
    }
}

/// Sends every outbound message, logging (not propagating) failures.
pub async fn send_all(socket: &UdpSocket, outbound: Vec<Outbound>) {
    for Outbound { to, message } in outbound {
        trace!("sending {} to {to}", message.command());
        if let Err(e) = socket.send_to(message.encode().as_bytes(), to).await {
            warn!("failed to send {} to {to}: {e}", message.command());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `SRVHB`: server heartbeat carrying the server's hostname
    ServerHeartbeat { hostname: String },
    /// `CONFREQ`: agent asks for its configuration
    ConfigRequest { hostname: String },
    /// `CONFIG`: configuration lines for the requesting agent
    Config { lines: Vec<String> },
    /// `RESET`: the named agent must drop its configuration
    Reset { hostname: String },
    /// `ALERT`: one queued alert
    Alert(AlertDatagram),
    /// `ACK`: acknowledges the alert with the given id
    Ack { id: String },
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::ServerHeartbeat { .. } => "SRVHB",
            Message::ConfigRequest { .. } => "CONFREQ",
            Message::Config { .. } => "CONFIG",
            Message::Reset { .. } => "RESET",
            Message::Alert(_) => "ALERT",
            Message::Ack { .. } => "ACK",
        }
    }

    pub fn encode(&self) -> String {
        let payload = match self {
            Message::ServerHeartbeat { hostname }
            | Message::ConfigRequest { hostname }
            | Message::Reset { hostname } => hostname.clone(),
            Message::Config { lines } => std::iter::once(CONFIG_START)
                .chain(lines.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(SEPARATOR),
            Message::Alert(alert) => alert.payload(),
            Message::Ack { id } => id.clone(),
        };

        format!("{}{SEPARATOR}{payload}", self.command())
    }

    pub fn decode(datagram: &[u8]) -> ProtocolResult<Message> {
        let text = std::str::from_utf8(datagram).map_err(|_| ProtocolError::NotText)?;

        let Some((command, payload)) = text.split_once(SEPARATOR) else {
            return Err(ProtocolError::Malformed(text.to_string()));
        };

        if command.is_empty()
            || !command.chars().all(|c| c.is_ascii_uppercase())
            || payload.is_empty()
        {
            return Err(ProtocolError::Malformed(text.to_string()));
        }

        let message = match command {
            "SRVHB" => Message::ServerHeartbeat {
                hostname: payload.to_string(),
            },
            "CONFREQ" => Message::ConfigRequest {
                hostname: payload.to_string(),
            },
            "RESET" => Message::Reset {
                hostname: payload.to_string(),
            },
            "ACK" => Message::Ack {
                id: payload.to_string(),
            },
            "CONFIG" => {
                let mut fields = payload.split(SEPARATOR);
                if fields.next() != Some(CONFIG_START) {
                    return Err(ProtocolError::MissingField {
                        command: "CONFIG",
                        field: CONFIG_START,
                    });
                }
                Message::Config {
                    lines: fields.map(str::to_string).collect(),
                }
            }
            "ALERT" => Message::Alert(decode_alert(payload)?),
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };

        Ok(message)
    }
}

fn decode_alert(payload: &str) -> ProtocolResult<AlertDatagram> {
    let mut fields = payload.splitn(4, SEPARATOR);
    let mut next = |field: &'static str| {
        fields.next().ok_or(ProtocolError::MissingField {
            command: "ALERT",
            field,
        })
    };

    let hostname = next("hostname")?.to_string();
    let id = next("id")?.to_string();
    let created_at = next("created_at")?;
    let text = next("text")?.to_string();

    Ok(AlertDatagram {
        hostname,
        id,
        // agents always send integers; a garbled timestamp must not lose the alert
        created_at: created_at.parse().unwrap_or_default(),
        text,
    })
}
