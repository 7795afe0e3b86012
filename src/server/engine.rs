//! Server protocol engine
//!
//! ```text
//!             every 5s                       every 10s
//!   SRVHB ──▶ broadcast:port      scan hosts ──▶ RESET for changed files
//!                                            └─▶ "Host is inactive" events
//!
//!   CONFREQ ──▶ assemble host file + includes ──▶ CONFIG to sender:port
//!   ALERT   ──▶ event stream, host last seen  ──▶ ACK to sender:port
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::net::UdpSocket;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use super::events::EventStream;
use super::hosts::HostTable;
use crate::config::ServerConfig;
use crate::protocol::{MAX_DATAGRAM, Message, Outbound, send_all};

/// Seconds between two server heartbeats
pub const HEARTBEAT_INTERVAL_SECS: i64 = 5;

/// Seconds between two scans of the hosts directory
pub const SCAN_INTERVAL_SECS: i64 = 10;

pub struct ServerEngine {
    hostname: String,
    /// Port agents listen on
    agent_port: u16,
    broadcast: SocketAddr,
    hosts: HostTable,
    events: EventStream,
    next_heartbeat: DateTime<Utc>,
    next_scan: DateTime<Utc>,
}

impl ServerEngine {
    pub fn new(config: &ServerConfig, hostname: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            hostname: hostname.into(),
            agent_port: config.port,
            broadcast: SocketAddr::new(config.broadcast, config.port),
            hosts: HostTable::new(&config.hosts, &config.includes),
            events: EventStream::new(
                &config.event_stream,
                config.event_stream_max_bytes,
                config.event_stream_backups,
            ),
            next_heartbeat: now + TimeDelta::seconds(HEARTBEAT_INTERVAL_SECS),
            next_scan: now + TimeDelta::seconds(SCAN_INTERVAL_SECS),
        }
    }

    pub fn hosts(&self) -> &HostTable {
        &self.hosts
    }

    /// Applies one datagram received from `from` and returns the replies.
    pub fn handle(&mut self, message: Message, from: SocketAddr, now: DateTime<Utc>) -> Vec<Outbound> {
        let reply_to = SocketAddr::new(from.ip(), self.agent_port);

        match message {
            Message::ConfigRequest { hostname } => {
                info!("configuration request from {hostname} ({from})");
                match self.hosts.assemble_config(&hostname) {
                    Ok(lines) => {
                        info!("sending configuration for {hostname} to {reply_to}");
                        vec![Outbound::new(reply_to, Message::Config { lines })]
                    }
                    Err(e) => {
                        warn!("unable to return configuration for {hostname}: {e:#}");
                        Vec::new()
                    }
                }
            }
            Message::Alert(alert) => {
                trace!("alert {} from {}", alert.id, alert.hostname);
                if let Err(e) = self.events.record_alert(&alert, now) {
                    error!("failed to record alert {}: {e:#}", alert.id);
                }
                self.hosts.mark_seen(&alert.hostname, now);
                vec![Outbound::new(reply_to, Message::Ack { id: alert.id })]
            }
            other => {
                debug!("ignoring {} from {from}", other.command());
                Vec::new()
            }
        }
    }

    /// Sends heartbeats and rescans the hosts directory when due.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut outbound = Vec::new();

        if now > self.next_heartbeat {
            outbound.push(Outbound::new(
                self.broadcast,
                Message::ServerHeartbeat {
                    hostname: self.hostname.clone(),
                },
            ));
            self.next_heartbeat = now + TimeDelta::seconds(HEARTBEAT_INTERVAL_SECS);
        }

        if now > self.next_scan {
            self.next_scan = now + TimeDelta::seconds(SCAN_INTERVAL_SECS);
            outbound.extend(self.scan(now));
        }

        outbound
    }

    fn scan(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        let report = match self.hosts.scan(now) {
            Ok(report) => report,
            Err(e) => {
                warn!("host scan failed: {e:#}");
                return Vec::new();
            }
        };

        for hostname in &report.inactive {
            debug!("{hostname} is inactive");
            if let Err(e) = self.events.record_inactive(hostname, now) {
                error!("failed to record inactivity of {hostname}: {e:#}");
            }
        }

        report
            .changed
            .into_iter()
            .map(|hostname| {
                info!("resetting {hostname}");
                Outbound::new(self.broadcast, Message::Reset { hostname })
            })
            .collect()
    }

    /// Serves the server side of the protocol on `socket` until the process exits.
    #[instrument(skip_all, fields(host = %self.hostname))]
    pub async fn run(mut self, socket: UdpSocket) {
        info!(
            "broadcasting to {}, agent channel on port {}",
            self.broadcast,
            self.agent_port + 1
        );
        info!("event stream is {}", self.events.path().display());

        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::select! {
                received = socket.recv_from(&mut buffer) => Some(received),
                _ = ticker.tick() => None,
            };

            let mut outbound = match received {
                Some(Ok((len, from))) => match Message::decode(&buffer[..len]) {
                    Ok(message) => self.handle(message, from, Utc::now()),
                    Err(e) => {
                        debug!("dropping datagram from {from}: {e}");
                        Vec::new()
                    }
                },
                Some(Err(e)) => {
                    warn!("failed to receive datagram: {e}");
                    Vec::new()
                }
                None => Vec::new(),
            };

            outbound.extend(self.tick(Utc::now()));
            send_all(&socket, outbound).await;
        }
    }
}
