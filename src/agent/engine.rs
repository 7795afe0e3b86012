//! Agent protocol engine
//!
//! ## States
//!
//! ```text
//! NO_SERVER ── first SRVHB ──▶ SERVER_SELECTED ── CONFIG ──▶ CONFIGURED
//!     ▲                            │     ▲                     │
//!     └──── no SRVHB for 30s ──────┘     └─────── RESET ───────┘
//! ```
//!
//! The engine owns every piece of mutable agent state (server selection, alert queue,
//! monitors). [`AgentEngine::handle`] applies one received datagram and
//! [`AgentEngine::tick`] runs the housekeeping of one loop iteration, returning the
//! datagrams to send. [`AgentEngine::run`] ties both to a UDP socket.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::net::UdpSocket;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, trace, warn};

use super::command::{self, CommandProbe, CommandRunner, ProbeSchedule};
use super::directives::AgentConfig;
use super::file_consumer::FileConsumer;
use super::process::{self, ProcessWatcher};
use super::queue::{AlertQueue, DEFAULT_CAPACITY};
use crate::protocol::{Alert, MAX_DATAGRAM, Message, Outbound, send_all};
use crate::util;

/// Seconds without a heartbeat after which the selected server is dropped
pub const SERVER_TIMEOUT_SECS: i64 = 30;

/// Seconds between two configuration requests
pub const CONFIG_RETRY_SECS: i64 = 10;

/// Idle alerts are only queued while the queue is shorter than this
const IDLE_QUEUE_LIMIT: usize = 3;

/// Slack added to two process intervals before the all-clear goes out
const ALL_CLEAR_GRACE_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Port the agent listens on; the server listens on `port + 1`
    pub port: u16,
    pub hostname: String,
    pub idle_time: TimeDelta,
    pub queue_capacity: usize,
    pub process_interval: TimeDelta,
    pub probe_interval: TimeDelta,
}

impl AgentSettings {
    pub fn new(port: u16, hostname: impl Into<String>) -> Self {
        Self {
            port,
            hostname: hostname.into(),
            idle_time: util::get_idle_time(),
            queue_capacity: DEFAULT_CAPACITY,
            process_interval: TimeDelta::seconds(process::DEFAULT_CHECK_INTERVAL_SECS),
            probe_interval: TimeDelta::seconds(command::DEFAULT_CHECK_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    NoServer,
    ServerSelected,
    Configured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedServer {
    pub name: String,
    /// Where configuration requests and alerts go (`sender ip`, `port + 1`)
    pub addr: SocketAddr,
    pub last_seen: DateTime<Utc>,
}

/// Monitoring engines built from the latest configuration
#[derive(Default)]
pub struct Monitors {
    pub files: Vec<FileConsumer>,
    pub processes: ProcessWatcher,
    pub probes: Vec<CommandProbe>,
}

impl Monitors {
    fn build(config: AgentConfig, settings: &AgentSettings, now: DateTime<Utc>) -> Self {
        Self {
            files: config
                .files
                .into_iter()
                .map(|rule| FileConsumer::new(rule, now))
                .collect(),
            processes: ProcessWatcher::new(config.ps_command, config.processes)
                .with_interval(settings.process_interval),
            probes: config.probes,
        }
    }

    /// Releases file handles before the monitors are dropped.
    fn close(&mut self) {
        for consumer in &mut self.files {
            consumer.close();
        }
    }
}

pub struct AgentEngine<R> {
    settings: AgentSettings,
    runner: R,
    server: Option<SelectedServer>,
    configured: bool,
    next_config_request: DateTime<Utc>,
    /// Last time something was sent to the server
    last_update: DateTime<Utc>,
    queue: AlertQueue,
    monitors: Monitors,
    probe_schedule: ProbeSchedule,
    /// Last process alert, kept across reconfiguration
    last_process_event: Option<DateTime<Utc>>,
}

impl<R: CommandRunner> AgentEngine<R> {
    pub fn new(settings: AgentSettings, runner: R, now: DateTime<Utc>) -> Self {
        Self {
            queue: AlertQueue::new(settings.queue_capacity),
            probe_schedule: ProbeSchedule::new(settings.probe_interval, now),
            settings,
            runner,
            server: None,
            configured: false,
            next_config_request: now,
            last_update: now,
            monitors: Monitors::default(),
            last_process_event: None,
        }
    }

    pub fn state(&self) -> AgentState {
        match (&self.server, self.configured) {
            (None, _) => AgentState::NoServer,
            (Some(_), false) => AgentState::ServerSelected,
            (Some(_), true) => AgentState::Configured,
        }
    }

    pub fn server(&self) -> Option<&SelectedServer> {
        self.server.as_ref()
    }

    pub fn queue(&self) -> &AlertQueue {
        &self.queue
    }

    pub fn monitors(&self) -> &Monitors {
        &self.monitors
    }

    /// Queues an alert produced outside the monitors.
    pub fn enqueue(&mut self, alert: &Alert, now: DateTime<Utc>) -> bool {
        self.queue.enqueue(alert, now)
    }

    /// Applies one datagram received from `from`.
    pub fn handle(&mut self, message: Message, from: SocketAddr, now: DateTime<Utc>) {
        trace!("received {} from {from}", message.command());

        match message {
            Message::ServerHeartbeat { hostname } => self.heartbeat(hostname, from, now),
            Message::Config { lines } => {
                if self.server.is_none() {
                    debug!("ignoring configuration while no server is selected");
                    return;
                }
                self.configure(&lines, now);
            }
            Message::Reset { hostname } => {
                if hostname != self.settings.hostname {
                    trace!("ignoring reset for {hostname}");
                    return;
                }
                info!("reset requested by server");
                self.unconfigure();
                self.next_config_request = now + TimeDelta::seconds(CONFIG_RETRY_SECS);
            }
            Message::Ack { id } => {
                self.queue.acknowledge(&id);
            }
            other => debug!("ignoring {} datagram meant for a server", other.command()),
        }
    }

    fn heartbeat(&mut self, hostname: String, from: SocketAddr, now: DateTime<Utc>) {
        if let Some(server) = &mut self.server {
            if server.name == hostname {
                server.last_seen = now;
            } else {
                trace!("ignoring heartbeat from {hostname}, using {}", server.name);
            }
            return;
        }

        let addr = SocketAddr::new(from.ip(), self.settings.port + 1);
        info!("selected server {hostname} ({addr})");
        self.server = Some(SelectedServer {
            name: hostname,
            addr,
            last_seen: now,
        });
    }

    fn configure(&mut self, lines: &[String], now: DateTime<Utc>) {
        info!("configuration received ({} lines)", lines.len());
        self.monitors.close();

        let config = AgentConfig::parse(lines.iter().map(String::as_str));
        self.monitors = Monitors::build(config, &self.settings, now);
        self.configured = true;

        info!(
            "monitoring {} files, {} processes, {} commands",
            self.monitors.files.len(),
            self.monitors.processes.rules().len(),
            self.monitors.probes.len()
        );
    }

    fn unconfigure(&mut self) {
        if self.configured {
            info!("unconfiguring");
        }
        self.monitors.close();
        self.monitors = Monitors::default();
        self.configured = false;
    }

    /// Runs the housekeeping of one loop iteration and returns what has to be sent.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut outbound = Vec::new();

        if let Some(server) = &self.server
            && now > server.last_seen + TimeDelta::seconds(SERVER_TIMEOUT_SECS)
        {
            warn!("deselected server {} (no heartbeat)", server.name);
            self.server = None;
            self.unconfigure();
        }

        if let Some(server) = &self.server
            && !self.configured
            && now >= self.next_config_request
        {
            info!("requesting configuration from {}", server.addr);
            outbound.push(Outbound::new(
                server.addr,
                Message::ConfigRequest {
                    hostname: self.settings.hostname.clone(),
                },
            ));
            self.next_config_request = now + TimeDelta::seconds(CONFIG_RETRY_SECS);
            self.last_update = now;
        }

        if self.state() == AgentState::Configured
            && now > self.last_update + self.settings.idle_time
            && self.queue.len() < IDLE_QUEUE_LIMIT
        {
            self.queue.enqueue(&Alert::system("Idle"), now);
            self.last_update = now;
        }

        self.poll_monitors(now).await;

        if let Some(server) = &self.server
            && let Some(alert) = self.queue.due(&self.settings.hostname, now)
        {
            outbound.push(Outbound::new(server.addr, Message::Alert(alert)));
            self.last_update = now;
        }

        outbound
    }

    async fn poll_monitors(&mut self, now: DateTime<Utc>) {
        let mut alerts = Vec::new();

        for consumer in &mut self.monitors.files {
            alerts.extend(consumer.poll(now));
        }

        if self.monitors.processes.is_due(now) {
            let listing =
                command::run_or_empty(&self.runner, self.monitors.processes.command()).await;
            let fired = self.monitors.processes.evaluate(&listing, now);
            if !fired.is_empty() {
                self.last_process_event = Some(now);
            }
            alerts.extend(fired);
        }

        if self.probe_schedule.is_due(now) {
            for probe in &self.monitors.probes {
                let output = command::run_or_empty(&self.runner, &probe.command).await;
                alerts.extend(probe.evaluate(&output, now));
            }
        }

        alerts.extend(self.process_all_clear(now));

        for alert in &alerts {
            self.queue.enqueue(alert, now);
        }
    }

    /// Emits a single all-clear once no process rule has alerted for two check
    /// intervals plus 30s.
    fn process_all_clear(&mut self, now: DateTime<Utc>) -> Option<Alert> {
        let last_event = self.last_process_event?;
        let quiet = self.settings.process_interval * 2 + TimeDelta::seconds(ALL_CLEAR_GRACE_SECS);

        if now <= last_event + quiet {
            return None;
        }

        info!("process checks are clear again");
        self.last_process_event = None;
        Some(Alert::system("Process check: All clear"))
    }

    /// Serves the agent side of the protocol on `socket` until the process exits.
    #[instrument(skip_all, fields(host = %self.settings.hostname))]
    pub async fn run(mut self, socket: UdpSocket) {
        info!(
            "listening on port {}, server port {}",
            self.settings.port,
            self.settings.port + 1
        );

        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::select! {
                received = socket.recv_from(&mut buffer) => Some(received),
                _ = ticker.tick() => None,
            };

            match received {
                Some(Ok((len, from))) => match Message::decode(&buffer[..len]) {
                    Ok(message) => self.handle(message, from, Utc::now()),
                    Err(e) => debug!("dropping datagram from {from}: {e}"),
                },
                Some(Err(e)) => warn!("failed to receive datagram: {e}"),
                None => {}
            }

            let outbound = self.tick(Utc::now()).await;
            send_all(&socket, outbound).await;
        }
    }
}
