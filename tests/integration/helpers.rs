//! Test fixture wiring a ServerEngine and an AgentEngine together without sockets.
//! Every datagram is encoded and decoded on its way, like on the wire.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use hostwatch::agent::command::CommandRunner;
use hostwatch::agent::{AgentEngine, AgentSettings, AgentState};
use hostwatch::config::ServerConfig;
use hostwatch::protocol::{Message, Outbound};
use hostwatch::server::ServerEngine;
use tempfile::TempDir;

pub const PORT: u16 = 5000;
pub const HOSTNAME: &str = "web01";

pub fn server_socket() -> SocketAddr {
    "10.0.0.1:5001".parse().unwrap()
}

pub fn agent_socket() -> SocketAddr {
    "10.0.0.2:5000".parse().unwrap()
}

pub fn broadcast() -> SocketAddr {
    "10.0.0.255:5000".parse().unwrap()
}

pub fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Answers commands by program name
#[derive(Default)]
pub struct CannedRunner {
    pub outputs: HashMap<String, String>,
}

#[async_trait]
impl CommandRunner for CannedRunner {
    async fn run(&self, argv: &[String]) -> Result<String> {
        match argv.first().and_then(|program| self.outputs.get(program)) {
            Some(output) => Ok(output.clone()),
            None => bail!("unknown command {argv:?}"),
        }
    }
}

/// Datagrams seen during one [`Fabric::step`]
#[derive(Debug, Default)]
pub struct Traffic {
    pub to_agent: Vec<Message>,
    pub to_server: Vec<Message>,
}

impl Traffic {
    pub fn commands_to_agent(&self) -> Vec<&'static str> {
        self.to_agent.iter().map(Message::command).collect()
    }

    pub fn commands_to_server(&self) -> Vec<&'static str> {
        self.to_server.iter().map(Message::command).collect()
    }
}

pub struct Fabric {
    pub root: TempDir,
    pub server: ServerEngine,
    pub agent: AgentEngine<CannedRunner>,
    pub now: DateTime<Utc>,
    /// Drop every datagram the server sends to the agent
    pub lose_replies: bool,
}

impl Fabric {
    pub fn new(host_config: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("hosts")).unwrap();
        fs::create_dir(root.path().join("includes")).unwrap();

        let content = format!(
            "port: {PORT}\nbroadcast: 10.0.0.255\nhosts: {}\nincludes: {}\nevent_stream: {}\n",
            root.path().join("hosts").display(),
            root.path().join("includes").display(),
            root.path().join("events.log").display(),
        );
        let config = ServerConfig::parse(&content).unwrap();

        let fabric = Self {
            server: ServerEngine::new(&config, "hub", start()),
            agent: AgentEngine::new(
                AgentSettings::new(PORT, HOSTNAME),
                CannedRunner::default(),
                start(),
            ),
            root,
            now: start(),
            lose_replies: false,
        };
        fabric.write_host_config(host_config);
        fabric
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    pub fn host_config_path(&self) -> PathBuf {
        self.path("hosts").join(HOSTNAME)
    }

    /// Rewrites the host file and moves its modification time forward.
    pub fn write_host_config(&self, content: &str) {
        let path = self.host_config_path();
        let previous = fs::metadata(&path).and_then(|meta| meta.modified()).ok();
        fs::write(&path, content).unwrap();

        if let Some(previous) = previous {
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(previous + Duration::from_secs(60))
                .unwrap();
        }
    }

    pub fn events(&self) -> String {
        fs::read_to_string(self.path("events.log")).unwrap_or_default()
    }

    /// Advances the clock by one second and runs one iteration of both loops.
    pub async fn step(&mut self) -> Traffic {
        self.now += TimeDelta::seconds(1);
        let mut traffic = Traffic::default();

        let from_server = self.server.tick(self.now);
        self.to_agent(from_server, &mut traffic);

        let from_agent = self.agent.tick(self.now).await;
        for Outbound { to, message } in from_agent {
            assert_eq!(to, server_socket());
            let message = wire(&message);
            traffic.to_server.push(message.clone());

            let replies = self.server.handle(message, agent_socket(), self.now);
            self.to_agent(replies, &mut traffic);
        }

        traffic
    }

    fn to_agent(&mut self, outbound: Vec<Outbound>, traffic: &mut Traffic) {
        for Outbound { to, message } in outbound {
            assert!(to == agent_socket() || to == broadcast(), "unexpected target {to}");
            if self.lose_replies && to == agent_socket() {
                continue;
            }

            let message = wire(&message);
            traffic.to_agent.push(message.clone());
            self.agent.handle(message, server_socket(), self.now);
        }
    }

    /// Steps until the agent is configured, returning the number of steps taken.
    pub async fn until_configured(&mut self, limit: usize) -> usize {
        for steps in 1..=limit {
            self.step().await;
            if self.agent.state() == AgentState::Configured {
                return steps;
            }
        }
        panic!("agent not configured after {limit} steps");
    }
}

/// Sends `message` through the codec.
pub fn wire(message: &Message) -> Message {
    Message::decode(message.encode().as_bytes()).unwrap()
}
