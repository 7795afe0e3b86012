//! Command probes - run a command and alert on fields extracted from its output
//!
//! Each probe owns an extraction pattern; every output line it matches is handed to all
//! rules attached to the probe. A rule first compares one capture group against a literal
//! and then either checks a numeric limit or reports a capture group verbatim.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use regex::{Captures, Regex};
use tokio::process::Command;
use tracing::{debug, info, instrument, trace, warn};

use crate::protocol::Alert;
use crate::window::ActivityWindow;

/// Default seconds between two probe runs
pub const DEFAULT_CHECK_INTERVAL_SECS: i64 = 60;

/// Runs external commands for process listings and probes
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `argv` and returns its standard output.
    async fn run(&self, argv: &[String]) -> Result<String>;
}

/// Runs commands as child processes with an upper bound on their runtime
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    #[instrument(skip(self))]
    async fn run(&self, argv: &[String]) -> Result<String> {
        let Some((program, args)) = argv.split_first() else {
            bail!("empty command");
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .with_context(|| format!("{program} did not finish within {:?}", self.timeout))?
            .with_context(|| format!("failed to run {program}"))?;

        if !output.status.success() {
            bail!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        trace!("{program} produced {} bytes", output.stdout.len());
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Runs `argv` and logs failures, yielding empty output for the cycle.
pub async fn run_or_empty<R: CommandRunner + ?Sized>(runner: &R, argv: &[String]) -> String {
    match runner.run(argv).await {
        Ok(output) => output,
        Err(e) => {
            warn!("command {argv:?} failed: {e:#}");
            String::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandRuleKind {
    /// Fire when the limit group is above `limit`
    UpperLimit {
        group: usize,
        limit: f64,
        message: String,
    },
    /// Fire when the limit group is below `limit`
    LowerLimit {
        group: usize,
        limit: f64,
        message: String,
    },
    /// Report the value of `group` every time
    Metric { group: usize },
}

#[derive(Debug, Clone)]
pub struct CommandRule {
    pub tags: String,
    pub match_group: usize,
    pub match_value: String,
    pub kind: CommandRuleKind,
    pub window: ActivityWindow,
}

impl CommandRule {
    fn evaluate(&self, captures: &Captures<'_>) -> Option<Alert> {
        let selected = captures.get(self.match_group)?.as_str();
        if selected != self.match_value {
            return None;
        }

        let number = |group: usize| -> Option<f64> {
            let raw = captures.get(group)?.as_str();
            raw.trim()
                .parse()
                .inspect_err(|_| debug!("'{raw}' in group {group} is not a number"))
                .ok()
        };

        let payload = match &self.kind {
            CommandRuleKind::UpperLimit {
                group,
                limit,
                message,
            } => (number(*group)? > *limit).then(|| message.clone())?,
            CommandRuleKind::LowerLimit {
                group,
                limit,
                message,
            } => (number(*group)? < *limit).then(|| message.clone())?,
            CommandRuleKind::Metric { group } => captures.get(*group)?.as_str().to_string(),
        };

        Some(Alert::new(self.tags.clone(), None, payload))
    }
}

#[derive(Debug, Clone)]
pub struct CommandProbe {
    pub command: Vec<String>,
    pub extract: Regex,
    pub rules: Vec<CommandRule>,
}

impl CommandProbe {
    pub fn new(command: Vec<String>, extract: Regex) -> Self {
        info!("running command {command:?} (extract: {extract})");
        Self {
            command,
            extract,
            rules: Vec::new(),
        }
    }

    /// Evaluates every attached rule against every output line the pattern matches.
    pub fn evaluate(&self, output: &str, now: DateTime<Utc>) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for line in output.lines() {
            let Some(captures) = self.extract.captures(line) else {
                continue;
            };

            alerts.extend(
                self.rules
                    .iter()
                    .filter(|rule| rule.window.is_active(&now))
                    .filter_map(|rule| rule.evaluate(&captures)),
            );
        }

        alerts
    }
}

/// Tracks when the probes run next
#[derive(Debug)]
pub struct ProbeSchedule {
    interval: TimeDelta,
    next_check: DateTime<Utc>,
}

impl ProbeSchedule {
    pub fn new(interval: TimeDelta, now: DateTime<Utc>) -> Self {
        Self {
            interval,
            next_check: now + interval,
        }
    }

    /// Returns `true` once per interval and schedules the next run.
    pub fn is_due(&mut self, now: DateTime<Utc>) -> bool {
        if now <= self.next_check {
            return false;
        }

        self.next_check = now + self.interval;
        true
    }
}
