//! File consumer - tails one log file for one rule
//!
//! ## State machine
//!
//! ```text
//! CLOSED ── open ok ──▶ OPEN ── read lines ──▶ no more data ─┬─ same file ──▶ stay OPEN
//!   ▲                                                       │
//!   └──────────────── identity changed / truncated ─────────┘
//! ```
//!
//! The very first open seeks to the end of the file so an agent does not replay old
//! history on startup. Every reopen after a rotation starts at offset 0.

use std::fs::{File, Metadata};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use tracing::{debug, info, trace, warn};

use crate::protocol::Alert;
use crate::window::ActivityWindow;

/// What a rule does with matching lines
#[derive(Debug, Clone, PartialEq)]
pub enum FileAction {
    /// Alert on every match, with a fixed message or the matched line itself
    EveryMatch { message: Option<String> },
    /// Count matches and report once per period
    Periodic {
        period: TimeDelta,
        report: PeriodicReport,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodicReport {
    /// Alert when more than `threshold` matches were seen in the period
    Threshold { threshold: u64, message: String },
    /// Alert when nothing matched in the period
    Inactive { message: String },
    /// Report the raw number of matches
    Count,
}

/// One configured file monitoring directive
#[derive(Debug, Clone)]
pub struct FileRule {
    pub path: PathBuf,
    pub patterns: Vec<Regex>,
    pub tags: String,
    pub action: FileAction,
    pub window: ActivityWindow,
}

/// Device and inode of a file, used to notice that a path now names a different file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    device: u64,
    inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            device: metadata.dev(),
            inode: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(metadata: &Metadata) -> Self {
        let created = metadata
            .created()
            .ok()
            .and_then(|at| at.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|since| since.as_nanos() as u64)
            .unwrap_or_default();

        Self {
            device: 0,
            inode: created,
        }
    }
}

struct OpenFile {
    reader: BufReader<File>,
    identity: FileIdentity,
    /// Offset of the first byte not yet handed out as a line
    position: u64,
}

enum ReadStep {
    Line(String),
    /// Nothing new in the same file
    Idle,
    /// The path now names another file, or the file shrank below the cursor
    Rotated,
}

impl OpenFile {
    fn open(path: &Path, from_end: bool) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let identity = FileIdentity::of(&file.metadata()?);
        let position = if from_end {
            file.seek(SeekFrom::End(0))?
        } else {
            0
        };

        Ok(Self {
            reader: BufReader::new(file),
            identity,
            position,
        })
    }

    fn next_line(&mut self, path: &Path) -> io::Result<ReadStep> {
        let mut buffer = Vec::new();
        let read = self.reader.read_until(b'\n', &mut buffer)?;

        if read > 0 && buffer.ends_with(b"\n") {
            self.position += read as u64;
            return Ok(ReadStep::Line(
                String::from_utf8_lossy(&buffer).into_owned(),
            ));
        }

        if read > 0 {
            // incomplete last line, pick it up again once the writer finishes it
            self.reader.seek(SeekFrom::Start(self.position))?;
        }

        let metadata = std::fs::metadata(path)?;
        if FileIdentity::of(&metadata) != self.identity || metadata.len() < self.position {
            return Ok(ReadStep::Rotated);
        }

        Ok(ReadStep::Idle)
    }
}

pub struct FileConsumer {
    rule: FileRule,
    file: Option<OpenFile>,
    opened_before: bool,
    count: u64,
    next_report: DateTime<Utc>,
}

impl FileConsumer {
    pub fn new(rule: FileRule, now: DateTime<Utc>) -> Self {
        info!(
            "creating file consumer for {} ({} patterns, {:?})",
            rule.path.display(),
            rule.patterns.len(),
            rule.action
        );

        let next_report = match &rule.action {
            FileAction::Periodic { period, .. } => now + *period,
            FileAction::EveryMatch { .. } => now,
        };

        Self {
            rule,
            file: None,
            opened_before: false,
            count: 0,
            next_report,
        }
    }

    pub fn rule(&self) -> &FileRule {
        &self.rule
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Releases the file handle. Called when the configuration is torn down.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            info!("removing file consumer for {}", self.rule.path.display());
        }
    }

    /// Runs one polling cycle and returns the alerts it produced.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut alerts = Vec::new();

        if !self.rule.window.is_active(&now) {
            trace!("{}: outside activity window", self.rule.path.display());
            return alerts;
        }

        self.check_period(now, &mut alerts);

        loop {
            let step = match self.file.as_mut() {
                Some(file) => file.next_line(&self.rule.path),
                None => match OpenFile::open(&self.rule.path, !self.opened_before) {
                    Ok(file) => {
                        debug!(
                            "opened {} at offset {}",
                            self.rule.path.display(),
                            file.position
                        );
                        self.file = Some(file);
                        self.opened_before = true;
                        continue;
                    }
                    Err(e) => Err(e),
                },
            };

            match step {
                Ok(ReadStep::Line(line)) => self.match_line(&line, &mut alerts),
                Ok(ReadStep::Idle) => break,
                Ok(ReadStep::Rotated) => {
                    info!("{} was rotated, reopening", self.rule.path.display());
                    self.file = None;
                }
                Err(e) => {
                    warn!("unable to read {}: {e}", self.rule.path.display());
                    break;
                }
            }
        }

        alerts
    }

    fn match_line(&mut self, line: &str, alerts: &mut Vec<Alert>) {
        for pattern in &self.rule.patterns {
            if !pattern.is_match(line) {
                continue;
            }

            match &self.rule.action {
                FileAction::Periodic { .. } => self.count += 1,
                FileAction::EveryMatch { message } => {
                    let payload = message.as_deref().unwrap_or_else(|| line.trim());
                    alerts.push(self.alert(payload));
                }
            }
        }
    }

    fn check_period(&mut self, now: DateTime<Utc>, alerts: &mut Vec<Alert>) {
        let FileAction::Periodic { period, report } = &self.rule.action else {
            return;
        };

        if now <= self.next_report {
            return;
        }

        let payload = match report {
            PeriodicReport::Threshold { threshold, message } if self.count > *threshold => {
                Some(message.clone())
            }
            PeriodicReport::Inactive { message } if self.count == 0 => Some(message.clone()),
            PeriodicReport::Count => Some(self.count.to_string()),
            _ => None,
        };

        debug!(
            "{}: {} matches in period",
            self.rule.path.display(),
            self.count
        );

        self.next_report = now + *period;
        self.count = 0;

        if let Some(payload) = payload {
            alerts.push(self.alert(&payload));
        }
    }

    fn alert(&self, payload: &str) -> Alert {
        Alert::new(
            self.rule.tags.clone(),
            Some(self.rule.path.display().to_string()),
            payload,
        )
    }
}
