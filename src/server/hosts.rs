//! Host table - per-agent configuration files and liveness
//!
//! Every file in the hosts directory is one agent; its name is the agent's hostname.
//! The table remembers each file's modification time so a rescan can tell which agents
//! have to be reset, and when each agent last delivered an alert.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

/// Seconds without an alert after which a host counts as inactive
pub const MAX_IDLE_SECS: i64 = 180;

static INCLUDE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^include:\s+(\S+)\s*$").expect("valid include pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub hostname: String,
    /// Last alert received from the host, `None` if it never reported
    pub last_seen: Option<DateTime<Utc>>,
    pub config_mtime: SystemTime,
}

impl HostRecord {
    pub fn is_inactive(&self, now: DateTime<Utc>) -> bool {
        self.last_seen
            .is_none_or(|seen| now - seen > TimeDelta::seconds(MAX_IDLE_SECS))
    }
}

/// Outcome of one pass over the hosts directory
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub added: Vec<String>,
    /// Hosts whose configuration file changed since the previous scan
    pub changed: Vec<String>,
    pub inactive: Vec<String>,
}

#[derive(Debug)]
pub struct HostTable {
    hosts_dir: PathBuf,
    includes_dir: PathBuf,
    records: BTreeMap<String, HostRecord>,
}

impl HostTable {
    pub fn new(hosts_dir: impl Into<PathBuf>, includes_dir: impl Into<PathBuf>) -> Self {
        Self {
            hosts_dir: hosts_dir.into(),
            includes_dir: includes_dir.into(),
            records: BTreeMap::new(),
        }
    }

    pub fn get(&self, hostname: &str) -> Option<&HostRecord> {
        self.records.get(hostname)
    }

    /// Records that `hostname` reported. Unknown hosts are ignored.
    pub fn mark_seen(&mut self, hostname: &str, now: DateTime<Utc>) -> bool {
        match self.records.get_mut(hostname) {
            Some(record) => {
                record.last_seen = Some(now);
                true
            }
            None => {
                debug!("alert from unknown host {hostname}");
                false
            }
        }
    }

    /// Rescans the hosts directory. Records are never removed, so a host whose file
    /// disappeared keeps being reported as inactive.
    pub fn scan(&mut self, now: DateTime<Utc>) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        let entries = fs::read_dir(&self.hosts_dir)
            .with_context(|| format!("failed to list {}", self.hosts_dir.display()))?;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("failed to read entry of {}: {e}", self.hosts_dir.display());
                    continue;
                }
            };

            let Some(hostname) = entry.file_name().to_str().map(str::to_string) else {
                warn!("skipping non UTF-8 host file {:?}", entry.file_name());
                continue;
            };

            let mtime = match fs::metadata(entry.path()).and_then(|meta| {
                if meta.is_file() {
                    meta.modified().map(Some)
                } else {
                    Ok(None)
                }
            }) {
                Ok(Some(mtime)) => mtime,
                Ok(None) => continue,
                Err(e) => {
                    warn!("failed to stat host file {hostname}: {e}");
                    continue;
                }
            };

            match self.records.get_mut(&hostname) {
                None => {
                    info!("new host configuration: {hostname}");
                    self.records.insert(
                        hostname.clone(),
                        HostRecord {
                            hostname: hostname.clone(),
                            last_seen: None,
                            config_mtime: mtime,
                        },
                    );
                    report.added.push(hostname);
                }
                Some(record) if record.config_mtime != mtime => {
                    info!("host configuration {hostname} has been updated");
                    record.config_mtime = mtime;
                    report.changed.push(hostname);
                }
                Some(_) => {}
            }
        }

        report.inactive = self
            .records
            .values()
            .filter(|record| record.is_inactive(now))
            .map(|record| record.hostname.clone())
            .collect();

        Ok(report)
    }

    /// Builds the configuration lines for `hostname`, expanding `include:` lines.
    /// Every line is trimmed.
    pub fn assemble_config(&self, hostname: &str) -> Result<Vec<String>> {
        let path = self.hosts_dir.join(checked_name(hostname)?);
        debug!("loading host file {}", path.display());

        let mut lines = Vec::new();
        for line in read_lines(&path)? {
            match INCLUDE.captures(&line) {
                Some(include) => {
                    let path = self.includes_dir.join(checked_name(&include[1])?);
                    debug!("loading include file {}", path.display());
                    lines.extend(read_lines(&path)?);
                }
                None => lines.push(line),
            }
        }

        Ok(lines)
    }
}

/// Rejects names that would escape their directory.
fn checked_name(name: &str) -> Result<&str> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        bail!("refusing file name '{name}'");
    }
    Ok(name)
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(content.lines().map(|line| line.trim().to_string()).collect())
}
