//! Event stream - append-only record of everything the agents reported
//!
//! Records are single lines starting with the local `ctime` of reception:
//!
//! ```text
//! Thu Nov  9 14:03:00 2023%%web01%%1699538580_3%%1699538580%%ERR%%/var/log/x.log%%Found error
//! Thu Nov  9 14:03:10 2023%%db01%%000000%%1699538590%%SYSTEM%%NULL%%Host is inactive
//! ```
//!
//! The file is rotated by size: `path` → `path.1` → ... → `path.<backups>`, the oldest
//! backup is deleted.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use tracing::{debug, info};

use crate::protocol::{AlertDatagram, SEPARATOR};
use crate::util::ctime;

pub struct EventStream {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: Option<File>,
    size: u64,
}

impl EventStream {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            backups,
            file: None,
            size: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records an alert exactly as it arrived (everything after `ALERT%%`).
    pub fn record_alert(&mut self, alert: &AlertDatagram, now: DateTime<Utc>) -> Result<()> {
        self.append(&format!("{}{SEPARATOR}{}", local_ctime(now), alert.payload()))
    }

    /// Records a synthesized event for a host that has not reported recently.
    pub fn record_inactive(&mut self, hostname: &str, now: DateTime<Utc>) -> Result<()> {
        let alert = AlertDatagram {
            hostname: hostname.to_string(),
            id: "000000".to_string(),
            created_at: now.timestamp(),
            text: ["SYSTEM", "NULL", "Host is inactive"].join(SEPARATOR),
        };
        self.record_alert(&alert, now)
    }

    fn append(&mut self, record: &str) -> Result<()> {
        let len = record.len() as u64 + 1;

        // size is only known once the file is open
        self.open()?;
        if self.max_bytes > 0 && self.size > 0 && self.size + len >= self.max_bytes {
            self.rotate()?;
        }

        let written = writeln!(self.open()?, "{record}");
        written.with_context(|| format!("failed to write to {}", self.path.display()))?;
        self.size += len;
        Ok(())
    }

    fn open(&mut self) -> Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let file = open_append(&self.path)?;
                self.size = file.metadata().map(|meta| meta.len()).unwrap_or(0);
                file
            }
        };
        Ok(self.file.insert(file))
    }

    fn rotate(&mut self) -> Result<()> {
        info!("rotating event stream {}", self.path.display());
        self.file = None;
        self.size = 0;

        if self.backups == 0 {
            return remove_if_exists(&self.path);
        }

        remove_if_exists(&self.backup(self.backups))?;
        for generation in (1..self.backups).rev() {
            let from = self.backup(generation);
            if from.exists() {
                fs::rename(&from, self.backup(generation + 1))
                    .with_context(|| format!("failed to rotate {}", from.display()))?;
            }
        }

        if self.path.exists() {
            fs::rename(&self.path, self.backup(1))
                .with_context(|| format!("failed to rotate {}", self.path.display()))?;
        }

        Ok(())
    }

    fn backup(&self, generation: usize) -> PathBuf {
        PathBuf::from(format!("{}.{generation}", self.path.display()))
    }
}

fn local_ctime(now: DateTime<Utc>) -> String {
    ctime(&now.with_timezone(&Local))
}

fn open_append(path: &Path) -> Result<File> {
    debug!("opening event stream {}", path.display());
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open event stream {}", path.display()))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("failed to remove {}", path.display()))
        }
        _ => Ok(()),
    }
}
