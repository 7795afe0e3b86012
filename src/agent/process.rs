//! Process watcher - counts matching lines in a process listing
//!
//! ## Hysteresis
//!
//! ```text
//! count within [min, max]  → breaches = 0
//! count outside            → breaches += 1
//! breaches > 1 and active  → alert, breaches = 0
//! ```
//!
//! A single bad listing never alerts; the breach has to persist for two consecutive
//! checks. After an alert the next one again needs two fresh breaches.

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use tracing::{debug, trace};

use crate::protocol::Alert;
use crate::window::ActivityWindow;

/// Default seconds between two process listings
pub const DEFAULT_CHECK_INTERVAL_SECS: i64 = 20;

#[derive(Debug, Clone)]
pub struct ProcessRule {
    pub pattern: Regex,
    pub tags: String,
    pub min: u64,
    pub max: u64,
    pub message: String,
    pub window: ActivityWindow,
    /// Matching lines in the latest listing
    pub count: u64,
    pub consecutive_breaches: u32,
}

impl ProcessRule {
    pub fn new(
        pattern: Regex,
        tags: impl Into<String>,
        min: u64,
        max: u64,
        message: impl Into<String>,
        window: ActivityWindow,
    ) -> Self {
        Self {
            pattern,
            tags: tags.into(),
            min,
            max,
            message: message.into(),
            window,
            count: 0,
            consecutive_breaches: 0,
        }
    }

    fn in_band(&self) -> bool {
        (self.min..=self.max).contains(&self.count)
    }
}

/// All process rules of an agent plus the command producing the listing
#[derive(Debug, Default)]
pub struct ProcessWatcher {
    command: Vec<String>,
    rules: Vec<ProcessRule>,
    interval: TimeDelta,
    next_check: Option<DateTime<Utc>>,
}

impl ProcessWatcher {
    pub fn new(command: Vec<String>, rules: Vec<ProcessRule>) -> Self {
        Self {
            command,
            rules,
            interval: TimeDelta::seconds(DEFAULT_CHECK_INTERVAL_SECS),
            next_check: None,
        }
    }

    pub fn with_interval(mut self, interval: TimeDelta) -> Self {
        self.interval = interval;
        self
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn rules(&self) -> &[ProcessRule] {
        &self.rules
    }

    /// Whether a listing should be taken now. The first check happens one interval
    /// after the first call.
    pub fn is_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.command.is_empty() {
            return false;
        }

        match self.next_check {
            None => {
                self.next_check = Some(now + self.interval);
                false
            }
            Some(deadline) => now > deadline,
        }
    }

    /// Evaluates a fresh listing and returns the alerts it triggers. Any alert counts
    /// as a process event for the all-clear timer kept by the caller.
    pub fn evaluate(&mut self, listing: &str, now: DateTime<Utc>) -> Vec<Alert> {
        self.next_check = Some(now + self.interval);

        for rule in &mut self.rules {
            rule.count = 0;
        }

        for line in listing.lines() {
            for rule in &mut self.rules {
                if rule.pattern.is_match(line) {
                    rule.count += 1;
                }
            }
        }

        let mut alerts = Vec::new();

        for rule in &mut self.rules {
            if rule.in_band() {
                rule.consecutive_breaches = 0;
            } else {
                rule.consecutive_breaches += 1;
                debug!(
                    "process '{}' count {} outside [{}, {}] ({} checks)",
                    rule.pattern, rule.count, rule.min, rule.max, rule.consecutive_breaches
                );
            }

            if rule.consecutive_breaches > 1 && rule.window.is_active(&now) {
                alerts.push(Alert::new(
                    rule.tags.clone(),
                    None,
                    format!("{} [{}]", rule.message, rule.count),
                ));
                rule.consecutive_breaches = 0;
            }
        }

        trace!("process check produced {} alerts", alerts.len());
        alerts
    }
}
