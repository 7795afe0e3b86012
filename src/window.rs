//! Activity windows
//!
//! Every alerting rule carries an activity window that decides whether the rule may fire
//! right now. A window is written as a comma separated list of `<days>;<HH:MM>-<HH:MM>`
//! specs, e.g. `12345;08:00-18:00,06;10:00-12:00`. Day codes follow the clock's weekday
//! numbering with `0` for Sunday. An empty window is always active.

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

static SPEC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+);(\d+):(\d+)-(\d+):(\d+)$").expect("valid activity window pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
struct WindowSpec {
    /// Day codes, matched by substring presence ("13" matches day 1 and day 3)
    days: String,
    start_minute: u32,
    end_minute: u32,
}

impl WindowSpec {
    fn covers(&self, weekday: u32, minute_of_day: u32) -> bool {
        minute_of_day >= self.start_minute
            && minute_of_day <= self.end_minute
            && self.days.contains(&weekday.to_string())
    }
}

/// Parsed activity window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityWindow {
    /// `None` means "always active"
    specs: Option<Vec<WindowSpec>>,
}

impl ActivityWindow {
    /// Window that is active at any time.
    pub fn always() -> Self {
        Self::default()
    }

    /// Parse a window description. Malformed specs are dropped, so a non-empty
    /// description without a single valid spec never matches.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Self::always();
        }

        let specs = text
            .split(',')
            .filter_map(|spec| {
                let parsed = parse_spec(spec.trim());
                if parsed.is_none() {
                    warn!("ignoring malformed activity window '{spec}'");
                }
                parsed
            })
            .collect();

        Self { specs: Some(specs) }
    }

    pub fn is_always(&self) -> bool {
        self.specs.is_none()
    }

    /// Evaluate the window for a weekday code (0 = Sunday) and a minute of the day.
    pub fn is_active_at(&self, weekday: u32, minute_of_day: u32) -> bool {
        match &self.specs {
            None => true,
            Some(specs) => specs
                .iter()
                .any(|spec| spec.covers(weekday, minute_of_day)),
        }
    }

    /// Evaluate the window against the local wall clock at `now`.
    pub fn is_active<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        if self.is_always() {
            return true;
        }

        let local = now.with_timezone(&Local);
        self.is_active_at(
            local.weekday().num_days_from_sunday(),
            local.hour() * 60 + local.minute(),
        )
    }
}

fn parse_spec(spec: &str) -> Option<WindowSpec> {
    let captures = SPEC_PATTERN.captures(spec)?;
    let number = |idx: usize| captures[idx].parse::<u32>().ok();

    Some(WindowSpec {
        days: captures[1].to_string(),
        start_minute: number(2)? * 60 + number(3)?,
        end_minute: number(4)? * 60 + number(5)?,
    })
}
