//! Agent configuration directives
//!
//! The server sends configuration as lines of the form `<directive> <arguments>`.
//! Some directives only set pending state (`file:`, `match:`, `active:`, `process:`);
//! the next terminating directive (`alert_all:`, `alert_n:`, `alert_running:`, ...)
//! consumes that state into a rule. `run:` opens a command probe that later
//! `alert_if:` / `alert_metric:` lines attach to.
//!
//! Parsing is permissive: unknown or malformed lines are skipped so an older agent keeps
//! working with newer configuration.

use std::path::PathBuf;
use std::sync::LazyLock;

use chrono::TimeDelta;
use regex::Regex;
use tracing::{debug, info, warn};

use super::command::{CommandProbe, CommandRule, CommandRuleKind};
use super::file_consumer::{FileAction, FileRule, PeriodicReport};
use super::process::ProcessRule;
use crate::window::ActivityWindow;

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($re).expect("valid directive pattern"));
    };
}

pattern!(DIRECTIVE, r"^([a-z_:]+)\s+(.+?)\s*$");
pattern!(ALERT_ALL_MESSAGE, r"^tags=(\S+)\s+message=(.+?)\s*$");
pattern!(ALERT_ALL, r"^tags=(\S+)\s*$");
pattern!(
    ALERT_N,
    r"^tags=(\S+)\s+threshold=(\d+)\s+seconds=(\d+)\s+message=(.+?)\s*$"
);
pattern!(ALERT_COUNT, r"^tags=(\S+)\s+seconds=(\d+)\s*$");
pattern!(ALERT_INACTIVE, r"^tags=(\S+)\s+seconds=(\d+)\s+message=(.+?)\s*$");
pattern!(
    ALERT_RUNNING,
    r"^tags=(\S+)\s+min=(\d+)\s+max=(\d+)\s+message=(.+?)\s*$"
);
pattern!(RUN, r"^command=(.+)\s+extract=(.+?)\s*$");
pattern!(
    ALERT_IF,
    r"^tags=(\S+)\s+match=(\d+),(\S+)\s+(upper|lower)_limit=(\d+),([0-9.]+)\s+message=(.+?)\s*$"
);
pattern!(ALERT_METRIC, r"^tags=(\S+)\s+match=(\d+),(\S+)\s+metric=(\d+)\s*$");

/// Everything an agent monitors, as described by one configuration message
#[derive(Debug, Default)]
pub struct AgentConfig {
    pub files: Vec<FileRule>,
    pub ps_command: Vec<String>,
    pub processes: Vec<ProcessRule>,
    pub probes: Vec<CommandProbe>,
}

impl AgentConfig {
    pub fn parse<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut parser = Parser::default();

        for line in lines {
            let Some(captures) = DIRECTIVE.captures(line.trim()) else {
                continue;
            };
            parser.directive(&captures[1], &captures[2]);
        }

        parser.config
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.processes.is_empty() && self.probes.is_empty()
    }
}

/// Accumulator state between lines
#[derive(Default)]
struct Parser {
    file: Option<PathBuf>,
    patterns: Vec<Regex>,
    active: Option<String>,
    process: Option<String>,
    config: AgentConfig,
}

impl Parser {
    fn directive(&mut self, name: &str, argument: &str) {
        match name {
            "file:" => self.file = Some(PathBuf::from(argument)),
            "match:" => match Regex::new(argument) {
                Ok(pattern) => self.patterns.push(pattern),
                Err(e) => warn!("ignoring invalid match pattern '{argument}': {e}"),
            },
            "active:" => self.active = Some(argument.to_string()),
            "alert_all:" | "alert_n:" | "alert_count:" | "alert_inactive:" => {
                self.file_rule(name, argument)
            }
            "ps_command:" => {
                self.config.ps_command = argument.split_whitespace().map(str::to_string).collect();
                info!("process check command: {:?}", self.config.ps_command);
            }
            "process:" => self.process = Some(argument.to_string()),
            "alert_running:" => self.process_rule(argument),
            "run:" => self.probe(argument),
            "alert_if:" | "alert_metric:" => self.probe_rule(name, argument),
            other => debug!("skipping unknown directive {other}"),
        }
    }

    fn take_window(&mut self) -> ActivityWindow {
        self.active
            .take()
            .map(|text| ActivityWindow::parse(&text))
            .unwrap_or_default()
    }

    fn file_rule(&mut self, name: &str, argument: &str) {
        if self.file.is_none() || self.patterns.is_empty() {
            debug!("{name} without pending file and match, skipping");
            return;
        }

        let window = self.take_window();
        let patterns = std::mem::take(&mut self.patterns);
        let Some(path) = self.file.take() else {
            return;
        };

        let Some((tags, action)) = file_action(name, argument) else {
            warn!("malformed {name} '{argument}', skipping");
            return;
        };

        self.config.files.push(FileRule {
            path,
            patterns,
            tags,
            action,
            window,
        });
    }

    fn process_rule(&mut self, argument: &str) {
        let Some(process) = self.process.take() else {
            debug!("alert_running: without pending process, skipping");
            return;
        };
        let window = self.take_window();

        let Some(captures) = ALERT_RUNNING.captures(argument) else {
            warn!("malformed alert_running: '{argument}', skipping");
            return;
        };

        let (Ok(pattern), Ok(min), Ok(max)) = (
            Regex::new(&process),
            captures[2].parse::<u64>(),
            captures[3].parse::<u64>(),
        ) else {
            warn!("invalid process rule for '{process}', skipping");
            return;
        };

        info!("watching process '{process}' ({min}..={max})");
        self.config.processes.push(ProcessRule::new(
            pattern,
            &captures[1],
            min,
            max,
            &captures[4],
            window,
        ));
    }

    fn probe(&mut self, argument: &str) {
        let Some(captures) = RUN.captures(argument) else {
            warn!("malformed run: '{argument}', skipping");
            return;
        };

        let command: Vec<String> = captures[1].split_whitespace().map(str::to_string).collect();
        match Regex::new(captures[2].trim()) {
            Ok(extract) if !command.is_empty() => {
                self.config.probes.push(CommandProbe::new(command, extract))
            }
            Ok(_) => warn!("run: without a command, skipping"),
            Err(e) => warn!("invalid extract pattern '{}': {e}", &captures[2]),
        }
    }

    fn probe_rule(&mut self, name: &str, argument: &str) {
        let parsed = match name {
            "alert_if:" => limit_rule(argument),
            _ => metric_rule(argument),
        };

        let Some((tags, match_group, match_value, kind)) = parsed else {
            warn!("malformed {name} '{argument}', skipping");
            return;
        };

        let window = self.take_window();
        let Some(probe) = self.config.probes.last_mut() else {
            warn!("{name} without a preceding run:, skipping");
            return;
        };

        debug!("alerting on output of {:?}: {kind:?}", probe.command);
        probe.rules.push(CommandRule {
            tags,
            match_group,
            match_value,
            kind,
            window,
        });
    }
}

fn seconds(raw: &str) -> Option<TimeDelta> {
    TimeDelta::try_seconds(raw.parse().ok()?)
}

fn file_action(name: &str, argument: &str) -> Option<(String, FileAction)> {
    match name {
        "alert_all:" => {
            if let Some(captures) = ALERT_ALL_MESSAGE.captures(argument) {
                return Some((
                    captures[1].to_string(),
                    FileAction::EveryMatch {
                        message: Some(captures[2].to_string()),
                    },
                ));
            }
            let captures = ALERT_ALL.captures(argument)?;
            Some((
                captures[1].to_string(),
                FileAction::EveryMatch { message: None },
            ))
        }
        "alert_n:" => {
            let captures = ALERT_N.captures(argument)?;
            let threshold: u64 = captures[2].parse().ok()?;
            let message = captures[4].to_string();
            let report = if threshold > 0 {
                PeriodicReport::Threshold { threshold, message }
            } else {
                PeriodicReport::Inactive { message }
            };
            Some((
                captures[1].to_string(),
                FileAction::Periodic {
                    period: seconds(&captures[3])?,
                    report,
                },
            ))
        }
        "alert_count:" => {
            let captures = ALERT_COUNT.captures(argument)?;
            Some((
                captures[1].to_string(),
                FileAction::Periodic {
                    period: seconds(&captures[2])?,
                    report: PeriodicReport::Count,
                },
            ))
        }
        "alert_inactive:" => {
            let captures = ALERT_INACTIVE.captures(argument)?;
            Some((
                captures[1].to_string(),
                FileAction::Periodic {
                    period: seconds(&captures[2])?,
                    report: PeriodicReport::Inactive {
                        message: captures[3].to_string(),
                    },
                },
            ))
        }
        _ => None,
    }
}

type ParsedProbeRule = (String, usize, String, CommandRuleKind);

fn limit_rule(argument: &str) -> Option<ParsedProbeRule> {
    let captures = ALERT_IF.captures(argument)?;
    let group = captures[5].parse().ok()?;
    let limit = captures[6].parse().ok()?;
    let message = captures[7].to_string();

    let kind = if &captures[4] == "upper" {
        CommandRuleKind::UpperLimit {
            group,
            limit,
            message,
        }
    } else {
        CommandRuleKind::LowerLimit {
            group,
            limit,
            message,
        }
    };

    Some((
        captures[1].to_string(),
        captures[2].parse().ok()?,
        captures[3].to_string(),
        kind,
    ))
}

fn metric_rule(argument: &str) -> Option<ParsedProbeRule> {
    let captures = ALERT_METRIC.captures(argument)?;
    Some((
        captures[1].to_string(),
        captures[2].parse().ok()?,
        captures[3].to_string(),
        CommandRuleKind::Metric {
            group: captures[4].parse().ok()?,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_alert_all_with_message() {
        let config = AgentConfig::parse([
            "file: /var/log/x.log",
            "match: ERROR",
            "active:",
            "alert_all: tags=ERR message=Found error",
        ]);

        assert_eq!(config.files.len(), 1);
        let rule = &config.files[0];
        assert_eq!(rule.path, PathBuf::from("/var/log/x.log"));
        assert_eq!(rule.tags, "ERR");
        assert_eq!(rule.patterns.len(), 1);
        assert!(rule.window.is_always());
        assert_eq!(
            rule.action,
            FileAction::EveryMatch {
                message: Some("Found error".into())
            }
        );
    }

    #[test]
    fn test_pending_state_is_consumed() {
        let config = AgentConfig::parse([
            "file: /var/log/a.log",
            "match: one",
            "match: two",
            "active: 12345;08:00-18:00",
            "alert_all: tags=A",
            "alert_all: tags=B",
            "file: /var/log/b.log",
            "match: three",
            "alert_count: tags=C seconds=60",
        ]);

        assert_eq!(config.files.len(), 2);
        assert_eq!(config.files[0].patterns.len(), 2);
        assert!(!config.files[0].window.is_always());
        assert_eq!(config.files[0].action, FileAction::EveryMatch { message: None });

        assert_eq!(config.files[1].path, PathBuf::from("/var/log/b.log"));
        assert_eq!(config.files[1].patterns.len(), 1);
        assert!(config.files[1].window.is_always());
        assert_eq!(
            config.files[1].action,
            FileAction::Periodic {
                period: TimeDelta::seconds(60),
                report: PeriodicReport::Count
            }
        );
    }

    #[test]
    fn test_periodic_directives() {
        let config = AgentConfig::parse([
            "file: /a",
            "match: x",
            "alert_n: tags=N threshold=5 seconds=300 message=Too many",
            "file: /b",
            "match: y",
            "alert_inactive: tags=I seconds=600 message=Gone quiet",
            "file: /c",
            "match: z",
            "alert_n: tags=Z threshold=0 seconds=10 message=Nothing",
        ]);

        assert_matches!(
            &config.files[0].action,
            FileAction::Periodic { report: PeriodicReport::Threshold { threshold: 5, .. }, period }
                if *period == TimeDelta::seconds(300)
        );
        assert_matches!(
            &config.files[1].action,
            FileAction::Periodic { report: PeriodicReport::Inactive { message }, .. }
                if message == "Gone quiet"
        );
        assert_matches!(
            &config.files[2].action,
            FileAction::Periodic { report: PeriodicReport::Inactive { .. }, .. }
        );
    }

    #[test]
    fn test_process_rules() {
        let config = AgentConfig::parse([
            "ps_command: ps -ef",
            "process: sshd",
            "alert_running: tags=PROC min=1 max=1 message=sshd not running",
            "alert_running: tags=PROC min=1 max=1 message=no pending process",
        ]);

        assert_eq!(config.ps_command, vec!["ps", "-ef"]);
        assert_eq!(config.processes.len(), 1);
        let rule = &config.processes[0];
        assert_eq!(rule.pattern.as_str(), "sshd");
        assert_eq!((rule.min, rule.max), (1, 1));
        assert_eq!(rule.message, "sshd not running");
    }

    #[test]
    fn test_probe_rules_attach_to_latest_probe() {
        let config = AgentConfig::parse([
            "alert_metric: tags=M match=1,cpu metric=2",
            "run: command=df -k extract=^(\\S+)\\s+(\\d+)$",
            "alert_if: tags=DISK match=1,/dev/sda1 upper_limit=2,90 message=Disk full",
            "run: command=uptime extract=load average: ([0-9.]+)",
            "active: 0;00:00-01:00",
            "alert_if: tags=LOAD match=1,x lower_limit=1,0.5 message=Too quiet",
            "alert_metric: tags=M match=1,x metric=1",
        ]);

        assert_eq!(config.probes.len(), 2);
        assert_eq!(config.probes[0].command, vec!["df", "-k"]);
        assert_eq!(config.probes[0].rules.len(), 1);
        assert_matches!(
            &config.probes[0].rules[0].kind,
            CommandRuleKind::UpperLimit { group: 2, message, .. } if message == "Disk full"
        );

        let second = &config.probes[1];
        assert_eq!(second.rules.len(), 2);
        assert!(!second.rules[0].window.is_always());
        assert!(second.rules[1].window.is_always());
        assert_matches!(
            second.rules[0].kind,
            CommandRuleKind::LowerLimit { group: 1, limit, .. } if limit == 0.5
        );
        assert_matches!(second.rules[1].kind, CommandRuleKind::Metric { group: 1 });
    }

    #[test]
    fn test_garbage_is_skipped() {
        let config = AgentConfig::parse([
            "START",
            "",
            "# comment",
            "future_directive: something new",
            "file: /var/log/x.log",
            "match: (unclosed",
            "alert_all: tags=ERR",
            "alert_n: tags=N threshold=lots seconds=1 message=x",
        ]);

        assert!(config.is_empty());
    }
}
