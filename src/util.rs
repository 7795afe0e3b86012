use std::time::Duration;

use chrono::TimeDelta;
use sysinfo::System;

const HOSTNAME: &str = "HOSTWATCH_HOSTNAME";

/// Name this host reports to the server; the server uses it as the configuration file name.
pub fn get_hostname() -> String {
    std::env::var(HOSTNAME)
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(System::host_name)
        .unwrap_or_else(|| String::from("localhost"))
}

const IDLE_TIME: &str = "HOSTWATCH_IDLE_TIME";

const DEFAULT_IDLE_TIME: u64 = 67;

/// Time without traffic after which an agent queues an idle alert.
pub fn get_idle_time() -> TimeDelta {
    TimeDelta::seconds(env_or(IDLE_TIME, DEFAULT_IDLE_TIME) as i64)
}

const COMMAND_TIMEOUT: &str = "HOSTWATCH_COMMAND_TIMEOUT";

const DEFAULT_COMMAND_TIMEOUT: u64 = 15;

/// Upper bound for a single process listing or probe command.
pub fn get_command_timeout() -> Duration {
    Duration::from_secs(env_or(COMMAND_TIMEOUT, DEFAULT_COMMAND_TIMEOUT))
}

fn env_or(key: &str, default: u64) -> u64 {
    let from_env = std::env::var(key);
    from_env.map_or(default, |res| res.parse().unwrap_or(default))
}

/// Renders a timestamp the way `ctime(3)` does, e.g. `Thu Nov  9 14:03:00 2023`.
pub fn ctime<Tz>(at: &chrono::DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    at.format("%a %b %e %H:%M:%S %Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_ctime_format() {
        let at = Utc.with_ymd_and_hms(2023, 11, 9, 14, 3, 0).unwrap();
        assert_eq!(ctime(&at), "Thu Nov  9 14:03:00 2023");
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        assert_eq!(env_or("HOSTWATCH_TEST_UNSET_KEY", 7), 7);
    }
}
