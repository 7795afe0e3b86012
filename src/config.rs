use std::collections::HashMap;
use std::fmt::Display;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::value::MapDeserializer;
use serde::{Deserialize, Deserializer};
use tracing::{debug, trace};

use crate::error::{ConfigError, ConfigResult};

/// Server settings, read from a file of `key: value` lines
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Agents listen on `port`, the server on `port + 1`
    #[serde(deserialize_with = "from_str")]
    pub port: u16,

    /// Address heartbeats and resets are broadcast to
    #[serde(deserialize_with = "from_str")]
    pub broadcast: IpAddr,

    /// Directory with one configuration file per agent host
    pub hosts: PathBuf,

    /// Directory with shared fragments pulled in by `include:` lines
    pub includes: PathBuf,

    /// Append-only record of every received alert
    pub event_stream: PathBuf,

    /// Size at which the event stream is rotated
    #[serde(
        default = "default_event_stream_max_bytes",
        deserialize_with = "from_str"
    )]
    pub event_stream_max_bytes: u64,

    /// Number of rotated event streams kept next to the live one
    #[serde(default = "default_event_stream_backups", deserialize_with = "from_str")]
    pub event_stream_backups: usize,
}

fn default_event_stream_max_bytes() -> u64 {
    1_000_000
}

fn default_event_stream_backups() -> usize {
    4
}

fn from_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl ServerConfig {
    /// Parses the `key: value` lines of a configuration file. Blank lines, `#` comments
    /// and lines without a colon are skipped; the last occurrence of a key wins.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let mut entries = HashMap::new();

        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line.split_once(':') {
                Some((key, value)) => {
                    entries.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => debug!("skipping configuration line '{line}'"),
            }
        }

        let deserializer = MapDeserializer::<_, ConfigError>::new(entries.into_iter());
        ServerConfig::deserialize(deserializer)
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> ConfigResult<ServerConfig> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    ServerConfig::parse(&file_content).inspect(|config| trace!("loaded config: {config:?}"))
}
