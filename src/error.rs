//! Error types shared by the agent and the server

use std::path::PathBuf;

/// Result type alias for datagram decoding
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding a datagram
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The datagram is not valid UTF-8 text.
    #[error("datagram is not valid UTF-8")]
    NotText,

    /// The datagram does not start with `COMMAND%%`.
    #[error("malformed datagram: {0:?}")]
    Malformed(String),

    /// The command token is not part of the protocol.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// A known command arrived with too few fields.
    #[error("{command} datagram is missing the {field} field")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },
}

/// Result type alias for server configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while reading the server configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A required key is missing or a value has the wrong type.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl serde::de::Error for ConfigError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        ConfigError::Invalid(msg.to_string())
    }
}
