//! Error types for the WebSocket relay

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;

/// Relay errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more endpoint descriptors failed validation
    #[error("Invalid configuration:\n{0}")]
    InvalidConfig(ConfigIssues),

    /// Backend address is not `ws://host:port/path` or `wss://host:port/path`
    #[error("remote websockets addr format error: {0}")]
    AddressFormat(String),

    /// Directory service error (token grant or group listing)
    #[error("Directory error: {0}")]
    Directory(String),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Every problem found while validating the configured endpoints.
///
/// Validation does not stop at the first bad field; operators get the whole
/// list in one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigIssues(Vec<ConfigIssue>);

/// A single malformed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Location of the field, e.g. `websockets[2].address`
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl ConfigIssues {
    /// Record a problem with `field`.
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(ConfigIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    /// `true` when nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of recorded problems.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the recorded problems.
    pub fn iter(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.0.iter()
    }

    /// `Ok(())` when empty, otherwise [`Error::InvalidConfig`].
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(self))
        }
    }
}

impl fmt::Display for ConfigIssues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  {}: {}", issue.field, issue.message)?;
        }
        Ok(())
    }
}
