//! Error Types
//!
//! Typed failures for rule parsing, session start-up and the relay legs.
//! Each one is local to a single rule or session.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// A line of the rule file that could not be turned into a forwarding rule
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("line {line}: expected 3 comma-separated fields (sourcePort,targetIP,targetPort), found {found}")]
    FieldCount { line: usize, found: usize },

    #[error("line {line}: field '{field}' is empty")]
    EmptyField { line: usize, field: &'static str },
}

impl RuleParseError {
    /// One-based line number the error refers to
    pub fn line(&self) -> usize {
        match self {
            RuleParseError::FieldCount { line, .. } => *line,
            RuleParseError::EmptyField { line, .. } => *line,
        }
    }
}

/// Why a relay session did not start
#[derive(Error, Debug)]
pub enum StartError {
    #[error("session is already running")]
    AlreadyRunning,

    #[error("invalid source port: {0}")]
    InvalidSourcePort(String),

    #[error("invalid target address: {0}")]
    InvalidTargetAddress(String),

    #[error("invalid target port: {0}")]
    InvalidTargetPort(String),

    #[error("could not begin listening on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: SocketAddr, timeout: Duration },

    #[error("connection to {target} refused")]
    ConnectRefused { target: SocketAddr },

    #[error("could not connect to {target}: {source}")]
    ConnectFailed {
        target: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("session was stopped while connecting")]
    Cancelled,
}

impl StartError {
    /// True for failures caused by the rule itself rather than the network
    pub fn is_invalid_rule(&self) -> bool {
        matches!(
            self,
            StartError::InvalidSourcePort(_)
                | StartError::InvalidTargetAddress(_)
                | StartError::InvalidTargetPort(_)
        )
    }

    /// Build the error for a failed outbound connect
    pub(crate) fn from_connect(target: SocketAddr, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::ConnectionRefused => StartError::ConnectRefused { target },
            _ => StartError::ConnectFailed { target, source },
        }
    }
}

/// Which way bytes are flowing through a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to target
    Upstream,
    /// Target to client
    Downstream,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// I/O failure on one leg of an active relay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{direction} read failed: {source}")]
    Read {
        direction: Direction,
        #[source]
        source: std::io::Error,
    },

    #[error("{direction} write failed: {source}")]
    Write {
        direction: Direction,
        #[source]
        source: std::io::Error,
    },
}
