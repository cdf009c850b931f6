//! Crate-wide error taxonomy.
//!
//! Errors fall into three layers: admission errors returned synchronously to
//! the caller ([`Error::BusyWithAnotherQuery`], [`Error::NotYetConnected`],
//! [`Error::NoMatchingLStreams`]), per-stream lifecycle errors recorded in
//! connection details ([`crate::transport::TransportError`]), and
//! command-scoped errors returned by the remote agent ([`Error::Agent`]).
//!
//! Everything here is `Clone` so errors can travel through the update bus
//! alongside regular payloads.

use crate::resolver::ResolveError;
use crate::transport::TransportError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A query is already in flight; new queries are rejected, not queued.
    #[error("busy with another query")]
    BusyWithAnotherQuery,

    /// At least one logstream client is not connected yet.
    #[error("not connected to all logstreams yet")]
    NotYetConnected,

    /// The logstream spec resolved to an empty set.
    #[error("no matching logstreams to get logs from")]
    NoMatchingLStreams,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Agent upload or prerequisite check failed for one stream.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Command-scoped error returned by the remote agent.
    #[error("agent error ({kind}): {message}")]
    Agent {
        kind: AgentErrorKind,
        message: String,
    },

    /// An error annotated with the name of the logstream it came from, used
    /// when collecting per-stream failures into a merged response.
    #[error("{lstream}: {source}")]
    Annotated {
        lstream: String,
        #[source]
        source: Box<Error>,
    },

    /// The manager event loop is gone (torn down or crashed).
    #[error("logstreams manager is shut down")]
    ManagerClosed,
}

impl Error {
    /// Wrap this error with the name of the logstream it originated from.
    pub fn annotated(self, lstream: impl Into<String>) -> Error {
        Error::Annotated {
            lstream: lstream.into(),
            source: Box::new(self),
        }
    }
}

/// Error kinds reported by the agent's `e:` frame.
///
/// Unknown kinds are preserved verbatim rather than parsed out of the
/// message text, so newer agent versions can extend the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentErrorKind {
    /// The filter pattern was rejected.
    Query,
    /// A log file could not be opened or read.
    File,
    /// The timestamp index is corrupt or could not be (re)built.
    Index,
    /// Agent-internal failure.
    Internal,
    /// A kind this client version does not know about.
    Other(String),
}

impl AgentErrorKind {
    pub fn parse(s: &str) -> AgentErrorKind {
        match s {
            "query" => AgentErrorKind::Query,
            "file" => AgentErrorKind::File,
            "index" => AgentErrorKind::Index,
            "internal" => AgentErrorKind::Internal,
            other => AgentErrorKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentErrorKind::Query => write!(f, "query"),
            AgentErrorKind::File => write!(f, "file"),
            AgentErrorKind::Index => write!(f, "index"),
            AgentErrorKind::Internal => write!(f, "internal"),
            AgentErrorKind::Other(s) => write!(f, "{s}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
