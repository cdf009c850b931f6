//! # logmux
//!
//! A distributed log-querying engine: point it at a set of remote hosts, a
//! time window and a filter pattern, and it connects to every host in
//! parallel, runs a small agent over the shell connection, and merges the
//! per-host results into one ordered, histogram-annotated response.
//!
//! The embedding application talks to one [`LStreamsManager`]: requests go
//! in through its methods, consolidated updates come out on a single
//! observer channel.
//!
//! ## Modules
//!
//! - `config` - logstreams config (YAML) and a minimal ssh-config reader
//! - `resolver` - logstream spec resolution into concrete stream descriptors
//! - `transport` - shell transports: in-process SSH, external command, local
//! - `client` - per-stream state machine driving one remote agent
//! - `manager` - the event loop coordinating all clients, and the public API
//! - `cli` - headless query frontend used by the `logmux` binary

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod resolver;
pub mod transport;
pub mod types;

pub use error::{AgentErrorKind, Error, Result};
pub use manager::{
    BootstrapIssue, LStreamsManager, LStreamsManagerParams, ManagerState, ManagerUpdate,
    TransportFactory, TransportMode, TransportShared,
};
pub use resolver::{LStreamsResolver, LStreamsResolverParams, LogStream, ShellTransportConfig};
pub use types::{LogMsg, LogResp, LogRespTotal, QueryRequest};
