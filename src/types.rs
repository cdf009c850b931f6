//! Core data model shared between the resolver, clients, and the manager.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Error;

/// Context key under which every log message carries the name of the
/// logstream it came from. The merge step sorts by it as a tiebreaker.
pub const CONTEXT_KEY_LSTREAM: &str = "lstream";

/// Sentinel used in a logstream's file list to mean "let the agent pick
/// the right system log file on the remote host".
pub const LOGFILE_AUTO: &str = "auto";

/// Sentinel file name that selects the systemd journal instead of flat
/// files. Streams using it have no stable line numbers, which changes how
/// load-earlier pagination works.
pub const LOGFILE_JOURNALCTL: &str = "journalctl";

/// Severity parsed out of a log message, best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Unknown,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn parse(s: &str) -> Level {
        match s {
            "debug" => Level::Debug,
            "info" => Level::Info,
            "warn" | "warning" => Level::Warn,
            "error" | "err" => Level::Error,
            _ => Level::Unknown,
        }
    }
}

/// A single log message extracted by the agent.
#[derive(Debug, Clone, Serialize)]
pub struct LogMsg {
    pub time: DateTime<Utc>,
    pub level: Level,
    /// The message with timestamp and tags stripped.
    pub msg: String,
    /// The raw line as it appears in the log file.
    pub orig_line: String,
    /// File the message came from on the remote host.
    pub log_filename: String,
    /// 1-based line number within `log_filename`.
    pub log_linenumber: u32,
    /// Monotonic line number over the logical concatenation of the
    /// previous and the last log file of the host.
    pub combined_linenumber: u32,
    /// Free-form tags; always contains [`CONTEXT_KEY_LSTREAM`].
    pub context: HashMap<String, String>,
    /// True if this message's timestamp is earlier than the one before it
    /// in the same file (clock went backwards, or the file was rotated
    /// mid-write).
    pub decreased_timestamp: bool,
}

impl LogMsg {
    /// Name of the logstream this message came from.
    pub fn lstream_name(&self) -> &str {
        self.context
            .get(CONTEXT_KEY_LSTREAM)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Number of matching messages in one unix-minute bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MinuteStatsItem {
    pub num_msgs: u64,
}

/// Captured raw agent output, returned alongside every response for
/// debugging. Stderr lines are collected verbatim; stdout lines land here
/// only when they don't parse as a protocol frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LStreamDebugInfo {
    pub agent_stdout: Vec<String>,
    pub agent_stderr: Vec<String>,
}

/// Response to one query command from a single logstream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogResp {
    /// Matching messages, oldest first.
    pub logs: Vec<LogMsg>,
    /// Per-minute histogram counts, keyed by unix minute (unix seconds / 60).
    pub minute_stats: HashMap<i64, MinuteStatsItem>,
    pub debug_info: LStreamDebugInfo,
}

/// The merged response over all logstreams, delivered to the observer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogRespTotal {
    /// Merged messages, sorted by (time, logstream name).
    pub logs: Vec<LogMsg>,
    /// Summed per-minute histogram counts.
    pub minute_stats: HashMap<i64, MinuteStatsItem>,
    /// Total number of matching messages across the whole time range,
    /// regardless of the per-stream line cap.
    pub num_msgs_total: u64,
    /// True when this response extends an earlier one backwards in time.
    pub loaded_earlier: bool,
    pub query_dur: Duration,
    /// Per-stream failures, sorted by message. Non-empty `errs` means
    /// `logs` is empty: partial results are never delivered.
    #[serde(serialize_with = "serialize_errs")]
    pub errs: Vec<Error>,
    pub debug_info: HashMap<String, LStreamDebugInfo>,
}

fn serialize_errs<S: serde::Serializer>(errs: &[Error], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(errs.iter().map(|e| e.to_string()))
}

/// Connection progress for one logstream, kept by the manager and shown in
/// aggregate state snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnDetails {
    pub connected: bool,
    /// Append-only progress messages ("connecting", "authenticated", ...).
    pub messages: Vec<String>,
    /// The most recent error, if any.
    pub err: Option<String>,
}

/// Progress of the currently running command on one busy logstream, as
/// reported by the agent's stage frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusyStage {
    pub num: u32,
    pub title: String,
    /// 0..=100.
    pub percentage: u8,
    pub extra_info: String,
}

/// A request to fetch logs from every connected logstream.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub from: DateTime<Utc>,
    /// Upper bound of the time window; `None` means "now, do not pin".
    pub to: Option<DateTime<Utc>>,
    /// Filter pattern (awk regex), empty for "everything".
    pub query: String,
    /// Per-stream cap on returned messages. Must be at least 2.
    pub max_num_lines: usize,
    /// Extend the previous result backwards instead of starting over.
    pub load_earlier: bool,
    /// Force the agent to rebuild its timestamp index first.
    pub refresh_index: bool,
    /// Ask the embedding application not to record this query in its
    /// history. The core itself keeps no history.
    pub dont_add_history_item: bool,
}

impl QueryRequest {
    pub fn new(from: DateTime<Utc>) -> QueryRequest {
        QueryRequest {
            from,
            to: None,
            query: String::new(),
            max_num_lines: 250,
            load_earlier: false,
            refresh_index: false,
            dont_add_history_item: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parse_known_and_unknown() {
        assert_eq!(Level::parse("debug"), Level::Debug);
        assert_eq!(Level::parse("warning"), Level::Warn);
        assert_eq!(Level::parse("err"), Level::Error);
        assert_eq!(Level::parse("notice"), Level::Unknown);
    }

    #[test]
    fn lstream_name_falls_back_to_empty() {
        let msg = LogMsg {
            time: Utc::now(),
            level: Level::Info,
            msg: "x".into(),
            orig_line: "x".into(),
            log_filename: "/var/log/syslog".into(),
            log_linenumber: 1,
            combined_linenumber: 1,
            context: HashMap::new(),
            decreased_timestamp: false,
        };
        assert_eq!(msg.lstream_name(), "");
    }
}
