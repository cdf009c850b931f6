//! Agent output framing.
//!
//! The agent marks protocol lines on stdout with single-letter prefixes;
//! everything else is captured as debug output. The prefix set is part of
//! the wire contract and may only grow:
//!
//! - `s:<num>:<percent>:<title>[:<extra>]` — stage progress
//! - `m:<unix_minute>:<count>` — minute-stat bucket
//! - `l:<ts>\t<level>\t<file>\t<lineno>\t<combined>\t<ctx>\t<msg>` — log row
//! - `e:<kind>\t<message>` — terminal error for the current command
//! - `d:` — completion sentinel

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{AgentErrorKind, Error};
use crate::types::{
    BusyStage, Level, LogMsg, LogResp, MinuteStatsItem, CONTEXT_KEY_LSTREAM,
};

/// One parsed protocol frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Stage(BusyStage),
    MinuteStat { minute: i64, count: u64 },
    Log(Box<LogMsg>),
    Error { kind: AgentErrorKind, message: String },
    Done,
}

/// Parse one stdout line. `None` means the line is not a protocol frame
/// and belongs in the debug capture.
pub fn parse_frame(line: &str) -> Option<Frame> {
    let (prefix, rest) = line.split_once(':')?;
    match prefix {
        "s" => parse_stage(rest),
        "m" => parse_minute_stat(rest),
        "l" => parse_log(rest),
        "e" => {
            let (kind, message) = rest.split_once('\t')?;
            Some(Frame::Error {
                kind: AgentErrorKind::parse(kind),
                message: message.to_string(),
            })
        }
        "d" => Some(Frame::Done),
        _ => None,
    }
}

fn parse_stage(rest: &str) -> Option<Frame> {
    let mut parts = rest.splitn(4, ':');
    let num = parts.next()?.parse().ok()?;
    let percentage: u8 = parts.next()?.parse().ok()?;
    let title = parts.next()?.to_string();
    let extra_info = parts.next().unwrap_or("").to_string();
    Some(Frame::Stage(BusyStage {
        num,
        title,
        percentage: percentage.min(100),
        extra_info,
    }))
}

fn parse_minute_stat(rest: &str) -> Option<Frame> {
    let (minute, count) = rest.split_once(':')?;
    Some(Frame::MinuteStat {
        minute: minute.parse().ok()?,
        count: count.parse().ok()?,
    })
}

fn parse_log(rest: &str) -> Option<Frame> {
    let mut fields = rest.splitn(7, '\t');
    let time = parse_timestamp(fields.next()?)?;
    let level = Level::parse(fields.next()?);
    let log_filename = fields.next()?.to_string();
    let log_linenumber = fields.next()?.parse().ok()?;
    let combined_linenumber = fields.next()?.parse().ok()?;
    let context = parse_context(fields.next()?);
    let msg = fields.next()?.to_string();

    Some(Frame::Log(Box::new(LogMsg {
        time,
        level,
        orig_line: msg.clone(),
        msg,
        log_filename,
        log_linenumber,
        combined_linenumber,
        context,
        decreased_timestamp: false,
    })))
}

/// Timestamps arrive as naive ISO (`2026-08-02T10:15:00`, taken as UTC),
/// RFC 3339 with an offset, or raw unix seconds.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(secs) = s.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0);
    }
    None
}

fn parse_context(s: &str) -> HashMap<String, String> {
    let mut ctx = HashMap::new();
    for pair in s.split(';') {
        if let Some((k, v)) = pair.split_once('=') {
            ctx.insert(k.to_string(), v.to_string());
        }
    }
    ctx
}

/// What the caller should do after feeding a line to [`ResponseParser`].
#[derive(Debug)]
pub enum FeedOutcome {
    /// The line was absorbed into the response being built.
    Consumed,
    /// Stage progress; worth forwarding as a busy-stage update.
    Stage(BusyStage),
    /// The response is complete; call [`ResponseParser::into_resp`].
    Done,
    /// The agent aborted the command.
    Failed(Error),
}

/// Accumulates agent output into a [`LogResp`], one command at a time.
pub struct ResponseParser {
    lstream_name: String,
    logs: Vec<LogMsg>,
    minute_stats: HashMap<i64, MinuteStatsItem>,
    agent_stdout: Vec<String>,
    agent_stderr: Vec<String>,
    last_time: Option<DateTime<Utc>>,
}

impl ResponseParser {
    pub fn new(lstream_name: &str) -> ResponseParser {
        ResponseParser {
            lstream_name: lstream_name.to_string(),
            logs: Vec::new(),
            minute_stats: HashMap::new(),
            agent_stdout: Vec::new(),
            agent_stderr: Vec::new(),
            last_time: None,
        }
    }

    pub fn feed_stdout(&mut self, line: &str) -> FeedOutcome {
        match parse_frame(line) {
            Some(Frame::Log(mut msg)) => {
                msg.context
                    .insert(CONTEXT_KEY_LSTREAM.to_string(), self.lstream_name.clone());
                if let Some(last) = self.last_time {
                    if msg.time < last {
                        msg.decreased_timestamp = true;
                    }
                }
                self.last_time = Some(msg.time);
                self.logs.push(*msg);
                FeedOutcome::Consumed
            }
            Some(Frame::MinuteStat { minute, count }) => {
                self.minute_stats.entry(minute).or_default().num_msgs += count;
                FeedOutcome::Consumed
            }
            Some(Frame::Stage(stage)) => FeedOutcome::Stage(stage),
            Some(Frame::Error { kind, message }) => FeedOutcome::Failed(Error::Agent {
                kind,
                message,
            }),
            Some(Frame::Done) => FeedOutcome::Done,
            None => {
                self.agent_stdout.push(line.to_string());
                FeedOutcome::Consumed
            }
        }
    }

    pub fn feed_stderr(&mut self, line: &str) {
        self.agent_stderr.push(line.to_string());
    }

    pub fn into_resp(self) -> LogResp {
        LogResp {
            logs: self.logs,
            minute_stats: self.minute_stats,
            debug_info: crate::types::LStreamDebugInfo {
                agent_stdout: self.agent_stdout,
                agent_stderr: self.agent_stderr,
            },
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stage_frame() {
        let frame = parse_frame("s:2:45:building index:pass 1").unwrap();
        match frame {
            Frame::Stage(stage) => {
                assert_eq!(stage.num, 2);
                assert_eq!(stage.percentage, 45);
                assert_eq!(stage.title, "building index");
                assert_eq!(stage.extra_info, "pass 1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_minute_stat_frame() {
        match parse_frame("m:29715840:12").unwrap() {
            Frame::MinuteStat { minute, count } => {
                assert_eq!(minute, 29_715_840);
                assert_eq!(count, 12);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_log_frame() {
        let line = "l:2026-08-02T10:15:00\terror\t/var/log/syslog\t42\t1042\tunit=sshd\tConnection closed";
        match parse_frame(line).unwrap() {
            Frame::Log(msg) => {
                assert_eq!(msg.level, Level::Error);
                assert_eq!(msg.log_filename, "/var/log/syslog");
                assert_eq!(msg.log_linenumber, 42);
                assert_eq!(msg.combined_linenumber, 1042);
                assert_eq!(msg.context["unit"], "sshd");
                assert_eq!(msg.msg, "Connection closed");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_lines_are_not_frames() {
        assert!(parse_frame("some random output").is_none());
        assert!(parse_frame("x:unknown prefix").is_none());
    }

    #[test]
    fn parser_accumulates_and_completes() {
        let mut parser = ResponseParser::new("h1");
        assert!(matches!(
            parser.feed_stdout("l:2026-08-02T10:00:00\tinfo\t/l\t1\t1\t\tfirst"),
            FeedOutcome::Consumed
        ));
        assert!(matches!(
            parser.feed_stdout("m:100:3"),
            FeedOutcome::Consumed
        ));
        assert!(matches!(
            parser.feed_stdout("noise from the shell"),
            FeedOutcome::Consumed
        ));
        parser.feed_stderr("stderr noise");
        assert!(matches!(parser.feed_stdout("d:"), FeedOutcome::Done));

        let resp = parser.into_resp();
        assert_eq!(resp.logs.len(), 1);
        assert_eq!(resp.logs[0].lstream_name(), "h1");
        assert_eq!(resp.minute_stats[&100].num_msgs, 3);
        assert_eq!(resp.debug_info.agent_stdout, vec!["noise from the shell"]);
        assert_eq!(resp.debug_info.agent_stderr, vec!["stderr noise"]);
    }

    #[test]
    fn decreased_timestamps_are_flagged() {
        let mut parser = ResponseParser::new("h1");
        parser.feed_stdout("l:2026-08-02T10:00:05\tinfo\t/l\t1\t1\t\ta");
        parser.feed_stdout("l:2026-08-02T10:00:03\tinfo\t/l\t2\t2\t\tb");
        parser.feed_stdout("l:2026-08-02T10:00:07\tinfo\t/l\t3\t3\t\tc");
        let resp = parser.into_resp();
        assert!(!resp.logs[0].decreased_timestamp);
        assert!(resp.logs[1].decreased_timestamp);
        assert!(!resp.logs[2].decreased_timestamp);
    }

    #[test]
    fn agent_error_fails_the_command() {
        let mut parser = ResponseParser::new("h1");
        match parser.feed_stdout("e:query\tpattern invalid") {
            FeedOutcome::Failed(Error::Agent { kind, message }) => {
                assert_eq!(kind, AgentErrorKind::Query);
                assert_eq!(message, "pattern invalid");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
