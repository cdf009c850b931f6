//! Merging per-stream responses into one coherent view.
//!
//! The merged view lives across queries so that a follow-up "load earlier"
//! can prepend older rows per stream and re-derive the combined list.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::{LStreamDebugInfo, LogMsg, LogResp, LogRespTotal, MinuteStatsItem};

/// Per-stream slice of the merged view.
pub(crate) struct NodeLogs {
    pub logs: Vec<LogMsg>,
    /// The stream returned exactly the page-size number of rows, so its
    /// coverage may start later than the requested range.
    pub is_max_num_lines: bool,
}

/// The in-memory merged view of the most recent query (plus any
/// load-earlier extensions).
#[derive(Default)]
pub(crate) struct MergedLogs {
    minute_stats: HashMap<i64, MinuteStatsItem>,
    num_msgs_total: u64,
    per_node: HashMap<String, NodeLogs>,
}

impl MergedLogs {
    /// Rebuild the view from a fresh (non-load-earlier) set of responses.
    pub fn reset(&mut self, resps: HashMap<String, LogResp>, max_num_lines: usize) {
        *self = MergedLogs::default();

        for (name, resp) in resps {
            for (minute, item) in &resp.minute_stats {
                self.minute_stats.entry(*minute).or_default().num_msgs += item.num_msgs;
                self.num_msgs_total += item.num_msgs;
            }
            self.per_node.insert(
                name,
                NodeLogs {
                    is_max_num_lines: resp.logs.len() == max_num_lines,
                    logs: resp.logs,
                },
            );
        }
    }

    /// Prepend a load-earlier batch per stream. Minute stats are already
    /// complete from the original query and are left untouched.
    pub fn prepend_earlier(&mut self, resps: HashMap<String, LogResp>, max_num_lines: usize) {
        for (name, resp) in resps {
            let is_max = resp.logs.len() == max_num_lines;
            let node = self.per_node.entry(name).or_insert_with(|| NodeLogs {
                logs: Vec::new(),
                is_max_num_lines: false,
            });
            let mut logs = resp.logs;
            logs.append(&mut node.logs);
            node.logs = logs;
            node.is_max_num_lines = is_max;
        }
    }

    /// The earliest timestamp of the oldest row already held for `name`,
    /// together with how many held rows sit exactly on it. This is the
    /// pagination cursor for journal streams.
    pub fn earliest_cursor(&self, name: &str) -> Option<(DateTime<Utc>, usize)> {
        let logs = &self.per_node.get(name)?.logs;
        let first = logs.first()?;
        let num_msgs = logs.iter().take_while(|l| l.time == first.time).count();
        Some((first.time, num_msgs))
    }

    /// The combined line number of the oldest row already held for `name`;
    /// the pagination cursor for file streams.
    pub fn earliest_combined_linenumber(&self, name: &str) -> Option<u32> {
        Some(self.per_node.get(name)?.logs.first()?.combined_linenumber)
    }

    /// Concatenate, order, and trim the per-stream lists into a response.
    ///
    /// Ordering is (time asc, stream name asc). If any stream hit the page
    /// size, everything before `max(first row time over capped streams)` is
    /// dropped: those rows cannot be guaranteed present from every stream,
    /// and a partially-covered tail would read as a gap in the data.
    pub fn collect(
        &self,
        loaded_earlier: bool,
        debug_info: HashMap<String, LStreamDebugInfo>,
    ) -> LogRespTotal {
        let mut logs: Vec<LogMsg> = Vec::new();
        let mut covered_since: Option<DateTime<Utc>> = None;

        for node in self.per_node.values() {
            logs.extend(node.logs.iter().cloned());

            if node.is_max_num_lines {
                if let Some(first) = node.logs.first() {
                    if covered_since.map_or(true, |t| t < first.time) {
                        covered_since = Some(first.time);
                    }
                }
            }
        }

        logs.sort_by(|a, b| {
            a.time
                .cmp(&b.time)
                .then_with(|| a.lstream_name().cmp(b.lstream_name()))
        });

        if let Some(since) = covered_since {
            let idx = logs.partition_point(|l| l.time < since);
            logs.drain(..idx);
        }

        LogRespTotal {
            logs,
            minute_stats: self.minute_stats.clone(),
            num_msgs_total: self.num_msgs_total,
            loaded_earlier,
            query_dur: Default::default(),
            errs: Vec::new(),
            debug_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Level, CONTEXT_KEY_LSTREAM};

    fn msg(t: i64, lstream: &str) -> LogMsg {
        let mut context = HashMap::new();
        context.insert(CONTEXT_KEY_LSTREAM.to_string(), lstream.to_string());
        LogMsg {
            time: DateTime::from_timestamp(t, 0).unwrap(),
            level: Level::Info,
            msg: format!("msg at {t}"),
            orig_line: format!("msg at {t}"),
            log_filename: "/var/log/syslog".to_string(),
            log_linenumber: 1,
            combined_linenumber: t as u32,
            context,
            decreased_timestamp: false,
        }
    }

    fn resp(lstream: &str, times: &[i64]) -> LogResp {
        let mut minute_stats = HashMap::new();
        for t in times {
            minute_stats
                .entry(t / 60)
                .or_insert(MinuteStatsItem::default())
                .num_msgs += 1;
        }
        LogResp {
            logs: times.iter().map(|t| msg(*t, lstream)).collect(),
            minute_stats,
            debug_info: LStreamDebugInfo::default(),
        }
    }

    fn times_and_names(total: &LogRespTotal) -> Vec<(i64, String)> {
        total
            .logs
            .iter()
            .map(|l| (l.time.timestamp(), l.lstream_name().to_string()))
            .collect()
    }

    #[test]
    fn merge_orders_by_time_then_name() {
        let mut merged = MergedLogs::default();
        let mut resps = HashMap::new();
        resps.insert("h1".to_string(), resp("h1", &[1, 2, 3]));
        resps.insert("h2".to_string(), resp("h2", &[2, 4]));
        merged.reset(resps, 100);

        let total = merged.collect(false, HashMap::new());
        assert_eq!(
            times_and_names(&total),
            vec![
                (1, "h1".to_string()),
                (2, "h1".to_string()),
                (2, "h2".to_string()),
                (3, "h1".to_string()),
                (4, "h2".to_string()),
            ]
        );
        assert_eq!(total.num_msgs_total, 5);
        assert_eq!(total.minute_stats[&0].num_msgs, 5);
    }

    #[test]
    fn capped_streams_trim_the_merged_prefix() {
        let mut merged = MergedLogs::default();
        let mut resps = HashMap::new();
        resps.insert("h1".to_string(), resp("h1", &[10, 11]));
        resps.insert("h2".to_string(), resp("h2", &[5, 6]));
        merged.reset(resps, 2); // both streams are capped

        let total = merged.collect(false, HashMap::new());
        // Coverage is only guaranteed from t=10 on; h2's rows fall away.
        assert_eq!(
            times_and_names(&total),
            vec![(10, "h1".to_string()), (11, "h1".to_string())]
        );
    }

    #[test]
    fn uncapped_streams_are_not_trimmed() {
        let mut merged = MergedLogs::default();
        let mut resps = HashMap::new();
        resps.insert("h1".to_string(), resp("h1", &[10, 11]));
        resps.insert("h2".to_string(), resp("h2", &[5, 6]));
        merged.reset(resps, 100);

        let total = merged.collect(false, HashMap::new());
        assert_eq!(total.logs.len(), 4);
        assert_eq!(total.logs[0].time.timestamp(), 5);
    }

    #[test]
    fn prepend_earlier_extends_backwards() {
        let mut merged = MergedLogs::default();
        let mut resps = HashMap::new();
        resps.insert("h1".to_string(), resp("h1", &[10, 11]));
        merged.reset(resps, 100);
        let stats_before = merged.collect(false, HashMap::new()).minute_stats;

        let mut earlier = HashMap::new();
        earlier.insert("h1".to_string(), resp("h1", &[7, 8]));
        merged.prepend_earlier(earlier, 100);

        let total = merged.collect(true, HashMap::new());
        assert!(total.loaded_earlier);
        assert_eq!(
            times_and_names(&total)
                .iter()
                .map(|(t, _)| *t)
                .collect::<Vec<_>>(),
            vec![7, 8, 10, 11]
        );
        // Minute stats come from the original query only.
        assert_eq!(total.minute_stats, stats_before);
    }

    #[test]
    fn earliest_cursor_counts_rows_on_the_same_timestamp() {
        let mut merged = MergedLogs::default();
        let mut resps = HashMap::new();
        resps.insert("h1".to_string(), resp("h1", &[5, 5, 5, 9]));
        merged.reset(resps, 100);

        let (t, n) = merged.earliest_cursor("h1").unwrap();
        assert_eq!(t.timestamp(), 5);
        assert_eq!(n, 3);
        assert_eq!(merged.earliest_combined_linenumber("h1"), Some(5));
        assert!(merged.earliest_cursor("missing").is_none());
    }
}
