//! Headless CLI frontend.
//!
//! Drives the public API end to end without the full-screen UI: resolve a
//! spec, wait for every stream to connect, run one query, print the merged
//! result. Also home to the observer drain loop, which coalesces bursts of
//! state snapshots while handling every other update individually.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::config;
use crate::manager::{
    LStreamsManager, LStreamsManagerParams, ManagerUpdate, TransportMode,
};
use crate::resolver::{LStreamsResolver, LStreamsResolverParams, ShellTransportConfig};
use crate::transport::keys;
use crate::types::QueryRequest;

pub struct QueryArgs {
    pub lstreams: String,
    pub from: String,
    pub to: Option<String>,
    pub query: Option<String>,
    pub max_num_lines: usize,
    pub external_ssh: bool,
    pub ephemeral_key_provider: String,
    pub config: Option<PathBuf>,
    pub ssh_config: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub json: bool,
}

pub struct ResolveArgs {
    pub lstreams: String,
    pub external_ssh: bool,
    pub config: Option<PathBuf>,
    pub ssh_config: Option<PathBuf>,
}

/// Print the streams a spec resolves to, without connecting anywhere.
pub async fn run_resolve(args: ResolveArgs) -> anyhow::Result<()> {
    let (config_log_streams, ssh_config) = load_configs(&args.config, &args.ssh_config)?;

    let resolver = LStreamsResolver::new(LStreamsResolverParams {
        cur_os_user: current_os_user(),
        custom_shell_command: args
            .external_ssh
            .then(|| crate::resolver::DEFAULT_SSH_SHELL_COMMAND.to_string()),
        config_log_streams,
        ssh_config,
    });

    let streams = resolver.resolve(&args.lstreams)?;
    let mut names: Vec<&String> = streams.keys().collect();
    names.sort();

    for name in names {
        let stream = &streams[name];
        let transport = match &stream.transport {
            ShellTransportConfig::SshLib { addr, user } => format!("ssh {user}@{addr}"),
            ShellTransportConfig::CustomCmd { env_override, .. } => {
                format!("cmd (env {env_override:?})")
            }
            ShellTransportConfig::Localhost => "localhost".to_string(),
        };
        println!("{name}\t{transport}\t{}", stream.log_files.join(":"));
    }

    Ok(())
}

/// Run one query against a spec and print the merged result.
pub async fn run_query(args: QueryArgs) -> anyhow::Result<()> {
    if args.max_num_lines < 2 {
        bail!("--max-lines must be at least 2");
    }

    let from = parse_time_arg(&args.from).context("parsing --from")?;
    let to = args
        .to
        .as_deref()
        .map(parse_time_arg)
        .transpose()
        .context("parsing --to")?;

    let (config_log_streams, ssh_config) = load_configs(&args.config, &args.ssh_config)?;
    let ephemeral = keys::provider_from_name(&args.ephemeral_key_provider)?;

    let (updates_tx, mut updates_rx) = mpsc::channel(128);

    let manager = LStreamsManager::new(LStreamsManagerParams {
        config_log_streams,
        ssh_config,
        ssh_keys: keys::default_key_files(),
        ephemeral_key_provider: ephemeral,
        initial_lstreams: args.lstreams.clone(),
        initial_transport_mode: if args.external_ssh {
            TransportMode::ExternalCmd
        } else {
            TransportMode::SshLib
        },
        client_id: format!("{}_{}", current_os_user(), std::process::id()),
        cur_os_user: Some(current_os_user()),
        updates_tx,
        transport_factory: None,
    })?;

    // Phase 1: wait until every stream is connected.
    let connect_deadline =
        tokio::time::Instant::now() + Duration::from_secs(args.connect_timeout_secs);
    let mut last_state = None;
    loop {
        let batch = tokio::select! {
            batch = recv_batch(&mut updates_rx) => batch,
            _ = tokio::time::sleep_until(connect_deadline) => {
                let detail = last_state
                    .map(describe_connection_state)
                    .unwrap_or_default();
                manager.close();
                manager.wait().await;
                bail!("timed out waiting for connections{detail}");
            }
        };
        let Some(batch) = batch else {
            bail!("manager update channel closed before connecting");
        };

        let mut connected = false;
        for update in batch {
            match update {
                ManagerUpdate::State(state) => {
                    if state.connected {
                        connected = true;
                    }
                    last_state = Some(state);
                }
                other => handle_side_update(other).await,
            }
        }
        if connected {
            break;
        }
    }

    // Phase 2: submit the query and wait for its response.
    let mut req = QueryRequest::new(from);
    req.to = to;
    req.query = args.query.clone().unwrap_or_default();
    req.max_num_lines = args.max_num_lines;
    manager.query_logs(req).await;

    let total = loop {
        let Some(batch) = recv_batch(&mut updates_rx).await else {
            bail!("manager update channel closed mid-query");
        };
        let mut result = None;
        for update in batch {
            match update {
                ManagerUpdate::State(state) => {
                    tracing::debug!(
                        "cluster: {}/{} connected, busy={}",
                        state.num_connected,
                        state.num_lstreams,
                        state.busy
                    );
                }
                ManagerUpdate::LogResp(total) => result = Some(total),
                other => handle_side_update(other).await,
            }
        }
        if let Some(total) = result {
            break total;
        }
    };

    manager.close();
    manager.wait().await;

    if !total.errs.is_empty() {
        for err in &total.errs {
            eprintln!("error: {err}");
        }
        bail!("query failed on {} stream(s)", total.errs.len());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&total)?);
    } else {
        for msg in &total.logs {
            println!(
                "{} {} {}",
                msg.time.format("%Y-%m-%d %H:%M:%S"),
                msg.lstream_name(),
                msg.msg
            );
        }
        eprintln!(
            "{} line(s) shown, {} matching message(s) total, query took {:.2}s",
            total.logs.len(),
            total.num_msgs_total,
            total.query_dur.as_secs_f64()
        );
    }

    Ok(())
}

/// Receive at least one update, then drain whatever else is already queued
/// so bursts of state snapshots collapse into one pass.
async fn recv_batch(updates_rx: &mut mpsc::Receiver<ManagerUpdate>) -> Option<Vec<ManagerUpdate>> {
    let first = updates_rx.recv().await?;
    let mut batch = vec![first];
    while let Ok(update) = updates_rx.try_recv() {
        batch.push(update);
    }
    Some(batch)
}

/// Updates that must be handled one by one, never coalesced.
async fn handle_side_update(update: ManagerUpdate) {
    match update {
        ManagerUpdate::BootstrapIssue(issue) => {
            if let Some(err) = &issue.err {
                eprintln!("warning: {}: bootstrap: {err}", issue.lstream_name);
            }
            if issue.warn_journalctl_no_admin_access {
                eprintln!(
                    "warning: {}: the remote user cannot read the full journal",
                    issue.lstream_name
                );
            }
        }
        ManagerUpdate::DataRequest(req) => {
            eprintln!("{}: {}", req.title, req.message);
            eprint!("> ");
            let mut line = String::new();
            let mut reader = BufReader::new(tokio::io::stdin());
            let answer = match reader.read_line(&mut line).await {
                Ok(_) => line.trim_end_matches(['\r', '\n']).to_string(),
                Err(_) => String::new(),
            };
            let _ = req.response_tx.send(answer);
        }
        ManagerUpdate::State(_) | ManagerUpdate::LogResp(_) => {
            unreachable!("state and responses are handled by the main loops")
        }
    }
}

fn describe_connection_state(state: crate::manager::ManagerState) -> String {
    let mut problems = Vec::new();
    for (name, details) in &state.conn_details_by_lstream {
        if let Some(err) = &details.err {
            problems.push(format!("{name}: {err}"));
        }
    }
    if problems.is_empty() {
        String::new()
    } else {
        problems.sort();
        format!(" ({})", problems.join("; "))
    }
}

fn load_configs(
    config: &Option<PathBuf>,
    ssh_config: &Option<PathBuf>,
) -> anyhow::Result<(config::ConfigLogStreams, config::SshConfig)> {
    let config_path = config
        .clone()
        .or_else(config::default_config_path)
        .ok_or_else(|| anyhow!("cannot determine the config directory"))?;
    let log_streams = config::load_config_log_streams(&config_path)?;

    let ssh_path = ssh_config.clone().or_else(config::default_ssh_config_path);
    let ssh = match ssh_path {
        Some(path) => config::SshConfig::load(&path)
            .with_context(|| format!("reading ssh config {}", path.display()))?,
        None => config::SshConfig::default(),
    };

    Ok((log_streams, ssh))
}

fn current_os_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM[:SS]`, `YYYY-MM-DD`, or a relative
/// offset like `-2h` / `-30m` / `-1d` (relative to now, UTC).
pub fn parse_time_arg(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let s = s.trim();

    if let Some(rest) = s.strip_prefix('-') {
        if rest.len() >= 2 {
            let (num, unit) = rest.split_at(rest.len() - 1);
            if let Ok(n) = num.parse::<i64>() {
                let dur = match unit {
                    "m" => chrono::Duration::minutes(n),
                    "h" => chrono::Duration::hours(n),
                    "d" => chrono::Duration::days(n),
                    _ => bail!("unknown time unit in {s:?} (use m, h or d)"),
                };
                return Ok(Utc::now() - dur);
            }
        }
        bail!("bad relative time {s:?}");
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }

    bail!("cannot parse time {s:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_times() {
        assert_eq!(
            parse_time_arg("2026-08-02 10:15").unwrap(),
            DateTime::parse_from_rfc3339("2026-08-02T10:15:00Z").unwrap()
        );
        assert_eq!(
            parse_time_arg("2026-08-02").unwrap(),
            DateTime::parse_from_rfc3339("2026-08-02T00:00:00Z").unwrap()
        );
        assert!(parse_time_arg("not a time").is_err());
    }

    #[test]
    fn parses_relative_times() {
        let before = Utc::now() - chrono::Duration::hours(2);
        let parsed = parse_time_arg("-2h").unwrap();
        let after = Utc::now() - chrono::Duration::hours(2);
        assert!(parsed >= before && parsed <= after);

        assert!(parse_time_arg("-5x").is_err());
        assert!(parse_time_arg("-").is_err());
    }
}
