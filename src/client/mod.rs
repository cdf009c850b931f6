//! Per-stream client: one remote conversation.
//!
//! Each logstream gets one `LStreamClient`, which owns a shell transport
//! and runs the whole conversation on a dedicated task: connect (with
//! retry), bootstrap the agent script, then serve a FIFO queue of commands,
//! at most one in flight. The client never touches manager state; it only
//! writes typed updates to the manager's update channel and responses to
//! the per-command response channel it was handed.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Bootstrapping ──ok──▶ ConnectedIdle
//!        ▲                      │ fail               │ fail                │
//!        │                      ▼                    ▼                     ▼
//!        └──────── Disconnecting ◀── close / reconnect ─────────── ConnectedBusy
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::resolver::LogStream;
use crate::transport::{
    ConnectCtx, DataRequest, OutputLine, ShellConn, ShellTransport, StreamKind, TransportError,
};
use crate::types::{BusyStage, ConnDetails, LogResp};

pub mod agent;
pub mod protocol;

use protocol::{FeedOutcome, ResponseParser};

/// How long to wait before retrying after a transient connect failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Per-step bootstrap timeout (marker round trips).
const BOOTSTRAP_STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum LStreamClientState {
    Disconnected,
    Connecting,
    Bootstrapping,
    ConnectedIdle,
    ConnectedBusy,
    Disconnecting,
}

impl LStreamClientState {
    /// Connected in the aggregate sense: bootstrap finished, commands can
    /// be served.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            LStreamClientState::ConnectedIdle | LStreamClientState::ConnectedBusy
        )
    }
}

impl std::fmt::Display for LStreamClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LStreamClientState::Disconnected => "disconnected",
            LStreamClientState::Connecting => "connecting",
            LStreamClientState::Bootstrapping => "bootstrapping",
            LStreamClientState::ConnectedIdle => "connected-idle",
            LStreamClientState::ConnectedBusy => "connected-busy",
            LStreamClientState::Disconnecting => "disconnecting",
        };
        write!(f, "{s}")
    }
}

/// Update from a client to the manager. `name` is the client's current key,
/// which changes once when the client is retired.
#[derive(Debug)]
pub struct LStreamClientUpdate {
    pub name: String,
    pub payload: LStreamClientUpdatePayload,
}

#[derive(Debug)]
pub enum LStreamClientUpdatePayload {
    State {
        old: LStreamClientState,
        new: LStreamClientState,
    },
    ConnDetails(ConnDetails),
    BootstrapIssue {
        err: Option<String>,
        /// Journal streams only: the remote user cannot read the full
        /// journal. Kept as a dedicated flag so the UI can suppress it.
        warn_journalctl_no_admin_access: bool,
    },
    BusyStage(BusyStage),
    DataRequest(DataRequest),
    TornDown,
}

/// "Up to and including this timestamp, I already hold `num_msgs` rows at
/// exactly that timestamp" — the pagination cursor for journal streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeAndNumMsgs {
    pub time: DateTime<Utc>,
    pub num_msgs: usize,
}

#[derive(Debug, Clone)]
pub struct QueryLogsCmd {
    pub max_num_lines: usize,
    pub from: DateTime<Utc>,
    pub to: Option<DateTime<Utc>>,
    pub query: String,
    pub refresh_index: bool,
    /// File streams: fetch only lines with a combined line number strictly
    /// below this.
    pub lines_until: Option<u32>,
    /// Journal streams: fetch only rows up to this cursor.
    pub timestamp_until: Option<TimeAndNumMsgs>,
}

#[derive(Debug)]
pub enum LStreamCmdKind {
    Ping,
    QueryLogs(QueryLogsCmd),
}

/// A command for one client. Responses (for commands that have any) go to
/// `resp_tx`, which the manager hands out per query.
#[derive(Debug)]
pub struct LStreamCmd {
    pub kind: LStreamCmdKind,
    pub resp_tx: Option<mpsc::Sender<LStreamCmdRes>>,
}

#[derive(Debug)]
pub struct LStreamCmdRes {
    /// Name of the logstream this response belongs to.
    pub lstream: String,
    pub result: Result<LogResp, Error>,
}

pub struct LStreamClientParams {
    pub log_stream: LogStream,
    pub client_id: String,
    pub transport: Arc<dyn ShellTransport>,
    pub updates_tx: mpsc::Sender<LStreamClientUpdate>,
}

enum ClientCtl {
    Cmd(LStreamCmd),
    Reconnect,
    Close { retired_name: String },
}

/// Handle to one client worker task.
pub struct LStreamClient {
    ctl_tx: mpsc::UnboundedSender<ClientCtl>,
}

impl LStreamClient {
    pub fn new(params: LStreamClientParams) -> LStreamClient {
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();

        let worker = ClientWorker {
            name: params.log_stream.name.clone(),
            log_stream: params.log_stream,
            client_id: params.client_id,
            transport: params.transport,
            updates_tx: params.updates_tx,
            ctl_rx,
            state: LStreamClientState::Disconnected,
            conn_details: ConnDetails::default(),
            queue: VecDeque::new(),
        };
        tokio::spawn(worker.run());

        LStreamClient { ctl_tx }
    }

    /// Append a command to the FIFO queue. Commands run one at a time once
    /// the client is connected.
    pub fn enqueue_cmd(&self, cmd: LStreamCmd) {
        let _ = self.ctl_tx.send(ClientCtl::Cmd(cmd));
    }

    /// Drop the current connection (failing any in-flight command) and
    /// connect again.
    pub fn reconnect(&self) {
        let _ = self.ctl_tx.send(ClientCtl::Reconnect);
    }

    /// Retire this client: it takes `retired_name` as its key, tears the
    /// connection down, and emits a final `TornDown` update under that
    /// name.
    pub fn close(&self, retired_name: String) {
        let _ = self.ctl_tx.send(ClientCtl::Close { retired_name });
    }
}

/// How a phase of the client lifecycle ended.
enum Exit {
    /// Tear down the connection and connect again right away.
    Reconnect,
    /// Retire: close everything and end the task.
    Teardown,
    /// The connection died underneath us; reconnect after a delay.
    ConnLost(String),
}

enum InFlightKind {
    Ping,
    Query(ResponseParser),
}

struct InFlight {
    kind: InFlightKind,
    resp_tx: Option<mpsc::Sender<LStreamCmdRes>>,
}

struct ClientWorker {
    /// Current key; replaced with the retired key on close.
    name: String,
    log_stream: LogStream,
    client_id: String,
    transport: Arc<dyn ShellTransport>,
    updates_tx: mpsc::Sender<LStreamClientUpdate>,
    ctl_rx: mpsc::UnboundedReceiver<ClientCtl>,
    state: LStreamClientState,
    conn_details: ConnDetails,
    queue: VecDeque<LStreamCmd>,
}

impl ClientWorker {
    async fn run(mut self) {
        // Interactive prompts can fire while connect() is being awaited, so
        // they are forwarded to the manager from a helper task.
        let (data_tx, mut data_rx) = mpsc::channel::<DataRequest>(8);
        {
            let updates_tx = self.updates_tx.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                while let Some(req) = data_rx.recv().await {
                    let _ = updates_tx
                        .send(LStreamClientUpdate {
                            name: name.clone(),
                            payload: LStreamClientUpdatePayload::DataRequest(req),
                        })
                        .await;
                }
            });
        }
        let ctx = ConnectCtx {
            data_request_tx: data_tx,
        };

        loop {
            let mut conn = match self.connect_phase(&ctx).await {
                Ok(conn) => conn,
                Err(Exit::Teardown) => {
                    self.teardown(None).await;
                    return;
                }
                Err(Exit::Reconnect) | Err(Exit::ConnLost(_)) => continue,
            };

            match self.bootstrap_phase(&mut conn).await {
                Ok(()) => {}
                Err(Exit::Teardown) => {
                    self.teardown(Some(conn)).await;
                    return;
                }
                Err(Exit::Reconnect) => {
                    self.drop_conn(conn, "reconnect requested").await;
                    continue;
                }
                Err(Exit::ConnLost(reason)) => {
                    self.record_error(&reason).await;
                    self.drop_conn(conn, &reason).await;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            }

            match self.connected_phase(&mut conn).await {
                Exit::Teardown => {
                    self.teardown(Some(conn)).await;
                    return;
                }
                Exit::Reconnect => {
                    self.drop_conn(conn, "reconnect requested").await;
                }
                Exit::ConnLost(reason) => {
                    self.record_error(&reason).await;
                    self.drop_conn(conn, &reason).await;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Keep trying to connect until it works or we are told to stop.
    async fn connect_phase(&mut self, ctx: &ConnectCtx) -> Result<ShellConn, Exit> {
        loop {
            self.set_state(LStreamClientState::Connecting).await;
            self.add_conn_message(&format!(
                "connecting via {} transport",
                self.transport.kind()
            ))
            .await;

            enum Ev {
                Connected(Result<ShellConn, TransportError>),
                Ctl(Option<ClientCtl>),
            }

            let ev = {
                let transport = Arc::clone(&self.transport);
                tokio::select! {
                    res = transport.connect(ctx) => Ev::Connected(res),
                    ctl = self.ctl_rx.recv() => Ev::Ctl(ctl),
                }
            };

            let err = match ev {
                Ev::Connected(Ok(conn)) => return Ok(conn),
                Ev::Connected(Err(e)) => e,
                Ev::Ctl(ctl) => match self.handle_ctl(ctl) {
                    CtlAction::Queued => continue,
                    CtlAction::Reconnect => continue,
                    CtlAction::Teardown => return Err(Exit::Teardown),
                },
            };

            tracing::warn!("[{}] connect failed: {err}", self.name);
            self.record_error(&err.to_string()).await;
            self.set_state(LStreamClientState::Disconnected).await;

            if err.is_retryable() {
                // Retry on a timer, but stay responsive to control messages.
                enum Ev2 {
                    Timer,
                    Ctl(Option<ClientCtl>),
                }
                let ev = tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => Ev2::Timer,
                    ctl = self.ctl_rx.recv() => Ev2::Ctl(ctl),
                };
                match ev {
                    Ev2::Timer => continue,
                    Ev2::Ctl(ctl) => match self.handle_ctl(ctl) {
                        CtlAction::Queued | CtlAction::Reconnect => continue,
                        CtlAction::Teardown => return Err(Exit::Teardown),
                    },
                }
            } else {
                // Permanent failure: wait for an explicit reconnect (or
                // retirement) instead of hammering the host.
                loop {
                    let ctl = self.ctl_rx.recv().await;
                    match self.handle_ctl(ctl) {
                        CtlAction::Queued => continue,
                        CtlAction::Reconnect => break,
                        CtlAction::Teardown => return Err(Exit::Teardown),
                    }
                }
            }
        }
    }

    /// Upload (or verify) the agent and probe prerequisites.
    async fn bootstrap_phase(&mut self, conn: &mut ShellConn) -> Result<(), Exit> {
        self.set_state(LStreamClientState::Bootstrapping).await;

        let shell_init = self.log_stream.options.shell_init.clone();
        for stmt in &shell_init {
            self.write(conn, stmt).await?;
        }
        self.write(conn, r#"echo "__logmux:init:$?""#).await?;
        let code = self.await_marker(conn, "__logmux:init:").await?;
        if code != "0" {
            return self.bootstrap_failed(format!("shell init exited with {code}")).await;
        }

        let path = agent::remote_agent_path(&self.client_id);
        let hash = agent::agent_script_sha256();

        // Skip the upload when the exact same script is already in place.
        self.write(
            conn,
            &format!(
                "[ -f '{path}' ] && [ \"$(sha256sum '{path}' 2>/dev/null | cut -d' ' -f1)\" = '{hash}' ] \
                 && echo '__logmux:agent:ok' || echo '__logmux:agent:stale'"
            ),
        )
        .await?;
        let check = self.await_marker(conn, "__logmux:agent:").await?;

        if check != "ok" {
            self.write(
                conn,
                &format!("cat > '{path}' <<'{}'", agent::UPLOAD_EOF_TOKEN),
            )
            .await?;
            for line in agent::AGENT_SCRIPT.lines() {
                self.write(conn, line).await?;
            }
            self.write(conn, agent::UPLOAD_EOF_TOKEN).await?;
            self.write(conn, &format!("chmod +x '{path}'")).await?;
            self.write(conn, r#"echo "__logmux:upload:$?""#).await?;
            let code = self.await_marker(conn, "__logmux:upload:").await?;
            if code != "0" {
                return self
                    .bootstrap_failed(format!("agent upload exited with {code}"))
                    .await;
            }
            tracing::debug!("[{}] agent uploaded to {path}", self.name);
        } else {
            tracing::debug!("[{}] agent already present at {path}", self.name);
        }

        if self.log_stream.uses_journalctl() {
            self.write(
                conn,
                "if journalctl -q -n 1 >/dev/null 2>&1; \
                 then echo '__logmux:journal:ok'; \
                 else echo '__logmux:journal:noaccess'; fi",
            )
            .await?;
            let access = self.await_marker(conn, "__logmux:journal:").await?;
            if access != "ok" {
                self.send_update(LStreamClientUpdatePayload::BootstrapIssue {
                    err: None,
                    warn_journalctl_no_admin_access: true,
                })
                .await;
            }
        }

        self.conn_details.connected = true;
        self.add_conn_message("connected, agent ready").await;
        Ok(())
    }

    /// Serve the command queue until the connection dies or we are asked
    /// to stop.
    async fn connected_phase(&mut self, conn: &mut ShellConn) -> Exit {
        self.set_state(LStreamClientState::ConnectedIdle).await;
        let mut in_flight: Option<InFlight> = None;

        loop {
            if in_flight.is_none() {
                if let Some(cmd) = self.queue.pop_front() {
                    match self.dispatch(conn, cmd).await {
                        Ok(infl) => {
                            in_flight = Some(infl);
                            self.set_state(LStreamClientState::ConnectedBusy).await;
                        }
                        Err(exit) => return exit,
                    }
                    continue;
                }
            }

            enum Ev {
                Ctl(Option<ClientCtl>),
                Line(Option<OutputLine>),
            }
            let ev = tokio::select! {
                ctl = self.ctl_rx.recv() => Ev::Ctl(ctl),
                line = conn.recv() => Ev::Line(line),
            };

            match ev {
                Ev::Ctl(ctl) => match self.handle_ctl(ctl) {
                    CtlAction::Queued => {}
                    CtlAction::Reconnect => {
                        self.fail_in_flight(in_flight.take(), "reconnect requested")
                            .await;
                        return Exit::Reconnect;
                    }
                    CtlAction::Teardown => {
                        self.fail_in_flight(in_flight.take(), "client is shutting down")
                            .await;
                        return Exit::Teardown;
                    }
                },

                Ev::Line(None) => {
                    self.fail_in_flight(in_flight.take(), "connection lost").await;
                    return Exit::ConnLost("connection lost".to_string());
                }

                Ev::Line(Some(output)) => {
                    if self.feed_line(&mut in_flight, output).await {
                        self.set_state(LStreamClientState::ConnectedIdle).await;
                    }
                }
            }
        }
    }

    /// Feed one output line into the in-flight command, if any. Returns
    /// true when the command finished (successfully or not).
    async fn feed_line(&mut self, in_flight: &mut Option<InFlight>, output: OutputLine) -> bool {
        let Some(mut infl) = in_flight.take() else {
            tracing::debug!("[{}] unsolicited output: {}", self.name, output.line);
            return false;
        };

        enum Step {
            Continue,
            Stage(BusyStage),
            PingDone,
            QueryDone,
            QueryFailed(Error),
        }

        let step = match (&mut infl.kind, output.kind) {
            (InFlightKind::Ping, StreamKind::Stdout) => {
                if output.line == "__logmux:pong" {
                    Step::PingDone
                } else {
                    Step::Continue
                }
            }
            (InFlightKind::Ping, StreamKind::Stderr) => Step::Continue,
            (InFlightKind::Query(parser), StreamKind::Stderr) => {
                parser.feed_stderr(&output.line);
                Step::Continue
            }
            (InFlightKind::Query(parser), StreamKind::Stdout) => {
                match parser.feed_stdout(&output.line) {
                    FeedOutcome::Consumed => Step::Continue,
                    FeedOutcome::Stage(stage) => Step::Stage(stage),
                    FeedOutcome::Done => Step::QueryDone,
                    FeedOutcome::Failed(err) => Step::QueryFailed(err),
                }
            }
        };

        match step {
            Step::Continue => {
                *in_flight = Some(infl);
                false
            }
            Step::Stage(stage) => {
                self.send_update(LStreamClientUpdatePayload::BusyStage(stage))
                    .await;
                *in_flight = Some(infl);
                false
            }
            Step::PingDone => {
                self.respond(infl.resp_tx, Ok(LogResp::default())).await;
                true
            }
            Step::QueryDone => {
                let InFlightKind::Query(parser) = infl.kind else {
                    unreachable!("query completion for a non-query command");
                };
                self.respond(infl.resp_tx, Ok(parser.into_resp())).await;
                true
            }
            Step::QueryFailed(err) => {
                self.respond(infl.resp_tx, Err(err)).await;
                true
            }
        }
    }

    /// Write the command invocation for `cmd` and return its in-flight
    /// tracking state. On a write failure the command is reported as failed
    /// before the error propagates, so the manager never waits on it.
    async fn dispatch(
        &mut self,
        conn: &mut ShellConn,
        cmd: LStreamCmd,
    ) -> Result<InFlight, Exit> {
        let (invocation, kind) = match cmd.kind {
            LStreamCmdKind::Ping => (
                "echo '__logmux:pong'".to_string(),
                InFlightKind::Ping,
            ),
            LStreamCmdKind::QueryLogs(query) => {
                let invocation = self.build_query_invocation(&query);
                tracing::debug!("[{}] running: {invocation}", self.name);
                (invocation, InFlightKind::Query(ResponseParser::new(&self.name)))
            }
        };

        match self.write(conn, &invocation).await {
            Ok(()) => Ok(InFlight {
                kind,
                resp_tx: cmd.resp_tx,
            }),
            Err(exit) => {
                self.respond(
                    cmd.resp_tx,
                    Err(Error::Transport(TransportError::Closed(
                        "connection lost while dispatching".to_string(),
                    ))),
                )
                .await;
                Err(exit)
            }
        }
    }

    fn build_query_invocation(&self, query: &QueryLogsCmd) -> String {
        let path = agent::remote_agent_path(&self.client_id);
        let mut parts = vec![format!("sh '{path}'")];

        if self.log_stream.uses_journalctl() {
            parts.push("--journalctl".to_string());
        } else {
            let files = &self.log_stream.log_files;
            parts.push(format!("--last {}", shell_quote(&files[0])));
            parts.push(format!("--prev {}", shell_quote(&files[1])));
        }

        parts.push(format!("--from {}", query.from.timestamp()));
        if let Some(to) = query.to {
            parts.push(format!("--to {}", to.timestamp()));
        }
        parts.push(format!("--max-lines {}", query.max_num_lines));
        if !query.query.is_empty() {
            parts.push(format!("--query {}", shell_quote(&query.query)));
        }
        if query.refresh_index {
            parts.push("--refresh-index".to_string());
        }
        if let Some(until) = query.lines_until {
            parts.push(format!("--lines-until {until}"));
        }
        if let Some(cursor) = query.timestamp_until {
            parts.push(format!("--until-time {}", cursor.time.timestamp()));
            parts.push(format!("--until-num-msgs {}", cursor.num_msgs));
        }

        parts.join(" ")
    }

    /// Wait for a `<prefix><rest>` marker line on stdout, collecting any
    /// stray output into the connection messages.
    async fn await_marker(
        &mut self,
        conn: &mut ShellConn,
        prefix: &str,
    ) -> Result<String, Exit> {
        let deadline = tokio::time::Instant::now() + BOOTSTRAP_STEP_TIMEOUT;

        loop {
            enum Ev {
                Timeout,
                Ctl(Option<ClientCtl>),
                Line(Option<OutputLine>),
            }
            let ev = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => Ev::Timeout,
                ctl = self.ctl_rx.recv() => Ev::Ctl(ctl),
                line = conn.recv() => Ev::Line(line),
            };

            match ev {
                Ev::Timeout => {
                    return Err(Exit::ConnLost(format!(
                        "timed out waiting for bootstrap step ({prefix})"
                    )))
                }
                Ev::Ctl(ctl) => match self.handle_ctl(ctl) {
                    CtlAction::Queued => {}
                    CtlAction::Reconnect => return Err(Exit::Reconnect),
                    CtlAction::Teardown => return Err(Exit::Teardown),
                },
                Ev::Line(None) => {
                    return Err(Exit::ConnLost("connection lost during bootstrap".to_string()))
                }
                Ev::Line(Some(output)) => match output.kind {
                    StreamKind::Stdout => {
                        if let Some(rest) = output.line.strip_prefix(prefix) {
                            return Ok(rest.to_string());
                        }
                        tracing::trace!("[{}] bootstrap noise: {}", self.name, output.line);
                    }
                    StreamKind::Stderr => {
                        tracing::debug!("[{}] bootstrap stderr: {}", self.name, output.line);
                    }
                },
            }
        }
    }

    async fn write(&mut self, conn: &mut ShellConn, line: &str) -> Result<(), Exit> {
        conn.write_line(line)
            .await
            .map_err(|e| Exit::ConnLost(e.to_string()))
    }

    async fn bootstrap_failed(&mut self, msg: String) -> Result<(), Exit> {
        tracing::warn!("[{}] bootstrap failed: {msg}", self.name);
        self.send_update(LStreamClientUpdatePayload::BootstrapIssue {
            err: Some(msg.clone()),
            warn_journalctl_no_admin_access: false,
        })
        .await;
        self.record_error(&msg).await;
        Err(Exit::ConnLost(msg))
    }

    fn handle_ctl(&mut self, ctl: Option<ClientCtl>) -> CtlAction {
        match ctl {
            // All handles dropped: treat like retirement under the current
            // name.
            None => CtlAction::Teardown,
            Some(ClientCtl::Cmd(cmd)) => {
                self.queue.push_back(cmd);
                CtlAction::Queued
            }
            Some(ClientCtl::Reconnect) => CtlAction::Reconnect,
            Some(ClientCtl::Close { retired_name }) => {
                tracing::debug!("[{}] retiring as {retired_name}", self.name);
                self.name = retired_name;
                CtlAction::Teardown
            }
        }
    }

    /// Fail the in-flight command (if any) so the manager never waits for a
    /// response that cannot come.
    async fn fail_in_flight(&mut self, in_flight: Option<InFlight>, reason: &str) {
        if let Some(infl) = in_flight {
            self.respond(
                infl.resp_tx,
                Err(Error::Transport(TransportError::Closed(reason.to_string()))),
            )
            .await;
        }
    }

    async fn respond(
        &self,
        resp_tx: Option<mpsc::Sender<LStreamCmdRes>>,
        result: Result<LogResp, Error>,
    ) {
        if let Some(tx) = resp_tx {
            let _ = tx
                .send(LStreamCmdRes {
                    lstream: self.name.clone(),
                    result,
                })
                .await;
        }
    }

    async fn drop_conn(&mut self, mut conn: ShellConn, reason: &str) {
        self.set_state(LStreamClientState::Disconnecting).await;
        conn.close(reason);
        conn.wait_closed().await;
        self.conn_details.connected = false;
        self.set_state(LStreamClientState::Disconnected).await;
    }

    /// Final shutdown: close the connection, fail anything still queued,
    /// and report TornDown under the (possibly retired) name.
    async fn teardown(&mut self, conn: Option<ShellConn>) {
        self.set_state(LStreamClientState::Disconnecting).await;

        if let Some(mut conn) = conn {
            conn.close("client is shutting down");
            conn.wait_closed().await;
        }

        for cmd in std::mem::take(&mut self.queue) {
            self.respond(
                cmd.resp_tx,
                Err(Error::Transport(TransportError::Closed(
                    "client is shutting down".to_string(),
                ))),
            )
            .await;
        }

        tracing::debug!("[{}] torn down", self.name);
        self.send_update(LStreamClientUpdatePayload::TornDown).await;
    }

    async fn set_state(&mut self, new: LStreamClientState) {
        if self.state == new {
            return;
        }
        let old = self.state;
        self.state = new;
        self.send_update(LStreamClientUpdatePayload::State { old, new }).await;
    }

    async fn add_conn_message(&mut self, msg: &str) {
        self.conn_details.messages.push(msg.to_string());
        self.send_update(LStreamClientUpdatePayload::ConnDetails(
            self.conn_details.clone(),
        ))
        .await;
    }

    async fn record_error(&mut self, err: &str) {
        self.conn_details.err = Some(err.to_string());
        self.send_update(LStreamClientUpdatePayload::ConnDetails(
            self.conn_details.clone(),
        ))
        .await;
    }

    async fn send_update(&self, payload: LStreamClientUpdatePayload) {
        let _ = self
            .updates_tx
            .send(LStreamClientUpdate {
                name: self.name.clone(),
                payload,
            })
            .await;
    }
}

enum CtlAction {
    /// A command was queued; stay in the current phase.
    Queued,
    Reconnect,
    Teardown,
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{LogStreamOptions, ShellTransportConfig};
    use crate::transport::mock::MockShell;

    fn test_stream(name: &str, files: &[&str]) -> LogStream {
        LogStream {
            name: name.to_string(),
            transport: ShellTransportConfig::Localhost,
            log_files: files.iter().map(|s| s.to_string()).collect(),
            options: LogStreamOptions::default(),
        }
    }

    fn spawn_client(
        stream: LogStream,
        shell: &MockShell,
    ) -> (LStreamClient, mpsc::Receiver<LStreamClientUpdate>) {
        let (updates_tx, updates_rx) = mpsc::channel(128);
        let client = LStreamClient::new(LStreamClientParams {
            log_stream: stream,
            client_id: "test".to_string(),
            transport: Arc::new(shell.clone()),
            updates_tx,
        });
        (client, updates_rx)
    }

    async fn wait_for_state(
        updates_rx: &mut mpsc::Receiver<LStreamClientUpdate>,
        want: LStreamClientState,
    ) {
        loop {
            let upd = tokio::time::timeout(Duration::from_secs(5), updates_rx.recv())
                .await
                .expect("timed out waiting for state update")
                .expect("update channel closed");
            if let LStreamClientUpdatePayload::State { new, .. } = upd.payload {
                if new == want {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn connects_and_bootstraps() {
        let shell = MockShell::new();
        let stream = test_stream("h1", &["/var/log/syslog", "auto"]);
        let (_client, mut updates_rx) = spawn_client(stream, &shell);

        wait_for_state(&mut updates_rx, LStreamClientState::ConnectedIdle).await;

        let written = shell.written_lines();
        assert!(
            written.iter().any(|l| l.contains("sha256sum")),
            "agent hash check missing: {written:?}"
        );
        assert!(
            written.iter().any(|l| l.starts_with("cat > ")),
            "agent upload missing: {written:?}"
        );
    }

    #[tokio::test]
    async fn query_roundtrip() {
        let shell = MockShell::new();
        shell.script_response(&[
            "s:1:0:scanning",
            "l:2026-08-02T10:00:00\tinfo\t/var/log/syslog\t1\t1\t\thello",
            "m:29715840:1",
            "d:",
        ]);

        let stream = test_stream("h1", &["/var/log/syslog", "auto"]);
        let (client, mut updates_rx) = spawn_client(stream, &shell);
        wait_for_state(&mut updates_rx, LStreamClientState::ConnectedIdle).await;

        let (resp_tx, mut resp_rx) = mpsc::channel(8);
        client.enqueue_cmd(LStreamCmd {
            kind: LStreamCmdKind::QueryLogs(QueryLogsCmd {
                max_num_lines: 10,
                from: DateTime::from_timestamp(0, 0).unwrap(),
                to: None,
                query: String::new(),
                refresh_index: false,
                lines_until: None,
                timestamp_until: None,
            }),
            resp_tx: Some(resp_tx),
        });

        let res = tokio::time::timeout(Duration::from_secs(5), resp_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.lstream, "h1");
        let resp = res.result.unwrap();
        assert_eq!(resp.logs.len(), 1);
        assert_eq!(resp.logs[0].lstream_name(), "h1");
        assert_eq!(resp.minute_stats[&29_715_840].num_msgs, 1);
    }

    #[tokio::test]
    async fn retirement_emits_torndown_under_new_name() {
        let shell = MockShell::new();
        let stream = test_stream("h1", &["/var/log/syslog", "auto"]);
        let (client, mut updates_rx) = spawn_client(stream, &shell);
        wait_for_state(&mut updates_rx, LStreamClientState::ConnectedIdle).await;

        client.close("OLD_0001_h1".to_string());

        loop {
            let upd = tokio::time::timeout(Duration::from_secs(5), updates_rx.recv())
                .await
                .expect("timed out waiting for TornDown")
                .expect("update channel closed");
            if matches!(upd.payload, LStreamClientUpdatePayload::TornDown) {
                assert_eq!(upd.name, "OLD_0001_h1");
                return;
            }
        }
    }
}
