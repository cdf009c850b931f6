//! The logstreams manager: one event loop coordinating every per-stream
//! client.
//!
//! The manager owns all mutable bookkeeping. Clients never reach back into
//! it; they only write to the update channel (and to per-command response
//! channels they receive with each command), so there is no shared-mutable
//! graph anywhere. Requests from the embedding application, client updates,
//! command responses and the teardown signal all funnel into one
//! `select!`-driven loop.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};

use crate::client::{
    LStreamClient, LStreamClientParams, LStreamClientState, LStreamClientUpdate,
    LStreamClientUpdatePayload, LStreamCmd, LStreamCmdKind, LStreamCmdRes, QueryLogsCmd,
    TimeAndNumMsgs,
};
use crate::config::{ConfigLogStreams, SshConfig};
use crate::error::Error;
use crate::resolver::{
    LStreamsResolver, LStreamsResolverParams, LogStream, ShellTransportConfig,
    DEFAULT_SSH_SHELL_COMMAND,
};
use crate::transport::localhost::LocalhostTransport;
use crate::transport::shell_cmd::CustomCmdTransport;
use crate::transport::ssh::SshTransport;
use crate::transport::{EphemeralKeyProvider, ShellTransport};
use crate::types::{BusyStage, ConnDetails, LogRespTotal, QueryRequest};

pub mod merge;
pub mod state;

pub use state::{BootstrapIssue, ManagerState, ManagerUpdate};

use merge::MergedLogs;

/// How new connections are made for SSH-reachable streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// In-process SSH client.
    SshLib,
    /// External `ssh` binary via the default shell command template.
    ExternalCmd,
}

/// Immutable credential material shared by every transport.
pub struct TransportShared {
    pub ssh_keys: Vec<PathBuf>,
    pub ephemeral: Arc<dyn EphemeralKeyProvider>,
}

/// Builds a transport for a resolved stream. Swappable so tests can hand
/// out scripted mock shells instead of real connections.
pub trait TransportFactory: Send + Sync {
    fn create(&self, stream: &LogStream, shared: &TransportShared) -> Arc<dyn ShellTransport>;
}

/// The production factory: picks the transport the resolver selected.
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, stream: &LogStream, shared: &TransportShared) -> Arc<dyn ShellTransport> {
        match &stream.transport {
            ShellTransportConfig::SshLib { addr, user } => Arc::new(SshTransport::new(
                addr.clone(),
                user.clone(),
                shared.ssh_keys.clone(),
                Arc::clone(&shared.ephemeral),
            )),
            ShellTransportConfig::CustomCmd {
                shell_command,
                env_override,
            } => Arc::new(CustomCmdTransport {
                shell_command: shell_command.clone(),
                env_override: env_override.clone(),
            }),
            ShellTransportConfig::Localhost => Arc::new(LocalhostTransport),
        }
    }
}

pub struct LStreamsManagerParams {
    pub config_log_streams: ConfigLogStreams,
    pub ssh_config: SshConfig,
    pub ssh_keys: Vec<PathBuf>,
    pub ephemeral_key_provider: Arc<dyn EphemeralKeyProvider>,

    pub initial_lstreams: String,
    pub initial_transport_mode: TransportMode,

    /// Filename-friendly tag appended to remote agent filenames so
    /// concurrent instances on the same hosts never collide.
    pub client_id: String,

    /// Username for the resolver's last-resort default. Taken from the
    /// environment when `None`.
    pub cur_os_user: Option<String>,

    pub updates_tx: mpsc::Sender<ManagerUpdate>,

    /// Override for tests; `None` means real transports.
    pub transport_factory: Option<Arc<dyn TransportFactory>>,
}

enum ManagerReq {
    QueryLogs(QueryRequest),
    SetLStreams {
        spec: String,
        reply_tx: oneshot::Sender<Result<(), Error>>,
    },
    SetTransportMode {
        mode: TransportMode,
        reply_tx: oneshot::Sender<()>,
    },
    Ping,
    Reconnect,
    Disconnect,
}

/// Handle to a running manager. All methods are safe to call from any
/// task; they talk to the event loop over channels.
pub struct LStreamsManager {
    req_tx: mpsc::Sender<ManagerReq>,
    teardown_tx: mpsc::Sender<()>,
    done_rx: watch::Receiver<bool>,
}

impl LStreamsManager {
    /// Resolve the initial spec, spawn the event loop, and return the
    /// handle. Fails only if the initial spec does not resolve.
    pub fn new(params: LStreamsManagerParams) -> Result<LStreamsManager, Error> {
        let (req_tx, req_rx) = mpsc::channel(8);
        let (teardown_tx, teardown_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(false);
        let (client_update_tx, client_update_rx) = mpsc::channel(1024);
        let (cmd_res_tx, cmd_res_rx) = mpsc::channel(64);

        let cur_os_user = params.cur_os_user.clone().unwrap_or_else(|| {
            std::env::var("USER")
                .or_else(|_| std::env::var("LOGNAME"))
                .unwrap_or_else(|_| "root".to_string())
        });

        let mut inner = ManagerInner {
            config_log_streams: params.config_log_streams,
            ssh_config: params.ssh_config,
            shared: TransportShared {
                ssh_keys: params.ssh_keys,
                ephemeral: params.ephemeral_key_provider,
            },
            transport_factory: params
                .transport_factory
                .unwrap_or_else(|| Arc::new(DefaultTransportFactory)),
            client_id: params.client_id,
            cur_os_user,
            transport_mode: params.initial_transport_mode,
            lstreams_spec: String::new(),
            parsed_log_streams: HashMap::new(),
            clients: HashMap::new(),
            client_states: HashMap::new(),
            conn_details: HashMap::new(),
            busy_stages: HashMap::new(),
            pending_teardown: HashMap::new(),
            by_state: HashMap::new(),
            num_not_connected: 0,
            retire_counter: 0,
            tearing_down: false,
            cur_query: None,
            cur_logs: MergedLogs::default(),
            updates_tx: params.updates_tx,
            client_update_tx,
            client_update_rx,
            cmd_res_tx,
            cmd_res_rx,
            req_rx,
            teardown_rx,
            done_tx,
        };

        inner.set_lstreams_spec(&params.initial_lstreams)?;
        tokio::spawn(inner.run());

        Ok(LStreamsManager {
            req_tx,
            teardown_tx,
            done_rx,
        })
    }

    /// Submit a query. Non-blocking; the result (or an admission error)
    /// arrives on the update channel as a `LogResp`.
    pub async fn query_logs(&self, req: QueryRequest) {
        let _ = self.req_tx.send(ManagerReq::QueryLogs(req)).await;
    }

    /// Replace the logstream spec. Blocks until the manager accepts or
    /// rejects it.
    pub async fn set_lstreams(&self, spec: &str) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(ManagerReq::SetLStreams {
                spec: spec.to_string(),
                reply_tx,
            })
            .await
            .map_err(|_| Error::ManagerClosed)?;
        reply_rx.await.map_err(|_| Error::ManagerClosed)?
    }

    /// Switch between the in-process SSH client and the external `ssh`
    /// command. Existing clients are recreated under the new mode. Blocks
    /// until applied.
    pub async fn set_transport_mode(&self, mode: TransportMode) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(ManagerReq::SetTransportMode { mode, reply_tx })
            .await
            .map_err(|_| Error::ManagerClosed)?;
        reply_rx.await.map_err(|_| Error::ManagerClosed)
    }

    /// Fan a keepalive out to every client.
    pub async fn ping(&self) {
        let _ = self.req_tx.send(ManagerReq::Ping).await;
    }

    /// Drop any in-flight query and reconnect every client.
    pub async fn reconnect(&self) {
        let _ = self.req_tx.send(ManagerReq::Reconnect).await;
    }

    /// Drop any in-flight query, clear the spec, and retire every client.
    pub async fn disconnect(&self) {
        let _ = self.req_tx.send(ManagerReq::Disconnect).await;
    }

    /// Initiate shutdown. Does not wait; see [`LStreamsManager::wait`].
    pub fn close(&self) {
        let _ = self.teardown_tx.try_send(());
    }

    /// Wait until teardown has fully completed: every client created over
    /// the manager's life has reported torn down.
    pub async fn wait(&self) {
        let mut done_rx = self.done_rx.clone();
        let _ = done_rx.wait_for(|done| *done).await;
    }
}

struct QueryCtx {
    req: QueryRequest,
    started: Instant,
    resps: HashMap<String, crate::types::LogResp>,
    errs: HashMap<String, Error>,
}

struct ManagerInner {
    config_log_streams: ConfigLogStreams,
    ssh_config: SshConfig,
    shared: TransportShared,
    transport_factory: Arc<dyn TransportFactory>,
    client_id: String,
    cur_os_user: String,
    transport_mode: TransportMode,

    lstreams_spec: String,
    parsed_log_streams: HashMap<String, LogStream>,

    clients: HashMap<String, LStreamClient>,
    client_states: HashMap<String, LStreamClientState>,
    /// Entries exist for every selected stream, connected or not.
    conn_details: HashMap<String, ConnDetails>,
    /// Entries exist only for streams currently in the busy state.
    busy_stages: HashMap<String, BusyStage>,
    /// Retired keys still draining, with the number of clients under each
    /// key (always 1, since retired keys are unique by construction).
    pending_teardown: HashMap<String, usize>,

    by_state: HashMap<LStreamClientState, BTreeSet<String>>,
    num_not_connected: usize,

    /// Monotonic source for retired-key uniqueness.
    retire_counter: u64,

    tearing_down: bool,
    cur_query: Option<QueryCtx>,
    cur_logs: MergedLogs,

    updates_tx: mpsc::Sender<ManagerUpdate>,
    client_update_tx: mpsc::Sender<LStreamClientUpdate>,
    client_update_rx: mpsc::Receiver<LStreamClientUpdate>,
    cmd_res_tx: mpsc::Sender<LStreamCmdRes>,
    cmd_res_rx: mpsc::Receiver<LStreamCmdRes>,
    req_rx: mpsc::Receiver<ManagerReq>,
    teardown_rx: mpsc::Receiver<()>,
    done_tx: watch::Sender<bool>,
}

impl ManagerInner {
    async fn run(mut self) {
        self.update_clients();
        self.update_by_state();
        self.send_state().await;

        loop {
            enum Ev {
                ClientUpdate(LStreamClientUpdate),
                Req(ManagerReq),
                CmdRes(LStreamCmdRes),
                Teardown,
            }

            let ev = tokio::select! {
                Some(upd) = self.client_update_rx.recv() => Ev::ClientUpdate(upd),
                Some(req) = self.req_rx.recv() => Ev::Req(req),
                Some(res) = self.cmd_res_rx.recv() => Ev::CmdRes(res),
                Some(()) = self.teardown_rx.recv() => Ev::Teardown,
                else => {
                    tracing::debug!("manager inputs closed, exiting");
                    return;
                }
            };

            let exit = match ev {
                Ev::ClientUpdate(upd) => self.on_client_update(upd).await,
                Ev::Req(req) => {
                    self.on_req(req).await;
                    false
                }
                Ev::CmdRes(res) => {
                    self.on_cmd_res(res).await;
                    false
                }
                Ev::Teardown => self.on_teardown().await,
            };

            if exit {
                tracing::info!("logstreams manager teardown completed");
                let _ = self.done_tx.send(true);
                return;
            }
        }
    }

    /// Returns true when the whole manager is done (last teardown landed).
    async fn on_client_update(&mut self, upd: LStreamClientUpdate) -> bool {
        let name = upd.name;
        match upd.payload {
            LStreamClientUpdatePayload::State { old, new } => {
                if self.client_states.contains_key(&name) {
                    tracing::debug!("client {name}: {old} -> {new}");
                    self.client_states.insert(name.clone(), new);

                    if new.is_connected() {
                        self.conn_details.entry(name.clone()).or_default().connected = true;
                    }
                    if new != LStreamClientState::ConnectedBusy {
                        self.busy_stages.remove(&name);
                    }
                } else if self.pending_teardown.contains_key(&name) {
                    tracing::debug!("retiring client {name}: {old} -> {new}");
                } else {
                    tracing::warn!("state update from unknown client {name}: {old} -> {new}");
                }

                self.update_by_state();
                self.send_state().await;
            }

            LStreamClientUpdatePayload::ConnDetails(details) => {
                tracing::debug!("conn details for {name}: {details:?}");
                self.conn_details.insert(name, details);
                self.send_state().await;
            }

            LStreamClientUpdatePayload::BootstrapIssue {
                err,
                warn_journalctl_no_admin_access,
            } => {
                self.send_update(ManagerUpdate::BootstrapIssue(BootstrapIssue {
                    lstream_name: name,
                    err,
                    warn_journalctl_no_admin_access,
                }))
                .await;
            }

            LStreamClientUpdatePayload::BusyStage(stage) => {
                self.busy_stages.insert(name, stage);
                self.send_state().await;
            }

            LStreamClientUpdatePayload::DataRequest(req) => {
                self.send_update(ManagerUpdate::DataRequest(req)).await;
            }

            LStreamClientUpdatePayload::TornDown => {
                match self.pending_teardown.get_mut(&name) {
                    Some(count) if *count > 1 => *count -= 1,
                    Some(_) => {
                        self.pending_teardown.remove(&name);
                    }
                    None => {
                        tracing::warn!("TornDown from a client that was not retiring: {name}");
                    }
                }

                let still_pending: usize = self.pending_teardown.values().sum();
                if still_pending == 0 {
                    tracing::debug!("client {name} torn down, none pending");
                    if self.tearing_down {
                        return true;
                    }
                } else {
                    tracing::debug!("client {name} torn down, {still_pending} still pending");
                }

                self.send_state().await;
            }
        }

        false
    }

    async fn on_req(&mut self, req: ManagerReq) {
        match req {
            ManagerReq::QueryLogs(query) => self.on_query_logs(query).await,

            ManagerReq::SetLStreams { spec, reply_tx } => {
                tracing::info!("setting logstreams spec: {spec:?}");
                if self.cur_query.is_some() {
                    let _ = reply_tx.send(Err(Error::BusyWithAnotherQuery));
                    return;
                }
                if let Err(e) = self.set_lstreams_spec(&spec) {
                    let _ = reply_tx.send(Err(e));
                    return;
                }

                self.update_clients();
                self.update_by_state();
                self.send_state().await;
                let _ = reply_tx.send(Ok(()));
            }

            ManagerReq::SetTransportMode { mode, reply_tx } => {
                self.set_transport_mode(mode).await;
                let _ = reply_tx.send(());
            }

            ManagerReq::Ping => {
                for client in self.clients.values() {
                    client.enqueue_cmd(LStreamCmd {
                        kind: LStreamCmdKind::Ping,
                        resp_tx: None,
                    });
                }
            }

            ManagerReq::Reconnect => {
                tracing::info!("reconnect requested");
                if self.cur_query.take().is_some() {
                    tracing::info!("forgetting the in-progress query");
                }
                for client in self.clients.values() {
                    client.reconnect();
                }
                // No state recomputation here: the clients' states are
                // already changing, and we'll hear about it through their
                // updates in this same loop.
            }

            ManagerReq::Disconnect => {
                tracing::info!("disconnect requested");
                if self.cur_query.take().is_some() {
                    tracing::info!("forgetting the in-progress query");
                }
                // The empty spec always resolves.
                let _ = self.set_lstreams_spec("");
                self.update_clients();
                self.update_by_state();
                self.send_state().await;
            }
        }
    }

    async fn on_query_logs(&mut self, req: QueryRequest) {
        if self.clients.is_empty() {
            self.send_log_resp(error_resp(Error::NoMatchingLStreams), None)
                .await;
            return;
        }
        if self.num_not_connected > 0 {
            self.send_log_resp(error_resp(Error::NotYetConnected), None)
                .await;
            return;
        }
        if self.cur_query.is_some() {
            self.send_log_resp(error_resp(Error::BusyWithAnotherQuery), None)
                .await;
            return;
        }

        assert!(req.max_num_lines >= 2, "max_num_lines must be at least 2");

        self.cur_query = Some(QueryCtx {
            req: req.clone(),
            started: Instant::now(),
            resps: HashMap::new(),
            errs: HashMap::new(),
        });

        // State must go out after the query context is in place, so
        // observers see busy=true.
        self.send_state().await;

        for (name, client) in &self.clients {
            let mut cmd = QueryLogsCmd {
                max_num_lines: req.max_num_lines,
                from: req.from,
                to: req.to,
                query: req.query.clone(),
                refresh_index: req.refresh_index,
                lines_until: None,
                timestamp_until: None,
            };

            if req.load_earlier {
                // Tell the agent where the rows we already hold begin, so
                // it only returns older ones. Journal streams have no
                // stable line numbers, so they get a timestamp cursor
                // instead.
                let journal = self
                    .parsed_log_streams
                    .get(name)
                    .is_some_and(LogStream::uses_journalctl);
                if journal {
                    cmd.timestamp_until = self
                        .cur_logs
                        .earliest_cursor(name)
                        .map(|(time, num_msgs)| TimeAndNumMsgs { time, num_msgs });
                } else {
                    cmd.lines_until = self.cur_logs.earliest_combined_linenumber(name);
                }
            }

            client.enqueue_cmd(LStreamCmd {
                kind: LStreamCmdKind::QueryLogs(cmd),
                resp_tx: Some(self.cmd_res_tx.clone()),
            });
        }
    }

    async fn on_cmd_res(&mut self, res: LStreamCmdRes) {
        let Some(ctx) = self.cur_query.as_mut() else {
            tracing::debug!("dropping response from {}: no query in progress", res.lstream);
            return;
        };

        match res.result {
            Ok(resp) => {
                tracing::debug!("got logs from {}", res.lstream);
                ctx.resps.insert(res.lstream, resp);
            }
            Err(e) => {
                tracing::error!("error response from {}: {e}", res.lstream);
                ctx.errs.insert(res.lstream, e);
            }
        }

        let received = ctx.resps.len() + ctx.errs.len();
        if received < self.clients.len() {
            tracing::debug!("{} responses to go", self.clients.len() - received);
            return;
        }

        let ctx = self.cur_query.take().expect("query context vanished");
        self.merge_and_send(ctx).await;
        self.send_state().await;
    }

    async fn merge_and_send(&mut self, ctx: QueryCtx) {
        let query_dur = ctx.started.elapsed();

        if !ctx.errs.is_empty() {
            let mut errs: Vec<Error> = ctx
                .errs
                .into_iter()
                .map(|(name, e)| e.annotated(name))
                .collect();
            errs.sort_by_key(|e| e.to_string());

            self.send_log_resp(
                LogRespTotal {
                    errs,
                    ..Default::default()
                },
                Some(query_dur),
            )
            .await;
            return;
        }

        let debug_info = ctx
            .resps
            .iter()
            .map(|(name, resp)| (name.clone(), resp.debug_info.clone()))
            .collect();

        if ctx.req.load_earlier {
            self.cur_logs.prepend_earlier(ctx.resps, ctx.req.max_num_lines);
        } else {
            self.cur_logs.reset(ctx.resps, ctx.req.max_num_lines);
        }

        let total = self.cur_logs.collect(ctx.req.load_earlier, debug_info);
        self.send_log_resp(total, Some(query_dur)).await;
    }

    async fn on_teardown(&mut self) -> bool {
        tracing::info!("logstreams manager teardown started");
        self.tearing_down = true;
        if self.cur_query.take().is_some() {
            tracing::info!("forgetting the in-progress query");
        }

        let _ = self.set_lstreams_spec("");
        self.update_clients();
        self.update_by_state();

        let pending: usize = self.pending_teardown.values().sum();
        if pending == 0 {
            return true;
        }

        tracing::debug!("waiting for {pending} client(s) to tear down");
        self.send_state().await;
        false
    }

    async fn set_transport_mode(&mut self, mode: TransportMode) {
        if self.transport_mode == mode {
            return;
        }
        tracing::info!("switching transport mode to {mode:?}");

        // Reset: drop every client under the old mode, then re-create the
        // same spec under the new one.
        let spec = self.lstreams_spec.clone();

        let _ = self.set_lstreams_spec("");
        self.update_clients();
        self.update_by_state();

        self.transport_mode = mode;

        if let Err(e) = self.set_lstreams_spec(&spec) {
            tracing::warn!("spec {spec:?} no longer resolves under {mode:?}: {e}");
        }
        self.update_clients();
        self.update_by_state();

        self.send_state().await;
    }

    /// Re-run the resolver for `spec` and remember the outcome. Does not
    /// touch clients; call [`Self::update_clients`] after.
    fn set_lstreams_spec(&mut self, spec: &str) -> Result<(), Error> {
        let custom_shell_command = match self.transport_mode {
            TransportMode::SshLib => None,
            TransportMode::ExternalCmd => Some(DEFAULT_SSH_SHELL_COMMAND.to_string()),
        };

        let resolver = LStreamsResolver::new(LStreamsResolverParams {
            cur_os_user: self.cur_os_user.clone(),
            custom_shell_command,
            config_log_streams: self.config_log_streams.clone(),
            ssh_config: self.ssh_config.clone(),
        });

        let parsed = resolver.resolve(spec)?;

        self.lstreams_spec = spec.to_string();
        self.parsed_log_streams = parsed;
        Ok(())
    }

    /// Retire clients whose names disappeared from the spec and create
    /// clients for names that appeared.
    fn update_clients(&mut self) {
        let stale: Vec<String> = self
            .clients
            .keys()
            .filter(|name| !self.parsed_log_streams.contains_key(*name))
            .cloned()
            .collect();

        for name in stale {
            tracing::debug!("retiring client {name}");
            let client = self.clients.remove(&name).expect("stale key must exist");
            self.client_states.remove(&name);
            self.conn_details.remove(&name);
            self.busy_stages.remove(&name);

            self.retire_counter += 1;
            let retired = format!("OLD_{:04}_{}", self.retire_counter, name);
            *self.pending_teardown.entry(retired.clone()).or_insert(0) += 1;
            client.close(retired);
        }

        for (name, stream) in &self.parsed_log_streams {
            if self.clients.contains_key(name) {
                continue;
            }

            tracing::debug!("creating client {name}");
            let transport = self.transport_factory.create(stream, &self.shared);
            let client = LStreamClient::new(LStreamClientParams {
                log_stream: stream.clone(),
                client_id: self.client_id.clone(),
                transport,
                updates_tx: self.client_update_tx.clone(),
            });
            self.clients.insert(name.clone(), client);
            self.client_states
                .insert(name.clone(), LStreamClientState::Disconnected);
        }
    }

    fn update_by_state(&mut self) {
        self.num_not_connected = 0;
        self.by_state.clear();

        for (name, state) in &self.client_states {
            self.by_state
                .entry(*state)
                .or_default()
                .insert(name.clone());
            if !state.is_connected() {
                self.num_not_connected += 1;
            }
        }
    }

    async fn send_state(&mut self) {
        let num_connected = self
            .client_states
            .values()
            .filter(|s| s.is_connected())
            .count();

        let mut tearing_down: Vec<String> = Vec::new();
        for (name, count) in &self.pending_teardown {
            for _ in 0..*count {
                tearing_down.push(name.clone());
            }
        }
        tearing_down.sort();

        let state = ManagerState {
            num_lstreams: self.clients.len(),
            lstreams_by_state: self.by_state.clone(),
            num_connected,
            connected: self.num_not_connected == 0 && num_connected > 0,
            no_matching_lstreams: self.num_not_connected == 0 && num_connected == 0,
            busy: self.cur_query.is_some(),
            conn_details_by_lstream: self.conn_details.clone(),
            busy_stage_by_lstream: self.busy_stages.clone(),
            tearing_down,
        };

        self.send_update(ManagerUpdate::State(state)).await;
    }

    async fn send_log_resp(&mut self, mut resp: LogRespTotal, dur: Option<std::time::Duration>) {
        if let Some(dur) = dur {
            resp.query_dur = dur;
        } else if let Some(ctx) = &self.cur_query {
            resp.query_dur = ctx.started.elapsed();
        }
        self.send_update(ManagerUpdate::LogResp(resp)).await;
    }

    async fn send_update(&mut self, update: ManagerUpdate) {
        if self.updates_tx.send(update).await.is_err() {
            tracing::warn!("observer update channel closed");
        }
    }
}

fn error_resp(err: Error) -> LogRespTotal {
    LogRespTotal {
        errs: vec![err],
        ..Default::default()
    }
}
