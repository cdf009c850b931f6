//! Aggregate manager state, derived fresh on every change.

use std::collections::{BTreeSet, HashMap};

use crate::client::LStreamClientState;
use crate::transport::DataRequest;
use crate::types::{BusyStage, ConnDetails, LogRespTotal};

/// A point-in-time snapshot of the whole cluster, emitted to the observer
/// on every change. Observers may coalesce bursts of these and keep only
/// the latest.
#[derive(Debug, Clone, Default)]
pub struct ManagerState {
    pub num_lstreams: usize,
    /// Stream names grouped by client state; names are kept sorted so
    /// snapshots render stably.
    pub lstreams_by_state: HashMap<LStreamClientState, BTreeSet<String>>,
    /// How many streams are actually connected.
    pub num_connected: usize,
    /// True when there are streams and every one of them is connected.
    pub connected: bool,
    /// True when the spec matched no streams at all.
    pub no_matching_lstreams: bool,
    /// True while a query is in flight.
    pub busy: bool,
    pub conn_details_by_lstream: HashMap<String, ConnDetails>,
    /// Only streams currently in the busy state have an entry here.
    pub busy_stage_by_lstream: HashMap<String, BusyStage>,
    /// Retired client keys still draining, sorted.
    pub tearing_down: Vec<String>,
}

/// A non-fatal or fatal issue raised while preparing a stream's agent,
/// distinct from query errors.
#[derive(Debug, Clone)]
pub struct BootstrapIssue {
    pub lstream_name: String,
    pub err: Option<String>,
    /// Journal streams only: set when the remote user cannot read the
    /// whole journal. A dedicated flag so it can be suppressed by
    /// configuration.
    pub warn_journalctl_no_admin_access: bool,
}

/// One message on the observer channel. Exactly one variant per message;
/// `State` may be coalesced by the observer, the rest must be handled
/// individually.
#[derive(Debug)]
pub enum ManagerUpdate {
    State(ManagerState),
    LogResp(LogRespTotal),
    BootstrapIssue(BootstrapIssue),
    DataRequest(DataRequest),
}
