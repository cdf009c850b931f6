//! End-to-end manager tests over the scriptable mock shell: the full
//! pipeline from the public API through clients, bootstrap, and the agent
//! wire protocol, with every remote conversation emulated in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use logmux::config::{ConfigLogStreams, SshConfig};
use logmux::manager::{
    LStreamsManager, LStreamsManagerParams, ManagerState, ManagerUpdate, TransportFactory,
    TransportMode, TransportShared,
};
use logmux::resolver::LogStream;
use logmux::transport::keys;
use logmux::transport::mock::MockShell;
use logmux::transport::ShellTransport;
use logmux::types::QueryRequest;
use logmux::Error;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Hands every stream a shared, scriptable mock shell keyed by stream name.
#[derive(Default)]
struct MockFactory {
    shells: Mutex<HashMap<String, MockShell>>,
}

impl MockFactory {
    fn shell(&self, name: &str) -> MockShell {
        self.shells
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, stream: &LogStream, _shared: &TransportShared) -> Arc<dyn ShellTransport> {
        Arc::new(self.shell(&stream.name))
    }
}

struct Harness {
    manager: LStreamsManager,
    updates_rx: mpsc::Receiver<ManagerUpdate>,
    factory: Arc<MockFactory>,
}

impl Harness {
    fn start(spec: &str) -> Harness {
        Harness::start_with_factory(spec, Arc::new(MockFactory::default()))
    }

    fn start_with_factory(spec: &str, factory: Arc<MockFactory>) -> Harness {
        let (updates_tx, updates_rx) = mpsc::channel(128);
        let manager = LStreamsManager::new(LStreamsManagerParams {
            config_log_streams: ConfigLogStreams::new(),
            ssh_config: SshConfig::default(),
            ssh_keys: Vec::new(),
            ephemeral_key_provider: keys::provider_from_name("").unwrap(),
            initial_lstreams: spec.to_string(),
            initial_transport_mode: TransportMode::SshLib,
            client_id: "test".to_string(),
            cur_os_user: Some("tester".to_string()),
            updates_tx,
            transport_factory: Some(factory.clone()),
        })
        .expect("initial spec must resolve");

        Harness {
            manager,
            updates_rx,
            factory,
        }
    }

    async fn next_update(&mut self) -> ManagerUpdate {
        tokio::time::timeout(STEP_TIMEOUT, self.updates_rx.recv())
            .await
            .expect("timed out waiting for a manager update")
            .expect("manager update channel closed")
    }

    async fn wait_state(&mut self, pred: impl Fn(&ManagerState) -> bool) -> ManagerState {
        loop {
            if let ManagerUpdate::State(state) = self.next_update().await {
                if pred(&state) {
                    return state;
                }
            }
        }
    }

    async fn wait_connected(&mut self) {
        self.wait_state(|s| s.connected).await;
    }

    async fn next_log_resp(&mut self) -> logmux::LogRespTotal {
        loop {
            if let ManagerUpdate::LogResp(total) = self.next_update().await {
                return total;
            }
        }
    }

    async fn finish(self) {
        self.manager.close();
        tokio::time::timeout(STEP_TIMEOUT, self.manager.wait())
            .await
            .expect("timed out waiting for teardown");
    }
}

fn ts(t: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(t, 0).unwrap()
}

fn iso(t: i64) -> String {
    ts(t).format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// A file-stream log frame at unix second `t`.
fn l(t: i64, lineno: u32) -> String {
    format!(
        "l:{}\tinfo\t/var/log/syslog\t{lineno}\t{lineno}\t\tmsg-{t}",
        iso(t)
    )
}

/// A journal log frame at unix second `t` (no stable line numbers).
fn lj(t: i64) -> String {
    format!("l:{}\tinfo\tjournalctl\t0\t0\t\tjournal-msg-{t}", iso(t))
}

fn m(minute: i64, count: u64) -> String {
    format!("m:{minute}:{count}")
}

fn script(shell: &MockShell, frames: &[String]) {
    let refs: Vec<&str> = frames.iter().map(String::as_str).collect();
    shell.script_response(&refs);
}

fn query(max_num_lines: usize) -> QueryRequest {
    let mut req = QueryRequest::new(ts(0));
    req.max_num_lines = max_num_lines;
    req
}

fn times_and_names(total: &logmux::LogRespTotal) -> Vec<(i64, String)> {
    total
        .logs
        .iter()
        .map(|l| (l.time.timestamp(), l.lstream_name().to_string()))
        .collect()
}

// ---------------------------------------------------------------------------
// end-to-end scenarios

#[tokio::test]
async fn two_hosts_no_overlap() {
    let mut h = Harness::start("h1,h2");
    script(
        &h.factory.shell("h1"),
        &[l(1, 1), l(2, 2), l(3, 3), m(0, 3), "d:".to_string()],
    );
    script(
        &h.factory.shell("h2"),
        &[l(2, 1), l(4, 2), m(0, 2), "d:".to_string()],
    );

    h.wait_connected().await;
    h.manager.query_logs(query(100)).await;
    let total = h.next_log_resp().await;

    assert!(total.errs.is_empty(), "unexpected errors: {:?}", total.errs);
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
    assert_eq!(total.minute_stats[&0].num_msgs, 5);
    assert_eq!(total.num_msgs_total, 5);
    assert!(!total.loaded_earlier);

    h.finish().await;
}

#[tokio::test]
async fn capped_paging_trims_uncovered_prefix() {
    let mut h = Harness::start("h1,h2");
    script(&h.factory.shell("h1"), &[l(10, 1), l(11, 2), "d:".to_string()]);
    script(&h.factory.shell("h2"), &[l(5, 1), l(6, 2), "d:".to_string()]);

    h.wait_connected().await;
    h.manager.query_logs(query(2)).await; // both streams come back capped
    let total = h.next_log_resp().await;

    // Coverage is only guaranteed from max(10, 5) = 10 onwards.
    assert_eq!(
        times_and_names(&total),
        vec![(10, "h1".to_string()), (11, "h1".to_string())]
    );

    h.finish().await;
}

#[tokio::test]
async fn load_earlier_on_a_journal_stream() {
    let spec = "h1::journalctl";
    let mut h = Harness::start(spec);
    let shell = h.factory.shell(spec);

    script(&shell, &[lj(1), lj(2), lj(3), m(0, 3), "d:".to_string()]);
    h.wait_connected().await;
    h.manager.query_logs(query(100)).await;
    let first = h.next_log_resp().await;
    assert_eq!(first.logs.len(), 3);

    // The follow-up must carry the journal cursor: one row already held at
    // t=1, and older rows get prepended.
    script(&shell, &[lj(0), "d:".to_string()]);
    let mut req = query(100);
    req.load_earlier = true;
    h.manager.query_logs(req).await;
    let second = h.next_log_resp().await;

    assert!(second.loaded_earlier);
    assert_eq!(
        times_and_names(&second)
            .iter()
            .map(|(t, _)| *t)
            .collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    // Minute stats stay those of the original query.
    assert_eq!(second.minute_stats[&0].num_msgs, 3);

    let written = shell.written_lines();
    assert!(
        written
            .iter()
            .any(|line| line.contains("--until-time 1") && line.contains("--until-num-msgs 1")),
        "journal cursor missing from agent invocation: {written:?}"
    );
    assert!(written.iter().any(|line| line.contains("--journalctl")));

    h.finish().await;
}

#[tokio::test]
async fn partial_failure_yields_only_errors() {
    let mut h = Harness::start("h1,h2");
    script(&h.factory.shell("h1"), &[l(1, 1), "d:".to_string()]);
    script(
        &h.factory.shell("h2"),
        &["e:query\tpattern invalid".to_string()],
    );

    h.wait_connected().await;
    h.manager.query_logs(query(100)).await;
    let total = h.next_log_resp().await;

    assert!(total.logs.is_empty(), "partial results must not be delivered");
    assert_eq!(total.errs.len(), 1);
    let msg = total.errs[0].to_string();
    assert!(msg.starts_with("h2:"), "error not annotated with stream: {msg}");
    assert!(msg.contains("pattern invalid"));

    h.finish().await;
}

#[tokio::test]
async fn requests_are_rejected_while_busy() {
    let mut h = Harness::start("h1,h2");
    // h1 never completes, so the query stays in flight.
    script(&h.factory.shell("h1"), &["s:1:10:working".to_string()]);
    script(&h.factory.shell("h2"), &["d:".to_string()]);

    h.wait_connected().await;
    h.manager.query_logs(query(100)).await;
    let busy_state = h.wait_state(|s| s.busy).await;
    assert_eq!(busy_state.num_lstreams, 2);

    // SetLStreams is rejected synchronously and the cluster is unchanged.
    let err = h.manager.set_lstreams("h3").await.unwrap_err();
    assert!(matches!(err, Error::BusyWithAnotherQuery), "got {err:?}");

    // A second query is rejected through the update bus, without
    // perturbing the in-flight one.
    h.manager.query_logs(query(100)).await;
    let rejection = h.next_log_resp().await;
    assert_eq!(rejection.errs.len(), 1);
    assert!(matches!(rejection.errs[0], Error::BusyWithAnotherQuery));

    h.finish().await;
}

#[tokio::test]
async fn teardown_drains_every_client() {
    let mut h = Harness::start("h1,h2,h3");
    script(&h.factory.shell("h1"), &["d:".to_string()]);
    // h2 stays mid-query.
    script(&h.factory.shell("h2"), &["s:1:50:stuck".to_string()]);
    script(&h.factory.shell("h3"), &["d:".to_string()]);

    h.wait_connected().await;
    h.manager.query_logs(query(100)).await;
    h.wait_state(|s| s.busy).await;

    h.manager.close();

    // While draining, some snapshot must list all three retired keys,
    // sorted.
    let state = h
        .wait_state(|s| s.tearing_down.len() == 3)
        .await;
    let mut sorted = state.tearing_down.clone();
    sorted.sort();
    assert_eq!(state.tearing_down, sorted);
    for host in ["h1", "h2", "h3"] {
        assert!(
            state.tearing_down.iter().any(|k| k.ends_with(host)),
            "{host} missing from {:?}",
            state.tearing_down
        );
    }

    tokio::time::timeout(STEP_TIMEOUT, h.manager.wait())
        .await
        .expect("wait() did not return after teardown");

    // After teardown the update stream ends: the channel closes once the
    // manager is gone.
    loop {
        match tokio::time::timeout(STEP_TIMEOUT, h.updates_rx.recv())
            .await
            .expect("update channel did not close after teardown")
        {
            Some(_) => continue,
            None => break,
        }
    }
}

// ---------------------------------------------------------------------------
// admission errors

#[tokio::test]
async fn query_without_streams_is_rejected() {
    let mut h = Harness::start("");
    h.manager.query_logs(query(100)).await;
    let total = h.next_log_resp().await;
    assert_eq!(total.errs.len(), 1);
    assert!(matches!(total.errs[0], Error::NoMatchingLStreams));
    h.finish().await;
}

#[tokio::test]
async fn query_before_connected_is_rejected() {
    let factory = Arc::new(MockFactory::default());
    // First connect attempt fails; the client sits disconnected for the
    // retry delay.
    factory
        .shell("h1")
        .fail_next_connect(logmux::transport::TransportError::Connect(
            "connection refused".to_string(),
        ));

    let mut h = Harness::start_with_factory("h1", factory);
    h.wait_state(|s| {
        s.conn_details_by_lstream
            .get("h1")
            .is_some_and(|d| d.err.is_some())
    })
    .await;

    h.manager.query_logs(query(100)).await;
    let total = h.next_log_resp().await;
    assert_eq!(total.errs.len(), 1);
    assert!(matches!(total.errs[0], Error::NotYetConnected));

    h.finish().await;
}

// ---------------------------------------------------------------------------
// reconfiguration

#[tokio::test]
async fn set_lstreams_retires_and_creates() {
    let mut h = Harness::start("h1,h2");
    h.wait_connected().await;

    h.manager.set_lstreams("h2,h3").await.unwrap();

    // h1 drains under a unique retired key while h3 joins.
    let state = h
        .wait_state(|s| s.tearing_down.iter().any(|k| k.ends_with("_h1")))
        .await;
    assert_eq!(state.num_lstreams, 2);

    h.wait_connected().await;
    assert!(h.factory.shell("h3").connect_count() >= 1);

    h.finish().await;
}

#[tokio::test]
async fn retired_keys_are_unique_across_retirements() {
    let mut h = Harness::start("h1");
    h.wait_connected().await;

    let mut retired = std::collections::HashSet::new();
    for _ in 0..3 {
        h.manager.set_lstreams("").await.unwrap();
        let state = h
            .wait_state(|s| s.tearing_down.iter().any(|k| k.contains("_h1")))
            .await;
        for key in &state.tearing_down {
            retired.insert(key.clone());
        }
        // Wait for the drain to finish before re-adding.
        h.wait_state(|s| s.tearing_down.is_empty()).await;
        h.manager.set_lstreams("h1").await.unwrap();
        h.wait_connected().await;
    }

    assert_eq!(retired.len(), 3, "retired keys collided: {retired:?}");
    h.finish().await;
}

#[tokio::test]
async fn spec_roundtrip_restores_the_same_streams() {
    let mut h = Harness::start("h1,h2");

    let names = |s: &ManagerState| {
        let mut all: Vec<String> = s
            .lstreams_by_state
            .values()
            .flat_map(|set| set.iter().cloned())
            .collect();
        all.sort();
        all
    };

    let before = names(&h.wait_state(|s| s.connected).await);

    h.manager.set_lstreams("h3").await.unwrap();
    h.wait_state(|s| s.num_lstreams == 1).await;
    h.manager.set_lstreams("h1,h2").await.unwrap();
    let after = names(&h.wait_state(|s| s.connected && s.num_lstreams == 2).await);

    assert_eq!(before, after);
    h.finish().await;
}

// ---------------------------------------------------------------------------
// interactive prompts

#[tokio::test]
async fn data_requests_reach_the_observer() {
    let factory = Arc::new(MockFactory::default());
    factory
        .shell("h1")
        .prompt_on_connect("Password for h1", "tester@h1");

    let mut h = Harness::start_with_factory("h1", factory);

    loop {
        match h.next_update().await {
            ManagerUpdate::DataRequest(req) => {
                assert_eq!(req.title, "Password for h1");
                req.response_tx.send("hunter2".to_string()).unwrap();
            }
            ManagerUpdate::State(state) if state.connected => break,
            _ => {}
        }
    }

    assert_eq!(h.factory.shell("h1").prompt_answers(), vec!["hunter2"]);
    h.finish().await;
}

// ---------------------------------------------------------------------------
// keepalive

#[tokio::test]
async fn ping_reaches_every_client() {
    let mut h = Harness::start("h1,h2");
    h.wait_connected().await;

    h.manager.ping().await;

    for name in ["h1", "h2"] {
        let shell = h.factory.shell(name);
        let mut seen = false;
        for _ in 0..100 {
            if shell
                .written_lines()
                .iter()
                .any(|l| l.contains("__logmux:pong"))
            {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen, "ping never reached {name}");
    }

    h.finish().await;
}
