//! Scriptable in-memory shell transport for tests.
//!
//! Emulates just enough of a `/bin/sh` conversation for the logstream
//! client's bootstrap and query flows: heredoc uploads are swallowed,
//! `echo` lines are reflected back (with `$?` taken to be 0), probe lines
//! are answered from configuration, and each agent invocation pops the next
//! scripted response off a queue.
//!
//! Tests keep a [`MockShell`] handle per stream to script responses and to
//! assert on the lines the client actually wrote.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    ConnectCtx, DataRequestKind, OutputLine, ShellConn, ShellConnDriver, ShellTransport,
    TransportError,
};

#[derive(Default)]
struct MockShellInner {
    /// Scripted stdout frame batches, one per successive agent invocation.
    query_responses: VecDeque<Vec<String>>,
    /// Answer to the journal access probe.
    journal_no_access: bool,
    /// Answer to the agent hash check; `true` skips the upload.
    agent_already_present: bool,
    /// Error for the next connect attempt, consumed once.
    fail_next_connect: Option<TransportError>,
    /// When set, connect raises an interactive prompt first.
    prompt_on_connect: Option<(String, String)>,
    /// Answers received for raised prompts.
    prompt_answers: Vec<String>,
    connect_count: usize,
    /// Every line the client wrote, across all connections.
    written: Vec<String>,
}

/// A shared handle to one emulated host. Cloning shares state, so tests
/// keep one clone and hand the other to the transport factory.
#[derive(Clone, Default)]
pub struct MockShell {
    inner: Arc<Mutex<MockShellInner>>,
}

impl MockShell {
    pub fn new() -> MockShell {
        MockShell::default()
    }

    /// Queue the stdout frames for the next agent invocation. The batch
    /// should normally end with the `d:` completion frame or an `e:` frame.
    pub fn script_response(&self, frames: &[&str]) {
        self.inner
            .lock()
            .unwrap()
            .query_responses
            .push_back(frames.iter().map(|s| s.to_string()).collect());
    }

    pub fn set_journal_no_access(&self, v: bool) {
        self.inner.lock().unwrap().journal_no_access = v;
    }

    pub fn set_agent_already_present(&self, v: bool) {
        self.inner.lock().unwrap().agent_already_present = v;
    }

    pub fn fail_next_connect(&self, err: TransportError) {
        self.inner.lock().unwrap().fail_next_connect = Some(err);
    }

    pub fn prompt_on_connect(&self, title: &str, message: &str) {
        self.inner.lock().unwrap().prompt_on_connect =
            Some((title.to_string(), message.to_string()));
    }

    pub fn connect_count(&self) -> usize {
        self.inner.lock().unwrap().connect_count
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.inner.lock().unwrap().written.clone()
    }

    pub fn prompt_answers(&self) -> Vec<String> {
        self.inner.lock().unwrap().prompt_answers.clone()
    }
}

#[async_trait]
impl ShellTransport for MockShell {
    async fn connect(&self, ctx: &ConnectCtx) -> Result<ShellConn, TransportError> {
        let prompt = {
            let mut inner = self.inner.lock().unwrap();
            inner.connect_count += 1;
            if let Some(err) = inner.fail_next_connect.take() {
                return Err(err);
            }
            inner.prompt_on_connect.clone()
        };

        if let Some((title, message)) = prompt {
            let answer = ctx
                .request_data(title, message, DataRequestKind::Password)
                .await?;
            self.inner.lock().unwrap().prompt_answers.push(answer);
        }

        let (conn, driver) = ShellConn::pair(256);
        tokio::spawn(emulate(self.inner.clone(), driver));
        Ok(conn)
    }

    fn kind(&self) -> &'static str {
        "mock"
    }
}

async fn emulate(inner: Arc<Mutex<MockShellInner>>, driver: ShellConnDriver) {
    let ShellConnDriver {
        mut write_rx,
        output_tx,
        mut close_rx,
        closed_tx,
    } = driver;

    let mut heredoc_terminator: Option<String> = None;

    loop {
        let line = tokio::select! {
            _ = &mut close_rx => break,
            line = write_rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        inner.lock().unwrap().written.push(line.clone());

        if let Some(term) = &heredoc_terminator {
            if line == *term {
                heredoc_terminator = None;
            }
            continue;
        }

        let replies = {
            let mut inner = inner.lock().unwrap();
            respond(&mut inner, &line, &mut heredoc_terminator)
        };

        for reply in replies {
            if output_tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    drop(output_tx);
    let _ = closed_tx.send(());
}

/// Produce the emulated output for one written line.
fn respond(
    inner: &mut MockShellInner,
    line: &str,
    heredoc_terminator: &mut Option<String>,
) -> Vec<OutputLine> {
    // Heredoc start: remember the terminator and swallow the body.
    if line.starts_with("cat > ") {
        if let Some(idx) = line.find("<<'") {
            let rest = &line[idx + 3..];
            if let Some(end) = rest.find('\'') {
                *heredoc_terminator = Some(rest[..end].to_string());
            }
        }
        return Vec::new();
    }

    // The agent hash probe.
    if line.contains("sha256sum") {
        let answer = if inner.agent_already_present {
            "__logmux:agent:ok"
        } else {
            "__logmux:agent:stale"
        };
        return vec![OutputLine::stdout(answer)];
    }

    // The journal access probe.
    if line.contains("journalctl") {
        let answer = if inner.journal_no_access {
            "__logmux:journal:noaccess"
        } else {
            "__logmux:journal:ok"
        };
        return vec![OutputLine::stdout(answer)];
    }

    // Agent invocation: pop the next scripted batch.
    if line.starts_with("sh ") {
        return match inner.query_responses.pop_front() {
            Some(frames) => frames.into_iter().map(OutputLine::stdout).collect(),
            None => vec![OutputLine::stdout(
                "e:internal\tmock shell has no scripted response",
            )],
        };
    }

    // Plain echo: reflect the text, pretending the last command succeeded.
    if let Some(text) = line.strip_prefix("echo ") {
        let text = text
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .replace("$?", "0");
        return vec![OutputLine::stdout(text)];
    }

    // Anything else (chmod, shell init statements, ...) succeeds silently.
    Vec::new()
}
