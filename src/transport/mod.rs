//! Shell transport abstraction.
//!
//! A transport knows how to produce a line-oriented duplex byte stream to a
//! `/bin/sh` somewhere: over an in-process SSH client ([`ssh`]), by spawning
//! an external command such as the stock `ssh` binary ([`shell_cmd`]), or as
//! a local subshell ([`localhost`]). The logstream client is written against
//! [`ShellTransport`] / [`ShellConn`] only and never observes which variant
//! it got.
//!
//! Connections are driven by private tasks inside each transport; the
//! [`ShellConn`] handle is just channel plumbing, which also makes the
//! scriptable [`mock`] shell used in tests a first-class transport.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

pub mod keys;
pub mod localhost;
pub mod mock;
pub mod shell_cmd;
pub mod ssh;

pub use keys::{EphemeralKeyProvider, ExternalKeyProvider, KeyProviderError, MockKeyProvider};

/// Which remote stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One newline-framed line of remote output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub kind: StreamKind,
    pub line: String,
}

impl OutputLine {
    pub fn stdout(line: impl Into<String>) -> OutputLine {
        OutputLine {
            kind: StreamKind::Stdout,
            line: line.into(),
        }
    }

    pub fn stderr(line: impl Into<String>) -> OutputLine {
        OutputLine {
            kind: StreamKind::Stderr,
            line: line.into(),
        }
    }
}

/// What kind of input an interactive prompt is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRequestKind {
    Password,
    Text,
}

/// A request for interactive user input (password, one-time token) raised
/// by a transport mid-connect. The observer answers by sending exactly one
/// string on `response_tx`; an empty string means the user refused.
#[derive(Debug)]
pub struct DataRequest {
    pub title: String,
    pub message: String,
    pub kind: DataRequestKind,
    pub response_tx: oneshot::Sender<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("connection attempt timed out")]
    Timeout,

    /// Authentication was rejected; retrying with the same credentials
    /// will not help.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Could not reach or establish the session; worth retrying.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The session went away underneath us.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The user declined an interactive prompt.
    #[error("interactive prompt refused")]
    PromptRefused,

    #[error("i/o error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether a reconnect attempt is worthwhile. Permanent failures
    /// (rejected credentials, refused prompts, missing binaries) are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::Auth(_)
                | TransportError::PromptRefused
                | TransportError::CommandNotFound(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> TransportError {
        TransportError::Io(e.to_string())
    }
}

/// Everything a transport may need from its surroundings while connecting.
pub struct ConnectCtx {
    /// Where to surface interactive prompts. The transport blocks on the
    /// per-request response channel, not on this one.
    pub data_request_tx: mpsc::Sender<DataRequest>,
}

impl ConnectCtx {
    /// Raise an interactive prompt and wait for the user's answer.
    ///
    /// Returns [`TransportError::PromptRefused`] on an empty answer or when
    /// nobody is listening for prompts.
    pub async fn request_data(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: DataRequestKind,
    ) -> Result<String, TransportError> {
        let (response_tx, response_rx) = oneshot::channel();
        let req = DataRequest {
            title: title.into(),
            message: message.into(),
            kind,
            response_tx,
        };

        self.data_request_tx
            .send(req)
            .await
            .map_err(|_| TransportError::PromptRefused)?;

        match response_rx.await {
            Ok(answer) if !answer.is_empty() => Ok(answer),
            _ => Err(TransportError::PromptRefused),
        }
    }
}

/// A live shell session, as seen by the logstream client.
///
/// The handle is pure channel plumbing; the I/O itself happens in whatever
/// tasks the transport spawned. Dropping the handle tears the session down.
pub struct ShellConn {
    write_tx: mpsc::Sender<String>,
    output_rx: mpsc::Receiver<OutputLine>,
    close_tx: Option<oneshot::Sender<String>>,
    closed_rx: Option<oneshot::Receiver<()>>,
}

impl ShellConn {
    /// Send one line to the remote shell's stdin. The trailing newline is
    /// added here.
    pub async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        self.write_tx
            .send(line.to_string())
            .await
            .map_err(|_| TransportError::Closed("write side gone".to_string()))
    }

    /// Receive the next line of remote output. `None` means the session is
    /// over and no more lines will arrive.
    pub async fn recv(&mut self) -> Option<OutputLine> {
        self.output_rx.recv().await
    }

    /// Ask the transport to terminate the session. Idempotent.
    pub fn close(&mut self, reason: &str) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(reason.to_string());
        }
    }

    /// Wait until the transport has released all resources.
    pub async fn wait_closed(&mut self) {
        if let Some(rx) = self.closed_rx.take() {
            let _ = rx.await;
        }
    }

    /// Build a connection handle plus its driver counterpart. Transports
    /// keep the [`ShellConnDriver`] in their I/O task and hand the
    /// [`ShellConn`] to the caller.
    pub fn pair(buffer: usize) -> (ShellConn, ShellConnDriver) {
        let (write_tx, write_rx) = mpsc::channel(buffer);
        let (output_tx, output_rx) = mpsc::channel(buffer);
        let (close_tx, close_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = oneshot::channel();

        (
            ShellConn {
                write_tx,
                output_rx,
                close_tx: Some(close_tx),
                closed_rx: Some(closed_rx),
            },
            ShellConnDriver {
                write_rx,
                output_tx,
                close_rx,
                closed_tx,
            },
        )
    }
}

/// The transport-side ends of a [`ShellConn`]'s channels.
pub struct ShellConnDriver {
    /// Lines the client wants written to the remote stdin.
    pub write_rx: mpsc::Receiver<String>,
    /// Where to deliver newline-framed remote output.
    pub output_tx: mpsc::Sender<OutputLine>,
    /// Fires once with a reason when the client asks to terminate.
    pub close_rx: oneshot::Receiver<String>,
    /// To be fired once all resources are released.
    pub closed_tx: oneshot::Sender<()>,
}

/// Capability to establish shell sessions. One transport instance belongs
/// to one logstream and may be asked to connect repeatedly over its life.
#[async_trait]
pub trait ShellTransport: Send + Sync {
    async fn connect(&self, ctx: &ConnectCtx) -> Result<ShellConn, TransportError>;

    /// Short tag for logging ("ssh", "cmd", "local", "mock").
    fn kind(&self) -> &'static str;
}

/// Split a chunk of raw bytes into complete lines, keeping the unfinished
/// tail in `buf`. Carriage returns before the newline are stripped.
pub(crate) fn drain_lines(buf: &mut Vec<u8>, chunk: &[u8], mut emit: impl FnMut(String)) {
    buf.extend_from_slice(chunk);
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop(); // '\n'
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        emit(String::from_utf8_lossy(&line).into_owned());
    }
}
