//! In-process SSH transport built on russh.
//!
//! Authentication tries, in order: the ephemeral key provider, each
//! existing on-disk key, and finally an interactive password prompt routed
//! through the observer. The remote session is an exec of `/bin/sh`, so the
//! conversation is exactly the same line protocol the other transports
//! speak.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key;

use super::keys::{existing_key_files, load_key_file, EphemeralKeyProvider, KeyProviderError};
use super::{
    drain_lines, ConnectCtx, DataRequestKind, OutputLine, ShellConn, ShellConnDriver,
    ShellTransport, TransportError,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

pub struct SshTransport {
    /// `host:port`, as produced by the resolver.
    pub addr: String,
    pub user: String,
    /// Candidate private key files, tried in order. Missing files are
    /// skipped silently.
    pub key_files: Vec<PathBuf>,
    pub ephemeral: Arc<dyn EphemeralKeyProvider>,
    pub connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(
        addr: String,
        user: String,
        key_files: Vec<PathBuf>,
        ephemeral: Arc<dyn EphemeralKeyProvider>,
    ) -> SshTransport {
        SshTransport {
            addr,
            user,
            key_files,
            ephemeral,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Collect every key we could authenticate with, preserving the
    /// provider order: ephemeral first, then on-disk keys.
    async fn candidate_keys(&self) -> Vec<key::KeyPair> {
        let mut candidates = Vec::new();

        match self.ephemeral.key_pair().await {
            Ok(kp) => candidates.push(kp),
            Err(KeyProviderError::NotAvailable) => {}
            Err(e) => {
                tracing::warn!("[{}] ephemeral key provider: {e}, falling back", self.addr);
            }
        }

        for path in existing_key_files(&self.key_files) {
            match load_key_file(&path) {
                Ok(kp) => candidates.push(kp),
                Err(e) => tracing::debug!("[{}] skipping key: {e}", self.addr),
            }
        }

        candidates
    }
}

#[async_trait]
impl ShellTransport for SshTransport {
    async fn connect(&self, ctx: &ConnectCtx) -> Result<ShellConn, TransportError> {
        let (host, port) = split_addr(&self.addr)?;
        tracing::debug!("[{}] connecting as {}", self.addr, self.user);

        let config = Arc::new(client::Config::default());
        let connect_fut = client::connect(config, (host.as_str(), port), AcceptingHandler);
        let mut handle = tokio::time::timeout(self.connect_timeout, connect_fut)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut authed = false;
        for kp in self.candidate_keys().await {
            let ok = handle
                .authenticate_publickey(self.user.clone(), Arc::new(kp))
                .await
                .map_err(|e| TransportError::Connect(format!("publickey auth: {e}")))?;
            if ok {
                authed = true;
                break;
            }
        }

        if !authed {
            // No key worked; fall back to asking the user for a password.
            let password = ctx
                .request_data(
                    format!("Password for {}", self.addr),
                    format!("{}@{}", self.user, host),
                    DataRequestKind::Password,
                )
                .await?;

            let ok = handle
                .authenticate_password(self.user.clone(), password)
                .await
                .map_err(|e| TransportError::Connect(format!("password auth: {e}")))?;
            if !ok {
                return Err(TransportError::Auth(format!(
                    "all auth methods rejected for {}@{}",
                    self.user, self.addr
                )));
            }
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Connect(format!("opening session channel: {e}")))?;

        let mut channel = channel;
        channel
            .exec(true, "/bin/sh")
            .await
            .map_err(|e| TransportError::Connect(format!("starting remote shell: {e}")))?;

        tracing::debug!("[{}] connected", self.addr);

        let (conn, driver) = ShellConn::pair(256);
        tokio::spawn(drive_ssh(handle, channel, driver, self.addr.clone()));
        Ok(conn)
    }

    fn kind(&self) -> &'static str {
        "ssh"
    }
}

fn split_addr(addr: &str) -> Result<(String, u16), TransportError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| TransportError::Connect(format!("address {addr:?} has no port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| TransportError::Connect(format!("address {addr:?} has a bad port")))?;
    Ok((host.to_string(), port))
}

/// Host key checking is delegated to the operator for now: the key is
/// logged, not verified. TODO: check against ~/.ssh/known_hosts and prompt
/// on mismatch via DataRequest.
struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::warn!(
            "accepting unverified server key {}",
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

enum Ev {
    CloseRequested(String),
    Write(Option<String>),
    Remote(Option<ChannelMsg>),
}

/// Pump the SSH channel: client lines out, remote data in, until either
/// side goes away.
async fn drive_ssh(
    handle: client::Handle<AcceptingHandler>,
    mut channel: russh::Channel<client::Msg>,
    driver: ShellConnDriver,
    addr: String,
) {
    let ShellConnDriver {
        mut write_rx,
        output_tx,
        mut close_rx,
        closed_tx,
    } = driver;

    let mut out_buf: Vec<u8> = Vec::new();
    let mut err_buf: Vec<u8> = Vec::new();

    let close_reason;

    loop {
        let ev = tokio::select! {
            reason = &mut close_rx => {
                Ev::CloseRequested(reason.unwrap_or_else(|_| "connection handle dropped".to_string()))
            }
            line = write_rx.recv() => Ev::Write(line),
            msg = channel.wait() => Ev::Remote(msg),
        };

        match ev {
            Ev::CloseRequested(reason) => {
                close_reason = reason;
                break;
            }

            Ev::Write(None) => {
                close_reason = "connection handle dropped".to_string();
                break;
            }

            Ev::Write(Some(line)) => {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                if let Err(e) = channel.data(&bytes[..]).await {
                    close_reason = format!("channel write failed: {e}");
                    break;
                }
            }

            Ev::Remote(None) => {
                close_reason = "channel closed by remote".to_string();
                break;
            }

            Ev::Remote(Some(msg)) => match msg {
                ChannelMsg::Data { ref data } => {
                    let mut lines = Vec::new();
                    drain_lines(&mut out_buf, data, |l| lines.push(l));
                    for line in lines {
                        if output_tx.send(OutputLine::stdout(line)).await.is_err() {
                            break;
                        }
                    }
                }
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    let mut lines = Vec::new();
                    drain_lines(&mut err_buf, data, |l| lines.push(l));
                    for line in lines {
                        if output_tx.send(OutputLine::stderr(line)).await.is_err() {
                            break;
                        }
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    tracing::debug!("[{addr}] remote shell exited with {exit_status}");
                }
                _ => {}
            },
        }
    }

    tracing::debug!("[{addr}] closing ssh session: {close_reason}");

    if !out_buf.is_empty() {
        let _ = output_tx
            .send(OutputLine::stdout(String::from_utf8_lossy(&out_buf).into_owned()))
            .await;
    }
    if !err_buf.is_empty() {
        let _ = output_tx
            .send(OutputLine::stderr(String::from_utf8_lossy(&err_buf).into_owned()))
            .await;
    }
    drop(output_tx);

    let _ = channel.eof().await;
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "closing", "en")
        .await;
    let _ = closed_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_addr_parses() {
        assert_eq!(
            split_addr("example.com:2222").unwrap(),
            ("example.com".to_string(), 2222)
        );
        assert!(split_addr("noport").is_err());
        assert!(split_addr("host:notanumber").is_err());
    }
}
