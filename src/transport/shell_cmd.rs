//! External-command transport.
//!
//! Spawns a locally-configured shell command (by default the stock `ssh`
//! binary wrapped in `/bin/sh -c`) and treats its stdio as the remote shell
//! session. Stream coordinates are passed through the `NLHOST`, `NLPORT`
//! and `NLUSER` environment overrides; everything else is inherited.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
    drain_lines, ConnectCtx, OutputLine, ShellConn, ShellConnDriver, ShellTransport,
    TransportError,
};

pub struct CustomCmdTransport {
    pub shell_command: String,
    pub env_override: HashMap<String, String>,
}

#[async_trait]
impl ShellTransport for CustomCmdTransport {
    async fn connect(&self, _ctx: &ConnectCtx) -> Result<ShellConn, TransportError> {
        tracing::debug!(
            "spawning shell command: {} (env: {:?})",
            self.shell_command,
            self.env_override
        );

        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(&self.shell_command);
        for (key, value) in &self.env_override {
            cmd.env(key, value);
        }

        spawn_shell_child(cmd, "cmd")
    }

    fn kind(&self) -> &'static str {
        "cmd"
    }
}

/// Spawn `cmd` with piped stdio and wire it up as a [`ShellConn`]. Shared
/// by the external-command and localhost transports.
pub(crate) fn spawn_shell_child(
    mut cmd: tokio::process::Command,
    label: &'static str,
) -> Result<ShellConn, TransportError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            TransportError::CommandNotFound(format!("{cmd:?}"))
        } else {
            TransportError::Io(e.to_string())
        }
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::Io("child stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::Io("child stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TransportError::Io("child stderr not captured".to_string()))?;

    let (conn, driver) = ShellConn::pair(256);
    tokio::spawn(drive_child(child, stdin, stdout, stderr, driver, label));
    Ok(conn)
}

/// Pump lines between the child process and the connection channels until
/// the child dies or the client asks to close.
async fn drive_child(
    mut child: tokio::process::Child,
    mut stdin: tokio::process::ChildStdin,
    mut stdout: tokio::process::ChildStdout,
    mut stderr: tokio::process::ChildStderr,
    driver: ShellConnDriver,
    label: &'static str,
) {
    let ShellConnDriver {
        mut write_rx,
        output_tx,
        mut close_rx,
        closed_tx,
    } = driver;

    let mut out_buf: Vec<u8> = Vec::new();
    let mut err_buf: Vec<u8> = Vec::new();
    let mut out_chunk = [0u8; 4096];
    let mut err_chunk = [0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;

    let close_reason;

    loop {
        tokio::select! {
            reason = &mut close_rx => {
                close_reason = reason.unwrap_or_else(|_| "connection handle dropped".to_string());
                break;
            }

            line = write_rx.recv() => {
                match line {
                    Some(line) => {
                        let mut bytes = line.into_bytes();
                        bytes.push(b'\n');
                        if let Err(e) = stdin.write_all(&bytes).await {
                            tracing::debug!("[{label}] stdin write failed: {e}");
                            close_reason = format!("stdin write failed: {e}");
                            break;
                        }
                        if let Err(e) = stdin.flush().await {
                            tracing::debug!("[{label}] stdin flush failed: {e}");
                            close_reason = format!("stdin flush failed: {e}");
                            break;
                        }
                    }
                    None => {
                        close_reason = "connection handle dropped".to_string();
                        break;
                    }
                }
            }

            n = stdout.read(&mut out_chunk), if out_open => {
                match n {
                    Ok(0) | Err(_) => out_open = false,
                    Ok(n) => {
                        let mut lines = Vec::new();
                        drain_lines(&mut out_buf, &out_chunk[..n], |l| lines.push(l));
                        for line in lines {
                            if output_tx.send(OutputLine::stdout(line)).await.is_err() {
                                out_open = false;
                                break;
                            }
                        }
                    }
                }
                if !out_open && !err_open {
                    close_reason = "child closed its output".to_string();
                    break;
                }
            }

            n = stderr.read(&mut err_chunk), if err_open => {
                match n {
                    Ok(0) | Err(_) => err_open = false,
                    Ok(n) => {
                        let mut lines = Vec::new();
                        drain_lines(&mut err_buf, &err_chunk[..n], |l| lines.push(l));
                        for line in lines {
                            if output_tx.send(OutputLine::stderr(line)).await.is_err() {
                                err_open = false;
                                break;
                            }
                        }
                    }
                }
                if !out_open && !err_open {
                    close_reason = "child closed its output".to_string();
                    break;
                }
            }
        }
    }

    tracing::debug!("[{label}] closing shell child: {close_reason}");

    // Flush whatever partial lines are left so nothing silently vanishes.
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
    let _ = child.start_kill();
    let _ = child.wait().await;
    let _ = closed_tx.send(());
}
