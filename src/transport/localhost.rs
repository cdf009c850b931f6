//! Localhost transport: a plain local `/bin/sh`, no remoting.
//!
//! Selected by the literal hostname `localhost` in the logstream spec.
//! User and port have no meaning here and are discarded by the resolver.

use async_trait::async_trait;

use super::shell_cmd::spawn_shell_child;
use super::{ConnectCtx, ShellConn, ShellTransport, TransportError};

pub struct LocalhostTransport;

#[async_trait]
impl ShellTransport for LocalhostTransport {
    async fn connect(&self, _ctx: &ConnectCtx) -> Result<ShellConn, TransportError> {
        tracing::debug!("spawning local subshell");
        spawn_shell_child(tokio::process::Command::new("/bin/sh"), "local")
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DataRequest;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn local_shell_runs_commands() {
        let (tx, _rx): (mpsc::Sender<DataRequest>, _) = mpsc::channel(8);
        let ctx = ConnectCtx {
            data_request_tx: tx,
        };

        let mut conn = LocalhostTransport.connect(&ctx).await.unwrap();
        conn.write_line("echo $((40 + 2))").await.unwrap();
        assert_eq!(conn.recv().await.unwrap().line, "42");

        conn.close("done");
        conn.wait_closed().await;
    }
}
