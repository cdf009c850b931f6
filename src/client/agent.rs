//! The embedded agent script and its remote naming scheme.

use std::sync::OnceLock;

use sha2::{Digest, Sha256};

/// The agent script uploaded to every host, embedded at build time.
pub const AGENT_SCRIPT: &str = include_str!("agent.sh");

/// Heredoc terminator used for the upload. Must never occur in the script
/// itself.
pub const UPLOAD_EOF_TOKEN: &str = "LOGMUX_AGENT_EOF";

/// Hex SHA-256 of [`AGENT_SCRIPT`], used to skip re-uploading a script
/// that is already in place.
pub fn agent_script_sha256() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| {
        let digest = Sha256::digest(AGENT_SCRIPT.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    })
}

/// Where the agent lives on the remote host. The client id keeps
/// concurrent logmux instances on the same host out of each other's way.
pub fn remote_agent_path(client_id: &str) -> String {
    format!("/tmp/logmux_agent_{client_id}.sh")
}
