//! Configuration data model and loaders.
//!
//! Two configuration sources feed the resolver: the logmux-specific
//! logstreams file (YAML, typically `~/.config/logmux/logstreams.yaml`) and
//! the user's OpenSSH client config (see [`ssh_config`]). Both are read once
//! at startup; the resolver consumes the parsed forms only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub mod ssh_config;

pub use ssh_config::SshConfig;

/// Per-stream entry in the logstreams config file, keyed by stream name.
///
/// Every field is optional; whatever is missing gets filled in from the ssh
/// config or built-in defaults, in that order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigLogStream {
    #[serde(default)]
    pub hostname: String,
    /// Kept as a string: it comes from config text and is only ever spliced
    /// back into addresses or environment variables.
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub user: String,
    /// Up to two paths: the current log file and its rotated predecessor.
    #[serde(default)]
    pub log_files: Vec<String>,
    #[serde(default)]
    pub options: ConfigLogStreamOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigLogStreamOptions {
    /// Shell statements executed in the remote shell before the agent is
    /// uploaded, e.g. `export TZ=UTC`.
    #[serde(default)]
    pub shell_init: Vec<String>,
}

pub type ConfigLogStreams = HashMap<String, ConfigLogStream>;

/// On-disk shape of the logstreams config file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LogStreamsFile {
    #[serde(default)]
    log_streams: ConfigLogStreams,
}

/// Load the logstreams config from `path`. A missing file is not an error:
/// it just yields an empty map, matching a fresh installation.
pub fn load_config_log_streams(path: &Path) -> anyhow::Result<ConfigLogStreams> {
    if !path.exists() {
        tracing::debug!("no logstreams config at {}", path.display());
        return Ok(ConfigLogStreams::new());
    }

    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
    let file: LogStreamsFile = serde_yaml::from_str(&text)
        .map_err(|e| anyhow::anyhow!("parsing {}: {}", path.display(), e))?;

    tracing::debug!(
        "loaded {} logstream(s) from {}",
        file.log_streams.len(),
        path.display()
    );
    Ok(file.log_streams)
}

/// Default location of the logstreams config file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("logmux").join("logstreams.yaml"))
}

/// Default location of the user's ssh config.
pub fn default_ssh_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|d| d.join(".ssh").join("config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_logstreams_yaml() {
        let text = r#"
log_streams:
  web-01:
    hostname: web-01.example.com
    port: "2222"
    user: deploy
    log_files:
      - /var/log/nginx/access.log
      - /var/log/nginx/access.log.1
    options:
      shell_init:
        - export TZ=UTC
  db-01:
    hostname: db-01.example.com
"#;
        let file: LogStreamsFile = serde_yaml::from_str(text).unwrap();
        let web = &file.log_streams["web-01"];
        assert_eq!(web.hostname, "web-01.example.com");
        assert_eq!(web.port, "2222");
        assert_eq!(web.user, "deploy");
        assert_eq!(web.log_files.len(), 2);
        assert_eq!(web.options.shell_init, vec!["export TZ=UTC".to_string()]);

        let db = &file.log_streams["db-01"];
        assert_eq!(db.port, "");
        assert!(db.log_files.is_empty());
    }

    #[test]
    fn missing_file_is_empty() {
        let streams =
            load_config_log_streams(Path::new("/nonexistent/logstreams.yaml")).unwrap();
        assert!(streams.is_empty());
    }
}
