//! Logstream spec resolution.
//!
//! Turns a user-supplied spec string like `"alice@web-*:2201:/var/log/app.log"`
//! into a concrete set of [`LogStream`] descriptors, combining three sources
//! with fixed precedence: explicit values in the spec entry, the logstreams
//! config, and the ssh config, falling back to built-in defaults.
//!
//! Resolution is a pure function of its inputs: no I/O happens here, and
//! resolving the same spec against the same configs always yields the same
//! set.

use std::collections::{BTreeSet, HashMap};

use crate::config::{ConfigLogStreams, SshConfig};
use crate::types::LOGFILE_AUTO;

/// Shell command template used for the external-ssh transport mode.
///
/// Interpreted by `/bin/sh`; `NLHOST`, `NLPORT` and `NLUSER` are injected
/// into its environment by the transport, everything else is inherited.
pub const DEFAULT_SSH_SHELL_COMMAND: &str =
    "ssh -o 'BatchMode=yes' ${NLPORT:+-p ${NLPORT}} ${NLUSER:+${NLUSER}@}${NLHOST} /bin/sh";

/// A fully resolved logstream: one named log source on one host.
///
/// Two `LogStream`s are the same stream iff their names are equal; the name
/// doubles as the map key everywhere in the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct LogStream {
    pub name: String,
    pub transport: ShellTransportConfig,
    /// Exactly two entries: the current log file and its rotated
    /// predecessor. Either may be the `"auto"` sentinel.
    pub log_files: Vec<String>,
    pub options: LogStreamOptions,
}

impl LogStream {
    /// Whether this stream reads the systemd journal instead of flat files.
    pub fn uses_journalctl(&self) -> bool {
        self.log_files
            .first()
            .is_some_and(|f| f.as_str() == crate::types::LOGFILE_JOURNALCTL)
    }
}

/// How to reach the remote shell for a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellTransportConfig {
    /// In-process SSH client.
    SshLib { addr: String, user: String },
    /// External command (typically the stock `ssh` binary) spawned locally,
    /// with stream coordinates passed via environment overrides.
    CustomCmd {
        shell_command: String,
        env_override: HashMap<String, String>,
    },
    /// Local subshell, no remoting at all.
    Localhost,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogStreamOptions {
    /// Shell statements run in the remote shell before anything else.
    pub shell_init: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("entry #{index} is empty")]
    EmptyEntry { index: usize },

    #[error("parsing entry #{index} ({entry}): {reason}")]
    BadEntry {
        index: usize,
        entry: String,
        reason: EntryReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryReason {
    #[error("no hostname")]
    NoHostname,

    #[error("empty username before '@'")]
    EmptyUser,

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("too many ':'-separated fields")]
    TooManyFields,

    #[error("glob {pattern:?} didn't match any configured host")]
    GlobNoMatch { pattern: String },
}

pub struct LStreamsResolverParams {
    /// Username to fall back to when neither the spec nor any config names
    /// one.
    pub cur_os_user: String,
    /// When set, every non-localhost stream uses the [`CustomCmd`]
    /// transport with this command instead of the in-process SSH client.
    ///
    /// [`CustomCmd`]: ShellTransportConfig::CustomCmd
    pub custom_shell_command: Option<String>,
    pub config_log_streams: ConfigLogStreams,
    pub ssh_config: SshConfig,
}

pub struct LStreamsResolver {
    params: LStreamsResolverParams,
}

/// One spec entry, parsed but not yet resolved:
/// `[user@]hostPattern[:port][:logfile_last[:logfile_prev]]`.
///
/// The port slot is positional and may be empty (`host::/file`), which
/// means "no explicit port" while still allowing a logfile override.
#[derive(Debug)]
struct ParsedEntry {
    user: Option<String>,
    host_pattern: String,
    port: Option<String>,
    logfile_last: Option<String>,
    logfile_prev: Option<String>,
    /// `"user@"` or empty; used to rebuild the stream name around a
    /// glob-matched key.
    raw_prefix: String,
    /// Everything after the host pattern, verbatim (including a leading
    /// `:`), for the same reason.
    raw_suffix: String,
}

fn parse_entry(entry: &str) -> Result<ParsedEntry, EntryReason> {
    let (user, rest) = match entry.split_once('@') {
        Some((u, rest)) => {
            if u.is_empty() {
                return Err(EntryReason::EmptyUser);
            }
            (Some(u.to_string()), rest)
        }
        None => (None, entry),
    };

    if rest.is_empty() {
        return Err(EntryReason::NoHostname);
    }

    let segs: Vec<&str> = rest.split(':').collect();
    if segs.len() > 4 {
        return Err(EntryReason::TooManyFields);
    }

    let host_pattern = segs[0];
    if host_pattern.is_empty() {
        return Err(EntryReason::NoHostname);
    }

    let port = match segs.get(1) {
        None => None,
        Some(s) if s.is_empty() => None,
        Some(s) => {
            if s.bytes().all(|b| b.is_ascii_digit()) {
                Some(s.to_string())
            } else {
                return Err(EntryReason::InvalidPort(s.to_string()));
            }
        }
    };

    let nonempty = |s: &&str| -> Option<String> {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    };

    let raw_prefix = match &user {
        Some(u) => format!("{u}@"),
        None => String::new(),
    };
    let raw_suffix = rest[host_pattern.len()..].to_string();

    Ok(ParsedEntry {
        user,
        host_pattern: host_pattern.to_string(),
        port,
        logfile_last: segs.get(2).and_then(|s| nonempty(s)),
        logfile_prev: segs.get(3).and_then(|s| nonempty(s)),
        raw_prefix,
        raw_suffix,
    })
}

impl LStreamsResolver {
    pub fn new(params: LStreamsResolverParams) -> LStreamsResolver {
        LStreamsResolver { params }
    }

    /// Resolve a spec string into a map of stream name to descriptor.
    ///
    /// An empty (or all-whitespace) spec resolves to an empty map; an empty
    /// entry within a non-empty spec is an error.
    pub fn resolve(&self, spec: &str) -> Result<HashMap<String, LogStream>, ResolveError> {
        let mut out = HashMap::new();

        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(out);
        }

        for (i, raw) in spec.split(',').enumerate() {
            let index = i + 1;
            let entry = raw.trim();
            if entry.is_empty() {
                return Err(ResolveError::EmptyEntry { index });
            }

            let parsed = parse_entry(entry).map_err(|reason| ResolveError::BadEntry {
                index,
                entry: entry.to_string(),
                reason,
            })?;

            // The literal hostname "localhost" short-circuits everything:
            // no config lookups, no user, no port.
            if parsed.host_pattern == "localhost" {
                let stream = self.build_localhost(&parsed);
                out.insert(stream.name.clone(), stream);
                continue;
            }

            if is_glob(&parsed.host_pattern) {
                let matched = self.glob_candidates(&parsed.host_pattern);
                if matched.is_empty() {
                    return Err(ResolveError::BadEntry {
                        index,
                        entry: entry.to_string(),
                        reason: EntryReason::GlobNoMatch {
                            pattern: parsed.host_pattern.clone(),
                        },
                    });
                }
                for key in matched {
                    let stream = self.build_stream(&key, &parsed);
                    out.insert(stream.name.clone(), stream);
                }
            } else {
                let stream = self.build_stream(&parsed.host_pattern, &parsed);
                out.insert(stream.name.clone(), stream);
            }
        }

        Ok(out)
    }

    /// Names eligible for glob expansion: the union of logstreams-config
    /// keys and concrete ssh-config aliases, in sorted order so expansion
    /// is deterministic.
    fn glob_candidates(&self, pattern: &str) -> Vec<String> {
        let glob = match glob::Pattern::new(pattern) {
            Ok(g) => g,
            Err(_) => return Vec::new(),
        };

        let mut candidates: BTreeSet<String> =
            self.params.config_log_streams.keys().cloned().collect();
        candidates.extend(self.params.ssh_config.concrete_aliases());

        candidates
            .into_iter()
            .filter(|name| glob.matches(name))
            .collect()
    }

    fn build_localhost(&self, parsed: &ParsedEntry) -> LogStream {
        LogStream {
            name: entry_name(parsed, &parsed.host_pattern),
            transport: ShellTransportConfig::Localhost,
            log_files: entry_log_files(parsed).unwrap_or_else(default_log_files),
            options: LogStreamOptions::default(),
        }
    }

    /// Resolve all fields for the stream keyed by `key` (a glob-matched
    /// config name, or the literal host of a non-glob entry).
    fn build_stream(&self, key: &str, parsed: &ParsedEntry) -> LogStream {
        let cfg = self.params.config_log_streams.get(key);
        let ssh = &self.params.ssh_config;

        let cfg_hostname = cfg.map(|c| c.hostname.as_str()).filter(|h| !h.is_empty());
        let cfg_port = cfg.map(|c| c.port.as_str()).filter(|p| !p.is_empty());
        let cfg_user = cfg.map(|c| c.user.as_str()).filter(|u| !u.is_empty());

        // Explicit values: present in the entry or the logstreams config.
        // These are the ones worth forwarding to an external ssh command;
        // anything the ssh config would supply, ssh re-derives on its own.
        let explicit_port = parsed.port.as_deref().or(cfg_port);
        let explicit_user = parsed.user.as_deref().or(cfg_user);
        let explicit_host = cfg_hostname.unwrap_or(key);

        let log_files = entry_log_files(parsed)
            .or_else(|| cfg.map(|c| padded_log_files(&c.log_files)))
            .unwrap_or_else(default_log_files);

        let options = cfg
            .map(|c| LogStreamOptions {
                shell_init: c.options.shell_init.clone(),
            })
            .unwrap_or_default();

        let transport = match &self.params.custom_shell_command {
            Some(cmd) => {
                let mut env = HashMap::new();
                env.insert("NLHOST".to_string(), explicit_host.to_string());
                if let Some(port) = explicit_port {
                    env.insert("NLPORT".to_string(), port.to_string());
                }
                if let Some(user) = explicit_user {
                    env.insert("NLUSER".to_string(), user.to_string());
                }
                ShellTransportConfig::CustomCmd {
                    shell_command: cmd.clone(),
                    env_override: env,
                }
            }
            None => {
                let hostname = cfg_hostname
                    .or_else(|| ssh.get(key, "hostname"))
                    .unwrap_or(key);
                let port = explicit_port
                    .or_else(|| ssh.get(key, "port"))
                    .unwrap_or("22");
                let user = explicit_user
                    .or_else(|| ssh.get(key, "user"))
                    .unwrap_or(&self.params.cur_os_user);

                ShellTransportConfig::SshLib {
                    addr: format!("{hostname}:{port}"),
                    user: user.to_string(),
                }
            }
        };

        LogStream {
            name: entry_name(parsed, key),
            transport,
            log_files,
            options,
        }
    }
}

fn is_glob(s: &str) -> bool {
    s.contains(['*', '?'])
}

/// Rebuild the stream name from the entry, with the host pattern replaced
/// by `key`. For non-glob entries this reproduces the entry verbatim, so
/// `"alice@web-01::/a.log"` names the stream `alice@web-01::/a.log` and
/// `"web-*:123"` expands to names like `web-01:123`.
fn entry_name(parsed: &ParsedEntry, key: &str) -> String {
    format!("{}{}{}", parsed.raw_prefix, key, parsed.raw_suffix)
}

fn entry_log_files(parsed: &ParsedEntry) -> Option<Vec<String>> {
    parsed.logfile_last.as_ref().map(|last| {
        vec![
            last.clone(),
            parsed
                .logfile_prev
                .clone()
                .unwrap_or_else(|| LOGFILE_AUTO.to_string()),
        ]
    })
}

fn padded_log_files(files: &[String]) -> Vec<String> {
    let mut out: Vec<String> = files.iter().take(2).cloned().collect();
    while out.len() < 2 {
        out.push(LOGFILE_AUTO.to_string());
    }
    out
}

fn default_log_files() -> Vec<String> {
    vec![LOGFILE_AUTO.to_string(), LOGFILE_AUTO.to_string()]
}
