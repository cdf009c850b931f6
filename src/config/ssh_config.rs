//! Minimal OpenSSH client-config reader.
//!
//! Understands exactly what the resolver needs: `Host` blocks with
//! `HostName`, `Port` and `User` values, looked up with OpenSSH's
//! first-obtained-value-wins semantics, plus recursive `Include`
//! preprocessing. `Match` blocks are not evaluated; they are skipped with a
//! warning and behave as if absent.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use glob::Pattern;

/// One `Host` block: the patterns after the `Host` keyword and the
/// parameters that follow, in file order, with lowercased keys.
#[derive(Debug, Clone)]
struct HostBlock {
    patterns: Vec<String>,
    params: Vec<(String, String)>,
}

/// A parsed ssh config.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

impl SshConfig {
    /// Parse ssh config text. Never fails: unparseable lines are skipped
    /// with a warning, matching how forgiving OpenSSH itself is about
    /// unknown directives.
    pub fn parse(text: &str) -> SshConfig {
        let mut blocks: Vec<HostBlock> = Vec::new();
        // Parameters before the first Host block apply to every host; model
        // them as a block with the catch-all pattern.
        let mut current: Option<HostBlock> = None;
        let mut skipping_match_block = false;

        for raw_line in text.lines() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = match split_directive(line) {
                Some(kv) => kv,
                None => {
                    tracing::warn!("skipping unparseable ssh config line: {raw_line:?}");
                    continue;
                }
            };

            match key.as_str() {
                "host" => {
                    skipping_match_block = false;
                    if let Some(block) = current.take() {
                        blocks.push(block);
                    }
                    current = Some(HostBlock {
                        patterns: value.split_whitespace().map(str::to_string).collect(),
                        params: Vec::new(),
                    });
                }
                "match" => {
                    // Match conditions are not evaluated; see the resolver
                    // docs. The whole block is ignored.
                    tracing::warn!(
                        "ssh config Match directives are not supported, ignoring: Match {value}"
                    );
                    skipping_match_block = true;
                    if let Some(block) = current.take() {
                        blocks.push(block);
                    }
                }
                _ if skipping_match_block => {}
                _ => match current {
                    Some(ref mut block) => block.params.push((key, value)),
                    None => {
                        // Top-of-file parameter with no Host line yet.
                        current = Some(HostBlock {
                            patterns: vec!["*".to_string()],
                            params: vec![(key, value)],
                        });
                    }
                },
            }
        }

        if let Some(block) = current.take() {
            blocks.push(block);
        }

        SshConfig { blocks }
    }

    /// Read and parse the config at `path`, expanding `Include` directives
    /// first. A missing file yields an empty config.
    pub fn load(path: &Path) -> std::io::Result<SshConfig> {
        if !path.exists() {
            tracing::debug!("no ssh config at {}", path.display());
            return Ok(SshConfig::default());
        }

        let mut visited = HashSet::new();
        let text = preprocess_includes(path, &mut visited)?;
        Ok(SshConfig::parse(&text))
    }

    /// Look up `key` (case-insensitive) for `alias`. Blocks are scanned in
    /// file order and the first value found wins, like OpenSSH.
    pub fn get(&self, alias: &str, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        for block in &self.blocks {
            if !block_matches(block, alias) {
                continue;
            }
            for (k, v) in &block.params {
                if *k == key {
                    return Some(v);
                }
            }
        }
        None
    }

    /// All host aliases that name a concrete host: patterns without glob
    /// metacharacters or negation. These participate in logstream-spec glob
    /// expansion.
    pub fn concrete_aliases(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for block in &self.blocks {
            for pattern in &block.patterns {
                if pattern.contains(['*', '?', '!']) {
                    continue;
                }
                if seen.insert(pattern.clone()) {
                    out.push(pattern.clone());
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

fn block_matches(block: &HostBlock, alias: &str) -> bool {
    let mut matched = false;
    for pattern in &block.patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if glob_matches(negated, alias) {
                return false;
            }
        } else if glob_matches(pattern, alias) {
            matched = true;
        }
    }
    matched
}

fn glob_matches(pattern: &str, target: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(target),
        Err(_) => pattern == target,
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Split `Key Value` or `Key=Value` into a lowercased key and the raw value.
fn split_directive(line: &str) -> Option<(String, String)> {
    let (key, value) = match line.split_once(['=', ' ', '\t']) {
        Some(kv) => kv,
        None => return None,
    };
    let key = key.trim().to_ascii_lowercase();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim().trim_matches('"').to_string()))
}

/// Recursively expand `Include` directives, returning the combined config
/// text. Already-visited files are skipped to break include cycles.
pub fn preprocess_includes(
    path: &Path,
    visited: &mut HashSet<PathBuf>,
) -> std::io::Result<String> {
    let abs = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(abs.clone()) {
        return Ok(String::new());
    }

    let text = std::fs::read_to_string(&abs)?;
    let mut combined = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("include ") {
            for inc in trimmed.split_whitespace().skip(1) {
                let expanded = expand_tilde(inc);
                // Relative includes are resolved against ~/.ssh per OpenSSH.
                let full = if expanded.is_absolute() {
                    expanded
                } else {
                    match dirs::home_dir() {
                        Some(home) => home.join(".ssh").join(expanded),
                        None => expanded,
                    }
                };
                let pattern = full.to_string_lossy().into_owned();
                let matches = glob::glob(&pattern)
                    .map(|paths| paths.flatten().collect::<Vec<_>>())
                    .unwrap_or_default();
                for m in matches {
                    combined.push(preprocess_includes(&m, visited)?);
                }
            }
        } else {
            combined.push(line.to_string());
        }
    }

    Ok(combined.join("\n"))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const SAMPLE: &str = r#"
# global defaults
User fallback-user

Host web-01 web-02
    HostName web-01.internal.example.com
    Port 2201
    User deploy

Host web-*
    Port 9999

Host bastion
    HostName bastion.example.com
"#;

    #[test]
    fn first_obtained_value_wins() {
        let cfg = SshConfig::parse(SAMPLE);
        // Exact block comes first, so its port beats the web-* block.
        assert_eq!(cfg.get("web-01", "Port"), Some("2201"));
        // A host only matched by the glob block gets the glob's port.
        assert_eq!(cfg.get("web-99", "Port"), Some("9999"));
        // The top-of-file User applies everywhere but is shadowed for web-01.
        assert_eq!(cfg.get("web-01", "User"), Some("deploy"));
        assert_eq!(cfg.get("bastion", "User"), Some("fallback-user"));
        assert_eq!(cfg.get("bastion", "Port"), None);
    }

    #[test]
    fn concrete_aliases_exclude_globs() {
        let cfg = SshConfig::parse(SAMPLE);
        let aliases = cfg.concrete_aliases();
        assert!(aliases.contains(&"web-01".to_string()));
        assert!(aliases.contains(&"web-02".to_string()));
        assert!(aliases.contains(&"bastion".to_string()));
        assert!(!aliases.iter().any(|a| a.contains('*')));
    }

    #[test]
    fn match_blocks_are_skipped() {
        let text = r#"
Host real
    Port 22

Match user root
    Port 666

Host other
    Port 23
"#;
        let cfg = SshConfig::parse(text);
        assert_eq!(cfg.get("real", "Port"), Some("22"));
        assert_eq!(cfg.get("other", "Port"), Some("23"));
        // The Match block's Port must not leak into any host.
        assert_eq!(cfg.get("whatever", "Port"), None);
    }

    #[test]
    fn key_equals_value_form() {
        let cfg = SshConfig::parse("Host h\n    HostName=h.example.com\n");
        assert_eq!(cfg.get("h", "HostName"), Some("h.example.com"));
    }

    #[test]
    fn include_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("config");
        let extra = dir.path().join("extra");

        let mut f = std::fs::File::create(&extra).unwrap();
        writeln!(f, "Host included-host\n    Port 7777").unwrap();

        let mut f = std::fs::File::create(&main).unwrap();
        writeln!(f, "Include {}", extra.display()).unwrap();
        writeln!(f, "Host main-host\n    Port 8888").unwrap();

        let cfg = SshConfig::load(&main).unwrap();
        assert_eq!(cfg.get("included-host", "Port"), Some("7777"));
        assert_eq!(cfg.get("main-host", "Port"), Some("8888"));
    }

    #[test]
    fn include_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");

        std::fs::write(&a, format!("Include {}\nHost from-a\n", b.display())).unwrap();
        std::fs::write(&b, format!("Include {}\nHost from-b\n", a.display())).unwrap();

        let cfg = SshConfig::load(&a).unwrap();
        let aliases = cfg.concrete_aliases();
        assert!(aliases.contains(&"from-a".to_string()));
        assert!(aliases.contains(&"from-b".to_string()));
    }
}
