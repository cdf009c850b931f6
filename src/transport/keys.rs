//! SSH credential sources.
//!
//! The in-process SSH transport authenticates with, in order: an ephemeral
//! key provider (if configured), then on-disk private keys, then an
//! interactive password prompt. This module covers the first two.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use russh_keys::key::KeyPair;

#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyProviderError {
    /// The provider is not configured or has nothing to offer; callers
    /// fall through to the next credential source.
    #[error("ephemeral key not available")]
    NotAvailable,

    #[error("ephemeral key provider failed: {0}")]
    Failed(String),
}

/// Capability to mint short-lived SSH keys, e.g. via an SSO-backed CLI.
#[async_trait]
pub trait EphemeralKeyProvider: Send + Sync {
    async fn key_pair(&self) -> Result<KeyPair, KeyProviderError>;
}

/// The always-unavailable provider, used when ephemeral keys are disabled.
pub struct DisabledKeyProvider;

#[async_trait]
impl EphemeralKeyProvider for DisabledKeyProvider {
    async fn key_pair(&self) -> Result<KeyPair, KeyProviderError> {
        Err(KeyProviderError::NotAvailable)
    }
}

/// Generates a fresh in-memory key on every call. Only good for tests and
/// for exercising the auth fallback chain.
pub struct MockKeyProvider;

#[async_trait]
impl EphemeralKeyProvider for MockKeyProvider {
    async fn key_pair(&self) -> Result<KeyPair, KeyProviderError> {
        KeyPair::generate_ed25519()
            .ok_or_else(|| KeyProviderError::Failed("ed25519 generation failed".to_string()))
    }
}

/// Obtains a key by running an external CLI (an `opkssh`-style tool) that
/// prints a PEM private key on stdout.
pub struct ExternalKeyProvider {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ExternalKeyProvider {
    fn default() -> Self {
        ExternalKeyProvider {
            program: "opkssh".to_string(),
            args: vec![
                "key".to_string(),
                "export".to_string(),
                "--private".to_string(),
            ],
        }
    }
}

#[async_trait]
impl EphemeralKeyProvider for ExternalKeyProvider {
    async fn key_pair(&self) -> Result<KeyPair, KeyProviderError> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| KeyProviderError::Failed(format!("running {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(KeyProviderError::Failed(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        let pem = String::from_utf8_lossy(&output.stdout);
        russh_keys::decode_secret_key(&pem, None)
            .map_err(|e| KeyProviderError::Failed(format!("parsing exported key: {e}")))
    }
}

/// Build a provider from its config/CLI name. Valid names: `""` (disabled),
/// `"mock"`, `"external"`.
pub fn provider_from_name(
    name: &str,
) -> anyhow::Result<std::sync::Arc<dyn EphemeralKeyProvider>> {
    match name {
        "" => Ok(std::sync::Arc::new(DisabledKeyProvider)),
        "mock" => Ok(std::sync::Arc::new(MockKeyProvider)),
        "external" => Ok(std::sync::Arc::new(ExternalKeyProvider::default())),
        other => anyhow::bail!(
            "invalid ephemeral key provider {other:?} (valid: mock, external, or empty to disable)"
        ),
    }
}

/// Key files tried by default when the user configures none.
pub fn default_key_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .collect()
}

/// Filter `paths` down to the ones that exist on disk, preserving order.
pub fn existing_key_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths.iter().filter(|p| p.exists()).cloned().collect()
}

/// Load one on-disk private key, unencrypted.
pub fn load_key_file(path: &Path) -> Result<KeyPair, String> {
    russh_keys::load_secret_key(path, None)
        .map_err(|e| format!("loading {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::PublicKeyBase64;

    #[tokio::test]
    async fn disabled_provider_is_not_available() {
        let err = DisabledKeyProvider.key_pair().await.unwrap_err();
        assert!(matches!(err, KeyProviderError::NotAvailable));
    }

    #[tokio::test]
    async fn mock_provider_generates_keys() {
        let key = MockKeyProvider.key_pair().await.unwrap();
        // Two calls must not return the same key.
        let key2 = MockKeyProvider.key_pair().await.unwrap();
        assert_ne!(
            key.public_key_base64(),
            key2.public_key_base64(),
            "mock provider must mint a fresh key each time"
        );
    }

    #[test]
    fn provider_names() {
        assert!(provider_from_name("").is_ok());
        assert!(provider_from_name("mock").is_ok());
        assert!(provider_from_name("external").is_ok());
        assert!(provider_from_name("bogus").is_err());
    }

    #[test]
    fn existing_key_files_filters() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("id_ed25519");
        std::fs::write(&present, "not really a key").unwrap();
        let missing = dir.path().join("id_rsa");

        let found = existing_key_files(&[missing, present.clone()]);
        assert_eq!(found, vec![present]);
    }
}
