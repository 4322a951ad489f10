//! Repository credentials.
//!
//! Tokens are looked up per actor through a [`CredentialProvider`] and handed
//! to git through a [`GitAuth`] strategy. A token never appears in a remote
//! URL, on a command line or on disk.

use anyhow::Context;
use base64::Engine;
use keyring::Entry;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const KEYRING_SERVICE: &str = "council-exec";

/// Environment variables consulted by [`EnvCredentials::standard`].
pub const TOKEN_ENV_VARS: &[&str] = &["COUNCIL_GITHUB_TOKEN", "GITHUB_TOKEN"];

static KEYRING_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

/// An access token for the source-control host.
#[derive(Clone)]
pub struct AccessToken(Arc<SecretString>);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(SecretString::from(token.into())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// Resolves the credential an actor uses against the source-control host.
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` means the actor has no credential here.
    fn token_for<'a>(&'a self, actor_id: &'a str) -> BoxFuture<'a, anyhow::Result<Option<AccessToken>>>;

    /// Short label for audit messages.
    fn describe(&self) -> String;
}

// ============================================================================
// Providers
// ============================================================================

/// Reads the first non-empty variable from a list. Shared by every actor.
pub struct EnvCredentials {
    vars: Vec<String>,
}

impl EnvCredentials {
    pub fn new(vars: &[&str]) -> Self {
        Self {
            vars: vars.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn standard() -> Self {
        Self::new(TOKEN_ENV_VARS)
    }

    fn lookup(&self) -> Option<(String, AccessToken)> {
        self.vars.iter().find_map(|name| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| (name.clone(), AccessToken::new(value)))
        })
    }
}

impl CredentialProvider for EnvCredentials {
    fn token_for<'a>(&'a self, _actor_id: &'a str) -> BoxFuture<'a, anyhow::Result<Option<AccessToken>>> {
        Box::pin(async move { Ok(self.lookup().map(|(_, token)| token)) })
    }

    fn describe(&self) -> String {
        format!("environment ({})", self.vars.join(", "))
    }
}

/// One OS keychain entry per actor.
pub struct KeyringCredentials {
    service: String,
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }
}

impl KeyringCredentials {
    pub fn new() -> Self {
        Self::default()
    }
}

fn keyring_disabled() -> bool {
    if cfg!(test) {
        return true;
    }
    matches!(
        std::env::var("COUNCIL_DISABLE_KEYRING")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

/// Warn about keychain errors only once per process.
fn warn_keychain_error_once(err: &keyring::Error) {
    if KEYRING_ERROR_WARNED.swap(true, Ordering::Relaxed) {
        return;
    }
    tracing::warn!(
        error = %err,
        "Couldn't access system keychain; set GITHUB_TOKEN to bypass it"
    );
}

fn read_keyring(service: &str, actor_id: &str) -> anyhow::Result<Option<AccessToken>> {
    if keyring_disabled() {
        return Ok(None);
    }
    let entry = Entry::new(service, actor_id).context("Failed to open keychain entry")?;
    match entry.get_password() {
        Ok(token) if token.trim().is_empty() => Ok(None),
        Ok(token) => Ok(Some(AccessToken::new(token.trim()))),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => {
            warn_keychain_error_once(&err);
            Ok(None)
        }
    }
}

impl CredentialProvider for KeyringCredentials {
    fn token_for<'a>(&'a self, actor_id: &'a str) -> BoxFuture<'a, anyhow::Result<Option<AccessToken>>> {
        let service = self.service.clone();
        let actor = actor_id.to_string();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || read_keyring(&service, &actor))
                .await
                .context("Keychain lookup task failed")?
        })
    }

    fn describe(&self) -> String {
        "system keychain".to_string()
    }
}

/// Store a token for an actor in the OS keychain.
pub fn set_actor_token(actor_id: &str, token: &str) -> anyhow::Result<()> {
    if keyring_disabled() {
        anyhow::bail!("Keychain access is disabled (COUNCIL_DISABLE_KEYRING)");
    }
    let token = token.trim();
    if token.is_empty() {
        anyhow::bail!("Token is empty");
    }
    let entry = Entry::new(KEYRING_SERVICE, actor_id).context("Failed to open keychain entry")?;
    entry
        .set_password(token)
        .context("Failed to store token in keychain")
}

/// Remove an actor's token from the OS keychain. Missing entries are fine.
pub fn delete_actor_token(actor_id: &str) -> anyhow::Result<()> {
    if keyring_disabled() {
        return Ok(());
    }
    let entry = Entry::new(KEYRING_SERVICE, actor_id).context("Failed to open keychain entry")?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(err) => Err(err).context("Failed to delete token from keychain"),
    }
}

/// Fixed per-actor tokens, for embedding and tests.
#[derive(Default)]
pub struct StaticCredentials {
    tokens: HashMap<String, AccessToken>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, actor_id: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(actor_id.into(), AccessToken::new(token));
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn token_for<'a>(&'a self, actor_id: &'a str) -> BoxFuture<'a, anyhow::Result<Option<AccessToken>>> {
        Box::pin(async move { Ok(self.tokens.get(actor_id).cloned()) })
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// First provider with a token wins. A failing provider is skipped.
pub struct ChainedCredentials {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl ChainedCredentials {
    pub fn new(providers: Vec<Arc<dyn CredentialProvider>>) -> Self {
        Self { providers }
    }

    /// Keychain first, then environment.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(KeyringCredentials::new()),
            Arc::new(EnvCredentials::standard()),
        ])
    }
}

impl CredentialProvider for ChainedCredentials {
    fn token_for<'a>(&'a self, actor_id: &'a str) -> BoxFuture<'a, anyhow::Result<Option<AccessToken>>> {
        Box::pin(async move {
            for provider in &self.providers {
                match provider.token_for(actor_id).await {
                    Ok(Some(token)) => return Ok(Some(token)),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(
                            provider = %provider.describe(),
                            error = %crate::redact::redact_str(&format!("{:#}", err)),
                            "credential provider failed"
                        );
                    }
                }
            }
            Ok(None)
        })
    }

    fn describe(&self) -> String {
        self.providers
            .iter()
            .map(|p| p.describe())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

// ============================================================================
// Git authentication
// ============================================================================

/// How a token reaches a git child process.
pub trait GitAuth: Send + Sync {
    /// Environment variables to add to the git invocation.
    fn git_env(&self, token: &AccessToken) -> Vec<(String, String)>;
}

/// Sends `Authorization: Basic` through `http.extraHeader`, configured via
/// `GIT_CONFIG_*` variables so nothing touches `.git/config`.
#[derive(Debug, Default, Clone)]
pub struct HttpHeaderAuth;

impl HttpHeaderAuth {
    fn header(token: &AccessToken) -> String {
        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("x-access-token:{}", token.expose()));
        format!("Authorization: Basic {}", basic)
    }
}

impl GitAuth for HttpHeaderAuth {
    fn git_env(&self, token: &AccessToken) -> Vec<(String, String)> {
        vec![
            ("GIT_CONFIG_COUNT".to_string(), "1".to_string()),
            ("GIT_CONFIG_KEY_0".to_string(), "http.extraHeader".to_string()),
            ("GIT_CONFIG_VALUE_0".to_string(), Self::header(token)),
        ]
    }
}
