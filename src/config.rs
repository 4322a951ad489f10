use crate::checks::BuildFailurePolicy;
use crate::github::DEFAULT_API_URL;
use crate::model::LogPhase;
use crate::workspace::{ensure_credential_free, CommitIdentity};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const APP_DIR: &str = "council-exec";
const DEFAULT_GIT_BASE_URL: &str = "https://github.com";

pub const ENV_DATA_DIR: &str = "COUNCIL_DATA_DIR";
pub const ENV_EVIDENCE_DIR: &str = "COUNCIL_EVIDENCE_DIR";
pub const ENV_WORKSPACE_ROOT: &str = "COUNCIL_WORKSPACE_ROOT";
pub const ENV_GITHUB_API_URL: &str = "COUNCIL_GITHUB_API_URL";
pub const ENV_GIT_BASE_URL: &str = "COUNCIL_GIT_BASE_URL";

/// Per-phase time limits, in seconds on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTimeouts {
    pub auth_secs: u64,
    pub clone_secs: u64,
    pub apply_secs: u64,
    pub build_secs: u64,
    pub test_secs: u64,
    pub publish_secs: u64,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            auth_secs: 30,
            clone_secs: 300,
            apply_secs: 60,
            build_secs: 900,
            test_secs: 1800,
            publish_secs: 300,
        }
    }
}

impl PhaseTimeouts {
    /// Same limit for every phase.
    pub fn uniform(limit: Duration) -> Self {
        let secs = limit.as_secs().max(1);
        Self {
            auth_secs: secs,
            clone_secs: secs,
            apply_secs: secs,
            build_secs: secs,
            test_secs: secs,
            publish_secs: secs,
        }
    }

    pub fn for_phase(&self, phase: LogPhase) -> Duration {
        let secs = match phase {
            LogPhase::Auth => self.auth_secs,
            LogPhase::Clone => self.clone_secs,
            LogPhase::Apply => self.apply_secs,
            LogPhase::Build => self.build_secs,
            LogPhase::Test => self.test_secs,
            LogPhase::Pr => self.publish_secs,
            _ => self.auth_secs,
        };
        Duration::from_secs(secs)
    }

    /// Longest network step, used as the git child-process limit.
    pub fn git_limit(&self) -> Duration {
        Duration::from_secs(self.clone_secs.max(self.publish_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Run store location
    pub data_dir: Option<PathBuf>,
    pub evidence_dir: Option<PathBuf>,
    pub workspace_root: Option<PathBuf>,
    pub github_api_url: String,
    /// Clone URLs are `<git_base_url>/<owner>/<repo>.git`
    pub git_base_url: String,
    pub commit_name: String,
    pub commit_email: String,
    pub timeouts: PhaseTimeouts,
    pub build_failure_policy: BuildFailurePolicy,
    /// Characters of build/test output kept per step
    pub output_limit: usize,
    /// Log entries shown per run in listings
    pub recent_log_limit: usize,
    pub stale_workspace_hours: u64,
}

impl Default for Config {
    fn default() -> Self {
        let identity = CommitIdentity::default();
        Self {
            data_dir: None,
            evidence_dir: None,
            workspace_root: None,
            github_api_url: DEFAULT_API_URL.to_string(),
            git_base_url: DEFAULT_GIT_BASE_URL.to_string(),
            commit_name: identity.name,
            commit_email: identity.email,
            timeouts: PhaseTimeouts::default(),
            build_failure_policy: BuildFailurePolicy::default(),
            output_limit: 20_000,
            recent_log_limit: 5,
            stale_workspace_hours: 24,
        }
    }
}

/// Config with environment overrides and defaults applied.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    pub evidence_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub github_api_url: Url,
    pub git_base_url: Url,
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(APP_DIR))
    }

    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if let Ok(content) = fs::read_to_string(path) {
            match serde_json::from_str(&content) {
                Ok(config) => return config,
                Err(err) => {
                    preserve_corrupt_config(path, &content);
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "Config file was corrupted; a backup was saved and defaults were loaded"
                    );
                }
            }
        }
        Self::default()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().context("Could not determine config directory")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    tracing::warn!(error = %e, "Failed to set config directory permissions");
                }
            }
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        write_config_atomic(path, &content).context("Failed to write config")
    }

    pub fn commit_identity(&self) -> CommitIdentity {
        CommitIdentity {
            name: self.commit_name.clone(),
            email: self.commit_email.clone(),
        }
    }

    pub fn resolve(&self) -> Result<ResolvedConfig> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    fn resolve_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<ResolvedConfig> {
        let env = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let data_dir = env(ENV_DATA_DIR)
            .map(PathBuf::from)
            .or_else(|| self.data_dir.clone())
            .or_else(|| dirs::data_local_dir().map(|p| p.join(APP_DIR)))
            .unwrap_or_else(|| PathBuf::from(".council-exec"));
        let evidence_dir = env(ENV_EVIDENCE_DIR)
            .map(PathBuf::from)
            .or_else(|| self.evidence_dir.clone())
            .unwrap_or_else(|| data_dir.join("evidence"));
        let workspace_root = env(ENV_WORKSPACE_ROOT)
            .map(PathBuf::from)
            .or_else(|| self.workspace_root.clone())
            .unwrap_or_else(|| std::env::temp_dir().join("council-exec-workspaces"));

        let api_raw = env(ENV_GITHUB_API_URL).unwrap_or_else(|| self.github_api_url.clone());
        let github_api_url =
            Url::parse(&api_raw).with_context(|| format!("Invalid GitHub API URL '{}'", api_raw))?;
        let git_raw = env(ENV_GIT_BASE_URL).unwrap_or_else(|| self.git_base_url.clone());
        let git_base_url =
            Url::parse(&git_raw).with_context(|| format!("Invalid git base URL '{}'", git_raw))?;
        ensure_credential_free(&git_base_url)?;

        Ok(ResolvedConfig {
            data_dir,
            evidence_dir,
            workspace_root,
            github_api_url,
            git_base_url,
        })
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            tracing::warn!(error = %e, "Failed to set temp config file permissions");
        }
    }

    file.write_all(content.as_bytes())?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.build_failure_policy, BuildFailurePolicy::Tolerate);
        assert_eq!(config.timeouts.for_phase(LogPhase::Test), Duration::from_secs(1800));
        assert_eq!(config.github_api_url, "https://api.github.com");
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"build_failure_policy": "block", "timeouts": {"build_secs": 5}}"#)
                .unwrap();
        assert_eq!(config.build_failure_policy, BuildFailurePolicy::Block);
        assert_eq!(config.timeouts.build_secs, 5);
        assert_eq!(config.timeouts.clone_secs, 300);
        assert_eq!(config.recent_log_limit, 5);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            output_limit: 123,
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).output_limit, 123);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_corrupt_config_is_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let config = Config::load_from(&path);
        assert_eq!(config.output_limit, Config::default().output_limit);
        assert!(dir.path().join("config.json.corrupt").exists());
    }

    #[test]
    fn test_env_overrides_win() {
        let vars: HashMap<&str, &str> = [
            (ENV_DATA_DIR, "/srv/council"),
            (ENV_GIT_BASE_URL, "https://git.example.com"),
            (ENV_WORKSPACE_ROOT, "  "),
        ]
        .into_iter()
        .collect();
        let config = Config {
            workspace_root: Some(PathBuf::from("/var/ws")),
            ..Config::default()
        };
        let resolved = config
            .resolve_with(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(resolved.data_dir, PathBuf::from("/srv/council"));
        assert_eq!(resolved.evidence_dir, PathBuf::from("/srv/council/evidence"));
        assert_eq!(resolved.workspace_root, PathBuf::from("/var/ws"));
        assert_eq!(resolved.git_base_url.as_str(), "https://git.example.com/");
    }

    #[test]
    fn test_git_base_url_with_credentials_rejected() {
        let config = Config {
            git_base_url: "https://user:pw@github.com".to_string(),
            ..Config::default()
        };
        assert!(config.resolve_with(|_| None).is_err());
    }
}
