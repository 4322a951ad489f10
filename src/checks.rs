//! Build and test procedure detection and execution.
//!
//! Detects which build/test procedure a checked-out repository declares
//! and runs it with a timeout. A missing procedure is a skip, not an error.

use crate::cancel::CancelSignal;
use crate::redact::redact_str;
use crate::util::{run_process, truncate_output, ProcessSpec};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

/// npm writes this into `scripts.test` for new packages.
const NPM_PLACEHOLDER_TEST: &str = "no test specified";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Build,
    Test,
}

impl CheckKind {
    pub fn name(self) -> &'static str {
        match self {
            CheckKind::Build => "build",
            CheckKind::Test => "test",
        }
    }
}

/// What happens to a run when a build or test procedure fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFailurePolicy {
    /// Log a warning and keep going
    #[default]
    Tolerate,
    /// Fail the run
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Procedure {
    pub program: String,
    pub args: Vec<String>,
}

impl Procedure {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn label(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed { exit_code: Option<i32> },
    TimedOut,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub kind: &'static str,
    pub procedure: Option<Procedure>,
    pub status: StepStatus,
    pub output: String,
    pub duration_ms: u64,
}

impl StepReport {
    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Failed { .. } | StepStatus::TimedOut
        )
    }

    /// A report for a step that was not actually executed.
    pub fn simulated(kind: CheckKind, status: StepStatus, output: &str) -> Self {
        Self {
            kind: kind.name(),
            procedure: None,
            status,
            output: output.to_string(),
            duration_ms: 0,
        }
    }

    pub fn summary(&self) -> String {
        let label = self
            .procedure
            .as_ref()
            .map(Procedure::label)
            .unwrap_or_else(|| format!("simulated {}", self.kind));
        match &self.status {
            StepStatus::Passed => format!("{} passed ({}ms)", label, self.duration_ms),
            StepStatus::Failed { exit_code } => format!(
                "{} failed with exit code {}",
                label,
                exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
            StepStatus::TimedOut => format!("{} timed out", label),
            StepStatus::Skipped => format!("No {} procedure declared; skipped", self.kind),
        }
    }
}

// ============================================================================
// Detection
// ============================================================================

/// Find the procedure a repository declares for `kind`. The first matching
/// ecosystem wins: Cargo, npm, Go, Python, then Make.
pub fn detect(repo: &Path, kind: CheckKind) -> Option<Procedure> {
    detect_cargo(repo, kind)
        .or_else(|| detect_npm(repo, kind))
        .or_else(|| detect_go(repo, kind))
        .or_else(|| detect_python(repo, kind))
        .or_else(|| detect_make(repo, kind))
}

fn detect_cargo(repo: &Path, kind: CheckKind) -> Option<Procedure> {
    if !repo.join("Cargo.toml").is_file() {
        return None;
    }
    Some(match kind {
        CheckKind::Build => Procedure::new("cargo", &["build"]),
        CheckKind::Test => Procedure::new("cargo", &["test"]),
    })
}

fn detect_npm(repo: &Path, kind: CheckKind) -> Option<Procedure> {
    let content = fs::read_to_string(repo.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&content).ok()?;
    let scripts = manifest.get("scripts")?.as_object()?;
    match kind {
        CheckKind::Build => scripts
            .get("build")
            .and_then(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(|_| Procedure::new("npm", &["run", "build"])),
        CheckKind::Test => scripts
            .get("test")
            .and_then(|s| s.as_str())
            .filter(|s| !s.trim().is_empty() && !s.contains(NPM_PLACEHOLDER_TEST))
            .map(|_| Procedure::new("npm", &["test"])),
    }
}

fn detect_go(repo: &Path, kind: CheckKind) -> Option<Procedure> {
    if !repo.join("go.mod").is_file() {
        return None;
    }
    Some(match kind {
        CheckKind::Build => Procedure::new("go", &["build", "./..."]),
        CheckKind::Test => Procedure::new("go", &["test", "./..."]),
    })
}

fn detect_python(repo: &Path, kind: CheckKind) -> Option<Procedure> {
    let content = fs::read_to_string(repo.join("pyproject.toml")).ok()?;
    match kind {
        CheckKind::Build => Some(Procedure::new("python", &["-m", "compileall", "-q", "."])),
        CheckKind::Test => {
            let pytest_configured = content
                .parse::<toml::Table>()
                .ok()
                .and_then(|table| table.get("tool")?.get("pytest").cloned())
                .is_some();
            if pytest_configured || repo.join("tests").is_dir() {
                Some(Procedure::new("python", &["-m", "pytest"]))
            } else {
                None
            }
        }
    }
}

fn detect_make(repo: &Path, kind: CheckKind) -> Option<Procedure> {
    let content = fs::read_to_string(repo.join("Makefile")).ok()?;
    let target = kind.name();
    let declared = content.lines().any(|line| {
        line.strip_prefix(target)
            .is_some_and(|rest| rest.starts_with(':') && !rest.starts_with(":="))
    });
    declared.then(|| Procedure::new("make", &[target]))
}

// ============================================================================
// Execution
// ============================================================================

/// Detect and run the `kind` procedure in `repo`.
///
/// Non-zero exits, timeouts and programs that cannot be started are reported
/// in the [`StepReport`]; only cancellation is an error.
pub async fn run_check(
    repo: &Path,
    kind: CheckKind,
    timeout: Duration,
    output_limit: usize,
    cancel: &CancelSignal,
) -> Result<StepReport> {
    let Some(procedure) = detect(repo, kind) else {
        return Ok(StepReport {
            kind: kind.name(),
            procedure: None,
            status: StepStatus::Skipped,
            output: String::new(),
            duration_ms: 0,
        });
    };
    run_procedure(repo, kind, procedure, timeout, output_limit, cancel).await
}

async fn run_procedure(
    repo: &Path,
    kind: CheckKind,
    procedure: Procedure,
    timeout: Duration,
    output_limit: usize,
    cancel: &CancelSignal,
) -> Result<StepReport> {
    let spec = ProcessSpec::new(&procedure.program, procedure.args.clone(), repo, timeout);
    let start = Instant::now();
    let output = match run_process(&spec, cancel).await {
        Ok(output) => output,
        Err(err) => {
            let message = redact_str(&format!("{:#}", err)).into_owned();
            tracing::warn!(procedure = %procedure.label(), "Check could not be started: {}", message);
            return Ok(StepReport {
                kind: kind.name(),
                procedure: Some(procedure),
                status: StepStatus::Failed { exit_code: None },
                output: truncate_output(&message, output_limit),
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
    };
    let duration_ms = start.elapsed().as_millis() as u64;
    if output.cancelled {
        bail!("{} cancelled", procedure.label());
    }

    let status = if output.timed_out {
        StepStatus::TimedOut
    } else if output.success() {
        StepStatus::Passed
    } else {
        StepStatus::Failed {
            exit_code: output.exit_code,
        }
    };

    Ok(StepReport {
        kind: kind.name(),
        procedure: Some(procedure),
        status,
        output: truncate_output(&output.combined(), output_limit),
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::program_on_path;
    use tempfile::tempdir;

    #[test]
    fn test_detect_cargo() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        assert_eq!(
            detect(dir.path(), CheckKind::Build).unwrap().label(),
            "cargo build"
        );
        assert_eq!(
            detect(dir.path(), CheckKind::Test).unwrap().label(),
            "cargo test"
        );
    }

    #[test]
    fn test_npm_placeholder_test_is_ignored() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"build": "tsc", "test": "echo \"Error: no test specified\" && exit 1"}}"#,
        )
        .unwrap();
        assert_eq!(
            detect(dir.path(), CheckKind::Build).unwrap().label(),
            "npm run build"
        );
        assert!(detect(dir.path(), CheckKind::Test).is_none());
    }

    #[test]
    fn test_python_pytest_detection() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("pyproject.toml"),
            "[project]\nname = \"x\"\n\n[tool.pytest.ini_options]\naddopts = \"-q\"\n",
        )
        .unwrap();
        assert_eq!(
            detect(dir.path(), CheckKind::Test).unwrap().label(),
            "python -m pytest"
        );

        let bare = tempdir().unwrap();
        fs::write(bare.path().join("pyproject.toml"), "[project]\nname = \"x\"\n").unwrap();
        assert!(detect(bare.path(), CheckKind::Test).is_none());
        assert_eq!(
            detect(bare.path(), CheckKind::Build).unwrap().label(),
            "python -m compileall -q ."
        );
    }

    #[test]
    fn test_make_targets() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("Makefile"),
            "CC := gcc\nbuild: deps\n\t$(CC) main.c\n",
        )
        .unwrap();
        assert_eq!(
            detect(dir.path(), CheckKind::Build).unwrap().label(),
            "make build"
        );
        assert!(detect(dir.path(), CheckKind::Test).is_none());
    }

    #[test]
    fn test_nothing_declared() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("README.md"), "hi").unwrap();
        assert!(detect(dir.path(), CheckKind::Build).is_none());
    }

    #[tokio::test]
    async fn test_run_check_skips_without_procedure() {
        let dir = tempdir().unwrap();
        let report = run_check(
            dir.path(),
            CheckKind::Test,
            Duration::from_secs(5),
            1000,
            &CancelSignal::never(),
        )
        .await
        .unwrap();
        assert_eq!(report.status, StepStatus::Skipped);
        assert!(!report.is_failure());
        assert_eq!(report.summary(), "No test procedure declared; skipped");
    }

    #[tokio::test]
    async fn test_run_check_reports_failure() {
        if !program_on_path("make") {
            return;
        }
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), "test:\n\t@echo broken && exit 2\n").unwrap();
        let report = run_check(
            dir.path(),
            CheckKind::Test,
            Duration::from_secs(30),
            1000,
            &CancelSignal::never(),
        )
        .await
        .unwrap();
        assert!(report.is_failure());
        assert!(report.output.contains("broken"));
    }

    #[tokio::test]
    async fn test_unstartable_program_is_a_failed_step() {
        let dir = tempdir().unwrap();
        let procedure = Procedure::new("council-missing-tool-7f3a", &["build"]);
        let report = run_procedure(
            dir.path(),
            CheckKind::Build,
            procedure,
            Duration::from_secs(5),
            1000,
            &CancelSignal::never(),
        )
        .await
        .unwrap();
        assert_eq!(report.status, StepStatus::Failed { exit_code: None });
        assert!(report.is_failure());
        assert!(report.output.contains("Failed to start council-missing-tool-7f3a"));
        assert_eq!(
            report.summary(),
            "council-missing-tool-7f3a build failed with exit code none"
        );
    }
}
