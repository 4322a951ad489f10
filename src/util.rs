use crate::cancel::{guarded, CancelSignal, Interrupted};
use crate::redact::is_sensitive_key;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Keep the tail of captured tool output, where failures are reported.
pub fn truncate_output(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    let char_count = trimmed.chars().count();
    if char_count <= max {
        trimmed.to_string()
    } else {
        let tail: String = trimmed.chars().skip(char_count - max).collect();
        format!("… (truncated)\n{}", tail)
    }
}

/// A child process invocation as a typed argument vector. Nothing here goes
/// through a shell.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Added after inherited credential-named variables are stripped
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ProcessSpec {
    pub fn new<I, S>(program: &str, args: I, cwd: &Path, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Run a child process, killing it on timeout or cancellation.
///
/// Errors only when the process cannot be spawned. Timeouts, cancellation
/// and non-zero exits are reported in [`ProcessOutput`].
pub async fn run_process(spec: &ProcessSpec, cancel: &CancelSignal) -> anyhow::Result<ProcessOutput> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (name, _) in std::env::vars_os() {
        if name.to_str().is_some_and(is_sensitive_key) {
            command.env_remove(&name);
        }
    }
    command.env("GIT_TERMINAL_PROMPT", "0");
    command.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let child = command
        .spawn()
        .with_context(|| format!("Failed to start {}", spec.program))?;

    // The child is owned by the future; dropping it on interrupt kills it.
    match guarded(cancel, spec.timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.with_context(|| format!("Failed to wait for {}", spec.program))?;
            Ok(ProcessOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
                cancelled: false,
            })
        }
        Err(Interrupted::TimedOut) => Ok(ProcessOutput {
            timed_out: true,
            ..ProcessOutput::default()
        }),
        Err(Interrupted::Cancelled) => Ok(ProcessOutput {
            cancelled: true,
            ..ProcessOutput::default()
        }),
    }
}

/// Whether `program` resolves on `PATH`.
pub fn program_on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_unicode_safe() {
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
        assert_eq!(truncate("ok", 10), "ok");
    }

    #[test]
    fn test_truncate_output_keeps_tail() {
        let out = truncate_output("line one\nerror: 失败", 9);
        assert_eq!(out, "… (truncated)\nerror: 失败");
        assert_eq!(truncate_output("  ok \n", 10), "ok");
    }

    #[test]
    fn test_combined_output() {
        let out = ProcessOutput {
            exit_code: Some(0),
            stdout: "a".into(),
            stderr: "b".into(),
            ..ProcessOutput::default()
        };
        assert_eq!(out.combined(), "a\nb");
        assert!(out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_process_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ProcessSpec::new(
            "sh",
            ["-c", "echo out; echo err >&2; exit 3"],
            dir.path(),
            Duration::from_secs(10),
        );
        let out = run_process(&spec, &CancelSignal::never()).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_process_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ProcessSpec::new("sleep", ["5"], dir.path(), Duration::from_millis(50));
        let out = run_process(&spec, &CancelSignal::never()).await.unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_process_strips_credential_env() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ProcessSpec::new(
            "sh",
            ["-c", "printf '%s|%s' \"$COUNCIL_TEST_SECRET\" \"$EXPLICIT\""],
            dir.path(),
            Duration::from_secs(10),
        )
        .with_env(vec![("EXPLICIT".into(), "yes".into())]);
        std::env::set_var("COUNCIL_TEST_SECRET", "leak");
        let out = run_process(&spec, &CancelSignal::never()).await.unwrap();
        assert_eq!(out.stdout, "|yes");
    }
}
