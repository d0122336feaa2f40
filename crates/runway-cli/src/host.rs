//! Execution host that runs step commands as local processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use runway_core::{ExecutionHost, StepRequest};
use tokio::process::Command;
use tracing::{debug, warn};

/// Lines of stderr kept in a failure diagnostic.
const DIAGNOSTIC_TAIL: usize = 20;

/// Runs each command step with `tokio::process`.
///
/// The step sees its context through the environment:
/// `RUNWAY_BUILD`, `RUNWAY_STEP`, `RUNWAY_DEST`, `RUNWAY_DATABASES` and, when
/// the build restores a dump, `RUNWAY_RESTORE_DB`.
pub struct ShellHost {
    name: String,
    timeout: Option<Duration>,
    workdir: Option<PathBuf>,
}

impl ShellHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            workdir: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workdir(mut self, workdir: Option<PathBuf>) -> Self {
        self.workdir = workdir;
        self
    }
}

#[async_trait]
impl ExecutionHost for ShellHost {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_step(&self, request: &StepRequest<'_>) -> Result<(), String> {
        let Some((exe, args)) = request.command.command.split_first() else {
            return Err(format!("step {} has no command", request.step.name));
        };

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .env("RUNWAY_BUILD", request.build.build_id.to_string())
            .env("RUNWAY_STEP", &request.step.name)
            .env("RUNWAY_DEST", &request.dest)
            .env("RUNWAY_DATABASES", request.command.databases.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(db) = &request.restore_db {
            cmd.env("RUNWAY_RESTORE_DB", db);
        }
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|e| format!("failed to start {exe}: {e}"))?;
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    format!(
                        "step {} timed out after {} seconds",
                        request.step.name,
                        limit.as_secs()
                    )
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| format!("failed to wait for {exe}: {e}"))?;

        let duration_ms = start.elapsed().as_millis() as u64;
        if output.status.success() {
            debug!(step = %request.step.name, duration_ms, "command succeeded");
            return Ok(());
        }

        let exit_code = output.status.code().unwrap_or(-1);
        warn!(step = %request.step.name, exit_code, duration_ms, "command failed");
        Err(diagnostic(exit_code, &output.stderr))
    }
}

fn diagnostic(exit_code: i32, stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = &lines[lines.len().saturating_sub(DIAGNOSTIC_TAIL)..];
    if tail.is_empty() {
        format!("exit code {exit_code}")
    } else {
        format!("exit code {exit_code}: {}", tail.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_state::{
        Build, BuildParams, BuildState, BuildStore, CommandJob, ConfigId, ConfigStep,
        MemoryStore, StepId, StepJob, TriggerId, VersionId,
    };

    async fn build() -> Build {
        let params = BuildParams::new("tests", ConfigId(1), VersionId(1), TriggerId(1));
        MemoryStore::new()
            .create_build(params, None, BuildState::Pending)
            .await
            .unwrap()
            .build
    }

    fn step(command: &[&str]) -> (ConfigStep, CommandJob) {
        let job = CommandJob {
            command: command.iter().map(|s| s.to_string()).collect(),
            databases: vec!["all".to_string()],
        };
        let step = ConfigStep {
            step_id: StepId(1),
            name: "install".to_string(),
            job: StepJob::Install(job.clone()),
        };
        (step, job)
    }

    async fn run(
        host: &ShellHost,
        command: &[&str],
        restore_db: Option<&str>,
    ) -> Result<(), String> {
        let build = build().await;
        let (step, job) = step(command);
        let request = StepRequest {
            build: &build,
            step: &step,
            command: &job,
            dest: "00007-master".to_string(),
            restore_db: restore_db.map(str::to_string),
        };
        host.run_step(&request).await
    }

    #[tokio::test]
    async fn test_successful_command() {
        let host = ShellHost::new("local");
        run(&host, &["sh", "-c", "test \"$RUNWAY_DEST\" = 00007-master"], None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_restore_db_is_exported() {
        let host = ShellHost::new("local");
        run(
            &host,
            &["sh", "-c", "test \"$RUNWAY_RESTORE_DB\" = 00003-13.0-all"],
            Some("00003-13.0-all"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_failure_carries_stderr_tail() {
        let host = ShellHost::new("local");
        let err = run(&host, &["sh", "-c", "echo broken >&2; exit 3"], None)
            .await
            .unwrap_err();
        assert_eq!(err, "exit code 3: broken");
    }

    #[tokio::test]
    async fn test_timeout() {
        let host = ShellHost::new("local").with_timeout(Some(Duration::from_millis(50)));
        let err = run(&host, &["sleep", "5"], None).await.unwrap_err();
        assert!(err.contains("timed out"));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let host = ShellHost::new("local");
        let err = run(&host, &[], None).await.unwrap_err();
        assert!(err.contains("no command"));
    }

    #[test]
    fn test_diagnostic_keeps_last_lines() {
        let stderr: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let diag = diagnostic(1, stderr.as_bytes());
        assert!(diag.starts_with("exit code 1: line 10\n"));
        assert!(diag.ends_with("line 29"));
    }
}
