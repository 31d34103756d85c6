use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Workflows run under a hard timeout; on expiry the whole process group
/// is terminated, not just the launcher.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

const CLEAN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn workflow executable {executable:?}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed while waiting for the workflow process")]
    Wait(#[source] std::io::Error),
    #[error("could not find the workflow run name in its launch output")]
    MissingRunName,
    #[error("failed to persist workflow logs")]
    PersistLogs(#[source] std::io::Error),
}

/// A project's external workflow: a Nextflow-style CLI launched as a
/// subprocess per validation.
#[derive(Debug, Clone)]
pub struct Workflow {
    /// Path of the workflow executable.
    pub executable: PathBuf,
    /// Workflow repository in `org/repo` form.
    pub repo: String,
    pub branch: String,
    pub config: Option<PathBuf>,
    pub profile: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, PartialEq)]
pub enum RunStatus {
    /// The process exited on its own with this code.
    Exited(i32),
    /// The timeout expired and the process group was killed.
    TimedOut,
}

#[derive(Debug)]
pub struct WorkflowRun {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
}

impl WorkflowRun {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Exited(0)
    }

    /// Keep the launcher's output alongside the workflow results.
    pub async fn persist(&self, dir: &Path) -> Result<(), ExecError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(ExecError::PersistLogs)?;
        tokio::fs::write(dir.join("workflow.stdout"), &self.stdout)
            .await
            .map_err(ExecError::PersistLogs)?;
        tokio::fs::write(dir.join("workflow.stderr"), &self.stderr)
            .await
            .map_err(ExecError::PersistLogs)?;
        Ok(())
    }
}

impl Workflow {
    /// Launch the workflow with `--key value` parameters, blocking until
    /// it exits or the timeout expires.
    #[tracing::instrument(skip_all, fields(repo = %self.repo))]
    pub async fn execute(
        &self,
        params: &BTreeMap<String, String>,
        logdir: &Path,
    ) -> Result<WorkflowRun, ExecError> {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("-log").arg(logdir.join("workflow.log"));
        cmd.args(["run", "-r", &self.branch, "-latest", &self.repo]);
        if let Some(config) = &self.config {
            cmd.arg("-c").arg(config);
        }
        if let Some(profile) = &self.profile {
            cmd.args(["-profile", profile]);
        }
        for (key, value) in params {
            cmd.arg(format!("--{key}")).arg(value);
        }

        tracing::info!(args = ?cmd.get_args().collect::<Vec<_>>(), "launching workflow");
        run_command(cmd, self.timeout).await
    }

    /// Remove the run's intermediate state. The run name is recovered
    /// from the launch banner of `stdout`.
    pub async fn clean(&self, stdout: &str) -> Result<WorkflowRun, ExecError> {
        let run_name = parse_run_name(stdout).ok_or(ExecError::MissingRunName)?;

        let mut cmd = Command::new(&self.executable);
        cmd.args(["clean", "-f", &run_name]);

        run_command(cmd, CLEAN_TIMEOUT).await
    }
}

/// The launch banner names the run: `Launching <repo> [<run name>] DSL2 ...`.
fn parse_run_name(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find(|line| line.starts_with("Launching"))?
        .split_whitespace()
        .nth(2)
        .map(|token| token.trim_matches(|c| c == '[' || c == ']').to_string())
}

/// Run `cmd` in its own process group, killing the whole group if
/// `timeout` expires.
async fn run_command(mut cmd: Command, timeout: Duration) -> Result<WorkflowRun, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn().map_err(|source| ExecError::Spawn {
        executable: cmd.get_program().into(),
        source,
    })?;
    let pid = child.id() as i32;

    // Waiting on a std child is blocking work.
    let mut wait = tokio::task::spawn_blocking(move || child.wait_with_output());

    let output = match tokio::time::timeout(timeout, &mut wait).await {
        Ok(joined) => joined.expect("wait_with_output does not panic").map_err(ExecError::Wait)?,
        Err(_elapsed) => {
            tracing::error!(pid, "workflow timed out, killing process group");
            kill_group(pid);

            // Reap the launcher now that the group is gone.
            let output = wait
                .await
                .expect("wait_with_output does not panic")
                .map_err(ExecError::Wait)?;
            return Ok(WorkflowRun {
                status: RunStatus::TimedOut,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
    };

    Ok(WorkflowRun {
        status: RunStatus::Exited(output.status.code().unwrap_or(-1)),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(unix)]
fn kill_group(pid: i32) {
    // The child was made its own process group leader, so this reaches
    // every process the workflow spawned.
    if unsafe { libc::killpg(pid, libc::SIGKILL) } != 0 {
        tracing::error!(pid, "failed to kill workflow process group");
    }
}

#[cfg(not(unix))]
fn kill_group(pid: i32) {
    tracing::error!(pid, "process-group termination is unsupported on this platform");
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn commands_complete_with_their_exit_code() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);

        let run = run_command(cmd, Duration::from_secs(5)).await.unwrap();
        assert_eq!(run.status, RunStatus::Exited(3));
        assert_eq!(run.stdout, "out\n");
        assert_eq!(run.stderr, "err\n");
        assert!(!run.succeeded());
    }

    #[tokio::test]
    async fn expired_timeouts_kill_the_process_group() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 30"]);

        let started = std::time::Instant::now();
        let run = run_command(cmd, Duration::from_millis(200)).await.unwrap();

        assert_eq!(run.status, RunStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_executables_fail_to_spawn() {
        let cmd = Command::new("/does/not/exist");
        assert!(matches!(
            run_command(cmd, Duration::from_secs(1)).await,
            Err(ExecError::Spawn { .. }),
        ));
    }

    #[test]
    fn run_names_parse_from_the_launch_banner() {
        let stdout = "N E X T F L O W  ~  version 23.04.1\n\
                      Launching `https://github.com/org/wf` [agitated_leavitt] DSL2 - revision: abc123\n";
        assert_eq!(parse_run_name(stdout), Some("agitated_leavitt".to_string()));
        assert_eq!(parse_run_name("no banner here"), None);
    }

    #[tokio::test]
    async fn logs_persist_alongside_results() {
        let dir = tempfile::tempdir().unwrap();
        let run = WorkflowRun {
            status: RunStatus::Exited(0),
            stdout: "out".to_string(),
            stderr: String::new(),
        };

        run.persist(dir.path()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("workflow.stdout")).unwrap(),
            "out",
        );
    }
}
