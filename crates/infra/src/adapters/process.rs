//! Solver and enhancer backends that run an external executable.
//!
//! Protocol: one JSON request on stdin, one JSON response on stdout.
//!
//! | Exit code | Solver            | Enhancer          |
//! |-----------|-------------------|-------------------|
//! | 0         | parse response    | parse response    |
//! | 2         | `Infeasible`      | `Transient`       |
//! | other     | `Transient`       | `Transient`       |
//! | timeout   | `Timeout`         | `Transient`       |

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use timetable_engine::{
    Dataset, Enhancement, Enhancer, EnhancerError, ScheduleArtifact, Solution, Solver, SolverError,
};

/// Per-stream capture limit.
const MAX_OUTPUT_BYTES: u64 = 64 * 1024 * 1024;

/// Exit code a solver uses to report a proven-infeasible model.
pub const EXIT_INFEASIBLE: i32 = 2;

/// An executable plus arguments, split on whitespace (no shell involved).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl std::fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ProcessOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("failed to run {command}: {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} did not finish within {limit:?}")]
    Timeout { command: String, limit: Duration },
}

/// Spawn `command`, write `request` to stdin, and wait at most `limit` for it to exit.
///
/// The child is killed if the timeout fires.
async fn run_json<T: Serialize>(
    command: &ProcessCommand,
    request: &T,
    limit: Duration,
) -> Result<ProcessOutput, RunError> {
    let io_err = |source| RunError::Io {
        command: command.to_string(),
        source,
    };
    let payload = serde_json::to_vec(request)
        .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(io_err)?;

    let stdin = child.stdin.take();
    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    // A child that exits without reading its input closes the pipe; that is reported
    // through its exit status, not here.
    if let Some(mut stdin) = stdin {
        let _ = stdin.write_all(&payload).await;
        drop(stdin);
    }

    let status = match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => status.map_err(io_err)?,
        Err(_elapsed) => {
            return Err(RunError::Timeout {
                command: command.to_string(),
                limit,
            });
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    Ok(ProcessOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    }
    buf
}

/// Last non-empty stderr line, for error messages.
fn stderr_summary(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no diagnostic output")
        .trim()
        .to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolveRequest<'a> {
    dataset: &'a Dataset,
    time_limit_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct SolveResponse {
    objective: f64,
    schedule: ScheduleArtifact,
    #[serde(default)]
    metadata: JsonValue,
}

#[derive(Debug, Clone)]
pub struct ProcessSolver {
    command: ProcessCommand,
    /// Slack on top of the requested time limit before the process is killed.
    grace: Duration,
}

impl ProcessSolver {
    pub fn new(command: ProcessCommand) -> Self {
        Self {
            command,
            grace: Duration::from_secs(30),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[async_trait::async_trait]
impl Solver for ProcessSolver {
    fn name(&self) -> &str {
        &self.command.program
    }

    #[instrument(
        skip(self, dataset),
        fields(school_id = %dataset.school_id, revision = dataset.revision),
        err
    )]
    async fn solve(&self, dataset: &Dataset, time_limit: Duration) -> Result<Solution, SolverError> {
        let request = SolveRequest {
            dataset,
            time_limit_seconds: time_limit.as_secs(),
        };
        let output = match run_json(&self.command, &request, time_limit + self.grace).await {
            Ok(output) => output,
            Err(RunError::Timeout { .. }) => return Err(SolverError::Timeout(time_limit)),
            Err(e) => return Err(SolverError::Transient(e.to_string())),
        };

        match output.exit_code {
            0 => {
                let response: SolveResponse = serde_json::from_str(output.stdout.trim())
                    .map_err(|e| SolverError::Transient(format!("unreadable solver output: {e}")))?;
                debug!(objective = response.objective, files = response.schedule.files.len(), "solver finished");
                Ok(Solution::new(response.objective, response.schedule).with_metadata(response.metadata))
            }
            EXIT_INFEASIBLE => Err(SolverError::Infeasible(stderr_summary(&output.stderr))),
            code => {
                warn!(exit_code = code, stderr = %stderr_summary(&output.stderr), "solver failed");
                Err(SolverError::Transient(format!(
                    "solver exited with code {code}: {}",
                    stderr_summary(&output.stderr)
                )))
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct EnhanceRequest<'a> {
    schedule: &'a ScheduleArtifact,
    dataset: &'a Dataset,
}

#[derive(Debug, Clone)]
pub struct ProcessEnhancer {
    command: ProcessCommand,
    timeout: Duration,
}

impl ProcessEnhancer {
    pub fn new(command: ProcessCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait::async_trait]
impl Enhancer for ProcessEnhancer {
    fn name(&self) -> &str {
        &self.command.program
    }

    #[instrument(
        skip(self, schedule, dataset),
        fields(school_id = %dataset.school_id, revision = dataset.revision),
        err
    )]
    async fn enhance(
        &self,
        schedule: &ScheduleArtifact,
        dataset: &Dataset,
    ) -> Result<Enhancement, EnhancerError> {
        let request = EnhanceRequest { schedule, dataset };
        let output = run_json(&self.command, &request, self.timeout)
            .await
            .map_err(|e| EnhancerError::Transient(e.to_string()))?;

        if output.exit_code != 0 {
            return Err(EnhancerError::Transient(format!(
                "enhancer exited with code {}: {}",
                output.exit_code,
                stderr_summary(&output.stderr)
            )));
        }
        serde_json::from_str(output.stdout.trim())
            .map_err(|e| EnhancerError::Transient(format!("unreadable enhancer output: {e}")))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use timetable_core::SchoolId;

    fn sh(script: &str) -> ProcessCommand {
        ProcessCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn dataset() -> Dataset {
        Dataset::new(SchoolId::parse("s1").unwrap()).with_file("a.csv", "x")
    }

    #[test]
    fn parses_command_lines() {
        let cmd = ProcessCommand::parse("  python3 solve.py --fast ").unwrap();
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec!["solve.py", "--fast"]);
        assert_eq!(cmd.to_string(), "python3 solve.py --fast");
        assert!(ProcessCommand::parse("   ").is_none());
    }

    #[tokio::test]
    async fn solver_reads_json_response() {
        let solver = ProcessSolver::new(sh(
            r#"cat > /dev/null; echo '{"objective": 42.5, "schedule": {"files": {"master_schedule.csv": "x"}}}'"#,
        ));
        let solution = solver.solve(&dataset(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(solution.objective, 42.5);
        assert!(solution.schedule.files.contains_key("master_schedule.csv"));
    }

    #[tokio::test]
    async fn solver_exit_codes_map_to_errors() {
        let infeasible = ProcessSolver::new(sh("echo 'capacity too low' >&2; exit 2"));
        assert_eq!(
            infeasible.solve(&dataset(), Duration::from_secs(5)).await,
            Err(SolverError::Infeasible("capacity too low".to_string()))
        );

        let crashed = ProcessSolver::new(sh("exit 1"));
        assert!(matches!(
            crashed.solve(&dataset(), Duration::from_secs(5)).await,
            Err(SolverError::Transient(_))
        ));

        let garbage = ProcessSolver::new(sh("echo not-json"));
        assert!(matches!(
            garbage.solve(&dataset(), Duration::from_secs(5)).await,
            Err(SolverError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn solver_timeout_kills_process() {
        let slow = ProcessSolver::new(sh("sleep 5")).with_grace(Duration::ZERO);
        assert_eq!(
            slow.solve(&dataset(), Duration::from_millis(100)).await,
            Err(SolverError::Timeout(Duration::from_millis(100)))
        );
    }

    #[tokio::test]
    async fn missing_executable_is_transient() {
        let solver = ProcessSolver::new(ProcessCommand::parse("/nonexistent/solver").unwrap());
        assert!(matches!(
            solver.solve(&dataset(), Duration::from_secs(1)).await,
            Err(SolverError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn enhancer_reads_outcome() {
        let noop = ProcessEnhancer::new(
            sh(r#"cat > /dev/null; echo '{"outcome": "no_op"}'"#),
            Duration::from_secs(5),
        );
        assert_eq!(
            noop.enhance(&ScheduleArtifact::new(), &dataset()).await,
            Ok(Enhancement::NoOp)
        );

        let failing = ProcessEnhancer::new(sh("exit 3"), Duration::from_secs(5));
        assert!(failing.enhance(&ScheduleArtifact::new(), &dataset()).await.is_err());
    }
}
