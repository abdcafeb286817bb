//! Process supervision for the job under test.
//!
//! A [`SupervisedJob`] owns one child running in its own process group:
//! spawn, single-pass line stream over merged stdout/stderr, wait, and a
//! group kill when the job is torn down or dropped. The kill is skipped once
//! the leader has been reaped and its group is empty.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};

use crate::command::CommandSpec;
use crate::error::{HarnessError, HarnessResult};
use crate::obs;
use crate::platform::{self, GroupGuard};

/// Lifecycle of a supervised job.
///
/// `Spawned -> Running -> (Exited | Killed)`; both terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Spawned,
    Running,
    /// The job terminated on its own.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Teardown fired before the job terminated on its own.
    Killed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Exited { .. } | JobState::Killed)
    }

    /// Move to `next` unless already terminal.
    fn advance(&mut self, next: JobState) {
        if !self.is_terminal() {
            *self = next;
        }
    }
}

/// How a job terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExit {
    /// Exit code, absent when the job was ended by a signal.
    pub code: Option<i32>,
    /// Terminating signal (unix only).
    pub signal: Option<i32>,
}

impl JobExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn is(&self, expected: i32) -> bool {
        self.code == Some(expected)
    }
}

impl fmt::Display for JobExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// A running job as seen by the scenario runner.
#[async_trait]
pub trait Job: Send {
    /// Process group id, when the job has one.
    fn pgid(&self) -> Option<u32>;

    /// Output lines in emission order. Single pass: a second call yields an
    /// empty stream. Ends once the job's output is closed.
    fn lines(&mut self) -> BoxStream<'static, io::Result<String>>;

    /// Block until the job has exited. Idempotent.
    async fn wait(&mut self) -> io::Result<JobExit>;

    /// Kill the job's whole process group. Returns `true` only for the call
    /// that actually fired; later calls are no-ops.
    fn teardown(&mut self) -> bool;

    fn state(&self) -> JobState;
}

/// Starts jobs. The seam between the scenario runner and the OS.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, spec: &CommandSpec) -> HarnessResult<Box<dyn Job>>;
}

/// Launches real processes, one fresh process group per job.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Spawn `spec` under `sh -c` in a new process group.
    ///
    /// stderr is folded into stdout before the command runs, so both arrive
    /// on one pipe in the order the job wrote them.
    pub fn spawn(spec: &CommandSpec) -> HarnessResult<SupervisedJob> {
        spec.validate().map_err(HarnessError::InvalidConfig)?;

        let script = format!("exec 2>&1\n{}", spec.command);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        platform::configure_new_group(&mut cmd);

        let launch_err = |source| HarnessError::Launch {
            command: spec.display(),
            source,
        };
        let mut child = cmd.spawn().map_err(launch_err)?;
        let pid = child
            .id()
            .ok_or_else(|| launch_err(io::Error::other("spawned process has no pid")))?;
        let stdout = child.stdout.take();

        let mut job = SupervisedJob {
            command: spec.display(),
            child,
            stdout,
            guard: GroupGuard::new(pid),
            state: JobState::Spawned,
            exit: None,
        };
        job.state.advance(JobState::Running);
        obs::emit_job_launched(&job.command, pid);
        Ok(job)
    }
}

#[async_trait]
impl JobLauncher for ProcessSupervisor {
    async fn launch(&self, spec: &CommandSpec) -> HarnessResult<Box<dyn Job>> {
        Ok(Box::new(Self::spawn(spec)?))
    }
}

/// Handle to one spawned job. Dropping it kills the job's process group.
pub struct SupervisedJob {
    command: String,
    child: Child,
    stdout: Option<ChildStdout>,
    guard: GroupGuard,
    state: JobState,
    exit: Option<JobExit>,
}

impl SupervisedJob {
    pub fn command(&self) -> &str {
        &self.command
    }

    fn record_exit(&mut self, status: ExitStatus) -> JobExit {
        let exit = JobExit::from_status(status);
        self.exit = Some(exit);
        self.state.advance(JobState::Exited {
            code: exit.code,
            signal: exit.signal,
        });
        exit
    }

    /// Disarm the guard when the leader has been reaped and nothing is left
    /// in its group. Members still running keep the pgid in use.
    fn retire_if_gone(&mut self) -> bool {
        self.exit.is_some() && !platform::group_alive(self.guard.pgid()) && self.guard.disarm()
    }
}

impl Drop for SupervisedJob {
    fn drop(&mut self) {
        // The guard fires on its own drop if still armed.
        self.retire_if_gone();
    }
}

impl fmt::Debug for SupervisedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisedJob")
            .field("command", &self.command)
            .field("pgid", &self.guard.pgid())
            .field("state", &self.state)
            .finish()
    }
}

#[async_trait]
impl Job for SupervisedJob {
    fn pgid(&self) -> Option<u32> {
        Some(self.guard.pgid())
    }

    fn lines(&mut self) -> BoxStream<'static, io::Result<String>> {
        match self.stdout.take() {
            Some(stdout) => line_stream(stdout),
            None => stream::empty().boxed(),
        }
    }

    async fn wait(&mut self) -> io::Result<JobExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        Ok(self.record_exit(status))
    }

    fn teardown(&mut self) -> bool {
        if self.exit.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.record_exit(status);
            }
        }
        if self.retire_if_gone() {
            return false;
        }
        let fired = self.guard.fire();
        if fired {
            // Direct child only; covers targets without process groups.
            let _ = self.child.start_kill();
            self.state.advance(JobState::Killed);
            obs::emit_job_torn_down(self.guard.pgid(), &self.state);
        }
        fired
    }

    fn state(&self) -> JobState {
        self.state
    }
}

/// Split a byte stream into lines.
///
/// Lines end at `\n`; a trailing `\r` is dropped and invalid UTF-8 is
/// replaced rather than rejected. A final unterminated line is still
/// yielded. The stream ends at EOF or after the first read error.
pub fn line_stream<R>(reader: R) -> BoxStream<'static, io::Result<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(BufReader::new(reader)), |state| async move {
        let mut reader = state?;
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                Some((Ok(line), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        let mut state = JobState::Running;
        state.advance(JobState::Killed);
        assert_eq!(state, JobState::Killed);
        state.advance(JobState::Exited {
            code: Some(0),
            signal: None,
        });
        assert_eq!(state, JobState::Killed);
        assert!(state.is_terminal());
        assert!(!JobState::Spawned.is_terminal());
    }

    #[test]
    fn test_job_exit_display() {
        assert_eq!(JobExit::code(3).to_string(), "exit code 3");
        let killed = JobExit {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "signal 9");
        assert!(!killed.is(0));
        assert!(JobExit::code(0).is(0));
    }

    #[tokio::test]
    async fn test_line_stream_splits_and_trims() {
        let input: &[u8] = b"first\r\nsecond\n\nlast-without-newline";
        let lines: Vec<String> = line_stream(input)
            .map(|l| l.expect("read"))
            .collect()
            .await;
        assert_eq!(lines, vec!["first", "second", "", "last-without-newline"]);
    }

    #[tokio::test]
    async fn test_line_stream_tolerates_invalid_utf8() {
        let input: &[u8] = b"lm_loss: 3.1 \xff\n";
        let lines: Vec<String> = line_stream(input)
            .map(|l| l.expect("read"))
            .collect()
            .await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("lm_loss: 3.1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_merges_stderr() {
        let spec = CommandSpec::new("echo out; echo err 1>&2; echo out2");
        let mut job = ProcessSupervisor::spawn(&spec).expect("spawn failed");
        assert_eq!(job.state(), JobState::Running);

        let lines: Vec<String> = job.lines().map(|l| l.expect("read")).collect().await;
        assert_eq!(lines, vec!["out", "err", "out2"]);

        let exit = job.wait().await.expect("wait failed");
        assert!(exit.is(0));
        assert_eq!(
            job.state(),
            JobState::Exited {
                code: Some(0),
                signal: None
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("echo \"$FI_PROVIDER\"; pwd")
            .with_env("FI_PROVIDER", "efa")
            .in_dir(dir.path());
        let mut job = ProcessSupervisor::spawn(&spec).expect("spawn failed");
        let lines: Vec<String> = job.lines().map(|l| l.expect("read")).collect().await;
        assert_eq!(lines[0], "efa");
        let reported = std::fs::canonicalize(&lines[1]).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lines_is_single_pass() {
        let mut job = ProcessSupervisor::spawn(&CommandSpec::new("echo once")).unwrap();
        let first: Vec<_> = job.lines().collect().await;
        let second: Vec<_> = job.lines().collect().await;
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_is_idempotent() {
        let mut job = ProcessSupervisor::spawn(&CommandSpec::new("exit 3")).unwrap();
        let _: Vec<_> = job.lines().collect().await;
        let first = job.wait().await.unwrap();
        let second = job.wait().await.unwrap();
        assert_eq!(first, JobExit::code(3));
        assert_eq!(first, second);
    }

    #[test]
    fn test_spawn_rejects_empty_command() {
        let err = ProcessSupervisor::spawn(&CommandSpec::new("")).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidConfig(_)));
    }
}
