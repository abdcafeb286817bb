//! Scripted fakes for the job traits (testing only)
//!
//! `ScriptedJob` replays a fixed line stream and exit status through the
//! same [`Job`] trait the real supervisor implements; `ScriptedLauncher`
//! hands out scripted jobs keyed by command string and records every launch.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::command::CommandSpec;
use crate::error::{HarnessError, HarnessResult};
use crate::supervisor::{Job, JobExit, JobLauncher, JobState};

// ---------------------------------------------------------------------------
// ScriptedJob
// ---------------------------------------------------------------------------

/// A job that prints a fixed script and exits with a fixed status.
#[derive(Debug, Clone)]
pub struct ScriptedJob {
    lines: Option<Vec<String>>,
    exit: JobExit,
    stall: bool,
    state: JobState,
    teardowns: Arc<AtomicU32>,
}

impl ScriptedJob {
    pub fn new<I, S>(lines: I, exit_code: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: Some(lines.into_iter().map(Into::into).collect()),
            exit: JobExit::code(exit_code),
            stall: false,
            state: JobState::Running,
            teardowns: Arc::new(AtomicU32::new(0)),
        }
    }

    /// After the scripted lines, never close the output (a hung job).
    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Counter of teardowns that actually fired, shared across clones.
    pub fn teardown_counter(&self) -> Arc<AtomicU32> {
        self.teardowns.clone()
    }
}

#[async_trait]
impl Job for ScriptedJob {
    fn pgid(&self) -> Option<u32> {
        None
    }

    fn lines(&mut self) -> BoxStream<'static, io::Result<String>> {
        let lines = self.lines.take().unwrap_or_default();
        let scripted = stream::iter(lines.into_iter().map(Ok));
        if self.stall {
            scripted.chain(stream::pending()).boxed()
        } else {
            scripted.boxed()
        }
    }

    async fn wait(&mut self) -> io::Result<JobExit> {
        if self.state == JobState::Killed {
            return Ok(JobExit {
                code: None,
                signal: Some(9),
            });
        }
        if self.stall {
            futures::future::pending::<()>().await;
        }
        self.state = JobState::Exited {
            code: self.exit.code,
            signal: self.exit.signal,
        };
        Ok(self.exit)
    }

    fn teardown(&mut self) -> bool {
        if self.state == JobState::Killed {
            return false;
        }
        if !self.state.is_terminal() {
            self.state = JobState::Killed;
        }
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn state(&self) -> JobState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// ScriptedLauncher
// ---------------------------------------------------------------------------

/// Launcher that maps command strings to scripted jobs.
///
/// Launching an unscripted command fails like a missing executable.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    scripts: Mutex<HashMap<String, ScriptedJob>>,
    launched: Mutex<Vec<CommandSpec>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the job to hand out for `command`.
    pub fn script(self, command: impl Into<String>, job: ScriptedJob) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(command.into(), job);
        self
    }

    /// Every spec launched so far, in order.
    pub fn launched(&self) -> Vec<CommandSpec> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobLauncher for ScriptedLauncher {
    async fn launch(&self, spec: &CommandSpec) -> HarnessResult<Box<dyn Job>> {
        self.launched.lock().unwrap().push(spec.clone());
        let job = self.scripts.lock().unwrap().get(&spec.command).cloned();
        match job {
            Some(job) => Ok(Box::new(job)),
            None => Err(HarnessError::Launch {
                command: spec.display(),
                source: io::Error::new(io::ErrorKind::NotFound, "no script for command"),
            }),
        }
    }
}
