//! End-to-end scenario execution.
//!
//! One run: generate the job's config, launch the job, stream its output
//! through the parser and the threshold policy, stop at the first fatal
//! condition, then require the expected exit code. The job's process group
//! is killed on every path out of [`ScenarioRunner::run`].

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use tracing::Instrument;
use uuid::Uuid;

use crate::command::CommandSpec;
use crate::config::{ScenarioConfig, SuiteConfig};
use crate::echo::Echo;
use crate::error::{HarnessError, HarnessResult, ParseError};
use crate::obs;
use crate::parser::{parse_line, LineFields};
use crate::policy::ThresholdPolicy;
use crate::report::{FailureReport, ScenarioOutcome, SuiteOutcome};
use crate::supervisor::{Job, JobExit, JobLauncher, ProcessSupervisor};
use crate::telemetry::GENERATOR_OUTPUT_TARGET;

/// Binds loss values to the iteration they report on.
///
/// A loss belongs to the most recent iteration line (same line or an
/// earlier one). An iteration that some rule targets must receive a loss
/// before the next iteration line or the end of the stream.
#[derive(Debug)]
pub struct MetricCursor<'a> {
    policy: &'a ThresholdPolicy,
    current: Option<u64>,
    awaiting_loss: Option<(u64, String)>,
}

impl<'a> MetricCursor<'a> {
    pub fn new(policy: &'a ThresholdPolicy) -> Self {
        Self {
            policy,
            current: None,
            awaiting_loss: None,
        }
    }

    /// Feed one parsed line; returns the `(iteration, loss)` pair it completes.
    pub fn observe(
        &mut self,
        line: &str,
        fields: LineFields,
    ) -> Result<Option<(u64, f64)>, ParseError> {
        if let Some(iteration) = fields.iteration {
            if let Some((pending, pending_line)) = self.awaiting_loss.take() {
                return Err(ParseError::MissingLoss {
                    iteration: pending,
                    line: pending_line,
                });
            }
            self.current = Some(iteration);
            if self.policy.targets(iteration) {
                self.awaiting_loss = Some((iteration, line.to_string()));
            }
        }

        let Some(loss) = fields.loss else {
            return Ok(None);
        };
        match self.current {
            Some(iteration) => {
                self.awaiting_loss = None;
                Ok(Some((iteration, loss)))
            }
            None => {
                tracing::debug!(loss, "loss reported before any iteration; ignored");
                Ok(None)
            }
        }
    }

    /// End of stream: fails if a checked iteration never got its loss.
    pub fn finish(self) -> Result<(), ParseError> {
        match self.awaiting_loss {
            Some((iteration, line)) => Err(ParseError::MissingLoss { iteration, line }),
            None => Ok(()),
        }
    }
}

/// What a run saw, whether or not it passed.
#[derive(Debug, Default)]
struct Progress {
    lines_seen: u64,
    metrics_observed: u64,
    last_iteration: Option<u64>,
    last_loss: Option<f64>,
    exit: Option<JobExit>,
}

/// Runs scenarios against jobs started by a [`JobLauncher`].
pub struct ScenarioRunner {
    launcher: Arc<dyn JobLauncher>,
}

impl Default for ScenarioRunner {
    fn default() -> Self {
        Self::new(Arc::new(ProcessSupervisor))
    }
}

impl ScenarioRunner {
    pub fn new(launcher: Arc<dyn JobLauncher>) -> Self {
        Self { launcher }
    }

    /// Run one scenario to a verdict.
    ///
    /// Never returns early with an error: every fatal condition becomes the
    /// outcome's `failure`.
    pub async fn run(&self, config: &ScenarioConfig) -> ScenarioOutcome {
        let run_id = Uuid::new_v4();
        let span = obs::scenario_span(&config.name, &run_id.to_string());
        self.run_with_id(config, run_id).instrument(span).await
    }

    /// Run scenarios one after another; a failure does not stop the suite.
    pub async fn run_suite(&self, suite: &SuiteConfig) -> SuiteOutcome {
        let mut outcome = SuiteOutcome::default();
        for scenario in suite.resolved() {
            outcome.scenarios.push(self.run(&scenario).await);
        }
        outcome
    }

    async fn run_with_id(&self, config: &ScenarioConfig, run_id: Uuid) -> ScenarioOutcome {
        let started_at = Utc::now();
        let start = Instant::now();
        let config_digest = config.digest();
        obs::emit_scenario_started(&config.name, &run_id.to_string(), &config_digest);

        let mut progress = Progress::default();
        let result = match config.deadline() {
            Some(limit) => {
                // On expiry the execute future is dropped together with the
                // job it owns, which kills the job's process group.
                match tokio::time::timeout(limit, self.execute(config, &mut progress)).await {
                    Ok(result) => result,
                    Err(_) => Err(HarnessError::Timeout {
                        limit_ms: limit.as_millis() as u64,
                    }),
                }
            }
            None => self.execute(config, &mut progress).await,
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let failure = result.as_ref().err().map(FailureReport::from);
        if let Err(e) = &result {
            obs::emit_scenario_failed(&config.name, e);
        }
        let passed = failure.is_none();
        let exit_code = progress.exit.and_then(|e| e.code);
        obs::emit_scenario_finished(&config.name, duration_ms, passed, exit_code);

        ScenarioOutcome {
            run_id,
            scenario: config.name.clone(),
            config_digest,
            started_at,
            duration_ms,
            passed,
            failure,
            exit_code,
            signal: progress.exit.and_then(|e| e.signal),
            lines_seen: progress.lines_seen,
            metrics_observed: progress.metrics_observed,
            last_iteration: progress.last_iteration,
            last_loss: progress.last_loss,
        }
    }

    async fn execute(&self, config: &ScenarioConfig, progress: &mut Progress) -> HarnessResult<()> {
        config.validate().map_err(HarnessError::InvalidConfig)?;

        if let Some(generator) = &config.config_generator {
            self.generate_config(generator).await?;
        }

        let mut job = self.launcher.launch(&config.launch.to_command()).await?;

        if let Err(e) = self.stream(config, job.as_mut(), progress).await {
            // Fail fast: stop reading, kill the group, then reap the leader
            // so the exit status is still reported.
            job.teardown();
            progress.exit = job.wait().await.ok();
            return Err(e);
        }

        let exit = job.wait().await?;
        progress.exit = Some(exit);
        if !exit.is(config.expected_exit_code) {
            return Err(HarnessError::AbnormalExit {
                code: exit.code,
                signal: exit.signal,
                expected: config.expected_exit_code,
            });
        }
        Ok(())
    }

    /// Read, echo, parse and evaluate every line until the job's output closes.
    async fn stream(
        &self,
        config: &ScenarioConfig,
        job: &mut dyn Job,
        progress: &mut Progress,
    ) -> HarnessResult<()> {
        let policy = config.policy();
        let mut echo = Echo::open(config.echo_mode(), config.transcript.as_deref()).await;
        let result = pump(&policy, job, &mut echo, progress).await;
        echo.finish().await;
        result
    }

    /// Run the config generator to completion; any failure stops the scenario
    /// before the job is launched.
    async fn generate_config(&self, generator: &CommandSpec) -> HarnessResult<()> {
        let command = generator.display();
        let failed = |reason: String| HarnessError::ConfigGeneration {
            command: command.clone(),
            reason,
        };

        let mut job = self
            .launcher
            .launch(generator)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let mut lines = job.lines();
        while let Some(line) = lines.next().await {
            let line = line.map_err(|e| failed(e.to_string()))?;
            tracing::debug!(target: GENERATOR_OUTPUT_TARGET, "{line}");
        }
        drop(lines);

        let exit = job.wait().await.map_err(|e| failed(e.to_string()))?;
        if !exit.is(0) {
            return Err(failed(format!("generator ended with {exit}")));
        }
        obs::emit_config_generated(&command);
        Ok(())
    }
}

async fn pump(
    policy: &ThresholdPolicy,
    job: &mut dyn Job,
    echo: &mut Echo,
    progress: &mut Progress,
) -> HarnessResult<()> {
    let mut cursor = MetricCursor::new(policy);
    let mut lines = job.lines();

    while let Some(line) = lines.next().await {
        let line = line?;
        progress.lines_seen += 1;
        echo.line(&line).await;

        let fields = match parse_line(&line) {
            Ok(fields) => fields,
            // Without rules only the exit status counts.
            Err(e) if policy.is_empty() => {
                tracing::debug!(error = %e, "metric line ignored");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let Some((iteration, loss)) = cursor.observe(&line, fields)? else {
            continue;
        };
        progress.metrics_observed += 1;
        progress.last_iteration = Some(iteration);
        progress.last_loss = Some(loss);
        obs::emit_metric_observed(iteration, loss);

        if let Err(violation) = policy.evaluate(iteration, loss) {
            obs::emit_threshold_violated(&violation);
            return Err(violation.into());
        }
    }
    cursor.finish()?;
    Ok(())
}
