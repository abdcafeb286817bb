//! Structured observability hooks for scenario lifecycle events.
//!
//! Every event carries an `event` field (`scenario.started`,
//! `job.launched`, ...) so log pipelines can filter on it. Verbosity is
//! controlled through `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::{debug, error, info, warn};

use crate::policy::ThresholdViolation;
use crate::supervisor::JobState;

/// Span that tags everything logged during one scenario run.
///
/// Attach with `tracing::Instrument::instrument` so it survives `.await`.
pub fn scenario_span(scenario: &str, run_id: &str) -> tracing::Span {
    tracing::info_span!("lossgate.scenario", scenario = %scenario, run_id = %run_id)
}

/// Emit event: scenario started.
pub fn emit_scenario_started(scenario: &str, run_id: &str, config_digest: &str) {
    info!(
        event = "scenario.started",
        scenario = %scenario,
        run_id = %run_id,
        config_digest = %config_digest,
    );
}

/// Emit event: config generator finished successfully.
pub fn emit_config_generated(command: &str) {
    info!(event = "config.generated", command = %command);
}

/// Emit event: job spawned in its own process group.
pub fn emit_job_launched(command: &str, pgid: u32) {
    info!(event = "job.launched", command = %command, pgid = pgid);
}

/// Emit event: a loss value was bound to an iteration.
pub fn emit_metric_observed(iteration: u64, loss: f64) {
    debug!(event = "metric.observed", iteration = iteration, loss = loss);
}

pub fn emit_threshold_violated(violation: &ThresholdViolation) {
    error!(
        event = "threshold.violated",
        rule = violation.rule.name(),
        iteration = violation.iteration,
        loss = violation.loss,
        bound = violation.rule.bound(),
    );
}

/// Emit event: job process group killed (warning level).
pub fn emit_job_torn_down(pgid: u32, state: &JobState) {
    warn!(event = "job.torn_down", pgid = pgid, state = ?state);
}

/// Emit event: scenario finished with its verdict.
pub fn emit_scenario_finished(
    scenario: &str,
    duration_ms: u64,
    passed: bool,
    exit_code: Option<i32>,
) {
    info!(
        event = "scenario.finished",
        scenario = %scenario,
        duration_ms = duration_ms,
        passed = passed,
        exit_code = ?exit_code,
    );
}

/// Emit event: scenario failed (error level).
pub fn emit_scenario_failed(scenario: &str, error: &dyn std::fmt::Display) {
    error!(event = "scenario.failed", scenario = %scenario, error = %error);
}
