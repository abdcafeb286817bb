//! Observability tests for scenario lifecycle tracing.
//!
//! These tests verify that structured tracing events are emitted for the key
//! lifecycle points: scenario start, job launch, metric, violation, teardown,
//! and the final verdict.

use std::sync::Arc;

use lossgate_core::fakes::{ScriptedJob, ScriptedLauncher};
use lossgate_core::obs::{
    emit_config_generated, emit_job_launched, emit_job_torn_down, emit_metric_observed,
    emit_scenario_failed, emit_scenario_finished, emit_scenario_started, emit_threshold_violated,
    scenario_span,
};
use lossgate_core::{
    CommandSpec, EchoMode, JobState, LaunchSpec, ScenarioConfig, ScenarioRunner, ThresholdPolicy,
    ThresholdRule,
};
use tracing_test::traced_test;

/// Test: emit_scenario_started carries the run id and config digest
#[traced_test]
#[test]
fn test_emit_scenario_started() {
    emit_scenario_started("train_llama", "run-123", "deadbeef");
    assert!(logs_contain("scenario.started"));
    assert!(logs_contain("run-123"));
    assert!(logs_contain("deadbeef"));
}

#[traced_test]
#[test]
fn test_emit_config_generated() {
    emit_config_generated("python examples/config_train_llama.py");
    assert!(logs_contain("config.generated"));
}

/// Test: emit_job_launched records the process group
#[traced_test]
#[test]
fn test_emit_job_launched() {
    emit_job_launched("torchrun --nproc_per_node=8", 4242);
    assert!(logs_contain("job.launched"));
    assert!(logs_contain("4242"));
}

#[traced_test]
#[test]
fn test_emit_metric_observed() {
    emit_metric_observed(100, 3.28);
    assert!(logs_contain("metric.observed"));
}

/// Test: violations are logged with the rule and bound
#[traced_test]
#[test]
fn test_emit_threshold_violated() {
    let violation = ThresholdRule::End {
        iteration: 200,
        below: 2.8,
    }
    .check(200, 2.9)
    .unwrap_err();
    emit_threshold_violated(&violation);
    assert!(logs_contain("threshold.violated"));
    assert!(logs_contain("ERROR"));
}

/// Test: teardown is a warn-level event
#[traced_test]
#[test]
fn test_emit_job_torn_down() {
    emit_job_torn_down(4242, &JobState::Killed);
    assert!(logs_contain("job.torn_down"));
    assert!(logs_contain("WARN"));
}

#[traced_test]
#[test]
fn test_emit_scenario_verdicts() {
    emit_scenario_finished("tiny_llama", 1200, false, Some(1));
    emit_scenario_failed("tiny_llama", &"job exited with code Some(1)");
    assert!(logs_contain("scenario.finished"));
    assert!(logs_contain("scenario.failed"));
}

/// Test: scenario_span enters without panicking
#[traced_test]
#[test]
fn test_scenario_span() {
    let span = scenario_span("train_llama", "run-span-1");
    let _entered = span.enter();
    tracing::info!("inside scenario");
    assert!(logs_contain("inside scenario"));
}

/// Test: a failing run emits the whole lifecycle in order
#[traced_test]
#[tokio::test]
async fn test_run_emits_lifecycle_events() {
    let launcher = Arc::new(ScriptedLauncher::new().script(
        "train",
        ScriptedJob::new(["iteration: 200 / 1000", "lm_loss: 2.9"], 0),
    ));
    let runner = ScenarioRunner::new(launcher);
    let mut scenario = ScenarioConfig::new("traced", LaunchSpec::Command(CommandSpec::new("train")))
        .with_echo(EchoMode::Log);
    scenario.rules = ThresholdPolicy::llama_regression().rules;

    let outcome = runner.run(&scenario).await;

    assert!(!outcome.passed);
    assert!(logs_contain("scenario.started"));
    assert!(logs_contain("metric.observed"));
    assert!(logs_contain("threshold.violated"));
    assert!(logs_contain("scenario.failed"));
    assert!(logs_contain("scenario.finished"));
    // echoed job output goes through the log in `log` mode
    assert!(logs_contain("lm_loss: 2.9"));
}
