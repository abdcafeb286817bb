//! Scenario and suite outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FailureKind, HarnessError};

/// Why a scenario failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&HarnessError> for FailureReport {
    fn from(err: &HarnessError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub run_id: Uuid,

    pub scenario: String,

    /// Digest of the scenario configuration.
    pub config_digest: String,

    pub started_at: DateTime<Utc>,

    pub duration_ms: u64,

    pub passed: bool,

    /// Present exactly when `passed` is false.
    pub failure: Option<FailureReport>,

    /// Job exit code, when the job was reaped and exited normally.
    pub exit_code: Option<i32>,

    /// Terminating signal, when the job was killed.
    pub signal: Option<i32>,

    /// Output lines read from the job.
    pub lines_seen: u64,

    /// (iteration, loss) observations evaluated against the rules.
    pub metrics_observed: u64,

    pub last_iteration: Option<u64>,

    pub last_loss: Option<f64>,
}

impl ScenarioOutcome {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// Assertion-style check: error out unless the scenario passed.
    pub fn ensure_passed(&self) -> anyhow::Result<()> {
        match &self.failure {
            None if self.passed => Ok(()),
            Some(failure) => anyhow::bail!(
                "scenario {} failed ({:?}): {}",
                self.scenario,
                failure.kind,
                failure.message
            ),
            None => anyhow::bail!("scenario {} failed", self.scenario),
        }
    }

    /// One-line verdict for standalone runs.
    pub fn status_line(&self) -> String {
        if self.passed {
            return "Command executed successfully.".to_string();
        }
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("Command failed with exit code: {code}"),
            (None, Some(signal)) => format!("Command failed: job killed by signal {signal}"),
            (None, None) => "Command failed with exit code: none".to_string(),
        }
    }
}

/// Results of a suite, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteOutcome {
    pub scenarios: Vec<ScenarioOutcome>,
}

impl SuiteOutcome {
    pub fn passed_count(&self) -> usize {
        self.scenarios.iter().filter(|s| s.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.scenarios.iter().filter(|s| !s.passed).count()
    }

    /// `true` when every scenario passed (and there was at least one).
    pub fn success(&self) -> bool {
        !self.scenarios.is_empty() && self.failed_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(passed: bool, exit_code: Option<i32>) -> ScenarioOutcome {
        ScenarioOutcome {
            run_id: Uuid::new_v4(),
            scenario: "train_llama".to_string(),
            config_digest: "abc123".to_string(),
            started_at: Utc::now(),
            duration_ms: 100,
            passed,
            failure: (!passed).then(|| FailureReport {
                kind: FailureKind::AbnormalExit,
                message: "job exited with code Some(1)".to_string(),
            }),
            exit_code,
            signal: None,
            lines_seen: 2,
            metrics_observed: 1,
            last_iteration: Some(100),
            last_loss: Some(3.28),
        }
    }

    #[test]
    fn test_status_lines() {
        assert_eq!(
            outcome(true, Some(0)).status_line(),
            "Command executed successfully."
        );
        assert_eq!(
            outcome(false, Some(1)).status_line(),
            "Command failed with exit code: 1"
        );
        let mut killed = outcome(false, None);
        killed.signal = Some(9);
        assert!(killed.status_line().contains("signal 9"));
    }

    #[test]
    fn test_ensure_passed() {
        assert!(outcome(true, Some(0)).ensure_passed().is_ok());
        let err = outcome(false, Some(1)).ensure_passed().unwrap_err();
        assert!(err.to_string().contains("AbnormalExit"));
    }

    #[test]
    fn test_suite_counts() {
        let suite = SuiteOutcome {
            scenarios: vec![outcome(true, Some(0)), outcome(false, Some(1))],
        };
        assert_eq!(suite.passed_count(), 1);
        assert_eq!(suite.failed_count(), 1);
        assert!(!suite.success());
        assert!(!SuiteOutcome::default().success());
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(outcome(false, Some(1))).unwrap();
        assert_eq!(json["passed"], false);
        assert_eq!(json["failure"]["kind"], "abnormal_exit");
        assert_eq!(json["exit_code"], 1);
    }
}
