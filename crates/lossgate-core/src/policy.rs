//! Loss threshold rules keyed by iteration number.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Which iterations a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationPredicate {
    /// `iteration >= K`
    AtLeast(u64),
    /// `iteration == K`
    Exactly(u64),
}

impl IterationPredicate {
    pub fn matches(&self, iteration: u64) -> bool {
        match *self {
            IterationPredicate::AtLeast(k) => iteration >= k,
            IterationPredicate::Exactly(k) => iteration == k,
        }
    }
}

impl fmt::Display for IterationPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterationPredicate::AtLeast(k) => write!(f, "iteration >= {k}"),
            IterationPredicate::Exactly(k) => write!(f, "iteration == {k}"),
        }
    }
}

/// A single loss bound. The observed loss must be strictly below `below`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThresholdRule {
    /// Every iteration from `iteration` onwards.
    Tail { iteration: u64, below: f64 },
    /// Exactly one iteration, typically the last one checked.
    End { iteration: u64, below: f64 },
}

impl ThresholdRule {
    pub fn predicate(&self) -> IterationPredicate {
        match *self {
            ThresholdRule::Tail { iteration, .. } => IterationPredicate::AtLeast(iteration),
            ThresholdRule::End { iteration, .. } => IterationPredicate::Exactly(iteration),
        }
    }

    pub fn bound(&self) -> f64 {
        match *self {
            ThresholdRule::Tail { below, .. } | ThresholdRule::End { below, .. } => below,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ThresholdRule::Tail { .. } => "tail",
            ThresholdRule::End { .. } => "end",
        }
    }

    /// Check one observation. Observations outside the predicate always pass.
    pub fn check(&self, iteration: u64, loss: f64) -> Result<(), ThresholdViolation> {
        // NaN compares as `None` and therefore never passes.
        let below = loss.partial_cmp(&self.bound()) == Some(Ordering::Less);
        if self.predicate().matches(iteration) && !below {
            return Err(ThresholdViolation {
                rule: *self,
                iteration,
                loss,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} check: {} => lm_loss < {}",
            self.name(),
            self.predicate(),
            self.bound()
        )
    }
}

/// An observation that failed a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("lm_loss {loss} at iteration {iteration} is not below {} ({rule})", .rule.bound())]
pub struct ThresholdViolation {
    pub rule: ThresholdRule,
    pub iteration: u64,
    pub loss: f64,
}

/// Ordered set of threshold rules.
///
/// Every rule is checked against every observation; the first failing rule
/// (in declaration order) is reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    pub rules: Vec<ThresholdRule>,
}

impl ThresholdPolicy {
    /// No rules: only the exit status decides the scenario.
    pub fn none() -> Self {
        Self::default()
    }

    /// Append a rule and return `self` (builder pattern).
    pub fn with_rule(mut self, rule: ThresholdRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Convergence expectations for the full-scale llama run.
    ///
    /// Reference measurements: 3.28 at 100 steps, 2.83 at 160, 2.75 at 200.
    pub fn llama_regression() -> Self {
        Self::none()
            .with_rule(ThresholdRule::Tail {
                iteration: 100,
                below: 3.4,
            })
            .with_rule(ThresholdRule::End {
                iteration: 200,
                below: 2.8,
            })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any rule cares about this iteration.
    pub fn targets(&self, iteration: u64) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.predicate().matches(iteration))
    }

    pub fn evaluate(&self, iteration: u64, loss: f64) -> Result<(), ThresholdViolation> {
        self.rules
            .iter()
            .try_for_each(|rule| rule.check(iteration, loss))
    }

    /// Reject bounds that could never be meaningfully compared.
    pub fn validate(&self) -> Result<(), String> {
        for rule in &self.rules {
            if !rule.bound().is_finite() {
                return Err(format!("{} rule has a non-finite bound", rule.name()));
            }
        }
        Ok(())
    }
}
