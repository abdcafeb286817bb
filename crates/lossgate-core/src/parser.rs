//! Metric extraction from raw training-log lines.
//!
//! Recognised grammar (both fields may share one physical line):
//!
//! ```text
//! iteration-field := "iteration: " DIGITS " / "
//! loss-field      := "lm_loss: " DIGITS ( "." DIGITS )? END
//! END             := whitespace | "|" | "," | end of line
//! ```
//!
//! The tokens `iteration:` and `lm_loss:` make a line claim the field. A
//! claimed field that does not match its grammar is a [`ParseError`]; the
//! line is never silently skipped, so drift in the job's log format fails
//! loudly.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Token that claims an iteration field.
pub const ITERATION_TOKEN: &str = "iteration:";

/// Token that claims a loss field.
pub const LOSS_TOKEN: &str = "lm_loss:";

fn iteration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"iteration: ([0-9]+) / ").expect("static regex"))
}

fn loss_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"lm_loss: ([0-9]+(?:\.[0-9]+)?)(?:[\s|,]|$)").expect("static regex")
    })
}

/// Fields recovered from one output line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LineFields {
    pub iteration: Option<u64>,
    pub loss: Option<f64>,
}

impl LineFields {
    /// `true` when the line carried neither field.
    pub fn is_empty(&self) -> bool {
        self.iteration.is_none() && self.loss.is_none()
    }
}

/// Parse every recognised field out of `line`.
pub fn parse_line(line: &str) -> Result<LineFields, ParseError> {
    Ok(LineFields {
        iteration: extract_iteration(line)?,
        loss: extract_loss(line)?,
    })
}

/// Extract the iteration index, if the line reports one.
pub fn extract_iteration(line: &str) -> Result<Option<u64>, ParseError> {
    if !line.contains(ITERATION_TOKEN) {
        return Ok(None);
    }
    let malformed = || ParseError::MalformedIteration {
        line: line.to_string(),
    };
    let caps = iteration_re().captures(line).ok_or_else(malformed)?;
    caps[1].parse::<u64>().map(Some).map_err(|_| malformed())
}

/// Extract the loss value, if the line reports one.
pub fn extract_loss(line: &str) -> Result<Option<f64>, ParseError> {
    if !line.contains(LOSS_TOKEN) {
        return Ok(None);
    }
    let malformed = || ParseError::MalformedLoss {
        line: line.to_string(),
    };
    let caps = loss_re().captures(line).ok_or_else(malformed)?;
    let value = caps[1].parse::<f64>().map_err(|_| malformed())?;
    if !value.is_finite() {
        return Err(malformed());
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEGATRON_LINE: &str = "[default0]: iteration: 100 / 1000 | consumed_tokens: 409600 \
        | elapsed_time_per_iteration_ms: 812 | lm_loss: 3.28 | lr: 0.0003";

    #[test]
    fn test_unrelated_line_is_empty() {
        let fields = parse_line("loading checkpoint shards").unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn test_iteration_only() {
        let fields = parse_line("iteration: 100 / 1000").unwrap();
        assert_eq!(fields.iteration, Some(100));
        assert_eq!(fields.loss, None);
    }

    #[test]
    fn test_loss_only() {
        let fields = parse_line("lm_loss: 3.28").unwrap();
        assert_eq!(fields.iteration, None);
        assert_eq!(fields.loss, Some(3.28));
    }

    #[test]
    fn test_integer_loss() {
        assert_eq!(extract_loss("| lm_loss: 3 |").unwrap(), Some(3.0));
    }

    #[test]
    fn test_both_fields_on_one_line() {
        let fields = parse_line(MEGATRON_LINE).unwrap();
        assert_eq!(fields.iteration, Some(100));
        assert_eq!(fields.loss, Some(3.28));
    }

    #[test]
    fn test_loss_reparses_formatted_value() {
        for value in [0.0, 1.0, 2.75, 3.28, 3.3999999, 12.5, 0.000125, 1234.5678] {
            let line = format!("lm_loss: {value}");
            assert_eq!(extract_loss(&line).unwrap(), Some(value), "line {line}");
        }
    }

    #[test]
    fn test_malformed_loss_names_line() {
        let err = extract_loss("step done | lm_loss: abc").unwrap_err();
        assert_eq!(
            err,
            ParseError::MalformedLoss {
                line: "step done | lm_loss: abc".to_string()
            }
        );
    }

    #[test]
    fn test_loss_with_trailing_garbage_is_malformed() {
        for line in [
            "lm_loss: 1.2e+01",
            "| lm_loss: 1.23K | lr: 3e-4",
            "lm_loss: 3.2.9",
        ] {
            let err = extract_loss(line).unwrap_err();
            assert_eq!(err.line(), line);
        }
    }

    #[test]
    fn test_loss_terminators() {
        assert_eq!(extract_loss("lm_loss: 2.5,").unwrap(), Some(2.5));
        assert_eq!(extract_loss("lm_loss: 2.5\tlr: 1").unwrap(), Some(2.5));
        assert_eq!(extract_loss("lm_loss: 2.5|").unwrap(), Some(2.5));
    }

    #[test]
    fn test_loss_without_space_is_malformed() {
        assert!(extract_loss("lm_loss:3.2").is_err());
    }

    #[test]
    fn test_negative_loss_is_malformed() {
        assert!(extract_loss("lm_loss: -1.0").is_err());
    }

    #[test]
    fn test_malformed_iteration() {
        let err = extract_iteration("iteration: ten / 1000").unwrap_err();
        assert!(matches!(err, ParseError::MalformedIteration { .. }));
    }

    #[test]
    fn test_iteration_requires_total_separator() {
        assert!(extract_iteration("iteration: 10").is_err());
    }

    #[test]
    fn test_iteration_overflow_is_malformed() {
        let line = "iteration: 99999999999999999999999 / 1";
        assert!(extract_iteration(line).is_err());
    }

    #[test]
    fn test_non_ascii_digits_rejected() {
        assert!(extract_loss("lm_loss: ٣.٢").is_err());
    }
}
