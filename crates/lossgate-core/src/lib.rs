//! Lossgate Core - training regression harness
//!
//! Launches a distributed training job in its own process group, streams
//! its merged output, and fails the run as soon as a reported `lm_loss`
//! breaks a threshold rule or the job exits abnormally:
//! - Config generation before launch
//! - Fail-fast threshold evaluation with whole-group teardown
//! - Structured outcomes for single scenarios and suites

pub mod command;
pub mod config;
pub mod echo;
pub mod error;
pub mod fakes;
pub mod obs;
pub mod parser;
pub mod platform;
pub mod policy;
pub mod report;
pub mod scenario;
pub mod supervisor;
pub mod telemetry;

// Re-export key types
pub use command::{default_training_env, CommandSpec, LaunchSpec, TrainingLaunch};
pub use config::{HarnessDefaults, ScenarioConfig, SuiteConfig};
pub use echo::EchoMode;
pub use error::{FailureKind, HarnessError, HarnessResult, ParseError};
pub use parser::{extract_iteration, extract_loss, parse_line, LineFields};
pub use platform::GroupGuard;
pub use policy::{IterationPredicate, ThresholdPolicy, ThresholdRule, ThresholdViolation};
pub use report::{FailureReport, ScenarioOutcome, SuiteOutcome};
pub use scenario::{MetricCursor, ScenarioRunner};
pub use supervisor::{Job, JobExit, JobLauncher, JobState, ProcessSupervisor, SupervisedJob};
pub use telemetry::init_tracing;
