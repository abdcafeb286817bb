//! Scenario and suite configuration.
//!
//! Scenarios are built in code (see [`ScenarioConfig::train_llama`]) or
//! loaded from a TOML suite file:
//!
//! ```toml
//! [harness]
//! deadline_secs = 7200
//! transcript_dir = "artifacts/transcripts"
//!
//! [[scenarios]]
//! name = "train_llama"
//! config_generator = { command = "python examples/config_train_llama.py" }
//! launch = { kind = "training", config_file = "examples/config_train_llama.yaml" }
//! rules = [
//!     { type = "tail", iteration = 100, below = 3.4 },
//!     { type = "end", iteration = 200, below = 2.8 },
//! ]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::command::{python_script, CommandSpec, LaunchSpec, TrainingLaunch};
use crate::echo::EchoMode;
use crate::error::{HarnessError, HarnessResult};
use crate::policy::{ThresholdPolicy, ThresholdRule};

/// One end-to-end check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// The job under test.
    pub launch: LaunchSpec,

    /// Runs to completion before the launch; must exit 0.
    #[serde(default)]
    pub config_generator: Option<CommandSpec>,

    /// Loss thresholds. Empty for a smoke check.
    #[serde(default)]
    pub rules: Vec<ThresholdRule>,

    #[serde(default)]
    pub expected_exit_code: i32,

    /// Wall-clock limit for the whole scenario. `None` waits forever.
    #[serde(default)]
    pub deadline_secs: Option<u64>,

    #[serde(default)]
    pub echo: Option<EchoMode>,

    /// Append every output line to this file.
    #[serde(default)]
    pub transcript: Option<PathBuf>,
}

impl ScenarioConfig {
    pub fn new(name: impl Into<String>, launch: LaunchSpec) -> Self {
        Self {
            name: name.into(),
            description: None,
            launch,
            config_generator: None,
            rules: Vec::new(),
            expected_exit_code: 0,
            deadline_secs: None,
            echo: None,
            transcript: None,
        }
    }

    /// Full-scale llama run with tail and end loss thresholds.
    pub fn train_llama() -> Self {
        Self {
            description: Some(
                "llama convergence: lm_loss < 3.4 from iteration 100, < 2.8 at iteration 200"
                    .to_string(),
            ),
            config_generator: Some(python_script("examples/config_train_llama.py")),
            rules: ThresholdPolicy::llama_regression().rules,
            ..Self::new(
                "train_llama",
                LaunchSpec::Training(TrainingLaunch::new("examples/config_train_llama.yaml")),
            )
        }
    }

    /// Tiny llama smoke run: only the exit status is checked.
    pub fn tiny_llama() -> Self {
        Self {
            description: Some("tiny llama smoke run: must exit successfully".to_string()),
            config_generator: Some(python_script("examples/config_tiny_llama.py")),
            ..Self::new(
                "tiny_llama",
                LaunchSpec::Training(TrainingLaunch::new("examples/config_tiny_llama.yaml")),
            )
        }
    }

    /// All built-in scenarios.
    pub fn presets() -> Vec<Self> {
        vec![Self::train_llama(), Self::tiny_llama()]
    }

    /// Look up a built-in scenario by name.
    pub fn preset(name: &str) -> Option<Self> {
        Self::presets().into_iter().find(|s| s.name == name)
    }

    pub fn with_rule(mut self, rule: ThresholdRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_config_generator(mut self, generator: CommandSpec) -> Self {
        self.config_generator = Some(generator);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_secs = Some(deadline.as_secs().max(1));
        self
    }

    pub fn with_echo(mut self, echo: EchoMode) -> Self {
        self.echo = Some(echo);
        self
    }

    pub fn with_transcript(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcript = Some(path.into());
        self
    }

    pub fn policy(&self) -> ThresholdPolicy {
        ThresholdPolicy {
            rules: self.rules.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    pub fn echo_mode(&self) -> EchoMode {
        self.echo.unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("scenario name must not be empty".to_string());
        }
        self.launch
            .to_command()
            .validate()
            .map_err(|e| format!("scenario {}: launch {e}", self.name))?;
        if let Some(generator) = &self.config_generator {
            generator
                .validate()
                .map_err(|e| format!("scenario {}: config generator {e}", self.name))?;
        }
        self.policy()
            .validate()
            .map_err(|e| format!("scenario {}: {e}", self.name))?;
        if self.deadline_secs == Some(0) {
            return Err(format!("scenario {}: deadline must be positive", self.name));
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON form; identifies the configuration a
    /// run was made with.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

/// Suite-wide defaults applied to scenarios that leave them unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarnessDefaults {
    #[serde(default)]
    pub echo: Option<EchoMode>,

    #[serde(default)]
    pub deadline_secs: Option<u64>,

    /// Each scenario writes `<transcript_dir>/<name>.log`.
    #[serde(default)]
    pub transcript_dir: Option<PathBuf>,
}

/// A set of scenarios run one after another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteConfig {
    #[serde(default)]
    pub harness: HarnessDefaults,

    #[serde(default)]
    pub scenarios: Vec<ScenarioConfig>,
}

impl SuiteConfig {
    /// The built-in scenarios as a suite.
    pub fn presets() -> Self {
        Self {
            harness: HarnessDefaults::default(),
            scenarios: ScenarioConfig::presets(),
        }
    }

    pub fn from_toml(text: &str) -> HarnessResult<Self> {
        let suite: Self =
            toml::from_str(text).map_err(|e| HarnessError::InvalidConfig(e.to_string()))?;
        suite.validate().map_err(HarnessError::InvalidConfig)?;
        Ok(suite)
    }

    pub fn load(path: &Path) -> HarnessResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.scenarios.is_empty() {
            return Err("suite defines no scenarios".to_string());
        }
        if self.harness.deadline_secs == Some(0) {
            return Err("harness deadline must be positive".to_string());
        }
        let mut seen = HashSet::new();
        for scenario in &self.scenarios {
            if !seen.insert(scenario.name.as_str()) {
                return Err(format!("duplicate scenario name {:?}", scenario.name));
            }
            scenario.validate()?;
        }
        Ok(())
    }

    /// Scenarios with the suite defaults filled in.
    pub fn resolved(&self) -> Vec<ScenarioConfig> {
        self.scenarios
            .iter()
            .cloned()
            .map(|mut scenario| {
                if scenario.echo.is_none() {
                    scenario.echo = self.harness.echo;
                }
                if scenario.deadline_secs.is_none() {
                    scenario.deadline_secs = self.harness.deadline_secs;
                }
                if scenario.transcript.is_none() {
                    if let Some(dir) = &self.harness.transcript_dir {
                        scenario.transcript = Some(dir.join(format!("{}.log", scenario.name)));
                    }
                }
                scenario
            })
            .collect()
    }

    /// Keep only the named scenario.
    pub fn select(mut self, name: &str) -> HarnessResult<Self> {
        self.scenarios.retain(|s| s.name == name);
        if self.scenarios.is_empty() {
            return Err(HarnessError::InvalidConfig(format!(
                "no scenario named {name:?}"
            )));
        }
        Ok(self)
    }
}
