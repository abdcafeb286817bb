//! Command lines for the job under test and its config generator.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment overrides every training launch carries.
///
/// Flash attention is swapped for the reference implementation, the network
/// provider is pinned to EFA, and device connections are capped at one.
pub fn default_training_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("DISABLE_FLASH_ATTENTION".to_string(), "1".to_string()),
        ("FI_PROVIDER".to_string(), "efa".to_string()),
        ("CUDA_DEVICE_MAX_CONNECTIONS".to_string(), "1".to_string()),
    ])
}

/// A shell command plus the environment it runs with.
///
/// Immutable once a scenario is built. Runs in the harness's current
/// directory unless `working_dir` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Shell command string (run with `sh -c`).
    pub command: String,

    /// Environment variable overrides.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Add one environment override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// `KEY=value ... command`, the way it would be typed in a shell.
    pub fn display(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.env {
            out.push_str(key);
            out.push('=');
            out.push_str(&shell_quote(value));
            out.push(' ');
        }
        out.push_str(&self.command);
        out
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("command must not be empty".to_string());
        }
        if let Some(key) = self
            .env
            .keys()
            .find(|k| k.is_empty() || k.contains('=') || k.contains('\0'))
        {
            return Err(format!("invalid environment variable name {key:?}"));
        }
        Ok(())
    }
}

/// Distributed training launch: `torchrun` over the training script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingLaunch {
    /// Launcher executable.
    #[serde(default = "default_launcher")]
    pub launcher: String,

    /// Worker processes per node.
    #[serde(default = "default_nproc_per_node")]
    pub nproc_per_node: u32,

    /// Rendezvous endpoint (`host:port`).
    #[serde(default = "default_rdzv_endpoint")]
    pub rdzv_endpoint: String,

    /// Training entry point.
    #[serde(default = "default_train_script")]
    pub train_script: String,

    /// Config file passed with `--config-file`.
    pub config_file: PathBuf,

    #[serde(default = "default_training_env")]
    pub env: BTreeMap<String, String>,
}

fn default_launcher() -> String {
    "torchrun".to_string()
}

fn default_nproc_per_node() -> u32 {
    8
}

fn default_rdzv_endpoint() -> String {
    "localhost:29800".to_string()
}

fn default_train_script() -> String {
    "run_train.py".to_string()
}

impl TrainingLaunch {
    pub fn new(config_file: impl Into<PathBuf>) -> Self {
        Self {
            launcher: default_launcher(),
            nproc_per_node: default_nproc_per_node(),
            rdzv_endpoint: default_rdzv_endpoint(),
            train_script: default_train_script(),
            config_file: config_file.into(),
            env: default_training_env(),
        }
    }

    pub fn with_nproc_per_node(mut self, nproc: u32) -> Self {
        self.nproc_per_node = nproc;
        self
    }

    pub fn with_rdzv_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.rdzv_endpoint = endpoint.into();
        self
    }

    /// Render the launch as a shell command.
    pub fn to_command(&self) -> CommandSpec {
        let command = format!(
            "{} --nproc_per_node={} --rdzv_endpoint={} {} --config-file {}",
            self.launcher,
            self.nproc_per_node,
            shell_quote(&self.rdzv_endpoint),
            shell_quote(&self.train_script),
            shell_quote(&self.config_file.to_string_lossy()),
        );
        CommandSpec {
            command,
            env: self.env.clone(),
            working_dir: None,
        }
    }
}

/// What a scenario launches: a training job or an arbitrary command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchSpec {
    Training(TrainingLaunch),
    Command(CommandSpec),
}

impl LaunchSpec {
    pub fn to_command(&self) -> CommandSpec {
        match self {
            LaunchSpec::Training(launch) => launch.to_command(),
            LaunchSpec::Command(spec) => spec.clone(),
        }
    }
}

/// `python <script>`, the config generator invocation.
pub fn python_script(script: impl AsRef<str>) -> CommandSpec {
    CommandSpec::new(format!("python {}", shell_quote(script.as_ref())))
}

/// Single-quote `s` for `sh` unless it is made only of safe characters.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
