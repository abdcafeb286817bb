//! Best-effort forwarding of job output.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::telemetry::JOB_OUTPUT_TARGET;

/// Where echoed job output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoMode {
    /// Raw lines on stdout, as the job printed them.
    #[default]
    Stdout,
    /// One `info` tracing event per line.
    Log,
    Silent,
}

/// Forwards lines to the echo target and an optional transcript file.
///
/// Write failures are logged once and never fail the scenario.
pub struct Echo {
    mode: EchoMode,
    stdout: tokio::io::Stdout,
    transcript: Option<(PathBuf, tokio::fs::File)>,
}

impl Echo {
    /// Open the echo sink, appending to `transcript` when given.
    pub async fn open(mode: EchoMode, transcript: Option<&Path>) -> Self {
        let transcript = match transcript {
            Some(path) => match open_transcript(path).await {
                Ok(file) => Some((path.to_path_buf(), file)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "transcript disabled");
                    None
                }
            },
            None => None,
        };
        Self {
            mode,
            stdout: tokio::io::stdout(),
            transcript,
        }
    }

    pub async fn line(&mut self, line: &str) {
        match self.mode {
            EchoMode::Stdout => {
                let written = async {
                    self.stdout.write_all(line.as_bytes()).await?;
                    self.stdout.write_all(b"\n").await?;
                    self.stdout.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::debug!(error = %e, "stdout echo failed");
                }
            }
            EchoMode::Log => tracing::info!(target: JOB_OUTPUT_TARGET, "{line}"),
            EchoMode::Silent => {}
        }

        if let Some((path, file)) = &mut self.transcript {
            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await
            }
            .await;
            if let Err(e) = written {
                tracing::warn!(path = %path.display(), error = %e, "transcript write failed; disabling");
                self.transcript = None;
            }
        }
    }

    /// Flush stdout and the transcript, if any.
    pub async fn finish(&mut self) {
        if self.mode == EchoMode::Stdout {
            let _ = self.stdout.flush().await;
        }
        if let Some((path, file)) = &mut self.transcript {
            if let Err(e) = file.flush().await {
                tracing::warn!(path = %path.display(), error = %e, "transcript flush failed");
            }
        }
    }
}

async fn open_transcript(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}
