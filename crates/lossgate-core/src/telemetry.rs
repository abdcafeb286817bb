//! Global tracing subscriber for the `lossgate` binary.
//!
//! Logs go to stderr. stdout is reserved for echoed job output and the
//! final verdict, so the two never interleave.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Target used for job output echoed in `log` mode.
pub const JOB_OUTPUT_TARGET: &str = "lossgate::job";

/// Target used for config generator output.
pub const GENERATOR_OUTPUT_TARGET: &str = "lossgate::config_generator";

/// Filter directives used when `RUST_LOG` is unset.
///
/// Echoed job lines stay visible at any verbosity; generator chatter only
/// shows up at debug.
pub fn default_directives(level: Level) -> String {
    format!("{level},{JOB_OUTPUT_TARGET}=info").to_lowercase()
}

/// Install the global subscriber. Only the first call has any effect.
///
/// `RUST_LOG` overrides `level` entirely; `json` switches to one JSON
/// object per line.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
    };
    // A subscriber is already set (tests, embedding callers): keep it.
    let _ = installed;
}
