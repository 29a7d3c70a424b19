//! Ready-made subscriber for binaries built on top of this crate.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Installs a global subscriber which prints log lines above the progress
/// bars of running tasks. The level is read from `RUST_LOG` and defaults to
/// `info`.
pub fn try_init() -> Result<(), TryInitError> {
    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()
}

/// Same as [`try_init`], but leaves an already installed subscriber alone.
pub fn init() {
    let _ = try_init();
}
