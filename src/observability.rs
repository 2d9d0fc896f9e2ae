// Logging bootstrap. Call once from the composition root.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with the default filter.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false)
}

/// Initialize logging; `verbose` raises titan_aas spans to debug.
/// RUST_LOG overrides either default when set.
pub fn init_logging_with_level(verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        EnvFilter::new("titan_aas=debug,info")
    } else {
        EnvFilter::new("titan_aas=info,warn")
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(default_filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            info!("titan-aas observability initialized");
            Ok(())
        }
        // A second init (tests, embedding routers) is not an error.
        Err(_) => Ok(()),
    }
}
