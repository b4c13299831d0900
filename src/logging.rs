use std::env;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CONDENSE_LOG";

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "condense=debug" } else { "condense=info" }
}

fn resolve_filter(verbose: bool) -> EnvFilter {
    for var in [LOG_ENV, "RUST_LOG"] {
        if let Ok(raw) = env::var(var)
            && !raw.trim().is_empty()
            && let Ok(filter) = EnvFilter::try_new(raw.trim())
        {
            return filter;
        }
    }
    EnvFilter::new(default_directive(verbose))
}

/// Installs the stderr subscriber. Safe to call more than once; later calls
/// are ignored so tests and embedding callers can initialize freely.
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(resolve_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
