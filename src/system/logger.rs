use tracing_subscriber::EnvFilter;

/// Checked in order; the first one set wins over the CLI verbosity.
const LOG_FILTER_VARS: [&str; 2] = ["BENCHMESH_LOG", "RUST_LOG"];

fn log_filter(verbose: bool, configured: Option<&str>) -> EnvFilter {
    let fallback = if verbose { "debug" } else { "info" };
    configured
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback))
}

/// Installs the global `tracing` subscriber. Later calls are ignored.
pub fn init_logging(verbose: bool, no_color: bool) {
    let configured = LOG_FILTER_VARS
        .iter()
        .find_map(|name| std::env::var(name).ok());
    let installed = tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, configured.as_deref()))
        .with_ansi(!no_color)
        .with_target(false)
        .try_init();
    if let Err(err) = installed {
        eprintln!("Logging already initialised: {}", err);
    }
}
