use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber, writing to stderr
///
/// `RUST_LOG` takes precedence; otherwise `verbose` selects debug over info.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("voice_activity={}", default_level)));

    // A subscriber may already be installed (e.g. by an embedding application)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
