use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber on stderr. The filter comes from
/// `RUST_LOG`, falling back to `info`. Safe to call more than once; later
/// calls leave the first subscriber in place.
pub fn init_logging() {
    init_logging_with("info");
}

/// Like [`init_logging`] with an explicit fallback filter.
pub fn init_logging_with(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
