use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber: `RUST_LOG` controls the filter,
/// defaulting to `info`.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
