use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber. Honours `RUST_LOG`, defaulting to `info` for the stockdw crates.
///
/// Later calls are no-ops once a global subscriber is set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("stockdw_core=info,stockdw_warehouse=info,stockdw_stream=info")
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
