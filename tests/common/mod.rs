use std::sync::Once;

/// Route test diagnostics through tracing. `RUST_LOG=stanchion=debug`
/// shows retry and breaker transitions while debugging a failure.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stanchion=warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}
