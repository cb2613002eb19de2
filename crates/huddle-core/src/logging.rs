use std::sync::Once;

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "huddle_core=debug";

/// Initialize tracing/logging. Call once from the host before joining a room.
///
/// Later calls are ignored, so hosts and tests may call it freely.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
        // Another subscriber may already be installed by the host.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .try_init();
    });
}
