//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Filter comes from `PALAVER_LOG` (falling back to `RUST_LOG`, then to the
/// given default). Safe to call more than once; later calls are no-ops.
pub fn init(default_filter: &str) {
    let filter = std::env::var("PALAVER_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_filter.to_string());

    let result = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .try_init();
    // A second init (tests, embedding applications) is fine.
    drop(result);
}
