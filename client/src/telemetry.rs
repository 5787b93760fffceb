//! Logging setup for host applications.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "fieldsync_client=debug";

/// Install a `tracing` subscriber filtered by `RUST_LOG`.
///
/// Does nothing if the host already installed a global subscriber.
pub fn init() {
    init_with_default(DEFAULT_FILTER);
}

/// Like [`init`] with a custom fallback filter.
pub fn init_with_default(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
