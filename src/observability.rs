//! Structured logging setup.

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Installs the global subscriber. `RUST_LOG` wins when set; otherwise the
/// level is `debug` or `info` depending on the `hostdb.debug` setting.
/// Calling it again is a no-op.
pub fn init_logging(debug: bool) {
    INIT.call_once(|| {
        let fallback = if debug { "debug" } else { "info" };
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
        // a test harness may already own the global subscriber
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init();
    });
}
