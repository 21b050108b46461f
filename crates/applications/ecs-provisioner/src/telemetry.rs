//! Tracing setup

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_DIRECTIVE: &str = "ecs_provisioner=info,info";

/// Install the global subscriber. Later calls are no-ops, so tests may call it freely.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_DIRECTIVE.into()))
        .with(fmt::layer())
        .try_init();
}
