// THEORY:
// The library only emits `tracing` events; installing a subscriber is the
// embedding application's call. This helper is what the bundled runner uses:
// console output, filtered by `RUST_LOG` when it is set, otherwise by the
// given default level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a console subscriber. Returns `false` if one was already installed.
pub fn init_logging(default_level: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{default_level},vacancy_vision={default_level}"))
    });

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init()
        .is_ok()
}
