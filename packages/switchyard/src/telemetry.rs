//! Logging bootstrap.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::RuntimeConfig;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.log_filter`. Returns `false` if a subscriber
/// was already installed (by an earlier call or by the host application).
pub fn init_tracing(config: &RuntimeConfig) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let config = RuntimeConfig::default();
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
