//! Tracing setup for binaries and integration tests embedding the crate.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a fmt subscriber filtered by `RUST_LOG`, or `default_directives`
/// when it is unset.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_directives: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        init_tracing("assistant_storage=debug");
        assert!(!init_tracing("assistant_storage=debug"));
    }
}
