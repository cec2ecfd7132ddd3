//! `tracing` subscriber bootstrap.
//!
//! The library only emits events; binaries and tests call
//! [`init_tracing`] once to print them. `RUST_LOG` takes precedence over
//! the configured default directive.

use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber filtered by `RUST_LOG` or `default_filter`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        let _ = init_tracing("approxql=debug");
        assert!(!init_tracing("approxql=debug"));
    }
}
