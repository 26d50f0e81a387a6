//! Shared test helpers: a couple of these integration tests bind real
//! listening sockets, so tests run in parallel need ports that won't
//! collide with each other or with an unrelated process on the host.

use std::sync::Once;

static LOGGING: Once = Once::new();

/// Turns on the `log` facade via `env_logger`'s test-friendly
/// `is_test(true)` builder, so a failing test prints useful loop/connection
/// traces without spamming successful runs.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = env_logger::Builder::from_default_env().is_test(true).try_init();
    });
}

/// Picks a pseudo-random port in the ephemeral range instead of a hardcoded
/// constant, so repeated local test runs don't collide on a TIME_WAIT
/// socket left behind by the previous run.
pub fn random_port() -> u16 {
    rand::random_range(20000..40000)
}
