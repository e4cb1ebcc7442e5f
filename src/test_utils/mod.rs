use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Installs the test tracing subscriber once per binary; `WEFT_LOG` selects
/// the filter.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("WEFT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Spins until `cond` holds or `timeout_ms` elapsed; returns whether the
/// condition was met.
#[must_use]
pub(crate) fn wait_until(timeout_ms: u64, cond: impl Fn() -> bool) -> bool {
    let deadline = crate::utils::current_ms() + timeout_ms;
    while crate::utils::current_ms() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    cond()
}
