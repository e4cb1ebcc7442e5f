pub(crate) mod scope_guard;
pub(crate) mod thread;

pub(crate) use scope_guard::ScopeGuard;

use nix::time::{clock_gettime, ClockId};
use std::sync::OnceLock;

/// Milliseconds on the monotonic clock. All timer deadlines are expressed
/// on this axis, so wall-clock adjustments never move them.
pub(crate) fn current_ms() -> u64 {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).expect("clock_gettime(CLOCK_MONOTONIC)");
    ts.tv_sec() as u64 * 1000 + ts.tv_nsec() as u64 / 1_000_000
}

pub(crate) fn get_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}
