//! Cooperative stackful-fiber runtime over Linux epoll.
//!
//! Application code written in a plain synchronous style runs inside
//! [`Fiber`]s multiplexed across a worker pool; the interposed libc surface
//! suspends a fiber at every would-block boundary and the [`IoManager`]
//! resumes it on readiness or timeout.

pub mod config;

pub mod fd;

pub mod fiber;
pub use fiber::Fiber;

pub mod hook;
pub use hook::{hook_enabled, set_hook_enabled};

pub mod io;
pub use io::{Event, IoManager};

pub mod scheduler;
pub use scheduler::{Scheduler, TaskTarget};

pub mod timer;
pub use timer::{Timer, TimerManager};

pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
