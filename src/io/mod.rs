//! Epoll reactor layered on the scheduler.
//!
//! The [`IoManager`] extends a [`Scheduler`] with an epoll instance, a
//! self-pipe for waking parked workers, a timer manager bounding the epoll
//! wait, and a descriptor-indexed table of per-fd event contexts. Its idle
//! loop is what worker fibers fall into when the queue is empty: it parks in
//! `epoll_wait` until the next timer deadline or a readiness event, feeds
//! the results back through the scheduler, and yields.
//!
//! Registration is edge-triggered and one-shot: a fired direction is
//! stripped from the interest mask and must be re-registered for the next
//! notification.

mod fd_context;

#[cfg(test)]
mod tests;

use crate::fiber::{Fiber, FiberFn, State};
use crate::scheduler::{Scheduler, TaskTarget};
use crate::timer::{Timer, TimerManager};
use anyhow::{Context, Result};
use bitflags::bitflags;
use fd_context::{FdContext, Waiter};
use libc::c_int;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

bitflags! {
    /// One direction of descriptor readiness, aligned with the epoll bits so
    /// the mask maps directly onto `EPOLLIN`/`EPOLLOUT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Event: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

/// Events drained per `epoll_wait`.
const MAX_EVENTS: usize = 256;
/// Upper bound on one epoll park; the next timer deadline can only shorten
/// it.
const MAX_TIMEOUT_MS: u64 = 5000;

thread_local! {
    static CURRENT_IO: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current(weak: Weak<IoManager>) {
    CURRENT_IO.with(|c| *c.borrow_mut() = Some(weak));
}

pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    /// Self-pipe; a one-byte write on [1] breaks a parked `epoll_wait` on
    /// the edge-triggered read end [0].
    tickle_fds: [RawFd; 2],
    pending_events: AtomicUsize,
    fd_contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
}

// Safety: the raw descriptors are owned for the lifetime of the manager and
// every mutable structure behind them is lock-guarded.
unsafe impl Send for IoManager {}
unsafe impl Sync for IoManager {}

impl IoManager {
    /// Builds the reactor, wires it under the scheduler, and starts the
    /// worker pool.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        crate::hook::ensure_init();

        let scheduler = Scheduler::new(threads, use_caller, name);

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(epfd >= 0, "epoll_create1 failed");

        let mut pipe_fds = [0 as RawFd; 2];
        let rt = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK) };
        assert_eq!(rt, 0, "tickle pipe creation failed");

        let io = Arc::new(IoManager {
            scheduler,
            timers: TimerManager::new(),
            epfd,
            tickle_fds: pipe_fds,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
        });

        // Edge-triggered read end: drained fully on every wake.
        io.epoll_ctl(
            libc::EPOLL_CTL_ADD,
            io.tickle_fds[0],
            libc::EPOLLIN as u32 | libc::EPOLLET as u32,
        )
        .expect("registering tickle pipe");

        io.fd_contexts.write().resize(32, None);

        io.scheduler.attach_reactor(Arc::downgrade(&io));
        {
            // A new front timer may need to cut a parked epoll_wait short.
            let weak = Arc::downgrade(&io);
            io.timers.set_front_notify(move || {
                if let Some(io) = weak.upgrade() {
                    io.tickle();
                }
            });
        }
        if use_caller {
            set_current(Arc::downgrade(&io));
        }

        io.scheduler.start();
        io
    }

    /// The IO manager driving the current thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IO.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Stops the underlying scheduler; see [`Scheduler::stop`] for the
    /// calling-thread rules.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::Acquire)
    }

    /// Registers interest in one direction of `fd`, waking the *current
    /// fiber* when it fires; the caller is expected to yield to HOLD next.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        self.add_event_inner(fd, event, None)
    }

    /// Registers interest in one direction of `fd` with an explicit callback
    /// dispatched on readiness.
    pub fn add_event_with(
        &self,
        fd: RawFd,
        event: Event,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.add_event_inner(fd, event, Some(Box::new(cb)))
    }

    pub(crate) fn add_event_inner(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<FiberFn>,
    ) -> Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "exactly one direction per registration, got {event:?}"
        );

        let ctx = self.fd_context(fd);
        let mut inner = ctx.inner.lock();
        assert!(
            !inner.events.contains(event),
            "fd {fd} already has {event:?} registered"
        );

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mask = libc::EPOLLET as u32 | (inner.events | event).bits();
        if let Err(e) = self.epoll_ctl(op, fd, mask) {
            error!(target: "system", fd, "add_event epoll_ctl failed: {e}");
            return Err(e).with_context(|| format!("add_event({fd}, {event:?})"));
        }

        self.pending_events.fetch_add(1, Ordering::AcqRel);
        inner.events |= event;

        let ec = FdContext::event_context_mut(&mut inner, event);
        debug_assert!(ec.is_empty());
        ec.scheduler = Some(match crate::scheduler::current() {
            Some(s) => Arc::downgrade(&s),
            None => Arc::downgrade(&self.scheduler),
        });
        ec.waiter = Some(match cb {
            Some(cb) => Waiter::Call(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    State::Exec,
                    "an awaiting fiber must register from EXEC"
                );
                Waiter::Fiber(fiber)
            }
        });
        Ok(())
    }

    /// Withdraws interest without waking the waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup_fd_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let remaining = inner.events - event;
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mask = libc::EPOLLET as u32 | remaining.bits();
        if let Err(e) = self.epoll_ctl(op, fd, mask) {
            error!(target: "system", fd, "del_event epoll_ctl failed: {e}");
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        inner.events = remaining;
        *FdContext::event_context_mut(&mut inner, event) = Default::default();
        true
    }

    /// Withdraws interest and synthesizes a trigger, so a suspended waiter
    /// observes the cancellation instead of sleeping forever.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup_fd_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let remaining = inner.events - event;
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mask = libc::EPOLLET as u32 | remaining.bits();
        if let Err(e) = self.epoll_ctl(op, fd, mask) {
            error!(target: "system", fd, "cancel_event epoll_ctl failed: {e}");
            return false;
        }

        ctx.trigger(&mut inner, event);
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Cancels both directions of `fd`, triggering any waiters.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup_fd_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events.is_empty() {
            return false;
        }

        if let Err(e) = self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            error!(target: "system", fd, "cancel_all epoll_ctl failed: {e}");
            return false;
        }

        if inner.events.contains(Event::READ) {
            ctx.trigger(&mut inner, Event::READ);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        if inner.events.contains(Event::WRITE) {
            ctx.trigger(&mut inner, Event::WRITE);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }

        debug_assert!(inner.events.is_empty());
        true
    }

    /// Schedules `cb` to run `ms` from now on this manager's scheduler.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Timer that only fires while `cond` still upgrades.
    pub fn add_conditional_timer<T, F>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        T: Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_conditional_timer(ms, cb, cond, recurring)
    }

    /// Wakes one parked worker through the self-pipe. Skipped when nobody is
    /// parked: the running workers re-check the queue on their own.
    pub(crate) fn tickle(&self) {
        if self.scheduler.idle_worker_count() == 0 {
            return;
        }
        let rt = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr().cast(), 1) };
        debug_assert_eq!(rt, 1, "tickle write failed");
    }

    /// The scheduler's stop predicate, extended: no pending descriptor
    /// events and no outstanding timers.
    pub(crate) fn stopping(&self) -> bool {
        self.timers.next_timeout() == u64::MAX
            && self.pending_event_count() == 0
            && self.scheduler.base_stopping()
    }

    /// Body of the idle fiber on reactor-backed workers: park in epoll
    /// bounded by the next timer deadline, dispatch expirations and
    /// readiness, then yield back to the run loop.
    pub(crate) fn idle_loop(&self) {
        debug!(target: "system", name = %self.scheduler.name(), "idle");
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if self.stopping() {
                info!(
                    target: "system",
                    name = %self.scheduler.name(),
                    "idle stopping exit"
                );
                break;
            }

            let timeout = if self.scheduler.has_queued_tasks() {
                0
            } else {
                self.timers.next_timeout().min(MAX_TIMEOUT_MS)
            };
            let n = loop {
                let rt = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as c_int,
                        timeout as c_int,
                    )
                };
                if rt < 0 && crate::hook::errno() == libc::EINTR {
                    continue;
                }
                break rt;
            };

            let mut expired = Vec::new();
            self.timers.collect_expired(&mut expired);
            if !expired.is_empty() {
                self.scheduler
                    .schedule_batch(expired.into_iter().map(|cb| TaskTarget::call(move || cb())));
            }

            for ev in events.iter().take(n.max(0) as usize) {
                let fd = { ev.u64 } as RawFd;

                if fd == self.tickle_fds[0] {
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(self.tickle_fds[0], buf.as_mut_ptr().cast(), buf.len())
                    } > 0
                    {}
                    continue;
                }

                let Some(ctx) = self.lookup_fd_context(fd) else {
                    continue;
                };
                let mut inner = ctx.inner.lock();

                // Errors and hangups surface through whichever directions
                // are currently registered.
                let mut ep_events = { ev.events };
                if ep_events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    ep_events |=
                        (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
                }

                let real_events = Event::from_bits_truncate(
                    ep_events & (libc::EPOLLIN | libc::EPOLLOUT) as u32,
                );
                if (inner.events & real_events).is_empty() {
                    // Stale wake for an interest already withdrawn.
                    continue;
                }

                // One-shot: strip the fired directions, re-arm the rest.
                let remaining = inner.events - real_events;
                let op = if remaining.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                let mask = libc::EPOLLET as u32 | remaining.bits();
                if let Err(e) = self.epoll_ctl(op, fd, mask) {
                    error!(target: "system", fd, "idle re-arm epoll_ctl failed: {e}");
                    continue;
                }

                if real_events.contains(Event::READ) {
                    ctx.trigger(&mut inner, Event::READ);
                    self.pending_events.fetch_sub(1, Ordering::AcqRel);
                }
                if real_events.contains(Event::WRITE) {
                    ctx.trigger(&mut inner, Event::WRITE);
                    self.pending_events.fetch_sub(1, Ordering::AcqRel);
                }
            }

            // Let the run loop execute whatever was just enqueued. Swap out
            // through a raw handle so no strong reference rides the switch.
            let cur = Fiber::current();
            let raw = Arc::as_ptr(&cur);
            drop(cur);
            unsafe { (*raw).yield_back() };
        }
    }

    fn epoll_ctl(&self, op: c_int, fd: RawFd, events: u32) -> std::io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    /// Resolves the context for `fd`, growing the table by 1.5x on
    /// out-of-range access.
    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "invalid fd {fd}");
        let idx = fd as usize;

        {
            let table = self.fd_contexts.read();
            if let Some(Some(ctx)) = table.get(idx) {
                return ctx.clone();
            }
        }

        let mut table = self.fd_contexts.write();
        if table.len() <= idx {
            let grown = (idx * 3 / 2 + 1).max(32);
            table.resize(grown, None);
        }
        if table[idx].is_none() {
            table[idx] = Some(Arc::new(FdContext::new(fd)));
        }
        table[idx].clone().unwrap()
    }

    fn lookup_fd_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.fd_contexts.read().get(fd as usize)?.clone()
    }
}

impl std::ops::Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
