//! Stackful user-space execution contexts.
//!
//! A [`Fiber`] owns an mmap'd stack and a saved machine context, and is
//! switched in and out of a thread without kernel scheduling involvement.
//! Every thread lazily materializes a "main" fiber wrapping its original
//! execution flow; child fibers swap against either that main fiber or the
//! thread's scheduler dispatch fiber, depending on whether they participate
//! in a scheduler.

pub(crate) mod stack;

use crate::config::{Config, ConfigVar};
use parking_lot::Mutex;
use stack::Stack;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::{debug, error};

/// Boxed fiber entry closure.
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

static STACK_SIZE: LazyLock<Arc<ConfigVar<u32>>> =
    LazyLock::new(|| Config::lookup("fiber.stack_size", 1024 * 1024, "fiber stack size"));

thread_local! {
    /// The fiber currently in EXEC on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// The fiber wrapping this thread's original execution flow.
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Fiber lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Constructed or reset, never resumed.
    Init = 0,
    /// Eligible to run now; the scheduler re-enqueues fibers in this state.
    Ready = 1,
    /// Running. At most one fiber per OS thread is in this state.
    Exec = 2,
    /// Suspended awaiting an external wake.
    Hold = 3,
    /// Closure ran to completion.
    Term = 4,
    /// Closure panicked; the panic was contained.
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Exec,
            3 => State::Hold,
            4 => State::Term,
            5 => State::Except,
            _ => unreachable!("invalid fiber state {v}"),
        }
    }
}

pub struct Fiber {
    id: u64,
    /// Swap against the thread's dispatch fiber instead of its main fiber.
    in_scheduler: bool,
    state: AtomicU8,
    ctx: UnsafeCell<libc::ucontext_t>,
    /// None for the main fiber, which borrows the OS thread stack.
    stack: Option<Stack>,
    cb: Mutex<Option<FiberFn>>,
}

// Safety: the state machine guarantees a fiber executes on at most one
// thread at a time; `ctx` and `cb` are only touched by the thread that is
// resuming, yielding, or resetting it, and those operations are serialized
// by the EXEC-exclusivity invariant.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Wraps the current thread's execution flow; only called once per
    /// thread, from [`Fiber::current`].
    fn new_main() -> Fiber {
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);

        let fiber = Fiber {
            id,
            in_scheduler: false,
            state: AtomicU8::new(State::Exec as u8),
            ctx: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            stack: None,
            cb: Mutex::new(None),
        };
        let rt = unsafe { libc::getcontext(fiber.ctx.get()) };
        assert_eq!(rt, 0, "getcontext failed");

        debug!(target: "system", fiber_id = id, "main fiber created");
        fiber
    }

    /// Creates a fiber with the default stack size that participates in the
    /// scheduler.
    pub fn new(cb: impl FnOnce() + Send + 'static) -> Arc<Fiber> {
        Self::from_boxed(Box::new(cb), 0, true)
    }

    /// Creates a fiber with an explicit stack size (0 selects the
    /// `fiber.stack_size` config default) and scheduler participation flag.
    pub fn new_with(
        cb: impl FnOnce() + Send + 'static,
        stack_size: usize,
        in_scheduler: bool,
    ) -> Arc<Fiber> {
        Self::from_boxed(Box::new(cb), stack_size, in_scheduler)
    }

    pub(crate) fn from_boxed(cb: FiberFn, stack_size: usize, in_scheduler: bool) -> Arc<Fiber> {
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);

        let size = if stack_size > 0 {
            stack_size
        } else {
            STACK_SIZE.value() as usize
        };

        let fiber = Fiber {
            id,
            in_scheduler,
            state: AtomicU8::new(State::Init as u8),
            ctx: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            stack: Some(Stack::alloc(size)),
            cb: Mutex::new(Some(cb)),
        };
        fiber.init_context();

        debug!(target: "system", fiber_id = id, "fiber created");
        Arc::new(fiber)
    }

    /// Points the saved context at the trampoline, running on the owned
    /// stack.
    fn init_context(&self) {
        let stack = self.stack.as_ref().expect("init_context on main fiber");
        unsafe {
            let ctx = self.ctx.get();
            let rt = libc::getcontext(ctx);
            assert_eq!(rt, 0, "getcontext failed");

            (*ctx).uc_link = std::ptr::null_mut();
            (*ctx).uc_stack.ss_sp = stack.bottom();
            (*ctx).uc_stack.ss_size = stack.usable_len();

            libc::makecontext(ctx, fiber_entry, 0);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.state(), State::Term | State::Except)
    }

    /// Rebinds the closure onto the existing stack. Legal only for fibers in
    /// a terminal or initial state; amortizes stack allocation.
    pub fn reset(&self, cb: impl FnOnce() + Send + 'static) {
        self.reset_boxed(Box::new(cb));
    }

    pub(crate) fn reset_boxed(&self, cb: FiberFn) {
        assert!(self.stack.is_some(), "the main fiber cannot be reset");
        let state = self.state();
        assert!(
            matches!(state, State::Term | State::Except | State::Init),
            "fiber {} cannot be reset from {state:?}",
            self.id
        );

        *self.cb.lock() = Some(cb);
        self.init_context();
        self.set_state(State::Ready);
    }

    /// Switches the current thread into this fiber. The context is saved
    /// into the fiber's peer: the thread's dispatch fiber when the fiber
    /// participates in a scheduler, the thread's main fiber otherwise.
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        assert!(
            !matches!(state, State::Exec | State::Term | State::Except),
            "fiber {} cannot resume from {state:?}",
            self.id
        );

        let peer = self.peer();
        Fiber::set_current(self.clone());
        self.set_state(State::Exec);

        unsafe {
            let rt = libc::swapcontext(peer.ctx_ptr(), self.ctx_ptr());
            assert_eq!(rt, 0, "swapcontext failed");
        }
    }

    /// Switches back to the peer. A running fiber lands in HOLD; a fiber
    /// that just hit a terminal state keeps it.
    pub(crate) fn yield_back(&self) {
        let state = self.state();
        debug_assert!(
            !matches!(state, State::Init | State::Hold),
            "fiber {} cannot yield from {state:?}",
            self.id
        );

        let peer = self.peer();
        Fiber::set_current(peer.clone());
        // Scheduler-run fibers stay EXEC across the swap; the dispatch loop
        // marks them HOLD only after the context save has completed, so a
        // concurrent trigger can never resume a half-saved context. Fibers
        // outside a scheduler have no concurrent resumer and park themselves.
        if state == State::Exec && !self.in_scheduler {
            self.set_state(State::Hold);
        }

        unsafe {
            let rt = libc::swapcontext(self.ctx_ptr(), peer.ctx_ptr());
            assert_eq!(rt, 0, "swapcontext failed");
        }
    }

    /// Marks the current fiber READY and yields; the scheduler will
    /// re-enqueue it.
    pub fn yield_to_ready() {
        let cur = Fiber::current();
        assert_eq!(cur.state(), State::Exec);
        cur.set_state(State::Ready);
        cur.yield_back();
    }

    /// Suspends the current fiber in HOLD; some external party owns the
    /// wake.
    pub fn yield_to_hold() {
        let cur = Fiber::current();
        assert_eq!(cur.state(), State::Exec);
        cur.yield_back();
    }

    /// The fiber currently executing on this thread, materializing the main
    /// fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = CURRENT.with(|c| c.borrow().clone()) {
            return fiber;
        }

        let main = Arc::new(Fiber::new_main());
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        THREAD_MAIN.with(|c| *c.borrow_mut() = Some(main.clone()));
        main
    }

    /// Id of the currently executing fiber, 0 when the thread has no fiber
    /// context yet.
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map_or(0, |f| f.id))
    }

    /// Live fibers in the process, main fibers included.
    pub fn total_fibers() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    pub(crate) fn thread_main() -> Arc<Fiber> {
        Fiber::current();
        THREAD_MAIN.with(|c| c.borrow().clone()).expect("thread main fiber")
    }

    fn set_current(fiber: Arc<Fiber>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(fiber));
    }

    fn peer(&self) -> Arc<Fiber> {
        if self.in_scheduler {
            crate::scheduler::dispatch_fiber()
                .expect("fiber participates in a scheduler but the thread has no dispatch fiber")
        } else {
            Fiber::thread_main()
        }
    }

    fn ctx_ptr(&self) -> *mut libc::ucontext_t {
        self.ctx.get()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            debug_assert!(
                matches!(state, State::Term | State::Except | State::Init),
                "fiber {} dropped in state {state:?}",
                self.id
            );
        }
        debug!(target: "system", fiber_id = self.id, "fiber destroyed");
    }
}

/// Entry point installed by `makecontext`. Runs the closure to completion,
/// records the terminal state, and swaps back to the peer.
extern "C" fn fiber_entry() {
    let cur = Fiber::current();
    let cb = cur
        .cb
        .lock()
        .take()
        .expect("fiber entered without a closure");

    match catch_unwind(AssertUnwindSafe(cb)) {
        Ok(()) => cur.set_state(State::Term),
        Err(payload) => {
            cur.set_state(State::Except);
            error!(
                target: "system",
                fiber_id = cur.id,
                "fiber closure panicked: {}\n{}",
                panic_message(&payload),
                Backtrace::force_capture()
            );
        }
    }

    // The strong reference must not survive into the final swap: it would
    // keep this very stack alive after termination. Swap out through a raw
    // handle instead; the resuming side still holds the fiber.
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    unsafe { (*raw).yield_back() };

    unreachable!("terminated fiber resumed");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(Fiber: Send, Sync);

    #[test]
    fn test_resume_yield_roundtrip() {
        let steps = Arc::new(AtomicUsize::new(0));

        let s = steps.clone();
        let fiber = Fiber::new_with(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_hold();
                s.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );

        assert_eq!(fiber.state(), State::Init);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), State::Hold);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn test_yield_to_ready_marks_ready() {
        let fiber = Fiber::new_with(
            || {
                Fiber::yield_to_ready();
            },
            0,
            false,
        );

        fiber.resume();
        assert_eq!(fiber.state(), State::Ready);

        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let fiber = Fiber::new_with(move || { h.fetch_add(1, Ordering::SeqCst); }, 16 * 1024, false);

        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        fiber.reset(move || { h.fetch_add(10, Ordering::SeqCst); });
        assert_eq!(fiber.state(), State::Ready);

        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_panic_is_contained() {
        let fiber = Fiber::new_with(|| panic!("boom"), 0, false);
        fiber.resume();
        assert_eq!(fiber.state(), State::Except);

        // The thread survives and can run further fibers.
        let fine = Fiber::new_with(|| {}, 0, false);
        fine.resume();
        assert_eq!(fine.state(), State::Term);
    }

    #[test]
    fn test_ids_are_unique_and_current_id_defaults_to_zero() {
        let a = Fiber::new_with(|| {}, 0, false);
        let b = Fiber::new_with(|| {}, 0, false);
        assert_ne!(a.id(), b.id());

        std::thread::spawn(|| {
            assert_eq!(Fiber::current_id(), 0);
            Fiber::current();
            assert_ne!(Fiber::current_id(), 0);
        })
        .join()
        .unwrap();

        // Terminal-state requirement on drop.
        a.resume();
        b.resume();
    }

    #[test]
    fn test_current_id_visible_inside_fiber() {
        let observed = Arc::new(AtomicU64::new(0));

        let o = observed.clone();
        let fiber = Fiber::new_with(move || { o.store(Fiber::current_id(), Ordering::SeqCst); }, 0, false);
        let id = fiber.id();

        fiber.resume();
        assert_eq!(observed.load(Ordering::SeqCst), id);
    }
}
