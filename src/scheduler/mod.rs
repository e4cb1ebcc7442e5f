//! N:M fiber dispatcher.
//!
//! A [`Scheduler`] multiplexes fibers and closures over a pool of worker
//! threads through a single mutex-guarded FIFO queue. Entries may be pinned
//! to a specific worker thread; unpinned work is taken by whichever worker
//! gets to it first. With `use_caller` the constructing thread joins the
//! pool through a dedicated root fiber that runs the dispatch loop during
//! [`Scheduler::stop`].

use crate::fiber::{Fiber, FiberFn, State};
use crate::hook;
use crate::io::IoManager;
use crate::utils::ScopeGuard;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, info};

#[cfg(test)]
mod tests;

thread_local! {
    /// Scheduler owning the current thread's dispatch loop.
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };
    /// The fiber running the dispatch loop on this thread; fibers that
    /// participate in the scheduler swap against it.
    static DISPATCH_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// The scheduler driving the current thread, if any.
pub fn current() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

/// The dispatch fiber of the current thread, if the thread belongs to a
/// scheduler.
pub(crate) fn dispatch_fiber() -> Option<Arc<Fiber>> {
    DISPATCH_FIBER.with(|c| c.borrow().clone())
}

/// What a [`ScheduleEntry`] runs: an existing fiber, or a closure wrapped in
/// a (reusable) fiber by the worker that picks it up.
pub enum TaskTarget {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

impl TaskTarget {
    pub fn call(f: impl FnOnce() + Send + 'static) -> TaskTarget {
        TaskTarget::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for TaskTarget {
    fn from(fiber: Arc<Fiber>) -> Self {
        TaskTarget::Fiber(fiber)
    }
}

impl From<FiberFn> for TaskTarget {
    fn from(f: FiberFn) -> Self {
        TaskTarget::Call(f)
    }
}

struct ScheduleEntry {
    target: TaskTarget,
    /// Restricts execution to exactly this worker when set.
    pinned: Option<ThreadId>,
}

pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<ScheduleEntry>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Worker threads to spawn, excluding the caller when `use_caller`.
    thread_count: usize,
    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    /// True before `start` and again once `stop` is requested.
    stop_requested: AtomicBool,
    auto_stop: AtomicBool,
    /// Dispatch fiber of the caller thread when `use_caller`.
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    root_thread: Option<ThreadId>,
    weak_self: OnceLock<Weak<Scheduler>>,
    /// Reactor extending this scheduler: supplies tickle, the idle loop, and
    /// the stop predicate when present.
    reactor: OnceLock<Weak<IoManager>>,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers. With `use_caller` the
    /// calling thread counts as one of them and joins the dispatch loop
    /// inside [`stop`](Self::stop); a thread can own at most one scheduler
    /// this way.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one thread");

        let (thread_count, root_thread) = if use_caller {
            // The caller thread needs a fiber environment before it can host
            // the root fiber.
            Fiber::current();
            (threads - 1, Some(thread::current().id()))
        } else {
            (threads, None)
        };

        let scheduler = Arc::new(Scheduler {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_count,
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_fiber: Mutex::new(None),
            root_thread,
            weak_self: OnceLock::new(),
            reactor: OnceLock::new(),
        });
        let _ = scheduler.weak_self.set(Arc::downgrade(&scheduler));

        if use_caller {
            assert!(
                current().is_none(),
                "thread already participates in scheduler"
            );

            let weak = Arc::downgrade(&scheduler);
            // The root fiber runs the dispatch loop but is not itself a
            // schedulable task, so it swaps against the thread main fiber.
            let root = Fiber::new_with(
                move || {
                    if let Some(s) = weak.upgrade() {
                        s.run();
                    }
                },
                0,
                false,
            );
            *scheduler.root_fiber.lock() = Some(root.clone());

            CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(Arc::downgrade(&scheduler)));
            DISPATCH_FIBER.with(|c| *c.borrow_mut() = Some(root));
            crate::utils::thread::set_current_thread_name(name);
        }

        scheduler
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn attach_reactor(&self, reactor: Weak<IoManager>) {
        let _ = self.reactor.set(reactor);
    }

    fn reactor(&self) -> Option<Arc<IoManager>> {
        self.reactor.get().and_then(Weak::upgrade)
    }

    fn weak(&self) -> Weak<Scheduler> {
        self.weak_self.get().expect("scheduler weak self").clone()
    }

    /// Spawns the worker threads. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock();
        if !self.stop_requested.load(Ordering::Acquire) {
            return;
        }
        self.stop_requested.store(false, Ordering::Release);
        assert!(threads.is_empty());

        for i in 0..self.thread_count {
            let me = Arc::clone(self);
            let thread_name = format!("{}_{}", self.name, i);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    crate::utils::thread::set_current_thread_name(&thread_name);
                    me.run();
                })
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }
    }

    /// Enqueues a task, optionally pinned to one worker thread. Wakes a
    /// parked worker when the queue transitions from empty.
    pub fn schedule(&self, task: impl Into<TaskTarget>, pinned: Option<ThreadId>) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(ScheduleEntry {
                target: task.into(),
                pinned,
            });
            was_empty
        };

        if need_tickle {
            self.tickle();
        }
    }

    /// Enqueues a batch under one lock acquisition.
    pub fn schedule_batch<I, T>(&self, tasks: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskTarget>,
    {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            let mut pushed = false;
            for task in tasks {
                queue.push_back(ScheduleEntry {
                    target: task.into(),
                    pinned: None,
                });
                pushed = true;
            }
            was_empty && pushed
        };

        if need_tickle {
            self.tickle();
        }
    }

    /// Requests shutdown, drains the queue, and joins the workers. A
    /// `use_caller` scheduler must be stopped from its owning thread (which
    /// enters the dispatch loop here); any other scheduler must be stopped
    /// from outside its worker threads.
    pub fn stop(self: &Arc<Self>) {
        self.auto_stop.store(true, Ordering::Release);

        let root = self.root_fiber.lock().clone();

        // use_caller with a single thread: nothing ever ran yet.
        if let Some(rf) = &root {
            if self.thread_count == 0 && matches!(rf.state(), State::Term | State::Init) {
                info!(target: "system", scheduler = %self.name, "stopped");
                self.stop_requested.store(true, Ordering::Release);
                if self.stopping() {
                    return;
                }
            }
        }

        if self.root_thread.is_some() {
            assert_eq!(
                self.root_thread,
                Some(thread::current().id()),
                "use_caller scheduler must be stopped from its owning thread"
            );
        } else if let Some(cur) = current() {
            assert!(
                !Arc::ptr_eq(&cur, self),
                "scheduler cannot be stopped from one of its own workers"
            );
        }

        self.stop_requested.store(true, Ordering::Release);
        for _ in 0..self.thread_count {
            self.tickle();
        }
        if root.is_some() {
            self.tickle();
        }

        // The caller joins the dispatch loop until the queue drains.
        if let Some(rf) = root {
            if !self.stopping() {
                rf.resume();
            }
        }

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn has_idle_workers(&self) -> bool {
        self.idle_workers.load(Ordering::Acquire) > 0
    }

    /// Whether entries are waiting in the queue. The reactor's idle loop
    /// checks this after the worker has advertised itself idle, closing the
    /// window where a task enqueued mid-transition would miss its tickle.
    pub(crate) fn has_queued_tasks(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    pub(crate) fn idle_worker_count(&self) -> usize {
        self.idle_workers.load(Ordering::Acquire)
    }

    /// Collected worker thread ids, including the caller thread when
    /// `use_caller`; useful for pinning.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        let mut ids: Vec<ThreadId> = self
            .threads
            .lock()
            .iter()
            .map(|h| h.thread().id())
            .collect();
        if let Some(root) = self.root_thread {
            ids.push(root);
        }
        ids
    }

    fn tickle(&self) {
        if let Some(io) = self.reactor() {
            io.tickle();
        } else {
            debug!(target: "system", scheduler = %self.name, "tickle");
        }
    }

    /// Stop predicate of the bare dispatcher; a reactor extends it.
    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stop_requested.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active_workers.load(Ordering::Acquire) == 0
    }

    fn stopping(&self) -> bool {
        if let Some(io) = self.reactor() {
            io.stopping()
        } else {
            self.base_stopping()
        }
    }

    /// Body of the per-thread idle fiber.
    fn idle_entry(&self) {
        if let Some(io) = self.reactor() {
            io.idle_loop();
        } else {
            debug!(target: "system", scheduler = %self.name, "idle");
            while !self.stopping() {
                Fiber::yield_to_hold();
            }
        }
    }

    /// Picks the next runnable entry: skips entries pinned to other threads
    /// (owing them a tickle) and fibers already running on another worker.
    fn take_task(&self) -> (Option<ScheduleEntry>, bool) {
        let mut queue = self.queue.lock();
        let me = thread::current().id();
        let mut entry = None;

        let mut i = 0;
        let mut tickle_me = false;
        while i < queue.len() {
            let candidate = &queue[i];
            if let Some(pinned) = candidate.pinned {
                if pinned != me {
                    tickle_me = true;
                    i += 1;
                    continue;
                }
            }
            if let TaskTarget::Fiber(f) = &candidate.target {
                if f.state() == State::Exec {
                    i += 1;
                    continue;
                }
            }

            entry = queue.remove(i);
            self.active_workers.fetch_add(1, Ordering::AcqRel);
            break;
        }
        // More candidates remain for the other workers.
        tickle_me |= i < queue.len();

        (entry, tickle_me)
    }

    /// The per-worker dispatch loop.
    pub(crate) fn run(self: &Arc<Self>) {
        debug!(target: "system", scheduler = %self.name, "run");

        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(self.weak()));
        if let Some(reactor) = self.reactor.get() {
            crate::io::set_current(reactor.clone());
            hook::set_hook_enabled(true);
        }

        // Spawned workers dispatch from their thread main fiber; the caller
        // thread dispatches from its root fiber, installed at construction.
        if Some(thread::current().id()) != self.root_thread {
            DISPATCH_FIBER.with(|c| *c.borrow_mut() = Some(Fiber::current()));
        }

        let weak = self.weak();
        let idle_fiber = Fiber::new(move || {
            if let Some(s) = weak.upgrade() {
                s.idle_entry();
            }
        });
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let (entry, tickle_me) = self.take_task();
            if tickle_me {
                self.tickle();
            }

            if let Some(entry) = entry {
                // Counter must drop even if the resumed fiber unwinds the
                // worker.
                let guard = ScopeGuard::new(|| {
                    self.active_workers.fetch_sub(1, Ordering::AcqRel);
                });

                match entry.target {
                    TaskTarget::Fiber(fiber) if !fiber.is_terminal() => {
                        fiber.resume();
                        drop(guard);

                        match fiber.state() {
                            State::Ready => self.schedule(fiber, None),
                            state if !matches!(state, State::Term | State::Except) => {
                                fiber.set_state(State::Hold);
                            }
                            _ => {}
                        }
                    }
                    TaskTarget::Call(cb) => {
                        // Reuse the wrapper fiber only when it finished; a
                        // wrapper parked in HOLD belongs to its waiter now.
                        let fiber = match cb_fiber.take() {
                            Some(f) if f.is_terminal() => {
                                f.reset_boxed(cb);
                                f
                            }
                            _ => Fiber::from_boxed(cb, 0, true),
                        };
                        fiber.resume();
                        drop(guard);

                        match fiber.state() {
                            State::Ready => self.schedule(fiber, None),
                            State::Term | State::Except => cb_fiber = Some(fiber),
                            _ => fiber.set_state(State::Hold),
                        }
                    }
                    // A fiber that terminated while queued; nothing to run.
                    TaskTarget::Fiber(_) => drop(guard),
                }
                continue;
            }

            if idle_fiber.state() == State::Term {
                info!(target: "system", scheduler = %self.name, "idle fiber term");
                break;
            }

            self.idle_workers.fetch_add(1, Ordering::AcqRel);
            idle_fiber.resume();
            self.idle_workers.fetch_sub(1, Ordering::AcqRel);
            if !idle_fiber.is_terminal() {
                idle_fiber.set_state(State::Hold);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug_assert!(
            self.stop_requested.load(Ordering::Acquire),
            "scheduler {} dropped while running",
            self.name
        );
    }
}
