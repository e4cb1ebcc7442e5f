use super::Event;
use crate::fiber::{Fiber, FiberFn};
use crate::scheduler::{Scheduler, TaskTarget};
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use tracing::error;

/// What gets dispatched when one direction of a descriptor fires.
pub(crate) enum Waiter {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

/// The (owning-scheduler, waiter) pair attached to one direction of one fd.
#[derive(Default)]
pub(crate) struct EventContext {
    pub(crate) scheduler: Option<Weak<Scheduler>>,
    pub(crate) waiter: Option<Waiter>,
}

impl EventContext {
    pub(crate) fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.waiter.is_none()
    }
}

pub(crate) struct FdContextInner {
    /// Directions currently registered with epoll.
    pub(crate) events: Event,
    pub(crate) read: EventContext,
    pub(crate) write: EventContext,
}

/// Per-descriptor event state, indexed by fd in the IO manager's table.
pub(crate) struct FdContext {
    pub(crate) fd: RawFd,
    pub(crate) inner: Mutex<FdContextInner>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(FdContextInner {
                events: Event::empty(),
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }

    /// Dispatches the waiter for `event` back into its scheduler and clears
    /// the slot. One-shot: the direction is removed from the interest mask.
    pub(crate) fn trigger(&self, inner: &mut FdContextInner, event: Event) {
        assert!(
            inner.events.contains(event),
            "trigger for fd {} without registered event {event:?}",
            self.fd
        );
        inner.events -= event;

        let ctx = Self::event_context_mut(inner, event);
        let scheduler = ctx.scheduler.take().and_then(|w| w.upgrade());
        let waiter = ctx.waiter.take();

        let Some(scheduler) = scheduler else {
            error!(target: "system", fd = self.fd, "event fired after its scheduler was dropped");
            return;
        };
        match waiter {
            // The fiber may still be EXEC if the trigger raced its yield;
            // the run loop skips EXEC fibers until they are resumable.
            Some(Waiter::Fiber(fiber)) => scheduler.schedule(fiber, None),
            Some(Waiter::Call(cb)) => scheduler.schedule(TaskTarget::Call(cb), None),
            None => {}
        }
    }

    pub(crate) fn event_context_mut<'a>(
        inner: &'a mut FdContextInner,
        event: Event,
    ) -> &'a mut EventContext {
        if event == Event::READ {
            &mut inner.read
        } else if event == Event::WRITE {
            &mut inner.write
        } else {
            unreachable!("a single direction is required, got {event:?}");
        }
    }
}
