use super::*;
use crate::test_utils::{init_tracing, wait_until};
use crate::utils::current_ms;
use static_assertions::assert_impl_all;
use std::sync::atomic::AtomicUsize;
use std::thread;
use std::time::Duration;

assert_impl_all!(IoManager: Send, Sync);

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rt = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
    assert_eq!(rt, 0);
    (fds[0], fds[1])
}

fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

#[test]
fn test_pipe_handshake() {
    init_tracing();
    let io = IoManager::new(1, false, "pipe_hs");
    let (r, w) = make_pipe();

    let done_at = Arc::new(AtomicUsize::new(0));

    let io2 = io.clone();
    let done = done_at.clone();
    io.schedule(
        TaskTarget::call(move || {
            io2.add_event(r, Event::READ).unwrap();
            Fiber::yield_to_hold();

            let mut buf = [0u8; 1];
            let n = unsafe { libc::read(r, buf.as_mut_ptr().cast(), 1) };
            assert_eq!(n, 1);
            assert_eq!(buf[0], b'X');
            done.store(current_ms() as usize, Ordering::SeqCst);
        }),
        None,
    );

    assert!(wait_until(1000, || io.pending_event_count() == 1));
    let write_at = current_ms();
    thread::sleep(Duration::from_millis(100));
    let n = unsafe { libc::write(w, b"X".as_ptr().cast(), 1) };
    assert_eq!(n, 1);

    assert!(wait_until(1000, || done_at.load(Ordering::SeqCst) != 0));
    let elapsed = done_at.load(Ordering::SeqCst) as u64 - write_at;
    assert!(elapsed >= 100, "woke before the peer wrote: {elapsed}ms");
    assert!(elapsed < 500, "wake took too long: {elapsed}ms");
    assert_eq!(io.pending_event_count(), 0);

    io.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn test_pipe_handshake_use_caller() {
    init_tracing();
    let io = IoManager::new(1, true, "pipe_hs_uc");
    let (r, w) = make_pipe();

    let got = Arc::new(AtomicUsize::new(0));

    let io2 = io.clone();
    let g = got.clone();
    io.schedule(
        TaskTarget::call(move || {
            io2.add_event(r, Event::READ).unwrap();
            Fiber::yield_to_hold();

            let mut buf = [0u8; 1];
            let n = unsafe { libc::read(r, buf.as_mut_ptr().cast(), 1) };
            assert_eq!(n, 1);
            g.store(1, Ordering::SeqCst);
        }),
        None,
    );

    // With one use_caller thread the queue only drains inside stop(), so the
    // peer writes from a side thread.
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let n = unsafe { libc::write(w, b"X".as_ptr().cast(), 1) };
        assert_eq!(n, 1);
    });

    io.stop();
    writer.join().unwrap();

    assert_eq!(got.load(Ordering::SeqCst), 1);
    assert_eq!(io.pending_event_count(), 0);
    close_fd(r);
    close_fd(w);
}

#[test]
fn test_add_event_with_callback() {
    init_tracing();
    let io = IoManager::new(1, false, "event_cb");
    let (r, w) = make_pipe();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    io.add_event_with(r, Event::READ, move || {
        f.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(io.pending_event_count(), 1);

    unsafe { libc::write(w, b"x".as_ptr().cast(), 1) };
    assert!(wait_until(1000, || fired.load(Ordering::SeqCst) == 1));
    assert_eq!(io.pending_event_count(), 0);

    // One-shot discipline: another write must not re-fire without a fresh
    // registration.
    unsafe { libc::write(w, b"y".as_ptr().cast(), 1) };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    io.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn test_del_event_does_not_fire_waiter() {
    init_tracing();
    let io = IoManager::new(1, false, "del_event");
    let (r, w) = make_pipe();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    io.add_event_with(r, Event::READ, move || {
        f.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    assert!(io.del_event(r, Event::READ));
    assert_eq!(io.pending_event_count(), 0);
    assert!(!io.del_event(r, Event::READ), "second del must report absence");

    unsafe { libc::write(w, b"x".as_ptr().cast(), 1) };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 0, "del_event must not trigger");

    io.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn test_cancel_event_wakes_waiter_exactly_once() {
    init_tracing();
    let io = IoManager::new(1, false, "cancel_one");
    let (r, w) = make_pipe();

    let resumed = Arc::new(AtomicUsize::new(0));
    let io2 = io.clone();
    let res = resumed.clone();
    io.schedule(
        TaskTarget::call(move || {
            io2.add_event(r, Event::READ).unwrap();
            Fiber::yield_to_hold();
            res.fetch_add(1, Ordering::SeqCst);
        }),
        None,
    );

    assert!(wait_until(1000, || io.pending_event_count() == 1));
    assert!(io.cancel_event(r, Event::READ));

    assert!(wait_until(1000, || resumed.load(Ordering::SeqCst) == 1));
    assert_eq!(io.pending_event_count(), 0);

    // The interest is gone; a late write reaches nobody.
    unsafe { libc::write(w, b"x".as_ptr().cast(), 1) };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(resumed.load(Ordering::SeqCst), 1);

    io.stop();
    close_fd(r);
    close_fd(w);
}

#[test]
fn test_cancellation_under_load() {
    init_tracing();
    let io = IoManager::new(2, false, "cancel_load");
    const N: usize = 50;

    let resumed = Arc::new(AtomicUsize::new(0));
    let mut pipes = Vec::with_capacity(N);

    for _ in 0..N {
        let (r, w) = make_pipe();
        pipes.push((r, w));

        let io2 = io.clone();
        let res = resumed.clone();
        io.schedule(
            TaskTarget::call(move || {
                io2.add_event(r, Event::READ).unwrap();
                Fiber::yield_to_hold();
                res.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
    }

    assert!(wait_until(2000, || io.pending_event_count() == N));

    thread::scope(|s| {
        for chunk in pipes.chunks(N / 2) {
            let io = io.clone();
            s.spawn(move || {
                for &(r, _) in chunk {
                    assert!(io.cancel_all(r));
                }
            });
        }
    });

    assert!(wait_until(2000, || resumed.load(Ordering::SeqCst) == N));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(resumed.load(Ordering::SeqCst), N, "every fiber resumes exactly once");
    assert_eq!(io.pending_event_count(), 0);

    io.stop();
    for (r, w) in pipes {
        close_fd(r);
        close_fd(w);
    }
}

#[test]
fn test_timer_fires_through_idle_loop() {
    init_tracing();
    let io = IoManager::new(1, false, "io_timer");

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let armed_at = current_ms();
    io.add_timer(
        50,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    assert!(wait_until(1000, || fired.load(Ordering::SeqCst) == 1));
    let elapsed = current_ms() - armed_at;
    assert!(elapsed >= 50, "timer fired early at {elapsed}ms");

    io.stop();
}

#[test]
fn test_recurring_timer_downgrade() {
    init_tracing();
    let io = IoManager::new(1, false, "recurring");

    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let timer = io.add_timer(
        50,
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    assert!(wait_until(2000, || count.load(Ordering::SeqCst) >= 3));
    assert!(timer.reset(200, true));
    timer.set_recurring(false);

    // The final fire (plus anything already in flight) lands, then silence.
    thread::sleep(Duration::from_millis(700));
    let after_final = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(400));
    assert_eq!(
        count.load(Ordering::SeqCst),
        after_final,
        "downgraded timer must not fire again"
    );
    assert!(!io.timers.has_timer(), "retired timer must leave the set");

    io.stop();
}

#[test]
fn test_front_timer_shortens_parked_wait() {
    init_tracing();
    let io = IoManager::new(1, false, "front_timer");

    // Give the worker time to park with the 5s default bound.
    thread::sleep(Duration::from_millis(50));

    let fired_at = Arc::new(AtomicUsize::new(0));
    let f = fired_at.clone();
    let armed_at = current_ms();
    io.add_timer(
        100,
        move || {
            f.store(current_ms() as usize, Ordering::SeqCst);
        },
        false,
    );

    assert!(wait_until(1000, || fired_at.load(Ordering::SeqCst) != 0));
    let elapsed = fired_at.load(Ordering::SeqCst) as u64 - armed_at;
    assert!(
        (100..1000).contains(&elapsed),
        "parked epoll_wait was not shortened: fired after {elapsed}ms"
    );

    io.stop();
}

#[test]
fn test_stop_waits_for_queue_drain() {
    init_tracing();
    let io = IoManager::new(2, false, "drain");

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let done = done.clone();
        io.schedule(
            TaskTarget::call(move || {
                thread::sleep(Duration::from_millis(2));
                done.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
    }

    io.stop();
    assert_eq!(done.load(Ordering::SeqCst), 20);
}

#[test]
fn test_current_io_manager_inside_worker() {
    init_tracing();
    let io = IoManager::new(1, false, "current_io");

    assert!(IoManager::current().is_none(), "foreign thread has no manager");

    let seen = Arc::new(AtomicUsize::new(0));
    let s = seen.clone();
    let me = io.clone();
    io.schedule(
        TaskTarget::call(move || {
            if let Some(cur) = IoManager::current() {
                if Arc::ptr_eq(&cur, &me) {
                    s.store(1, Ordering::SeqCst);
                }
            }
        }),
        None,
    );

    assert!(wait_until(1000, || seen.load(Ordering::SeqCst) == 1));
    io.stop();
}
