use super::*;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

assert_impl_all!(Scheduler: Send, Sync);

#[rstest]
#[case::single_worker(1)]
#[case::multi_worker(3)]
fn test_closures_run_on_worker_pool(#[case] threads: usize) {
    let scheduler = Scheduler::new(threads, false, "pool");
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..20 {
        let hits = hits.clone();
        scheduler.schedule(
            TaskTarget::call(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
    }

    scheduler.start();
    while hits.load(Ordering::SeqCst) < 20 {
        thread::sleep(Duration::from_millis(1));
    }
    scheduler.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 20);
}

#[test]
fn test_use_caller_runs_queue_during_stop() {
    let scheduler = Scheduler::new(1, true, "caller_only");
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..5 {
        let hits = hits.clone();
        scheduler.schedule(
            TaskTarget::call(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
    }

    scheduler.start();
    // No spawned worker exists; the queue drains when the caller joins in.
    scheduler.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 5);
}

#[test]
fn test_scheduled_fiber_reenqueued_on_yield_to_ready() {
    let scheduler = Scheduler::new(1, false, "requeue");
    let steps = Arc::new(AtomicUsize::new(0));

    let s = steps.clone();
    let fiber = Fiber::new(move || {
        s.fetch_add(1, Ordering::SeqCst);
        Fiber::yield_to_ready();
        s.fetch_add(1, Ordering::SeqCst);
    });
    scheduler.schedule(fiber.clone(), None);

    scheduler.start();
    while !fiber.is_terminal() {
        thread::sleep(Duration::from_millis(1));
    }
    scheduler.stop();

    assert_eq!(steps.load(Ordering::SeqCst), 2);
    assert_eq!(fiber.state(), State::Term);
}

#[test]
fn test_pinned_task_runs_on_requested_thread() {
    let scheduler = Scheduler::new(2, false, "pinned");
    scheduler.start();

    let ids = scheduler.thread_ids();
    assert_eq!(ids.len(), 2);

    let observed = Arc::new(Mutex::new(Vec::new()));
    for &target in &ids {
        for _ in 0..5 {
            let observed = observed.clone();
            scheduler.schedule(
                TaskTarget::call(move || {
                    observed.lock().push((target, thread::current().id()));
                }),
                Some(target),
            );
        }
    }

    while observed.lock().len() < 10 {
        thread::sleep(Duration::from_millis(1));
    }
    scheduler.stop();

    for (wanted, got) in observed.lock().iter() {
        assert_eq!(wanted, got, "pinned task executed on the wrong worker");
    }
}

#[test]
fn test_schedule_batch_runs_everything() {
    let scheduler = Scheduler::new(2, false, "batch");
    let hits = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<TaskTarget> = (0..50)
        .map(|_| {
            let hits = hits.clone();
            TaskTarget::call(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    scheduler.schedule_batch(tasks);

    scheduler.start();
    while hits.load(Ordering::SeqCst) < 50 {
        thread::sleep(Duration::from_millis(1));
    }
    scheduler.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 50);
}

#[test]
fn test_tasks_spread_across_workers() {
    let scheduler = Scheduler::new(3, false, "spread");
    scheduler.start();

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..60 {
        let seen = seen.clone();
        let done = done.clone();
        scheduler.schedule(
            TaskTarget::call(move || {
                seen.lock().insert(thread::current().id());
                // Stay busy long enough for the other workers to grab work.
                thread::sleep(Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
    }

    while done.load(Ordering::SeqCst) < 60 {
        thread::sleep(Duration::from_millis(1));
    }
    scheduler.stop();

    assert!(
        seen.lock().len() > 1,
        "60 tasks with sleeps should not serialize onto one worker"
    );
}

#[test]
fn test_current_scheduler_accessor() {
    let scheduler = Scheduler::new(1, false, "accessor");
    assert!(current().is_none(), "test thread owns no scheduler");

    let observed = Arc::new(AtomicUsize::new(0));
    let o = observed.clone();
    let me = scheduler.clone();
    scheduler.schedule(
        TaskTarget::call(move || {
            if let Some(cur) = current() {
                if Arc::ptr_eq(&cur, &me) {
                    o.store(1, Ordering::SeqCst);
                }
            }
        }),
        None,
    );

    scheduler.start();
    while observed.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    scheduler.stop();
}

#[test]
fn test_fifo_order_for_single_worker() {
    let scheduler = Scheduler::new(1, false, "fifo");
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10 {
        let order = order.clone();
        scheduler.schedule(
            TaskTarget::call(move || {
                order.lock().push(i);
            }),
            None,
        );
    }

    scheduler.start();
    while order.lock().len() < 10 {
        thread::sleep(Duration::from_millis(1));
    }
    scheduler.stop();

    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_panicking_task_does_not_kill_worker() {
    let scheduler = Scheduler::new(1, false, "contain");
    let hits = Arc::new(AtomicUsize::new(0));

    scheduler.schedule(TaskTarget::call(|| panic!("task blew up")), None);
    let h = hits.clone();
    scheduler.schedule(
        TaskTarget::call(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }),
        None,
    );

    scheduler.start();
    while hits.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    scheduler.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
