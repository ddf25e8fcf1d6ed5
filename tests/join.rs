//! Join scenario (§8 scenario 3): a joining fiber only observes completion
//! after the target's `run()` has actually returned, at roughly the target's
//! sleep deadline.

use std::time::{Duration, Instant};

use microcord::fiber;
use microcord::scheduler::Scheduler;

#[test]
fn join_waits_for_target_completion() {
    let scheduler = Scheduler::new().expect("scheduler");
    let start = Instant::now();

    let scheduler_for_a = scheduler.clone();
    let handle = fiber::Builder::new(&scheduler).spawn(move || {
        scheduler_for_a.sleep(Duration::from_millis(10));
        42
    });

    let joined_at = std::rc::Rc::new(std::cell::Cell::new(None));
    let joined_at_for_b = joined_at.clone();
    fiber::spawn(&scheduler, move || {
        let result = handle.join();
        joined_at_for_b.set(Some((Instant::now(), result)));
    });

    scheduler.run();

    let (at, result) = joined_at.take().expect("joiner fiber did not run to completion");
    assert_eq!(result.unwrap(), 42);
    let elapsed = at.duration_since(start);
    assert!(elapsed >= Duration::from_millis(5), "join returned suspiciously early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(60), "join returned too late: {elapsed:?}");
}

#[test]
fn join_on_already_finished_fiber_succeeds_immediately() {
    let scheduler = Scheduler::new().expect("scheduler");
    let handle = fiber::Builder::new(&scheduler).spawn(|| "done");

    let observed = std::rc::Rc::new(std::cell::RefCell::new(None));
    let observed_for_b = observed.clone();
    // Give the target a chance to run to completion before the joiner does.
    fiber::spawn(&scheduler, move || {});
    fiber::spawn(&scheduler, move || {
        *observed_for_b.borrow_mut() = Some(handle.join());
    });

    scheduler.run();

    assert_eq!(observed.borrow_mut().take().unwrap().unwrap(), "done");
}
