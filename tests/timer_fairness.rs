//! Timer fairness (§8 scenario 2, scaled down): many fibers sleeping the
//! same duration must all resume within a bounded window of the deadline.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use microcord::fiber;
use microcord::scheduler::Scheduler;

const FIBER_COUNT: usize = 200;
const SLEEP_MS: u64 = 50;

#[test]
fn all_sleepers_wake_within_tolerance() {
    let scheduler = Scheduler::new().expect("scheduler");
    let start = Instant::now();
    let wake_times = Rc::new(RefCell::new(Vec::with_capacity(FIBER_COUNT)));

    for _ in 0..FIBER_COUNT {
        let wake_times = wake_times.clone();
        let scheduler_for_fiber = scheduler.clone();
        fiber::spawn(&scheduler, move || {
            scheduler_for_fiber.sleep(Duration::from_millis(SLEEP_MS));
            wake_times.borrow_mut().push(Instant::now());
        });
    }

    scheduler.run();

    let wake_times = wake_times.borrow();
    assert_eq!(wake_times.len(), FIBER_COUNT, "not every fiber woke up");
    for t in wake_times.iter() {
        let elapsed = t.duration_since(start);
        assert!(
            elapsed >= Duration::from_millis(SLEEP_MS.saturating_sub(5)),
            "fiber woke too early: {elapsed:?}"
        );
        assert!(
            elapsed <= Duration::from_millis(100),
            "fiber woke too late: {elapsed:?}"
        );
    }
}
