//! Worker pool saturation (§8 scenario 5): with a pool smaller than the
//! number of concurrent blocking calls, at most `worker_pool_size` jobs run
//! at once and every caller still eventually completes.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use microcord::config::Config;
use microcord::fiber;
use microcord::scheduler::Scheduler;
use microcord::worker;

const POOL_SIZE: usize = 2;
const CALLERS: usize = 10;

#[test]
fn concurrent_jobs_never_exceed_pool_size() {
    let scheduler = Scheduler::with_config(Config {
        worker_pool_size: POOL_SIZE,
        ..Config::default()
    })
    .expect("scheduler");

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let completed = Rc::new(RefCell::new(Vec::new()));

    for i in 0..CALLERS {
        let scheduler_for_caller = scheduler.clone();
        let in_flight = in_flight.clone();
        let max_in_flight = max_in_flight.clone();
        let completed = completed.clone();
        fiber::spawn(&scheduler, move || {
            let in_flight_for_job = in_flight.clone();
            let max_in_flight_for_job = max_in_flight.clone();
            let op = move || {
                let current = in_flight_for_job.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight_for_job.fetch_max(current, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                in_flight_for_job.fetch_sub(1, Ordering::SeqCst);
            };
            let result = scheduler_for_caller.workers().execute(&scheduler_for_caller, op);
            completed.borrow_mut().push((i, result.is_ok()));
        });
    }

    scheduler.run();

    let completed = completed.borrow();
    assert_eq!(completed.len(), CALLERS, "not every caller finished");
    for (i, ok) in completed.iter() {
        assert!(*ok, "caller {i} did not complete successfully");
    }
    assert!(
        max_in_flight.load(Ordering::SeqCst) <= POOL_SIZE,
        "observed {} jobs in flight at once, pool size is {POOL_SIZE}",
        max_in_flight.load(Ordering::SeqCst)
    );
}

#[test]
fn read_dir_blocking_returns_actual_entries() {
    let scheduler = Scheduler::with_config(Config {
        worker_pool_size: POOL_SIZE,
        ..Config::default()
    })
    .expect("scheduler");

    let dirs: Vec<tempfile::TempDir> = (0..CALLERS)
        .map(|i| {
            let dir = tempfile::tempdir().expect("tempdir");
            std::fs::write(dir.path().join(format!("file-{i}.txt")), b"hello").unwrap();
            dir
        })
        .collect();

    let completed = Rc::new(RefCell::new(Vec::new()));
    for (i, dir) in dirs.iter().enumerate() {
        let scheduler_for_caller = scheduler.clone();
        let completed = completed.clone();
        let path = dir.path().to_path_buf();
        fiber::spawn(&scheduler, move || {
            let result = worker::read_dir_blocking(&scheduler_for_caller, path);
            completed.borrow_mut().push((i, result.map(|entries| entries.len())));
        });
    }

    scheduler.run();

    let completed = completed.borrow();
    assert_eq!(completed.len(), CALLERS, "not every caller finished");
    for (i, result) in completed.iter() {
        let count = result.as_ref().unwrap_or_else(|e| panic!("caller {i} failed: {e}"));
        assert_eq!(*count, 1, "caller {i} did not see its directory entry");
    }
}
