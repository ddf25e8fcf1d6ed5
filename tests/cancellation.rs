//! Cancellation scenario (§8 scenario 4): a fiber blocked in `recv` observes
//! `Err(Error::Cancelled)` shortly after another fiber calls `cancel_read`.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use microcord::fiber;
use microcord::net::{TcpListener, TcpStream};
use microcord::scheduler::Scheduler;

#[test]
fn cancel_read_unblocks_pending_recv() {
    let scheduler = Scheduler::new().expect("scheduler");
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(&scheduler, addr).expect("bind");
    let listen_addr = listener.local_addr();

    // Keeps the server-side socket of the connection alive for the test's
    // duration without ever sending anything, so the client's `recv` has
    // nothing else to wake it but the cancellation.
    let accepted = Rc::new(RefCell::new(None));
    let accepted_for_acceptor = accepted.clone();
    fiber::spawn(&scheduler, move || {
        if let Ok((stream, _)) = listener.accept() {
            *accepted_for_acceptor.borrow_mut() = Some(stream);
        }
    });

    let start = Rc::new(RefCell::new(None));
    let cancelled_at = Rc::new(RefCell::new(None));

    let scheduler_for_setup = scheduler.clone();
    let start_for_setup = start.clone();
    let cancelled_at_for_setup = cancelled_at.clone();
    fiber::spawn(&scheduler, move || {
        // All three of connect/read/cancel must happen on fiber stacks: the
        // connect's non-blocking handshake itself is a suspension point.
        let client = Rc::new(TcpStream::connect(&scheduler_for_setup, listen_addr).expect("connect"));

        let client_for_reader = client.clone();
        let start_for_reader = start_for_setup.clone();
        let cancelled_at_for_reader = cancelled_at_for_setup.clone();
        fiber::spawn(&scheduler_for_setup, move || {
            *start_for_reader.borrow_mut() = Some(Instant::now());
            let mut buf = [0u8; 16];
            let result = client_for_reader.recv(&mut buf);
            *cancelled_at_for_reader.borrow_mut() = Some((Instant::now(), result));
        });

        fiber::spawn(&scheduler_for_setup, move || {
            // The reader fiber, enqueued just before this one, already ran
            // to its `WouldBlock` suspension point by the time the ready
            // queue reaches this fiber in the same drain pass.
            client.cancel_read();
        });
    });

    scheduler.run();

    let (cancelled_time, result) = cancelled_at.borrow_mut().take().expect("reader never resumed");
    assert!(result.is_err(), "expected cancellation error, got {result:?}");
    assert!(result.unwrap_err().is_cancelled());
    let start_time = start.borrow_mut().take().unwrap();
    assert!(
        cancelled_time.duration_since(start_time) <= Duration::from_millis(50),
        "cancellation took too long to be observed"
    );
}
