//! End-to-end echo scenario (§8 scenario 1, scaled down for test runtime):
//! a listener fiber accepts connections and spawns a per-connection echo
//! fiber; concurrent clients round-trip random bytes through it.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use pretty_assertions::assert_eq;

use microcord::fiber;
use microcord::net::{TcpListener, TcpStream};
use microcord::scheduler::Scheduler;

const CLIENTS: usize = 24;
const PAYLOAD_SIZE: usize = 32 * 1024;

fn pseudo_random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2685821657736338717).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state & 0xff) as u8
        })
        .collect()
}

#[test]
fn echo_round_trips_concurrent_clients() {
    let scheduler = Scheduler::new().expect("scheduler");
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(&scheduler, addr).expect("bind");
    let listen_addr = listener.local_addr();

    let scheduler_for_acceptor = scheduler.clone();
    fiber::spawn(&scheduler, move || {
        for _ in 0..CLIENTS {
            let (stream, _peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(_) => return,
            };
            fiber::spawn(&scheduler_for_acceptor, move || {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match stream.recv(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if stream.send_all(&buf[..n]).is_err() {
                        return;
                    }
                }
            });
        }
    });

    // Each client's send and receive halves run as separate fibers sharing
    // one `TcpStream` (safe: fibers never run truly in parallel, only
    // interleaved) so a full-duplex round trip of a payload larger than the
    // socket buffers can't deadlock the way a single send-then-receive
    // fiber could.
    let results = Rc::new(RefCell::new(Vec::new()));
    for client_id in 0..CLIENTS {
        let results = results.clone();
        let scheduler_for_client = scheduler.clone();
        fiber::spawn(&scheduler, move || {
            let stream = match TcpStream::connect(&scheduler_for_client, listen_addr) {
                Ok(s) => Rc::new(s),
                Err(e) => {
                    results.borrow_mut().push(Err(format!("connect failed: {e}")));
                    return;
                }
            };
            let sent = pseudo_random_bytes(client_id as u64 + 1, PAYLOAD_SIZE);

            let writer_stream = stream.clone();
            let sent_for_writer = sent.clone();
            let writer = fiber::Builder::new(&scheduler_for_client).spawn(move || writer_stream.send_all(&sent_for_writer));

            let mut received = vec![0u8; sent.len()];
            let mut filled = 0;
            let mut ok = true;
            while filled < received.len() {
                match stream.recv(&mut received[filled..]) {
                    Ok(0) => {
                        ok = false;
                        break;
                    }
                    Ok(n) => filled += n,
                    Err(_) => {
                        ok = false;
                        break;
                    }
                }
            }
            let write_ok = writer.join().map(|r| r.is_ok()).unwrap_or(false);

            let outcome = if ok && write_ok && received == sent {
                Ok(())
            } else {
                Err("payload mismatch".to_string())
            };
            results.borrow_mut().push(outcome);
        });
    }

    scheduler.run();

    let results = results.borrow();
    assert_eq!(results.len(), CLIENTS, "not every client finished");
    for r in results.iter() {
        assert!(r.is_ok(), "client failed: {r:?}");
    }
}
