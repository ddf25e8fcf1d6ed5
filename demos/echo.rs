//! Echo server demo (§8 scenario 1): one fiber accepts connections and
//! spawns a detached echo fiber per connection, which loops `recv`/`send_all`
//! until the peer closes its half of the socket.
//!
//! ```text
//! cargo run --features demos --bin echo-demo -- 127.0.0.1:7878
//! ```

use std::net::SocketAddr;

use microcord::fiber;
use microcord::log::{self, LogConfig};
use microcord::net::TcpListener;
use microcord::scheduler::Scheduler;

fn main() -> anyhow::Result<()> {
    log::init(LogConfig::stdout_only()).ok();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string())
        .parse()?;

    let scheduler = Scheduler::new()?;
    let listener = TcpListener::bind(&scheduler, addr)?;
    log::info!("listening on {}", listener.local_addr());

    let scheduler_for_acceptor = scheduler.clone();
    fiber::spawn(&scheduler, move || {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("accepted connection from {peer}");
                    fiber::spawn(&scheduler_for_acceptor, move || {
                        if let Err(e) = echo_loop(stream) {
                            log::warn!("connection from {peer} ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    log::error!("accept failed: {e}");
                    break;
                }
            }
        }
    });

    scheduler.run();
    Ok(())
}

fn echo_loop(stream: microcord::net::TcpStream) -> microcord::Result<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = stream.recv(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        stream.send_all(&buf[..n])?;
    }
}
