//! TCP sockets and pipes built on top of [`crate::io::PolledFd`], the
//! concrete fiber-blocking-I/O surface that the mixin in [`crate::io`]
//! describes in the abstract.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use crate::error::{Error, Result};
use crate::io::{sockaddr_storage_to_std, std_to_sockaddr, Kind, PolledFd, Shutdown};
use crate::scheduler::Handle;

/// A listening TCP socket whose `accept` suspends the calling fiber instead
/// of the OS thread.
pub struct TcpListener {
    inner: PolledFd,
    scheduler: Handle,
    local_addr: SocketAddr,
}

impl TcpListener {
    /// Binds and listens, mirroring `std::net::TcpListener::bind` but
    /// registering the resulting fd with the scheduler's event loop.
    pub fn bind(scheduler: &Handle, addr: SocketAddr) -> Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let fd = std_listener.into_raw_fd();
        Ok(Self {
            inner: PolledFd::new(scheduler, fd, Kind::Socket)?,
            scheduler: scheduler.clone(),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Blocks the calling fiber until a connection arrives.
    pub fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (fd, addr) = self.inner.accept_raw()?;
        let stream = TcpStream::from_raw(&self.scheduler, fd)?;
        Ok((stream, addr))
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// A connected TCP socket. `read`/`write` park the calling fiber on
/// `EAGAIN` rather than blocking the OS thread (§4.8).
pub struct TcpStream {
    inner: PolledFd,
    peer_addr: Option<SocketAddr>,
}

impl TcpStream {
    fn from_raw(scheduler: &Handle, fd: RawFd) -> Result<Self> {
        let peer_addr = unsafe {
            let mut storage: libc::sockaddr_storage = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            if libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) == 0 {
                sockaddr_storage_to_std(&storage).ok()
            } else {
                None
            }
        };
        Ok(Self {
            inner: PolledFd::new(scheduler, fd, Kind::Socket)?,
            peer_addr,
        })
    }

    /// Non-blocking connect: creates the socket, issues `connect`, and if
    /// it would block (`EINPROGRESS`), parks on writability and checks
    /// `SO_ERROR` for the final outcome (§4.8).
    pub fn connect(scheduler: &Handle, addr: SocketAddr) -> Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let (storage, len) = std_to_sockaddr(addr);
        let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        let stream = Self::from_raw(scheduler, fd)?;
        if rc == 0 {
            return Ok(stream);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            stream.inner.finish_connect()?;
            Ok(stream)
        } else {
            Err(Error::Io(err))
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf)
    }

    pub fn send_all(&self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf)
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.inner.shutdown(how)
    }

    pub fn cancel_read(&self) {
        self.inner.cancel_read()
    }

    pub fn cancel_write(&self) {
        self.inner.cancel_write()
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf).map_err(io_err)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf).map_err(io_err)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn io_err(e: Error) -> std::io::Error {
    match e {
        Error::Io(e) => e,
        Error::Cancelled => std::io::Error::new(std::io::ErrorKind::Interrupted, "cancelled"),
        other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
    }
}

/// A unidirectional OS pipe, overlaid with the same fiber-blocking
/// `read`/`write` surface as a socket. Used directly by a handful of
/// worked examples and tests that want a descriptor pair without a socket.
pub struct PipeReader(PolledFd);
pub struct PipeWriter(PolledFd);

/// Creates a non-blocking pipe pair registered with `scheduler`.
pub fn pipe(scheduler: &Handle) -> Result<(PipeReader, PipeWriter)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let read = PolledFd::new(scheduler, fds[0], Kind::Pipe)?;
    let write = PolledFd::new(scheduler, fds[1], Kind::Pipe)?;
    Ok((PipeReader(read), PipeWriter(write)))
}

impl PipeReader {
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.0.read(buf)
    }
}

impl PipeWriter {
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.0.write(buf)
    }

    pub fn write_all(&self, buf: &[u8]) -> Result<()> {
        self.0.write_all(buf)
    }
}

// Re-exported so callers can match on shutdown direction without a second
// import path.
pub use crate::io::Shutdown as ShutdownHow;
