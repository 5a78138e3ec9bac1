//! Transport abstraction for the protocol engine.
//!
//! The read loop owns one handle to the connection and the send path owns
//! another, so a send never waits for a blocked read. Closing interrupts the
//! read by shutting down the read direction.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// A connected, bidirectional byte stream that can be split into
/// independent handles.
pub trait Socket: Read + Write + Send + Sync + Sized + 'static {
    /// Another handle to the same underlying connection.
    fn try_clone(&self) -> io::Result<Self>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn write_timeout(&self) -> io::Result<Option<Duration>>;

    /// Best-effort latency tweak; transports without one ignore it.
    fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
        Ok(())
    }
}

impl Socket for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn write_timeout(&self) -> io::Result<Option<Duration>> {
        TcpStream::write_timeout(self)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }
}

#[cfg(unix)]
impl Socket for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, how)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }

    fn write_timeout(&self) -> io::Result<Option<Duration>> {
        std::os::unix::net::UnixStream::write_timeout(self)
    }
}

/// Lower the write timeout to at most `cap` and return the previous value.
pub(crate) fn cap_write_timeout<S: Socket>(
    socket: &S,
    cap: Duration,
) -> io::Result<Option<Duration>> {
    let previous = socket.write_timeout()?;
    let capped = match previous {
        Some(current) if current < cap => current,
        _ => cap,
    };
    socket.set_write_timeout(Some(capped))?;
    Ok(previous)
}
