//! Thin socket layer for the two-channel protocol.
//!
//! Listeners are built through socket2 so reuse-address is set before bind
//! (sessions cycle through the same data-port pool and must not trip over
//! TIME_WAIT remnants). Everything else stays on std types; raw `libc::poll`
//! drives the places where a thread waits on two sockets at once.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::error::{Error, Result};

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

/// TCP listener with reuse-address, ready to accept.
pub fn tcp_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(16)?;
    Ok(socket.into())
}

/// Bound UDP socket with reuse-address, not yet connected to a peer.
pub fn udp_bound(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Apply the session send/receive timeouts to a TCP stream.
pub fn apply_stream_timeouts(stream: &TcpStream, timeout: Duration) -> Result<()> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(())
}

/// Apply the session send/receive timeouts to a UDP socket.
pub fn apply_udp_timeouts(socket: &UdpSocket, timeout: Duration) -> Result<()> {
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;
    Ok(())
}

/// Accept one connection, or time out.
pub fn accept_timeout(listener: &TcpListener, timeout: Duration) -> Result<TcpStream> {
    wait_readable(listener.as_raw_fd(), timeout)?;
    let (stream, _) = listener.accept()?;
    Ok(stream)
}

/// Wait for the first datagram equal to `expect` and lock the socket onto its
/// sender. This is the UDP stand-in for accept: the client's READY datagram
/// both completes the handshake and tells us where to send.
pub fn udp_accept(socket: &UdpSocket, expect: &[u8]) -> Result<SocketAddr> {
    let mut buf = [0u8; 64];
    loop {
        let (n, peer) = socket.recv_from(&mut buf)?;
        if &buf[..n] == expect {
            socket.connect(peer)?;
            return Ok(peer);
        }
        tracing::debug!(from = %peer, len = n, "ignoring stray datagram before handshake");
    }
}

/// Read exactly `buf.len()` bytes from a stream. EOF mid-message is the
/// protocol's short-read abort, not an ordinary I/O error.
pub fn read_full(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    use std::io::Read;
    let wanted = buf.len();
    let mut got = 0;
    while got < wanted {
        match stream.read(&mut buf[got..]) {
            Ok(0) => return Err(Error::ShortRead { wanted, got }),
            Ok(n) => got += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Write all of `buf` to a stream.
pub fn write_full(stream: &mut TcpStream, buf: &[u8]) -> Result<()> {
    use std::io::Write;
    stream.write_all(buf)?;
    Ok(())
}

/// The per-session data channel. Chunks are opaque fixed-size records on
/// TCP and single datagrams on UDP.
#[derive(Debug)]
pub enum DataChannel {
    Tcp(TcpStream),
    /// Connected to the peer (server side: after [`udp_accept`]).
    Udp(UdpSocket),
}

impl DataChannel {
    /// Send one whole chunk. A short write is reported, never papered over.
    pub fn send_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        match self {
            DataChannel::Tcp(stream) => {
                use std::io::Write;
                let mut sent = 0;
                while sent < chunk.len() {
                    match stream.write(&chunk[sent..]) {
                        Ok(0) => {
                            return Err(Error::SendFailed {
                                bytes_sent: sent as u64,
                            })
                        }
                        Ok(n) => sent += n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => {
                            return Err(Error::SendFailed {
                                bytes_sent: sent as u64,
                            })
                        }
                    }
                }
                Ok(())
            }
            DataChannel::Udp(socket) => match socket.send(chunk) {
                Ok(n) if n == chunk.len() => Ok(()),
                Ok(n) => Err(Error::SendFailed {
                    bytes_sent: n as u64,
                }),
                Err(_) => Err(Error::SendFailed { bytes_sent: 0 }),
            },
        }
    }

    /// Receive one chunk into `buf`; returns the number of bytes that make
    /// up this chunk. Zero-length TCP reads mean the peer died.
    pub fn recv_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            DataChannel::Tcp(stream) => {
                read_full(stream, buf).map_err(|e| match e {
                    // EOF at a chunk boundary is still peer death mid-test.
                    Error::ShortRead { got: 0, .. } => Error::PeerDied,
                    other => other,
                })?;
                Ok(buf.len())
            }
            DataChannel::Udp(socket) => {
                let n = socket.recv(buf)?;
                if n == 0 {
                    return Err(Error::PeerDied);
                }
                Ok(n)
            }
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            DataChannel::Tcp(stream) => stream.as_raw_fd(),
            DataChannel::Udp(socket) => socket.as_raw_fd(),
        }
    }
}

/// Which of the two channels became readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollEvents {
    pub control: bool,
    pub data: bool,
}

/// Wait until the control or data socket is readable. Returns all-false on
/// timeout. EINTR restarts the wait.
pub fn poll_two(control: RawFd, data: RawFd, timeout: Duration) -> Result<PollEvents> {
    let mut fds = [
        libc::pollfd {
            fd: control,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: data,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, timeout.as_millis() as libc::c_int) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        }
        return Ok(PollEvents {
            control: fds[0].revents & (libc::POLLIN | libc::POLLHUP) != 0,
            data: fds[1].revents & (libc::POLLIN | libc::POLLHUP) != 0,
        });
    }
}

fn wait_readable(fd: RawFd, timeout: Duration) -> Result<()> {
    let mut fds = [libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout.as_millis() as libc::c_int) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        }
        if rc == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into());
        }
        return Ok(());
    }
}
