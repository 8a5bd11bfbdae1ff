//! Socket plumbing shared by the end point kinds: non-blocking socket
//!  creation, the non-blocking connect dance, and the option twiddling
//!  (reuse-address, keepalive, linger, device binding) that `std` does not
//!  expose.

use std::io;
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use socket2::{SockAddr, SockRef, Socket, TcpKeepalive, Type};

use crate::addr::{InterfaceId, IpFamily, IpProtocol};

pub(crate) fn udp_socket(family: IpFamily, interface: Option<&InterfaceId>) -> io::Result<Socket> {
    let socket = Socket::new(family.domain(), Type::DGRAM, None)?;
    socket.set_nonblocking(true)?;
    if let Some(ifc) = interface {
        bind_device(&socket, ifc)?;
    }
    Ok(socket)
}

pub(crate) fn raw_socket(protocol: IpProtocol, interface: Option<&InterfaceId>) -> io::Result<Socket> {
    let socket = Socket::new(
        protocol.family().domain(),
        Type::RAW,
        Some(protocol.protocol()),
    )?;
    socket.set_nonblocking(true)?;
    if let Some(ifc) = interface {
        bind_device(&socket, ifc)?;
    }
    Ok(socket)
}

pub(crate) fn tcp_socket(family: IpFamily) -> io::Result<Socket> {
    let socket = Socket::new(family.domain(), Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

pub(crate) fn bind(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    socket.bind(&SockAddr::from(addr))
}

#[cfg(target_os = "linux")]
pub(crate) fn bind_device(socket: &Socket, interface: &InterfaceId) -> io::Result<()> {
    socket.bind_device(Some(interface.name().as_bytes()))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn bind_device(_socket: &Socket, _interface: &InterfaceId) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface binding is only supported on linux",
    ))
}

/// Initiates a non-blocking connect. `EINPROGRESS` is the expected outcome;
///  completion surfaces as writability, with the verdict in `SO_ERROR`.
pub(crate) fn start_connect(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e),
    }
}

fn with_sock_ref<S: AsRawFd, R>(socket: &S, f: impl FnOnce(SockRef<'_>) -> R) -> R {
    let fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
    f(SockRef::from(&fd))
}

/// Pending asynchronous error on the socket (`SO_ERROR`), consumed by the
///  read.
pub(crate) fn take_error<S: AsRawFd>(socket: &S) -> io::Result<Option<io::Error>> {
    with_sock_ref(socket, |s| s.take_error())
}

pub(crate) fn set_keepalive<S: AsRawFd>(
    socket: &S,
    interval_secs: u64,
    timeout_count: u32,
) -> io::Result<()> {
    let params = TcpKeepalive::new()
        .with_time(Duration::from_secs(interval_secs))
        .with_interval(Duration::from_secs(interval_secs))
        .with_retries(timeout_count);
    with_sock_ref(socket, |s| {
        s.set_tcp_keepalive(&params)?;
        s.set_keepalive(true)
    })
}

pub(crate) fn clear_keepalive<S: AsRawFd>(socket: &S) -> io::Result<()> {
    with_sock_ref(socket, |s| s.set_keepalive(false))
}

/// Half-closes the send direction (sends FIN); receives stay open.
pub(crate) fn shutdown_send<S: AsRawFd>(socket: &S) -> io::Result<()> {
    with_sock_ref(socket, |s| s.shutdown(Shutdown::Write))
}

/// Arms an abortive close: dropping the socket afterwards resets the
///  connection instead of lingering over unsent data.
pub(crate) fn set_abort_linger<S: AsRawFd>(socket: &S) -> io::Result<()> {
    with_sock_ref(socket, |s| s.set_linger(Some(Duration::ZERO)))
}

/// `recv_from` into an initialized buffer. The cast is sound because the
///  receive only ever writes bytes into the slice, and our buffers are
///  eagerly zeroed.
pub(crate) fn recv_from(socket: &Socket, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    let (n, addr) = socket.recv_from(uninit)?;
    Ok((n, addr.as_socket()))
}

pub(crate) fn send_to(socket: &Socket, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    socket.send_to(buf, &SockAddr::from(addr))
}
