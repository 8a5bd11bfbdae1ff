//! The transport hub: this is where all other parts come together. It owns
//!  the end point pool, the buffer pool and the timer queue, exposes the
//!  operations of every end point kind, and drives everything from a single
//!  cooperative service loop.
//!
//! `service()` performs exactly one pass - poll readiness across all live
//!  end points, dispatch the resulting callbacks, then fire due timers - and
//!  returns to the caller. The core never spawns a thread or a task: the
//!  embedded current-thread runtime is only the I/O driver that readiness
//!  waits are parked on, and it runs solely inside `service()`.

use std::collections::BinaryHeap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use futures_util::future::{FutureExt, LocalBoxFuture};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, info, trace, warn};

use crate::addr::{InterfaceId, IpFamily, IpPacketInfo, IpProtocol};
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::packet_buf::PacketBuf;
use crate::config::NetConfig;
use crate::end_point_pool::{EndPointId, EndPointKind, EndPointPool, RawHandle, TcpHandle, UdpHandle};
use crate::error::{NetError, NetResult};
use crate::events::{RawEvents, TcpConnectionEvents, TcpListenerEvents, TimerCallback, UdpEvents};
use crate::raw_end_point::{filter_passes, RawEndPoint};
use crate::sys;
use crate::tcp_end_point::{CloseMode, TcpConnection, TcpEndPoint, TcpRole, TcpState};
use crate::udp_end_point::UdpEndPoint;

/// Cumulative counters for the external statistics / success-policy consumer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub end_points_in_use: usize,
    pub end_point_acquire_failures: u64,
    pub buffers_in_flight: usize,
}

/// Per end point byte counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct EndPointStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    callback: TimerCallback,
    context: u64,
}

// BinaryHeap is a max-heap; reverse the ordering so the earliest deadline
//  (lowest seq for ties) surfaces first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

enum Readiness {
    Sock { readable: bool, writable: bool },
    Incoming(tokio::net::TcpStream, SocketAddr),
    ConnectReady,
    AcceptFailed(io::Error),
    SockFailed(io::Error),
}

#[derive(Clone, Copy)]
enum KindTag {
    Udp,
    Raw,
    TcpListening,
    TcpConnecting,
    TcpConnected,
    TcpIdle,
}

pub struct Transport {
    config: NetConfig,
    pool: EndPointPool,
    buffers: BufferPool,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    bytes_sent: u64,
    bytes_received: u64,
    // declared last so sockets in the pool drop before their i/o driver
    runtime: tokio::runtime::Runtime,
}

impl Transport {
    pub fn new(config: NetConfig) -> NetResult<Transport> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| NetError::config("building the i/o driver", e))?;
        info!(
            "transport core ready: {} end point slots, {} byte buffers",
            config.max_end_points, config.buffer_capacity
        );
        Ok(Transport {
            pool: EndPointPool::new(config.max_end_points),
            buffers: BufferPool::new(&config),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            bytes_sent: 0,
            bytes_received: 0,
            config,
            runtime,
        })
    }

    // ----------------------------------- buffers

    pub fn alloc_buffer(&self, reserved: usize) -> NetResult<PacketBuf> {
        self.buffers.allocate(reserved)
    }

    pub fn alloc_buffer_sized(&self, capacity: usize, reserved: usize) -> NetResult<PacketBuf> {
        self.buffers.allocate_sized(capacity, reserved)
    }

    // ----------------------------------- end point lifecycle

    pub fn new_raw_end_point(&mut self, protocol: IpProtocol) -> NetResult<RawHandle> {
        let id = self
            .pool
            .acquire(EndPointKind::Raw(RawEndPoint::new(protocol)))?;
        debug!("created raw end point {:?} ({:?})", id, protocol);
        Ok(RawHandle(id))
    }

    pub fn new_udp_end_point(&mut self, family: IpFamily) -> NetResult<UdpHandle> {
        let id = self
            .pool
            .acquire(EndPointKind::Udp(UdpEndPoint::new(family)))?;
        debug!("created udp end point {:?} ({:?})", id, family);
        Ok(UdpHandle(id))
    }

    pub fn new_tcp_end_point(&mut self) -> NetResult<TcpHandle> {
        let id = self.pool.acquire(EndPointKind::Tcp(TcpEndPoint::new()))?;
        debug!("created tcp end point {:?}", id);
        Ok(TcpHandle(id))
    }

    pub fn raw_free(&mut self, ep: RawHandle) -> NetResult<()> {
        if self.pool.raw(ep.0).is_none() {
            return Err(NetError::stale_handle());
        }
        self.pool.release(ep.0);
        debug!("freed raw end point {:?}", ep.0);
        Ok(())
    }

    pub fn udp_free(&mut self, ep: UdpHandle) -> NetResult<()> {
        if self.pool.udp(ep.0).is_none() {
            return Err(NetError::stale_handle());
        }
        self.pool.release(ep.0);
        debug!("freed udp end point {:?}", ep.0);
        Ok(())
    }

    /// Abruptly releases the end point, whatever its state. Pending sends are
    ///  discarded, a live connection is reset, and no further callbacks fire.
    pub fn tcp_free(&mut self, ep: TcpHandle) -> NetResult<()> {
        if let Some(c) = self.pool.tcp_mut(ep.0).and_then(TcpEndPoint::connection_mut) {
            let _ = sys::set_abort_linger(&c.stream);
        }
        if self.pool.release(ep.0).is_none() {
            return Err(NetError::stale_handle());
        }
        debug!("freed tcp end point {:?}", ep.0);
        Ok(())
    }

    // ----------------------------------- raw end point operations

    pub fn raw_bind_interface(
        &mut self,
        ep: RawHandle,
        family: IpFamily,
        interface: InterfaceId,
    ) -> NetResult<()> {
        let raw = self.pool.raw_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        if raw.family() != family {
            return Err(NetError::InvalidArgument("address family mismatch"));
        }
        if raw.socket.is_some() {
            return Err(NetError::InvalidState(
                "interface binding must happen before bind or send",
            ));
        }
        raw.bound_interface = Some(interface);
        Ok(())
    }

    pub fn raw_bind(&mut self, ep: RawHandle, family: IpFamily, addr: IpAddr) -> NetResult<()> {
        {
            let raw = self.pool.raw(ep.0).ok_or_else(NetError::stale_handle)?;
            if raw.family() != family {
                return Err(NetError::InvalidArgument("address family mismatch"));
            }
            if !family.matches(&addr) {
                return Err(NetError::InvalidArgument(
                    "address does not match the end point family",
                ));
            }
            if raw.socket.is_some() {
                return Err(NetError::InvalidState("end point is already bound"));
            }
        }
        let (protocol, interface) = {
            let raw = self.pool.raw(ep.0).ok_or_else(NetError::stale_handle)?;
            (raw.protocol, raw.bound_interface.clone())
        };
        let socket = sys::raw_socket(protocol, interface.as_ref())
            .map_err(|e| NetError::config("creating raw socket", e))?;
        sys::bind(&socket, SocketAddr::new(addr, 0))
            .map_err(|e| NetError::config("binding raw socket", e))?;
        let fd = self.register_raw(socket)?;
        self.pool
            .raw_mut(ep.0)
            .ok_or_else(NetError::stale_handle)?
            .socket = Some(fd);
        info!("raw end point {:?} bound to {}", ep.0, addr);
        Ok(())
    }

    /// Restricts delivery to the given ICMP types; an empty slice removes the
    ///  filter again.
    pub fn raw_set_icmp_filter(&mut self, ep: RawHandle, allowed_types: &[u8]) -> NetResult<()> {
        let raw = self.pool.raw_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        if allowed_types.is_empty() {
            raw.filter = None;
        } else {
            let mut filter = bit_set::BitSet::with_capacity(256);
            for icmp_type in allowed_types {
                filter.insert(*icmp_type as usize);
            }
            raw.filter = Some(filter);
        }
        Ok(())
    }

    pub fn raw_listen(&mut self, ep: RawHandle, events: Box<dyn RawEvents>) -> NetResult<()> {
        let raw = self.pool.raw_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        if raw.socket.is_none() {
            return Err(NetError::InvalidState("listen requires a bound end point"));
        }
        if raw.listening {
            return Err(NetError::InvalidState("already listening"));
        }
        raw.listening = true;
        raw.events = Some(events);
        info!("raw end point {:?} listening", ep.0);
        Ok(())
    }

    /// Sends one datagram. Ownership of the buffer moves into the call; it is
    ///  released after transmission or failure.
    pub fn raw_send_to(&mut self, ep: RawHandle, addr: IpAddr, buffer: PacketBuf) -> NetResult<()> {
        {
            let raw = self.pool.raw(ep.0).ok_or_else(NetError::stale_handle)?;
            if !raw.family().matches(&addr) {
                return Err(NetError::InvalidArgument(
                    "address does not match the end point family",
                ));
            }
        }
        self.ensure_raw_socket(ep.0)?;
        let dest = SocketAddr::new(addr, 0);
        let queue_limit = self.config.datagram_send_queue_limit;
        let raw = self.pool.raw_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        let Some(fd) = raw.socket.as_ref() else {
            return Err(NetError::InvalidState("end point has no socket"));
        };
        let sent = match buffer.with_flat(|data| sys::send_to(fd.get_ref(), data, dest)) {
            Ok(n) => {
                raw.bytes_sent += n as u64;
                trace!("sent {} byte raw datagram to {}", n, addr);
                n
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if raw.send_queue.len() >= queue_limit {
                    return Err(NetError::ResourceExhausted("datagram send queue"));
                }
                debug!("raw socket busy, queueing datagram to {}", addr);
                raw.send_queue.push_back((dest, buffer));
                0
            }
            Err(e) => return Err(NetError::Peer(e)),
        };
        self.bytes_sent += sent as u64;
        Ok(())
    }

    pub fn raw_stats(&self, ep: RawHandle) -> NetResult<EndPointStats> {
        let raw = self.pool.raw(ep.0).ok_or_else(NetError::stale_handle)?;
        Ok(EndPointStats {
            bytes_sent: raw.bytes_sent,
            bytes_received: raw.bytes_received,
        })
    }

    // ----------------------------------- udp end point operations

    pub fn udp_bind_interface(
        &mut self,
        ep: UdpHandle,
        family: IpFamily,
        interface: InterfaceId,
    ) -> NetResult<()> {
        let udp = self.pool.udp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        if udp.family != family {
            return Err(NetError::InvalidArgument("address family mismatch"));
        }
        if udp.socket.is_some() {
            return Err(NetError::InvalidState(
                "interface binding must happen before bind or send",
            ));
        }
        udp.bound_interface = Some(interface);
        Ok(())
    }

    pub fn udp_bind(
        &mut self,
        ep: UdpHandle,
        family: IpFamily,
        addr: IpAddr,
        port: u16,
    ) -> NetResult<()> {
        {
            let udp = self.pool.udp(ep.0).ok_or_else(NetError::stale_handle)?;
            if udp.family != family {
                return Err(NetError::InvalidArgument("address family mismatch"));
            }
            if !family.matches(&addr) {
                return Err(NetError::InvalidArgument(
                    "address does not match the end point family",
                ));
            }
            if udp.socket.is_some() {
                return Err(NetError::InvalidState("end point is already bound"));
            }
        }
        let interface = self
            .pool
            .udp(ep.0)
            .and_then(|udp| udp.bound_interface.clone());
        let socket = sys::udp_socket(family, interface.as_ref())
            .map_err(|e| NetError::config("creating udp socket", e))?;
        sys::bind(&socket, SocketAddr::new(addr, port))
            .map_err(|e| NetError::config("binding udp socket", e))?;
        let socket = self.register_udp(socket)?;
        self.pool
            .udp_mut(ep.0)
            .ok_or_else(NetError::stale_handle)?
            .socket = Some(socket);
        info!("udp end point {:?} bound to {}:{}", ep.0, addr, port);
        Ok(())
    }

    /// Begins asynchronous receive: every arriving datagram is delivered
    ///  through the sink on a subsequent service pass.
    pub fn udp_listen(&mut self, ep: UdpHandle, events: Box<dyn UdpEvents>) -> NetResult<()> {
        let udp = self.pool.udp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        if udp.socket.is_none() {
            return Err(NetError::InvalidState("listen requires a bound end point"));
        }
        if udp.listening {
            return Err(NetError::InvalidState("already listening"));
        }
        udp.listening = true;
        udp.events = Some(events);
        info!("udp end point {:?} listening", ep.0);
        Ok(())
    }

    /// Sends one datagram, creating the socket with an ephemeral port if the
    ///  end point was never bound. Ownership of the buffer moves into the
    ///  call.
    pub fn udp_send_to(
        &mut self,
        ep: UdpHandle,
        addr: IpAddr,
        port: u16,
        buffer: PacketBuf,
    ) -> NetResult<()> {
        {
            let udp = self.pool.udp(ep.0).ok_or_else(NetError::stale_handle)?;
            if !udp.family.matches(&addr) {
                return Err(NetError::InvalidArgument(
                    "address does not match the end point family",
                ));
            }
        }
        self.ensure_udp_socket(ep.0)?;
        let dest = SocketAddr::new(addr, port);
        let queue_limit = self.config.datagram_send_queue_limit;
        let udp = self.pool.udp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        let Some(socket) = udp.socket.as_ref() else {
            return Err(NetError::InvalidState("end point has no socket"));
        };
        let sent = match buffer.with_flat(|data| socket.try_send_to(data, dest)) {
            Ok(n) => {
                udp.bytes_sent += n as u64;
                trace!("sent {} byte datagram to {}", n, dest);
                n
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if udp.send_queue.len() >= queue_limit {
                    return Err(NetError::ResourceExhausted("datagram send queue"));
                }
                debug!("udp socket busy, queueing datagram to {}", dest);
                udp.send_queue.push_back((dest, buffer));
                0
            }
            Err(e) => return Err(NetError::Peer(e)),
        };
        self.bytes_sent += sent as u64;
        Ok(())
    }

    pub fn udp_local_addr(&self, ep: UdpHandle) -> NetResult<SocketAddr> {
        let udp = self.pool.udp(ep.0).ok_or_else(NetError::stale_handle)?;
        let Some(socket) = udp.socket.as_ref() else {
            return Err(NetError::InvalidState("end point is not bound"));
        };
        socket
            .local_addr()
            .map_err(|e| NetError::config("reading local address", e))
    }

    pub fn udp_stats(&self, ep: UdpHandle) -> NetResult<EndPointStats> {
        let udp = self.pool.udp(ep.0).ok_or_else(NetError::stale_handle)?;
        Ok(EndPointStats {
            bytes_sent: udp.bytes_sent,
            bytes_received: udp.bytes_received,
        })
    }

    // ----------------------------------- tcp end point operations

    pub fn tcp_bind(
        &mut self,
        ep: TcpHandle,
        family: IpFamily,
        addr: IpAddr,
        port: u16,
        reuse_address: bool,
    ) -> NetResult<()> {
        {
            let tcp = self.pool.tcp(ep.0).ok_or_else(NetError::stale_handle)?;
            match &tcp.role {
                TcpRole::Idle { bound: None, .. } => {}
                TcpRole::Idle { bound: Some(_), .. } => {
                    return Err(NetError::InvalidState("end point is already bound"))
                }
                _ => return Err(NetError::InvalidState("bind requires a fresh end point")),
            }
        }
        if !family.matches(&addr) {
            return Err(NetError::InvalidArgument(
                "address does not match the requested family",
            ));
        }
        let socket = sys::tcp_socket(family).map_err(|e| NetError::config("creating tcp socket", e))?;
        socket
            .set_reuse_address(reuse_address)
            .map_err(|e| NetError::config("setting reuse-address", e))?;
        sys::bind(&socket, SocketAddr::new(addr, port))
            .map_err(|e| NetError::config("binding tcp socket", e))?;
        let tcp = self.pool.tcp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        tcp.role = TcpRole::Idle {
            bound: Some(socket),
            family: Some(family),
        };
        info!("tcp end point {:?} bound to {}:{}", ep.0, addr, port);
        Ok(())
    }

    /// Starts accepting connections. Every accepted connection takes a fresh
    ///  end point from the pool and arrives through `on_connection_received`;
    ///  when the pool is exhausted, the connection is rejected and
    ///  `on_accept_error` reports it.
    pub fn tcp_listen(
        &mut self,
        ep: TcpHandle,
        backlog: u32,
        events: Box<dyn TcpListenerEvents>,
    ) -> NetResult<()> {
        let socket = {
            let tcp = self.pool.tcp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
            match &mut tcp.role {
                TcpRole::Idle { bound, .. } => match bound.take() {
                    Some(socket) => socket,
                    None => {
                        return Err(NetError::InvalidState("listen requires a bound end point"))
                    }
                },
                _ => return Err(NetError::InvalidState("listen requires a bound end point")),
            }
        };
        socket
            .listen(backlog.min(i32::MAX as u32) as i32)
            .map_err(|e| NetError::config("listening on tcp socket", e))?;
        let std_listener: std::net::TcpListener = socket.into();
        let listener = {
            let _guard = self.runtime.enter();
            tokio::net::TcpListener::from_std(std_listener)
                .map_err(|e| NetError::config("registering tcp listener", e))?
        };
        let local = listener.local_addr().ok();
        let tcp = self.pool.tcp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        tcp.role = TcpRole::Listening {
            listener,
            events: Some(events),
        };
        info!("tcp end point {:?} listening on {:?}", ep.0, local);
        Ok(())
    }

    /// Starts a connection attempt. Completion - success or failure - arrives
    ///  through `on_connect_complete` on a later service pass; on failure the
    ///  end point is released by the implementation.
    pub fn tcp_connect(
        &mut self,
        ep: TcpHandle,
        addr: IpAddr,
        port: u16,
        interface: Option<&InterfaceId>,
        events: Box<dyn TcpConnectionEvents>,
    ) -> NetResult<()> {
        let bound = {
            let tcp = self.pool.tcp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
            match &mut tcp.role {
                TcpRole::Idle { bound, family } => {
                    if let Some(f) = family {
                        if !f.matches(&addr) {
                            return Err(NetError::InvalidArgument(
                                "destination family differs from the bound address",
                            ));
                        }
                    }
                    bound.take()
                }
                _ => {
                    return Err(NetError::InvalidState(
                        "connect requires a fresh or bound end point",
                    ))
                }
            }
        };
        let socket = match bound {
            Some(socket) => socket,
            None => sys::tcp_socket(IpFamily::of(&addr))
                .map_err(|e| NetError::config("creating tcp socket", e))?,
        };
        if let Some(ifc) = interface {
            sys::bind_device(&socket, ifc)
                .map_err(|e| NetError::config("binding to interface", e))?;
        }
        sys::start_connect(&socket, SocketAddr::new(addr, port))
            .map_err(|e| NetError::config("starting tcp connect", e))?;
        let std_stream: std::net::TcpStream = socket.into();
        let stream = {
            let _guard = self.runtime.enter();
            tokio::net::TcpStream::from_std(std_stream)
                .map_err(|e| NetError::config("registering tcp stream", e))?
        };
        let tcp = self.pool.tcp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        tcp.role = TcpRole::Connecting {
            stream,
            events: Some(events),
        };
        debug!("tcp end point {:?} connecting to {}:{}", ep.0, addr, port);
        Ok(())
    }

    /// Attaches the connection sink of an accepted end point. Until a sink is
    ///  attached, arriving data stays queued instead of being dropped.
    pub fn tcp_set_events(
        &mut self,
        ep: TcpHandle,
        events: Box<dyn TcpConnectionEvents>,
    ) -> NetResult<()> {
        let c = self.connection_of(ep)?;
        c.events = Some(events);
        if c.recv_pending.is_some() {
            c.redeliver = true;
        }
        Ok(())
    }

    /// Enqueues the buffer (or chain) for transmission. Actual sending is
    ///  flow controlled by the peer; `on_data_sent` reports progress and
    ///  `tcp_pending_send_len` exposes what is still queued.
    pub fn tcp_send(&mut self, ep: TcpHandle, buffer: PacketBuf) -> NetResult<()> {
        let limit = self.config.tcp_send_queue_limit;
        let tcp = self.pool.tcp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        if !tcp.can_send() {
            return Err(NetError::InvalidState(
                "send requires an established connection",
            ));
        }
        let Some(c) = tcp.connection_mut() else {
            return Err(NetError::InvalidState(
                "send requires an established connection",
            ));
        };
        let total = buffer.total_len();
        if total == 0 {
            return Ok(());
        }
        if c.pending_send_len + total > limit {
            return Err(NetError::ResourceExhausted("tcp send queue"));
        }
        let mut cursor = Some(buffer);
        while let Some(segment) = cursor {
            cursor = segment.take_next();
            if segment.data_len() == 0 {
                continue;
            }
            c.pending_send_len += segment.data_len();
            c.send_queue.push_back(segment);
        }
        trace!("queued {} bytes on tcp end point {:?}", total, ep.0);
        Ok(())
    }

    /// Unflushed bytes in the send queue.
    pub fn tcp_pending_send_len(&self, ep: TcpHandle) -> usize {
        self.pool
            .tcp(ep.0)
            .and_then(TcpEndPoint::connection)
            .map_or(0, |c| c.pending_send_len)
    }

    /// Acknowledges `len` consumed bytes, re-opening that much of the receive
    ///  window.
    pub fn tcp_ack_receive(&mut self, ep: TcpHandle, len: usize) -> NetResult<()> {
        let c = self.connection_of(ep)?;
        if len > c.unacked_recv {
            return Err(NetError::InvalidArgument(
                "acknowledging more than was delivered",
            ));
        }
        c.unacked_recv -= len;
        if c.recv_pending.is_some() {
            c.redeliver = true;
        }
        Ok(())
    }

    /// Re-queues a delivered-but-unconsumed buffer for in-order redelivery.
    ///  `None` is a no-op. Redelivery happens when new data arrives, receives
    ///  are re-enabled, or the window re-opens through an ack.
    pub fn tcp_put_back_received_data(
        &mut self,
        ep: TcpHandle,
        buffer: Option<PacketBuf>,
    ) -> NetResult<()> {
        let c = self.connection_of(ep)?;
        let Some(buffer) = buffer else { return Ok(()) };
        if c.recv_pending.is_some() {
            return Err(NetError::InvalidState("receive data was already put back"));
        }
        let total = buffer.total_len();
        if total > c.unacked_recv {
            return Err(NetError::InvalidArgument(
                "putting back more than was delivered",
            ));
        }
        c.unacked_recv -= total;
        c.recv_pending = Some(buffer);
        Ok(())
    }

    /// Bytes currently parked for redelivery.
    pub fn tcp_pending_receive_len(&self, ep: TcpHandle) -> usize {
        self.pool
            .tcp(ep.0)
            .and_then(TcpEndPoint::connection)
            .map_or(0, TcpConnection::pending_receive_len)
    }

    pub fn tcp_enable_receive(&mut self, ep: TcpHandle) -> NetResult<()> {
        let c = self.connection_of(ep)?;
        c.receive_enabled = true;
        if c.recv_pending.is_some() {
            c.redeliver = true;
        }
        Ok(())
    }

    /// Suspends delivery; arriving data stays queued (here or in the kernel),
    ///  it is never dropped.
    pub fn tcp_disable_receive(&mut self, ep: TcpHandle) -> NetResult<()> {
        let c = self.connection_of(ep)?;
        c.receive_enabled = false;
        Ok(())
    }

    /// Half-closes the send direction once all queued data is flushed.
    pub fn tcp_shutdown_send(&mut self, ep: TcpHandle) -> NetResult<()> {
        let tcp = self.pool.tcp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        if !tcp.can_send() {
            return Err(NetError::InvalidState(
                "shutdown requires an established connection",
            ));
        }
        let Some(c) = tcp.connection_mut() else {
            return Err(NetError::InvalidState(
                "shutdown requires an established connection",
            ));
        };
        if c.send_shutdown_requested {
            return Ok(());
        }
        c.send_shutdown_requested = true;
        if c.send_queue.is_empty() {
            sys::shutdown_send(&c.stream).map_err(|e| NetError::config("shutting down send", e))?;
            c.fin_sent = true;
            debug!("tcp end point {:?} send direction shut down", ep.0);
        }
        Ok(())
    }

    /// Graceful close: flushes pending sends first, then closes and releases
    ///  the end point. Listeners and pending connects are released outright.
    pub fn tcp_close(&mut self, ep: TcpHandle) -> NetResult<()> {
        enum Action {
            Already,
            Flush,
            Now,
        }
        let action = {
            let tcp = self.pool.tcp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
            match &mut tcp.role {
                TcpRole::Connected(c) => {
                    if c.close_mode.is_some() {
                        Action::Already
                    } else if c.send_queue.is_empty() {
                        Action::Now
                    } else {
                        debug!(
                            "closing tcp end point {:?} after flushing {} bytes",
                            ep.0, c.pending_send_len
                        );
                        c.close_mode = Some(CloseMode::Graceful);
                        Action::Flush
                    }
                }
                _ => Action::Now,
            }
        };
        if matches!(action, Action::Now) {
            self.release_tcp(ep.0);
        }
        Ok(())
    }

    /// Immediate close: discards pending sends and resets the connection.
    pub fn tcp_abort(&mut self, ep: TcpHandle) -> NetResult<()> {
        {
            let tcp = self.pool.tcp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
            let Some(c) = tcp.connection_mut() else {
                return Err(NetError::InvalidState("abort requires a connection"));
            };
            c.send_queue.clear();
            c.pending_send_len = 0;
            if let Err(e) = sys::set_abort_linger(&c.stream) {
                debug!("failed to arm abortive close: {}", e);
            }
        }
        self.release_tcp(ep.0);
        Ok(())
    }

    /// Keepalive probing every `interval_secs`, declaring the peer dead after
    ///  `timeout_count` unanswered probes. Legal only while fully `Connected`.
    pub fn tcp_enable_keepalive(
        &mut self,
        ep: TcpHandle,
        interval_secs: u64,
        timeout_count: u32,
    ) -> NetResult<()> {
        let tcp = self.pool.tcp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        if tcp.state() != TcpState::Connected {
            return Err(NetError::InvalidState(
                "keepalive requires a fully open connection",
            ));
        }
        let Some(c) = tcp.connection_mut() else {
            return Err(NetError::InvalidState(
                "keepalive requires a fully open connection",
            ));
        };
        sys::set_keepalive(&c.stream, interval_secs, timeout_count)
            .map_err(|e| NetError::config("enabling keepalive", e))?;
        c.keepalive = true;
        debug!("keepalive enabled on tcp end point {:?}", ep.0);
        Ok(())
    }

    pub fn tcp_disable_keepalive(&mut self, ep: TcpHandle) -> NetResult<()> {
        let tcp = self.pool.tcp_mut(ep.0).ok_or_else(NetError::stale_handle)?;
        if tcp.state() != TcpState::Connected {
            return Err(NetError::InvalidState(
                "keepalive requires a fully open connection",
            ));
        }
        let Some(c) = tcp.connection_mut() else {
            return Err(NetError::InvalidState(
                "keepalive requires a fully open connection",
            ));
        };
        sys::clear_keepalive(&c.stream)
            .map_err(|e| NetError::config("disabling keepalive", e))?;
        c.keepalive = false;
        Ok(())
    }

    /// The derived connection state; released handles report `Closed`.
    pub fn tcp_state(&self, ep: TcpHandle) -> TcpState {
        self.pool
            .tcp(ep.0)
            .map_or(TcpState::Closed, TcpEndPoint::state)
    }

    pub fn tcp_peer_info(&self, ep: TcpHandle) -> NetResult<SocketAddr> {
        self.pool
            .tcp(ep.0)
            .ok_or_else(NetError::stale_handle)?
            .connection()
            .map(|c| c.peer)
            .ok_or(NetError::InvalidState("no connection"))
    }

    pub fn tcp_local_addr(&self, ep: TcpHandle) -> NetResult<SocketAddr> {
        let tcp = self.pool.tcp(ep.0).ok_or_else(NetError::stale_handle)?;
        let addr = match &tcp.role {
            TcpRole::Idle { bound: Some(socket), .. } => socket
                .local_addr()
                .map_err(|e| NetError::config("reading local address", e))?
                .as_socket(),
            TcpRole::Listening { listener, .. } => listener.local_addr().ok(),
            TcpRole::Connecting { stream, .. } => stream.local_addr().ok(),
            TcpRole::Connected(c) => c.stream.local_addr().ok(),
            TcpRole::Idle { bound: None, .. } => {
                return Err(NetError::InvalidState("end point is not bound"))
            }
        };
        addr.ok_or(NetError::InvalidState("no local address"))
    }

    pub fn tcp_stats(&self, ep: TcpHandle) -> NetResult<EndPointStats> {
        let tcp = self.pool.tcp(ep.0).ok_or_else(NetError::stale_handle)?;
        Ok(tcp.connection().map_or_else(EndPointStats::default, |c| {
            EndPointStats {
                bytes_sent: c.bytes_sent,
                bytes_received: c.bytes_received,
            }
        }))
    }

    // ----------------------------------- timers

    /// Schedules a one-shot timer. A still-pending timer with the same
    ///  `(callback, context)` identity is replaced.
    pub fn start_timer(&mut self, delay: Duration, callback: TimerCallback, context: u64) {
        self.cancel_timer(callback, context);
        self.timer_seq += 1;
        self.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.timer_seq,
            callback,
            context,
        });
        trace!("timer scheduled in {:?} (context {})", delay, context);
    }

    /// Cancels the pending timer with this identity; doing nothing if there
    ///  is none.
    pub fn cancel_timer(&mut self, callback: TimerCallback, context: u64) {
        self.timers
            .retain(|t| !(t.callback as usize == callback as usize && t.context == context));
    }

    // ----------------------------------- statistics

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            end_points_in_use: self.pool.in_use(),
            end_point_acquire_failures: self.pool.acquire_failures(),
            buffers_in_flight: self.buffers.in_flight(),
        }
    }

    // ----------------------------------- the service loop

    /// One cooperative pass: wait up to `timeout` for readiness, dispatch the
    ///  resulting end point callbacks, then fire due timers. Returns the
    ///  number of dispatched events. Callbacks may re-enter the transport;
    ///  such work takes effect on a subsequent pass.
    pub fn service(&mut self, timeout: Duration) -> NetResult<usize> {
        let pass_start = Instant::now();
        let immediate = self.collect_immediate();
        let wait = if immediate.is_empty() {
            self.wait_capped_by_timers(timeout, pass_start)
        } else {
            Duration::ZERO
        };
        let ready = self.poll_readiness(wait);

        let mut dispatched = 0;
        for id in immediate {
            dispatched += self.dispatch_immediate(id);
        }
        for (id, readiness) in ready {
            dispatched += self.dispatch_ready(id, readiness);
        }
        dispatched += self.fire_due_timers(Instant::now());
        Ok(dispatched)
    }

    fn wait_capped_by_timers(&self, timeout: Duration, now: Instant) -> Duration {
        match self.timers.peek() {
            Some(next) => timeout.min(next.deadline.saturating_duration_since(now)),
            None => timeout,
        }
    }

    fn poll_readiness(&self, wait: Duration) -> Vec<(EndPointId, Readiness)> {
        let pool = &self.pool;
        let window = self.config.tcp_receive_window;
        self.runtime.block_on(async move {
            let mut futures: FuturesUnordered<LocalBoxFuture<'_, (EndPointId, Readiness)>> =
                FuturesUnordered::new();
            for (id, ep) in pool.iter() {
                push_readiness(id, ep, window, &mut futures);
            }
            let mut ready = Vec::new();
            if futures.is_empty() {
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                return ready;
            }
            tokio::select! {
                biased;
                first = futures.next() => {
                    if let Some(r) = first {
                        ready.push(r);
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    return ready;
                }
            }
            // collect whatever else is ready right now, without waiting
            while let Some(Some(r)) = futures.next().now_or_never() {
                ready.push(r);
            }
            ready
        })
    }

    fn kind_tag(&self, id: EndPointId) -> Option<KindTag> {
        Some(match self.pool.get(id)? {
            EndPointKind::Udp(_) => KindTag::Udp,
            EndPointKind::Raw(_) => KindTag::Raw,
            EndPointKind::Tcp(t) => match &t.role {
                TcpRole::Idle { .. } => KindTag::TcpIdle,
                TcpRole::Listening { .. } => KindTag::TcpListening,
                TcpRole::Connecting { .. } => KindTag::TcpConnecting,
                TcpRole::Connected(_) => KindTag::TcpConnected,
            },
        })
    }

    fn dispatch_ready(&mut self, id: EndPointId, readiness: Readiness) -> usize {
        match readiness {
            Readiness::Incoming(stream, peer) => self.tcp_dispatch_incoming(id, stream, peer),
            Readiness::AcceptFailed(e) => self.tcp_dispatch_accept_error(id, e),
            Readiness::ConnectReady => self.tcp_dispatch_connect_ready(id),
            Readiness::SockFailed(e) => self.dispatch_socket_error(id, e),
            Readiness::Sock { readable, writable } => {
                let Some(tag) = self.kind_tag(id) else { return 0 };
                let mut events = 0;
                match tag {
                    KindTag::Udp => {
                        if writable {
                            events += self.udp_dispatch_writable(id);
                        }
                        if readable {
                            events += self.udp_dispatch_readable(id);
                        }
                    }
                    KindTag::Raw => {
                        if writable {
                            events += self.raw_dispatch_writable(id);
                        }
                        if readable {
                            events += self.raw_dispatch_readable(id);
                        }
                    }
                    KindTag::TcpConnected => {
                        if writable {
                            events += self.tcp_dispatch_writable(id);
                        }
                        if readable {
                            events += self.tcp_dispatch_readable(id);
                        }
                    }
                    KindTag::TcpConnecting => {
                        if writable {
                            events += self.tcp_dispatch_connect_ready(id);
                        }
                    }
                    KindTag::TcpListening | KindTag::TcpIdle => {}
                }
                events
            }
        }
    }

    // --------------- udp dispatch

    fn udp_dispatch_readable(&mut self, id: EndPointId) -> usize {
        enum Step {
            Datagram(PacketBuf, IpPacketInfo),
            Drained,
            NoBuffer(NetError),
            Failed(NetError),
        }
        let max_per_pass = self.config.max_datagrams_per_pass;
        let mut sink = match self.pool.udp_mut(id) {
            Some(udp) => udp.events.take(),
            None => return 0,
        };
        if sink.is_none() {
            return 0;
        }
        let mut events = 0;
        for _ in 0..max_per_pass {
            let step = {
                let Some(udp) = self.pool.udp_mut(id) else { break };
                let UdpEndPoint {
                    socket,
                    bound_interface,
                    bytes_received,
                    ..
                } = udp;
                let Some(socket) = socket.as_ref() else { break };
                match self.buffers.allocate(0) {
                    Err(e) => Step::NoBuffer(e),
                    Ok(buf) => match buf.fill_with(|space| socket.try_recv_from(space)) {
                        Ok(from) => {
                            let n = buf.data_len();
                            *bytes_received += n as u64;
                            let local = socket.local_addr().ok();
                            let info = IpPacketInfo {
                                src_addr: from.ip(),
                                src_port: from.port(),
                                dest_addr: local.map(|a| a.ip()),
                                dest_port: local.map_or(0, |a| a.port()),
                                interface: bound_interface.clone(),
                            };
                            Step::Datagram(buf, info)
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Step::Drained,
                        Err(e) => Step::Failed(NetError::Peer(e)),
                    },
                }
            };
            match step {
                Step::Datagram(buf, info) => {
                    let n = buf.data_len();
                    self.bytes_received += n as u64;
                    trace!("udp end point {:?}: {} byte datagram", id, n);
                    if let Some(s) = sink.as_mut() {
                        s.on_message_received(self, UdpHandle(id), buf, info);
                    }
                    events += 1;
                }
                Step::Drained => break,
                Step::NoBuffer(e) | Step::Failed(e) => {
                    debug!("udp end point {:?} receive error: {}", id, e);
                    if let Some(s) = sink.as_mut() {
                        s.on_receive_error(self, UdpHandle(id), e, None);
                    }
                    events += 1;
                    break;
                }
            }
        }
        if let Some(udp) = self.pool.udp_mut(id) {
            if udp.events.is_none() {
                udp.events = sink;
            }
        }
        events
    }

    fn udp_dispatch_writable(&mut self, id: EndPointId) -> usize {
        let mut sent_total = 0usize;
        {
            let Some(udp) = self.pool.udp_mut(id) else { return 0 };
            let UdpEndPoint {
                socket,
                send_queue,
                bytes_sent,
                ..
            } = udp;
            let Some(socket) = socket.as_ref() else { return 0 };
            while let Some((dest, buf)) = send_queue
                .front()
                .map(|(d, b)| (*d, b.clone()))
            {
                match buf.with_flat(|data| socket.try_send_to(data, dest)) {
                    Ok(n) => {
                        *bytes_sent += n as u64;
                        sent_total += n;
                        send_queue.pop_front();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("dropping queued datagram to {}: {}", dest, e);
                        send_queue.pop_front();
                    }
                }
            }
        }
        self.bytes_sent += sent_total as u64;
        0
    }

    // --------------- raw dispatch

    fn raw_dispatch_readable(&mut self, id: EndPointId) -> usize {
        enum Step {
            Datagram(PacketBuf, IpPacketInfo),
            Filtered,
            Drained,
            NoBuffer(NetError),
            Failed(NetError),
        }
        let max_per_pass = self.config.max_datagrams_per_pass;
        let mut sink = match self.pool.raw_mut(id) {
            Some(raw) => raw.events.take(),
            None => return 0,
        };
        if sink.is_none() {
            return 0;
        }
        let mut events = 0;
        for _ in 0..max_per_pass {
            let step = {
                let Some(raw) = self.pool.raw_mut(id) else { break };
                let family = raw.family();
                let RawEndPoint {
                    socket,
                    filter,
                    bound_interface,
                    bytes_received,
                    ..
                } = raw;
                let Some(fd) = socket.as_ref() else { break };
                match fd.readable().now_or_never() {
                    None => Step::Drained,
                    Some(Err(e)) => Step::Failed(NetError::Peer(e)),
                    Some(Ok(mut guard)) => match self.buffers.allocate(0) {
                        Err(e) => Step::NoBuffer(e),
                        Ok(buf) => {
                            match guard.try_io(|afd| {
                                buf.fill_with(|space| sys::recv_from(afd.get_ref(), space))
                            }) {
                                Err(_) => Step::Drained,
                                Ok(Err(e)) => Step::Failed(NetError::Peer(e)),
                                Ok(Ok(from)) => {
                                    let passes =
                                        buf.with_data(|d| filter_passes(family, filter.as_ref(), d));
                                    if !passes {
                                        trace!("dropping filtered icmp packet");
                                        Step::Filtered
                                    } else {
                                        let n = buf.data_len();
                                        *bytes_received += n as u64;
                                        let info = IpPacketInfo {
                                            src_addr: from
                                                .map_or(family.unspecified(), |a| a.ip()),
                                            src_port: 0,
                                            dest_addr: fd
                                                .get_ref()
                                                .local_addr()
                                                .ok()
                                                .and_then(|a| a.as_socket())
                                                .map(|a| a.ip()),
                                            dest_port: 0,
                                            interface: bound_interface.clone(),
                                        };
                                        Step::Datagram(buf, info)
                                    }
                                }
                            }
                        }
                    },
                }
            };
            match step {
                Step::Datagram(buf, info) => {
                    let n = buf.data_len();
                    self.bytes_received += n as u64;
                    trace!("raw end point {:?}: {} byte packet", id, n);
                    if let Some(s) = sink.as_mut() {
                        s.on_message_received(self, RawHandle(id), buf, info);
                    }
                    events += 1;
                }
                Step::Filtered => continue,
                Step::Drained => break,
                Step::NoBuffer(e) | Step::Failed(e) => {
                    debug!("raw end point {:?} receive error: {}", id, e);
                    if let Some(s) = sink.as_mut() {
                        s.on_receive_error(self, RawHandle(id), e, None);
                    }
                    events += 1;
                    break;
                }
            }
        }
        if let Some(raw) = self.pool.raw_mut(id) {
            if raw.events.is_none() {
                raw.events = sink;
            }
        }
        events
    }

    fn raw_dispatch_writable(&mut self, id: EndPointId) -> usize {
        let mut sent_total = 0usize;
        {
            let Some(raw) = self.pool.raw_mut(id) else { return 0 };
            let RawEndPoint {
                socket,
                send_queue,
                bytes_sent,
                ..
            } = raw;
            let Some(fd) = socket.as_ref() else { return 0 };
            loop {
                let Some((dest, buf)) = send_queue.front().map(|(d, b)| (*d, b.clone())) else {
                    break;
                };
                let Some(guard_res) = fd.writable().now_or_never() else { break };
                let Ok(mut guard) = guard_res else { break };
                match guard.try_io(|afd| buf.with_flat(|data| sys::send_to(afd.get_ref(), data, dest)))
                {
                    Err(_) => break,
                    Ok(Ok(n)) => {
                        *bytes_sent += n as u64;
                        sent_total += n;
                        send_queue.pop_front();
                    }
                    Ok(Err(e)) => {
                        warn!("dropping queued raw datagram to {}: {}", dest, e);
                        send_queue.pop_front();
                    }
                }
            }
        }
        self.bytes_sent += sent_total as u64;
        0
    }

    // --------------- tcp dispatch

    fn tcp_dispatch_incoming(
        &mut self,
        id: EndPointId,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
    ) -> usize {
        let sink = match self.pool.tcp_mut(id) {
            Some(tcp) => match &mut tcp.role {
                TcpRole::Listening { events, .. } => events.take(),
                _ => None,
            },
            None => None,
        };
        let Some(mut sink) = sink else {
            // the listener went away mid-pass; the connection is rejected
            drop(stream);
            return 0;
        };
        let connection = TcpConnection::new(stream, peer, None);
        let result = self
            .pool
            .acquire(EndPointKind::Tcp(TcpEndPoint::connected(connection)));
        match result {
            Ok(conn_id) => {
                info!("accepted tcp connection from {}", peer);
                sink.on_connection_received(self, TcpHandle(id), TcpHandle(conn_id), peer);
            }
            Err(e) => {
                warn!("rejecting inbound tcp connection from {}: {}", peer, e);
                sink.on_accept_error(self, TcpHandle(id), e);
            }
        }
        if let Some(tcp) = self.pool.tcp_mut(id) {
            if let TcpRole::Listening { events, .. } = &mut tcp.role {
                if events.is_none() {
                    *events = Some(sink);
                }
            }
        }
        1
    }

    fn tcp_dispatch_accept_error(&mut self, id: EndPointId, e: io::Error) -> usize {
        let sink = match self.pool.tcp_mut(id) {
            Some(tcp) => match &mut tcp.role {
                TcpRole::Listening { events, .. } => events.take(),
                _ => None,
            },
            None => None,
        };
        let Some(mut sink) = sink else { return 0 };
        warn!("tcp accept failed: {}", e);
        sink.on_accept_error(self, TcpHandle(id), NetError::Peer(e));
        if let Some(tcp) = self.pool.tcp_mut(id) {
            if let TcpRole::Listening { events, .. } = &mut tcp.role {
                if events.is_none() {
                    *events = Some(sink);
                }
            }
        }
        1
    }

    fn tcp_dispatch_connect_ready(&mut self, id: EndPointId) -> usize {
        let verdict: Result<(), io::Error> = {
            let Some(tcp) = self.pool.tcp_mut(id) else { return 0 };
            let TcpRole::Connecting { stream, .. } = &tcp.role else { return 0 };
            match sys::take_error(stream) {
                Ok(Some(e)) => Err(e),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
        };
        let h = TcpHandle(id);
        match verdict {
            Ok(()) => {
                let (mut sink, peer_res) = {
                    let Some(tcp) = self.pool.tcp_mut(id) else { return 0 };
                    let role = std::mem::replace(
                        &mut tcp.role,
                        TcpRole::Idle {
                            bound: None,
                            family: None,
                        },
                    );
                    match role {
                        TcpRole::Connecting { stream, events } => match stream.peer_addr() {
                            Ok(peer) => {
                                tcp.role = TcpRole::Connected(TcpConnection::new(
                                    stream, peer, None,
                                ));
                                (events, Ok(peer))
                            }
                            Err(e) => (events, Err(e)),
                        },
                        other => {
                            tcp.role = other;
                            return 0;
                        }
                    }
                };
                match peer_res {
                    Ok(peer) => {
                        info!("tcp connection established to {}", peer);
                        if let Some(s) = sink.as_mut() {
                            s.on_connect_complete(self, h, Ok(()));
                        }
                        if let Some(c) =
                            self.pool.tcp_mut(id).and_then(TcpEndPoint::connection_mut)
                        {
                            if c.events.is_none() {
                                c.events = sink;
                            }
                        }
                        1
                    }
                    Err(e) => {
                        warn!("tcp connect failed: {}", e);
                        self.release_tcp(id);
                        if let Some(s) = sink.as_mut() {
                            s.on_connect_complete(self, h, Err(NetError::Peer(e)));
                        }
                        1
                    }
                }
            }
            Err(e) => {
                warn!("tcp connect failed: {}", e);
                let mut sink = match self.pool.tcp_mut(id) {
                    Some(tcp) => match &mut tcp.role {
                        TcpRole::Connecting { events, .. } => events.take(),
                        _ => None,
                    },
                    None => None,
                };
                self.release_tcp(id);
                if let Some(s) = sink.as_mut() {
                    s.on_connect_complete(self, h, Err(NetError::Peer(e)));
                }
                1
            }
        }
    }

    fn tcp_dispatch_writable(&mut self, id: EndPointId) -> usize {
        enum Finalize {
            Keep,
            Silent,
            Converged,
            PeerFailed(io::Error),
        }
        let mut sink = match self.pool.tcp_mut(id).and_then(TcpEndPoint::connection_mut) {
            Some(c) => c.events.take(),
            None => return 0,
        };
        let (sent_total, finalize) = {
            let Some(c) = self.pool.tcp_mut(id).and_then(TcpEndPoint::connection_mut) else {
                return 0;
            };
            let mut sent_total = 0usize;
            let mut failed: Option<io::Error> = None;
            while let Some(front) = c.send_queue.front().map(PacketBuf::clone) {
                if front.data_len() == 0 {
                    c.send_queue.pop_front();
                    continue;
                }
                match front.with_data(|data| c.stream.try_write(data)) {
                    Ok(0) => break,
                    Ok(n) => {
                        let _ = front.consume_head(n);
                        sent_total += n;
                        if front.data_len() == 0 {
                            c.send_queue.pop_front();
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            c.pending_send_len -= sent_total;
            c.bytes_sent += sent_total as u64;
            let mut finalize = Finalize::Keep;
            if let Some(e) = failed {
                finalize = Finalize::PeerFailed(e);
            } else if c.send_queue.is_empty() {
                if c.send_shutdown_requested && !c.fin_sent {
                    match sys::shutdown_send(&c.stream) {
                        Ok(()) => {
                            c.fin_sent = true;
                            debug!("tcp end point {:?} send direction shut down", id);
                        }
                        Err(e) => finalize = Finalize::PeerFailed(e),
                    }
                }
                if matches!(finalize, Finalize::Keep) {
                    if c.close_mode == Some(CloseMode::Graceful) {
                        finalize = Finalize::Silent;
                    } else if c.fin_sent && c.recv_eof {
                        finalize = Finalize::Converged;
                    }
                }
            }
            (sent_total, finalize)
        };
        self.bytes_sent += sent_total as u64;
        let h = TcpHandle(id);
        let mut events = 0;
        if sent_total > 0 {
            trace!("tcp end point {:?}: {} bytes accepted by transport", id, sent_total);
            if let Some(s) = sink.as_mut() {
                s.on_data_sent(self, h, sent_total);
                events += 1;
            }
        }
        match finalize {
            Finalize::Keep => {
                if let Some(c) = self.pool.tcp_mut(id).and_then(TcpEndPoint::connection_mut) {
                    if c.events.is_none() {
                        c.events = sink;
                    }
                }
            }
            Finalize::Silent => {
                self.release_tcp(id);
            }
            Finalize::Converged => {
                self.release_tcp(id);
                if let Some(s) = sink.as_mut() {
                    s.on_connection_closed(self, h, Ok(()));
                    events += 1;
                }
            }
            Finalize::PeerFailed(e) => {
                warn!("tcp send failed: {}", e);
                self.release_tcp(id);
                if let Some(s) = sink.as_mut() {
                    s.on_connection_closed(self, h, Err(NetError::Peer(e)));
                    events += 1;
                }
            }
        }
        events
    }

    fn tcp_dispatch_readable(&mut self, id: EndPointId) -> usize {
        let mut sink = match self.pool.tcp_mut(id).and_then(TcpEndPoint::connection_mut) {
            Some(c) => c.events.take(),
            None => return 0,
        };
        let window = self.config.tcp_receive_window;
        let chunk = self.config.buffer_capacity;
        let (chain, got_eof, read_err) = {
            let Some(c) = self.pool.tcp_mut(id).and_then(TcpEndPoint::connection_mut) else {
                return 0;
            };
            let mut chain = c.recv_pending.take();
            c.redeliver = false;
            let mut got_eof = false;
            let mut read_err: Option<io::Error> = None;
            loop {
                let space = window
                    .saturating_sub(c.unacked_recv + chain.as_ref().map_or(0, PacketBuf::total_len));
                if space == 0 {
                    break;
                }
                let buf = match self.buffers.allocate(0) {
                    Ok(buf) => buf,
                    Err(_) => {
                        debug!("out of buffers, deferring tcp read");
                        break;
                    }
                };
                let limit = space.min(chunk);
                let res = buf.fill_with(|space| {
                    let cap = limit.min(space.len());
                    c.stream.try_read(&mut space[..cap]).map(|n| (n, ()))
                });
                match res {
                    Ok(()) => {
                        let n = buf.data_len();
                        if n == 0 {
                            got_eof = true;
                            break;
                        }
                        c.bytes_received += n as u64;
                        match &chain {
                            Some(head) => head.append(buf),
                            None => chain = Some(buf),
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        read_err = Some(e);
                        break;
                    }
                }
            }
            if let Some(ch) = &chain {
                c.unacked_recv += ch.total_len();
            }
            (chain, got_eof, read_err)
        };

        let h = TcpHandle(id);
        let mut events = 0;
        if let Some(chain) = chain {
            self.bytes_received += chain.total_len() as u64;
            match sink.as_mut() {
                Some(s) => {
                    trace!("tcp end point {:?}: delivering {} bytes", id, chain.total_len());
                    s.on_data_received(self, h, chain);
                    events += 1;
                }
                None => {
                    // no sink to deliver to - park the data instead of dropping it
                    if let Some(c) = self.pool.tcp_mut(id).and_then(TcpEndPoint::connection_mut) {
                        let total = chain.total_len();
                        c.unacked_recv = c.unacked_recv.saturating_sub(total);
                        c.recv_pending = Some(chain);
                    }
                }
            }
        }
        if let Some(e) = read_err {
            warn!("tcp receive failed: {}", e);
            self.release_tcp(id);
            if let Some(s) = sink.as_mut() {
                s.on_connection_closed(self, h, Err(NetError::Peer(e)));
                events += 1;
            }
            return events;
        }
        if got_eof {
            let mut finalize = false;
            let mut newly_eof = false;
            if let Some(c) = self.pool.tcp_mut(id).and_then(TcpEndPoint::connection_mut) {
                if !c.recv_eof {
                    c.recv_eof = true;
                    newly_eof = true;
                    debug!("tcp end point {:?}: peer half-closed", id);
                }
                finalize = c.fin_sent && c.send_queue.is_empty();
            }
            if finalize {
                self.release_tcp(id);
                if let Some(s) = sink.as_mut() {
                    s.on_connection_closed(self, h, Ok(()));
                    events += 1;
                }
                return events;
            }
            if newly_eof {
                if let Some(s) = sink.as_mut() {
                    s.on_peer_close(self, h);
                    events += 1;
                }
            }
        }
        if let Some(c) = self.pool.tcp_mut(id).and_then(TcpEndPoint::connection_mut) {
            if c.events.is_none() {
                c.events = sink;
            }
        }
        events
    }

    fn dispatch_socket_error(&mut self, id: EndPointId, e: io::Error) -> usize {
        let Some(tag) = self.kind_tag(id) else { return 0 };
        match tag {
            KindTag::Udp => {
                let mut sink = self.pool.udp_mut(id).and_then(|udp| udp.events.take());
                let mut events = 0;
                if let Some(s) = sink.as_mut() {
                    s.on_receive_error(self, UdpHandle(id), NetError::Peer(e), None);
                    events += 1;
                }
                if let Some(udp) = self.pool.udp_mut(id) {
                    if udp.events.is_none() {
                        udp.events = sink;
                    }
                }
                events
            }
            KindTag::Raw => {
                let mut sink = self.pool.raw_mut(id).and_then(|raw| raw.events.take());
                let mut events = 0;
                if let Some(s) = sink.as_mut() {
                    s.on_receive_error(self, RawHandle(id), NetError::Peer(e), None);
                    events += 1;
                }
                if let Some(raw) = self.pool.raw_mut(id) {
                    if raw.events.is_none() {
                        raw.events = sink;
                    }
                }
                events
            }
            KindTag::TcpListening => self.tcp_dispatch_accept_error(id, e),
            KindTag::TcpConnecting => {
                let mut sink = match self.pool.tcp_mut(id) {
                    Some(tcp) => match &mut tcp.role {
                        TcpRole::Connecting { events, .. } => events.take(),
                        _ => None,
                    },
                    None => None,
                };
                self.release_tcp(id);
                if let Some(s) = sink.as_mut() {
                    s.on_connect_complete(self, TcpHandle(id), Err(NetError::Peer(e)));
                    return 1;
                }
                0
            }
            KindTag::TcpConnected => {
                warn!("tcp end point {:?} socket failure: {}", id, e);
                let mut sink = self
                    .pool
                    .tcp_mut(id)
                    .and_then(TcpEndPoint::connection_mut)
                    .and_then(|c| c.events.take());
                self.release_tcp(id);
                if let Some(s) = sink.as_mut() {
                    s.on_connection_closed(self, TcpHandle(id), Err(NetError::Peer(e)));
                    return 1;
                }
                0
            }
            KindTag::TcpIdle => 0,
        }
    }

    // --------------- redelivery / convergence without socket readiness

    fn collect_immediate(&self) -> Vec<EndPointId> {
        let mut ids = Vec::new();
        for (id, ep) in self.pool.iter() {
            if let EndPointKind::Tcp(tcp) = ep {
                if let Some(c) = tcp.connection() {
                    let redeliver = c.redeliver
                        && c.receive_enabled
                        && c.recv_pending.is_some()
                        && c.events.is_some();
                    let converged = c.fin_sent
                        && c.recv_eof
                        && c.close_mode.is_none()
                        && c.send_queue.is_empty();
                    if redeliver || converged {
                        ids.push(id);
                    }
                }
            }
        }
        ids
    }

    fn dispatch_immediate(&mut self, id: EndPointId) -> usize {
        let h = TcpHandle(id);
        let (converged, redeliver) = match self.pool.tcp(id).and_then(TcpEndPoint::connection) {
            Some(c) => (
                c.fin_sent && c.recv_eof && c.close_mode.is_none() && c.send_queue.is_empty(),
                c.redeliver && c.receive_enabled && c.recv_pending.is_some() && c.events.is_some(),
            ),
            None => return 0,
        };
        if converged {
            let mut sink = self
                .pool
                .tcp_mut(id)
                .and_then(TcpEndPoint::connection_mut)
                .and_then(|c| c.events.take());
            self.release_tcp(id);
            if let Some(s) = sink.as_mut() {
                s.on_connection_closed(self, h, Ok(()));
                return 1;
            }
            return 0;
        }
        if redeliver {
            let (mut sink, chain) = {
                let Some(c) = self.pool.tcp_mut(id).and_then(TcpEndPoint::connection_mut) else {
                    return 0;
                };
                c.redeliver = false;
                let chain = c.recv_pending.take();
                if let Some(ch) = &chain {
                    c.unacked_recv += ch.total_len();
                }
                (c.events.take(), chain)
            };
            let mut events = 0;
            if let Some(chain) = chain {
                trace!("tcp end point {:?}: redelivering {} bytes", id, chain.total_len());
                if let Some(s) = sink.as_mut() {
                    s.on_data_received(self, h, chain);
                    events += 1;
                }
            }
            if let Some(c) = self.pool.tcp_mut(id).and_then(TcpEndPoint::connection_mut) {
                if c.events.is_none() {
                    c.events = sink;
                }
            }
            return events;
        }
        0
    }

    fn fire_due_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        loop {
            match self.timers.peek() {
                Some(entry) if entry.deadline <= now => {}
                _ => break,
            }
            let Some(entry) = self.timers.pop() else { break };
            trace!("firing timer (context {})", entry.context);
            (entry.callback)(self, entry.context);
            fired += 1;
        }
        fired
    }

    // --------------- helpers

    fn connection_of(&mut self, ep: TcpHandle) -> NetResult<&mut TcpConnection> {
        match self.pool.tcp_mut(ep.0) {
            None => Err(NetError::stale_handle()),
            Some(tcp) => tcp
                .connection_mut()
                .ok_or(NetError::InvalidState("operation requires a connection")),
        }
    }

    fn release_tcp(&mut self, id: EndPointId) {
        if self.pool.release(id).is_some() {
            debug!("released tcp end point {:?}", id);
        }
    }

    fn ensure_udp_socket(&mut self, id: EndPointId) -> NetResult<()> {
        let needs_socket = self
            .pool
            .udp(id)
            .ok_or_else(NetError::stale_handle)?
            .socket
            .is_none();
        if !needs_socket {
            return Ok(());
        }
        let (family, interface) = {
            let udp = self.pool.udp(id).ok_or_else(NetError::stale_handle)?;
            (udp.family, udp.bound_interface.clone())
        };
        let socket = sys::udp_socket(family, interface.as_ref())
            .map_err(|e| NetError::config("creating udp socket", e))?;
        sys::bind(&socket, SocketAddr::new(family.unspecified(), 0))
            .map_err(|e| NetError::config("binding udp socket", e))?;
        let socket = self.register_udp(socket)?;
        self.pool
            .udp_mut(id)
            .ok_or_else(NetError::stale_handle)?
            .socket = Some(socket);
        Ok(())
    }

    fn ensure_raw_socket(&mut self, id: EndPointId) -> NetResult<()> {
        let needs_socket = self
            .pool
            .raw(id)
            .ok_or_else(NetError::stale_handle)?
            .socket
            .is_none();
        if !needs_socket {
            return Ok(());
        }
        let (protocol, interface) = {
            let raw = self.pool.raw(id).ok_or_else(NetError::stale_handle)?;
            (raw.protocol, raw.bound_interface.clone())
        };
        let socket = sys::raw_socket(protocol, interface.as_ref())
            .map_err(|e| NetError::config("creating raw socket", e))?;
        let fd = self.register_raw(socket)?;
        self.pool
            .raw_mut(id)
            .ok_or_else(NetError::stale_handle)?
            .socket = Some(fd);
        Ok(())
    }

    fn register_udp(&self, socket: socket2::Socket) -> NetResult<tokio::net::UdpSocket> {
        let std_socket: std::net::UdpSocket = socket.into();
        let _guard = self.runtime.enter();
        tokio::net::UdpSocket::from_std(std_socket)
            .map_err(|e| NetError::config("registering udp socket", e))
    }

    fn register_raw(&self, socket: socket2::Socket) -> NetResult<AsyncFd<socket2::Socket>> {
        let _guard = self.runtime.enter();
        AsyncFd::new(socket).map_err(|e| NetError::config("registering raw socket", e))
    }
}

fn push_readiness<'a>(
    id: EndPointId,
    ep: &'a EndPointKind,
    window: usize,
    futures: &mut FuturesUnordered<LocalBoxFuture<'a, (EndPointId, Readiness)>>,
) {
    match ep {
        EndPointKind::Udp(udp) => {
            let Some(interest) = udp.interest() else { return };
            let Some(socket) = udp.socket.as_ref() else { return };
            futures.push(
                async move {
                    match socket.ready(interest).await {
                        Ok(ready) => (
                            id,
                            Readiness::Sock {
                                readable: ready.is_readable(),
                                writable: ready.is_writable(),
                            },
                        ),
                        Err(e) => (id, Readiness::SockFailed(e)),
                    }
                }
                .boxed_local(),
            );
        }
        EndPointKind::Raw(raw) => {
            let Some(fd) = raw.socket.as_ref() else { return };
            if raw.listening && raw.events.is_some() {
                futures.push(
                    async move {
                        match fd.readable().await {
                            Ok(_guard) => (
                                id,
                                Readiness::Sock {
                                    readable: true,
                                    writable: false,
                                },
                            ),
                            Err(e) => (id, Readiness::SockFailed(e)),
                        }
                    }
                    .boxed_local(),
                );
            }
            if !raw.send_queue.is_empty() {
                futures.push(
                    async move {
                        match fd.writable().await {
                            Ok(_guard) => (
                                id,
                                Readiness::Sock {
                                    readable: false,
                                    writable: true,
                                },
                            ),
                            Err(e) => (id, Readiness::SockFailed(e)),
                        }
                    }
                    .boxed_local(),
                );
            }
        }
        EndPointKind::Tcp(tcp) => match &tcp.role {
            TcpRole::Idle { .. } => {}
            TcpRole::Listening { listener, events } => {
                if events.is_none() {
                    return;
                }
                futures.push(
                    async move {
                        match std::future::poll_fn(|cx| listener.poll_accept(cx)).await {
                            Ok((stream, peer)) => (id, Readiness::Incoming(stream, peer)),
                            Err(e) => (id, Readiness::AcceptFailed(e)),
                        }
                    }
                    .boxed_local(),
                );
            }
            TcpRole::Connecting { stream, .. } => {
                futures.push(
                    async move {
                        match stream.ready(Interest::WRITABLE).await {
                            Ok(_) => (id, Readiness::ConnectReady),
                            Err(e) => (id, Readiness::SockFailed(e)),
                        }
                    }
                    .boxed_local(),
                );
            }
            TcpRole::Connected(c) => {
                let Some(interest) = c.interest(window) else { return };
                let stream = &c.stream;
                futures.push(
                    async move {
                        match stream.ready(interest).await {
                            Ok(ready) => (
                                id,
                                Readiness::Sock {
                                    readable: ready.is_readable(),
                                    writable: ready.is_writable(),
                                },
                            ),
                            Err(e) => (id, Readiness::SockFailed(e)),
                        }
                    }
                    .boxed_local(),
                );
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_transport() -> Transport {
        Transport::new(NetConfig::default()).unwrap()
    }

    fn drive_until(net: &mut Transport, deadline: Duration, mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() && start.elapsed() < deadline {
            net.service(Duration::from_millis(20)).unwrap();
        }
    }

    // ----------------------------------- timers

    thread_local! {
        static FIRED: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
    }

    fn record_fire(_net: &mut Transport, context: u64) {
        FIRED.with(|f| f.borrow_mut().push(context));
    }

    fn fired() -> Vec<u64> {
        FIRED.with(|f| f.borrow().clone())
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut net = test_transport();
        net.start_timer(Duration::from_millis(40), record_fire, 2);
        net.start_timer(Duration::from_millis(5), record_fire, 1);

        drive_until(&mut net, Duration::from_secs(2), || fired().len() >= 2);
        assert_eq!(fired(), vec![1, 2]);
    }

    #[test]
    fn test_timer_cancel_before_fire() {
        let mut net = test_transport();
        net.start_timer(Duration::from_millis(30), record_fire, 7);
        net.cancel_timer(record_fire, 7);
        // cancelling something that was never scheduled is a no-op
        net.cancel_timer(record_fire, 99);

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(120) {
            net.service(Duration::from_millis(20)).unwrap();
        }
        assert_eq!(fired(), Vec::<u64>::new());
    }

    #[test]
    fn test_timer_restart_replaces_schedule() {
        let mut net = test_transport();
        net.start_timer(Duration::from_millis(50), record_fire, 5);
        net.start_timer(Duration::from_millis(10), record_fire, 5);

        drive_until(&mut net, Duration::from_secs(2), || !fired().is_empty());
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(100) {
            net.service(Duration::from_millis(20)).unwrap();
        }
        assert_eq!(fired(), vec![5]);
    }

    // ----------------------------------- pool behavior through the api

    #[test]
    fn test_end_point_pool_exhaustion_and_reuse() {
        let mut net = Transport::new(NetConfig {
            max_end_points: 2,
            ..NetConfig::default()
        })
        .unwrap();

        let a = net.new_udp_end_point(IpFamily::V4).unwrap();
        let _b = net.new_udp_end_point(IpFamily::V4).unwrap();
        assert!(matches!(
            net.new_udp_end_point(IpFamily::V4),
            Err(NetError::ResourceExhausted(_))
        ));
        assert_eq!(net.stats().end_point_acquire_failures, 1);
        assert_eq!(net.stats().end_points_in_use, 2);

        net.udp_free(a).unwrap();
        assert!(net.new_udp_end_point(IpFamily::V4).is_ok());

        // the released handle is dead
        assert!(matches!(net.udp_free(a), Err(NetError::InvalidState(_))));
        assert!(matches!(net.udp_local_addr(a), Err(NetError::InvalidState(_))));
    }

    // ----------------------------------- tcp state machine edges

    #[test]
    fn test_tcp_send_requires_connection() {
        let mut net = test_transport();
        let ep = net.new_tcp_end_point().unwrap();
        assert_eq!(net.tcp_state(ep), TcpState::Ready);

        let buf = net.alloc_buffer(0).unwrap();
        buf.put_slice(b"too early").unwrap();
        assert!(matches!(
            net.tcp_send(ep, buf),
            Err(NetError::InvalidState(_))
        ));

        // operations that need a live connection fail the same way
        assert!(matches!(
            net.tcp_ack_receive(ep, 1),
            Err(NetError::InvalidState(_))
        ));
        assert!(matches!(
            net.tcp_enable_keepalive(ep, 10, 3),
            Err(NetError::InvalidState(_))
        ));

        net.tcp_free(ep).unwrap();
        assert_eq!(net.tcp_state(ep), TcpState::Closed);
    }

    #[test]
    fn test_tcp_bind_rejects_family_mismatch() {
        let mut net = test_transport();
        let ep = net.new_tcp_end_point().unwrap();
        assert!(matches!(
            net.tcp_bind(ep, IpFamily::V4, "::1".parse().unwrap(), 0, false),
            Err(NetError::InvalidArgument(_))
        ));
        assert_eq!(net.tcp_state(ep), TcpState::Ready);

        net.tcp_bind(ep, IpFamily::V4, "127.0.0.1".parse().unwrap(), 0, true)
            .unwrap();
        assert_eq!(net.tcp_state(ep), TcpState::Bound);
        net.tcp_free(ep).unwrap();
    }

    // ----------------------------------- udp round trip

    struct RecordingUdpSink {
        datagrams: Rc<RefCell<Vec<(Vec<u8>, IpPacketInfo)>>>,
    }

    impl UdpEvents for RecordingUdpSink {
        fn on_message_received(
            &mut self,
            _net: &mut Transport,
            _ep: UdpHandle,
            buffer: PacketBuf,
            info: IpPacketInfo,
        ) {
            self.datagrams.borrow_mut().push((buffer.copy_to_vec(), info));
        }

        fn on_receive_error(
            &mut self,
            _net: &mut Transport,
            _ep: UdpHandle,
            error: NetError,
            _info: Option<IpPacketInfo>,
        ) {
            panic!("unexpected udp receive error: {}", error);
        }
    }

    #[test]
    fn test_udp_round_trip_59_byte_pattern() {
        let mut net = test_transport();

        let receiver = net.new_udp_end_point(IpFamily::V4).unwrap();
        net.udp_bind(receiver, IpFamily::V4, "127.0.0.1".parse().unwrap(), 0)
            .unwrap();
        let datagrams = Rc::new(RefCell::new(Vec::new()));
        net.udp_listen(
            receiver,
            Box::new(RecordingUdpSink {
                datagrams: datagrams.clone(),
            }),
        )
        .unwrap();
        let dest = net.udp_local_addr(receiver).unwrap();

        let sender = net.new_udp_end_point(IpFamily::V4).unwrap();
        let payload: Vec<u8> = (0..59).collect();
        let buf = net.alloc_buffer(0).unwrap();
        buf.put_slice(&payload).unwrap();
        net.udp_send_to(sender, dest.ip(), dest.port(), buf).unwrap();

        drive_until(&mut net, Duration::from_secs(2), || {
            !datagrams.borrow().is_empty()
        });

        let received = datagrams.borrow();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, payload);
        assert_ne!(received[0].1.src_port, 0);
        assert_eq!(received[0].1.dest_port, dest.port());

        assert_eq!(net.udp_stats(sender).unwrap().bytes_sent, 59);
        assert_eq!(net.udp_stats(receiver).unwrap().bytes_received, 59);
        assert!(net.stats().bytes_sent >= 59);
        assert!(net.stats().bytes_received >= 59);
    }

    // ----------------------------------- tcp round trip

    #[derive(Default)]
    struct TcpScenario {
        connected: bool,
        accepted: Option<TcpHandle>,
        received: Vec<u8>,
        acked: usize,
        server_peer_closed: bool,
        server_closed: Option<NetResult<()>>,
    }

    type SharedScenario = Rc<RefCell<TcpScenario>>;

    struct ScenarioListenerSink {
        shared: SharedScenario,
    }

    impl TcpListenerEvents for ScenarioListenerSink {
        fn on_connection_received(
            &mut self,
            net: &mut Transport,
            _listener: TcpHandle,
            connection: TcpHandle,
            _peer: SocketAddr,
        ) {
            net.tcp_set_events(
                connection,
                Box::new(ScenarioServerSink {
                    shared: self.shared.clone(),
                }),
            )
            .unwrap();
            self.shared.borrow_mut().accepted = Some(connection);
        }

        fn on_accept_error(&mut self, _net: &mut Transport, _listener: TcpHandle, error: NetError) {
            panic!("unexpected accept error: {}", error);
        }
    }

    struct ScenarioServerSink {
        shared: SharedScenario,
    }

    impl TcpConnectionEvents for ScenarioServerSink {
        fn on_connect_complete(
            &mut self,
            _net: &mut Transport,
            _ep: TcpHandle,
            _result: NetResult<()>,
        ) {
        }

        fn on_data_received(&mut self, net: &mut Transport, ep: TcpHandle, buffer: PacketBuf) {
            let n = buffer.total_len();
            self.shared.borrow_mut().received.extend(buffer.copy_to_vec());
            net.tcp_ack_receive(ep, n).unwrap();
            self.shared.borrow_mut().acked += n;
        }

        fn on_connection_closed(
            &mut self,
            _net: &mut Transport,
            _ep: TcpHandle,
            result: NetResult<()>,
        ) {
            self.shared.borrow_mut().server_closed = Some(result);
        }

        fn on_peer_close(&mut self, _net: &mut Transport, _ep: TcpHandle) {
            self.shared.borrow_mut().server_peer_closed = true;
        }
    }

    struct ScenarioClientSink {
        shared: SharedScenario,
    }

    impl TcpConnectionEvents for ScenarioClientSink {
        fn on_connect_complete(
            &mut self,
            _net: &mut Transport,
            _ep: TcpHandle,
            result: NetResult<()>,
        ) {
            result.unwrap();
            self.shared.borrow_mut().connected = true;
        }

        fn on_data_received(&mut self, _net: &mut Transport, _ep: TcpHandle, _buffer: PacketBuf) {}

        fn on_connection_closed(
            &mut self,
            _net: &mut Transport,
            _ep: TcpHandle,
            _result: NetResult<()>,
        ) {
        }
    }

    fn cyclic_pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_tcp_round_trip_1523_bytes_in_chunks() {
        const TOTAL: usize = 1523;
        const SEND_SIZE: usize = 59;

        let mut net = test_transport();
        let shared: SharedScenario = Rc::new(RefCell::new(TcpScenario::default()));

        let listener = net.new_tcp_end_point().unwrap();
        net.tcp_bind(listener, IpFamily::V4, "127.0.0.1".parse().unwrap(), 0, true)
            .unwrap();
        net.tcp_listen(
            listener,
            1,
            Box::new(ScenarioListenerSink {
                shared: shared.clone(),
            }),
        )
        .unwrap();
        let dest = net.tcp_local_addr(listener).unwrap();

        let client = net.new_tcp_end_point().unwrap();
        net.tcp_connect(
            client,
            dest.ip(),
            dest.port(),
            None,
            Box::new(ScenarioClientSink {
                shared: shared.clone(),
            }),
        )
        .unwrap();
        assert_eq!(net.tcp_state(client), TcpState::Connecting);

        let pattern = cyclic_pattern(TOTAL);
        let mut sent = 0usize;
        let start = Instant::now();
        while shared.borrow().received.len() < TOTAL && start.elapsed() < Duration::from_secs(5) {
            net.service(Duration::from_millis(20)).unwrap();
            let ready_for_chunk =
                shared.borrow().connected && sent < TOTAL && net.tcp_pending_send_len(client) == 0;
            if ready_for_chunk {
                let chunk = SEND_SIZE.min(TOTAL - sent);
                let buf = net.alloc_buffer(0).unwrap();
                buf.put_slice(&pattern[sent..sent + chunk]).unwrap();
                net.tcp_send(client, buf).unwrap();
                sent += chunk;
            }
        }

        {
            let state = shared.borrow();
            assert_eq!(state.received.len(), TOTAL);
            assert_eq!(state.received, pattern);
            assert_eq!(state.acked, TOTAL);
        }
        assert_eq!(net.tcp_state(client), TcpState::Connected);
        let accepted = shared.borrow().accepted.unwrap();
        assert_eq!(net.tcp_state(accepted), TcpState::Connected);

        // the transport never sends more than the application handed it
        assert_eq!(net.tcp_stats(client).unwrap().bytes_sent, TOTAL as u64);
        assert_eq!(net.tcp_stats(accepted).unwrap().bytes_received, TOTAL as u64);

        // graceful teardown: client closes, the server sees the half-close
        net.tcp_close(client).unwrap();
        assert_eq!(net.tcp_state(client), TcpState::Closed);
        drive_until(&mut net, Duration::from_secs(2), || {
            shared.borrow().server_peer_closed
        });
        assert_eq!(net.tcp_state(accepted), TcpState::ReceiveShutdown);

        net.tcp_close(accepted).unwrap();
        assert_eq!(net.tcp_state(accepted), TcpState::Closed);
        net.tcp_close(listener).unwrap();
        assert_eq!(net.stats().end_points_in_use, 0);
    }

    // ----------------------------------- put-back redelivery

    #[derive(Default)]
    struct PutBackScenario {
        connected: bool,
        accepted: Option<TcpHandle>,
        deliveries: Vec<Vec<u8>>,
    }

    struct PutBackListenerSink {
        shared: Rc<RefCell<PutBackScenario>>,
    }

    impl TcpListenerEvents for PutBackListenerSink {
        fn on_connection_received(
            &mut self,
            net: &mut Transport,
            _listener: TcpHandle,
            connection: TcpHandle,
            _peer: SocketAddr,
        ) {
            net.tcp_set_events(
                connection,
                Box::new(PutBackServerSink {
                    shared: self.shared.clone(),
                }),
            )
            .unwrap();
            self.shared.borrow_mut().accepted = Some(connection);
        }

        fn on_accept_error(&mut self, _net: &mut Transport, _listener: TcpHandle, error: NetError) {
            panic!("unexpected accept error: {}", error);
        }
    }

    struct PutBackServerSink {
        shared: Rc<RefCell<PutBackScenario>>,
    }

    impl TcpConnectionEvents for PutBackServerSink {
        fn on_connect_complete(
            &mut self,
            _net: &mut Transport,
            _ep: TcpHandle,
            _result: NetResult<()>,
        ) {
        }

        fn on_data_received(&mut self, net: &mut Transport, ep: TcpHandle, buffer: PacketBuf) {
            let first = self.shared.borrow().deliveries.is_empty();
            self.shared.borrow_mut().deliveries.push(buffer.copy_to_vec());
            if first {
                // not ready to process yet - hand it back for redelivery
                net.tcp_put_back_received_data(ep, Some(buffer)).unwrap();
            } else {
                let n = buffer.total_len();
                net.tcp_ack_receive(ep, n).unwrap();
            }
        }

        fn on_connection_closed(
            &mut self,
            _net: &mut Transport,
            _ep: TcpHandle,
            _result: NetResult<()>,
        ) {
        }
    }

    struct PutBackClientSink {
        shared: Rc<RefCell<PutBackScenario>>,
    }

    impl TcpConnectionEvents for PutBackClientSink {
        fn on_connect_complete(
            &mut self,
            _net: &mut Transport,
            _ep: TcpHandle,
            result: NetResult<()>,
        ) {
            result.unwrap();
            self.shared.borrow_mut().connected = true;
        }

        fn on_data_received(&mut self, _net: &mut Transport, _ep: TcpHandle, _buffer: PacketBuf) {}

        fn on_connection_closed(
            &mut self,
            _net: &mut Transport,
            _ep: TcpHandle,
            _result: NetResult<()>,
        ) {
        }
    }

    #[test]
    fn test_put_back_redelivers_in_order() {
        let mut net = test_transport();
        let shared = Rc::new(RefCell::new(PutBackScenario::default()));

        let listener = net.new_tcp_end_point().unwrap();
        net.tcp_bind(listener, IpFamily::V4, "127.0.0.1".parse().unwrap(), 0, true)
            .unwrap();
        net.tcp_listen(
            listener,
            1,
            Box::new(PutBackListenerSink {
                shared: shared.clone(),
            }),
        )
        .unwrap();
        let dest = net.tcp_local_addr(listener).unwrap();

        let client = net.new_tcp_end_point().unwrap();
        net.tcp_connect(
            client,
            dest.ip(),
            dest.port(),
            None,
            Box::new(PutBackClientSink {
                shared: shared.clone(),
            }),
        )
        .unwrap();

        drive_until(&mut net, Duration::from_secs(2), || shared.borrow().connected);
        let buf = net.alloc_buffer(0).unwrap();
        buf.put_slice(b"hello world").unwrap();
        net.tcp_send(client, buf).unwrap();

        // first delivery is put back by the sink
        drive_until(&mut net, Duration::from_secs(2), || {
            !shared.borrow().deliveries.is_empty()
        });
        let accepted = shared.borrow().accepted.unwrap();
        assert_eq!(net.tcp_pending_receive_len(accepted), 11);

        // re-enabling receive triggers the redelivery
        net.tcp_enable_receive(accepted).unwrap();
        drive_until(&mut net, Duration::from_secs(2), || {
            shared.borrow().deliveries.len() >= 2
        });

        let deliveries = shared.borrow().deliveries.clone();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0], b"hello world");
        assert_eq!(deliveries[1], b"hello world");
        assert_eq!(net.tcp_pending_receive_len(accepted), 0);
    }
}
