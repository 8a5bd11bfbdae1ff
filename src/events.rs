//! The callback contract between the transport core and the application.
//!
//! Each end point owns one event sink; the service loop takes the sink out
//!  for the duration of a callback, so a sink may freely call back into the
//!  [`Transport`](crate::transport::Transport) it is handed (send, close,
//!  schedule timers) - such re-entrant work takes effect on a subsequent
//!  service pass. Payload ownership moves into the callback.

use std::net::SocketAddr;

use crate::addr::IpPacketInfo;
use crate::buffers::packet_buf::PacketBuf;
use crate::end_point_pool::{RawHandle, TcpHandle, UdpHandle};
use crate::error::{NetError, NetResult};
use crate::transport::Transport;

pub trait RawEvents {
    fn on_message_received(
        &mut self,
        net: &mut Transport,
        ep: RawHandle,
        buffer: PacketBuf,
        info: IpPacketInfo,
    );

    fn on_receive_error(
        &mut self,
        net: &mut Transport,
        ep: RawHandle,
        error: NetError,
        info: Option<IpPacketInfo>,
    );
}

pub trait UdpEvents {
    fn on_message_received(
        &mut self,
        net: &mut Transport,
        ep: UdpHandle,
        buffer: PacketBuf,
        info: IpPacketInfo,
    );

    fn on_receive_error(
        &mut self,
        net: &mut Transport,
        ep: UdpHandle,
        error: NetError,
        info: Option<IpPacketInfo>,
    );
}

pub trait TcpListenerEvents {
    /// A connection was accepted. `connection` is a fresh end point from the
    ///  pool, already `Connected`; attach its sink with `tcp_set_events`
    ///  before returning, or the data stays queued in the kernel.
    fn on_connection_received(
        &mut self,
        net: &mut Transport,
        listener: TcpHandle,
        connection: TcpHandle,
        peer: SocketAddr,
    );

    fn on_accept_error(&mut self, net: &mut Transport, listener: TcpHandle, error: NetError);
}

pub trait TcpConnectionEvents {
    /// Outcome of a `tcp_connect`. On `Err` the end point has already been
    ///  released and the handle must not be reused.
    fn on_connect_complete(&mut self, net: &mut Transport, ep: TcpHandle, result: NetResult<()>);

    /// Accumulated received bytes, possibly a chain of buffers. Consume and
    ///  `tcp_ack_receive`, or `tcp_put_back_received_data` for in-order
    ///  redelivery later.
    fn on_data_received(&mut self, net: &mut Transport, ep: TcpHandle, buffer: PacketBuf);

    /// Bytes accepted by the transport since the last notification.
    fn on_data_sent(&mut self, net: &mut Transport, ep: TcpHandle, bytes_acked: usize) {
        let _ = (net, ep, bytes_acked);
    }

    /// The connection is gone: `Ok` for an orderly remote close, `Err` for a
    ///  reset or transport failure. The end point has been released.
    fn on_connection_closed(&mut self, net: &mut Transport, ep: TcpHandle, result: NetResult<()>);

    /// The peer shut down its send direction; receives are over but sending
    ///  is still possible.
    fn on_peer_close(&mut self, net: &mut Transport, ep: TcpHandle) {
        let _ = (net, ep);
    }
}

/// One-shot timer callback. Timers are identified - for scheduling and for
///  cancellation - by the `(callback, context)` pair; no separate handle
///  exists.
pub type TimerCallback = fn(&mut Transport, u64);
