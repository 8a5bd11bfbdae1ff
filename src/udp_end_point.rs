//! Connectionless UDP end point state. Every operation is independent; the
//!  socket is created lazily on the first bind or send, so an unbound sender
//!  simply gets an ephemeral port.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::io::Interest;

use crate::addr::{InterfaceId, IpFamily};
use crate::buffers::packet_buf::PacketBuf;
use crate::events::UdpEvents;

pub(crate) struct UdpEndPoint {
    pub(crate) family: IpFamily,
    pub(crate) bound_interface: Option<InterfaceId>,
    pub(crate) socket: Option<tokio::net::UdpSocket>,
    pub(crate) listening: bool,
    pub(crate) events: Option<Box<dyn UdpEvents>>,
    pub(crate) send_queue: VecDeque<(SocketAddr, PacketBuf)>,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

impl UdpEndPoint {
    pub(crate) fn new(family: IpFamily) -> UdpEndPoint {
        UdpEndPoint {
            family,
            bound_interface: None,
            socket: None,
            listening: false,
            events: None,
            send_queue: VecDeque::new(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// What the service loop should wait for on this end point, if anything.
    pub(crate) fn interest(&self) -> Option<Interest> {
        self.socket.as_ref()?;
        let receive = self.listening && self.events.is_some();
        let send = !self.send_queue.is_empty();
        match (receive, send) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}
