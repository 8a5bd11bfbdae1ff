//! Connection-oriented TCP end point state.
//!
//! One end point instance represents one connection attempt or established
//!  connection; a listening end point is a different role of the same slot
//!  type, and every accepted connection gets a fresh end point from the pool.
//!  The externally visible [`TcpState`] is derived from the role plus the
//!  half-close bookkeeping rather than stored, so it cannot drift.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::io::Interest;

use crate::buffers::packet_buf::PacketBuf;
use crate::events::{TcpConnectionEvents, TcpListenerEvents};

/// Externally visible connection state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TcpState {
    Ready,
    Bound,
    Listening,
    Connecting,
    Connected,
    /// The local side finished sending (FIN sent); receiving continues.
    SendShutdown,
    /// The peer finished sending; local sends continue.
    ReceiveShutdown,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CloseMode {
    /// Flush pending sends, then close.
    Graceful,
}

pub(crate) struct TcpConnection {
    pub(crate) stream: tokio::net::TcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) events: Option<Box<dyn TcpConnectionEvents>>,

    /// Send side: buffers queued by `tcp_send`, flushed as the socket
    ///  accepts them. `pending_send_len` is the byte sum of the queue.
    pub(crate) send_queue: VecDeque<PacketBuf>,
    pub(crate) pending_send_len: usize,

    /// Receive side flow control: bytes handed to the application and not
    ///  yet returned through `tcp_ack_receive`. Reading from the socket
    ///  stops while this reaches the configured window.
    pub(crate) unacked_recv: usize,
    /// Data the application put back for in-order redelivery.
    pub(crate) recv_pending: Option<PacketBuf>,
    /// Redeliver `recv_pending` on the next pass even without new data.
    pub(crate) redeliver: bool,
    pub(crate) receive_enabled: bool,

    pub(crate) send_shutdown_requested: bool,
    pub(crate) fin_sent: bool,
    pub(crate) recv_eof: bool,
    pub(crate) close_mode: Option<CloseMode>,

    pub(crate) keepalive: bool,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

impl TcpConnection {
    pub(crate) fn new(
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        events: Option<Box<dyn TcpConnectionEvents>>,
    ) -> TcpConnection {
        TcpConnection {
            stream,
            peer,
            events,
            send_queue: VecDeque::new(),
            pending_send_len: 0,
            unacked_recv: 0,
            recv_pending: None,
            redeliver: false,
            receive_enabled: true,
            send_shutdown_requested: false,
            fin_sent: false,
            recv_eof: false,
            close_mode: None,
            keepalive: false,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub(crate) fn pending_receive_len(&self) -> usize {
        self.recv_pending.as_ref().map_or(0, PacketBuf::total_len)
    }

    pub(crate) fn recv_window_space(&self, window: usize) -> usize {
        window.saturating_sub(self.unacked_recv + self.pending_receive_len())
    }

    pub(crate) fn interest(&self, window: usize) -> Option<Interest> {
        let receive = self.receive_enabled
            && !self.recv_eof
            && self.close_mode.is_none()
            && self.events.is_some()
            && self.recv_window_space(window) > 0;
        let send = !self.send_queue.is_empty();
        match (receive, send) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

pub(crate) enum TcpRole {
    /// `Ready` (nothing yet) or `Bound` (socket created and bound).
    Idle {
        bound: Option<socket2::Socket>,
        family: Option<crate::addr::IpFamily>,
    },
    Listening {
        listener: tokio::net::TcpListener,
        events: Option<Box<dyn TcpListenerEvents>>,
    },
    Connecting {
        stream: tokio::net::TcpStream,
        events: Option<Box<dyn TcpConnectionEvents>>,
    },
    Connected(TcpConnection),
}

pub(crate) struct TcpEndPoint {
    pub(crate) role: TcpRole,
}

impl TcpEndPoint {
    pub(crate) fn new() -> TcpEndPoint {
        TcpEndPoint {
            role: TcpRole::Idle {
                bound: None,
                family: None,
            },
        }
    }

    pub(crate) fn connected(connection: TcpConnection) -> TcpEndPoint {
        TcpEndPoint {
            role: TcpRole::Connected(connection),
        }
    }

    pub(crate) fn state(&self) -> TcpState {
        match &self.role {
            TcpRole::Idle { bound: None, .. } => TcpState::Ready,
            TcpRole::Idle { bound: Some(_), .. } => TcpState::Bound,
            TcpRole::Listening { .. } => TcpState::Listening,
            TcpRole::Connecting { .. } => TcpState::Connecting,
            TcpRole::Connected(c) => {
                if c.close_mode.is_some() {
                    return TcpState::Closing;
                }
                let send_done = c.fin_sent || c.send_shutdown_requested;
                match (send_done, c.recv_eof) {
                    (false, false) => TcpState::Connected,
                    (true, false) => TcpState::SendShutdown,
                    (false, true) => TcpState::ReceiveShutdown,
                    (true, true) => TcpState::Closing,
                }
            }
        }
    }

    /// Sending is legal while `Connected`, and still after the peer
    ///  half-closed (`ReceiveShutdown`).
    pub(crate) fn can_send(&self) -> bool {
        matches!(
            self.state(),
            TcpState::Connected | TcpState::ReceiveShutdown
        )
    }

    pub(crate) fn connection(&self) -> Option<&TcpConnection> {
        match &self.role {
            TcpRole::Connected(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn connection_mut(&mut self) -> Option<&mut TcpConnection> {
        match &mut self.role {
            TcpRole::Connected(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_states() {
        let ep = TcpEndPoint::new();
        assert_eq!(ep.state(), TcpState::Ready);
        assert!(!ep.can_send());
        assert!(ep.connection().is_none());
    }
}
