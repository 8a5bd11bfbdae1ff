//! Raw IP end point state: ICMP-style datagrams below UDP/TCP.
//!
//! IPv4 raw receives deliver the full packet including the 20 byte IP header
//!  (callers strip it with `consume_head`); IPv6 raw receives deliver the
//!  payload only. The ICMP type filter is applied in the receive path before
//!  delivery, so disallowed types never reach the application.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bit_set::BitSet;
use tokio::io::unix::AsyncFd;

use crate::addr::{InterfaceId, IpFamily, IpProtocol};
use crate::buffers::packet_buf::PacketBuf;
use crate::events::RawEvents;

pub(crate) struct RawEndPoint {
    pub(crate) protocol: IpProtocol,
    pub(crate) bound_interface: Option<InterfaceId>,
    pub(crate) socket: Option<AsyncFd<socket2::Socket>>,
    pub(crate) listening: bool,
    pub(crate) filter: Option<BitSet>,
    pub(crate) events: Option<Box<dyn RawEvents>>,
    pub(crate) send_queue: VecDeque<(SocketAddr, PacketBuf)>,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

impl RawEndPoint {
    pub(crate) fn new(protocol: IpProtocol) -> RawEndPoint {
        RawEndPoint {
            protocol,
            bound_interface: None,
            socket: None,
            listening: false,
            filter: None,
            events: None,
            send_queue: VecDeque::new(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub(crate) fn family(&self) -> IpFamily {
        self.protocol.family()
    }
}

pub(crate) fn filter_passes(family: IpFamily, filter: Option<&BitSet>, packet: &[u8]) -> bool {
    match filter {
        None => true,
        Some(filter) => match icmp_type_of(family, packet) {
            Some(icmp_type) => filter.contains(icmp_type as usize),
            None => false,
        },
    }
}

/// The ICMP type byte of a received raw packet: for IPv4 it sits right after
///  the IP header (length from the IHL field), for IPv6 the kernel already
///  stripped the IP header so it is the first byte.
pub(crate) fn icmp_type_of(family: IpFamily, packet: &[u8]) -> Option<u8> {
    match family {
        IpFamily::V4 => {
            let ihl = (packet.first()? & 0x0f) as usize * 4;
            if ihl < 20 {
                return None;
            }
            packet.get(ihl).copied()
        }
        IpFamily::V6 => packet.first().copied(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn v4_packet(icmp_type: u8) -> Vec<u8> {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45; // version 4, IHL 5
        packet[20] = icmp_type;
        packet
    }

    #[rstest]
    #[case::v4_echo_reply(IpFamily::V4, v4_packet(0), Some(0))]
    #[case::v4_echo_request(IpFamily::V4, v4_packet(8), Some(8))]
    #[case::v4_truncated(IpFamily::V4, vec![0x45u8; 10], None)]
    #[case::v4_bad_ihl(IpFamily::V4, vec![0x41u8; 28], None)]
    #[case::v4_empty(IpFamily::V4, vec![], None)]
    #[case::v6_echo_reply(IpFamily::V6, vec![129u8, 0, 0, 0], Some(129))]
    #[case::v6_empty(IpFamily::V6, vec![], None)]
    fn test_icmp_type_of(
        #[case] family: IpFamily,
        #[case] packet: Vec<u8>,
        #[case] expected: Option<u8>,
    ) {
        assert_eq!(icmp_type_of(family, &packet), expected);
    }

    #[test]
    fn test_filter_gates_delivery() {
        let mut ep = RawEndPoint::new(IpProtocol::Icmpv4);
        assert!(filter_passes(ep.family(), ep.filter.as_ref(), &v4_packet(8)));

        let mut allowed = BitSet::with_capacity(256);
        allowed.insert(0);
        ep.filter = Some(allowed);

        assert!(filter_passes(ep.family(), ep.filter.as_ref(), &v4_packet(0)));
        assert!(!filter_passes(ep.family(), ep.filter.as_ref(), &v4_packet(8)));
        // unparseable packets never pass an active filter
        assert!(!filter_passes(ep.family(), ep.filter.as_ref(), &[]));
    }
}
