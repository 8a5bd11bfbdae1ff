use std::ffi::CString;
use std::fmt::{Debug, Display, Formatter};
use std::net::IpAddr;

use crate::error::{NetError, NetResult};

/// IP address family of an end point. Every end point is created for exactly
///  one family, and all addresses passed to it must match.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
        }
    }

    pub fn of(addr: &IpAddr) -> IpFamily {
        if addr.is_ipv4() {
            IpFamily::V4
        } else {
            IpFamily::V6
        }
    }

    /// The wildcard ("any") address of this family.
    pub fn unspecified(&self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        }
    }

    pub(crate) fn domain(&self) -> socket2::Domain {
        match self {
            IpFamily::V4 => socket2::Domain::IPV4,
            IpFamily::V6 => socket2::Domain::IPV6,
        }
    }
}

/// Protocol selector for raw IP end points.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpProtocol {
    Icmpv4,
    Icmpv6,
}

impl IpProtocol {
    pub fn family(&self) -> IpFamily {
        match self {
            IpProtocol::Icmpv4 => IpFamily::V4,
            IpProtocol::Icmpv6 => IpFamily::V6,
        }
    }

    pub(crate) fn protocol(&self) -> socket2::Protocol {
        match self {
            IpProtocol::Icmpv4 => socket2::Protocol::ICMPV4,
            IpProtocol::Icmpv6 => socket2::Protocol::ICMPV6,
        }
    }
}

/// A validated network interface identity.
///
/// Resolution from a human-readable name is the job of the hosting
///  application; this type performs the OS lookup once at construction so
///  that end points can rely on the identity being real.
#[derive(Clone, Eq, PartialEq)]
pub struct InterfaceId {
    name: String,
    index: u32,
}

impl InterfaceId {
    pub fn from_name(name: &str) -> NetResult<InterfaceId> {
        let c_name = CString::new(name)
            .map_err(|_| NetError::InvalidArgument("interface name contains a NUL byte"))?;
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            return Err(NetError::InvalidArgument("no interface with this name"));
        }
        Ok(InterfaceId {
            name: name.to_owned(),
            index,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Debug for InterfaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}#{}]", self.name, self.index)
    }
}

impl Display for InterfaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Immutable description of a connectionless receive: who sent the datagram,
///  where it was addressed, and which interface it arrived on.
///
/// Ports are zero for raw IP receives. The destination side is populated from
///  the receiving socket's local binding.
#[derive(Clone, Debug)]
pub struct IpPacketInfo {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dest_addr: Option<IpAddr>,
    pub dest_port: u16,
    pub interface: Option<InterfaceId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::v4_matches(IpFamily::V4, "127.0.0.1", true)]
    #[case::v4_mismatch(IpFamily::V4, "::1", false)]
    #[case::v6_matches(IpFamily::V6, "::1", true)]
    #[case::v6_mismatch(IpFamily::V6, "10.0.0.1", false)]
    fn test_family_matches(#[case] family: IpFamily, #[case] addr: &str, #[case] expected: bool) {
        let addr: IpAddr = addr.parse().unwrap();
        assert_eq!(family.matches(&addr), expected);
    }

    #[test]
    fn test_unspecified_matches_family() {
        assert!(IpFamily::V4.matches(&IpFamily::V4.unspecified()));
        assert!(IpFamily::V6.matches(&IpFamily::V6.unspecified()));
    }

    #[test]
    fn test_protocol_family() {
        assert_eq!(IpProtocol::Icmpv4.family(), IpFamily::V4);
        assert_eq!(IpProtocol::Icmpv6.family(), IpFamily::V6);
    }

    #[test]
    fn test_interface_from_bogus_name() {
        assert!(matches!(
            InterfaceId::from_name("surely-no-such-interface-0"),
            Err(NetError::InvalidArgument(_))
        ));
        assert!(matches!(
            InterfaceId::from_name("nul\0name"),
            Err(NetError::InvalidArgument(_))
        ));
    }
}
