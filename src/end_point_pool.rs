//! The fixed-capacity slab that issues and reclaims end points.
//!
//! Handles are `(slot, generation)` pairs; every access validates the
//!  generation, so operating on a released end point is a rejected error
//!  rather than reaching into whatever now occupies the slot.

use std::fmt::{Debug, Formatter};

use tracing::debug;

use crate::error::{NetError, NetResult};
use crate::raw_end_point::RawEndPoint;
use crate::tcp_end_point::TcpEndPoint;
use crate::udp_end_point::UdpEndPoint;

#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub(crate) struct EndPointId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl Debug for EndPointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ep#{}@{}", self.slot, self.generation)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RawHandle(pub(crate) EndPointId);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UdpHandle(pub(crate) EndPointId);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TcpHandle(pub(crate) EndPointId);

pub(crate) enum EndPointKind {
    Raw(RawEndPoint),
    Udp(UdpEndPoint),
    Tcp(TcpEndPoint),
}

struct Slot {
    generation: u32,
    entry: Option<EndPointKind>,
}

pub(crate) struct EndPointPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    acquire_failures: u64,
}

impl EndPointPool {
    pub(crate) fn new(capacity: usize) -> EndPointPool {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                entry: None,
            })
            .collect();
        EndPointPool {
            slots,
            free: (0..capacity as u32).rev().collect(),
            acquire_failures: 0,
        }
    }

    /// Takes a free slot for `entry`. On exhaustion the entry is dropped
    ///  (closing any socket it carries) and the failure is counted.
    pub(crate) fn acquire(&mut self, entry: EndPointKind) -> NetResult<EndPointId> {
        let Some(slot_index) = self.free.pop() else {
            self.acquire_failures += 1;
            debug!("end point pool exhausted ({} slots)", self.slots.len());
            return Err(NetError::ResourceExhausted("end point slot"));
        };
        let slot = &mut self.slots[slot_index as usize];
        slot.entry = Some(entry);
        Ok(EndPointId {
            slot: slot_index,
            generation: slot.generation,
        })
    }

    /// Returns the slot to the pool, bumping the generation so existing
    ///  handles go stale. Returns the entry for the caller to drop.
    pub(crate) fn release(&mut self, id: EndPointId) -> Option<EndPointKind> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot);
        Some(entry)
    }

    pub(crate) fn get(&self, id: EndPointId) -> Option<&EndPointKind> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: EndPointId) -> Option<&mut EndPointKind> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub(crate) fn raw_mut(&mut self, id: EndPointId) -> Option<&mut RawEndPoint> {
        match self.get_mut(id) {
            Some(EndPointKind::Raw(ep)) => Some(ep),
            _ => None,
        }
    }

    pub(crate) fn udp(&self, id: EndPointId) -> Option<&UdpEndPoint> {
        match self.get(id) {
            Some(EndPointKind::Udp(ep)) => Some(ep),
            _ => None,
        }
    }

    pub(crate) fn udp_mut(&mut self, id: EndPointId) -> Option<&mut UdpEndPoint> {
        match self.get_mut(id) {
            Some(EndPointKind::Udp(ep)) => Some(ep),
            _ => None,
        }
    }

    pub(crate) fn raw(&self, id: EndPointId) -> Option<&RawEndPoint> {
        match self.get(id) {
            Some(EndPointKind::Raw(ep)) => Some(ep),
            _ => None,
        }
    }

    pub(crate) fn tcp(&self, id: EndPointId) -> Option<&TcpEndPoint> {
        match self.get(id) {
            Some(EndPointKind::Tcp(ep)) => Some(ep),
            _ => None,
        }
    }

    pub(crate) fn tcp_mut(&mut self, id: EndPointId) -> Option<&mut TcpEndPoint> {
        match self.get_mut(id) {
            Some(EndPointKind::Tcp(ep)) => Some(ep),
            _ => None,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (EndPointId, &EndPointKind)> {
        self.slots.iter().enumerate().filter_map(|(slot, s)| {
            s.entry.as_ref().map(|entry| {
                (
                    EndPointId {
                        slot: slot as u32,
                        generation: s.generation,
                    },
                    entry,
                )
            })
        })
    }

    pub(crate) fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn acquire_failures(&self) -> u64 {
        self.acquire_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::IpFamily;

    fn udp_entry() -> EndPointKind {
        EndPointKind::Udp(UdpEndPoint::new(IpFamily::V4))
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let mut pool = EndPointPool::new(2);
        let a = pool.acquire(udp_entry()).unwrap();
        let b = pool.acquire(udp_entry()).unwrap();
        assert_eq!(pool.in_use(), 2);

        assert!(matches!(
            pool.acquire(udp_entry()),
            Err(NetError::ResourceExhausted(_))
        ));
        assert_eq!(pool.acquire_failures(), 1);

        assert!(pool.release(a).is_some());
        let c = pool.acquire(udp_entry()).unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_ne!(c, a);

        assert!(pool.release(b).is_some());
        assert!(pool.release(c).is_some());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut pool = EndPointPool::new(1);
        let a = pool.acquire(udp_entry()).unwrap();
        assert!(pool.release(a).is_some());

        // the slot is reused with a new generation; the old handle stays dead
        let b = pool.acquire(udp_entry()).unwrap();
        assert_eq!(a.slot, b.slot);
        assert!(pool.get(a).is_none());
        assert!(pool.udp_mut(a).is_none());
        assert!(pool.release(a).is_none());
        assert!(pool.get(b).is_some());
    }

    #[test]
    fn test_kind_checked_access() {
        let mut pool = EndPointPool::new(2);
        let u = pool.acquire(udp_entry()).unwrap();
        let t = pool
            .acquire(EndPointKind::Tcp(TcpEndPoint::new()))
            .unwrap();

        assert!(pool.udp_mut(u).is_some());
        assert!(pool.tcp_mut(u).is_none());
        assert!(pool.tcp_mut(t).is_some());
        assert!(pool.raw_mut(t).is_none());
    }

    #[test]
    fn test_iter_lists_live_end_points() {
        let mut pool = EndPointPool::new(3);
        let a = pool.acquire(udp_entry()).unwrap();
        let b = pool.acquire(udp_entry()).unwrap();
        pool.release(a);

        let ids: Vec<EndPointId> = pool.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![b]);
    }
}
