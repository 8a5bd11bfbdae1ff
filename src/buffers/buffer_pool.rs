//! Pooled allocation for [`PacketBuf`] storage.
//!
//! Freed storage goes back onto a free list for reuse; the pool also enforces
//!  the configured bound on simultaneously live buffers, which is what turns
//!  buffer starvation into a reportable `ResourceExhausted` instead of
//!  unbounded allocation.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::buffers::packet_buf::PacketBuf;
use crate::config::NetConfig;
use crate::error::{NetError, NetResult};

pub(crate) struct PoolState {
    free: Vec<BytesMut>,
    in_flight: usize,
    buf_capacity: usize,
    retain: usize,
}

impl PoolState {
    pub(crate) fn return_storage(&mut self, storage: BytesMut) {
        self.in_flight -= 1;
        if storage.len() == self.buf_capacity && self.free.len() < self.retain {
            trace!("returning buffer storage to pool");
            self.free.push(storage);
        } else {
            debug!("discarding returned buffer storage");
        }
    }
}

pub struct BufferPool {
    state: Rc<RefCell<PoolState>>,
    max_in_flight: usize,
    buf_capacity: usize,
}

impl BufferPool {
    pub(crate) fn new(config: &NetConfig) -> BufferPool {
        BufferPool {
            state: Rc::new(RefCell::new(PoolState {
                free: Vec::with_capacity(config.buffer_pool_retain),
                in_flight: 0,
                buf_capacity: config.buffer_capacity,
                retain: config.buffer_pool_retain,
            })),
            max_in_flight: config.max_buffers_in_flight,
            buf_capacity: config.buffer_capacity,
        }
    }

    /// Allocates a standard-capacity buffer with `reserved` bytes of headroom.
    pub fn allocate(&self, reserved: usize) -> NetResult<PacketBuf> {
        self.allocate_sized(self.buf_capacity, reserved)
    }

    /// Allocates a buffer with an explicit capacity. Non-standard capacities
    ///  are served from the heap and not re-pooled on release.
    pub fn allocate_sized(&self, capacity: usize, reserved: usize) -> NetResult<PacketBuf> {
        if reserved > capacity {
            return Err(NetError::InvalidArgument(
                "reserved headroom exceeds buffer capacity",
            ));
        }
        let mut state = self.state.borrow_mut();
        if state.in_flight >= self.max_in_flight {
            return Err(NetError::ResourceExhausted("packet buffer"));
        }
        let storage = if capacity == state.buf_capacity {
            match state.free.pop() {
                Some(storage) => {
                    trace!("serving buffer from pool");
                    storage
                }
                None => {
                    debug!("no free buffer in pool: allocating");
                    BytesMut::zeroed(capacity)
                }
            }
        } else {
            BytesMut::zeroed(capacity)
        };
        state.in_flight += 1;
        drop(state);
        Ok(PacketBuf::from_parts(storage, reserved, Some(Rc::clone(&self.state))))
    }

    /// Buffers currently held alive by some owner.
    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_in_flight: usize) -> BufferPool {
        BufferPool::new(&NetConfig {
            buffer_capacity: 256,
            buffer_pool_retain: 4,
            max_buffers_in_flight: max_in_flight,
            ..NetConfig::default()
        })
    }

    #[test]
    fn test_release_returns_storage() {
        let pool = small_pool(16);
        let buf = pool.allocate(8).unwrap();
        assert_eq!(buf.capacity(), 256);
        assert_eq!(buf.reserved(), 8);
        assert_eq!(pool.in_flight(), 1);

        let clone = buf.clone();
        drop(buf);
        // still alive through the second handle
        assert_eq!(pool.in_flight(), 1);

        drop(clone);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_in_flight_cap() {
        let pool = small_pool(2);
        let a = pool.allocate(0).unwrap();
        let _b = pool.allocate(0).unwrap();
        assert!(matches!(
            pool.allocate(0),
            Err(NetError::ResourceExhausted(_))
        ));

        drop(a);
        assert!(pool.allocate(0).is_ok());
    }

    #[test]
    fn test_oversized_allocation_is_counted() {
        let pool = small_pool(4);
        let big = pool.allocate_sized(4096, 0).unwrap();
        assert_eq!(big.capacity(), 4096);
        assert_eq!(pool.in_flight(), 1);
        drop(big);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_reserved_beyond_capacity_rejected() {
        let pool = small_pool(4);
        assert!(matches!(
            pool.allocate_sized(64, 65),
            Err(NetError::InvalidArgument(_))
        ));
        assert_eq!(pool.in_flight(), 0);
    }
}
