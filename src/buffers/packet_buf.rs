//! The reference-counted byte container used for every send and receive.
//!
//! A `PacketBuf` is a shared handle: cloning it shares the same storage and
//!  chain position instead of copying bytes, and the storage is returned to
//!  its pool only when the last handle is dropped. Each buffer owns a
//!  contiguous region with a reserved head area for headers that lower layers
//!  prepend during encapsulation, and an optional link to the next buffer of
//!  a chain.

use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::io;
use std::rc::Rc;

use bytes::BytesMut;

use crate::buffers::buffer_pool::PoolState;
use crate::error::{NetError, NetResult};

pub(crate) struct PacketBufInner {
    /// fixed-capacity backing storage, eagerly zeroed - buffers are reused
    ///  aggressively, so the one-time initialization cost is irrelevant
    storage: BytesMut,
    /// offset of the first data byte; everything before it is reserved
    ///  headroom. Invariant: `start + len <= storage.len()`
    start: usize,
    len: usize,
    next: Option<PacketBuf>,
    pool: Option<Rc<RefCell<PoolState>>>,
}

impl Drop for PacketBufInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let storage = std::mem::take(&mut self.storage);
            pool.borrow_mut().return_storage(storage);
        }
    }
}

pub struct PacketBuf(Rc<RefCell<PacketBufInner>>);

/// Cloning shares the underlying storage (a reference count increment), it
///  does not copy bytes. Mutations through any handle are visible through all
///  of them.
impl Clone for PacketBuf {
    fn clone(&self) -> PacketBuf {
        PacketBuf(Rc::clone(&self.0))
    }
}

impl PacketBuf {
    pub(crate) fn from_parts(
        storage: BytesMut,
        reserved: usize,
        pool: Option<Rc<RefCell<PoolState>>>,
    ) -> PacketBuf {
        debug_assert!(reserved <= storage.len());
        PacketBuf(Rc::new(RefCell::new(PacketBufInner {
            storage,
            start: reserved,
            len: 0,
            next: None,
            pool,
        })))
    }

    /// Data bytes in this buffer, not counting the rest of the chain.
    pub fn data_len(&self) -> usize {
        self.0.borrow().len
    }

    /// Data bytes across the whole chain starting at this buffer.
    pub fn total_len(&self) -> usize {
        let mut total = 0;
        let mut cursor = Some(self.clone());
        while let Some(buf) = cursor {
            let inner = buf.0.borrow();
            total += inner.len;
            cursor = inner.next.clone();
        }
        total
    }

    pub fn capacity(&self) -> usize {
        self.0.borrow().storage.len()
    }

    /// Currently reserved headroom in front of the data.
    pub fn reserved(&self) -> usize {
        self.0.borrow().start
    }

    /// Number of handles currently sharing this buffer.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Drops `n` bytes from the head of this buffer's data, growing the
    ///  reserved headroom by the same amount. Only this buffer's own data is
    ///  affected, never the rest of the chain.
    pub fn consume_head(&self, n: usize) -> NetResult<()> {
        let mut inner = self.0.borrow_mut();
        if n > inner.len {
            return Err(NetError::InvalidArgument(
                "cannot consume past the available data",
            ));
        }
        inner.start += n;
        inner.len -= n;
        Ok(())
    }

    /// Writes `data` immediately in front of the current data, shrinking the
    ///  reserved headroom. This is how lower layers add their headers without
    ///  copying the payload.
    pub fn prepend(&self, data: &[u8]) -> NetResult<()> {
        let mut inner = self.0.borrow_mut();
        if data.len() > inner.start {
            return Err(NetError::InvalidArgument("insufficient reserved headroom"));
        }
        let new_start = inner.start - data.len();
        inner.storage[new_start..new_start + data.len()].copy_from_slice(data);
        inner.start = new_start;
        inner.len += data.len();
        Ok(())
    }

    /// Appends `data` after the current data.
    pub fn put_slice(&self, data: &[u8]) -> NetResult<()> {
        let mut inner = self.0.borrow_mut();
        let end = inner.start + inner.len;
        if end + data.len() > inner.storage.len() {
            return Err(NetError::InvalidArgument("buffer capacity exceeded"));
        }
        inner.storage[end..end + data.len()].copy_from_slice(data);
        inner.len += data.len();
        Ok(())
    }

    /// Links `next` to the end of the chain starting at this buffer.
    ///
    /// `next` must not already be part of this chain.
    pub fn append(&self, next: PacketBuf) {
        debug_assert!(
            !self.chain_contains(&next),
            "appending a buffer that is already part of the chain"
        );
        let last = self.last_segment();
        last.0.borrow_mut().next = Some(next);
    }

    /// Unlinks and returns the rest of the chain.
    pub fn take_next(&self) -> Option<PacketBuf> {
        self.0.borrow_mut().next.take()
    }

    pub fn next(&self) -> Option<PacketBuf> {
        self.0.borrow().next.clone()
    }

    /// Calls `f` with this buffer's data bytes (this segment only).
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.0.borrow();
        f(&inner.storage[inner.start..inner.start + inner.len])
    }

    /// Calls `f` with the chain's data as one contiguous slice. Copies only
    ///  when the chain has more than one segment.
    pub fn with_flat<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let chained = self.0.borrow().next.is_some();
        if chained {
            let flat = self.copy_to_vec();
            f(&flat)
        } else {
            self.with_data(f)
        }
    }

    /// Copies the whole chain's data into a fresh `Vec`.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        let mut cursor = Some(self.clone());
        while let Some(buf) = cursor {
            let inner = buf.0.borrow();
            out.extend_from_slice(&inner.storage[inner.start..inner.start + inner.len]);
            cursor = inner.next.clone();
        }
        out
    }

    /// Fills this buffer's data region from a receive operation: `f` gets the
    ///  writable region after the reserved headroom and reports how many bytes
    ///  it produced. Replaces any previous data.
    pub(crate) fn fill_with<T>(
        &self,
        f: impl FnOnce(&mut [u8]) -> io::Result<(usize, T)>,
    ) -> io::Result<T> {
        let mut inner = self.0.borrow_mut();
        let start = inner.start;
        let (n, extra) = f(&mut inner.storage[start..])?;
        debug_assert!(start + n <= inner.storage.len());
        inner.len = n;
        Ok(extra)
    }

    fn last_segment(&self) -> PacketBuf {
        let mut cursor = self.clone();
        loop {
            let next = cursor.0.borrow().next.clone();
            match next {
                Some(n) => cursor = n,
                None => return cursor,
            }
        }
    }

    fn chain_contains(&self, other: &PacketBuf) -> bool {
        let mut cursor = Some(self.clone());
        while let Some(buf) = cursor {
            if Rc::ptr_eq(&buf.0, &other.0) {
                return true;
            }
            cursor = buf.0.borrow().next.clone();
        }
        false
    }

    /// This is a convenience function for test code. It derives an unpooled
    ///  buffer from a slice, which is a shortcut not intended for production
    ///  usage.
    #[cfg(test)]
    pub(crate) fn from_slice(capacity: usize, reserved: usize, data: &[u8]) -> PacketBuf {
        let buf = PacketBuf::from_parts(BytesMut::zeroed(capacity), reserved, None);
        buf.put_slice(data).expect("test buffer too small");
        buf
    }
}

impl PartialEq for PacketBuf {
    fn eq(&self, other: &Self) -> bool {
        self.copy_to_vec() == other.copy_to_vec()
    }
}
impl Eq for PacketBuf {}

impl Debug for PacketBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.with_data(|data| write!(f, "PacketBuf({:?} + {} chained)", data, self.total_len() - data.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::nothing(0, 0, 5)]
    #[case::partial(2, 1, 2)]
    #[case::split(3, 2, 0)]
    #[case::all_at_once(5, 0, 0)]
    fn test_consume_head_composes(#[case] n: usize, #[case] m: usize, #[case] remaining: usize) {
        let composed = PacketBuf::from_slice(64, 8, b"hello");
        composed.consume_head(n + m).unwrap();

        let stepped = PacketBuf::from_slice(64, 8, b"hello");
        stepped.consume_head(n).unwrap();
        stepped.consume_head(m).unwrap();

        assert_eq!(stepped.data_len(), remaining);
        assert_eq!(stepped, composed);
        assert_eq!(stepped.reserved(), 8 + n + m);
    }

    #[rstest]
    #[case::one_past(6)]
    #[case::far_past(600)]
    fn test_consume_head_past_data_fails(#[case] n: usize) {
        let buf = PacketBuf::from_slice(64, 8, b"hello");
        assert!(matches!(
            buf.consume_head(n),
            Err(NetError::InvalidArgument(_))
        ));
        // the failed call must not have touched the buffer
        assert_eq!(buf.data_len(), 5);
        assert_eq!(buf.reserved(), 8);
    }

    #[test]
    fn test_ipv4_header_strip() {
        // a raw IPv4 receive delivers the 20 byte header in front of the payload
        let header = [0x45u8; 20];
        let payload: Vec<u8> = (0..59).collect();
        let buf = PacketBuf::from_slice(256, 0, &header);
        buf.put_slice(&payload).unwrap();
        let original_total = buf.total_len();

        buf.consume_head(20).unwrap();

        assert_eq!(buf.total_len(), original_total - 20);
        buf.with_data(|d| assert_eq!(d, &payload[..]));
    }

    #[test]
    fn test_prepend_uses_headroom() {
        let buf = PacketBuf::from_slice(64, 8, b"payload");
        buf.prepend(b"hdr").unwrap();
        assert_eq!(buf.reserved(), 5);
        buf.with_data(|d| assert_eq!(d, b"hdrpayload"));

        assert!(matches!(
            buf.prepend(b"far too long for the headroom"),
            Err(NetError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_put_slice_respects_capacity() {
        let buf = PacketBuf::from_slice(8, 2, b"abc");
        buf.put_slice(b"def").unwrap();
        assert!(matches!(
            buf.put_slice(b"g"),
            Err(NetError::InvalidArgument(_))
        ));
        buf.with_data(|d| assert_eq!(d, b"abcdef"));
    }

    #[test]
    fn test_chain_lengths() {
        let head = PacketBuf::from_slice(64, 0, b"one");
        let mid = PacketBuf::from_slice(64, 0, b"twoo");
        let tail = PacketBuf::from_slice(64, 0, b"three");
        head.append(mid);
        head.append(tail);

        assert_eq!(head.data_len(), 3);
        assert_eq!(head.total_len(), 3 + 4 + 5);
        assert_eq!(head.copy_to_vec(), b"onetwoothree");

        let rest = head.take_next().unwrap();
        assert_eq!(head.total_len(), 3);
        assert_eq!(rest.copy_to_vec(), b"twoothree");
    }

    #[test]
    fn test_clone_shares_storage() {
        let buf = PacketBuf::from_slice(64, 4, b"shared");
        let other = buf.clone();
        assert_eq!(buf.ref_count(), 2);

        other.consume_head(2).unwrap();
        assert_eq!(buf.data_len(), 4);
        buf.with_data(|d| assert_eq!(d, b"ared"));

        drop(other);
        assert_eq!(buf.ref_count(), 1);
    }

    #[test]
    fn test_fill_with_replaces_data() {
        let buf = PacketBuf::from_slice(16, 4, b"old");
        let extra = buf
            .fill_with(|space| {
                assert_eq!(space.len(), 12);
                space[..5].copy_from_slice(b"fresh");
                Ok((5, 42))
            })
            .unwrap();
        assert_eq!(extra, 42);
        buf.with_data(|d| assert_eq!(d, b"fresh"));
    }

    #[test]
    fn test_with_flat_spans_chain() {
        let head = PacketBuf::from_slice(8, 0, b"ab");
        head.append(PacketBuf::from_slice(8, 0, b"cd"));
        head.with_flat(|d| assert_eq!(d, b"abcd"));
    }
}
